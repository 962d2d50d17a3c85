use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use log::{debug, info};

use super::command::StorageCommand;
use super::context::StorageContext;
use super::handle::StorageHandle;

/// The single background sequence. Owns the context; every command, periodic
/// commit and scavenger step runs here, one at a time.
pub struct StorageWorker {
    context: StorageContext,
    cmd_rx: mpsc::Receiver<StorageCommand>,
    scavenge_at: Option<Instant>,
    scavenge_requested: bool,
}

impl StorageWorker {
    /// Moves `context` onto a new task and returns the handle that talks to it.
    ///
    /// Must be called from within a tokio runtime. The task ends (after
    /// shutting the context down) once every handle has been dropped.
    pub fn spawn(context: StorageContext) -> (StorageHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(context.config().channel_capacity);
        let handle = StorageHandle::new(cmd_tx, context.allocator());
        let worker = Self {
            context,
            cmd_rx,
            scavenge_at: None,
            scavenge_requested: false,
        };
        (handle, tokio::spawn(worker.run()))
    }

    pub async fn run(mut self) {
        let mut ticker = time::interval(self.context.config().commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let scavenge_at = self.scavenge_at;
            let scavenging = self.context.has_pending_scavenge_work();

            tokio::select! {
                biased;

                msg = self.cmd_rx.recv() => {
                    let Some(cmd) = msg else {
                        break; // every handle dropped
                    };
                    self.handle_command(cmd);
                }
                _ = ticker.tick() => {
                    self.context.flush();
                }
                _ = time::sleep_until(scavenge_at.unwrap_or_else(Instant::now)), if scavenge_at.is_some() => {
                    self.scavenge_at = None;
                    self.context.start_scavenging_unused_session_storage();
                }
                // One scavenger step per turn, and only when nothing else is ready.
                _ = std::future::ready(()), if scavenging => {
                    self.context.scavenge_step();
                    tokio::task::yield_now().await;
                }
            }
        }

        self.context.shutdown();
        debug!("storage worker stopped");
    }

    fn handle_command(&mut self, cmd: StorageCommand) {
        let ctx = &mut self.context;
        // A dropped reply receiver just means the caller stopped waiting.
        match cmd {
            StorageCommand::CreateSessionNamespace { id, persistent_id, reply } => {
                let _ = reply.send(ctx.create_session_namespace(id, &persistent_id));
            }
            StorageCommand::CloneSessionNamespace { existing_id, new_id, new_persistent_id, reply } => {
                let _ = reply.send(ctx.clone_session_namespace(existing_id, new_id, &new_persistent_id));
            }
            StorageCommand::DeleteSessionNamespace { id, should_persist_data, reply } => {
                let _ = reply.send(ctx.delete_session_namespace(id, should_persist_data));
            }

            StorageCommand::Length { namespace_id, origin, reply } => {
                let _ = reply.send(ctx.area_mut(namespace_id, &origin).map(|area| area.length()));
            }
            StorageCommand::Key { namespace_id, origin, index, reply } => {
                let _ = reply.send(ctx.area_mut(namespace_id, &origin).map(|area| area.key(index)));
            }
            StorageCommand::GetItem { namespace_id, origin, key, reply } => {
                let _ = reply.send(ctx.area_mut(namespace_id, &origin).map(|area| area.get_item(&key)));
            }
            StorageCommand::SetItem { namespace_id, origin, key, value, page_url, reply } => {
                let result = ctx
                    .area_mut(namespace_id, &origin)
                    .and_then(|area| area.set_item(&key, &value, &page_url));
                let _ = reply.send(result);
            }
            StorageCommand::RemoveItem { namespace_id, origin, key, page_url, reply } => {
                let result = ctx
                    .area_mut(namespace_id, &origin)
                    .and_then(|area| area.remove_item(&key, &page_url));
                let _ = reply.send(result);
            }
            StorageCommand::Clear { namespace_id, origin, page_url, reply } => {
                let result = ctx.area_mut(namespace_id, &origin).and_then(|area| area.clear(&page_url));
                let _ = reply.send(result);
            }
            StorageCommand::Snapshot { namespace_id, origin, reply } => {
                let _ = reply.send(ctx.area_mut(namespace_id, &origin).map(|area| area.snapshot()));
            }

            StorageCommand::AddObserver { observer, reply } => {
                let _ = reply.send(ctx.add_event_observer(observer));
            }
            StorageCommand::RemoveObserver { id, reply } => {
                let _ = reply.send(ctx.remove_event_observer(id));
            }

            StorageCommand::LocalStorageUsage { include_last_modified, reply } => {
                let _ = reply.send(ctx.local_storage_usage(include_last_modified));
            }
            StorageCommand::SessionStorageUsage { reply } => {
                let _ = reply.send(ctx.session_storage_usage());
            }
            StorageCommand::DeleteLocalStorage { origin, reply } => {
                let _ = reply.send(ctx.delete_local_storage(&origin));
            }
            StorageCommand::DeleteSessionStorage { usage, reply } => {
                let _ = reply.send(ctx.delete_session_storage(&usage));
            }

            StorageCommand::SetForceKeepSessionState => ctx.set_force_keep_session_state(),
            StorageCommand::SetSaveSessionStorageOnDisk { reply } => {
                let _ = reply.send(ctx.set_save_session_storage_on_disk());
            }
            StorageCommand::ProtectPersistentSessionId { persistent_id } => {
                ctx.protect_persistent_session_id(&persistent_id);
            }
            StorageCommand::StartScavengingUnusedSessionStorage => {
                if !self.scavenge_requested {
                    self.scavenge_requested = true;
                    let delay = ctx.config().scavenge_delay;
                    self.scavenge_at = Some(Instant::now() + delay);
                    debug!("scavenging scheduled in {delay:?}");
                }
            }
            StorageCommand::Flush => ctx.flush(),
            StorageCommand::PurgeMemory => ctx.purge_memory(),
            StorageCommand::MemoryUsage { reply } => {
                let _ = reply.send(ctx.memory_usage());
            }
            StorageCommand::Shutdown { reply } => {
                info!("storage worker received shutdown");
                ctx.shutdown();
                self.scavenge_at = None;
                let _ = reply.send(());
            }
        }
    }
}
