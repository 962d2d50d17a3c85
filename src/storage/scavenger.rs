//! Gradual reclamation of persisted session namespaces nothing refers to anymore.
//!
//! The scavenger is a plain state machine advanced one step at a time by the
//! background sequence:
//!
//! ```text
//! Idle -> Collecting -> Diffing -> DeletingNext -> ... -> Idle
//! ```
//!
//! - **Collecting** snapshots the persistent ids in use: live namespaces plus
//!   the protected set (namespaces kept for session restore).
//! - **Diffing** asks the store for every persisted id and keeps the ones not
//!   in use and not retained by the [`SessionRetentionPolicy`](super::policy::SessionRetentionPolicy).
//! - **DeletingNext** deletes one id per step, so a long scavenge never holds
//!   the sequence for more than one store call.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::backing::SessionStorageDatabase;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScavengePhase {
    Idle,
    Collecting,
    Diffing,
    DeletingNext,
}

#[derive(Debug)]
pub struct Scavenger {
    phase: ScavengePhase,
    started: bool,
    in_use: HashSet<String>,
    deletable: Vec<String>,
    protected: HashSet<String>,
}

impl Default for Scavenger {
    fn default() -> Self {
        Self::new()
    }
}

impl Scavenger {
    pub fn new() -> Self {
        Self {
            phase: ScavengePhase::Idle,
            started: false,
            in_use: HashSet::new(),
            deletable: Vec::new(),
            protected: HashSet::new(),
        }
    }

    pub fn phase(&self) -> ScavengePhase {
        self.phase
    }

    /// Scavenging runs at most once per context.
    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn has_work(&self) -> bool {
        self.phase != ScavengePhase::Idle
    }

    pub fn protected_ids(&self) -> &HashSet<String> {
        &self.protected
    }

    pub fn protect(&mut self, persistent_id: &str) {
        self.protected.insert(persistent_id.to_string());
    }

    /// Ids found deletable and not yet deleted.
    pub fn deletable_ids(&self) -> &[String] {
        &self.deletable
    }

    /// Returns `false` if scavenging already ran (or is running).
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.phase = ScavengePhase::Collecting;
        true
    }

    /// Advances by one unit of work and returns the phase reached.
    ///
    /// `live` holds the persistent ids of the namespaces alive right now;
    /// `retained` is the retention predicate.
    pub fn step(
        &mut self,
        live: &HashSet<String>,
        db: &dyn SessionStorageDatabase,
        retained: &dyn Fn(&str) -> bool,
    ) -> ScavengePhase {
        match self.phase {
            ScavengePhase::Idle => {}
            ScavengePhase::Collecting => {
                self.in_use = live.union(&self.protected).cloned().collect();
                self.phase = ScavengePhase::Diffing;
            }
            ScavengePhase::Diffing => {
                let in_use = std::mem::take(&mut self.in_use);
                match db.read_namespace_ids() {
                    Ok(persisted) => {
                        self.deletable = persisted
                            .into_iter()
                            .filter(|id| !in_use.contains(id) && !retained(id))
                            .collect();
                        info!("scavenger found {} unused session namespace(s)", self.deletable.len());
                    }
                    Err(e) => warn!("scavenger cannot list session namespaces: {e:#}"),
                }
                self.phase = if self.deletable.is_empty() {
                    ScavengePhase::Idle
                } else {
                    ScavengePhase::DeletingNext
                };
            }
            ScavengePhase::DeletingNext => {
                if let Some(persistent_id) = self.deletable.pop() {
                    if live.contains(&persistent_id) || self.protected.contains(&persistent_id) {
                        debug!("scavenger skips {persistent_id}, in use again");
                    } else {
                        delete_namespace(db, &persistent_id);
                    }
                }
                if self.deletable.is_empty() {
                    self.phase = ScavengePhase::Idle;
                }
            }
        }
        self.phase
    }

    /// Abandons a scavenge in progress. Used at shutdown; leftovers are found next time.
    pub fn finish(&mut self) {
        if !self.deletable.is_empty() {
            debug!("scavenger abandons {} pending deletion(s)", self.deletable.len());
        }
        self.deletable.clear();
        self.in_use.clear();
        self.phase = ScavengePhase::Idle;
    }
}

fn delete_namespace(db: &dyn SessionStorageDatabase, persistent_id: &str) {
    match db.delete_namespace(persistent_id) {
        Ok(()) => debug!("deleted session namespace {persistent_id}"),
        // Left on disk; the next scavenge will find it again.
        Err(e) => warn!("failed to delete session namespace {persistent_id}: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backing::CommitBatch;
    use crate::storage::session::in_memory::InMemorySessionStorageDatabase;

    fn db_with(ids: &[&str]) -> InMemorySessionStorageDatabase {
        let db = InMemorySessionStorageDatabase::new();
        for id in ids {
            db.commit_area(id, "https://a.test", &CommitBatch::default()).unwrap();
        }
        db
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn keep_nothing(_: &str) -> bool {
        false
    }

    #[test]
    fn deletes_exactly_unused_unprotected_ids() {
        let db = db_with(&["A", "B", "C"]);
        let live = set(&["B"]);
        let mut scavenger = Scavenger::new();
        scavenger.protect("C");

        assert!(scavenger.start());
        assert_eq!(scavenger.phase(), ScavengePhase::Collecting);
        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::Diffing);
        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::DeletingNext);
        assert_eq!(scavenger.deletable_ids(), ["A".to_string()]);
        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::Idle);

        assert_eq!(db.read_namespace_ids().unwrap(), vec!["B", "C"]);
        assert!(!scavenger.has_work());
    }

    #[test]
    fn one_deletion_per_step() {
        let db = db_with(&["A", "B", "C"]);
        let live = HashSet::new();
        let mut scavenger = Scavenger::new();
        scavenger.start();
        scavenger.step(&live, &db, &keep_nothing);
        scavenger.step(&live, &db, &keep_nothing);

        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::DeletingNext);
        assert_eq!(db.read_namespace_ids().unwrap().len(), 2);
        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::DeletingNext);
        assert_eq!(scavenger.step(&live, &db, &keep_nothing), ScavengePhase::Idle);
        assert!(db.read_namespace_ids().unwrap().is_empty());
    }

    #[test]
    fn start_is_one_shot() {
        let db = db_with(&[]);
        let mut scavenger = Scavenger::new();
        assert!(scavenger.start());
        assert!(!scavenger.start());
        scavenger.step(&HashSet::new(), &db, &keep_nothing);
        assert_eq!(scavenger.step(&HashSet::new(), &db, &keep_nothing), ScavengePhase::Idle);
        assert!(scavenger.has_started());
    }

    #[test]
    fn retention_predicate_spares_ids() {
        let db = db_with(&["A", "keep-me"]);
        let mut scavenger = Scavenger::new();
        scavenger.start();
        let retain = |id: &str| id.starts_with("keep");
        while {
            scavenger.step(&HashSet::new(), &db, &retain);
            scavenger.has_work()
        } {}
        assert_eq!(db.read_namespace_ids().unwrap(), vec!["keep-me"]);
    }

    #[test]
    fn ids_revived_after_diffing_are_spared() {
        let db = db_with(&["A"]);
        let mut scavenger = Scavenger::new();
        scavenger.start();
        scavenger.step(&HashSet::new(), &db, &keep_nothing);
        scavenger.step(&HashSet::new(), &db, &keep_nothing);

        // "A" restored before its deletion turn
        scavenger.step(&set(&["A"]), &db, &keep_nothing);
        assert_eq!(db.read_namespace_ids().unwrap(), vec!["A"]);
    }

    #[test]
    fn finish_abandons_pending_deletions() {
        let db = db_with(&["X", "Y"]);
        let mut scavenger = Scavenger::new();
        scavenger.start();
        scavenger.step(&HashSet::new(), &db, &keep_nothing);
        scavenger.step(&HashSet::new(), &db, &keep_nothing);
        assert_eq!(scavenger.deletable_ids().len(), 2);

        scavenger.finish();
        assert!(!scavenger.has_work());
        assert!(scavenger.deletable_ids().is_empty());
        assert_eq!(db.read_namespace_ids().unwrap(), vec!["X", "Y"]);
        // still one-shot
        assert!(!scavenger.start());
    }
}
