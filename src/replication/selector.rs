//! Backup Selector
//!
//! Chooses the backup for the next replica of a segment:
//! - never a backup in the caller's exclusion set
//! - preferably one not yet handed out during the current pass
//! - otherwise rotating across backups in id order
//!
//! Membership is re-read from the coordinator on every selection, so a
//! view that shrinks between calls is tolerated. Selection is
//! deterministic.

use std::collections::HashSet;

use super::errors::{ReplicationError, ReplicationResult};
use super::identity::ServerId;
use super::transport::ClusterMembership;

/// Chooses backups for new replicas
pub struct BackupSelector {
    membership: Option<Box<dyn ClusterMembership>>,
    /// Latest live view, sorted and deduplicated
    live: Vec<ServerId>,
    /// Backups already handed out during the current pass
    handed_out: HashSet<ServerId>,
    /// Most recently chosen backup, for rotation
    last_chosen: Option<ServerId>,
}

impl BackupSelector {
    /// Create a selector. Without a coordinator no backup is ever eligible.
    pub fn new(membership: Option<Box<dyn ClusterMembership>>) -> Self {
        let mut selector = Self {
            membership,
            live: Vec::new(),
            handed_out: HashSet::new(),
            last_chosen: None,
        };
        selector.refresh();
        selector
    }

    /// Re-read membership from the coordinator.
    pub fn refresh(&mut self) -> &[ServerId] {
        let mut live = match &self.membership {
            Some(membership) => membership.live_backups(),
            None => Vec::new(),
        };
        live.sort_unstable();
        live.dedup();
        self.live = live;
        &self.live
    }

    /// Start a new scheduler pass: refresh the view and forget which
    /// backups were handed out during the previous pass.
    pub fn begin_pass(&mut self) {
        self.refresh();
        self.handed_out.clear();
    }

    /// Latest live view, in id order
    pub fn live_backups(&self) -> &[ServerId] {
        &self.live
    }

    /// True if `backup` is in the latest live view
    pub fn is_live(&self, backup: ServerId) -> bool {
        self.live.binary_search(&backup).is_ok()
    }

    /// Choose a backup not contained in `excluding`.
    pub fn select(&mut self, excluding: &[ServerId]) -> ReplicationResult<ServerId> {
        self.refresh();

        let eligible: Vec<ServerId> = self
            .live
            .iter()
            .copied()
            .filter(|b| !excluding.contains(b))
            .collect();
        if eligible.is_empty() {
            return Err(ReplicationError::no_backups_available(format!(
                "{} live backups, {} excluded",
                self.live.len(),
                excluding.len()
            )));
        }

        let fresh: Vec<ServerId> = eligible
            .iter()
            .copied()
            .filter(|b| !self.handed_out.contains(b))
            .collect();
        let candidates = if fresh.is_empty() { &eligible } else { &fresh };

        // Candidates are in id order; take the first past the last choice.
        let choice = match self.last_chosen {
            Some(last) => candidates
                .iter()
                .copied()
                .find(|b| *b > last)
                .unwrap_or(candidates[0]),
            None => candidates[0],
        };

        self.last_chosen = Some(choice);
        self.handed_out.insert(choice);
        Ok(choice)
    }
}

impl std::fmt::Debug for BackupSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSelector")
            .field("has_coordinator", &self.membership.is_some())
            .field("live", &self.live)
            .field("handed_out", &self.handed_out.len())
            .field("last_chosen", &self.last_chosen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedView(Rc<RefCell<Vec<ServerId>>>);

    impl SharedView {
        fn of(ids: &[u64]) -> Self {
            Self(Rc::new(RefCell::new(ids.iter().map(|i| ServerId(*i)).collect())))
        }
        fn set(&self, ids: &[u64]) {
            *self.0.borrow_mut() = ids.iter().map(|i| ServerId(*i)).collect();
        }
    }

    impl ClusterMembership for SharedView {
        fn live_backups(&self) -> Vec<ServerId> {
            self.0.borrow().clone()
        }
    }

    fn selector(view: &SharedView) -> BackupSelector {
        BackupSelector::new(Some(Box::new(view.clone())))
    }

    #[test]
    fn test_no_coordinator_has_no_backups() {
        let mut s = BackupSelector::new(None);
        let err = s.select(&[]).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NoBackupsAvailable);
    }

    #[test]
    fn test_never_returns_excluded() {
        let view = SharedView::of(&[1, 2, 3]);
        let mut s = selector(&view);
        for _ in 0..10 {
            let chosen = s.select(&[ServerId(1), ServerId(3)]).unwrap();
            assert_eq!(chosen, ServerId(2));
        }
    }

    #[test]
    fn test_exhausted_when_all_excluded() {
        let view = SharedView::of(&[1, 2]);
        let mut s = selector(&view);
        assert!(s.select(&[ServerId(1), ServerId(2)]).is_err());
    }

    #[test]
    fn test_spreads_within_a_pass() {
        let view = SharedView::of(&[1, 2, 3]);
        let mut s = selector(&view);
        s.begin_pass();

        // Three independent segments each ask for one backup.
        let picks: Vec<ServerId> = (0..3).map(|_| s.select(&[]).unwrap()).collect();
        assert_eq!(picks, vec![ServerId(1), ServerId(2), ServerId(3)]);
    }

    #[test]
    fn test_rotation_continues_across_passes() {
        let view = SharedView::of(&[1, 2, 3]);
        let mut s = selector(&view);
        s.begin_pass();
        assert_eq!(s.select(&[]).unwrap(), ServerId(1));
        s.begin_pass();
        assert_eq!(s.select(&[]).unwrap(), ServerId(2));
    }

    #[test]
    fn test_reuses_when_every_backup_was_handed_out() {
        let view = SharedView::of(&[1, 2]);
        let mut s = selector(&view);
        s.begin_pass();
        s.select(&[]).unwrap();
        s.select(&[]).unwrap();
        // Still succeeds: balance is a preference, not a requirement.
        assert!(s.select(&[]).is_ok());
    }

    #[test]
    fn test_tolerates_shrinking_view() {
        let view = SharedView::of(&[1, 2, 3]);
        let mut s = selector(&view);
        assert!(s.is_live(ServerId(2)));

        view.set(&[1, 3]);
        let chosen = s.select(&[ServerId(1)]).unwrap();
        assert_eq!(chosen, ServerId(3));
        assert!(!s.is_live(ServerId(2)));
    }

    #[test]
    fn test_duplicate_membership_entries_collapse() {
        let view = SharedView::of(&[2, 2, 1]);
        let s = selector(&view);
        assert_eq!(s.live_backups(), &[ServerId(1), ServerId(2)]);
    }
}
