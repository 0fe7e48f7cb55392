//! Change events emitted by the watcher

use codeweave_core::ChangeKind;
use std::time::Instant;

/// A debounced change to one file of a watched repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryEvent {
    pub repository_id: String,
    /// Path relative to the repository root, `/`-separated
    pub relative_path: String,
    pub change: ChangeKind,
}

impl RepositoryEvent {
    pub fn new(repository_id: impl Into<String>, relative_path: impl Into<String>, change: ChangeKind) -> Self {
        Self {
            repository_id: repository_id.into(),
            relative_path: relative_path.into(),
            change,
        }
    }
}

/// Change accumulated for a path during its debounce window
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub change: ChangeKind,
    pub first_seen: Instant,
    pub occurrences: u32,
}

impl PendingChange {
    pub fn new(change: ChangeKind) -> Self {
        Self {
            change,
            first_seen: Instant::now(),
            occurrences: 1,
        }
    }

    /// Fold a later change into this one
    ///
    /// The latest change wins, except that a file created and then written in
    /// the same window is still reported as created.
    pub fn update(&mut self, change: ChangeKind) {
        if !(self.change == ChangeKind::Create && change == ChangeKind::Update) {
            self.change = change;
        }
        self.occurrences += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_modify_stays_create() {
        let mut pending = PendingChange::new(ChangeKind::Create);
        pending.update(ChangeKind::Update);
        pending.update(ChangeKind::Update);
        assert_eq!(pending.change, ChangeKind::Create);
        assert_eq!(pending.occurrences, 3);
    }

    #[test]
    fn test_latest_change_wins() {
        let mut pending = PendingChange::new(ChangeKind::Update);
        pending.update(ChangeKind::Delete);
        assert_eq!(pending.change, ChangeKind::Delete);

        let mut pending = PendingChange::new(ChangeKind::Create);
        pending.update(ChangeKind::Delete);
        assert_eq!(pending.change, ChangeKind::Delete);
    }
}
