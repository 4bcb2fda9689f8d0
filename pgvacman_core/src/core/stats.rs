use parking_lot::Mutex;

use crate::core::applier::TableOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub tables_matched: usize,
    pub tables_applied: usize,
    pub tables_locked: usize,
    pub tables_skipped: usize,
    pub parameters_attempted: usize,
    pub parameters_applied: usize,
    pub parameters_failed: usize,
}

impl RunStats {
    /// Tables that ended the run without their changes.
    #[inline]
    pub fn tables_unlocked(&self) -> usize {
        self.tables_locked + self.tables_skipped
    }
}

/// Shared by all workers for one run.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    stats: Mutex<RunStats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_matched(&self, tables: usize) {
        self.stats.lock().tables_matched += tables;
    }

    pub fn record_applied(&self, outcome: &TableOutcome) {
        let applied = outcome.applied();
        let mut stats = self.stats.lock();
        stats.tables_applied += 1;
        stats.parameters_attempted += outcome.parameters.len();
        stats.parameters_applied += applied;
        stats.parameters_failed += outcome.parameters.len() - applied;
    }

    /// A table whose bounded wait ran out, or whose lock phase failed for good.
    pub fn record_locked(&self) {
        self.stats.lock().tables_locked += 1;
    }

    /// A table given up after the nowait attempt under `--skip-locked`.
    pub fn record_skipped(&self) {
        self.stats.lock().tables_skipped += 1;
    }

    pub fn snapshot(&self) -> RunStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        core::{
            applier::{LockMode, ParameterOutcome},
            catalog::RelationKind,
        },
        error::DbError,
    };

    fn outcome(failures: usize, successes: usize) -> TableOutcome {
        let parameter = |i: usize, error: Option<DbError>| ParameterOutcome {
            parameter: format!("p{}", i),
            old: None,
            new: Some("1".to_string()),
            error,
        };

        TableOutcome {
            relation: "\"public\".\"t\"".to_string(),
            kind: RelationKind::Table,
            row_estimate: 1,
            lock_mode: LockMode::ShareUpdateExclusive,
            parameters: (0..failures)
                .map(|i| parameter(i, Some(DbError::new(None, "bad"))))
                .chain((0..successes).map(|i| parameter(failures + i, None)))
                .collect(),
        }
    }

    #[test]
    fn test_counts() {
        let stats = StatsAggregator::new();
        stats.record_matched(4);
        stats.record_applied(&outcome(1, 2));
        stats.record_applied(&outcome(0, 1));
        stats.record_locked();
        stats.record_skipped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tables_matched, 4);
        assert_eq!(snapshot.tables_applied, 2);
        assert_eq!(snapshot.tables_unlocked(), 2);
        assert_eq!(snapshot.parameters_attempted, 4);
        assert_eq!(snapshot.parameters_applied, 3);
        assert_eq!(snapshot.parameters_failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates() {
        let stats = Arc::new(StatsAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        stats.record_applied(&outcome(0, 1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stats.snapshot().tables_applied, 800);
        assert_eq!(stats.snapshot().parameters_applied, 800);
    }
}
