//! Optimistic-concurrency transaction runner.
//!
//! Mutations are expressed as proposers: given the current known state and
//! an attempt number, a proposer returns either a conditional write or a
//! no-op signal. The runner owns the retry loop; when a write is rejected
//! because another writer got there first, it asks the proposer again.
//!
//! Contract: on every attempt after the first, a proposer must refresh its
//! cached view of the document from the store before recomputing the
//! operation. The runner cannot do this on its behalf, since it does not
//! know which aggregate the proposer is working from.

use log::{debug, warn};

use crate::errors::GenerationError;
use crate::store::op::Operation;
use crate::store::BranchStore;

/// Outcome of one proposal round.
pub enum Proposal {
    /// Current state already satisfies the caller's intent; succeed without
    /// touching the store.
    NoOp,
    /// Submit this conditional write.
    Write(Operation),
}

/// A mutation expressed as a function of (current state, attempt number).
#[allow(async_fn_in_trait)]
pub trait Propose<S> {
    async fn propose(&mut self, store: &S, attempt: u32) -> Result<Proposal, GenerationError>;
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

pub struct TransactionRunner {
    max_attempts: u32,
}

impl Default for TransactionRunner {
    fn default() -> Self {
        TransactionRunner::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl TransactionRunner {
    pub fn new(max_attempts: u32) -> Self {
        TransactionRunner {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs the proposer to completion. Conflicts are absorbed and retried;
    /// every other error aborts the run and is propagated unchanged. When
    /// the attempt budget is exhausted the caller sees `RetryExhausted`,
    /// which is safe to retry at a higher level.
    pub async fn run<S, P>(&self, store: &S, proposer: &mut P) -> Result<(), GenerationError>
    where
        S: BranchStore,
        P: Propose<S>,
    {
        let mut last_conflict = String::new();

        for attempt in 0..self.max_attempts {
            let op = match proposer.propose(store, attempt).await? {
                Proposal::NoOp => return Ok(()),
                Proposal::Write(op) => op,
            };

            match store.apply(&op).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    debug!("attempt {}: {}; retrying", attempt, err);
                    last_conflict = op.describe();
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            "giving up on {:?} after {} conflicting attempts",
            last_conflict, self.max_attempts
        );
        Err(GenerationError::RetryExhausted(last_conflict))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::models::branch::BranchDoc;
    use crate::store::memory::MemoryStore;
    use crate::store::op::{Condition, DocUpdate, Operation};

    struct CountingProposer<F> {
        calls: u32,
        f: F,
    }

    impl<S, F> Propose<S> for CountingProposer<F>
    where
        F: FnMut(u32) -> Result<Proposal, GenerationError>,
    {
        async fn propose(&mut self, _store: &S, attempt: u32) -> Result<Proposal, GenerationError> {
            self.calls += 1;
            (self.f)(attempt)
        }
    }

    fn assign_op(id: &str) -> Operation {
        Operation::Update {
            id: id.to_string(),
            condition: Condition::default(),
            update: DocUpdate::InsertApplication("mysql".to_string()),
        }
    }

    #[tokio::test]
    async fn noop_short_circuits_without_writes() {
        let store = MemoryStore::new();
        let mut proposer = CountingProposer {
            calls: 0,
            f: |_| Ok(Proposal::NoOp),
        };

        TransactionRunner::default()
            .run(&store, &mut proposer)
            .await
            .unwrap();

        assert_eq!(proposer.calls, 1);
        assert_eq!(store.write_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn successful_write_ends_the_run() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "b", "alice")))
            .await
            .unwrap();

        let mut proposer = CountingProposer {
            calls: 0,
            f: |_| Ok(Proposal::Write(assign_op("1"))),
        };

        TransactionRunner::default()
            .run(&store, &mut proposer)
            .await
            .unwrap();

        assert_eq!(proposer.calls, 1);
        assert_eq!(store.write_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_increasing_attempts() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "b", "alice")))
            .await
            .unwrap();

        // First two attempts assert a revision that can never match, so each
        // is rejected as a conflict; the third resolves as a no-op.
        let seen = AtomicU32::new(0);
        let mut proposer = CountingProposer {
            calls: 0,
            f: |attempt| {
                seen.fetch_max(attempt, Ordering::Relaxed);
                if attempt < 2 {
                    Ok(Proposal::Write(Operation::Update {
                        id: "1".to_string(),
                        condition: Condition::new(vec![crate::store::op::Assert::RevisionIs(-1)]),
                        update: DocUpdate::InsertApplication("mysql".to_string()),
                    }))
                } else {
                    Ok(Proposal::NoOp)
                }
            },
        };

        TransactionRunner::default()
            .run(&store, &mut proposer)
            .await
            .unwrap();

        assert_eq!(proposer.calls, 3);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_a_distinct_error() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "b", "alice")))
            .await
            .unwrap();

        let mut proposer = CountingProposer {
            calls: 0,
            f: |_| {
                Ok(Proposal::Write(Operation::Update {
                    id: "1".to_string(),
                    condition: Condition::new(vec![crate::store::op::Assert::RevisionIs(-1)]),
                    update: DocUpdate::InsertApplication("mysql".to_string()),
                }))
            },
        };

        let err = TransactionRunner::new(3)
            .run(&store, &mut proposer)
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::RetryExhausted(_)), "got {}", err);
        assert_eq!(proposer.calls, 3);
    }

    #[tokio::test]
    async fn proposer_errors_abort_immediately() {
        let store = MemoryStore::new();
        let mut proposer = CountingProposer {
            calls: 0,
            f: |_| Err(GenerationError::NotFound("branch 9".to_string())),
        };

        let err = TransactionRunner::default()
            .run(&store, &mut proposer)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(proposer.calls, 1);
    }
}
