//! The terminal branch transition.

use chrono::Utc;

use crate::errors::{CompletionState, GenerationError};
use crate::models::branch::Branch;
use crate::sequence::{SequenceAllocator, GENERATION_SEQUENCE};
use crate::store::op::{Assert, Condition, DocUpdate, Operation};
use crate::store::BranchStore;
use crate::txn::{Proposal, Propose, TransactionRunner};

struct CommitBranch<'a> {
    branch: &'a mut Branch,
    user_name: &'a str,
    generation_id: i64,
}

impl<'a, S> Propose<S> for CommitBranch<'a>
where
    S: BranchStore + SequenceAllocator,
{
    async fn propose(&mut self, store: &S, attempt: u32) -> Result<Proposal, GenerationError> {
        if attempt > 0 {
            self.branch.refresh(store).await?;
        }
        if self.branch.doc.is_completed() {
            if self.branch.doc.generation_id == 0 {
                return Err(GenerationError::AlreadyCompleted(CompletionState::Aborted));
            }
            // A repeat of an earlier commit; report its generation id and
            // write nothing.
            self.generation_id = self.branch.doc.generation_id;
            return Ok(Proposal::NoOp);
        }

        // Commit captures the live unit set of every staged application, not
        // whatever snapshot assignment happened to leave behind.
        let mut assigned = self.branch.doc.assigned_units.clone();
        for (app, units) in assigned.iter_mut() {
            *units = store.unit_names(app).await?;
        }

        // Draw the sequence as late as possible so a conflicting attempt
        // wastes as few ids as it can. An empty assignment map takes no id
        // at all: the branch completes with generation 0, which is an abort
        // in everything but name.
        self.generation_id = if assigned.is_empty() {
            0
        } else {
            store.next_sequence(GENERATION_SEQUENCE, 1).await?
        };

        // The revision stands in for "nothing about this branch changed
        // since we read it", covering the whole recomputation above.
        Ok(Proposal::Write(Operation::Update {
            id: self.branch.doc.id.clone(),
            condition: Condition::new(vec![Assert::RevisionIs(self.branch.doc.revision)]),
            update: DocUpdate::Complete {
                assigned_units: assigned,
                completed_at: Utc::now(),
                completed_by: self.user_name.to_string(),
                generation_id: self.generation_id,
            },
        }))
    }
}

impl Branch {
    /// Marks the branch completed, promoting its staged changes into the
    /// model under the next generation id, which is returned. Committing a
    /// branch with nothing staged returns 0 and leaves it aborted;
    /// re-committing an already committed branch is a harmless repeat.
    pub async fn commit<S>(&mut self, store: &S, user_name: &str) -> Result<i64, GenerationError>
    where
        S: BranchStore + SequenceAllocator,
    {
        let mut proposer = CommitBranch {
            branch: self,
            user_name,
            generation_id: 0,
        };
        TransactionRunner::default().run(store, &mut proposer).await?;
        let generation_id = proposer.generation_id;

        self.refresh(store).await?;
        Ok(generation_id)
    }
}
