//! Staged configuration branches for a model control plane.
//!
//! Operators group pending per-application configuration changes into a
//! named branch, accumulate application and unit membership over time, and
//! eventually commit the branch, promoting its changes into the model under
//! a freshly allocated generation id. Safety under concurrent writers comes
//! entirely from optimistic concurrency: every mutation is an assert-then-
//! update write retried by [`txn::TransactionRunner`] until it lands or the
//! intent turns out to be already satisfied.

pub mod db;
pub mod errors;
pub mod models;
pub mod names;
pub mod sequence;
pub mod store;
pub mod txn;

pub use crate::errors::{CompletionState, GenerationError};
pub use crate::models::branch::{add_branch, get_branch, Branch, BranchDoc};
pub use crate::sequence::SequenceAllocator;
pub use crate::store::memory::MemoryStore;
pub use crate::store::scylla::ScyllaStore;
pub use crate::store::{ApplicationState, BranchStore};
pub use crate::txn::{Proposal, Propose, TransactionRunner};
