//! Persistence contracts for the branch collection.
//!
//! The aggregate code only ever talks to [`BranchStore`]; the store decides
//! how to make each [`Operation`](op::Operation) atomic. Two implementations
//! ship here: [`MemoryStore`](memory::MemoryStore) for tests and embedded
//! use, and [`ScyllaStore`](scylla::ScyllaStore) for production.

pub mod memory;
pub mod op;
pub mod scylla;

use crate::errors::GenerationError;
use crate::models::branch::BranchDoc;
use crate::store::op::Operation;

/// Live state of an application, as needed by assignment stability checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ApplicationState {
    pub alive: bool,
    pub unit_count: usize,
}

/// Narrow persistence contract required by the branch aggregate.
///
/// `apply` must be atomic per document: it either applies the whole write or
/// reports `GenerationError::Conflict` leaving the document untouched.
#[allow(async_fn_in_trait)]
pub trait BranchStore: Send + Sync {
    /// Finds the open (not yet completed) branch with the given name, if any.
    async fn find_open_branch(
        &self,
        model_id: &str,
        name: &str,
    ) -> Result<Option<BranchDoc>, GenerationError>;

    /// Fetches a branch document by its store-assigned id.
    async fn branch_by_id(&self, id: &str) -> Result<Option<BranchDoc>, GenerationError>;

    /// Submits one conditional write. Failed assertions surface as
    /// `GenerationError::Conflict`; anything else is a store failure.
    async fn apply(&self, op: &Operation) -> Result<(), GenerationError>;

    /// Names of the units currently belonging to an application. Empty when
    /// the application has no units.
    async fn unit_names(&self, app_name: &str) -> Result<Vec<String>, GenerationError>;

    /// Liveness and unit count for an application; `NotFound` if there is no
    /// such application in the model.
    async fn application(&self, app_name: &str) -> Result<ApplicationState, GenerationError>;
}
