//! Durable named counters.
//!
//! Generation ids and branch document ids come from here. The counter is a
//! store-backed document updated with the same compare-and-swap discipline
//! as branch documents, so values survive crashes and never repeat across
//! processes sharing the store.

use crate::errors::GenerationError;

/// Issues monotonically increasing integers for a named counter.
#[allow(async_fn_in_trait)]
pub trait SequenceAllocator {
    /// Returns a value `>= minimum` and strictly greater than any value
    /// previously returned for `name`, safe under concurrent callers. A value
    /// once returned is burnt even if the caller never uses it.
    async fn next_sequence(&self, name: &str, minimum: i64) -> Result<i64, GenerationError>;
}

/// Counter names used by the branch subsystem.
pub const BRANCH_SEQUENCE: &str = "branch";
pub const GENERATION_SEQUENCE: &str = "generation";
