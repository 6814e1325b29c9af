use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};

use crate::errors::{CompletionState, GenerationError};
use crate::sequence::{SequenceAllocator, BRANCH_SEQUENCE};
use crate::store::op::Operation;
use crate::store::BranchStore;
use crate::txn::{Proposal, Propose, TransactionRunner};

pub mod assign;
pub mod commit;

/// One branch document: a named set of staged per-application configuration
/// changes, keyed by a store-assigned id so names can be reused once a
/// branch completes.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BranchDoc {
    pub id: String,
    pub model_id: String,

    /// Operator-chosen label. There is never more than one open branch with
    /// the same name in a model; completed names can be reused.
    pub name: String,

    /// Unit names staged into the branch, keyed by application name. An
    /// application key with an empty set means the application carries
    /// branch-scoped config but no units have opted in yet.
    pub assigned_units: HashMap<String, Vec<String>>,

    pub created_at: DateTime<Utc>,
    pub created_by: String,

    /// `None` while the branch is open. Once set the document is immutable.
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,

    /// Monotonic sequence assigned at commit when the branch carried real
    /// changes; stays 0 for open branches and for commits with nothing
    /// staged (the abort-equivalent).
    pub generation_id: i64,

    /// Store-managed version token, bumped on every successful write.
    pub revision: i64,
}

impl BranchDoc {
    pub fn new(id: &str, model_id: &str, name: &str, created_by: &str) -> Self {
        BranchDoc {
            id: id.to_string(),
            model_id: model_id.to_string(),
            name: name.to_string(),
            assigned_units: HashMap::new(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            completed_at: None,
            completed_by: None,
            generation_id: 0,
            revision: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// In-memory representative of one branch document. All mutations go through
/// the transaction runner; after a successful run the cached document is
/// reloaded so it matches the store.
#[derive(Debug)]
pub struct Branch {
    pub(crate) doc: BranchDoc,
}

impl Branch {
    pub(crate) fn new(doc: BranchDoc) -> Self {
        Branch { doc }
    }

    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn model_id(&self) -> &str {
        &self.doc.model_id
    }

    /// The name given to this branch at creation.
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    /// The relative order in which this branch was committed and had its
    /// changes applied to the model; 0 until then.
    pub fn generation_id(&self) -> i64 {
        self.doc.generation_id
    }

    /// Unit names staged into this branch, keyed by application name.
    pub fn assigned_units(&self) -> &HashMap<String, Vec<String>> {
        &self.doc.assigned_units
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.doc.created_at
    }

    pub fn created_by(&self) -> &str {
        &self.doc.created_by
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.doc.completed_at
    }

    pub fn completed_by(&self) -> Option<&str> {
        self.doc.completed_by.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.doc.is_completed()
    }

    pub fn revision(&self) -> i64 {
        self.doc.revision
    }

    /// Fails if this branch was committed or aborted, distinguishing the two
    /// by whether a generation id was ever assigned.
    pub fn check_not_complete(&self) -> Result<(), GenerationError> {
        if !self.doc.is_completed() {
            return Ok(());
        }

        let state = if self.doc.generation_id == 0 {
            CompletionState::Aborted
        } else {
            CompletionState::Committed
        };
        Err(GenerationError::AlreadyCompleted(state))
    }

    /// Reloads the cached document from the store. `NotFound` if the backing
    /// document vanished.
    pub async fn refresh(&mut self, store: &impl BranchStore) -> Result<(), GenerationError> {
        match store.branch_by_id(&self.doc.id).await? {
            Some(doc) => {
                self.doc = doc;
                Ok(())
            }
            None => Err(GenerationError::NotFound(format!(
                "branch {} in model {}",
                self.doc.id, self.doc.model_id
            ))),
        }
    }
}

struct InsertBranch {
    doc: BranchDoc,
}

impl<S: BranchStore> Propose<S> for InsertBranch {
    async fn propose(&mut self, store: &S, _attempt: u32) -> Result<Proposal, GenerationError> {
        // Uniqueness of open names is enforced here at write time, not by a
        // standing index: whoever loses the insert race re-proposes, finds
        // the winner's document and reports AlreadyExists.
        if store
            .find_open_branch(&self.doc.model_id, &self.doc.name)
            .await?
            .is_some()
        {
            return Err(GenerationError::AlreadyExists(format!(
                "model {} already has branch {:?}",
                self.doc.model_id, self.doc.name
            )));
        }

        Ok(Proposal::Write(Operation::Insert(self.doc.clone())))
    }
}

/// Creates a new open branch in the model. The document id is drawn from the
/// `"branch"` sequence, so ids are unique across the store's lifetime even
/// when names are reused.
pub async fn add_branch<S>(
    store: &S,
    model_id: &str,
    name: &str,
    user_name: &str,
) -> Result<(), GenerationError>
where
    S: BranchStore + SequenceAllocator,
{
    let id = store.next_sequence(BRANCH_SEQUENCE, 1).await?;
    let doc = BranchDoc::new(&id.to_string(), model_id, name, user_name);

    let result = TransactionRunner::default()
        .run(store, &mut InsertBranch { doc })
        .await;

    if let Err(err) = &result {
        if !matches!(err, GenerationError::AlreadyExists(_)) {
            error!("cannot add branch {:?} to model {}: {}", name, model_id, err);
        }
    }
    result
}

/// Retrieves the open branch with the given name from the model.
pub async fn get_branch<S>(store: &S, model_id: &str, name: &str) -> Result<Branch, GenerationError>
where
    S: BranchStore,
{
    match store.find_open_branch(model_id, name).await? {
        Some(doc) => Ok(Branch::new(doc)),
        None => Err(GenerationError::NotFound(format!(
            "branch {:?} in model {}",
            name, model_id
        ))),
    }
}
