//! Structured conditional writes.
//!
//! Every branch mutation is expressed as an [`Operation`]: either a fresh
//! document insert or an assert-then-update against one existing document.
//! Assertions are plain data so they can be evaluated (and tested) without a
//! store; each store is responsible for making evaluate-then-apply atomic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::branch::BranchDoc;
use crate::store::ApplicationState;

/// A single predicate over the current state of a branch document (or, for
/// [`Assert::ApplicationStable`], the application it references).
#[derive(Clone, Debug, PartialEq)]
pub enum Assert {
    /// The branch has no completion timestamp.
    Open,
    /// The application has not been staged into the branch.
    ApplicationAbsent(String),
    /// The unit is not present in its application's staged set.
    UnitAbsent { app: String, unit: String },
    /// The application is alive and still has exactly this many units.
    ApplicationStable { app: String, unit_count: usize },
    /// The document has not been rewritten since it was last read.
    RevisionIs(i64),
}

impl Assert {
    fn holds(&self, doc: &BranchDoc, app_state: &impl Fn(&str) -> Option<ApplicationState>) -> bool {
        match self {
            Assert::Open => doc.completed_at.is_none(),
            Assert::ApplicationAbsent(app) => !doc.assigned_units.contains_key(app),
            Assert::UnitAbsent { app, unit } => !doc
                .assigned_units
                .get(app)
                .is_some_and(|units| units.contains(unit)),
            Assert::ApplicationStable { app, unit_count } => app_state(app)
                .is_some_and(|state| state.alive && state.unit_count == *unit_count),
            Assert::RevisionIs(revision) => doc.revision == *revision,
        }
    }
}

/// A conjunction of assertions guarding one conditional write.
#[derive(Clone, Debug, Default)]
pub struct Condition(Vec<Assert>);

impl Condition {
    pub fn new(asserts: Vec<Assert>) -> Self {
        Condition(asserts)
    }

    /// Returns the first assertion that does not hold against the given
    /// document, or `None` when the whole condition is satisfied.
    /// `app_state` resolves the applications referenced by
    /// [`Assert::ApplicationStable`]; it is consulted for nothing else.
    pub fn unmet(
        &self,
        doc: &BranchDoc,
        app_state: &impl Fn(&str) -> Option<ApplicationState>,
    ) -> Option<&Assert> {
        self.0.iter().find(|assert| !assert.holds(doc, app_state))
    }

    /// Applications whose live state the store must resolve before this
    /// condition can be evaluated.
    pub fn referenced_applications(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter_map(|assert| match assert {
                Assert::ApplicationStable { app, .. } => Some(app.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Field mutations applied when an operation's condition holds.
#[derive(Clone, Debug)]
pub enum DocUpdate {
    /// Stage an application with an empty unit set.
    InsertApplication(String),
    /// Append units to an application's staged set, staging the application
    /// on the way if it was absent.
    PushUnits { app: String, units: Vec<String> },
    /// Terminal transition: replace the assignment map and mark completion.
    Complete {
        assigned_units: HashMap<String, Vec<String>>,
        completed_at: DateTime<Utc>,
        completed_by: String,
        generation_id: i64,
    },
}

impl DocUpdate {
    /// Applies the mutation to an in-memory copy of the document. Stores
    /// that hold the authoritative copy directly (MemoryStore) use this as
    /// the write itself; the Scylla store uses it to compute the column
    /// values for its CAS statement.
    pub fn apply_to(&self, doc: &mut BranchDoc) {
        match self {
            DocUpdate::InsertApplication(app) => {
                doc.assigned_units.entry(app.clone()).or_default();
            }
            DocUpdate::PushUnits { app, units } => {
                doc.assigned_units
                    .entry(app.clone())
                    .or_default()
                    .extend(units.iter().cloned());
            }
            DocUpdate::Complete {
                assigned_units,
                completed_at,
                completed_by,
                generation_id,
            } => {
                doc.assigned_units = assigned_units.clone();
                doc.completed_at = Some(*completed_at);
                doc.completed_by = Some(completed_by.clone());
                doc.generation_id = *generation_id;
            }
        }
        doc.revision += 1;
    }
}

/// One atomic write against the branch collection.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Insert a new branch document. The implied assertion is that no open
    /// branch with the same (model, name) pair exists.
    Insert(BranchDoc),
    /// Conditionally update the document with the given id.
    Update {
        id: String,
        condition: Condition,
        update: DocUpdate,
    },
}

impl Operation {
    /// Short tag for conflict/error messages.
    pub fn describe(&self) -> String {
        match self {
            Operation::Insert(doc) => format!("insert branch {:?} in model {}", doc.name, doc.model_id),
            Operation::Update { id, update, .. } => match update {
                DocUpdate::InsertApplication(app) => format!("assign application {:?} to branch {}", app, id),
                DocUpdate::PushUnits { app, .. } => format!("assign units of {:?} to branch {}", app, id),
                DocUpdate::Complete { .. } => format!("commit branch {}", id),
            },
        }
    }
}
