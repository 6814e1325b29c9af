//! In-process store backed by a mutex.
//!
//! Every operation evaluates its assertions and applies its update under one
//! lock, which gives the same atomicity the production store gets from LWT.
//! Used by the test suite and for embedding the subsystem without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::GenerationError;
use crate::models::branch::BranchDoc;
use crate::sequence::SequenceAllocator;
use crate::store::op::Operation;
use crate::store::{ApplicationState, BranchStore};

struct AppEntry {
    alive: bool,
    units: Vec<String>,
}

impl Default for AppEntry {
    fn default() -> Self {
        AppEntry {
            alive: true,
            units: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    branches: HashMap<String, BranchDoc>,
    applications: HashMap<String, AppEntry>,
    counters: HashMap<String, i64>,
    writes: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Registers an application with the given unit membership.
    pub fn add_application(&self, name: &str, units: &[&str]) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock()?;
        inner.applications.insert(
            name.to_string(),
            AppEntry {
                alive: true,
                units: units.iter().map(|u| u.to_string()).collect(),
            },
        );
        Ok(())
    }

    /// Replaces an application's unit membership, e.g. to model units being
    /// added or removed underneath an in-flight assignment.
    pub fn set_units(&self, name: &str, units: &[&str]) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock()?;
        inner
            .applications
            .entry(name.to_string())
            .or_default()
            .units = units.iter().map(|u| u.to_string()).collect();
        Ok(())
    }

    pub fn set_application_alive(&self, name: &str, alive: bool) -> Result<(), GenerationError> {
        let mut inner = self.inner.lock()?;
        inner.applications.entry(name.to_string()).or_default().alive = alive;
        Ok(())
    }

    /// Number of successful branch-document writes so far. Lets tests pin
    /// down no-op detection and commit idempotence.
    pub fn write_count(&self) -> Result<u64, GenerationError> {
        Ok(self.inner.lock()?.writes)
    }
}

impl BranchStore for MemoryStore {
    async fn find_open_branch(
        &self,
        model_id: &str,
        name: &str,
    ) -> Result<Option<BranchDoc>, GenerationError> {
        let inner = self.inner.lock()?;
        Ok(inner
            .branches
            .values()
            .find(|doc| doc.model_id == model_id && doc.name == name && !doc.is_completed())
            .cloned())
    }

    async fn branch_by_id(&self, id: &str) -> Result<Option<BranchDoc>, GenerationError> {
        let inner = self.inner.lock()?;
        Ok(inner.branches.get(id).cloned())
    }

    async fn apply(&self, op: &Operation) -> Result<(), GenerationError> {
        let inner = &mut *self.inner.lock()?;

        match op {
            Operation::Insert(doc) => {
                let open_name_taken = inner.branches.values().any(|existing| {
                    existing.model_id == doc.model_id
                        && existing.name == doc.name
                        && !existing.is_completed()
                });
                if open_name_taken || inner.branches.contains_key(&doc.id) {
                    return Err(GenerationError::Conflict(format!(
                        "{}: document already present",
                        op.describe()
                    )));
                }

                let mut doc = doc.clone();
                doc.revision = 1;
                inner.branches.insert(doc.id.clone(), doc);
            }
            Operation::Update { id, condition, update } => {
                let applications = &inner.applications;
                let doc = inner.branches.get(id).ok_or_else(|| {
                    GenerationError::NotFound(format!("branch {} has no backing document", id))
                })?;

                let app_state = |name: &str| {
                    applications.get(name).map(|entry| ApplicationState {
                        alive: entry.alive,
                        unit_count: entry.units.len(),
                    })
                };
                if let Some(assert) = condition.unmet(doc, &app_state) {
                    return Err(GenerationError::Conflict(format!(
                        "{}: assertion failed: {:?}",
                        op.describe(),
                        assert
                    )));
                }

                let doc = inner.branches.get_mut(id).ok_or_else(|| {
                    GenerationError::NotFound(format!("branch {} has no backing document", id))
                })?;
                update.apply_to(doc);
            }
        }

        inner.writes += 1;
        Ok(())
    }

    async fn unit_names(&self, app_name: &str) -> Result<Vec<String>, GenerationError> {
        let inner = self.inner.lock()?;
        Ok(inner
            .applications
            .get(app_name)
            .map(|entry| entry.units.clone())
            .unwrap_or_default())
    }

    async fn application(&self, app_name: &str) -> Result<ApplicationState, GenerationError> {
        let inner = self.inner.lock()?;
        inner
            .applications
            .get(app_name)
            .map(|entry| ApplicationState {
                alive: entry.alive,
                unit_count: entry.units.len(),
            })
            .ok_or_else(|| GenerationError::NotFound(format!("application {:?}", app_name)))
    }
}

impl SequenceAllocator for MemoryStore {
    async fn next_sequence(&self, name: &str, minimum: i64) -> Result<i64, GenerationError> {
        let mut inner = self.inner.lock()?;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter = (*counter + 1).max(minimum);
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::op::{Assert, Condition, DocUpdate};

    #[tokio::test]
    async fn sequences_are_monotonic_per_name() {
        let store = MemoryStore::new();

        assert_eq!(store.next_sequence("generation", 1).await.unwrap(), 1);
        assert_eq!(store.next_sequence("generation", 1).await.unwrap(), 2);
        assert_eq!(store.next_sequence("generation", 1).await.unwrap(), 3);

        // Independent counter per name.
        assert_eq!(store.next_sequence("branch", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sequence_minimum_is_a_floor() {
        let store = MemoryStore::new();

        assert_eq!(store.next_sequence("generation", 10).await.unwrap(), 10);
        // Past the floor the counter just increments.
        assert_eq!(store.next_sequence("generation", 1).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn insert_conflicts_with_open_branch_of_same_name() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "fix", "alice")))
            .await
            .unwrap();

        let err = store
            .apply(&Operation::Insert(BranchDoc::new("2", "m", "fix", "bob")))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Same name in a different model is fine.
        store
            .apply(&Operation::Insert(BranchDoc::new("3", "other", "fix", "bob")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_allows_reusing_a_completed_name() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "fix", "alice")))
            .await
            .unwrap();
        store
            .apply(&Operation::Update {
                id: "1".to_string(),
                condition: Condition::default(),
                update: DocUpdate::Complete {
                    assigned_units: HashMap::new(),
                    completed_at: chrono::Utc::now(),
                    completed_by: "alice".to_string(),
                    generation_id: 0,
                },
            })
            .await
            .unwrap();

        store
            .apply(&Operation::Insert(BranchDoc::new("2", "m", "fix", "bob")))
            .await
            .unwrap();
    }

    #[test]
    fn poisoned_lock_surfaces_as_internal_error() {
        let store = MemoryStore::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.inner.lock().unwrap();
            panic!("poison the store lock");
        }));

        let err = store.write_count().unwrap_err();
        assert!(matches!(err, GenerationError::Internal(_)), "got {}", err);
        assert!(store.add_application("mysql", &[]).is_err());
    }

    #[tokio::test]
    async fn failed_assertion_leaves_the_document_untouched() {
        let store = MemoryStore::new();
        store
            .apply(&Operation::Insert(BranchDoc::new("1", "m", "fix", "alice")))
            .await
            .unwrap();
        let before = store.branch_by_id("1").await.unwrap().unwrap();

        let err = store
            .apply(&Operation::Update {
                id: "1".to_string(),
                condition: Condition::new(vec![Assert::RevisionIs(before.revision + 1)]),
                update: DocUpdate::InsertApplication("mysql".to_string()),
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let after = store.branch_by_id("1").await.unwrap().unwrap();
        assert_eq!(after.revision, before.revision);
        assert!(after.assigned_units.is_empty());
    }
}
