use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use generations::store::op::Operation;
use generations::{
    add_branch, get_branch, ApplicationState, BranchDoc, BranchStore, GenerationError, MemoryStore,
};

fn init() -> MemoryStore {
    let _ = env_logger::builder().is_test(true).try_init();
    MemoryStore::new()
}

#[tokio::test]
async fn disjoint_unit_assignments_both_land() {
    let store = Arc::new(init());
    store.add_application("mysql", &["mysql/0", "mysql/1"]).unwrap();
    add_branch(&*store, "model-a", "fix", "alice").await.unwrap();

    let mut tasks = Vec::new();
    for unit in ["mysql/0", "mysql/1"] {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let mut branch = get_branch(&*store, "model-a", "fix").await.unwrap();
            branch.assign_unit(&*store, unit).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let branch = get_branch(&*store, "model-a", "fix").await.unwrap();
    let mut units = branch.assigned_units()["mysql"].clone();
    units.sort();
    assert_eq!(units, vec!["mysql/0".to_string(), "mysql/1".to_string()]);
}

#[tokio::test]
async fn racing_same_unit_assignments_store_it_once() {
    let store = Arc::new(init());
    store.add_application("mysql", &["mysql/0"]).unwrap();
    add_branch(&*store, "model-a", "fix", "alice").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let mut branch = get_branch(&*store, "model-a", "fix").await.unwrap();
            branch.assign_unit(&*store, "mysql/0").await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let branch = get_branch(&*store, "model-a", "fix").await.unwrap();
    let units = &branch.assigned_units()["mysql"];
    assert_eq!(units.iter().filter(|u| u.as_str() == "mysql/0").count(), 1);
}

#[tokio::test]
async fn stale_commit_retries_against_fresh_state() {
    let store = init();
    store.add_application("mysql", &["mysql/0"]).unwrap();
    add_branch(&store, "model-a", "fix", "alice").await.unwrap();

    let mut assigner = get_branch(&store, "model-a", "fix").await.unwrap();
    let mut committer = get_branch(&store, "model-a", "fix").await.unwrap();

    // Bump the document's revision underneath the committer's cached copy;
    // its first commit attempt must conflict and retry from fresh state.
    assigner.assign_unit(&store, "mysql/0").await.unwrap();
    assert!(committer.revision() < assigner.revision());

    let generation_id = committer.commit(&store, "bob").await.unwrap();
    assert_eq!(generation_id, 1);
    assert_eq!(committer.assigned_units()["mysql"], vec!["mysql/0".to_string()]);
    assert_eq!(committer.completed_by(), Some("bob"));
}

/// Delegating store that adds a unit to the application the first time its
/// membership is read, modelling a deployment scaling up while an
/// assign-all-units call is in flight.
struct GrowingStore {
    inner: MemoryStore,
    grown: AtomicBool,
}

impl BranchStore for GrowingStore {
    async fn find_open_branch(
        &self,
        model_id: &str,
        name: &str,
    ) -> Result<Option<BranchDoc>, GenerationError> {
        self.inner.find_open_branch(model_id, name).await
    }

    async fn branch_by_id(&self, id: &str) -> Result<Option<BranchDoc>, GenerationError> {
        self.inner.branch_by_id(id).await
    }

    async fn apply(&self, op: &Operation) -> Result<(), GenerationError> {
        self.inner.apply(op).await
    }

    async fn unit_names(&self, app_name: &str) -> Result<Vec<String>, GenerationError> {
        let names = self.inner.unit_names(app_name).await?;
        if !self.grown.swap(true, Ordering::SeqCst) {
            self.inner.set_units(app_name, &["mysql/0", "mysql/1"])?;
        }
        Ok(names)
    }

    async fn application(&self, app_name: &str) -> Result<ApplicationState, GenerationError> {
        self.inner.application(app_name).await
    }
}

#[tokio::test]
async fn unit_count_change_between_read_and_write_forces_a_retry() {
    let store = GrowingStore {
        inner: init(),
        grown: AtomicBool::new(false),
    };
    store.inner.add_application("mysql", &["mysql/0"]).unwrap();
    add_branch(&store.inner, "model-a", "fix", "alice").await.unwrap();

    let mut branch = get_branch(&store.inner, "model-a", "fix").await.unwrap();
    branch.assign_all_units(&store, "mysql").await.unwrap();

    // The first attempt saw one unit but the stability assertion caught the
    // scale-up; the retry staged the full membership.
    let mut units = branch.assigned_units()["mysql"].clone();
    units.sort();
    assert_eq!(units, vec!["mysql/0".to_string(), "mysql/1".to_string()]);
}
