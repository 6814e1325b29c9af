//! Scylla-backed store.
//!
//! Branch documents live in the `branches` table and carry a `revision`
//! column. Assertions are evaluated client-side against a fresh read, and
//! the write itself is a lightweight transaction conditioned on the revision
//! that read observed. The CAS pins every assertion over the branch row: if
//! it applies, that row cannot have changed between evaluation and write.
//! [`Assert::ApplicationStable`](crate::store::op::Assert) reads the
//! separate `applications` table, which the branch-row CAS cannot pin, so a
//! membership change in the instant between that read and the applied write
//! can slip past it. The evaluation runs as close to the write as possible
//! to keep that window small, and commit re-resolves live membership in any
//! case.
//!
//! Table schemas follow the model definitions below; migrations are managed
//! outside this crate (charybdis migration tooling). The `applications` and
//! `units` tables are owned by the wider model store; this subsystem only
//! reads them.

use charybdis::macros::charybdis_model;
use charybdis::operations::Find;
use charybdis::types::{BigInt, Frozen, List, Map, Text, Timestamp};
use log::debug;
use scylla::value::{CqlValue, Row};
use scylla::client::caching_session::CachingSession;
use scylla::response::query_result::QueryResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::GenerationError;
use crate::models::branch::BranchDoc;
use crate::sequence::SequenceAllocator;
use crate::store::op::Operation;
use crate::store::{ApplicationState, BranchStore};

#[charybdis_model(
    table_name = branches,
    partition_keys = [id],
    clustering_keys = [],
)]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub id: Text,
    pub model_id: Text,
    pub name: Text,
    pub assigned_units: Map<Text, Frozen<List<Text>>>,
    pub created_at: Timestamp,
    pub created_by: Text,
    pub completed_at: Option<Timestamp>,
    pub completed_by: Option<Text>,
    pub generation_id: BigInt,
    pub revision: BigInt,
}

impl From<BranchRecord> for BranchDoc {
    fn from(record: BranchRecord) -> Self {
        BranchDoc {
            id: record.id,
            model_id: record.model_id,
            name: record.name,
            assigned_units: record.assigned_units,
            created_at: record.created_at,
            created_by: record.created_by,
            completed_at: record.completed_at,
            completed_by: record.completed_by,
            generation_id: record.generation_id,
            revision: record.revision,
        }
    }
}

/// One row per named counter; see [`SequenceAllocator`].
#[charybdis_model(
    table_name = sequences,
    partition_keys = [name],
    clustering_keys = [],
)]
#[derive(Serialize, Deserialize, Clone)]
pub struct SequenceRecord {
    pub name: Text,
    pub value: BigInt,
}

#[charybdis_model(
    table_name = applications,
    partition_keys = [name],
    clustering_keys = [],
)]
#[derive(Serialize, Deserialize, Clone)]
pub struct ApplicationRecord {
    pub name: Text,
    pub life: Text,
    pub unit_count: BigInt,
}

#[charybdis_model(
    table_name = units,
    partition_keys = [application],
    clustering_keys = [name],
)]
#[derive(Serialize, Deserialize, Clone)]
pub struct UnitRecord {
    pub application: Text,
    pub name: Text,
}

const INSERT_BRANCH_QUERY: &str = "INSERT INTO branches \
    (id, model_id, name, assigned_units, created_at, created_by, completed_at, completed_by, generation_id, revision) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS";

const UPDATE_BRANCH_QUERY: &str = "UPDATE branches SET \
    assigned_units = ?, completed_at = ?, completed_by = ?, generation_id = ?, revision = ? \
    WHERE id = ? IF revision = ?";

const INSERT_SEQUENCE_QUERY: &str =
    "INSERT INTO sequences (name, value) VALUES (?, ?) IF NOT EXISTS";

const UPDATE_SEQUENCE_QUERY: &str = "UPDATE sequences SET value = ? WHERE name = ? IF value = ?";

const SEQUENCE_CAS_ATTEMPTS: u32 = 16;

pub struct ScyllaStore {
    db_session: CachingSession,
}

impl ScyllaStore {
    pub fn new(db_session: CachingSession) -> Self {
        ScyllaStore { db_session }
    }

    pub fn db_session(&self) -> &CachingSession {
        &self.db_session
    }

    async fn execute_lwt(
        &self,
        query: &str,
        values: impl scylla::serialize::row::SerializeRow,
    ) -> Result<bool, GenerationError> {
        let result = self
            .db_session
            .execute_unpaged(query, values)
            .await
            .map_err(|e| GenerationError::Database(format!("executing {:?}: {}", query, e)))?;
        lwt_applied(result)
    }

    /// Resolves live application state for every application referenced by
    /// an operation's stability assertions. Missing applications simply stay
    /// absent from the map, which fails the assertion.
    async fn referenced_app_states(
        &self,
        apps: &[&str],
    ) -> Result<HashMap<String, ApplicationState>, GenerationError> {
        let mut states = HashMap::new();
        for app in apps {
            match self.application(app).await {
                Ok(state) => {
                    states.insert(app.to_string(), state);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(states)
    }
}

/// Reads the `[applied]` column of a conditional-write response.
fn lwt_applied(result: QueryResult) -> Result<bool, GenerationError> {
    let rows = result
        .into_rows_result()
        .map_err(|e| GenerationError::Database(format!("reading LWT response: {}", e)))?;

    let first = rows
        .rows::<Row>()
        .map_err(|e| GenerationError::Database(format!("typing LWT response: {}", e)))?
        .next()
        .transpose()
        .map_err(|e| GenerationError::Database(format!("decoding LWT response: {}", e)))?;

    match first.and_then(|row| row.columns.into_iter().next()).flatten() {
        Some(CqlValue::Boolean(applied)) => Ok(applied),
        other => Err(GenerationError::Internal(format!(
            "conditional write returned no [applied] column: {:?}",
            other
        ))),
    }
}

impl BranchStore for ScyllaStore {
    async fn find_open_branch(
        &self,
        model_id: &str,
        name: &str,
    ) -> Result<Option<BranchDoc>, GenerationError> {
        // Names are not a key; open branches are few enough that a filtering
        // scan per lookup is acceptable, as name reuse demands post-filtering
        // on completion anyway.
        let records: Vec<BranchRecord> = find_branch_record!(
            "model_id = ? AND name = ? ALLOW FILTERING",
            (model_id, name)
        )
        .execute(&self.db_session)
        .await?
        .try_collect()
        .await?;

        Ok(records
            .into_iter()
            .find(|record| record.completed_at.is_none())
            .map(BranchDoc::from))
    }

    async fn branch_by_id(&self, id: &str) -> Result<Option<BranchDoc>, GenerationError> {
        let record = BranchRecord::maybe_find_first_by_id(id.to_string())
            .execute(&self.db_session)
            .await?;
        Ok(record.map(BranchDoc::from))
    }

    async fn apply(&self, op: &Operation) -> Result<(), GenerationError> {
        match op {
            Operation::Insert(doc) => {
                if self.find_open_branch(&doc.model_id, &doc.name).await?.is_some() {
                    return Err(GenerationError::Conflict(format!(
                        "{}: name already open",
                        op.describe()
                    )));
                }

                let applied = self
                    .execute_lwt(
                        INSERT_BRANCH_QUERY,
                        (
                            &doc.id,
                            &doc.model_id,
                            &doc.name,
                            &doc.assigned_units,
                            doc.created_at,
                            &doc.created_by,
                            doc.completed_at,
                            doc.completed_by.as_deref(),
                            doc.generation_id,
                            1i64,
                        ),
                    )
                    .await?;
                if !applied {
                    return Err(GenerationError::Conflict(format!(
                        "{}: document already present",
                        op.describe()
                    )));
                }
                Ok(())
            }
            Operation::Update { id, condition, update } => {
                let current = self.branch_by_id(id).await?.ok_or_else(|| {
                    GenerationError::NotFound(format!("branch {} has no backing document", id))
                })?;

                let mut updated = current.clone();
                update.apply_to(&mut updated);

                // Application state is read last, immediately before the
                // write, since the revision CAS cannot pin it.
                let app_states = self
                    .referenced_app_states(&condition.referenced_applications())
                    .await?;
                let lookup = |name: &str| app_states.get(name).copied();
                if let Some(assert) = condition.unmet(&current, &lookup) {
                    debug!("{}: assertion failed: {:?}", op.describe(), assert);
                    return Err(GenerationError::Conflict(format!(
                        "{}: assertion failed: {:?}",
                        op.describe(),
                        assert
                    )));
                }

                let applied = self
                    .execute_lwt(
                        UPDATE_BRANCH_QUERY,
                        (
                            &updated.assigned_units,
                            updated.completed_at,
                            updated.completed_by.as_deref(),
                            updated.generation_id,
                            updated.revision,
                            id,
                            current.revision,
                        ),
                    )
                    .await?;
                if !applied {
                    return Err(GenerationError::Conflict(format!(
                        "{}: document changed underneath the write",
                        op.describe()
                    )));
                }
                Ok(())
            }
        }
    }

    async fn unit_names(&self, app_name: &str) -> Result<Vec<String>, GenerationError> {
        let units: Vec<UnitRecord> = UnitRecord::find_by_partition_key_value((app_name.to_string(),))
            .execute(&self.db_session)
            .await?
            .try_collect()
            .await?;

        Ok(units.into_iter().map(|unit| unit.name).collect())
    }

    async fn application(&self, app_name: &str) -> Result<ApplicationState, GenerationError> {
        let record = ApplicationRecord::maybe_find_first_by_name(app_name.to_string())
            .execute(&self.db_session)
            .await?
            .ok_or_else(|| GenerationError::NotFound(format!("application {:?}", app_name)))?;

        Ok(ApplicationState {
            alive: record.life == "alive",
            unit_count: record.unit_count.max(0) as usize,
        })
    }
}

impl SequenceAllocator for ScyllaStore {
    async fn next_sequence(&self, name: &str, minimum: i64) -> Result<i64, GenerationError> {
        for _ in 0..SEQUENCE_CAS_ATTEMPTS {
            let current = SequenceRecord::maybe_find_first_by_name(name.to_string())
                .execute(&self.db_session)
                .await?;

            match current {
                None => {
                    let next = minimum.max(1);
                    if self
                        .execute_lwt(INSERT_SEQUENCE_QUERY, (name, next))
                        .await?
                    {
                        return Ok(next);
                    }
                }
                Some(record) => {
                    let next = (record.value + 1).max(minimum);
                    if self
                        .execute_lwt(UPDATE_SEQUENCE_QUERY, (next, name, record.value))
                        .await?
                    {
                        return Ok(next);
                    }
                }
            }
        }

        Err(GenerationError::RetryExhausted(format!(
            "allocating sequence {:?}",
            name
        )))
    }
}
