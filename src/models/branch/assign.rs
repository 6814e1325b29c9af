//! Staging applications and units into an open branch.
//!
//! Each mutation is a proposer over the cached document: it resolves as a
//! no-op when current state already satisfies the intent, otherwise it emits
//! one conditional write whose assertions pin down exactly the state it
//! computed the write from.

use crate::errors::GenerationError;
use crate::models::branch::Branch;
use crate::names;
use crate::store::op::{Assert, Condition, DocUpdate, Operation};
use crate::store::BranchStore;
use crate::txn::{Proposal, Propose, TransactionRunner};

struct AssignApplication<'a> {
    branch: &'a mut Branch,
    app_name: &'a str,
}

impl<'a, S: BranchStore> Propose<S> for AssignApplication<'a> {
    async fn propose(&mut self, store: &S, attempt: u32) -> Result<Proposal, GenerationError> {
        if attempt > 0 {
            self.branch.refresh(store).await?;
        }
        if self.branch.doc.assigned_units.contains_key(self.app_name) {
            return Ok(Proposal::NoOp);
        }
        self.branch.check_not_complete()?;

        Ok(Proposal::Write(Operation::Update {
            id: self.branch.doc.id.clone(),
            condition: Condition::new(vec![
                Assert::Open,
                Assert::ApplicationAbsent(self.app_name.to_string()),
            ]),
            update: DocUpdate::InsertApplication(self.app_name.to_string()),
        }))
    }
}

struct AssignUnit<'a> {
    branch: &'a mut Branch,
    app_name: String,
    unit_name: &'a str,
}

impl<'a, S: BranchStore> Propose<S> for AssignUnit<'a> {
    async fn propose(&mut self, store: &S, attempt: u32) -> Result<Proposal, GenerationError> {
        if attempt > 0 {
            self.branch.refresh(store).await?;
        }
        self.branch.check_not_complete()?;
        if self
            .branch
            .doc
            .assigned_units
            .get(&self.app_name)
            .is_some_and(|units| units.iter().any(|u| u.as_str() == self.unit_name))
        {
            return Ok(Proposal::NoOp);
        }

        Ok(Proposal::Write(Operation::Update {
            id: self.branch.doc.id.clone(),
            condition: Condition::new(vec![
                Assert::Open,
                Assert::UnitAbsent {
                    app: self.app_name.clone(),
                    unit: self.unit_name.to_string(),
                },
            ]),
            update: DocUpdate::PushUnits {
                app: self.app_name.clone(),
                units: vec![self.unit_name.to_string()],
            },
        }))
    }
}

struct AssignAllUnits<'a> {
    branch: &'a mut Branch,
    app_name: &'a str,
}

impl<'a, S: BranchStore> Propose<S> for AssignAllUnits<'a> {
    async fn propose(&mut self, store: &S, attempt: u32) -> Result<Proposal, GenerationError> {
        if attempt > 0 {
            self.branch.refresh(store).await?;
        }
        self.branch.check_not_complete()?;

        let app = store.application(self.app_name).await?;
        let unit_names = store.unit_names(self.app_name).await?;

        let assigned = self.branch.doc.assigned_units.get(self.app_name);
        let missing: Vec<String> = unit_names
            .iter()
            .filter(|name| !assigned.is_some_and(|units| units.contains(*name)))
            .cloned()
            .collect();

        // Nothing new to stage, including the zero-unit application case.
        if missing.is_empty() {
            return Ok(Proposal::NoOp);
        }

        // Pin both ends of the computation: the application must still look
        // the way it did when the unit list was read, and none of the units
        // we are about to add may have been staged by another writer.
        let mut asserts = vec![
            Assert::Open,
            Assert::ApplicationStable {
                app: self.app_name.to_string(),
                unit_count: app.unit_count,
            },
        ];
        asserts.extend(missing.iter().map(|unit| Assert::UnitAbsent {
            app: self.app_name.to_string(),
            unit: unit.clone(),
        }));

        Ok(Proposal::Write(Operation::Update {
            id: self.branch.doc.id.clone(),
            condition: Condition::new(asserts),
            update: DocUpdate::PushUnits {
                app: self.app_name.to_string(),
                units: missing,
            },
        }))
    }
}

impl Branch {
    /// Stages an application into this branch with no units opted in yet.
    /// No-op when the application is already staged.
    pub async fn assign_application(
        &mut self,
        store: &impl BranchStore,
        app_name: &str,
    ) -> Result<(), GenerationError> {
        TransactionRunner::default()
            .run(store, &mut AssignApplication { branch: self, app_name })
            .await?;
        self.refresh(store).await
    }

    /// Stages a single unit, deriving the owning application from its name.
    /// No-op when the unit is already staged.
    pub async fn assign_unit(
        &mut self,
        store: &impl BranchStore,
        unit_name: &str,
    ) -> Result<(), GenerationError> {
        let app_name = names::unit_application(unit_name)?;

        TransactionRunner::default()
            .run(
                store,
                &mut AssignUnit {
                    branch: self,
                    app_name,
                    unit_name,
                },
            )
            .await?;
        self.refresh(store).await
    }

    /// Stages every unit of the application that is not already staged,
    /// based on current membership. No-op when there is nothing to add.
    pub async fn assign_all_units(
        &mut self,
        store: &impl BranchStore,
        app_name: &str,
    ) -> Result<(), GenerationError> {
        TransactionRunner::default()
            .run(store, &mut AssignAllUnits { branch: self, app_name })
            .await?;
        self.refresh(store).await
    }
}
