//! Execution unit rows: atomic create-by-name, owner lookups, phase updates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{Db, next_version, notify};
use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;
use crate::storage::UnitClient;

const UNIT_COLUMNS: &str =
    "namespace, name, uid, version, created_at, owner_name, owner_uid, labels, spec, phase";

impl Db {
    pub(super) async fn fetch_units(&self) -> Result<Vec<ExecutionUnit>> {
        let rows: Vec<UnitRow> = sqlx::query_as(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units ORDER BY namespace, name"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(UnitRow::try_into_unit).collect()
    }

    pub(super) async fn fetch_unit(&self, key: &ObjectKey) -> Result<ExecutionUnit> {
        let row: Option<UnitRow> = sqlx::query_as(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units WHERE namespace = $1 AND name = $2"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("execution unit {key}")))?
            .try_into_unit()
    }

    pub(super) async fn update_unit_phase(
        &self,
        key: &ObjectKey,
        phase: UnitPhase,
    ) -> Result<ExecutionUnit> {
        let mut tx = self.pool().begin().await?;
        let row: Option<UnitRow> = sqlx::query_as(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units
             WHERE namespace = $1 AND name = $2 FOR UPDATE"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?;
        let current = row
            .ok_or_else(|| Error::NotFound(format!("execution unit {key}")))?
            .try_into_unit()?;
        if current.phase == phase {
            return Ok(current);
        }
        if !current.phase.can_transition_to(phase) {
            return Err(Error::Invalid(format!(
                "unit {key} cannot move from {} to {phase}",
                current.phase
            )));
        }

        let version = next_version(&mut tx).await?;
        let row: UnitRow = sqlx::query_as(&format!(
            "UPDATE execution_units SET phase = $1, version = $2
             WHERE namespace = $3 AND name = $4
             RETURNING {UNIT_COLUMNS}"
        ))
        .bind(phase.to_string())
        .bind(version.0 as i64)
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_one(&mut *tx)
        .await?;
        let unit = row.try_into_unit()?;
        notify(&mut tx, &WatchEvent::applied(Object::Unit(unit.clone()))).await?;
        tx.commit().await?;
        Ok(unit)
    }
}

/// Delete every unit owned by `owner`, returning what was removed.
pub(super) async fn take_owned(
    conn: &mut PgConnection,
    owner: &OwnerRef,
) -> Result<Vec<ExecutionUnit>> {
    let rows: Vec<UnitRow> = sqlx::query_as(&format!(
        "DELETE FROM execution_units
         WHERE namespace = $1 AND owner_name = $2 AND owner_uid = $3
         RETURNING {UNIT_COLUMNS}"
    ))
    .bind(&owner.key.namespace)
    .bind(&owner.key.name)
    .bind(owner.uid)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(UnitRow::try_into_unit).collect()
}

#[async_trait]
impl UnitClient for Db {
    async fn create_unit(&self, new: NewUnit) -> Result<ExecutionUnit> {
        if new.key.namespace != new.owner.key.namespace {
            return Err(Error::Invalid(format!(
                "unit {} must live in its owner's namespace {}",
                new.key, new.owner.key.namespace
            )));
        }
        let mut tx = self.pool().begin().await?;

        // Hold the owner row so a concurrent delete cannot slip in between.
        let owner: Option<(Uuid,)> = sqlx::query_as(
            "SELECT uid FROM work_requests WHERE namespace = $1 AND name = $2 FOR SHARE",
        )
        .bind(&new.owner.key.namespace)
        .bind(&new.owner.key.name)
        .fetch_optional(&mut *tx)
        .await?;
        if owner.map(|(uid,)| uid) != Some(new.owner.uid) {
            return Err(Error::NotFound(format!(
                "owner {} ({})",
                new.owner.key, new.owner.uid
            )));
        }

        let version = next_version(&mut tx).await?;
        let row: Option<UnitRow> = sqlx::query_as(&format!(
            "INSERT INTO execution_units
                 (namespace, name, uid, version, owner_name, owner_uid, labels, spec, phase)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (namespace, name) DO NOTHING
             RETURNING {UNIT_COLUMNS}"
        ))
        .bind(&new.key.namespace)
        .bind(&new.key.name)
        .bind(Uuid::new_v4())
        .bind(version.0 as i64)
        .bind(&new.owner.key.name)
        .bind(new.owner.uid)
        .bind(serde_json::to_value(&new.labels)?)
        .bind(serde_json::to_value(&new.spec)?)
        .bind(UnitPhase::Pending.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(Error::AlreadyExists(new.key));
        };
        let unit = row.try_into_unit()?;
        notify(&mut tx, &WatchEvent::applied(Object::Unit(unit.clone()))).await?;
        tx.commit().await?;
        Ok(unit)
    }

    async fn list_owned_units(&self, owner: &OwnerRef) -> Result<Vec<ExecutionUnit>> {
        let rows: Vec<UnitRow> = sqlx::query_as(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units
             WHERE namespace = $1 AND owner_name = $2 AND owner_uid = $3
             ORDER BY name"
        ))
        .bind(&owner.key.namespace)
        .bind(&owner.key.name)
        .bind(owner.uid)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(UnitRow::try_into_unit).collect()
    }

    async fn delete_unit(&self, key: &ObjectKey) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let row: Option<UnitRow> = sqlx::query_as(&format!(
            "DELETE FROM execution_units WHERE namespace = $1 AND name = $2
             RETURNING {UNIT_COLUMNS}"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!("execution unit {key}")));
        };
        let mut unit = row.try_into_unit()?;
        unit.version = next_version(&mut tx).await?;
        notify(&mut tx, &WatchEvent::deleted(Object::Unit(unit))).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    namespace: String,
    name: String,
    uid: Uuid,
    version: i64,
    created_at: DateTime<Utc>,
    owner_name: String,
    owner_uid: Uuid,
    labels: serde_json::Value,
    spec: serde_json::Value,
    phase: String,
}

impl UnitRow {
    fn try_into_unit(self) -> Result<ExecutionUnit> {
        let labels: BTreeMap<String, String> = serde_json::from_value(self.labels)?;
        Ok(ExecutionUnit {
            owner: OwnerRef {
                key: ObjectKey::new(&self.namespace, self.owner_name),
                uid: self.owner_uid,
            },
            key: ObjectKey::new(self.namespace, self.name),
            uid: self.uid,
            version: ResourceVersion(self.version as u64),
            created_at: self.created_at,
            labels,
            spec: serde_json::from_value(self.spec)?,
            phase: self.phase.parse()?,
        })
    }
}
