//! Work request rows: create, read, version-guarded status writes, cascade delete.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Db, next_version, notify};
use crate::error::{Error, Result};
use crate::event::WatchEvent;
use crate::model::*;
use crate::storage::RequestClient;

const REQUEST_COLUMNS: &str =
    "namespace, name, uid, generation, version, created_at, spec, status";

impl Db {
    pub(super) async fn insert_request(&self, new: NewWorkRequest) -> Result<WorkRequest> {
        if new.key.namespace.is_empty() || new.key.name.is_empty() {
            return Err(Error::Invalid(format!(
                "work request needs a namespace and a name, got '{}'",
                new.key
            )));
        }
        let mut tx = self.pool().begin().await?;
        let version = next_version(&mut tx).await?;

        // Atomic create-by-name: a taken name inserts nothing.
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "INSERT INTO work_requests (namespace, name, uid, version, spec, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (namespace, name) DO NOTHING
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(&new.key.namespace)
        .bind(&new.key.name)
        .bind(Uuid::new_v4())
        .bind(version.0 as i64)
        .bind(serde_json::to_value(&new.spec)?)
        .bind(serde_json::to_value(RequestStatus::default())?)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(Error::AlreadyExists(new.key));
        };
        let request = row.try_into_request()?;
        notify(&mut tx, &WatchEvent::applied(Object::Request(request.clone()))).await?;
        tx.commit().await?;
        Ok(request)
    }

    pub(super) async fn fetch_requests(&self) -> Result<Vec<WorkRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM work_requests ORDER BY namespace, name"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(RequestRow::try_into_request).collect()
    }

    /// Delete a request and every unit it owns in one transaction.
    pub(super) async fn remove_request(&self, key: &ObjectKey) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM work_requests
             WHERE namespace = $1 AND name = $2 FOR UPDATE"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!("work request {key}")));
        };
        let mut request = row.try_into_request()?;

        // Units go first and explicitly so each gets a delete event; the
        // foreign key cascade would remove them silently.
        let units = super::units::take_owned(&mut tx, &OwnerRef::of(&request)).await?;
        for mut unit in units {
            unit.version = next_version(&mut tx).await?;
            notify(&mut tx, &WatchEvent::deleted(Object::Unit(unit))).await?;
        }
        sqlx::query("DELETE FROM work_requests WHERE namespace = $1 AND name = $2")
            .bind(&key.namespace)
            .bind(&key.name)
            .execute(&mut *tx)
            .await?;
        request.version = next_version(&mut tx).await?;
        notify(&mut tx, &WatchEvent::deleted(Object::Request(request))).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RequestClient for Db {
    async fn get_request(&self, key: &ObjectKey) -> Result<WorkRequest> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM work_requests WHERE namespace = $1 AND name = $2"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("work request {key}")))?
            .try_into_request()
    }

    async fn update_request_status(
        &self,
        key: &ObjectKey,
        expected: ResourceVersion,
        status: RequestStatus,
    ) -> Result<WorkRequest> {
        let mut tx = self.pool().begin().await?;
        let version = next_version(&mut tx).await?;
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "UPDATE work_requests SET status = $1, version = $2
             WHERE namespace = $3 AND name = $4 AND version = $5
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(serde_json::to_value(&status)?)
        .bind(version.0 as i64)
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(expected.0 as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let exists: Option<(i64,)> = sqlx::query_as(
                "SELECT version FROM work_requests WHERE namespace = $1 AND name = $2",
            )
            .bind(&key.namespace)
            .bind(&key.name)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match exists {
                Some(_) => Error::VersionConflict {
                    key: key.clone(),
                    expected,
                },
                None => Error::NotFound(format!("work request {key}")),
            });
        };
        let request = row.try_into_request()?;
        notify(&mut tx, &WatchEvent::applied(Object::Request(request.clone()))).await?;
        tx.commit().await?;
        Ok(request)
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    namespace: String,
    name: String,
    uid: Uuid,
    generation: i64,
    version: i64,
    created_at: DateTime<Utc>,
    spec: serde_json::Value,
    status: serde_json::Value,
}

impl RequestRow {
    fn try_into_request(self) -> Result<WorkRequest> {
        Ok(WorkRequest {
            key: ObjectKey::new(self.namespace, self.name),
            uid: self.uid,
            generation: self.generation as u64,
            version: ResourceVersion(self.version as u64),
            created_at: self.created_at,
            spec: serde_json::from_value(self.spec)?,
            status: serde_json::from_value(self.status)?,
        })
    }
}
