use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octolab_domain::{
    EvidenceEvent, EvidenceSealStatus, EvidenceState, Lab, LabId, LabStatus, OwnerId, RecipeId,
    RuntimeKind, SubprocessRun,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::StateStore;

// DDL — idempotent; run at every startup via migrate().
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS labs (
    id                          UUID PRIMARY KEY,
    owner_id                    UUID NOT NULL,
    recipe_id                   UUID NOT NULL,
    status                      TEXT NOT NULL,
    runtime                     TEXT NOT NULL,
    runtime_meta                JSONB NOT NULL,
    requested_intent            JSONB NOT NULL,
    novnc_host_port             INTEGER UNIQUE,
    expires_at                  TIMESTAMPTZ,
    connection_url              TEXT,
    evidence_state              TEXT NOT NULL,
    evidence_finalized_at       TIMESTAMPTZ,
    evidence_purged_at          TIMESTAMPTZ,
    evidence_sealed_at          TIMESTAMPTZ,
    evidence_expires_at         TIMESTAMPTZ,
    evidence_manifest_sha256    TEXT,
    evidence_seal_status        TEXT NOT NULL,
    created_at                  TIMESTAMPTZ NOT NULL,
    updated_at                  TIMESTAMPTZ NOT NULL,
    finished_at                 TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_labs_owner ON labs (owner_id);
CREATE INDEX IF NOT EXISTS idx_labs_status ON labs (status);
CREATE INDEX IF NOT EXISTS idx_labs_retention
    ON labs (evidence_expires_at) WHERE evidence_purged_at IS NULL;

CREATE TABLE IF NOT EXISTS evidence_events (
    event_hash      TEXT PRIMARY KEY,
    lab_id          UUID NOT NULL,
    event_type      TEXT NOT NULL,
    container_name  TEXT,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evidence_events_lab ON evidence_events (lab_id, occurred_at);

CREATE TABLE IF NOT EXISTS subprocess_runs (
    id           UUID PRIMARY KEY,
    lab_id       UUID NOT NULL,
    operation    TEXT NOT NULL,
    started_at   TIMESTAMPTZ NOT NULL,
    finished_at  TIMESTAMPTZ,
    exit_code    INTEGER,
    log          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subprocess_runs_lab ON subprocess_runs (lab_id, started_at DESC);
"#;

/// Persistent state store backed by PostgreSQL. All tables are created
/// automatically on first connect via [`PostgresStore::connect`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| StoreError::Internal(format!("postgres connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration: {e}")))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LabRow {
    id: Uuid,
    owner_id: Uuid,
    recipe_id: Uuid,
    status: String,
    runtime: String,
    runtime_meta: serde_json::Value,
    requested_intent: serde_json::Value,
    novnc_host_port: Option<i32>,
    expires_at: Option<DateTime<Utc>>,
    connection_url: Option<String>,
    evidence_state: String,
    evidence_finalized_at: Option<DateTime<Utc>>,
    evidence_purged_at: Option<DateTime<Utc>>,
    evidence_sealed_at: Option<DateTime<Utc>>,
    evidence_expires_at: Option<DateTime<Utc>>,
    evidence_manifest_sha256: Option<String>,
    evidence_seal_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl LabRow {
    fn into_lab(self) -> Result<Lab, StoreError> {
        Ok(Lab {
            id: LabId(self.id),
            owner_id: OwnerId(self.owner_id),
            recipe_id: RecipeId(self.recipe_id),
            status: parse_status(&self.status)?,
            runtime: parse_runtime(&self.runtime)?,
            runtime_meta: serde_json::from_value(self.runtime_meta)?,
            requested_intent: self.requested_intent,
            novnc_host_port: self.novnc_host_port.map(|p| p as u16),
            expires_at: self.expires_at,
            connection_url: self.connection_url,
            evidence_state: parse_evidence_state(&self.evidence_state)?,
            evidence_finalized_at: self.evidence_finalized_at,
            evidence_purged_at: self.evidence_purged_at,
            evidence_sealed_at: self.evidence_sealed_at,
            evidence_expires_at: self.evidence_expires_at,
            evidence_manifest_sha256: self.evidence_manifest_sha256,
            evidence_seal_status: parse_seal_status(&self.evidence_seal_status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

fn parse_status(raw: &str) -> Result<LabStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Internal(format!("corrupt lab status {raw}: {e}")))
}

fn parse_runtime(raw: &str) -> Result<RuntimeKind, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Internal(format!("corrupt runtime kind {raw}: {e}")))
}

fn parse_evidence_state(raw: &str) -> Result<EvidenceState, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Internal(format!("corrupt evidence state {raw}: {e}")))
}

fn parse_seal_status(raw: &str) -> Result<EvidenceSealStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Internal(format!("corrupt evidence seal status {raw}: {e}")))
}

fn status_str(s: LabStatus) -> String {
    serde_json::to_value(s).unwrap().as_str().unwrap().to_string()
}

fn runtime_str(r: RuntimeKind) -> String {
    serde_json::to_value(r).unwrap().as_str().unwrap().to_string()
}

fn evidence_state_str(s: EvidenceState) -> String {
    serde_json::to_value(s).unwrap().as_str().unwrap().to_string()
}

fn seal_status_str(s: EvidenceSealStatus) -> String {
    serde_json::to_value(s).unwrap().as_str().unwrap().to_string()
}

const LAB_COLUMNS: &str = "id, owner_id, recipe_id, status, runtime, runtime_meta, \
     requested_intent, novnc_host_port, expires_at, connection_url, evidence_state, \
     evidence_finalized_at, evidence_purged_at, evidence_sealed_at, evidence_expires_at, \
     evidence_manifest_sha256, evidence_seal_status, created_at, updated_at, finished_at";

#[async_trait]
impl StateStore for PostgresStore {
    async fn get_lab(&self, id: &LabId) -> Result<Option<Lab>, StoreError> {
        let row = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.map(LabRow::into_lab).transpose()
    }

    async fn list_labs_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Lab>, StoreError> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE owner_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(LabRow::into_lab).collect()
    }

    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let runtime_meta = serde_json::to_value(&lab.runtime_meta)?;
        sqlx::query(&format!(
            "INSERT INTO labs ({LAB_COLUMNS}) VALUES \
             ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)"
        ))
        .bind(lab.id.as_uuid())
        .bind(lab.owner_id.0)
        .bind(lab.recipe_id.0)
        .bind(status_str(lab.status))
        .bind(runtime_str(lab.runtime))
        .bind(&runtime_meta)
        .bind(&lab.requested_intent)
        .bind(lab.novnc_host_port.map(|p| p as i32))
        .bind(lab.expires_at)
        .bind(&lab.connection_url)
        .bind(evidence_state_str(lab.evidence_state))
        .bind(lab.evidence_finalized_at)
        .bind(lab.evidence_purged_at)
        .bind(lab.evidence_sealed_at)
        .bind(lab.evidence_expires_at)
        .bind(&lab.evidence_manifest_sha256)
        .bind(seal_status_str(lab.evidence_seal_status))
        .bind(lab.created_at)
        .bind(lab.updated_at)
        .bind(lab.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn update_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let runtime_meta = serde_json::to_value(&lab.runtime_meta)?;
        let result = sqlx::query(
            "UPDATE labs SET
                status = $2, runtime_meta = $3, requested_intent = $4,
                novnc_host_port = $5, expires_at = $6, connection_url = $7,
                evidence_state = $8, evidence_finalized_at = $9,
                evidence_purged_at = $10, evidence_sealed_at = $11,
                evidence_expires_at = $12, evidence_manifest_sha256 = $13,
                evidence_seal_status = $14, updated_at = $15, finished_at = $16
             WHERE id = $1",
        )
        .bind(lab.id.as_uuid())
        .bind(status_str(lab.status))
        .bind(&runtime_meta)
        .bind(&lab.requested_intent)
        .bind(lab.novnc_host_port.map(|p| p as i32))
        .bind(lab.expires_at)
        .bind(&lab.connection_url)
        .bind(evidence_state_str(lab.evidence_state))
        .bind(lab.evidence_finalized_at)
        .bind(lab.evidence_purged_at)
        .bind(lab.evidence_sealed_at)
        .bind(lab.evidence_expires_at)
        .bind(&lab.evidence_manifest_sha256)
        .bind(seal_status_str(lab.evidence_seal_status))
        .bind(lab.updated_at)
        .bind(lab.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LabNotFound(lab.id.to_string()));
        }
        Ok(())
    }

    async fn list_all_lab_ids(&self) -> Result<Vec<LabId>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM labs")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(rows.into_iter().map(|(id,)| LabId(id)).collect())
    }

    async fn list_expirable_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>, StoreError> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs
             WHERE status IN ('ready', 'degraded')
               AND expires_at IS NOT NULL
               AND expires_at <= $1
             ORDER BY expires_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(LabRow::into_lab).collect()
    }

    async fn claim_ending_labs(&self, batch_size: u32) -> Result<Vec<Lab>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE status = 'ending'
             ORDER BY updated_at
             LIMIT $1
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(LabRow::into_lab).collect()
    }

    async fn claim_stuck_ending_labs(
        &self,
        stuck_since: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE status = 'ending' AND updated_at < $1
             ORDER BY updated_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(stuck_since)
        .bind(max_labs as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(LabRow::into_lab).collect()
    }

    async fn list_labs_for_retention(
        &self,
        now: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs
             WHERE evidence_purged_at IS NULL
               AND evidence_expires_at IS NOT NULL
               AND evidence_expires_at <= $1
             ORDER BY evidence_expires_at
             LIMIT $2"
        ))
        .bind(now)
        .bind(max_labs as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter().map(LabRow::into_lab).collect()
    }

    async fn try_allocate_port(
        &self,
        lab_id: &LabId,
        owner_id: &OwnerId,
        port: u16,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE labs SET novnc_host_port = $1
             WHERE id = $2 AND owner_id = $3 AND novnc_host_port IS NULL",
        )
        .bind(port as i32)
        .bind(lab_id.as_uuid())
        .bind(owner_id.0)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            // Another lab already holds this port: expected, caller retries
            // with a different candidate, not a hard failure.
            Err(sqlx::Error::Database(ref db_err)) if db_err.code().as_deref() == Some("23505") => {
                Ok(false)
            }
            Err(e) => Err(StoreError::Internal(e.to_string())),
        }
    }

    async fn release_port(
        &self,
        lab_id: &LabId,
        owner_id: Option<&OwnerId>,
    ) -> Result<bool, StoreError> {
        let result = match owner_id {
            Some(owner_id) => {
                sqlx::query(
                    "UPDATE labs SET novnc_host_port = NULL
                     WHERE id = $1 AND owner_id = $2 AND novnc_host_port IS NOT NULL",
                )
                .bind(lab_id.as_uuid())
                .bind(owner_id.0)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE labs SET novnc_host_port = NULL
                     WHERE id = $1 AND novnc_host_port IS NOT NULL",
                )
                .bind(lab_id.as_uuid())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_evidence_event(&self, event: &EvidenceEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO evidence_events
                (event_hash, lab_id, event_type, container_name, occurred_at, payload)
             VALUES ($1, $2, $3, $4, $5, $6::jsonb)
             ON CONFLICT (event_hash) DO NOTHING",
        )
        .bind(&event.event_hash)
        .bind(event.lab_id.as_uuid())
        .bind(&event.event_type)
        .bind(&event.container_name)
        .bind(event.timestamp)
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_evidence_events(&self, lab_id: &LabId) -> Result<Vec<EvidenceEvent>, StoreError> {
        let rows: Vec<(String, Uuid, String, Option<String>, DateTime<Utc>, serde_json::Value)> =
            sqlx::query_as(
                "SELECT event_hash, lab_id, event_type, container_name, occurred_at, payload
                 FROM evidence_events WHERE lab_id = $1 ORDER BY occurred_at",
            )
            .bind(lab_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(
                |(event_hash, lab_id, event_type, container_name, timestamp, payload)| {
                    EvidenceEvent {
                        event_hash,
                        lab_id: LabId(lab_id),
                        event_type,
                        container_name,
                        timestamp,
                        payload,
                    }
                },
            )
            .collect())
    }

    async fn upsert_subprocess_run(&self, run: &SubprocessRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subprocess_runs
                (id, lab_id, operation, started_at, finished_at, exit_code, log)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                exit_code = EXCLUDED.exit_code,
                log = EXCLUDED.log",
        )
        .bind(run.id)
        .bind(run.lab_id.as_uuid())
        .bind(&run.operation)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.exit_code)
        .bind(&run.log)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_subprocess_runs(&self, lab_id: &LabId) -> Result<Vec<SubprocessRun>, StoreError> {
        let rows: Vec<(Uuid, Uuid, String, DateTime<Utc>, Option<DateTime<Utc>>, Option<i32>, String)> =
            sqlx::query_as(
                "SELECT id, lab_id, operation, started_at, finished_at, exit_code, log
                 FROM subprocess_runs WHERE lab_id = $1 ORDER BY started_at DESC LIMIT 100",
            )
            .bind(lab_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(
                |(id, lab_id, operation, started_at, finished_at, exit_code, log)| SubprocessRun {
                    id,
                    lab_id: LabId(lab_id),
                    operation,
                    started_at,
                    finished_at,
                    exit_code,
                    log,
                },
            )
            .collect())
    }
}
