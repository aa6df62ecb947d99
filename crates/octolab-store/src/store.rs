use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octolab_domain::{EvidenceEvent, Lab, LabId, OwnerId, SubprocessRun};

use crate::error::StoreError;

/// Persistence seam for the whole lifecycle core. One implementation backed
/// by Postgres for production, one in-memory for tests and local dev —
/// both behind `Arc<dyn StateStore>` so `octolab-core` and `octolab-api`
/// never know which is live.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get_lab(&self, id: &LabId) -> Result<Option<Lab>, StoreError>;
    async fn list_labs_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Lab>, StoreError>;
    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError>;
    async fn update_lab(&self, lab: &Lab) -> Result<(), StoreError>;

    /// Every lab id in the store, regardless of owner or status. Used by the
    /// GC sweep to tell live labs apart from orphaned on-disk resources.
    async fn list_all_lab_ids(&self) -> Result<Vec<LabId>, StoreError>;

    /// READY/DEGRADED labs whose `expires_at` has passed — the GC sweep's
    /// view of labs that outlived their rehearsal window without an
    /// explicit stop.
    async fn list_expirable_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>, StoreError>;

    /// Atomically claim up to `batch_size` labs in `ending` status for the
    /// Teardown Worker, using `FOR UPDATE SKIP LOCKED` so concurrent worker
    /// instances never double-process the same lab.
    async fn claim_ending_labs(&self, batch_size: u32) -> Result<Vec<Lab>, StoreError>;

    /// Claim `ending` labs whose `updated_at` is older than `stuck_since` —
    /// the Watchdog's view of labs the Teardown Worker appears to have
    /// dropped. Bounded by `max_labs`.
    async fn claim_stuck_ending_labs(
        &self,
        stuck_since: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError>;

    /// Terminal labs whose evidence has not yet been purged and whose
    /// `evidence_expires_at` has passed.
    async fn list_labs_for_retention(
        &self,
        now: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError>;

    /// Conditionally set `labs.novnc_host_port = port` for `lab_id`, scoped
    /// to `owner_id`, only if the lab currently holds no port. Returns
    /// `false` (not an error) both when the lab already holds a different
    /// port and when `port` is already held by some other lab — the
    /// allocator retries with a new candidate port in both cases.
    async fn try_allocate_port(
        &self,
        lab_id: &LabId,
        owner_id: &OwnerId,
        port: u16,
    ) -> Result<bool, StoreError>;

    /// Clear `labs.novnc_host_port`, optionally scoped to `owner_id`.
    /// Returns whether a row was actually modified — idempotent, calling
    /// twice is safe and returns `false` the second time.
    async fn release_port(
        &self,
        lab_id: &LabId,
        owner_id: Option<&OwnerId>,
    ) -> Result<bool, StoreError>;

    /// Insert an evidence event. Returns `false` if an event with the same
    /// `event_hash` already existed (idempotent ingest) rather than erroring.
    async fn append_evidence_event(&self, event: &EvidenceEvent) -> Result<bool, StoreError>;

    async fn list_evidence_events(&self, lab_id: &LabId) -> Result<Vec<EvidenceEvent>, StoreError>;

    async fn upsert_subprocess_run(&self, run: &SubprocessRun) -> Result<(), StoreError>;

    async fn list_subprocess_runs(&self, lab_id: &LabId) -> Result<Vec<SubprocessRun>, StoreError>;
}
