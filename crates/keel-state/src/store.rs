//! StateStore — redb-backed state persistence for keel.
//!
//! Provides typed operations over pipeline runs, the manifest repository,
//! sync records, scaling decisions and sequences. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Manifest writes are compare-and-swap: the version check and the write
//! happen inside one redb write transaction, and redb serializes write
//! transactions, so two writers with the same expected version cannot both
//! succeed.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use keel_core::ManifestDocument;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Bumped after every manifest commit.
    manifest_rev: Arc<watch::Sender<u64>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            db: Arc::new(db),
            manifest_rev: Arc::new(tx),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(MANIFESTS).map_err(map_err!(Table))?;
        txn.open_table(MANIFEST_HISTORY).map_err(map_err!(Table))?;
        txn.open_table(SYNC_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(SCALING_DECISIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Sequences ──────────────────────────────────────────────────

    /// Allocate the next value of a named counter. The first value is 1.
    pub fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let current = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    /// Insert or update a run record.
    pub fn put_run(&self, run: &PipelineRun) -> StateResult<()> {
        let key = format!("{:020}", run.id);
        self.put_json(RUNS, &key, run)?;
        debug!(run_id = run.id, status = ?run.status, "run stored");
        Ok(())
    }

    pub fn get_run(&self, id: RunId) -> StateResult<Option<PipelineRun>> {
        self.get_json(RUNS, &format!("{id:020}"))
    }

    /// List runs, newest first, optionally filtered by workload.
    pub fn list_runs(&self, workload: Option<&str>, limit: usize) -> StateResult<Vec<PipelineRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: PipelineRun =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if workload.is_none_or(|w| run.revision.workload == w) {
                results.push(run);
            }
        }
        Ok(results)
    }

    // ── Manifest repository ────────────────────────────────────────

    /// Current manifest for a workload, if any has been committed.
    pub fn read_manifest(&self, workload: &str) -> StateResult<Option<VersionedManifest>> {
        self.get_json(MANIFESTS, workload)
    }

    /// List the current manifest of every workload.
    pub fn list_manifests(&self) -> StateResult<Vec<VersionedManifest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MANIFESTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Commit `document` if the workload's current version equals
    /// `expected_version` (0 for "no document yet"). Returns the new version.
    pub fn compare_and_swap_manifest(
        &self,
        document: &ManifestDocument,
        expected_version: u64,
        author: &str,
        now: u64,
    ) -> StateResult<u64> {
        let workload = document.workload.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut current_table = txn.open_table(MANIFESTS).map_err(map_err!(Table))?;
            let actual = match current_table.get(workload).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: VersionedManifest =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.version
                }
                None => 0,
            };
            if actual != expected_version {
                debug!(%workload, expected_version, actual, "manifest write rejected");
                return Err(StateError::Conflict {
                    expected: expected_version,
                    actual,
                });
            }

            version = actual + 1;
            let record = VersionedManifest {
                document: document.clone(),
                version,
                author: author.to_string(),
                committed_at: now,
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            current_table
                .insert(workload, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut history = txn.open_table(MANIFEST_HISTORY).map_err(map_err!(Table))?;
            history
                .insert(seq_key(workload, version).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.manifest_rev.send_modify(|rev| *rev += 1);
        debug!(%workload, version, %author, "manifest committed");
        Ok(version)
    }

    /// All committed versions of a workload's manifest, oldest first.
    pub fn manifest_history(&self, workload: &str) -> StateResult<Vec<VersionedManifest>> {
        self.list_prefixed(MANIFEST_HISTORY, workload, usize::MAX)
            .map(|mut v| {
                v.reverse();
                v
            })
    }

    /// Subscribe to manifest commits. The value is a commit counter.
    pub fn subscribe_manifests(&self) -> watch::Receiver<u64> {
        self.manifest_rev.subscribe()
    }

    // ── Sync records ───────────────────────────────────────────────

    /// Append a sync record, assigning its sequence number, and drop the
    /// oldest records of the set beyond `retain`.
    pub fn append_sync_record(
        &self,
        record: &mut ReconcileSyncRecord,
        retain: usize,
    ) -> StateResult<()> {
        record.seq = self.next_sequence(&format!("sync:{}", record.set))?;
        let key = seq_key(&record.set, record.seq);
        self.put_json(SYNC_RECORDS, &key, record)?;
        self.trim_prefixed(SYNC_RECORDS, &record.set, retain)?;
        Ok(())
    }

    /// Sync records of a set, newest first.
    pub fn list_sync_records(&self, set: &str, limit: usize) -> StateResult<Vec<ReconcileSyncRecord>> {
        self.list_prefixed(SYNC_RECORDS, set, limit)
    }

    // ── Scaling decisions ──────────────────────────────────────────

    /// Append a scaling decision, assigning its sequence number, and drop
    /// the workload's oldest decisions beyond `retain`.
    pub fn append_scaling_decision(
        &self,
        decision: &mut ScalingDecision,
        retain: usize,
    ) -> StateResult<()> {
        decision.seq = self.next_sequence(&format!("scaling:{}", decision.workload))?;
        let key = seq_key(&decision.workload, decision.seq);
        self.put_json(SCALING_DECISIONS, &key, decision)?;
        self.trim_prefixed(SCALING_DECISIONS, &decision.workload, retain)?;
        Ok(())
    }

    /// Scaling decisions of a workload, newest first.
    pub fn list_scaling_decisions(
        &self,
        workload: &str,
        limit: usize,
    ) -> StateResult<Vec<ScalingDecision>> {
        self.list_prefixed(SCALING_DECISIONS, workload, limit)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn put_json<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Values keyed `{prefix}:{seq}`, newest (highest key) first.
    fn list_prefixed<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
        limit: usize,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            if owned_by(key.value(), prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    /// Keep only the newest `retain` entries keyed `{prefix}:{seq}`.
    fn trim_prefixed(
        &self,
        def: JsonTable,
        prefix: &str,
        retain: usize,
    ) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    owned_by(&k, prefix).then_some(k)
                })
                .collect()
        };
        if keys.len() <= retain {
            return Ok(0);
        }
        let stale = &keys[..keys.len() - retain];
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for key in stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%prefix, removed = stale.len(), "trimmed history");
        Ok(stale.len() as u32)
    }
}

fn owned_by(key: &str, prefix: &str) -> bool {
    split_seq_key(key).is_some_and(|(owner, _)| owner == prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ArtifactRef, Revision};
    use std::collections::BTreeMap;

    fn manifest(tag: &str) -> ManifestDocument {
        ManifestDocument {
            workload: "api".to_string(),
            artifact: ArtifactRef::new("registry.local/api", tag),
            scaling: None,
            resources: Vec::new(),
        }
    }

    fn sync_record(set: &str) -> ReconcileSyncRecord {
        ReconcileSyncRecord {
            seq: 0,
            set: set.to_string(),
            timestamp: 1000,
            status: SyncStatus::InSync,
            manifest_versions: BTreeMap::new(),
            diff: DiffSummary::default(),
            cause: None,
            applied: Vec::new(),
            pruned: Vec::new(),
            unmanaged: Vec::new(),
            failures: Vec::new(),
            waves_completed: 0,
            message: None,
        }
    }

    fn decision(workload: &str) -> ScalingDecision {
        ScalingDecision {
            seq: 0,
            workload: workload.to_string(),
            timestamp: 1000,
            observed_metric: 80.0,
            target_metric: 40.0,
            current_replicas: 2,
            computed_replicas: 4,
            chosen_replicas: 2,
            action: ScalingAction::NoChange,
        }
    }

    // ── Sequences ──────────────────────────────────────────────────

    #[test]
    fn sequences_are_monotonic_and_independent() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_sequence("runs").unwrap(), 1);
        assert_eq!(store.next_sequence("runs").unwrap(), 2);
        assert_eq!(store.next_sequence("artifact:api").unwrap(), 1);
        assert_eq!(store.next_sequence("runs").unwrap(), 3);
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn run_put_get_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, workload) in [(1, "api"), (2, "worker"), (3, "api")] {
            let run = PipelineRun::new(id, Revision::new(workload, "abc", id), Vec::new(), 1000);
            store.put_run(&run).unwrap();
        }

        assert_eq!(store.get_run(2).unwrap().unwrap().revision.workload, "worker");
        assert!(store.get_run(99).unwrap().is_none());

        let api_runs = store.list_runs(Some("api"), 10).unwrap();
        assert_eq!(api_runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(store.list_runs(None, 2).unwrap().len(), 2);
    }

    // ── Manifests ──────────────────────────────────────────────────

    #[test]
    fn manifest_cas_accepts_expected_version() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.read_manifest("api").unwrap().is_none());

        let v1 = store.compare_and_swap_manifest(&manifest("v1"), 0, "ops", 1000).unwrap();
        assert_eq!(v1, 1);
        let v2 = store.compare_and_swap_manifest(&manifest("v2"), 1, "run/1", 1001).unwrap();
        assert_eq!(v2, 2);

        let current = store.read_manifest("api").unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.document.artifact.tag, "v2");
        assert_eq!(current.author, "run/1");
    }

    #[test]
    fn manifest_cas_rejects_stale_writer() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, tag) in ["v1", "v2", "v3", "v4", "v5"].iter().enumerate() {
            store
                .compare_and_swap_manifest(&manifest(tag), i as u64, "ops", 1000)
                .unwrap();
        }

        // Writer A read version 5; writer B commits version 6 first.
        store.compare_and_swap_manifest(&manifest("b"), 5, "writer-b", 1001).unwrap();
        let err = store
            .compare_and_swap_manifest(&manifest("a"), 5, "writer-a", 1002)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 5, actual: 6 }));

        // A retries against version 6.
        assert_eq!(
            store.compare_and_swap_manifest(&manifest("a"), 6, "writer-a", 1003).unwrap(),
            7
        );
    }

    #[test]
    fn manifest_history_keeps_every_version() {
        let store = StateStore::open_in_memory().unwrap();
        store.compare_and_swap_manifest(&manifest("v1"), 0, "ops", 1000).unwrap();
        store.compare_and_swap_manifest(&manifest("v2"), 1, "ops", 1001).unwrap();

        let history = store.manifest_history("api").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[1].document.artifact.tag, "v2");
    }

    #[test]
    fn manifest_commit_notifies_subscribers() {
        let store = StateStore::open_in_memory().unwrap();
        let rx = store.subscribe_manifests();
        assert_eq!(*rx.borrow(), 0);
        store.compare_and_swap_manifest(&manifest("v1"), 0, "ops", 1000).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), 1);
    }

    // ── History retention ──────────────────────────────────────────

    #[test]
    fn sync_records_are_trimmed_per_set() {
        let store = StateStore::open_in_memory().unwrap();
        for _ in 0..5 {
            store.append_sync_record(&mut sync_record("prod"), 3).unwrap();
        }
        store.append_sync_record(&mut sync_record("staging"), 3).unwrap();

        let prod = store.list_sync_records("prod", 10).unwrap();
        assert_eq!(prod.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![5, 4, 3]);
        assert_eq!(store.list_sync_records("staging", 10).unwrap().len(), 1);
    }

    #[test]
    fn scaling_decisions_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for _ in 0..3 {
            store.append_scaling_decision(&mut decision("api"), 100).unwrap();
        }
        let decisions = store.list_scaling_decisions("api", 2).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].seq, 3);
        assert!(store.list_scaling_decisions("worker", 10).unwrap().is_empty());
    }

    #[test]
    fn names_containing_separator_do_not_share_history() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_sync_record(&mut sync_record("prod"), 10).unwrap();
        store.append_sync_record(&mut sync_record("prod:eu"), 10).unwrap();
        store.append_sync_record(&mut sync_record("prod:eu"), 10).unwrap();
        store.append_scaling_decision(&mut decision("api:canary"), 10).unwrap();

        assert_eq!(store.list_sync_records("prod", 10).unwrap().len(), 1);
        assert_eq!(store.list_sync_records("prod:eu", 10).unwrap().len(), 2);
        assert!(store.list_scaling_decisions("api", 10).unwrap().is_empty());

        // Trimming one set leaves the other's records alone.
        store.append_sync_record(&mut sync_record("prod"), 1).unwrap();
        assert_eq!(store.list_sync_records("prod", 10).unwrap().len(), 1);
        assert_eq!(store.list_sync_records("prod:eu", 10).unwrap().len(), 2);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.compare_and_swap_manifest(&manifest("v1"), 0, "ops", 1000).unwrap();
            store.next_sequence("runs").unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.read_manifest("api").unwrap().unwrap().version, 1);
        assert_eq!(store.next_sequence("runs").unwrap(), 2);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_runs(None, 10).unwrap().is_empty());
        assert!(store.list_manifests().unwrap().is_empty());
        assert!(store.manifest_history("any").unwrap().is_empty());
        assert!(store.list_sync_records("any", 10).unwrap().is_empty());
    }
}
