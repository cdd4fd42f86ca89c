//! redb table definitions for the keel state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Sequence numbers in keys are zero-padded to 20 digits so that
//! lexicographic order equals numeric order.

use redb::TableDefinition;

/// A table of JSON-encoded records.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Pipeline runs keyed by `{run_id:020}`.
pub const RUNS: JsonTable = TableDefinition::new("runs");

/// Current manifest per workload, keyed by `{workload}`.
pub const MANIFESTS: JsonTable = TableDefinition::new("manifests");

/// Every committed manifest version, keyed by `{workload}:{version:020}`.
pub const MANIFEST_HISTORY: JsonTable = TableDefinition::new("manifest_history");

/// Reconcile sync records keyed by `{set}:{seq:020}`.
pub const SYNC_RECORDS: JsonTable = TableDefinition::new("sync_records");

/// Scaling decisions keyed by `{workload}:{seq:020}`.
pub const SCALING_DECISIONS: JsonTable = TableDefinition::new("scaling_decisions");

/// Named monotonic counters.
pub const SEQUENCES: TableDefinition<'static, &'static str, u64> = TableDefinition::new("sequences");

/// Build a `{prefix}:{seq:020}` composite key.
pub fn seq_key(prefix: &str, seq: u64) -> String {
    format!("{prefix}:{seq:020}")
}

/// Split a composite key back into its prefix and sequence number.
///
/// The split is on the last `:`, so prefixes may themselves contain `:`
/// without one owner's keys matching another's.
pub fn split_seq_key(key: &str) -> Option<(&str, u64)> {
    let (prefix, seq) = key.rsplit_once(':')?;
    if seq.len() != 20 || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((prefix, seq.parse().ok()?))
}
