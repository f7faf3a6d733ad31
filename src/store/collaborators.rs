//! Collaborator handles over the shared object stores.
//!
//! The coordinator owns only the lease and metadata rows; documents,
//! mutations, and query targets belong to these collaborators. They are
//! kept thin here - typed row access addressed through the same
//! transaction carrier - because their internal semantics live above this
//! crate. The one operation the coordinator itself invokes is
//! `DocumentChangeLog::truncate_through` during garbage collection.

use serde_json::Value;

use super::StoreError;
use super::local::{RowKey, Transaction};

pub const PRIMARY_CLIENT_STORE: &str = "primaryClient";
pub const CLIENT_METADATA_STORE: &str = "clientMetadata";
pub const DOCUMENT_CHANGE_LOG_STORE: &str = "remoteDocumentChangeLog";
pub const MUTATION_QUEUE_STORE: &str = "mutationQueue";
pub const QUERY_CACHE_STORE: &str = "queryCache";
pub const REMOTE_DOCUMENT_CACHE_STORE: &str = "remoteDocumentCache";

pub const ALL_STORES: &[&str] = &[
    PRIMARY_CLIENT_STORE,
    CLIENT_METADATA_STORE,
    DOCUMENT_CHANGE_LOG_STORE,
    MUTATION_QUEUE_STORE,
    QUERY_CACHE_STORE,
    REMOTE_DOCUMENT_CACHE_STORE,
];

pub const SCHEMA_VERSION: u32 = 1;

/// Create every object store the schema version requires.
pub fn define_schema(upgrade: &mut super::local::SchemaUpgrade<'_>) -> Result<(), StoreError> {
    if upgrade.from_version() < 1 {
        for store in ALL_STORES {
            upgrade.create_object_store(store);
        }
    }
    Ok(())
}

/// Shared log of applied remote document changes.
///
/// Entries are keyed by a dense change id; each secondary tracks how far
/// it has read via its metadata cursor, and the primary truncates entries
/// every active peer has consumed.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentChangeLog;

impl DocumentChangeLog {
    /// Append a change entry, returning its id.
    pub fn append(&self, txn: &mut Transaction, doc_keys: &[String]) -> crate::Result<u64> {
        let change_id = self.last_change_id(txn)?.map_or(1, |id| id + 1);
        txn.put(
            DOCUMENT_CHANGE_LOG_STORE,
            change_id,
            serde_json::json!({ "changeId": change_id, "docKeys": doc_keys }),
        )?;
        Ok(change_id)
    }

    /// Delete every entry with id <= `change_id`.
    pub fn truncate_through(&self, txn: &mut Transaction, change_id: u64) -> crate::Result<()> {
        let stale: Vec<RowKey> = txn
            .scan(DOCUMENT_CHANGE_LOG_STORE)?
            .into_iter()
            .filter(|(key, _)| matches!(key, RowKey::Number(id) if *id <= change_id))
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            txn.delete(DOCUMENT_CHANGE_LOG_STORE, key)?;
        }
        Ok(())
    }

    /// Entries with id > `change_id`, in id order.
    pub fn changes_after(&self, txn: &Transaction, change_id: u64) -> crate::Result<Vec<(u64, Value)>> {
        Ok(txn
            .scan(DOCUMENT_CHANGE_LOG_STORE)?
            .into_iter()
            .filter_map(|(key, value)| match key {
                RowKey::Number(id) if id > change_id => Some((id, value)),
                _ => None,
            })
            .collect())
    }

    pub fn last_change_id(&self, txn: &Transaction) -> crate::Result<Option<u64>> {
        Ok(txn
            .scan(DOCUMENT_CHANGE_LOG_STORE)?
            .into_iter()
            .filter_map(|(key, _)| match key {
                RowKey::Number(id) => Some(id),
                RowKey::Text(_) => None,
            })
            .max())
    }
}

/// Locally staged mutations awaiting acknowledgement by the primary.
#[derive(Clone, Copy, Debug, Default)]
pub struct MutationQueue;

impl MutationQueue {
    pub fn enqueue(&self, txn: &mut Transaction, batch: Value) -> crate::Result<u64> {
        let batch_id = self.last_batch_id(txn)?.map_or(1, |id| id + 1);
        txn.put(MUTATION_QUEUE_STORE, batch_id, batch)?;
        Ok(batch_id)
    }

    pub fn batch(&self, txn: &Transaction, batch_id: u64) -> crate::Result<Option<Value>> {
        txn.get(MUTATION_QUEUE_STORE, batch_id)
    }

    /// Remove an acknowledged batch.
    pub fn acknowledge(&self, txn: &mut Transaction, batch_id: u64) -> crate::Result<()> {
        txn.delete(MUTATION_QUEUE_STORE, batch_id)
    }

    pub fn pending(&self, txn: &Transaction) -> crate::Result<Vec<(u64, Value)>> {
        Ok(txn
            .scan(MUTATION_QUEUE_STORE)?
            .into_iter()
            .filter_map(|(key, value)| match key {
                RowKey::Number(id) => Some((id, value)),
                RowKey::Text(_) => None,
            })
            .collect())
    }

    fn last_batch_id(&self, txn: &Transaction) -> crate::Result<Option<u64>> {
        Ok(txn
            .scan(MUTATION_QUEUE_STORE)?
            .into_iter()
            .filter_map(|(key, _)| match key {
                RowKey::Number(id) => Some(id),
                RowKey::Text(_) => None,
            })
            .max())
    }
}

/// Cached query targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryCache;

impl QueryCache {
    pub fn set_target(&self, txn: &mut Transaction, target_id: u64, target: Value) -> crate::Result<()> {
        txn.put(QUERY_CACHE_STORE, target_id, target)
    }

    pub fn target(&self, txn: &Transaction, target_id: u64) -> crate::Result<Option<Value>> {
        txn.get(QUERY_CACHE_STORE, target_id)
    }

    pub fn remove_target(&self, txn: &mut Transaction, target_id: u64) -> crate::Result<()> {
        txn.delete(QUERY_CACHE_STORE, target_id)
    }
}

/// Cached copies of remote documents, keyed by document path.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn put_document(&self, txn: &mut Transaction, doc_key: &str, doc: Value) -> crate::Result<()> {
        txn.put(REMOTE_DOCUMENT_CACHE_STORE, doc_key, doc)
    }

    pub fn document(&self, txn: &Transaction, doc_key: &str) -> crate::Result<Option<Value>> {
        txn.get(REMOTE_DOCUMENT_CACHE_STORE, doc_key)
    }

    pub fn remove_document(&self, txn: &mut Transaction, doc_key: &str) -> crate::Result<()> {
        txn.delete(REMOTE_DOCUMENT_CACHE_STORE, doc_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local::Platform;

    fn with_txn<T>(body: impl FnOnce(&mut Transaction) -> crate::Result<T>) -> T {
        let platform = Platform::new();
        let store = platform
            .open_or_create("db/main", SCHEMA_VERSION, define_schema)
            .unwrap();
        store.run_read_write(ALL_STORES, body).unwrap()
    }

    #[test]
    fn change_log_ids_are_dense_and_ordered() {
        with_txn(|txn| {
            let log = DocumentChangeLog;
            assert_eq!(log.append(txn, &["a".into()])?, 1);
            assert_eq!(log.append(txn, &["b".into()])?, 2);
            assert_eq!(log.append(txn, &["c".into()])?, 3);
            assert_eq!(log.last_change_id(txn)?, Some(3));
            Ok(())
        });
    }

    #[test]
    fn truncate_through_removes_only_consumed_entries() {
        with_txn(|txn| {
            let log = DocumentChangeLog;
            for keys in [["a"], ["b"], ["c"]] {
                log.append(txn, &[keys[0].to_string()])?;
            }
            log.truncate_through(txn, 2)?;
            let remaining = log.changes_after(txn, 0)?;
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].0, 3);
            Ok(())
        });
    }

    #[test]
    fn mutation_queue_acknowledge_removes_the_batch() {
        with_txn(|txn| {
            let queue = MutationQueue;
            let id = queue.enqueue(txn, serde_json::json!({"set": "doc/a"}))?;
            assert!(queue.batch(txn, id)?.is_some());
            queue.acknowledge(txn, id)?;
            assert!(queue.batch(txn, id)?.is_none());
            assert!(queue.pending(txn)?.is_empty());
            Ok(())
        });
    }

    #[test]
    fn document_cache_round_trips() {
        with_txn(|txn| {
            let cache = RemoteDocumentCache;
            cache.put_document(txn, "rooms/a", serde_json::json!({"n": 1}))?;
            assert_eq!(
                cache.document(txn, "rooms/a")?,
                Some(serde_json::json!({"n": 1}))
            );
            cache.remove_document(txn, "rooms/a")?;
            assert_eq!(cache.document(txn, "rooms/a")?, None);
            Ok(())
        });
    }
}
