//! In-process transactional database, shared by every client in a process
//! group.
//!
//! The backing model mirrors a browser origin: a `Platform` maps database
//! names to their contents, and each client opens its own connection.
//! Transactions take the database's single writer lock for their whole
//! body, which gives serializable isolation for free; bodies mutate a
//! working copy of their scoped stores, and the copy is published only on
//! commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::StoreError;
use super::side_channel::{MemorySideChannel, SideChannel};
use crate::core::identity::ClientId;
use crate::core::records::{ClientMetadataRecord, PrimaryLeaseRecord};
use crate::core::time::{SystemTimeSource, TimeSource};
use super::collaborators::{CLIENT_METADATA_STORE, PRIMARY_CLIENT_STORE};

/// Row key within an object store.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Number(u64),
    Text(String),
}

impl From<u64> for RowKey {
    fn from(n: u64) -> Self {
        RowKey::Number(n)
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey::Text(s.to_string())
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        RowKey::Text(s)
    }
}

impl From<&ClientId> for RowKey {
    fn from(id: &ClientId) -> Self {
        RowKey::Text(id.as_str().to_string())
    }
}

type ObjectStoreData = BTreeMap<RowKey, serde_json::Value>;

/// The singleton lease row's fixed key.
const LEASE_ROW_KEY: &str = "owner";

struct DatabaseInner {
    schema_version: u32,
    object_stores: BTreeMap<String, ObjectStoreData>,
}

/// Process-group environment shared by every client of a database: the
/// named-database registry, the side channel, and the time source.
///
/// Tests build one `Platform` per simulated machine and open any number of
/// clients against it.
pub struct Platform {
    databases: Mutex<HashMap<String, Arc<Mutex<DatabaseInner>>>>,
    side_channel: Arc<dyn SideChannel>,
    time: Arc<dyn TimeSource>,
}

impl Platform {
    /// Production environment: system clock, in-process side channel.
    pub fn new() -> Arc<Self> {
        Self::with_parts(Arc::new(MemorySideChannel::new()), Arc::new(SystemTimeSource))
    }

    pub fn with_parts(side_channel: Arc<dyn SideChannel>, time: Arc<dyn TimeSource>) -> Arc<Self> {
        Arc::new(Self {
            databases: Mutex::new(HashMap::new()),
            side_channel,
            time,
        })
    }

    pub fn side_channel(&self) -> Arc<dyn SideChannel> {
        self.side_channel.clone()
    }

    pub fn time(&self) -> Arc<dyn TimeSource> {
        self.time.clone()
    }

    /// Open a connection to `name`, creating and upgrading the database as
    /// needed. The upgrader runs only when the stored schema version is
    /// behind `schema_version`; a stored version ahead of it fails the open.
    pub fn open_or_create(
        &self,
        name: &str,
        schema_version: u32,
        upgrader: impl FnOnce(&mut SchemaUpgrade<'_>) -> Result<(), StoreError>,
    ) -> Result<LocalStore, StoreError> {
        let shared = {
            let mut registry = self.databases.lock().map_err(|_| StoreError::LockPoisoned)?;
            registry
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(DatabaseInner {
                        schema_version: 0,
                        object_stores: BTreeMap::new(),
                    }))
                })
                .clone()
        };

        {
            let mut inner = shared.lock().map_err(|_| StoreError::LockPoisoned)?;
            if inner.schema_version > schema_version {
                return Err(StoreError::Unavailable {
                    name: name.to_string(),
                    reason: format!(
                        "stored schema version {} is newer than supported version {}",
                        inner.schema_version, schema_version
                    ),
                });
            }
            if inner.schema_version < schema_version {
                let mut upgrade = SchemaUpgrade {
                    from_version: inner.schema_version,
                    to_version: schema_version,
                    inner: &mut inner,
                };
                upgrader(&mut upgrade)?;
                inner.schema_version = schema_version;
            }
        }

        Ok(LocalStore {
            name: name.to_string(),
            shared,
            open: AtomicBool::new(true),
        })
    }

    /// Drop a database from the registry. Existing connections keep their
    /// handle to the old contents; new opens start empty.
    pub fn delete_database(&self, name: &str) -> Result<(), StoreError> {
        let mut registry = self.databases.lock().map_err(|_| StoreError::LockPoisoned)?;
        registry.remove(name);
        Ok(())
    }
}

/// Schema migration scope handed to the upgrader during `open_or_create`.
pub struct SchemaUpgrade<'a> {
    from_version: u32,
    to_version: u32,
    inner: &'a mut DatabaseInner,
}

impl SchemaUpgrade<'_> {
    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    pub fn to_version(&self) -> u32 {
        self.to_version
    }

    pub fn create_object_store(&mut self, name: &str) {
        self.inner
            .object_stores
            .entry(name.to_string())
            .or_default();
    }

    pub fn delete_object_store(&mut self, name: &str) {
        self.inner.object_stores.remove(name);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// One client's connection to a shared database.
pub struct LocalStore {
    name: String,
    shared: Arc<Mutex<DatabaseInner>>,
    open: AtomicBool,
}

impl LocalStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close this connection. Later transactions on it fail with `Closed`;
    /// other connections to the same database are unaffected.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn run_read_only<T>(
        &self,
        stores: &[&str],
        body: impl FnOnce(&mut Transaction) -> crate::Result<T>,
    ) -> crate::Result<T> {
        self.run(TransactionMode::ReadOnly, stores, body)
    }

    pub fn run_read_write<T>(
        &self,
        stores: &[&str],
        body: impl FnOnce(&mut Transaction) -> crate::Result<T>,
    ) -> crate::Result<T> {
        self.run(TransactionMode::ReadWrite, stores, body)
    }

    fn run<T>(
        &self,
        mode: TransactionMode,
        stores: &[&str],
        body: impl FnOnce(&mut Transaction) -> crate::Result<T>,
    ) -> crate::Result<T> {
        if !self.is_open() {
            return Err(StoreError::Closed.into());
        }
        let mut inner = self.lock()?;

        let mut working = BTreeMap::new();
        for store in stores {
            let data = inner
                .object_stores
                .get(*store)
                .ok_or_else(|| StoreError::UnknownStore {
                    store: store.to_string(),
                })?;
            working.insert(store.to_string(), data.clone());
        }

        let mut txn = Transaction { mode, working };
        let result = body(&mut txn)?;

        if mode == TransactionMode::ReadWrite {
            for (store, data) in txn.working {
                inner.object_stores.insert(store, data);
            }
        }
        Ok(result)
    }

    fn lock(&self) -> Result<MutexGuard<'_, DatabaseInner>, StoreError> {
        self.shared.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Atomic scope over named object stores.
///
/// Reads see the state at transaction start plus this transaction's own
/// writes. An `Err` from the body discards every write.
pub struct Transaction {
    mode: TransactionMode,
    working: BTreeMap<String, ObjectStoreData>,
}

impl Transaction {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    // Generic row access -----------------------------------------------------

    pub fn get(&self, store: &str, key: impl Into<RowKey>) -> crate::Result<Option<serde_json::Value>> {
        Ok(self.store_data(store)?.get(&key.into()).cloned())
    }

    pub fn put(
        &mut self,
        store: &str,
        key: impl Into<RowKey>,
        value: serde_json::Value,
    ) -> crate::Result<()> {
        self.store_data_mut(store)?.insert(key.into(), value);
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: impl Into<RowKey>) -> crate::Result<()> {
        self.store_data_mut(store)?.remove(&key.into());
        Ok(())
    }

    pub fn scan(&self, store: &str) -> crate::Result<Vec<(RowKey, serde_json::Value)>> {
        Ok(self
            .store_data(store)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    // Typed coordination rows ------------------------------------------------

    pub fn primary_lease(&self) -> crate::Result<Option<PrimaryLeaseRecord>> {
        self.decode_opt(
            PRIMARY_CLIENT_STORE,
            self.get(PRIMARY_CLIENT_STORE, LEASE_ROW_KEY)?,
        )
    }

    pub fn put_primary_lease(&mut self, lease: &PrimaryLeaseRecord) -> crate::Result<()> {
        let value = encode(PRIMARY_CLIENT_STORE, lease)?;
        self.put(PRIMARY_CLIENT_STORE, LEASE_ROW_KEY, value)
    }

    pub fn delete_primary_lease(&mut self) -> crate::Result<()> {
        self.delete(PRIMARY_CLIENT_STORE, LEASE_ROW_KEY)
    }

    pub fn client_metadata(&self, client_id: &ClientId) -> crate::Result<Option<ClientMetadataRecord>> {
        self.decode_opt(
            CLIENT_METADATA_STORE,
            self.get(CLIENT_METADATA_STORE, client_id)?,
        )
    }

    pub fn put_client_metadata(&mut self, metadata: &ClientMetadataRecord) -> crate::Result<()> {
        let value = encode(CLIENT_METADATA_STORE, metadata)?;
        let key = RowKey::from(&metadata.client_id);
        self.put(CLIENT_METADATA_STORE, key, value)
    }

    pub fn delete_client_metadata(&mut self, client_id: &ClientId) -> crate::Result<()> {
        self.delete(CLIENT_METADATA_STORE, client_id)
    }

    pub fn all_client_metadata(&self) -> crate::Result<Vec<ClientMetadataRecord>> {
        self.scan(CLIENT_METADATA_STORE)?
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_value(value).map_err(|source| {
                    crate::Error::from(StoreError::Corrupt {
                        store: CLIENT_METADATA_STORE.to_string(),
                        source,
                    })
                })
            })
            .collect()
    }

    // Internals --------------------------------------------------------------

    fn store_data(&self, store: &str) -> Result<&ObjectStoreData, StoreError> {
        self.working.get(store).ok_or_else(|| StoreError::OutOfScope {
            store: store.to_string(),
        })
    }

    fn store_data_mut(&mut self, store: &str) -> Result<&mut ObjectStoreData, StoreError> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly {
                store: store.to_string(),
            });
        }
        self.working
            .get_mut(store)
            .ok_or_else(|| StoreError::OutOfScope {
                store: store.to_string(),
            })
    }

    fn decode_opt<T: DeserializeOwned>(
        &self,
        store: &str,
        value: Option<serde_json::Value>,
    ) -> crate::Result<Option<T>> {
        value
            .map(|v| {
                serde_json::from_value(v).map_err(|source| {
                    crate::Error::from(StoreError::Corrupt {
                        store: store.to_string(),
                        source,
                    })
                })
            })
            .transpose()
    }
}

fn encode<T: Serialize>(store: &str, value: &T) -> crate::Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|source| {
        crate::Error::from(StoreError::Corrupt {
            store: store.to_string(),
            source,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::collaborators::{ALL_STORES, SCHEMA_VERSION, define_schema};

    fn open(platform: &Platform) -> LocalStore {
        platform
            .open_or_create("db/main", SCHEMA_VERSION, define_schema)
            .unwrap()
    }

    #[test]
    fn writes_are_atomic_per_transaction() {
        let platform = Platform::new();
        let store = open(&platform);

        store
            .run_read_write(ALL_STORES, |txn| {
                txn.put(PRIMARY_CLIENT_STORE, "a", serde_json::json!(1))?;
                txn.put(CLIENT_METADATA_STORE, "b", serde_json::json!(2))?;
                Ok(())
            })
            .unwrap();

        let (a, b) = store
            .run_read_only(ALL_STORES, |txn| {
                Ok((
                    txn.get(PRIMARY_CLIENT_STORE, "a")?,
                    txn.get(CLIENT_METADATA_STORE, "b")?,
                ))
            })
            .unwrap();
        assert_eq!(a, Some(serde_json::json!(1)));
        assert_eq!(b, Some(serde_json::json!(2)));
    }

    #[test]
    fn body_error_aborts_the_transaction() {
        let platform = Platform::new();
        let store = open(&platform);

        let result: crate::Result<()> = store.run_read_write(ALL_STORES, |txn| {
            txn.put(PRIMARY_CLIENT_STORE, "a", serde_json::json!(1))?;
            Err(StoreError::Closed.into())
        });
        assert!(result.is_err());

        let a = store
            .run_read_only(ALL_STORES, |txn| txn.get(PRIMARY_CLIENT_STORE, "a"))
            .unwrap();
        assert_eq!(a, None);
    }

    #[test]
    fn scope_is_enforced() {
        let platform = Platform::new();
        let store = open(&platform);

        let result = store.run_read_write(&[PRIMARY_CLIENT_STORE], |txn| {
            txn.put(CLIENT_METADATA_STORE, "b", serde_json::json!(2))
        });
        assert!(matches!(
            result,
            Err(crate::Error::Store(StoreError::OutOfScope { .. }))
        ));
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let platform = Platform::new();
        let store = open(&platform);

        let result = store.run_read_only(ALL_STORES, |txn| {
            txn.put(PRIMARY_CLIENT_STORE, "a", serde_json::json!(1))
        });
        assert!(matches!(
            result,
            Err(crate::Error::Store(StoreError::ReadOnly { .. }))
        ));
    }

    #[test]
    fn connections_share_contents_but_not_closed_state() {
        let platform = Platform::new();
        let first = open(&platform);
        let second = open(&platform);

        first
            .run_read_write(ALL_STORES, |txn| {
                txn.put(PRIMARY_CLIENT_STORE, "a", serde_json::json!(1))
            })
            .unwrap();
        first.close();

        assert!(matches!(
            first.run_read_only(ALL_STORES, |txn| txn.get(PRIMARY_CLIENT_STORE, "a")),
            Err(crate::Error::Store(StoreError::Closed))
        ));
        let a = second
            .run_read_only(ALL_STORES, |txn| txn.get(PRIMARY_CLIENT_STORE, "a"))
            .unwrap();
        assert_eq!(a, Some(serde_json::json!(1)));
    }

    #[test]
    fn newer_stored_schema_fails_the_open() {
        let platform = Platform::new();
        let _newer = platform
            .open_or_create("db/main", SCHEMA_VERSION + 1, define_schema)
            .unwrap();
        let result = platform.open_or_create("db/main", SCHEMA_VERSION, define_schema);
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }

    #[test]
    fn upgrader_runs_once_per_version_step() {
        let platform = Platform::new();
        let mut runs = 0;
        platform
            .open_or_create("db/main", 1, |upgrade| {
                runs += 1;
                assert_eq!(upgrade.from_version(), 0);
                assert_eq!(upgrade.to_version(), 1);
                upgrade.create_object_store(PRIMARY_CLIENT_STORE);
                Ok(())
            })
            .unwrap();
        platform
            .open_or_create("db/main", 1, |_| {
                panic!("upgrader must not run at the current version")
            })
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn typed_lease_row_round_trips() {
        let platform = Platform::new();
        let store = open(&platform);
        let lease = PrimaryLeaseRecord::new(ClientId::random(), 1_234, true);

        store
            .run_read_write(ALL_STORES, |txn| txn.put_primary_lease(&lease))
            .unwrap();
        let read = store
            .run_read_only(ALL_STORES, |txn| txn.primary_lease())
            .unwrap();
        assert_eq!(read, Some(lease));
    }

    #[test]
    fn deleted_database_starts_empty_on_reopen() {
        let platform = Platform::new();
        let store = open(&platform);
        store
            .run_read_write(ALL_STORES, |txn| {
                txn.put(PRIMARY_CLIENT_STORE, "a", serde_json::json!(1))
            })
            .unwrap();

        platform.delete_database("db/main").unwrap();
        let fresh = open(&platform);
        let a = fresh
            .run_read_only(ALL_STORES, |txn| txn.get(PRIMARY_CLIENT_STORE, "a"))
            .unwrap();
        assert_eq!(a, None);
    }
}
