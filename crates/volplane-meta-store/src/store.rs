//! Persistent resource collections backed by redb.
//!
//! Every collection is a `&str -> &str` table holding the JSON form of a
//! resource keyed by its ID. All writes are synchronous (write txn + commit)
//! and happen under a per-ID lock, so the read-check-write sequence of one
//! mutation is never interleaved with another mutation of the same ID.

use crate::error::{StoreError, StoreResult};
use crate::watch::{EventType, Subscription, Watchers};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;
use volplane_common::Resource;

type CollectionTable = TableDefinition<'static, &'static str, &'static str>;

/// Tuning for collections opened from a [`MetaStore`]
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Per-subscriber watch channel capacity
    pub watch_buffer: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { watch_buffer: 128 }
    }
}

/// Database handle owning all collections.
pub struct MetaStore {
    db: Arc<Database>,
    options: StoreOptions,
    collections: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        info!("Opened metadata store at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            options: StoreOptions::default(),
            collections: DashMap::new(),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Get the collection for resource kind `R`.
    ///
    /// The table is created on first use. Repeated calls return handles to
    /// the same collection, sharing locks and watchers.
    pub fn collection<R: Resource>(&self) -> StoreResult<Store<R>> {
        let entry = self
            .collections
            .entry(R::COLLECTION)
            .or_try_insert_with(|| -> StoreResult<Arc<dyn Any + Send + Sync>> {
                let inner = StoreInner::<R>::open(Arc::clone(&self.db), &self.options)?;
                Ok(Arc::new(inner))
            })?;
        let any = Arc::clone(entry.value());
        drop(entry);

        any.downcast::<StoreInner<R>>()
            .map(|inner| Store { inner })
            .map_err(|_| StoreError::CollectionTypeMismatch(R::COLLECTION))
    }
}

struct StoreInner<R: Resource> {
    db: Arc<Database>,
    table: CollectionTable,
    locks: DashMap<String, Arc<Mutex<()>>>,
    watchers: Arc<Watchers<R>>,
}

impl<R: Resource> StoreInner<R> {
    fn open(db: Arc<Database>, options: &StoreOptions) -> StoreResult<Self> {
        let table: CollectionTable = TableDefinition::new(R::COLLECTION);

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        debug!(collection = R::COLLECTION, "collection ready");

        Ok(Self {
            db,
            table,
            locks: DashMap::new(),
            watchers: Arc::new(Watchers::new(R::COLLECTION, options.watch_buffer)),
        })
    }
}

/// One collection of resources of kind `R`. Cheap to clone.
pub struct Store<R: Resource> {
    inner: Arc<StoreInner<R>>,
}

impl<R: Resource> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> Store<R> {
    /// Name of the underlying collection
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        R::COLLECTION
    }

    /// Insert a new object.
    ///
    /// An empty ID is replaced by a generated UUID. The resource's
    /// `prepare_for_create` hook runs before the write.
    pub fn create(&self, mut object: R) -> StoreResult<R> {
        if object.id().is_empty() {
            object.metadata_mut().id = Uuid::new_v4().to_string();
        }
        let id = object.id().to_string();
        let lock = self.key_lock(&id);
        let _guard = lock.lock();

        object.prepare_for_create();
        let meta = object.metadata_mut();
        meta.created_at = Some(Utc::now());
        meta.deleted_at = None;
        meta.resource_version = 1;
        meta.generation = 1;
        let json = serde_json::to_string(&object)?;

        let write_txn = self.inner.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.inner.table)?;
            if table.get(id.as_str())?.is_some() {
                return Err(self.already_exists(&id));
            }
            table.insert(id.as_str(), json.as_str())?;
        }
        write_txn.commit()?;

        debug!(collection = R::COLLECTION, id = %id, "created");
        self.inner.watchers.publish(EventType::Created, &object);
        Ok(object)
    }

    /// Fetch an object by ID
    pub fn get(&self, id: &str) -> StoreResult<R> {
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(self.inner.table)?;
        let Some(value) = table.get(id)? else {
            return Err(self.not_found(id));
        };
        Ok(serde_json::from_str(value.value())?)
    }

    /// Replace a stored object.
    ///
    /// The object's `resource_version` must equal the stored one. An object
    /// that is marked deleted and carries no finalizers is removed instead of
    /// written; in that case the returned object is the one that was removed.
    pub fn update(&self, mut object: R) -> StoreResult<R> {
        let id = object.id().to_string();
        let lock = self.key_lock(&id);
        let guard = lock.lock();

        let write_txn = self.inner.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(self.inner.table)?;
            let stored: R = match table.get(id.as_str())? {
                Some(value) => serde_json::from_str(value.value())?,
                None => return Err(self.not_found(&id)),
            };

            let stored_version = stored.resource_version();
            if object.resource_version() != stored_version {
                return Err(StoreError::Conflict {
                    collection: R::COLLECTION,
                    id,
                    stored: stored_version,
                    provided: object.resource_version(),
                });
            }

            let spec_changed = object.spec_changed(&stored);
            let meta = object.metadata_mut();
            meta.created_at = stored.metadata().created_at;
            if meta.deleted_at.is_none() {
                meta.deleted_at = stored.deleted_at();
            }

            if meta.deleted_at.is_some() && meta.finalizers.is_empty() {
                table.remove(id.as_str())?;
                true
            } else {
                meta.resource_version = stored_version + 1;
                meta.generation = if spec_changed {
                    stored.metadata().generation + 1
                } else {
                    stored.metadata().generation
                };
                let json = serde_json::to_string(&object)?;
                table.insert(id.as_str(), json.as_str())?;
                false
            }
        };
        write_txn.commit()?;

        if removed {
            debug!(collection = R::COLLECTION, id = %id, "finalized and removed");
            self.inner.watchers.publish(EventType::Deleted, &object);
            drop(guard);
            drop(lock);
            self.forget_lock(&id);
        } else {
            debug!(
                collection = R::COLLECTION,
                id = %id,
                version = object.resource_version(),
                "updated"
            );
            self.inner.watchers.publish(EventType::Updated, &object);
        }
        Ok(object)
    }

    /// Request deletion of an object.
    ///
    /// Objects without finalizers are removed immediately. Otherwise the
    /// object is marked deleted and stays until its finalizers are stripped
    /// through [`Store::update`]. Deleting an already marked object is a no-op.
    pub fn delete(&self, id: &str) -> StoreResult<()> {
        let lock = self.key_lock(id);
        let guard = lock.lock();

        let write_txn = self.inner.db.begin_write()?;
        let (stored, removed) = {
            let mut table = write_txn.open_table(self.inner.table)?;
            let mut stored: R = match table.get(id)? {
                Some(value) => serde_json::from_str(value.value())?,
                None => return Err(self.not_found(id)),
            };

            if stored.finalizers().is_empty() {
                table.remove(id)?;
                (stored, true)
            } else if stored.deleted_at().is_some() {
                return Ok(());
            } else {
                stored.set_deleted_at(Utc::now());
                let version = stored.resource_version() + 1;
                stored.set_resource_version(version);
                let json = serde_json::to_string(&stored)?;
                table.insert(id, json.as_str())?;
                (stored, false)
            }
        };
        write_txn.commit()?;

        if removed {
            debug!(collection = R::COLLECTION, id = %id, "deleted");
        } else {
            debug!(
                collection = R::COLLECTION,
                id = %id,
                finalizers = ?stored.finalizers(),
                "marked for deletion"
            );
        }
        self.inner.watchers.publish(EventType::Deleted, &stored);

        if removed {
            drop(guard);
            drop(lock);
            self.forget_lock(id);
        }
        Ok(())
    }

    /// All stored objects, including ones marked for deletion
    pub fn list(&self) -> StoreResult<Vec<R>> {
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(self.inner.table)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_str::<R>(value.value()) {
                Ok(object) => result.push(object),
                Err(e) => error!(
                    "Failed to decode {} entry '{}': {}",
                    R::COLLECTION,
                    key.value(),
                    e
                ),
            }
        }
        Ok(result)
    }

    /// Subscribe to mutations of this collection.
    ///
    /// Delivery is best-effort; see [`crate::watch`].
    #[must_use]
    pub fn watch(&self) -> Subscription<R> {
        self.inner.watchers.subscribe()
    }

    /// Events dropped because a subscriber was not ready
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.watchers.dropped()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.watchers.len()
    }

    // ---- Helpers ----

    fn key_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.locks.entry(id.to_string()).or_default().value())
    }

    fn forget_lock(&self, id: &str) {
        self.inner
            .locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound {
            collection: R::COLLECTION,
            id: id.to_string(),
        }
    }

    fn already_exists(&self, id: &str) -> StoreError {
        StoreError::AlreadyExists {
            collection: R::COLLECTION,
            id: id.to_string(),
        }
    }
}
