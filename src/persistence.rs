use std::{path::Path, sync::Arc};

use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::{
    entity::{EntityId, Persistent},
    error::{Error, Result},
    model::Entity,
};

/// Serialized entities keyed by `class/id`.
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
/// Last identifier handed out per class.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Observer of entity lifecycle events.
///
/// Insert, update and delete fire while a flush is writing, before it
/// commits. Exactly one of `on_flush_completed` or `on_flush_aborted` follows.
pub trait LifecycleListener: Send + Sync {
    fn on_insert(&self, entity: Arc<dyn Persistent>);

    fn on_update(&self, entity: Arc<dyn Persistent>);

    fn on_delete(&self, entity: Arc<dyn Persistent>);

    fn on_flush_completed(&self);

    fn on_flush_aborted(&self) {}
}

fn entity_key(class: &str, id: EntityId) -> String {
    format!("{class}/{id}")
}

pub struct EntityStore {
    db: Database,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    /// Serializes flushes from write through the completed/aborted callback,
    /// so one flush's events never land in a batch another flush is draining.
    flush_lock: Mutex<()>,
}

impl EntityStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(ENTITIES)?;
        txn.open_table(SEQUENCES)?;
        txn.commit()?;

        Ok(Self {
            db,
            listeners: Vec::new(),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.add_listener(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn get(&self, class: &str, id: EntityId) -> Result<Option<Entity>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let key = entity_key(&class.to_lowercase(), id);
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored entity, in key order.
    pub fn list_all(&self) -> Result<Vec<Entity>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn count(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let mut count = 0;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            store: self,
            ops: Vec::new(),
        }
    }

    fn notify(&self, event: impl Fn(&dyn LifecycleListener)) {
        for listener in &self.listeners {
            event(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Op {
    Save(Entity),
    Update(Entity),
    Delete(Entity),
}

/// Changes queued against an [`EntityStore`], written by [`UnitOfWork::flush`]
/// in a single transaction.
#[derive(Debug)]
pub struct UnitOfWork<'a> {
    store: &'a EntityStore,
    ops: Vec<Op>,
}

impl UnitOfWork<'_> {
    /// Store an entity. One without an identifier gets the next one of its
    /// class; one that is already stored is overwritten.
    pub fn save(&mut self, entity: impl Into<Entity>) -> &mut Self {
        self.ops.push(Op::Save(entity.into()));
        self
    }

    /// Overwrite an entity that must already be stored.
    pub fn update(&mut self, entity: impl Into<Entity>) -> &mut Self {
        self.ops.push(Op::Update(entity.into()));
        self
    }

    pub fn delete(&mut self, entity: impl Into<Entity>) -> &mut Self {
        self.ops.push(Op::Delete(entity.into()));
        self
    }

    /// Soft delete: detach the entity and flag it, then update it.
    pub fn trash(&mut self, entity: impl Into<Entity>) -> &mut Self {
        let mut entity = entity.into();
        entity.trash();
        self.update(entity)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Write every queued change. Returns the saved entities with their
    /// identifiers assigned. Nothing is written when any change fails.
    ///
    /// Flushes on the same store run one at a time, listener callbacks
    /// included. A listener must not flush the store it listens to.
    pub fn flush(self) -> Result<Vec<Entity>> {
        let store = self.store;
        let _guard = store.flush_lock.lock();
        match write(store, self.ops) {
            Ok(saved) => {
                store.notify(|l| l.on_flush_completed());
                Ok(saved)
            }
            Err(e) => {
                store.notify(|l| l.on_flush_aborted());
                Err(e)
            }
        }
    }
}

fn write(store: &EntityStore, ops: Vec<Op>) -> Result<Vec<Entity>> {
    let txn = store.db.begin_write()?;
    let mut saved = Vec::new();
    {
        let mut entities = txn.open_table(ENTITIES)?;
        let mut sequences = txn.open_table(SEQUENCES)?;

        for op in ops {
            match op {
                Op::Save(mut entity) => {
                    let class = entity.class_name();
                    let last = sequences.get(class)?.map(|v| v.value()).unwrap_or(0);
                    let id = match entity.id() {
                        Some(id) => id,
                        None => EntityId(last + 1),
                    };
                    if id.0 > last {
                        sequences.insert(class, id.0)?;
                    }
                    entity.set_id(id);

                    let key = entity_key(class, id);
                    let bytes = serde_json::to_vec(&entity)?;
                    let existed = entities
                        .insert(key.as_str(), bytes.as_slice())?
                        .is_some();
                    debug!(%key, existed, "saved entity");

                    let persistent = entity.clone().into_persistent();
                    if existed {
                        store.notify(|l| l.on_update(persistent.clone()));
                    } else {
                        store.notify(|l| l.on_insert(persistent.clone()));
                    }
                    saved.push(entity);
                }
                Op::Update(entity) => {
                    let key = stored_key(&entity)?;
                    let bytes = serde_json::to_vec(&entity)?;
                    if entities
                        .insert(key.as_str(), bytes.as_slice())?
                        .is_none()
                    {
                        return Err(not_found(&entity, key));
                    }
                    debug!(%key, "updated entity");

                    let persistent = entity.into_persistent();
                    store.notify(|l| l.on_update(persistent.clone()));
                }
                Op::Delete(entity) => {
                    let key = stored_key(&entity)?;
                    if entities.remove(key.as_str())?.is_none() {
                        return Err(not_found(&entity, key));
                    }
                    debug!(%key, "deleted entity");

                    let persistent = entity.into_persistent();
                    store.notify(|l| l.on_delete(persistent.clone()));
                }
            }
        }
    }
    txn.commit()?;
    Ok(saved)
}

fn stored_key(entity: &Entity) -> Result<String> {
    let id = entity.id().ok_or_else(|| Error::Transient {
        class: entity.class_name().to_string(),
    })?;
    Ok(entity_key(entity.class_name(), id))
}

fn not_found(entity: &Entity, key: String) -> Error {
    Error::NotFound {
        kind: entity.class_name(),
        name: key,
    }
}
