use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    entity::{EntityId, Indexable, Persistent},
    error::{Error, Result},
    index_store::{IndexOp, IndexStore},
    mapper::DocumentMapper,
    persistence::LifecycleListener,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntityKey {
    Saved { class: &'static str, id: EntityId },
    /// Not saved yet; identified by allocation.
    Transient(usize),
}

impl EntityKey {
    fn of(entity: &Arc<dyn Indexable>) -> Self {
        match entity.entity_id() {
            Some(id) => Self::Saved {
                class: entity.class_name(),
                id,
            },
            None => Self::Transient(Arc::as_ptr(entity) as *const () as usize),
        }
    }
}

/// Entities touched during one flush, grouped by what happened to them.
///
/// An entity sits in at most one set. The latest event decides which,
/// except that updating a pending insert keeps it an insert.
#[derive(Debug, Default)]
pub struct PendingBatch {
    inserts: HashMap<EntityKey, Arc<dyn Indexable>>,
    updates: HashMap<EntityKey, Arc<dyn Indexable>>,
    deletes: HashMap<EntityKey, Arc<dyn Indexable>>,
}

impl PendingBatch {
    pub fn record_insert(&mut self, entity: Arc<dyn Indexable>) {
        let key = EntityKey::of(&entity);
        self.updates.remove(&key);
        self.deletes.remove(&key);
        self.inserts.insert(key, entity);
    }

    pub fn record_update(&mut self, entity: Arc<dyn Indexable>) {
        let key = EntityKey::of(&entity);
        if let Some(pending) = self.inserts.get_mut(&key) {
            *pending = entity;
            return;
        }
        self.deletes.remove(&key);
        self.updates.insert(key, entity);
    }

    pub fn record_delete(&mut self, entity: Arc<dyn Indexable>) {
        let key = EntityKey::of(&entity);
        self.inserts.remove(&key);
        self.updates.remove(&key);
        self.deletes.insert(key, entity);
    }

    pub fn inserts(&self) -> impl Iterator<Item = &Arc<dyn Indexable>> {
        self.inserts.values()
    }

    pub fn updates(&self) -> impl Iterator<Item = &Arc<dyn Indexable>> {
        self.updates.values()
    }

    pub fn deletes(&self) -> impl Iterator<Item = &Arc<dyn Indexable>> {
        self.deletes.values()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of draining one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub updated: usize,
    pub inserted: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Update,
    Insert,
    Delete,
}

impl Mutation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

/// Keeps the index in step with the persistent store.
///
/// Lifecycle events only record entities; the index is touched when the
/// flush completes. One interceptor serves one persistence session.
pub struct IndexInterceptor {
    store: Arc<IndexStore>,
    mapper: Arc<DocumentMapper>,
    batch: Mutex<PendingBatch>,
}

impl IndexInterceptor {
    pub fn new(store: Arc<IndexStore>, mapper: Arc<DocumentMapper>) -> Self {
        Self {
            store,
            mapper,
            batch: Mutex::new(PendingBatch::default()),
        }
    }

    /// Number of entities waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.batch.lock().len()
    }

    /// Forget everything recorded since the last drain.
    pub fn discard(&self) {
        let dropped = std::mem::take(&mut *self.batch.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "discarded pending index mutations");
        }
    }

    /// Apply the pending batch in one commit: updates, then inserts, then
    /// deletes.
    ///
    /// An entity that cannot be mapped or written is logged and skipped. The
    /// batch is empty afterwards whatever happened.
    pub fn drain(&self) -> FlushReport {
        let batch = std::mem::take(&mut *self.batch.lock());
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }

        let PendingBatch {
            inserts,
            updates,
            deletes,
        } = batch;
        let ordered = updates
            .into_values()
            .map(|e| (Mutation::Update, e))
            .chain(inserts.into_values().map(|e| (Mutation::Insert, e)))
            .chain(deletes.into_values().map(|e| (Mutation::Delete, e)));

        let mut planned = Vec::new();
        let mut ops = Vec::new();
        for (mutation, entity) in ordered {
            match self.plan(mutation, &*entity) {
                Ok(op) => {
                    ops.push(op);
                    planned.push((mutation, entity));
                }
                Err(e) => {
                    skipped(mutation, &*entity, &e);
                    report.failed += 1;
                }
            }
        }

        match self.store.apply_batch(&ops) {
            Ok(outcomes) => {
                for ((mutation, entity), outcome) in
                    planned.iter().zip(outcomes)
                {
                    match outcome {
                        Ok(()) => match mutation {
                            Mutation::Update => report.updated += 1,
                            Mutation::Insert => report.inserted += 1,
                            Mutation::Delete => report.removed += 1,
                        },
                        Err(e) => {
                            skipped(*mutation, &**entity, &e);
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    count = planned.len(),
                    error = %e,
                    "index batch not committed"
                );
                report.failed += planned.len();
            }
        }

        debug!(?report, "drained index batch");
        report
    }

    fn plan(&self, mutation: Mutation, entity: &dyn Indexable) -> Result<IndexOp> {
        match mutation {
            Mutation::Update => Ok(IndexOp::Update(self.mapper.map(entity)?)),
            Mutation::Insert => Ok(IndexOp::Add(self.mapper.map(entity)?)),
            Mutation::Delete => {
                let id = entity.entity_id().ok_or_else(|| Error::Transient {
                    class: entity.class_name().to_string(),
                })?;
                Ok(IndexOp::Remove {
                    id: id.to_string(),
                    class: entity.class_name().to_string(),
                })
            }
        }
    }
}

fn skipped(mutation: Mutation, entity: &dyn Indexable, error: &Error) {
    warn!(
        operation = mutation.as_str(),
        class = entity.class_name(),
        id = ?entity.entity_id(),
        error = %error,
        "skipping index mutation"
    );
}

impl LifecycleListener for IndexInterceptor {
    fn on_insert(&self, entity: Arc<dyn Persistent>) {
        if let Some(indexable) = entity.into_indexable() {
            self.batch.lock().record_insert(indexable);
        }
    }

    fn on_update(&self, entity: Arc<dyn Persistent>) {
        if let Some(indexable) = entity.into_indexable() {
            self.batch.lock().record_update(indexable);
        }
    }

    fn on_delete(&self, entity: Arc<dyn Persistent>) {
        if let Some(indexable) = entity.into_indexable() {
            self.batch.lock().record_delete(indexable);
        }
    }

    fn on_flush_completed(&self) {
        self.drain();
    }

    fn on_flush_aborted(&self) {
        self.discard();
    }
}

impl std::fmt::Debug for IndexInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexInterceptor")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
