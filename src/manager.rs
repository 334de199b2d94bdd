use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    entity::Indexable,
    error::{Error, Result},
    index_store::{IndexConfig, IndexStore},
    interceptor::IndexInterceptor,
    mapper::{Document, DocumentMapper},
    query::IndexQuery,
    search::{CollectingHandler, SearchExecutor, SearchHandle, SearchResultHandler},
};

/// Entry point for callers that index entities directly or run searches.
///
/// Owns the one [`IndexStore`] of a location together with the mapper, and
/// hands out interceptors bound to both.
#[derive(Debug)]
pub struct IndexManager {
    store: Arc<IndexStore>,
    mapper: Arc<DocumentMapper>,
    executor: SearchExecutor,
}

impl IndexManager {
    /// Every property the mapper declares gets its own field in `config`,
    /// typed after the values its getters return. Fields already in
    /// `config` keep their kind.
    pub fn new(mut config: IndexConfig, mapper: DocumentMapper) -> Self {
        for (name, kind) in mapper.field_kinds() {
            config.fields.entry(name).or_insert(kind);
        }
        let store = Arc::new(IndexStore::new(config));
        Self {
            executor: SearchExecutor::new(Arc::clone(&store)),
            store,
            mapper: Arc::new(mapper),
        }
    }

    /// A manager for the built-in entity kinds.
    pub fn with_model(config: IndexConfig) -> Self {
        Self::new(config, DocumentMapper::with_model())
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<DocumentMapper> {
        &self.mapper
    }

    /// A fresh interceptor for one persistence session.
    pub fn interceptor(&self) -> Arc<IndexInterceptor> {
        Arc::new(IndexInterceptor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.mapper),
        ))
    }

    pub fn add_indexable(&self, entity: &dyn Indexable) -> Result<()> {
        self.mapper
            .map(entity)
            .and_then(|doc| self.store.add_document(&doc))
            .map_err(|e| Error::manager("add indexable", e))
    }

    pub fn update_indexable(&self, entity: &dyn Indexable) -> Result<()> {
        self.mapper
            .map(entity)
            .and_then(|doc| self.store.update_document(&doc))
            .map_err(|e| Error::manager("update indexable", e))
    }

    pub fn remove_indexable(&self, entity: &dyn Indexable) -> Result<()> {
        let class = entity.class_name();
        let Some(id) = entity.entity_id() else {
            return Err(Error::manager(
                "remove indexable",
                Error::Transient {
                    class: class.to_string(),
                },
            ));
        };
        self.store
            .remove_document(&id.to_string(), class)
            .map_err(|e| Error::manager("remove indexable", e))
    }

    /// Stream the matches of `query` to `handler` from a background thread.
    pub fn run_search<H: SearchResultHandler>(
        &self,
        query: &IndexQuery,
        handler: H,
    ) -> Result<SearchHandle<H>> {
        self.executor.search(query, handler)
    }

    /// Run `query` and wait for every match, best ranked first.
    pub fn search(&self, query: &IndexQuery) -> Result<Vec<Document>> {
        let handler = self
            .run_search(query, CollectingHandler::default())?
            .join()?;
        Ok(handler.results)
    }

    pub fn find(&self, id: &str, class: &str) -> Result<Vec<Document>> {
        self.store.find(id, &class.to_lowercase())
    }

    pub fn document_count(&self) -> Result<u64> {
        self.store.document_count()
    }

    /// Replace the index contents with the documents of `entities`.
    ///
    /// Mapping runs in parallel; entities that cannot be mapped are logged
    /// and left out. Returns the number of documents written.
    pub fn rebuild(&self, entities: &[Arc<dyn Indexable>]) -> Result<usize> {
        let mapped: Vec<_> = entities
            .par_iter()
            .map(|entity| self.mapper.map(entity.as_ref()))
            .collect();

        let mut docs = Vec::with_capacity(mapped.len());
        for (entity, result) in entities.iter().zip(mapped) {
            match result {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(
                    class = entity.class_name(),
                    id = ?entity.entity_id(),
                    error = %e,
                    "leaving entity out of rebuilt index"
                ),
            }
        }

        let skipped = entities.len() - docs.len();
        let written = self
            .store
            .replace_all(&docs)
            .map_err(|e| Error::manager("rebuild index", e))?;
        info!(written, skipped, "rebuilt index");
        Ok(written)
    }

    pub fn close(&self) -> Result<()> {
        self.store
            .close()
            .map_err(|e| Error::manager("close index", e))
    }
}
