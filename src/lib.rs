//! gtd-index - keeps a full-text index in step with a GTD entity store.
//!
//! Entities (projects, action items, contexts, ...) live in a
//! [redb](https://github.com/cberner/redb) store. Every flush of that store
//! reports inserted, updated and deleted entities to an [`IndexInterceptor`],
//! which maps them to flat documents and applies the changes to a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index once the flush
//! completes. Searches run on a background thread and stream ranked results
//! to a [`SearchResultHandler`].
//!
//! # Quick start
//!
//! ```no_run
//! use gtd_index::{DataDir, EntityStore, IndexConfig, IndexManager};
//! use gtd_index::model::Project;
//! use gtd_index::query::IndexQuery;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let manager =
//!     IndexManager::with_model(IndexConfig::on_disk(data_dir.index_dir()));
//! let store = EntityStore::open(&data_dir.entities_db())
//!     .unwrap()
//!     .with_listener(manager.interceptor());
//!
//! let mut work = store.begin();
//! work.save(Project::new("Paint the fence"));
//! work.flush().unwrap();
//!
//! for doc in manager.search(&IndexQuery::text("fence")).unwrap() {
//!     println!("{}:{}", doc.class().unwrap_or("?"), doc.id().unwrap_or("?"));
//! }
//! ```

pub mod data_dir;
pub mod entity;
pub mod error;
pub mod index_store;
pub mod interceptor;
pub mod manager;
pub mod mapper;
pub mod model;
pub mod persistence;
pub mod query;
pub mod search;

pub use data_dir::DataDir;
pub use entity::{EntityId, FieldKind, Indexable, Persistent, PropertyValue};
pub use error::{Error, Result};
pub use index_store::{IndexConfig, IndexOp, IndexStore};
pub use interceptor::IndexInterceptor;
pub use manager::IndexManager;
pub use mapper::{Document, DocumentMapper, MappingRule};
pub use persistence::{EntityStore, LifecycleListener, UnitOfWork};
pub use search::{SearchExecutor, SearchResultHandler};
