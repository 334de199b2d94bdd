use std::{
    path::Path,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::Duration,
};

use gtd_index::{
    EntityId,
    EntityStore,
    Error,
    IndexConfig,
    IndexInterceptor,
    IndexManager,
    Indexable,
    LifecycleListener,
    Persistent,
    model::{ActionItem, Entity, Project},
    query::IndexQuery,
    search::CollectingHandler,
};

fn setup(root: &Path) -> (IndexManager, EntityStore) {
    let manager =
        IndexManager::with_model(IndexConfig::on_disk(root.join("index")));
    let store = EntityStore::open(&root.join("entities.redb"))
        .unwrap()
        .with_listener(manager.interceptor());
    (manager, store)
}

fn names(manager: &IndexManager, query: &str) -> Vec<String> {
    manager
        .search(&IndexQuery::text(query))
        .unwrap()
        .into_iter()
        .filter_map(|d| d.get("name").map(str::to_string))
        .collect()
}

#[test]
fn flushes_keep_index_in_sync() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, store) = setup(tmp.path());

    let mut work = store.begin();
    work.save(Project::new("Oogedy Booegedy Boo"))
        .save(ActionItem::new("Buy fence paint"));
    let saved = work.flush().unwrap();
    assert_eq!(manager.document_count().unwrap(), 2);
    assert_eq!(names(&manager, "oogedy"), vec!["Oogedy Booegedy Boo"]);

    let Entity::Project(mut project) = saved[0].clone() else {
        panic!("expected project");
    };
    project.name = "Ooh La La".into();
    let mut work = store.begin();
    work.update(project.clone());
    work.flush().unwrap();

    assert!(names(&manager, "oogedy").is_empty());
    assert_eq!(names(&manager, "ooh"), vec!["Ooh La La"]);
    assert_eq!(manager.find("1", "project").unwrap().len(), 1);

    let mut work = store.begin();
    work.delete(project);
    work.flush().unwrap();

    assert!(manager.find("1", "project").unwrap().is_empty());
    assert_eq!(manager.document_count().unwrap(), 1);
}

#[test]
fn trashed_entities_stay_indexed_as_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, store) = setup(tmp.path());

    let mut item = ActionItem::new("Call plumber");
    item.project = Some(EntityId(3));
    let mut work = store.begin();
    work.save(item);
    let saved = work.flush().unwrap().remove(0);

    let mut work = store.begin();
    work.trash(saved);
    work.flush().unwrap();

    let hits = manager
        .search(&IndexQuery::text("deleted:true AND class:actionitem"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(!hits[0].contains("project"));
}

#[test]
fn aborted_flush_leaves_index_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, store) = setup(tmp.path());

    let mut work = store.begin();
    work.save(Project::new("Never committed"))
        .update(Project::new("Ghost").with_id(77));
    assert!(work.flush().is_err());

    assert_eq!(store.count().unwrap(), 0);
    let hits = manager.search(&IndexQuery::text("committed")).unwrap();
    assert!(hits.is_empty());
}

#[test]
fn index_survives_reopen_and_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let (manager, store) = setup(tmp.path());
        let mut work = store.begin();
        work.save(Project::new("Garden")).save(Project::new("Garage"));
        work.flush().unwrap();
        manager.close().unwrap();
    }

    let (manager, store) = setup(tmp.path());
    assert_eq!(manager.document_count().unwrap(), 2);

    std::fs::remove_dir_all(tmp.path().join("index")).unwrap();
    let manager = IndexManager::with_model(IndexConfig::on_disk(
        tmp.path().join("index"),
    ));
    assert!(matches!(manager.document_count(), Err(Error::Read(_))));

    let entities: Vec<Arc<dyn Indexable>> = store
        .list_all()
        .unwrap()
        .into_iter()
        .map(Entity::into_indexable)
        .collect();
    assert_eq!(manager.rebuild(&entities).unwrap(), 2);
    assert_eq!(names(&manager, "garage"), vec!["Garage"]);
}

#[test]
fn search_on_missing_index_reports_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let manager =
        IndexManager::with_model(IndexConfig::on_disk(tmp.path().join("index")));

    let handler = manager
        .run_search(&IndexQuery::text("anything"), CollectingHandler::default())
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(handler.expected, Some(0));
    assert!(handler.results.is_empty());
    assert!(!tmp.path().join("index").exists());
}

#[test]
fn cached_searcher_is_refreshed_after_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, store) = setup(tmp.path());

    let mut work = store.begin();
    work.save(Project::new("First"));
    work.flush().unwrap();

    let before = manager.store().searcher().unwrap();
    assert_eq!(before.num_docs(), 1);

    let mut work = store.begin();
    work.save(Project::new("Second"));
    work.flush().unwrap();

    assert!(!before.is_current(manager.store()));
    assert_eq!(manager.store().searcher().unwrap().num_docs(), 2);
}

/// Forwards to an interceptor, stalling after the first commit is reported.
struct StallAfterFirstCommit {
    inner: Arc<IndexInterceptor>,
    first: AtomicBool,
    committed: Mutex<Option<mpsc::Sender<()>>>,
}

impl LifecycleListener for StallAfterFirstCommit {
    fn on_insert(&self, entity: Arc<dyn Persistent>) {
        self.inner.on_insert(entity);
    }

    fn on_update(&self, entity: Arc<dyn Persistent>) {
        self.inner.on_update(entity);
    }

    fn on_delete(&self, entity: Arc<dyn Persistent>) {
        self.inner.on_delete(entity);
    }

    fn on_flush_completed(&self) {
        if self.first.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.committed.lock().unwrap().take() {
                tx.send(()).unwrap();
            }
            std::thread::sleep(Duration::from_millis(150));
        }
        self.inner.on_flush_completed();
    }

    fn on_flush_aborted(&self) {
        self.inner.on_flush_aborted();
    }
}

#[test]
fn rolled_back_flush_never_reaches_the_index() {
    let tmp = tempfile::tempdir().unwrap();
    let manager =
        IndexManager::with_model(IndexConfig::on_disk(tmp.path().join("index")));
    let (tx, rx) = mpsc::channel();
    let store = EntityStore::open(&tmp.path().join("entities.redb"))
        .unwrap()
        .with_listener(Arc::new(StallAfterFirstCommit {
            inner: manager.interceptor(),
            first: AtomicBool::new(true),
            committed: Mutex::new(Some(tx)),
        }));

    std::thread::scope(|s| {
        let committed = s.spawn(|| {
            let mut work = store.begin();
            work.save(Project::new("Committed").with_id(1));
            work.flush().unwrap();
        });
        rx.recv().unwrap();
        let rolled_back = s.spawn(|| {
            let mut work = store.begin();
            work.save(Project::new("Rolled back").with_id(2))
                .update(Project::new("Ghost").with_id(99));
            assert!(work.flush().is_err());
        });
        committed.join().unwrap();
        rolled_back.join().unwrap();
    });

    assert_eq!(manager.find("1", "project").unwrap().len(), 1);
    assert!(manager.find("2", "project").unwrap().is_empty());
    assert_eq!(store.count().unwrap(), 1);
}
