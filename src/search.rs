use std::{
    cmp::Ordering,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    thread::JoinHandle,
};

use tantivy::query::Query;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    index_store::IndexStore,
    mapper::Document,
    query::IndexQuery,
};

/// Receives the results of one search, on the search thread.
///
/// `set_number_of_results` is called exactly once, before any result.
pub trait SearchResultHandler: Send + 'static {
    fn set_number_of_results(&mut self, count: usize);

    fn handle_search_result(&mut self, document: Document);
}

/// Gathers every result in memory.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub expected: Option<usize>,
    pub results: Vec<Document>,
}

impl SearchResultHandler for CollectingHandler {
    fn set_number_of_results(&mut self, count: usize) {
        self.expected = Some(count);
        self.results.reserve(count);
    }

    fn handle_search_result(&mut self, document: Document) {
        self.results.push(document);
    }
}

/// Shared flag telling a running search to stop delivering results.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Orders documents by descending `rank`. Documents without a numeric rank
/// come after ranked ones; equal ranks compare equal, so a stable sort keeps
/// relevance order among them.
pub fn by_rank(a: &Document, b: &Document) -> Ordering {
    match (a.rank(), b.rank()) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// A search running in the background.
#[derive(Debug)]
pub struct SearchHandle<H> {
    token: CancellationToken,
    thread: JoinHandle<H>,
}

impl<H> SearchHandle<H> {
    /// Stop delivering results. Results already handed out stay delivered.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the search to finish and take the handler back.
    pub fn join(self) -> Result<H> {
        self.thread.join().map_err(|_| Error::SearchAborted)
    }
}

/// Runs queries on a background thread and streams results to a handler.
#[derive(Debug, Clone)]
pub struct SearchExecutor {
    store: Arc<IndexStore>,
}

impl SearchExecutor {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self { store }
    }

    /// Start a search. A malformed query fails here, on the caller's thread.
    pub fn search<H: SearchResultHandler>(
        &self,
        query: &IndexQuery,
        handler: H,
    ) -> Result<SearchHandle<H>> {
        self.search_with_token(query, handler, CancellationToken::new())
    }

    /// Like [`SearchExecutor::search`], observing an existing token.
    pub fn search_with_token<H: SearchResultHandler>(
        &self,
        query: &IndexQuery,
        handler: H,
        token: CancellationToken,
    ) -> Result<SearchHandle<H>> {
        let compiled = match self.store.compile(query) {
            Ok(compiled) => Some(compiled),
            Err(e @ Error::Query(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "index unavailable, search yields no results");
                None
            }
        };

        let store = Arc::clone(&self.store);
        let thread_token = token.clone();
        let thread = std::thread::Builder::new()
            .name("index-search".into())
            .spawn(move || run(&store, compiled, handler, &thread_token))?;

        Ok(SearchHandle { token, thread })
    }
}

fn run<H: SearchResultHandler>(
    store: &IndexStore,
    query: Option<Box<dyn Query>>,
    mut handler: H,
    token: &CancellationToken,
) -> H {
    let mut documents = match query {
        None => Vec::new(),
        Some(query) => match store.searcher().and_then(|s| s.documents(&*query)) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(error = %e, "search failed, reporting no results");
                Vec::new()
            }
        },
    };
    documents.sort_by(by_rank);

    let total = documents.len();
    handler.set_number_of_results(total);
    for (delivered, document) in documents.into_iter().enumerate() {
        if token.is_cancelled() {
            debug!(delivered, total, "search cancelled");
            break;
        }
        handler.handle_search_result(document);
    }
    handler
}

#[cfg(test)]
mod tests {
    use std::thread::ThreadId;

    use super::*;
    use crate::index_store::IndexConfig;

    fn store_with(docs: &[Document]) -> Arc<IndexStore> {
        let store = IndexStore::open_in_ram(vec!["name".into(), "rank".into()])
            .unwrap();
        for doc in docs {
            store.add_document(doc).unwrap();
        }
        Arc::new(store)
    }

    fn ranked(id: u64, rank: &str) -> Document {
        Document::for_entity(id, "project")
            .with("name", "shared word")
            .with("rank", rank)
    }

    fn ranks(handler: &CollectingHandler) -> Vec<&str> {
        handler
            .results
            .iter()
            .map(|d| d.get("rank").unwrap_or("-"))
            .collect()
    }

    #[test]
    fn results_are_ordered_by_descending_rank() {
        let store = store_with(&[
            ranked(1, "0.2"),
            ranked(2, "0.9"),
            ranked(3, "0.5"),
        ]);
        let executor = SearchExecutor::new(store);

        let handler = executor
            .search(&IndexQuery::text("shared"), CollectingHandler::default())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(handler.expected, Some(3));
        assert_eq!(ranks(&handler), vec!["0.9", "0.5", "0.2"]);
    }

    #[test]
    fn unranked_documents_follow_ranked_ones() {
        let unranked = Document::for_entity(4, "project").with("name", "shared");
        let mut docs = vec![unranked.clone(), ranked(5, "0.1")];
        docs.sort_by(by_rank);

        assert_eq!(docs[0].id(), Some("5"));
        assert_eq!(docs[1], unranked);
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<String>,
        thread: Option<ThreadId>,
    }

    impl SearchResultHandler for Recorder {
        fn set_number_of_results(&mut self, count: usize) {
            self.thread = Some(std::thread::current().id());
            self.events.push(format!("count:{count}"));
        }

        fn handle_search_result(&mut self, document: Document) {
            self.events
                .push(format!("doc:{}", document.id().unwrap_or_default()));
        }
    }

    #[test]
    fn count_is_reported_first_on_another_thread() {
        let store = store_with(&[ranked(1, "0.3"), ranked(2, "0.7")]);
        let executor = SearchExecutor::new(store);

        let recorder = executor
            .search(&IndexQuery::class("project"), Recorder::default())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(recorder.events, vec!["count:2", "doc:2", "doc:1"]);
        assert_ne!(recorder.thread, Some(std::thread::current().id()));
    }

    #[test]
    fn no_match_reports_zero() {
        let store = store_with(&[ranked(1, "0.3")]);
        let recorder = SearchExecutor::new(store)
            .search(&IndexQuery::text("absent"), Recorder::default())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(recorder.events, vec!["count:0"]);
    }

    #[test]
    fn missing_index_reports_zero_results() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::new(IndexConfig::on_disk(
            tmp.path().join("never-created"),
        )));

        let recorder = SearchExecutor::new(store)
            .search(&IndexQuery::text("anything"), Recorder::default())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(recorder.events, vec!["count:0"]);
    }

    #[test]
    fn malformed_query_fails_synchronously() {
        let store = store_with(&[]);
        let err = SearchExecutor::new(store)
            .search(&IndexQuery::term("colour", "red"), Recorder::default())
            .unwrap_err();

        assert!(matches!(err, Error::Query(_)));
    }

    struct CancelAfterFirst {
        token: CancellationToken,
        delivered: usize,
    }

    impl SearchResultHandler for CancelAfterFirst {
        fn set_number_of_results(&mut self, _count: usize) {}

        fn handle_search_result(&mut self, _document: Document) {
            self.delivered += 1;
            self.token.cancel();
        }
    }

    #[test]
    fn cancellation_stops_delivery() {
        let store = store_with(&[
            ranked(1, "0.1"),
            ranked(2, "0.2"),
            ranked(3, "0.3"),
        ]);
        let token = CancellationToken::new();
        let handler = CancelAfterFirst {
            token: token.clone(),
            delivered: 0,
        };

        let handler = SearchExecutor::new(store)
            .search_with_token(&IndexQuery::class("project"), handler, token)
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(handler.delivered, 1);
    }

    #[test]
    fn cancelled_before_start_delivers_nothing() {
        let store = store_with(&[ranked(1, "0.1")]);
        let token = CancellationToken::new();
        token.cancel();

        let handler = SearchExecutor::new(store)
            .search_with_token(
                &IndexQuery::class("project"),
                CollectingHandler::default(),
                token,
            )
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(handler.expected, Some(1));
        assert!(handler.results.is_empty());
    }
}
