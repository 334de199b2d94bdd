use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    Searcher,
    TantivyDocument,
    collector::{Count, TopDocs},
    directory::MmapDirectory,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};
use tracing::{debug, info, warn};

use crate::{
    entity::FieldKind,
    error::{Error, Result},
    mapper::Document,
    query::IndexQuery,
};

/// Writer memory budget used unless configured otherwise.
pub const DEFAULT_MEMORY_BUDGET: usize = 15_000_000;

/// Field names used in the schema besides the declared properties.
pub mod fields {
    pub use crate::mapper::fields::{CLASS, ID};

    /// Catch-all field holding every property value, for free-text search.
    pub const TEXT: &str = "text";
    /// The whole document as JSON, returned on lookups.
    pub const PAYLOAD: &str = "payload";

    pub fn is_reserved(name: &str) -> bool {
        matches!(name, ID | CLASS | TEXT | PAYLOAD)
    }
}

/// Where the index lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    Directory(PathBuf),
    /// Volatile index, lost on close. Used by tests.
    InMemory,
}

impl fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "{}", path.display()),
            Self::InMemory => f.write_str("<memory>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub location: IndexLocation,
    pub memory_budget: usize,
    /// Properties that get their own indexed field, with how they are indexed.
    pub fields: BTreeMap<String, FieldKind>,
}

impl IndexConfig {
    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: IndexLocation::Directory(dir.into()),
            memory_budget: DEFAULT_MEMORY_BUDGET,
            fields: BTreeMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: IndexLocation::InMemory,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            fields: BTreeMap::new(),
        }
    }

    /// Declare text properties.
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields
            .extend(fields.into_iter().map(|name| (name, FieldKind::Text)));
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn with_field_kinds(mut self, fields: BTreeMap<String, FieldKind>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }
}

/// A property value parsed for a typed field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TypedValue {
    Integer(i64),
    Float(f64),
    Date(tantivy::DateTime),
}

impl TypedValue {
    /// `None` for text fields, which take the raw string.
    pub fn parse(
        kind: FieldKind,
        raw: &str,
    ) -> std::result::Result<Option<Self>, String> {
        let raw = raw.trim();
        let parsed = match kind {
            FieldKind::Text => return Ok(None),
            FieldKind::Integer => {
                raw.parse().map(Self::Integer).map_err(|e| e.to_string())
            }
            FieldKind::Float => {
                raw.parse().map(Self::Float).map_err(|e| e.to_string())
            }
            FieldKind::Date => parse_date(raw).map(Self::Date),
        };
        parsed
            .map(Some)
            .map_err(|e| format!("`{raw}` is not a valid {kind}: {e}"))
    }

    pub fn term(self, field: Field) -> Term {
        match self {
            Self::Integer(n) => Term::from_field_i64(field, n),
            Self::Float(n) => Term::from_field_f64(field, n),
            Self::Date(d) => Term::from_field_date(field, d),
        }
    }

    fn add_to(self, doc: &mut TantivyDocument, field: Field) {
        match self {
            Self::Integer(n) => doc.add_i64(field, n),
            Self::Float(n) => doc.add_f64(field, n),
            Self::Date(d) => doc.add_date(field, d),
        }
    }
}

/// RFC 3339 timestamps, or a bare `YYYY-MM-DD` taken as midnight UTC.
fn parse_date(raw: &str) -> std::result::Result<tantivy::DateTime, String> {
    let micros = match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t.timestamp_micros(),
        Err(e) => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| e.to_string())?
            .and_hms_opt(0, 0, 0)
            .ok_or("invalid date")?
            .and_utc()
            .timestamp_micros(),
    };
    Ok(tantivy::DateTime::from_timestamp_micros(micros))
}

fn kind_of(entry: &FieldEntry) -> FieldKind {
    match entry.field_type() {
        FieldType::I64(_) => FieldKind::Integer,
        FieldType::F64(_) => FieldKind::Float,
        FieldType::Date(_) => FieldKind::Date,
        _ => FieldKind::Text,
    }
}

/// One change applied by [`IndexStore::apply_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    Add(Document),
    /// Replace the document of the same entity.
    Update(Document),
    Remove { id: String, class: String },
}

/// Resolved field handles for the schema.
#[derive(Debug, Clone)]
pub(crate) struct SchemaFields {
    pub id: Field,
    pub class: Field,
    pub text: Field,
    pub payload: Field,
    pub properties: HashMap<String, (Field, FieldKind)>,
}

impl SchemaFields {
    fn resolve(schema: &Schema) -> std::result::Result<Self, String> {
        let get = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| format!("index schema has no `{name}` field"))
        };
        let properties = schema
            .fields()
            .filter(|(_, entry)| !fields::is_reserved(entry.name()))
            .map(|(field, entry)| {
                (entry.name().to_string(), (field, kind_of(entry)))
            })
            .collect();

        Ok(Self {
            id: get(fields::ID)?,
            class: get(fields::CLASS)?,
            text: get(fields::TEXT)?,
            payload: get(fields::PAYLOAD)?,
            properties,
        })
    }

    /// Field and kind for a queryable name, identity fields included.
    pub fn lookup(&self, name: &str) -> Option<(Field, FieldKind)> {
        match name {
            fields::ID => Some((self.id, FieldKind::Text)),
            fields::CLASS => Some((self.class, FieldKind::Text)),
            fields::TEXT => Some((self.text, FieldKind::Text)),
            _ => self.properties.get(name).copied(),
        }
    }

    /// The class is stored lowercased, matching identity lookups.
    fn to_tantivy(&self, doc: &Document) -> Result<TantivyDocument> {
        let id = doc
            .id()
            .ok_or_else(|| Error::Write("document has no `id` field".into()))?;
        let class = doc
            .class()
            .ok_or_else(|| Error::Write("document has no `class` field".into()))?
            .to_lowercase();

        let mut out = TantivyDocument::default();
        out.add_text(self.id, id);
        out.add_text(self.class, &class);
        for (name, value) in doc.iter() {
            if name == fields::ID || name == fields::CLASS {
                continue;
            }
            if let Some(&(field, kind)) = self.properties.get(name) {
                match TypedValue::parse(kind, value) {
                    Ok(Some(typed)) => typed.add_to(&mut out, field),
                    Ok(None) => out.add_text(field, value),
                    Err(reason) => {
                        return Err(Error::Write(format!(
                            "{class}:{id} property `{name}`: {reason}"
                        )));
                    }
                }
            }
            out.add_text(self.text, value);
        }

        let mut stored = doc.clone();
        stored.insert(fields::CLASS, class);
        out.add_text(self.payload, serde_json::to_string(&stored)?);

        Ok(out)
    }

    fn queue_add(&self, writer: &IndexWriter, doc: &Document) -> Result<()> {
        writer
            .add_document(self.to_tantivy(doc)?)
            .map_err(Error::write)?;
        Ok(())
    }

    fn queue_remove(&self, writer: &IndexWriter, id: &str, class: &str) -> Result<()> {
        writer
            .delete_query(Box::new(self.identity_query(id, class)))
            .map_err(Error::write)?;
        Ok(())
    }

    fn queue_update(&self, writer: &IndexWriter, doc: &Document) -> Result<()> {
        let tantivy_doc = self.to_tantivy(doc)?;
        let (id, class) = (doc.id().unwrap_or(""), doc.class().unwrap_or(""));
        self.queue_remove(writer, id, class)?;
        writer.add_document(tantivy_doc).map_err(Error::write)?;
        Ok(())
    }

    fn queue(&self, writer: &IndexWriter, op: &IndexOp) -> Result<()> {
        match op {
            IndexOp::Add(doc) => self.queue_add(writer, doc),
            IndexOp::Update(doc) => self.queue_update(writer, doc),
            IndexOp::Remove { id, class } => self.queue_remove(writer, id, class),
        }
    }

    fn identity_query(&self, id: &str, class: &str) -> BooleanQuery {
        let clause = |field: Field, value: &str| -> (Occur, Box<dyn Query>) {
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(field, value),
                    IndexRecordOption::Basic,
                )),
            )
        };
        BooleanQuery::new(vec![
            clause(self.id, id),
            clause(self.class, &class.to_lowercase()),
        ])
    }
}

fn text_options() -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    )
}

fn build_schema(properties: &BTreeMap<String, FieldKind>) -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::ID, STRING | STORED);
    builder.add_text_field(fields::CLASS, STRING | STORED);
    builder.add_text_field(fields::TEXT, text_options());
    builder.add_text_field(fields::PAYLOAD, TextOptions::default().set_stored());

    let declared = properties.iter().filter(|(name, _)| {
        !name.is_empty() && !name.starts_with('-') && !fields::is_reserved(name)
    });
    for (name, kind) in declared {
        match kind {
            FieldKind::Text => {
                builder.add_text_field(name, text_options());
            }
            FieldKind::Integer => {
                builder.add_i64_field(
                    name,
                    NumericOptions::default().set_indexed().set_fast(),
                );
            }
            FieldKind::Float => {
                builder.add_f64_field(
                    name,
                    NumericOptions::default().set_indexed().set_fast(),
                );
            }
            FieldKind::Date => {
                builder.add_date_field(
                    name,
                    DateOptions::default().set_indexed().set_fast(),
                );
            }
        }
    }

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

fn index_exists(dir: &Path) -> bool {
    dir.join("meta.json").is_file()
}

#[derive(Clone)]
struct OpenIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// A point-in-time view of the index.
///
/// Snapshots never change; the store hands out a new one once a write has
/// been committed after this one was taken.
#[derive(Clone)]
pub struct IndexSnapshot {
    generation: u64,
    searcher: Searcher,
    payload: Field,
}

impl IndexSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn num_docs(&self) -> u64 {
        self.searcher.num_docs()
    }

    /// Whether no write has been committed since this snapshot was taken.
    pub fn is_current(&self, store: &IndexStore) -> bool {
        self.generation == store.generation()
    }

    /// All documents matching `query`, in relevance order.
    pub fn documents(&self, query: &dyn Query) -> Result<Vec<Document>> {
        let total = self.searcher.search(query, &Count).map_err(Error::read)?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let top_docs = self
            .searcher
            .search(query, &TopDocs::with_limit(total))
            .map_err(Error::read)?;

        let mut docs = Vec::with_capacity(top_docs.len());
        for (_score, doc_address) in top_docs {
            let stored: TantivyDocument =
                self.searcher.doc(doc_address).map_err(Error::read)?;
            docs.push(self.decode(&stored)?);
        }
        Ok(docs)
    }

    fn decode(&self, stored: &TantivyDocument) -> Result<Document> {
        let payload = stored
            .get_first(self.payload)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Read("stored document has no payload".into()))?;
        serde_json::from_str(payload).map_err(Error::read)
    }
}

impl fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Full-text index over entity documents.
///
/// One writer is shared for the lifetime of the store and every mutation is
/// committed before the call returns. Reads go through a cached snapshot
/// which is reloaded whenever a commit happened after it was taken.
pub struct IndexStore {
    config: IndexConfig,
    open: RwLock<Option<OpenIndex>>,
    writer: Mutex<Option<IndexWriter>>,
    snapshot: RwLock<Option<IndexSnapshot>>,
    generation: AtomicU64,
}

impl IndexStore {
    /// Create a store. Nothing touches the disk until first use or `open`.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            open: RwLock::new(None),
            writer: Mutex::new(None),
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Open and create an in-memory store (for testing).
    pub fn open_in_ram(fields: Vec<String>) -> Result<Self> {
        let store = Self::new(IndexConfig::in_memory().with_fields(fields));
        store.open()?;
        Ok(store)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn location(&self) -> &IndexLocation {
        &self.config.location
    }

    pub fn is_open(&self) -> bool {
        self.open.read().is_some()
    }

    /// Number of commits since the store was created.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Open or create the index. Calling it again is a no-op.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let mut guard = self.open.write();
        if guard.is_some() {
            return Ok(());
        }

        let index = self.open_index()?;
        register_tokenizers(&index);
        let fields = SchemaFields::resolve(&index.schema())
            .map_err(|reason| self.unavailable(reason))?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| self.unavailable(e))?;

        info!(
            location = %self.config.location,
            properties = fields.properties.len(),
            "opened index"
        );
        *guard = Some(OpenIndex {
            index,
            reader,
            fields,
        });
        Ok(())
    }

    fn open_index(&self) -> Result<Index> {
        let schema = build_schema(&self.config.fields);
        let dir = match &self.config.location {
            IndexLocation::InMemory => return Ok(Index::create_in_ram(schema)),
            IndexLocation::Directory(dir) => dir,
        };

        std::fs::create_dir_all(dir).map_err(|e| self.unavailable(e))?;
        let readonly = std::fs::metadata(dir)
            .map_err(|e| self.unavailable(e))?
            .permissions()
            .readonly();
        if readonly {
            return Err(self.unavailable("directory is read-only"));
        }

        let mmap_dir =
            MmapDirectory::open(dir).map_err(|e| self.unavailable(e))?;
        let exists =
            Index::exists(&mmap_dir).map_err(|e| self.unavailable(e))?;
        let index = if exists {
            Index::open(mmap_dir)
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())
        };
        index.map_err(|e| self.unavailable(e))
    }

    /// Release the writer and every cached read handle.
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.wait_merging_threads().map_err(Error::write)?;
        }
        *self.snapshot.write() = None;
        *self.open.write() = None;
        info!(location = %self.config.location, "closed index");
        Ok(())
    }

    fn unavailable(&self, reason: impl fmt::Display) -> Error {
        Error::StoreUnavailable {
            location: self.config.location.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The open index, opening (and creating) it if needed.
    fn handle(&self) -> Result<OpenIndex> {
        if let Some(open) = self.open.read().as_ref() {
            return Ok(open.clone());
        }
        self.open()?;
        self.open
            .read()
            .clone()
            .ok_or_else(|| self.unavailable("index closed while opening"))
    }

    /// Like `handle`, but never creates an index on disk.
    fn readable(&self) -> Result<OpenIndex> {
        if let Some(open) = self.open.read().as_ref() {
            return Ok(open.clone());
        }
        if let IndexLocation::Directory(dir) = &self.config.location
            && !index_exists(dir)
        {
            return Err(Error::Read(format!("no index at {}", dir.display())));
        }
        self.handle().map_err(Error::read)
    }

    /// The shared writer, opened on first use.
    ///
    /// Changes made through it become visible after [`IndexStore::commit`].
    ///
    /// # Deadlocks
    ///
    /// The guard holds a non-reentrant lock that every mutation takes.
    /// Drop it before calling `commit`, `add_document` or any other write on
    /// the same thread, or that call never returns.
    pub fn writer(&self) -> Result<MappedMutexGuard<'_, IndexWriter>> {
        let open = self.handle()?;
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let writer = open
                .index
                .writer(self.config.memory_budget)
                .map_err(|e| self.unavailable(e))?;
            debug!(budget = self.config.memory_budget, "opened index writer");
            *guard = Some(writer);
        }
        MutexGuard::try_map(guard, |writer| writer.as_mut())
            .map_err(|_| Error::Write("index writer unavailable".into()))
    }

    /// Commit changes queued through [`IndexStore::writer`].
    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer()?;
        writer.commit().map_err(Error::write)?;
        drop(writer);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Run `apply` against the writer and commit, or roll back on failure.
    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&IndexWriter, &SchemaFields) -> Result<()>,
    {
        let open = self.handle()?;
        let mut writer = self.writer()?;

        let outcome = apply(&*writer, &open.fields)
            .and_then(|()| writer.commit().map(drop).map_err(Error::write));
        if outcome.is_err()
            && let Err(e) = writer.rollback()
        {
            warn!(error = %e, "index rollback failed");
        }
        outcome?;

        drop(writer);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Append a document.
    pub fn add_document(&self, doc: &Document) -> Result<()> {
        self.mutate(|writer, fields| fields.queue_add(writer, doc))?;
        debug!(id = doc.id(), class = doc.class(), "indexed document");
        Ok(())
    }

    /// Delete the documents of entity `(id, class)`. Nothing matching is
    /// not an error.
    pub fn remove_document(&self, id: &str, class: &str) -> Result<()> {
        self.mutate(|writer, fields| fields.queue_remove(writer, id, class))?;
        debug!(id, class, "removed document");
        Ok(())
    }

    /// Replace the document of the same entity. Delete and add land in one
    /// commit.
    pub fn update_document(&self, doc: &Document) -> Result<()> {
        self.mutate(|writer, fields| fields.queue_update(writer, doc))?;
        debug!(id = doc.id(), class = doc.class(), "updated document");
        Ok(())
    }

    /// Queue every op on the writer, then commit once.
    ///
    /// An op that cannot be queued is skipped and its error is reported at
    /// its position in the returned list. The call fails as a whole only
    /// when nothing could be committed.
    pub fn apply_batch(&self, ops: &[IndexOp]) -> Result<Vec<Result<()>>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut outcomes = Vec::with_capacity(ops.len());
        self.mutate(|writer, fields| {
            outcomes.extend(ops.iter().map(|op| fields.queue(writer, op)));
            Ok(())
        })?;

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        debug!(count = ops.len(), failed, "committed index batch");
        Ok(outcomes)
    }

    /// Drop every document and index `docs` instead, in a single commit.
    pub fn replace_all(&self, docs: &[Document]) -> Result<usize> {
        self.mutate(|writer, fields| {
            writer.delete_all_documents().map_err(Error::write)?;
            docs.iter().try_for_each(|doc| fields.queue_add(writer, doc))
        })?;
        info!(count = docs.len(), "replaced index contents");
        Ok(docs.len())
    }

    /// The current snapshot, reloaded first if a commit made it stale.
    pub fn searcher(&self) -> Result<IndexSnapshot> {
        let open = self.readable()?;
        let current = self.generation();

        if let Some(snapshot) = self.snapshot.read().as_ref()
            && snapshot.generation == current
        {
            return Ok(snapshot.clone());
        }

        let mut guard = self.snapshot.write();
        if let Some(snapshot) = guard.as_ref()
            && snapshot.generation == current
        {
            return Ok(snapshot.clone());
        }

        open.reader.reload().map_err(Error::read)?;
        let snapshot = IndexSnapshot {
            generation: current,
            searcher: open.reader.searcher(),
            payload: open.fields.payload,
        };
        debug!(generation = current, "refreshed index searcher");
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The reader backing [`IndexStore::searcher`], reloaded if stale.
    pub fn reader(&self) -> Result<IndexReader> {
        let open = self.readable()?;
        self.searcher()?;
        Ok(open.reader)
    }

    /// Translate a structured query against this index's schema.
    pub fn compile(&self, query: &IndexQuery) -> Result<Box<dyn Query>> {
        let open = self.readable()?;
        query.compile(&open.index, &open.fields)
    }

    /// Point lookup of every document stored for `(id, class)`.
    pub fn find(&self, id: &str, class: &str) -> Result<Vec<Document>> {
        let open = self.readable()?;
        let snapshot = self.searcher()?;
        snapshot.documents(&open.fields.identity_query(id, class))
    }

    pub fn get_document(&self, id: &str, class: &str) -> Result<Option<Document>> {
        Ok(self.find(id, class)?.into_iter().next())
    }

    /// Run `query` synchronously, in relevance order.
    pub fn search_documents(&self, query: &IndexQuery) -> Result<Vec<Document>> {
        let compiled = self.compile(query)?;
        self.searcher()?.documents(&*compiled)
    }

    pub fn document_count(&self) -> Result<u64> {
        Ok(self.searcher()?.num_docs())
    }
}

impl fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStore")
            .field("location", &self.config.location)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
