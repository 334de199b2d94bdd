use clap::Parser;
use gtd_index::{
    DataDir,
    EntityStore,
    IndexConfig,
    IndexManager,
    entity::{EntityId, Indexable},
    error::{self, Error},
    model::Entity,
    query::IndexQuery,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, EntityRef};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("GTD_INDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    let command = match cli.command {
        Command::Completions(args) => {
            args.generate();
            return Ok(());
        }
        command => command,
    };
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let index_dir = match command {
        Command::Import(_)
        | Command::Delete(_)
        | Command::Trash(_)
        | Command::Rebuild => data_dir.ensure_index_dir()?,
        _ => data_dir.index_dir(),
    };
    let manager = IndexManager::with_model(IndexConfig::on_disk(index_dir));
    let store = EntityStore::open(&data_dir.entities_db())?
        .with_listener(manager.interceptor());

    match command {
        Command::Import(args) => cmd_import(&store, &args)?,
        Command::Delete(target) => cmd_delete(&store, &target)?,
        Command::Trash(target) => cmd_trash(&store, &target)?,
        Command::Search(args) => cmd_search(&manager, &args)?,
        Command::Show(args) => cmd_show(&store, &manager, &args)?,
        Command::Rebuild => cmd_rebuild(&store, &manager)?,
        Command::Status(args) => {
            cmd_status(&store, &manager, &data_dir, args.json)?
        }
        Command::Completions(_) => {}
    }

    manager.close()
}

fn cmd_import(store: &EntityStore, args: &cli::ImportArgs) -> error::Result<()> {
    let content = std::fs::read_to_string(&args.file)?;
    let entities: Vec<Entity> = serde_json::from_str(&content)?;
    if entities.is_empty() {
        eprintln!("Nothing to import.");
        return Ok(());
    }

    let mut work = store.begin();
    for entity in entities {
        work.save(entity);
    }
    let saved = work.flush()?;

    println!("Imported {} entities", saved.len());
    for entity in &saved {
        if let Some(id) = entity.id() {
            println!("  {}:{id}", entity.class_name());
        }
    }
    Ok(())
}

fn load(store: &EntityStore, target: &EntityRef) -> error::Result<Entity> {
    let class = target.kind.class();
    store
        .get(class, EntityId(target.id))?
        .ok_or_else(|| Error::NotFound {
            kind: class,
            name: target.id.to_string(),
        })
}

fn cmd_delete(store: &EntityStore, target: &EntityRef) -> error::Result<()> {
    let entity = load(store, target)?;
    let mut work = store.begin();
    work.delete(entity);
    work.flush()?;
    println!("Deleted {}:{}", target.kind.class(), target.id);
    Ok(())
}

fn cmd_trash(store: &EntityStore, target: &EntityRef) -> error::Result<()> {
    let entity = load(store, target)?;
    let mut work = store.begin();
    work.trash(entity);
    work.flush()?;
    println!("Trashed {}:{}", target.kind.class(), target.id);
    Ok(())
}

fn cmd_search(manager: &IndexManager, args: &cli::SearchArgs) -> error::Result<()> {
    let mut query = IndexQuery::text(&args.query);
    if let Some(kind) = args.kind {
        query = query.and(IndexQuery::class(kind.class()));
    }

    let mut results = manager.search(&query)?;
    if args.count > 0 {
        results.truncate(args.count);
    }

    if args.json {
        println!("{}", serde_json::to_string(&results)?);
    } else if results.is_empty() {
        println!("No results.");
    } else {
        for doc in &results {
            let label = ["name", "title", "description"]
                .iter()
                .find_map(|field| doc.get(field))
                .unwrap_or("");
            println!(
                "{}:{}\t{label}",
                doc.class().unwrap_or("?"),
                doc.id().unwrap_or("?")
            );
        }
    }
    Ok(())
}

fn cmd_show(
    store: &EntityStore,
    manager: &IndexManager,
    args: &cli::ShowArgs,
) -> error::Result<()> {
    let entity = load(store, &args.entity)?;
    let indexed = match manager.find(&args.entity.id.to_string(), entity.class_name()) {
        Ok(docs) => !docs.is_empty(),
        Err(Error::Read(_)) => false,
        Err(e) => return Err(e),
    };

    if args.json {
        let value = serde_json::json!({ "entity": entity, "indexed": indexed });
        println!("{value}");
    } else {
        println!("{}", serde_json::to_string_pretty(&entity)?);
        println!("indexed: {}", if indexed { "yes" } else { "no" });
    }
    Ok(())
}

fn cmd_rebuild(store: &EntityStore, manager: &IndexManager) -> error::Result<()> {
    let entities: Vec<std::sync::Arc<dyn Indexable>> = store
        .list_all()?
        .into_iter()
        .map(Entity::into_indexable)
        .collect();
    if entities.is_empty() {
        eprintln!("No entities to index.");
    }

    let written = manager.rebuild(&entities)?;
    println!("Indexed {written} of {} entities", entities.len());
    Ok(())
}

fn cmd_status(
    store: &EntityStore,
    manager: &IndexManager,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let entities = store.count()?;
    let documents = match manager.document_count() {
        Ok(count) => Some(count),
        Err(Error::Read(_)) => None,
        Err(e) => return Err(e),
    };

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root(),
            "index": data_dir.index_dir(),
            "entities": entities,
            "documents": documents,
        });
        println!("{value}");
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Index: {}", data_dir.index_dir().display());
        println!("Entities: {entities}");
        match documents {
            Some(count) => println!("Documents: {count}"),
            None => println!("Documents: index not built"),
        }
    }
    Ok(())
}
