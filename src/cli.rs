use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "gtd-index",
    about = "Keep the full-text index of a GTD store in sync and search it"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Save entities from a JSON file and index them
    Import(ImportArgs),
    /// Delete an entity and its index document
    Delete(EntityRef),
    /// Move an entity to the trash
    Trash(EntityRef),
    /// Search the index
    Search(SearchArgs),
    /// Print a stored entity and whether it is indexed
    Show(ShowArgs),
    /// Rebuild the index from every stored entity
    Rebuild,
    /// Show store and index statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Project,
    ActionItem,
    InboxContext,
    Category,
    Tag,
    ReferenceItem,
}

impl Kind {
    pub fn class(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ActionItem => "actionitem",
            Self::InboxContext => "inboxcontext",
            Self::Category => "category",
            Self::Tag => "tag",
            Self::ReferenceItem => "referenceitem",
        }
    }
}

#[derive(Debug, Parser)]
pub struct EntityRef {
    /// Entity kind
    #[arg(value_enum)]
    pub kind: Kind,

    /// Entity identifier
    pub id: u64,
}

// -- Import --

#[derive(Debug, Parser)]
pub struct ImportArgs {
    /// JSON array of entities, each tagged with its "kind"
    pub file: PathBuf,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Query in the index query language (e.g. `name:garden AND class:project`)
    pub query: String,

    /// Number of results to print (0 prints all)
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Only match entities of this kind
    #[arg(short = 'k', long, value_enum)]
    pub kind: Option<Kind>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Show --

#[derive(Debug, Parser)]
pub struct ShowArgs {
    #[command(flatten)]
    pub entity: EntityRef,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "gtd-index",
            &mut std::io::stdout(),
        );
    }
}
