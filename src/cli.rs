use clap::{Args, Parser, Subcommand};

use crate::formats::SortMode;
use crate::resolve::DEFAULT_AUTHOR_PREFIX;
use crate::view::DEFAULT_PAGE_BYTES;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Archive every story reachable from a sorted listing.
    Scrape(ScrapeArgs),
    /// Archive specific stories or every story of specific authors.
    Targeted(TargetedArgs),
    /// Render archived stories into static HTML.
    View(ViewArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ArchiveArgs {
    /// Output directory for archived stories (default: `data-<unix millis>`).
    #[arg(long)]
    pub out: Option<String>,

    /// Do not fetch reader chat.
    #[arg(long)]
    pub skip_chat: bool,

    /// Do not download images referenced by chapters and chat.
    #[arg(long)]
    pub no_images: bool,

    /// Platform gateway base URL (falls back to `QUEST_ARCHIVER_API_BASE`).
    #[arg(long)]
    pub api_base: Option<String>,

    /// Retries per fetch before it counts as failed.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Initial retry backoff; doubles on each retry.
    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Pause between stories (politeness).
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,
}

#[derive(Debug, Args)]
pub struct ScrapeArgs {
    #[command(flatten)]
    pub archive: ArchiveArgs,

    /// Listing order to walk.
    #[arg(long, value_enum, default_value_t = SortMode::New)]
    pub sort: SortMode,

    /// First listing page (1-based).
    #[arg(long, default_value_t = 1)]
    pub start_page: u32,

    /// Last listing page, inclusive.
    #[arg(long, default_value_t = 1000)]
    pub end_page: u32,

    /// File of story ids to leave alone, one per line.
    #[arg(long)]
    pub skip_list: Option<String>,
}

#[derive(Debug, Args)]
pub struct TargetedArgs {
    #[command(flatten)]
    pub archive: ArchiveArgs,

    /// A single story id, or an author handle carrying the author prefix.
    #[arg(long, conflicts_with = "target_list", required_unless_present = "target_list")]
    pub target: Option<String>,

    /// File of story ids and author handles, one per line.
    #[arg(long)]
    pub target_list: Option<String>,

    /// Marker that distinguishes author handles from story ids.
    #[arg(long, default_value = DEFAULT_AUTHOR_PREFIX)]
    pub author_prefix: String,
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    /// Archive or directory of archives (default: latest `data-*` directory).
    #[arg(long)]
    pub input: Option<String>,

    /// Treat `--input` as a single archive instead of searching under it.
    #[arg(long)]
    pub single: bool,

    /// Output directory for views; omit to write each view inside its archive.
    #[arg(long)]
    pub out: Option<String>,

    /// Approximate content bytes per rendered page.
    #[arg(long, default_value_t = DEFAULT_PAGE_BYTES)]
    pub page_bytes: usize,
}
