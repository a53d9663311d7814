mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use hmo_core::tags::OutputFormat;
use hmo_core::{CancellationToken, Config};
use log::LevelFilter;

#[derive(Parser)]
#[command(
    name = "hmo",
    version,
    about = "Home media organizer - fix, organize and maintain a photo/video library"
)]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (default: <config dir>/home-media-organizer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Selection and run options shared by the file commands.
#[derive(Args, Debug, Clone)]
pub struct Common {
    /// Directories or files to be processed
    #[arg(required = true)]
    pub items: Vec<PathBuf>,

    /// Only files ending with one of these suffixes or matching these patterns, e.g. .jpg '*.mp4'
    #[arg(long, num_args = 1..)]
    pub file_types: Vec<String>,

    /// Only files with these metadata: KEY, KEY=VALUE or a KEY pattern with '*'
    #[arg(long, num_args = 1..)]
    pub with_exif: Vec<String>,

    /// Only files without these metadata
    #[arg(long, num_args = 1..)]
    pub without_exif: Vec<String>,

    /// Number of parallel jobs (default: number of cores)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Proceed with all actions without prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would be done without changing anything
    #[arg(short, long)]
    pub no: bool,

    /// Manifest database holding file hashes and tags
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

/// Date shift amounts.
#[derive(Args, Debug, Clone)]
pub struct ShiftArgs {
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub years: i32,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub months: i32,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub weeks: i64,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub days: i64,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub hours: i64,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub minutes: i64,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub seconds: i64,
}

#[derive(Subcommand)]
pub enum Command {
    /// List selected media files
    List {
        #[command(flatten)]
        common: Common,
    },
    /// Show all or selected metadata
    ShowExif {
        #[command(flatten)]
        common: Common,
        /// Keys to show; '*' patterns match present keys
        #[arg(long, num_args = 1..)]
        keys: Vec<String>,
        /// json or text
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },
    /// Rename files to their date-derived name
    Rename {
        #[command(flatten)]
        common: Common,
        /// strftime format of the new name (default: %Y%m%d_%H%M%S)
        #[arg(long)]
        format: Option<String>,
    },
    /// Move files into dated folders under the media root
    Organize {
        #[command(flatten)]
        common: Common,
        /// Root of the media library
        #[arg(long)]
        media_root: Option<PathBuf>,
        /// strftime pattern of the dated folders (default: %Y/%b)
        #[arg(long)]
        dir_pattern: Option<String>,
        /// Album folder below the dated folder
        #[arg(long)]
        album: Option<String>,
    },
    /// Remove files with identical content, keeping the deepest path
    Dedup {
        #[command(flatten)]
        common: Common,
        /// Ignore cached digests and re-examine all content
        #[arg(long)]
        no_cache: bool,
        /// JSON digest cache file
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Check whether media files are corrupted
    Validate {
        #[command(flatten)]
        common: Common,
        /// Remove corrupted files
        #[arg(long)]
        remove: bool,
    },
    /// Shift all (or selected) date values
    ShiftExif {
        #[command(flatten)]
        common: Common,
        #[command(flatten)]
        shift: ShiftArgs,
        /// Limit to these date keys
        #[arg(long, num_args = 1..)]
        keys: Vec<String>,
    },
    /// Set metadata values
    SetExif {
        #[command(flatten)]
        common: Common,
        /// KEY=VALUE pairs
        #[arg(long, num_args = 1.., required = true)]
        values: Vec<String>,
        /// Replace values that are already present
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove unwanted files and empty directories
    Cleanup {
        /// Directories to clean
        #[arg(required = true)]
        items: Vec<PathBuf>,
        /// File name patterns to remove (default: camera and viewer leftovers)
        #[arg(long, num_args = 1..)]
        patterns: Vec<String>,
        #[arg(short, long)]
        yes: bool,
        #[arg(short, long)]
        no: bool,
    },
    /// Tag files with the results of classifiers
    Classify {
        #[command(flatten)]
        common: Common,
        /// Models such as age, emotion:retinaface, nudenet
        #[arg(long, num_args = 1.., required = true)]
        models: Vec<String>,
        /// Accept only these tags
        #[arg(long, num_args = 1..)]
        tags: Option<Vec<String>>,
        /// Minimum score for a tag to be assigned
        #[arg(long)]
        threshold: Option<f64>,
        /// Remove all existing tags first
        #[arg(long)]
        overwrite: bool,
        /// Run the detectors again instead of using stored results
        #[arg(long)]
        no_cache: bool,
    },
    /// Attach tags to files
    SetTags {
        #[command(flatten)]
        common: Common,
        #[arg(long, num_args = 1.., required = true)]
        tags: Vec<String>,
        /// KEY=VALUE metadata stored with each tag
        #[arg(long, num_args = 1..)]
        metadata: Vec<String>,
        /// Remove all existing tags first
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove tags from files
    RemoveTags {
        #[command(flatten)]
        common: Common,
        #[arg(long, num_args = 1.., required = true)]
        tags: Vec<String>,
    },
    /// Show files having any of the tags (all tagged files by default)
    ShowTags {
        #[command(flatten)]
        common: Common,
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
        /// json or text
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::Warn
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = Config::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing current files...");
        handler_token.cancel();
    })?;

    let ctx = commands::Context { config, cancel };
    commands::run(&ctx, cli.command)
}
