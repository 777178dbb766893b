use std::path::PathBuf;

use clap::{ArgAction, Parser};

pub const FARM_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nOptions:\n{options}\n";

pub const FARM_BEFORE_HELP: &str = concat!(
    "pkgfarm ",
    env!("CARGO_PKG_VERSION"),
    " – incremental isolated package-build farm\n\n",
    "Mirrors the configured catalogs, restores the sandbox VM per group,\n",
    "builds whatever changed since the last run, and serves the results as\n",
    "a built catalog for subsequent builds.",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    before_help = FARM_BEFORE_HELP,
    help_template = FARM_HELP_TEMPLATE
)]
pub struct FarmCli {
    /// Path to the farm configuration file.
    #[arg(short, long, default_value = "pkgfarm.toml")]
    pub config: PathBuf,

    /// Override the work directory from the config file.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Reuse the existing snapshot and cached baseline listing.
    #[arg(long)]
    pub skip_install: bool,

    /// Reuse the existing catalog mirror instead of refreshing it.
    #[arg(long)]
    pub skip_archive: bool,

    /// Plan only; attempt no builds.
    #[arg(long)]
    pub skip_build: bool,

    /// Leave the documentation tree as it is.
    #[arg(long)]
    pub skip_docs: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,

    /// Force trace logging regardless of -v.
    #[arg(long)]
    pub trace: bool,

    /// Suppress informational logging.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
