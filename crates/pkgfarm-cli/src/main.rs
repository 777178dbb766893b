#![deny(clippy::all, warnings)]

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use pkgfarm_core::{run_farm, FarmConfig};

mod cli;

use cli::FarmCli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = FarmCli::parse();
    init_tracing(&cli);

    let mut config = FarmConfig::load(&cli.config)
        .map_err(|err| eyre!("cannot load {}: {err:?}", cli.config.display()))?;
    apply_overrides(&cli, &mut config);

    let summary = run_farm(&config).map_err(|err| eyre!("{err:?}"))?;
    if !cli.quiet {
        println!(
            "planned {} / built {} / failed {} / {} known failures untouched{}",
            summary.planned,
            summary.built,
            summary.failed,
            summary.up_to_date_failures,
            if summary.docs_assembled {
                " / docs assembled"
            } else {
                ""
            }
        );
    }
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn apply_overrides(cli: &FarmCli, config: &mut FarmConfig) {
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }
    config.skip_install |= cli.skip_install;
    config.skip_archive |= cli.skip_archive;
    config.skip_build |= cli.skip_build;
    config.skip_docs |= cli.skip_docs;
}

fn init_tracing(cli: &FarmCli) {
    let level = if cli.trace {
        "trace"
    } else if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = format!("pkgfarm_core={level},pkgfarm_domain={level},pkgfarm_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
