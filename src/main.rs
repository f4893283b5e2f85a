use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mediamend::config::EngineConfig;
use mediamend::executor::CancelFlag;
use mediamend::canonical::RefScheme;
use mediamend::orphans;
use mediamend::pipeline::{self, RunMode, RunOptions};
use mediamend::store::{JsonContentStore, StatusFilter};

#[derive(Parser)]
#[command(name = "mediamend", about = "Media maintenance for a content-managed site")]
struct Cli {
    /// Engine configuration file (JSON); env vars override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Content documents file backing the JSON store
    #[arg(long, value_name = "PATH")]
    store: PathBuf,

    /// Report what would happen without touching files or content
    #[arg(long)]
    dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    assume_yes: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Convert images to WebP and rewrite every reference
    #[command(about, long_about = None)]
    Convert {
        /// Re-encode even when the target file already exists
        #[arg(long)]
        force: bool,
        /// Skip writing the conversion plan artifact
        #[arg(long)]
        no_plan: bool,
    },
    /// Move referenced assets into per-item slug folders
    #[command(about, long_about = None)]
    Reorganize {
        #[arg(long)]
        no_plan: bool,
        /// Only look at published items
        #[arg(long)]
        published_only: bool,
    },
    /// List on-disk assets no content references (report only)
    #[command(about, long_about = None)]
    Orphans,
    /// Fill empty image alt attributes from filenames
    #[command(about, long_about = None)]
    AltText {
        /// Overwrite existing alt text too
        #[arg(long)]
        force: bool,
    },
    /// Replay a change ledger backward
    #[command(about, long_about = None)]
    Restore {
        /// Ledger file from a previous run
        #[arg(long, value_name = "PATH")]
        ledger: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    mediamend::logging::init();
    let cli = Cli::parse();

    let cfg = EngineConfig::load(cli.config.as_deref()).context("load configuration")?;
    let mode = if cli.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Apply
    };

    print_settings(&cfg, mode);
    if mode.is_apply() && !cli.assume_yes && !confirm()? {
        eprintln!("Aborted.");
        return Ok(());
    }

    let mut store = JsonContentStore::open(&cli.store).context("open content store")?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Stopping after in-flight items...");
                cancel.cancel();
            }
        });
    }

    match cli.cmd {
        Cmd::Convert { force, no_plan } => {
            let opts = RunOptions {
                mode,
                force,
                write_plan: !no_plan,
                status: StatusFilter::All,
            };
            let summary = pipeline::convert_run(&cfg, &mut store, &opts, &cancel).await?;
            print_summary(&summary)?;
        }
        Cmd::Reorganize {
            no_plan,
            published_only,
        } => {
            let opts = RunOptions {
                mode,
                force: false,
                write_plan: !no_plan,
                status: if published_only {
                    StatusFilter::Published
                } else {
                    StatusFilter::All
                },
            };
            let summary = pipeline::reorganize_run(&cfg, &mut store, &opts, &cancel).await?;
            print_summary(&summary)?;
        }
        Cmd::Orphans => {
            let scheme = RefScheme::from_config(&cfg);
            let report = orphans::find_orphans(&store, &scheme, &cfg.log_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Cmd::AltText { force } => {
            let summary = pipeline::alt_text_run(&cfg, &mut store, force, mode)?;
            print_summary(&summary)?;
        }
        Cmd::Restore { ledger } => {
            let opts = RunOptions {
                mode,
                ..RunOptions::default()
            };
            let summary = pipeline::restore_run(&cfg, &mut store, &ledger, &opts, &cancel).await?;
            print_summary(&summary)?;
        }
    }

    Ok(())
}

fn print_settings(cfg: &EngineConfig, mode: RunMode) {
    eprintln!("site url:      {}", cfg.site_url);
    eprintln!("images root:   {}", cfg.images_root().display());
    eprintln!("media root:    {}", cfg.media_root().display());
    eprintln!("log dir:       {}", cfg.log_dir.display());
    eprintln!("webp quality:  {}", cfg.webp_quality);
    eprintln!("workers:       {}", cfg.effective_workers());
    eprintln!("mode:          {:?}", mode);
}

fn confirm() -> Result<bool> {
    eprint!("Proceed with these settings? (yes/no): ");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}

fn print_summary(summary: &pipeline::RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
