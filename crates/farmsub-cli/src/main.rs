use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use farmsub_core::{Batch, BucketId, EnvId, ItemId, ItemReport, SessionDoc};
use farmsub_dispatch::{
    run_worker, submit_deferred, submit_local, DispatcherRegistry, Services, SubmitReport,
};
use farmsub_resolve::resolve_all;
use farmsub_services::{JsonProductionFile, MemScheduler};
use farmsub_store_sqlite::SqliteSharedStore;

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "farmsub", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default farmsub.toml in the current directory
    Init,

    /// Resolve a session and print per-item frames and versions, submitting nothing
    Resolve {
        #[arg(long)]
        session: PathBuf,
    },

    /// Submit a session: resolve, create paused jobs, wire dependencies, release
    Submit {
        #[arg(long)]
        session: PathBuf,
        /// Hand each environment to a detached worker instead of submitting here
        #[arg(long)]
        defer: bool,
        /// Join an existing submission bucket instead of minting one
        #[arg(long)]
        bucket: Option<String>,
    },

    /// Run one deferred-submission worker for a single environment
    Worker {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        env: Uuid,
        #[arg(long)]
        bucket: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let config_path = Config::path(&cwd);

    match cli.cmd {
        Command::Init => {
            if config_path.exists() {
                bail!("{} already exists", config_path.display());
            }
            Config::default().save_to(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Command::Resolve { session } => {
            let cfg = Config::load_from(&config_path)?;
            let production = load_production(&cfg)?;
            let mut batch = load_batch(&session)?;
            let items = resolve_all(&mut batch, &cfg.resolution(), &production, &production);
            print_resolution(&batch, &items);
        }
        Command::Submit { session, defer, bucket } => {
            let cfg = Config::load_from(&config_path)?;
            let production = load_production(&cfg)?;
            let store = SqliteSharedStore::open(&cfg.store_path())?;
            let scheduler = MemScheduler::new();
            let services = Services {
                scheduler: &scheduler,
                store: &store,
                production: &production,
                versions: &production,
            };
            let bucket = bucket.map(BucketId::from_str).unwrap_or_else(BucketId::mint);
            let mut batch = load_batch(&session)?;

            let report = if defer {
                let dispatchers = DispatcherRegistry::new();
                submit_deferred(
                    &mut batch,
                    &cfg.resolution(),
                    services,
                    bucket,
                    &session,
                    &dispatchers,
                    &cfg.dispatch.host_app,
                )?
            } else {
                let report = submit_local(&mut batch, &cfg.resolution(), services, bucket);
                SessionDoc::capture(&batch).save(&session)?;
                report
            };
            print_report(&report);
            for job in scheduler.jobs() {
                println!(
                    "job {} {:?} \"{}\" layers={} tasks={}",
                    job.id,
                    job.state,
                    job.spec.name,
                    job.layers.len(),
                    job.tasks.len()
                );
            }
        }
        Command::Worker { session, env, bucket } => {
            let cfg = Config::load_from(&config_path)?;
            let production = load_production(&cfg)?;
            let store = SqliteSharedStore::open(&cfg.store_path())?;
            let scheduler = MemScheduler::new();
            let report = run_worker(
                &session,
                EnvId(env),
                BucketId::from_str(bucket),
                &cfg.resolution(),
                Services {
                    scheduler: &scheduler,
                    store: &store,
                    production: &production,
                    versions: &production,
                },
            )?;
            print_report(&report);
        }
    }

    Ok(())
}

fn load_batch(path: &Path) -> anyhow::Result<Batch> {
    let doc = SessionDoc::load(path)
        .with_context(|| format!("load session {}", path.display()))?;
    let mut batch = Batch::new();
    let loaded = doc.apply(&mut batch);
    tracing::debug!(loaded, "session loaded");
    Ok(batch)
}

fn load_production(cfg: &Config) -> anyhow::Result<JsonProductionFile> {
    match &cfg.production.ranges_file {
        Some(path) => {
            let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
            Ok(JsonProductionFile::load(&expanded)?)
        }
        None => Ok(JsonProductionFile::empty()),
    }
}

fn print_resolution(batch: &Batch, items: &[ItemReport]) {
    for item in items {
        let frames = match item.item {
            ItemId::Environment(id) => batch
                .environment(id)
                .and_then(|e| e.resolved.as_ref())
                .map(|r| r.queued.to_string()),
            ItemId::Pass(id) => batch
                .pass(id)
                .and_then(|p| p.resolved.as_ref())
                .map(|r| r.queued.to_string()),
        };
        let version = match item.item {
            ItemId::Pass(id) => batch
                .pass(id)
                .and_then(|p| p.resolved_version)
                .map(|v| format!(" v{v:03}")),
            ItemId::Environment(_) => None,
        };
        println!(
            "{} {} {}{}",
            item.label,
            item.outcome,
            frames.unwrap_or_default(),
            version.unwrap_or_default()
        );
    }
}

fn print_report(report: &SubmitReport) {
    println!("bucket {}", report.bucket);
    for item in &report.items {
        println!("{item}");
    }
    for failure in &report.edge_failures {
        println!("edge-failure {} -> {}: {}", failure.source, failure.target, failure.error);
    }
}
