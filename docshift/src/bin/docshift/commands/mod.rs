pub mod resolve;
pub mod rollback;
pub mod run;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use docshift::{Changeset, MemoryStore, RedisStore, Runner, RunnerOptions, StoreAdapter, Target, loader};

use crate::context::ProjectContext;
use crate::output::OutputManager;
use crate::utils::redact_url;

/// Backing store for a command
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq)]
pub enum StoreKind {
    /// RedisJSON + RediSearch
    #[default]
    Redis,
    /// In-process store, discarded on exit
    Memory,
}

/// Store selection shared by every command
#[derive(Clone, Debug, Default)]
pub struct ConnectionOptions {
    pub store: StoreKind,
    pub redis_url: Option<String>,
}

/// Target and changeset location
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Target to operate on (defaults to [docshift].default_target)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Directory holding changeset files (defaults to [docshift].changesets_dir)
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

/// Everything a command needs: config, target, changesets and a store
pub struct Session {
    pub ctx: ProjectContext,
    pub target: Target,
    pub changesets: Vec<Changeset>,
    pub store: Arc<dyn StoreAdapter>,
}

impl Session {
    pub async fn open(args: &TargetArgs, connection: &ConnectionOptions, output: &OutputManager) -> Result<Self> {
        let ctx = ProjectContext::find()?;
        if let Some(path) = &ctx.config_path {
            output.verbose(&format!("Config: {}", path.display()));
        }

        let target = ctx.target(args.target.as_deref())?;
        output.bullet(&format!("Target: {} (contexts: {})", target.name, target.contexts.join(", ")));

        let dir = ctx.changesets_dir(args.path.as_deref());
        output.progress("Loading changesets");
        let changesets = loader::load_dir(&dir).with_context(|| format!("Failed to load changesets from {}", dir.display()))?;
        output.clear_line();
        output.success(&format!("Loaded {} changeset(s) from {}", changesets.len(), dir.display()));

        let store = connect(&ctx, connection, output).await?;

        Ok(Self {
            ctx,
            target,
            changesets,
            store,
        })
    }

    /// Runner with lock settings from config, adjusted by command flags
    pub fn runner(&self, dry_run: bool, no_lock: bool) -> Runner {
        let mut options = RunnerOptions {
            dry_run,
            ..Default::default()
        };
        options.lock_lease = if no_lock { None } else { self.ctx.lock_lease() };
        Runner::new(self.store.clone()).with_options(options)
    }
}

async fn connect(ctx: &ProjectContext, connection: &ConnectionOptions, output: &OutputManager) -> Result<Arc<dyn StoreAdapter>> {
    match connection.store {
        StoreKind::Memory => {
            output.warning("Using the in-memory store; nothing is persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Redis => {
            let url = match &connection.redis_url {
                Some(url) => url.clone(),
                None => ctx
                    .redis_url()
                    .context("REDIS_URL is not set. Pass --redis-url or set [redis].url")?,
            };
            output.bullet(&format!("Redis: {}", redact_url(&url)));

            output.progress("Connecting to Redis");
            let store = RedisStore::connect(&url, ctx.key_prefix())
                .await
                .context("Failed to connect to Redis")?;
            output.clear_line();
            output.success("Connected to Redis");
            Ok(Arc::new(store))
        }
    }
}
