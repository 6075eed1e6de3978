//! Thin command-line front end over the modkit SDK
//!
//! Inspect the local registry, validate it against disk, or run a full
//! sync against a catalog service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use modkit::{
    Event, EventKind, LocalRegistry, ModKitConfig, ModManager, ProfileId, Session,
};

#[derive(Parser)]
#[command(name = "modkit", about = "Mod management for game installs")]
struct Cli {
    /// Data directory holding downloads, installs and the registry
    #[arg(long, default_value = "./modkit-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List mods installed for a user profile
    List {
        /// Local user profile identifier
        #[arg(long)]
        user: String,
        /// Include mods the user has disabled
        #[arg(long)]
        all: bool,
    },
    /// Show the device-wide install record for one mod
    Status {
        mod_id: String,
        #[arg(long)]
        user: String,
    },
    /// Re-check every registry record against the filesystem
    Validate,
    /// Fetch desired state from the catalog and converge local state
    Sync {
        /// Catalog service base URL
        #[arg(long)]
        catalog: String,
        #[arg(long)]
        user: String,
        /// Access token for the catalog session
        #[arg(long, env = "MODKIT_TOKEN")]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modkit=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ModKitConfig::rooted_at(&cli.data_dir);

    match cli.command {
        Commands::List { user, all } => {
            let registry = LocalRegistry::load(&config.registry_path)
                .context("loading registry")?;
            let user = ProfileId::from(user);
            let records = registry.list_installed(&user, all);
            if records.is_empty() {
                println!("no installed mods for {user}");
            }
            for record in records {
                let version = record.installed_version.as_deref().unwrap_or("?");
                println!("{}\t{}\t{:?}", record.mod_id, version, record.status);
            }
        }
        Commands::Status { mod_id, user } => {
            let registry = LocalRegistry::load(&config.registry_path)
                .context("loading registry")?;
            let mod_id = mod_id.as_str().into();
            let user = ProfileId::from(user);
            let status = registry.status_for_user(&mod_id, &user);
            println!("status: {status:?}");
            if let Some(record) = registry.get(&mod_id) {
                println!("installed: {}", record.installed_version.as_deref().unwrap_or("-"));
                println!("references: {}", record.referencing_users.len());
                if let Some(path) = &record.extracted_path {
                    println!("path: {}", path.display());
                }
            }
        }
        Commands::Validate => {
            let mut registry = LocalRegistry::load(&config.registry_path)
                .context("loading registry")?;
            let demoted = registry.validate_against_disk();
            if demoted.is_empty() {
                println!("registry matches disk");
            } else {
                registry.commit().context("persisting demotions")?;
                for mod_id in demoted {
                    println!("demoted {mod_id}: files missing on disk");
                }
            }
        }
        Commands::Sync { catalog, user, token } => {
            let manager = ModManager::with_defaults(config, &catalog)
                .context("building manager")?;
            manager.subscribe_events(Arc::new(|event: &Event| {
                let target = event
                    .mod_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                match &event.kind {
                    EventKind::Progressing { .. } => {}
                    kind => println!("[{target}] {kind:?}"),
                }
            }));
            manager.enable_management(
                Session {
                    user: user.as_str().into(),
                    access_token: token,
                },
                None,
            )?;
            manager.sync().await.context("sync failed")?;
            println!("sync complete");
        }
    }
    Ok(())
}
