use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use distpatch::logging::{self, Profile};
use distpatch::patch_format::ApplySummary;
use distpatch::{Engine, EngineConfig, LayerInfo};

#[derive(Parser)]
#[command(name = "distpatch", about = "Apply and roll back patches on an installed distribution")]
struct Cli {
    /// Root of the installed distribution
    #[arg(long, env = "DISTPATCH_HOME", global = true, default_value = ".")]
    root: PathBuf,
    /// Log filter directives (EnvFilter syntax)
    #[arg(long, env = "DISTPATCH_LOG", global = true)]
    log: Option<String>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    /// Skip fsync before renames (faster, less durable)
    #[arg(long, global = true)]
    no_fsync: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a fresh installation so it can be patched
    Init {
        /// Product name patches must target
        #[arg(long)]
        product: String,
        /// Installed product version
        #[arg(long)]
        version: String,
        /// Base layer names (the first one carries identity patches)
        #[arg(long = "layer")]
        layers: Vec<String>,
        /// Add-on layer names
        #[arg(long = "add-on")]
        add_ons: Vec<String>,
    },
    /// Apply a patch bundle
    Apply {
        /// Path to the patch bundle
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Roll back an installed patch
    Rollback {
        #[arg(long)]
        patch_id: String,
        /// Also roll back every patch installed on top of it
        #[arg(long)]
        rollback_to: bool,
    },
    /// List installed patches of a layer
    List {
        /// Layer to list; defaults to the identity layer
        #[arg(long)]
        layer: Option<String>,
    },
    /// Print the current version of a layer
    Version {
        #[arg(long)]
        layer: Option<String>,
    },
    /// Show the record of an installed patch
    Info {
        #[arg(long)]
        patch_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let profile = if cli.log_json {
        Profile::Json
    } else {
        Profile::Human
    };
    logging::init(profile, cli.log.as_deref());

    let config = EngineConfig::new(&cli.root).with_fsync(!cli.no_fsync);

    match cli.command {
        Commands::Init {
            product,
            version,
            layers,
            add_ons,
        } => {
            let declared: Vec<LayerInfo> = layers
                .into_iter()
                .map(|name| LayerInfo {
                    name,
                    add_on: false,
                })
                .chain(add_ons.into_iter().map(|name| LayerInfo { name, add_on: true }))
                .collect();
            let engine = tokio::task::spawn_blocking(move || {
                Engine::init(config, &product, &version, &declared)
            })
            .await??;

            println!("Installation initialised.");
            println!("  Root: {}", engine.config().root.display());
            println!("  Product: {}", engine.product_name());
            for layer in engine.layers() {
                let kind = if layer.add_on { "add-on" } else { "layer" };
                println!(
                    "  {kind} {}: {}",
                    layer.name,
                    engine.current_version(&layer.name)?
                );
            }
        }
        Commands::Apply { patch } => {
            println!("Applying patch...");
            println!("  Root: {}", config.root.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let identity = tokio::task::spawn_blocking(move || {
                let mut engine = Engine::open(config)?;
                engine
                    .apply_bundle_file(&patch)
                    .with_context(|| format!("failed to apply {}", patch.display()))
            })
            .await??;
            let elapsed = start.elapsed();

            println!("\nPatch {} applied successfully!", identity.patch_id);
            println!("  Version: {} {}", identity.product_name, identity.version);
            print_summary(&identity.summary);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            println!("  Restart required: yes");
        }
        Commands::Rollback {
            patch_id,
            rollback_to,
        } => {
            println!("Rolling back {patch_id}...");

            let start = Instant::now();
            let restored = tokio::task::spawn_blocking(move || {
                let mut engine = Engine::open(config)?;
                engine
                    .rollback(&patch_id, rollback_to)
                    .with_context(|| format!("failed to roll back {patch_id}"))
            })
            .await??;
            let elapsed = start.elapsed();

            println!("\nRollback completed successfully!");
            println!("  Rolled back: {}", restored.rolled_back.join(", "));
            println!("  Version: {} {}", restored.product_name, restored.version);
            print_summary(&restored.summary);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            println!("  Restart required: yes");
        }
        Commands::List { layer } => {
            let engine = open(config).await?;
            let layer = resolve_layer(&engine, layer)?;
            let installed = engine.list_installed(&layer)?;
            if installed.is_empty() {
                println!("No patches installed on {layer}.");
            }
            for patch in installed {
                let kind = if patch.cumulative { "cumulative" } else { "one-off" };
                println!(
                    "{}\t{}\t{}\t{}",
                    patch.patch_id,
                    kind,
                    patch.applied_at.to_rfc3339(),
                    patch.description
                );
            }
        }
        Commands::Version { layer } => {
            let engine = open(config).await?;
            let layer = resolve_layer(&engine, layer)?;
            println!("{}", engine.current_version(&layer)?);
        }
        Commands::Info { patch_id } => {
            let engine = open(config).await?;
            let record = engine.patch_info(&patch_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

async fn open(config: EngineConfig) -> anyhow::Result<Engine> {
    let engine = tokio::task::spawn_blocking(move || Engine::open(config)).await??;
    Ok(engine)
}

fn resolve_layer(engine: &Engine, layer: Option<String>) -> anyhow::Result<String> {
    match layer {
        Some(layer) => Ok(layer),
        None => Ok(engine.identity_layer()?.to_string()),
    }
}

fn print_summary(summary: &ApplySummary) {
    println!("  Files added: {}", summary.files_added);
    println!("  Files modified: {}", summary.files_modified);
    println!("  Files removed: {}", summary.files_removed);
    println!("  Modules added: {}", summary.modules_added);
    println!("  Modules modified: {}", summary.modules_modified);
    println!("  Modules removed: {}", summary.modules_removed);
}
