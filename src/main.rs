//! flowerloop CLI - Main entry point.

use anyhow::Context;
use bytes::Bytes;
use flowerloop::cli::{Cli, Commands, ModelCommands};
use flowerloop::config::{FlowerConfig, NodeRole, StorageBackend};
use flowerloop::corrections::CorrectionsClient;
use flowerloop::model::ModelRegistry;
use flowerloop::modeller::{Modeller, TickOutcome};
use flowerloop::predict::PredictClient;
use flowerloop::types::Label;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let mut config = load_config(cli.config.as_deref())?;
    config.observability.log_level = cli.log_level.clone();

    match cli.command {
        Commands::Serve {
            role,
            storage_root,
            validation_dir,
        } => {
            if let Some(role) = role {
                config.node.role = role.parse::<NodeRole>()?;
            }
            if let Some(root) = storage_root {
                config.storage.backend = StorageBackend::Filesystem;
                config.storage.root = root;
            }
            if validation_dir.is_some() {
                config.modeller.validation_dir = validation_dir;
            }

            flowerloop::run(config).await?;
        }

        Commands::Predict { file, url } => {
            let data = read_image(&file)?;
            let client = PredictClient::new(&url);
            let prediction = client
                .predict(&file_name(&file), "image/jpeg", data)
                .await
                .with_context(|| format!("prediction request to {} failed", url))?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }

        Commands::Submit { file, label, url } => {
            let label = Label::parse(&label)?;
            let data = read_image(&file)?;
            let client = CorrectionsClient::new(&url);
            let receipt = client
                .submit(&file_name(&file), data, label)
                .await
                .with_context(|| format!("submitting correction to {} failed", url))?;
            println!("Submitted {} as {} ({})", receipt.blob_name, label, receipt.message_id);
        }

        Commands::Models { command } => {
            init_logging(&config)?;
            let backends = flowerloop::open_backends(&config.storage)?;
            let registry = ModelRegistry::new(backends.blobs, config.model.clone(), config.predict.cache_capacity);

            match command {
                ModelCommands::List => {
                    let versions = registry.list_versions().await?;
                    if versions.is_empty() {
                        println!("No models published");
                    }
                    for version in versions {
                        println!("{}  {}  {}", version, version.iso(), registry.blob_name(version));
                    }
                }
                ModelCommands::Latest => {
                    let version = registry.latest_version().await?;
                    println!("{}  {}", version, version.iso());
                }
            }
        }

        Commands::Bootstrap => {
            init_logging(&config)?;
            let backends = flowerloop::open_backends(&config.storage)?;
            let registry = ModelRegistry::new(backends.blobs, config.model.clone(), config.predict.cache_capacity);
            match registry.bootstrap().await? {
                Some(version) => println!("Published {}", registry.blob_name(version)),
                None => println!("Models already present, nothing to do"),
            }
        }

        Commands::Retrain => {
            init_logging(&config)?;
            let backends = flowerloop::open_backends(&config.storage)?;
            let registry = Arc::new(ModelRegistry::new(
                backends.blobs.clone(),
                config.model.clone(),
                config.predict.cache_capacity,
            ));
            let validation =
                Modeller::load_validation(&config.modeller, &config.model, backends.blobs.as_ref()).await?;
            let mut modeller = Modeller::new(backends.blobs, backends.queue, registry, config.modeller, validation);

            match modeller.tick().await? {
                TickOutcome::Idle { depth } => println!("Only {} corrections queued, nothing to do", depth),
                TickOutcome::NothingDrained { depth, report } => println!(
                    "{} corrections queued but none usable ({} dropped)",
                    depth, report.skipped
                ),
                TickOutcome::Published(summary) => println!(
                    "Published {} from {} samples (validation accuracy {:.3})",
                    summary.blob_name, summary.samples, summary.evaluation.accuracy
                ),
            }
        }

        Commands::Version => {
            println!("flowerloop v{}", env!("CARGO_PKG_VERSION"));
            println!("Continual learning for a flower image classifier");
        }
    }

    Ok(())
}

/// Load the configuration file if given, then apply environment overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<FlowerConfig> {
    let mut config = match path {
        Some(path) => FlowerConfig::from_file(path)?,
        None => FlowerConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &FlowerConfig) -> anyhow::Result<()> {
    flowerloop::observability::init(&config.observability)?;
    Ok(())
}

fn read_image(path: &Path) -> anyhow::Result<Bytes> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Bytes::from(data))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.jpg".to_string())
}
