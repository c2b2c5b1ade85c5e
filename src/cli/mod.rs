//! Command-line interface for flowerloop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// flowerloop - continual learning for a flower image classifier.
#[derive(Parser)]
#[command(name = "flowerloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLOWERLOOP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "FLOWERLOOP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a node running one or all services
    Serve {
        /// Services to run (predict, corrections, modeller, combined)
        #[arg(short, long, env = "FLOWERLOOP_ROLE")]
        role: Option<String>,

        /// Storage root directory
        #[arg(long, env = "STORAGE_ROOT")]
        storage_root: Option<PathBuf>,

        /// Local validation directory
        #[arg(long)]
        validation_dir: Option<PathBuf>,
    },

    /// Classify an image with a running prediction service
    Predict {
        /// JPEG file to classify
        file: PathBuf,

        /// Prediction service URL
        #[arg(short, long, env = "PREDICT_URL", default_value = "http://127.0.0.1:8000")]
        url: String,
    },

    /// Submit a corrected label to a running correction service
    Submit {
        /// JPEG file to submit
        file: PathBuf,

        /// Correct label, by name or index
        #[arg(short = 'L', long)]
        label: String,

        /// Correction service URL
        #[arg(short, long, default_value = "http://127.0.0.1:8501")]
        url: String,
    },

    /// Inspect published models
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },

    /// Publish an untrained version-1 model if no model exists
    Bootstrap,

    /// Run a single modeller tick and exit
    Retrain,

    /// Show version information
    Version,
}

/// Model subcommands.
#[derive(Subcommand)]
pub enum ModelCommands {
    /// List published versions
    List,

    /// Show the latest version
    Latest,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
