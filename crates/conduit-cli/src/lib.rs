//! # Conduit CLI
//!
//! Operator tool for the Conduit runtime.
//!
//! This module provides CLI commands for:
//! - Validating the environment of a backend before deployment
//! - Sending and receiving queue messages
//! - Uploading, downloading, signing and deleting stored objects
//!
//! Configuration is layered: an optional file given with `--config`, then
//! `CONDUIT__`-prefixed environment variables, then command-line flags.

use clap::{Parser, Subcommand};
use conduit_runtime::environment::CLOUD_PROVIDER;
use conduit_runtime::{
    create_provider, validate_environment, ConfigurationError, EnqueueOptions, Environment,
    FactoryError, Priority, Provider, ProviderType, QueueError, ReceiveOptions,
    SignedUrlOptions, StorageError, UploadOptions, ValidationReport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix of environment variables read into [`CliConfig`]
pub const CONFIG_ENV_PREFIX: &str = "CONDUIT";

// ============================================================================
// CLI Structure
// ============================================================================

/// Conduit CLI - durable queues and object storage across clouds
#[derive(Debug, Parser)]
#[command(name = "conduit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operate Conduit queues and object storage")]
pub struct Cli {
    /// Backend to use (local, aws, gcp); overrides CLOUD_PROVIDER
    #[arg(short, long)]
    pub provider: Option<ProviderType>,

    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate the environment for the selected backend
    Check {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Enqueue a JSON message
    Send {
        #[arg(short, long)]
        queue: String,

        /// Message body as JSON
        #[arg(short, long)]
        body: String,

        /// Seconds before the message becomes visible
        #[arg(short, long)]
        delay: Option<u32>,

        #[arg(long)]
        priority: Option<Priority>,

        /// Ordering key for FIFO-capable backends
        #[arg(long)]
        group_id: Option<String>,

        /// Deduplication id for FIFO-capable backends
        #[arg(long)]
        dedup_id: Option<String>,

        /// Extra attribute as key=value; repeatable
        #[arg(short, long = "attr", value_parser = parse_key_value)]
        attributes: Vec<(String, String)>,
    },

    /// Receive messages and print them as JSON lines
    Receive {
        #[arg(short, long)]
        queue: String,

        /// Maximum number of messages
        #[arg(short, long, default_value = "1")]
        max: u32,

        /// Long-poll budget in seconds
        #[arg(short, long, default_value = "0")]
        wait: u32,

        /// Visibility timeout in seconds
        #[arg(short, long)]
        visibility: Option<u32>,

        /// Acknowledge every printed message
        #[arg(long)]
        ack: bool,
    },

    /// Upload a file
    Upload {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,

        /// File to upload
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        content_type: Option<String>,

        /// Metadata entry as key=value; repeatable
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Download an object to a file or stdout
    Download {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,

        /// Destination file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a time-limited URL for an object
    Sign {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,

        /// Lifetime in seconds
        #[arg(short, long, default_value = "3600")]
        expires: u64,

        /// Grant upload instead of download access
        #[arg(short, long)]
        write: bool,
    },

    /// Delete an object; succeeds when it is already absent
    Delete {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,
    },

    /// Print whether an object exists
    Exists {
        #[arg(short, long)]
        bucket: String,

        #[arg(short, long)]
        key: String,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Parse a `key=value` argument
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] FactoryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Provider(_) => 1,
            Self::Queue(_) => 2,
            Self::Storage(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) | Self::Output(_) => 5,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Runtime(#[from] ConfigurationError),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Settings read from the config file and `CONDUIT__*` variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// Backend name; the `--provider` flag wins over it
    pub provider: Option<String>,

    /// Variables overlaid on the process environment before validation
    pub environment: BTreeMap<String, String>,

    /// Default format for `check`
    pub output: OutputFormat,
}

/// Load layered configuration
///
/// A missing explicit file is an error; without one only `CONDUIT__*`
/// variables are read, e.g. `CONDUIT__ENVIRONMENT__AWS_REGION=eu-west-1`.
pub fn load_configuration(config_path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder
        .add_source(config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Overlay configuration and flags on an environment snapshot
///
/// Keys from the config file are upper-cased since the `config` crate folds
/// them to lower case.
pub fn resolve_environment(
    base: Environment,
    provider_flag: Option<ProviderType>,
    config: &CliConfig,
) -> Result<Environment, ConfigError> {
    let mut env = base;
    for (key, value) in &config.environment {
        env = env.with(key.to_ascii_uppercase(), value.clone());
    }

    let provider = match (provider_flag, config.provider.as_deref()) {
        (Some(flag), _) => Some(flag),
        (None, Some(name)) => Some(name.parse::<ProviderType>()?),
        (None, None) => None,
    };
    if let Some(provider) = provider {
        env = env.with(CLOUD_PROVIDER, provider.as_str());
    }
    Ok(env)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let config = load_configuration(cli.config.as_deref())?;
    let env = resolve_environment(Environment::from_process(), cli.provider, &config)?;

    let mut stdout = std::io::stdout();
    execute_command(cli.command, &env, &config, &mut stdout).await
}

/// Initialize logging to stderr; `RUST_LOG` wins over `level`
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    // A subscriber installed earlier (tests) is kept.
    if let Err(e) = result {
        debug!(error = %e, "Logging already initialized");
    }
    Ok(())
}

/// Run one command against the backend selected by `env`
pub async fn execute_command<W: Write>(
    command: Commands,
    env: &Environment,
    config: &CliConfig,
    out: &mut W,
) -> Result<(), CliError> {
    let provider_type = env.provider_type().map_err(ConfigError::from)?;

    if let Commands::Check { format } = command {
        let format = if format == OutputFormat::Text {
            config.output
        } else {
            format
        };
        let report = validate_environment(provider_type, env).map_err(ConfigError::from)?;
        return write_report(&report, format, out);
    }

    let provider = create_provider(provider_type, env).await?;
    execute_operation(command, &provider, out).await
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Write a validation report
pub fn write_report<W: Write>(
    report: &ValidationReport,
    format: OutputFormat,
    out: &mut W,
) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, report)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            writeln!(out, "provider: {}", report.provider)?;
            for (name, value) in &report.resolved {
                writeln!(out, "  {} = {}", name, value)?;
            }
            if report.has_warnings() {
                writeln!(out, "warnings:")?;
                for warning in &report.warnings {
                    writeln!(out, "  - {}", warning)?;
                }
            } else {
                writeln!(out, "ok")?;
            }
        }
    }
    Ok(())
}

/// Run a queue or storage command
pub async fn execute_operation<W: Write>(
    command: Commands,
    provider: &Provider,
    out: &mut W,
) -> Result<(), CliError> {
    match command {
        Commands::Check { .. } => Err(CliError::InvalidArgument {
            arg: "check".to_string(),
            message: "check does not use a provider".to_string(),
        }),
        Commands::Send {
            queue,
            body,
            delay,
            priority,
            group_id,
            dedup_id,
            attributes,
        } => {
            let body: serde_json::Value =
                serde_json::from_str(&body).map_err(|e| CliError::InvalidArgument {
                    arg: "--body".to_string(),
                    message: e.to_string(),
                })?;

            let mut options = EnqueueOptions::new();
            options.delay_seconds = delay;
            options.priority = priority;
            options.group_id = group_id;
            options.deduplication_id = dedup_id;
            options.attributes.extend(attributes);

            let id = provider.queue.enqueue(&queue, body, &options).await?;
            info!(queue = %queue, message_id = %id, "Message sent");
            writeln!(out, "{}", id)?;
            Ok(())
        }
        Commands::Receive {
            queue,
            max,
            wait,
            visibility,
            ack,
        } => {
            let mut options = ReceiveOptions::new()
                .with_max_messages(max)
                .with_wait_time(wait);
            options.visibility_timeout_seconds = visibility;

            let messages = provider.queue.receive(&queue, &options).await?;
            info!(queue = %queue, count = messages.len(), "Messages received");

            for message in &messages {
                serde_json::to_writer(&mut *out, message)?;
                writeln!(out)?;
                if ack {
                    if let Some(ref receipt) = message.receipt_handle {
                        provider.queue.ack(&queue, receipt).await?;
                    }
                }
            }
            Ok(())
        }
        Commands::Upload {
            bucket,
            key,
            file,
            content_type,
            metadata,
        } => {
            let data = tokio::fs::read(&file).await?;
            let mut options = UploadOptions::new();
            options.content_type = content_type;
            options.metadata.extend(metadata);

            let uri = provider
                .storage
                .upload(&bucket, &key, bytes::Bytes::from(data), &options)
                .await?;
            writeln!(out, "{}", uri)?;
            Ok(())
        }
        Commands::Download {
            bucket,
            key,
            output,
        } => {
            let object = provider.storage.download(&bucket, &key).await?;
            debug!(
                bucket = %bucket,
                key = %key,
                size = object.data.len(),
                content_type = %object.content_type,
                "Object downloaded"
            );
            match output {
                Some(path) => tokio::fs::write(&path, &object.data).await?,
                None => out.write_all(&object.data)?,
            }
            Ok(())
        }
        Commands::Sign {
            bucket,
            key,
            expires,
            write,
        } => {
            let options = if write {
                SignedUrlOptions::write(expires)
            } else {
                SignedUrlOptions::read(expires)
            };
            let url = provider
                .storage
                .get_signed_url(&bucket, &key, &options)
                .await?;
            writeln!(out, "{}", url)?;
            Ok(())
        }
        Commands::Delete { bucket, key } => {
            provider.storage.delete(&bucket, &key).await?;
            info!(bucket = %bucket, key = %key, "Object deleted");
            Ok(())
        }
        Commands::Exists { bucket, key } => {
            let exists = provider.storage.exists(&bucket, &key).await?;
            writeln!(out, "{}", exists)?;
            Ok(())
        }
    }
}
