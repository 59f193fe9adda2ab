use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use ringstore_client::{ClientConfig, FileSource, RingAdapter};
use ringstore_common::metadata::CONTENT_LENGTH_KEY;
use ringstore_common::{ByteRange, Metadata, ObjectBackend, ObjectIdentity};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "ringstore.toml";

#[derive(Parser)]
#[command(name = "ringstore")]
#[command(about = "Store and fetch objects on a ring of HTTP storage endpoints", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct IdentityArgs {
    account: String,
    container: String,
    object: String,
}

impl IdentityArgs {
    fn identity(&self) -> anyhow::Result<ObjectIdentity> {
        Ok(ObjectIdentity::new(&self.account, &self.container, &self.object)?)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Check that the config file loads and validates
    Lint,

    /// Print the storage key of an object
    Key {
        #[command(flatten)]
        id: IdentityArgs,
    },

    /// Upload a file
    Put {
        #[command(flatten)]
        id: IdentityArgs,

        file: PathBuf,

        /// Metadata entry, repeatable
        #[arg(short = 'm', long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, Vec<u8>)>,
    },

    /// Download an object to a file or stdout
    Get {
        #[command(flatten)]
        id: IdentityArgs,

        /// Inclusive byte range, START-END or START-
        #[arg(long)]
        range: Option<ByteRange>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print an object's metadata
    Head {
        #[command(flatten)]
        id: IdentityArgs,
    },

    /// Delete an object
    Delete {
        #[command(flatten)]
        id: IdentityArgs,
    },

    /// Exit 0 if the object exists, 1 otherwise
    Exists {
        #[command(flatten)]
        id: IdentityArgs,
    },

    /// Probe every configured endpoint once
    Status,
}

fn parse_meta(s: &str) -> Result<(String, Vec<u8>), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.as_bytes().to_vec())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn load_adapter(path: &Path) -> anyhow::Result<RingAdapter> {
    let mut config = ClientConfig::load(path)?;
    // One-shot commands don't need background probes.
    config.health_check.enabled = false;
    RingAdapter::from_config(&config)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Lint => {
            ClientConfig::load(&cli.config)?;
            println!("{}: ok", cli.config.display());
        }

        Command::Key { id } => {
            println!("{}", id.identity()?.storage_key());
        }

        Command::Put { id, file, meta } => {
            let identity = id.identity()?;
            let adapter = load_adapter(&cli.config)?;
            let source = FileSource::open(&file)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", file.display(), e))?;
            let mut metadata: Metadata = meta.into_iter().collect();
            if !metadata.contains_key(CONTENT_LENGTH_KEY) {
                metadata.insert(
                    CONTENT_LENGTH_KEY.to_string(),
                    source.len().await?.to_string().into_bytes(),
                );
            }
            adapter.create(&identity, Box::new(source), &metadata).await?;
            info!(object = %identity, key = %identity.storage_key(), "Uploaded");
        }

        Command::Get { id, range, output } => {
            let identity = id.identity()?;
            let adapter = load_adapter(&cli.config)?;
            let dst = match &output {
                Some(path) => File::create(path)
                    .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", path.display(), e))?,
                None => File::from(std::io::stdout().as_fd().try_clone_to_owned()?),
            };
            let (_, written) = adapter.read_into(&identity, range, dst).await?;
            info!(object = %identity, bytes = written, "Downloaded");
        }

        Command::Head { id } => {
            let adapter = load_adapter(&cli.config)?;
            for (key, value) in adapter.head(&id.identity()?).await? {
                println!("{key}: {}", String::from_utf8_lossy(&value));
            }
        }

        Command::Delete { id } => {
            let adapter = load_adapter(&cli.config)?;
            adapter.delete(&id.identity()?).await?;
        }

        Command::Exists { id } => {
            let adapter = load_adapter(&cli.config)?;
            if !adapter.exists(&id.identity()?).await? {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Status => {
            let adapter = load_adapter(&cli.config)?;
            let settings = adapter.settings();
            println!(
                "connect_timeout={:?} proxy_timeout={:?} max_attempts={} blacklist_duration={:?} zero_copy={}",
                settings.connect_timeout,
                settings.proxy_timeout,
                settings.max_attempts,
                settings.blacklist_duration,
                settings.zero_copy
            );
            let mut up = 0;
            for (endpoint, result) in adapter.probe_endpoints().await {
                match result {
                    Ok(()) => {
                        up += 1;
                        println!("{endpoint}: up");
                    }
                    Err(e) => println!("{endpoint}: down: {e}"),
                }
            }
            if up == 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
