use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peertrust_core::config::Config;
use peertrust_core::core_identity::{
    decrypt_seed, encrypt_seed, DeviceCode, IdentityName, Keypair, Pin, SealedSeed, Seed,
};
use peertrust_core::core_room::topic;
use peertrust_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use std::path::PathBuf;
use tracing::{info, warn};

mod simulate;

#[derive(Parser, Debug)]
#[command(name = "peertrust")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error). Overrides the
    /// `[logging]` section of the configuration.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file. Defaults and PEERTRUST_* variables otherwise.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive a secp256k1 keypair and print its public key
    Keygen {
        /// 32 bytes of hex entropy. Random when omitted.
        #[arg(long)]
        entropy: Option<String>,
    },

    /// Print the rendezvous topic for a name
    Topic {
        #[arg(value_enum)]
        kind: TopicKind,
        name: String,
    },

    /// Generate an 8-digit device code
    DeviceCode,

    /// Seal a 32-byte hex seed under a PIN. Random seed when omitted.
    Seal {
        #[arg(long)]
        pin: String,
        seed: Option<String>,
    },

    /// Open a sealed seed and print it as hex
    Unseal {
        #[arg(long)]
        pin: String,
        /// Sealed seed JSON as printed by `seal`
        sealed: String,
    },

    /// Run a handshake between two in-memory peers with scripted decisions
    Simulate {
        #[arg(value_enum)]
        scenario: simulate::Scenario,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TopicKind {
    PublicRoom,
    PublicManifest,
    PrivateManifest,
    RoomInvite,
    ModeratorInvite,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::from_env()?,
    };
    Ok(config)
}

/// Logging setup from the `[logging]` section, with command-line flags on top
fn log_config(args: &Args, config: &Config) -> Result<LogConfig> {
    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        let configured = log_config.level;
        log_config.level = level.parse::<LogLevel>().unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using '{}'", level, configured.as_str());
            configured
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    Ok(log_config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    // Initialize logging
    init_logging_with_config(log_config(&args, &config)?)?;

    match args.command {
        Some(Command::Keygen { entropy }) => {
            let keypair = match entropy {
                Some(encoded) => {
                    let raw = hex::decode(encoded.trim()).context("entropy is not hex")?;
                    let entropy: [u8; 32] = match raw.try_into() {
                        Ok(bytes) => bytes,
                        Err(raw) => bail!("entropy must be 32 bytes, got {}", raw.len()),
                    };
                    Keypair::from_entropy(&entropy)
                }
                None => Keypair::generate(),
            };
            println!("{}", keypair.public_key());
        }
        Some(Command::Topic { kind, name }) => {
            let derived = match kind {
                TopicKind::PublicRoom => topic::public_room(&name),
                TopicKind::PublicManifest => topic::public_manifest(&name),
                TopicKind::PrivateManifest => topic::private_manifest(&name),
                TopicKind::RoomInvite => topic::room_invite(&IdentityName::new(name)?),
                TopicKind::ModeratorInvite => topic::moderator_invite(&IdentityName::new(name)?),
            };
            println!("{}", derived);
        }
        Some(Command::DeviceCode) => {
            println!("{}", DeviceCode::generate().reveal());
        }
        Some(Command::Seal { pin, seed }) => {
            let seed = match seed {
                Some(encoded) => {
                    let raw = hex::decode(encoded.trim()).context("seed is not hex")?;
                    Seed::from_slice(&raw)?
                }
                None => Seed::generate(),
            };
            let sealed = encrypt_seed(&seed, &Pin::new(pin), &config.kdf)?;
            println!("{}", serde_json::to_string(&sealed)?);
        }
        Some(Command::Unseal { pin, sealed }) => {
            let sealed: SealedSeed =
                serde_json::from_str(&sealed).context("sealed seed is not valid JSON")?;
            let seed = decrypt_seed(&sealed, &Pin::new(pin))?;
            println!("{}", hex::encode(seed.as_bytes()));
        }
        Some(Command::Simulate { scenario }) => {
            info!(?scenario, "Starting simulation");
            let report = simulate::run(scenario, config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => {
            warn!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}
