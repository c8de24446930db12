//! Binary entrypoint for the treemesh CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `identity show|set-hid|set-bit|clear` - inspect or change the persisted node identity
//! - `decode <hex>` - validate and print a captured frame
//! - `simulate` - run the configured multi-node simulation and print the result
//!
//! See the library crate docs for module-level details: `treemesh::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use treemesh::config::Config;
use treemesh::logutil::{hex_preview, parse_hex};
use treemesh::sim;
use treemesh::tree::frame;
use treemesh::tree::identity::{Identity, SledIdentityStore};

#[derive(Parser)]
#[command(name = "treemesh")]
#[command(about = "Distributed I/O over a broadcast tree network")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show or change the persisted node identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Decode a hex-encoded frame and print it as JSON
    Decode {
        /// Frame bytes, e.g. "AA 09 0C 00 ..."
        hex: String,
    },
    /// Run the simulation described in the config file
    Simulate {
        /// Override simulation.duration_ms
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    Show,
    SetHid { hid: u16 },
    SetBit { bit: u8 },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new treemesh configuration");
            Config::create_default(&cli.config).await?;
            println!("Created default configuration at {}", cli.config);
        }
        Commands::Identity { action } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let store = SledIdentityStore::open(&config.node.identity_db)?;
            let mut identity = Identity::load(&store)?;
            if let Some(hid) = config.node.hid {
                if identity.raw_hid() == 0 {
                    identity.configure_hid(hid, &store)?;
                }
            }
            if let Some(bit) = config.node.bit_index {
                if identity.bit_index().is_none() {
                    identity.configure_bit_index(bit, &store)?;
                }
            }
            match action {
                IdentityAction::Show => {}
                IdentityAction::SetHid { hid } => {
                    if !identity.configure_hid(hid, &store)? {
                        return Err(anyhow!("HID {} is reserved", hid));
                    }
                }
                IdentityAction::SetBit { bit } => {
                    if !identity.configure_bit_index(bit, &store)? {
                        return Err(anyhow!("bit index {} is out of range 0-31", bit));
                    }
                }
                IdentityAction::Clear => {
                    identity.clear_all(&store)?;
                    warn!("Identity cleared; node is unconfigured");
                }
            }
            println!("{}", identity.status_line());
        }
        Commands::Decode { hex } => {
            let bytes = parse_hex(&hex).map_err(|e| anyhow!("invalid hex: {}", e))?;
            info!("Decoding {} bytes: {}", bytes.len(), hex_preview(&bytes));
            let decoded = frame::decode(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
        Commands::Simulate { duration_ms } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("No usable config at {}; simulating the default tree", cli.config);
                    Config::default()
                }
            };
            if let Some(ms) = duration_ms {
                config.simulation.duration_ms = ms;
            }
            let report = sim::run(&config.simulation, &config.node_settings()).await?;
            if !report.converged {
                warn!("Simulation ended before every node matched the root's shared state");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config.as_ref().and_then(|cfg| {
        let path = cfg.logging.file.as_ref()?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    let security_path = config.as_ref().and_then(|cfg| cfg.logging.security_file.clone());

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        let is_tty = atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}: {}", ts, record.level(), record.target(), record.args());

            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }

            if record.target() == "security" {
                if let Some(ref sec_path) = security_path {
                    if let Ok(mut sf) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(sec_path)
                    {
                        let _ = writeln!(sf, "{}", line);
                    }
                }
            }

            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}: {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
