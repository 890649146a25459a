//! Masq CLI
//!
//! Thin wrapper around masq-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create a profile and list profiles
//! masq profile add --username jdoe --passphrase 's3cret-pass'
//! masq profile list
//!
//! # Register apps and devices on a profile
//! masq app add --profile <id> --passphrase <pass> "Notes"
//! masq device list --profile <id> --passphrase <pass>
//!
//! # Let an app log in (prints a link for the app, then asks for consent)
//! masq pair login --profile <id> --passphrase <pass>
//!
//! # Share a profile with another device
//! masq pair sync --profile <id> --passphrase <pass>
//! masq pair join <link>
//!
//! # Hand a new app its own store
//! masq pair provision --profile <id> --passphrase <pass> "Notes"
//!
//! # Act as an app
//! masq client login <link> --name "Notes"
//!
//! # Keep replicating in the background
//! masq serve
//!
//! # Read back what a pairing session logged
//! masq --log-dir ./logs logs --channel <channel>
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use masq_core::logging::{init_logging, read_entries, JsonLogEntry};
use masq_core::pairing::PairingOptions;
use masq_core::{
    node_secret, open_backend, os_crypto, App, AppClient, AppRequest, ConsentPrompt, Device,
    IrohRendezvous, Masq, MasqConfig, MasqResult, MemoryHub, NewProfile, PairingLink,
    PairingOutcome, Rendezvous, SharedKey, StaticConsent,
};
use tracing::info;

/// Masq - local-first profiles shared across devices and apps
#[derive(Parser)]
#[command(name = "masq")]
#[command(version = "0.1.0")]
#[command(about = "Masq - local-first profiles shared across devices and apps")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.masq)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write JSONL logs under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// App records on a profile
    App {
        #[command(subcommand)]
        action: AppAction,
    },

    /// Device records on a profile
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Pairing links
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },

    /// Pair this device with an app or another device
    Pair {
        #[command(subcommand)]
        action: PairAction,
    },

    /// Pair as an app with a user's device
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },

    /// Replicate every local store until interrupted
    Serve,

    /// Show entries from the JSONL logs under --log-dir
    Logs {
        /// Only entries tagged with this rendezvous channel
        #[arg(long)]
        channel: Option<String>,
        /// Show at most this many of the latest entries
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
}

/// Profile selection shared by commands that need a logged-in profile
#[derive(clap::Args)]
#[group(id = "login_args")]
struct Login {
    /// Profile id
    #[arg(long)]
    profile: String,
    /// Profile passphrase
    #[arg(long)]
    passphrase: String,
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Create a profile
    Add {
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        firstname: String,
        #[arg(long, default_value = "")]
        lastname: String,
        /// Avatar URL
        #[arg(long, default_value = "")]
        image: String,
        #[arg(long)]
        passphrase: String,
    },
    /// List local profiles
    List,
    /// Unlock a profile and show it
    Show {
        #[command(flatten)]
        login: Login,
    },
    /// Change profile fields
    Update {
        #[command(flatten)]
        login: Login,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        firstname: Option<String>,
        #[arg(long)]
        lastname: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
}

#[derive(Subcommand)]
enum AppAction {
    /// Register an app
    Add {
        #[command(flatten)]
        login: Login,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        image: String,
    },
    /// List registered apps
    List {
        #[command(flatten)]
        login: Login,
    },
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Register a device
    Add {
        #[command(flatten)]
        login: Login,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List registered devices
    List {
        #[command(flatten)]
        login: Login,
    },
}

#[derive(Subcommand)]
enum LinkAction {
    /// Generate a pairing link without going online
    New {
        /// Channel to use instead of a random one
        #[arg(long)]
        channel: Option<String>,
    },
    /// Decode a link and show what it points at
    Inspect { link: String },
}

#[derive(Subcommand)]
enum PairAction {
    /// Wait for an app to log in to a profile
    Login {
        #[command(flatten)]
        login: Login,
        /// Use this link instead of generating one
        #[arg(long)]
        link: Option<String>,
        /// Grant access without asking
        #[arg(long)]
        yes: bool,
    },
    /// Share a profile with another device
    Sync {
        #[command(flatten)]
        login: Login,
        /// Use this link instead of generating one
        #[arg(long)]
        link: Option<String>,
        /// Open the exchange instead of waiting for the other device
        #[arg(long)]
        initiator: bool,
    },
    /// Join a profile shared by another device
    Join {
        link: String,
        /// Open the exchange instead of waiting for the other device
        #[arg(long)]
        initiator: bool,
    },
    /// Create a store for a new app and hand it over
    Provision {
        #[command(flatten)]
        login: Login,
        /// App name, as the app reports it
        name: String,
        /// Use this link instead of generating one
        #[arg(long)]
        link: Option<String>,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Log in to a user's device
    Login {
        link: String,
        #[command(flatten)]
        app: AppArgs,
    },
    /// Accept a store provisioned by a user's device
    Provision {
        link: String,
        #[command(flatten)]
        app: AppArgs,
        /// Local name for the store
        #[arg(long)]
        store: String,
    },
}

#[derive(clap::Args)]
struct AppArgs {
    /// App name
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Icon URL
    #[arg(long, default_value = "")]
    image: String,
}

impl From<AppArgs> for AppRequest {
    fn from(args: AppArgs) -> Self {
        AppRequest {
            name: args.name,
            description: args.description,
            image: args.image,
        }
    }
}

/// Asks on the terminal
struct StdinConsent;

#[async_trait]
impl ConsentPrompt for StdinConsent {
    async fn ask(&self, request: &AppRequest) -> MasqResult<bool> {
        let prompt = format!(
            "App '{}' ({}) asks for access to this profile. Allow? [y/N] ",
            request.name, request.description
        );
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            print!("{}", prompt);
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| masq_core::MasqError::Io(std::io::Error::other(e)))??;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

/// Get the default data directory (~/.masq)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".masq")
}

/// Root over the local database with no network attached
async fn open_offline(data_dir: &Path, config: MasqConfig) -> Result<Masq> {
    let hub = MemoryHub::new();
    let masq = Masq::new(
        config,
        open_backend(data_dir)?,
        Arc::new(hub.node("local")),
        Arc::new(StdinConsent),
        os_crypto(),
    );
    masq.init().await?;
    Ok(masq)
}

/// Root over the local database, reachable through iroh
async fn open_online(
    data_dir: &Path,
    config: MasqConfig,
    consent: Arc<dyn ConsentPrompt>,
) -> Result<(Masq, Arc<IrohRendezvous>)> {
    let backend = open_backend(data_dir)?;
    let secret = node_secret(backend.as_ref(), os_crypto().as_ref())?;
    let bootstrap = config.network.bootstrap_peers()?;
    let rendezvous = Arc::new(IrohRendezvous::bind(Some(secret), &bootstrap).await?);
    let masq = Masq::new(
        config,
        backend,
        rendezvous.clone(),
        consent,
        os_crypto(),
    );
    masq.init().await?;
    Ok((masq, rendezvous))
}

async fn login(masq: &Masq, login: &Login) -> Result<()> {
    masq.open_profile(&login.profile, &login.passphrase)
        .await
        .with_context(|| format!("Cannot open profile {}", login.profile))?;
    Ok(())
}

/// Decode `given`, or generate a fresh link and show it to the user.
fn resolve_link(masq: &Masq, given: Option<String>) -> Result<PairingLink> {
    if let Some(text) = given {
        return Ok(PairingLink::decode(&text)?);
    }
    let link = masq.new_link();
    println!("Pairing link:");
    println!("  {}", link.encode()?);
    println!();
    println!("Waiting for the other side...");
    Ok(link)
}

fn print_outcome(outcome: &PairingOutcome) {
    match outcome {
        PairingOutcome::Granted { db_id } => println!("Access granted ({})", db_id),
        PairingOutcome::Refused => println!("Access refused"),
        PairingOutcome::Abandoned => println!("Pairing abandoned"),
    }
}

fn print_app(app: &App) {
    println!("  {}", app.name);
    if let Some(id) = &app.id {
        println!("    ID: {}", id);
    }
    if !app.description.is_empty() {
        println!("    Description: {}", app.description);
    }
    if let Some(key) = &app.store_key {
        println!("    Store: {}", key);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_dir.as_deref(), "masq")?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Cannot create {}", data_dir.display()))?;
    let config = MasqConfig::load(&data_dir)?;

    match cli.command {
        Commands::Info => {
            let backend = open_backend(&data_dir)?;
            let secret = node_secret(backend.as_ref(), os_crypto().as_ref())?;
            let node_id = iroh::SecretKey::from_bytes(&secret).public();
            drop(backend);
            let masq = open_offline(&data_dir, config).await?;

            println!("Masq v0.1.0");
            println!();
            println!("Node:");
            println!("  ID: {}", node_id);
            println!();
            println!("Profiles: {}", masq.get_profiles().await?.len());
            println!("Data directory: {}", data_dir.display());
            masq.shutdown().await;
        }

        Commands::Profile { action } => {
            let masq = open_offline(&data_dir, config).await?;
            match action {
                ProfileAction::Add {
                    username,
                    firstname,
                    lastname,
                    image,
                    passphrase,
                } => {
                    let profile = masq
                        .add_profile(NewProfile {
                            username,
                            firstname,
                            lastname,
                            image,
                            passphrase,
                        })
                        .await?;
                    println!("Created profile:");
                    println!("  ID: {}", profile.id);
                    println!("  Username: {}", profile.username);
                }
                ProfileAction::List => {
                    let profiles = masq.get_profiles().await?;
                    if profiles.is_empty() {
                        println!("No profiles found.");
                    } else {
                        println!("Profiles:");
                        for profile in profiles {
                            println!(
                                "  {} {} {} ({})",
                                profile.username, profile.firstname, profile.lastname, profile.id
                            );
                        }
                    }
                }
                ProfileAction::Show { login: l } => {
                    login(&masq, &l).await?;
                    let profile = masq
                        .current_profile()
                        .context("Profile did not open")?;
                    println!("{}", serde_json::to_string_pretty(&profile)?);
                }
                ProfileAction::Update {
                    login: l,
                    username,
                    firstname,
                    lastname,
                    image,
                } => {
                    login(&masq, &l).await?;
                    let mut profile = masq.resources().get_profile(&l.profile).await?;
                    if let Some(v) = username {
                        profile.username = v;
                    }
                    if let Some(v) = firstname {
                        profile.firstname = v;
                    }
                    if let Some(v) = lastname {
                        profile.lastname = v;
                    }
                    if let Some(v) = image {
                        profile.image = v;
                    }
                    let updated = masq.update_profile(profile).await?;
                    println!("Updated profile {}", updated.id);
                }
            }
            masq.shutdown().await;
        }

        Commands::App { action } => {
            let masq = open_offline(&data_dir, config).await?;
            match action {
                AppAction::Add {
                    login: l,
                    name,
                    description,
                    image,
                } => {
                    login(&masq, &l).await?;
                    let app = masq
                        .add_app(App {
                            name,
                            description,
                            image,
                            ..Default::default()
                        })
                        .await?;
                    println!("Registered app:");
                    print_app(&app);
                }
                AppAction::List { login: l } => {
                    login(&masq, &l).await?;
                    let apps = masq.get_apps().await?;
                    if apps.is_empty() {
                        println!("No apps registered.");
                    } else {
                        println!("Apps:");
                        apps.iter().for_each(print_app);
                    }
                }
            }
            masq.shutdown().await;
        }

        Commands::Device { action } => {
            let masq = open_offline(&data_dir, config).await?;
            match action {
                DeviceAction::Add {
                    login: l,
                    name,
                    description,
                } => {
                    login(&masq, &l).await?;
                    let device = masq
                        .add_device(Device {
                            name,
                            description,
                            ..Default::default()
                        })
                        .await?;
                    println!("Registered device {}", device.name);
                }
                DeviceAction::List { login: l } => {
                    login(&masq, &l).await?;
                    let devices = masq.get_devices().await?;
                    if devices.is_empty() {
                        println!("No devices registered.");
                    } else {
                        println!("Devices:");
                        for device in devices {
                            println!("  {} ({})", device.name, device.id.unwrap_or_default());
                        }
                    }
                }
            }
            masq.shutdown().await;
        }

        Commands::Link { action } => match action {
            LinkAction::New { channel } => {
                let crypto = os_crypto();
                let link = match channel {
                    Some(channel) => {
                        PairingLink::new(channel, &SharedKey::generate(crypto.as_ref()), vec![])
                    }
                    None => PairingLink::generate(crypto.as_ref(), vec![]),
                };
                println!("{}", link.encode()?);
            }
            LinkAction::Inspect { link } => {
                let link = PairingLink::decode(&link)?;
                println!("Pairing link v{}", link.version);
                println!("  Channel: {}", link.channel);
                println!("  Bootstrap nodes: {}", link.bootstrap.len());
                for node in &link.bootstrap {
                    println!("    {}", hex::encode(node.node_id));
                }
            }
        },

        Commands::Pair { action } => {
            let consent: Arc<dyn ConsentPrompt> = match &action {
                PairAction::Login { yes: true, .. } => Arc::new(StaticConsent(true)),
                _ => Arc::new(StdinConsent),
            };
            let (masq, rendezvous) = open_online(&data_dir, config, consent).await?;
            let outcome = match action {
                PairAction::Login {
                    login: l, link, ..
                } => {
                    login(&masq, &l).await?;
                    let link = resolve_link(&masq, link)?;
                    masq.handle_user_app_login(&link).await
                }
                PairAction::Sync {
                    login: l,
                    link,
                    initiator,
                } => {
                    login(&masq, &l).await?;
                    let link = resolve_link(&masq, link)?;
                    masq.sync_profile(&link, initiator).await
                }
                PairAction::Join { link, initiator } => {
                    let link = PairingLink::decode(&link)?;
                    masq.join_profile(&link, initiator).await
                }
                PairAction::Provision {
                    login: l,
                    name,
                    link,
                } => {
                    login(&masq, &l).await?;
                    let link = resolve_link(&masq, link)?;
                    masq.create_app(&link, &name).await
                }
            };
            masq.shutdown().await;
            rendezvous.shutdown().await;
            print_outcome(&outcome?);
        }

        Commands::Client { action } => {
            let backend = open_backend(&data_dir)?;
            let secret = node_secret(backend.as_ref(), os_crypto().as_ref())?;
            let rendezvous =
                Arc::new(IrohRendezvous::bind(Some(secret), &config.network.bootstrap_peers()?).await?);
            let options = PairingOptions::from(&config.pairing);
            let (link, app, store) = match action {
                ClientAction::Login { link, app } => (link, app, None),
                ClientAction::Provision { link, app, store } => (link, app, Some(store)),
            };
            let link = PairingLink::decode(&link)?;
            let client = AppClient::new(
                app.into(),
                backend,
                rendezvous.clone() as Arc<dyn Rendezvous>,
                options,
                os_crypto(),
            );
            let outcome = match &store {
                Some(name) => client.provision(&link, name).await,
                None => client.login(&link).await,
            };
            client.shutdown().await;
            rendezvous.shutdown().await;
            print_outcome(&outcome?);
        }

        Commands::Serve => {
            println!("Starting Masq...");
            println!();

            let (masq, rendezvous) =
                open_online(&data_dir, config, Arc::new(StdinConsent)).await?;
            println!("Node:");
            println!("  Ticket: {}", rendezvous.node_addr().to_ticket()?);
            println!("  Stores: {}", masq.stores().names().len());
            println!();
            println!("Data directory: {}", data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            info!(stores = ?masq.replication().active(), "Serving");

            tokio::signal::ctrl_c().await?;
            println!();
            println!("Shutting down...");
            masq.shutdown().await;
            rendezvous.shutdown().await;
            println!("Goodbye.");
        }

        Commands::Logs { channel, limit } => {
            let log_dir = cli
                .log_dir
                .as_deref()
                .context("--log-dir is required to read logs")?;
            let entries: Vec<JsonLogEntry> = read_entries(log_dir)?
                .into_iter()
                .filter(|entry| match &channel {
                    Some(c) => entry
                        .fields
                        .as_ref()
                        .and_then(|f| f.get("channel"))
                        .and_then(|v| v.as_str())
                        == Some(c.as_str()),
                    None => true,
                })
                .collect();

            if entries.is_empty() {
                println!("No log entries found");
            }
            for entry in &entries[entries.len().saturating_sub(limit)..] {
                print_log_entry(entry);
            }
        }
    }

    Ok(())
}

fn print_log_entry(entry: &JsonLogEntry) {
    let mut line = format!(
        "{} {:>5} [{}] {}: {}",
        entry.ts,
        entry.level.to_uppercase(),
        entry.instance,
        entry.target,
        entry.msg
    );
    if let Some(fields) = &entry.fields {
        line.push(' ');
        line.push_str(&fields.to_string());
    }
    println!("{}", line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_pair_join() {
        let cli = Cli::try_parse_from(["masq", "pair", "join", "masq-pair:abc", "--initiator"]).unwrap();
        match cli.command {
            Commands::Pair {
                action: PairAction::Join { link, initiator },
            } => {
                assert_eq!(link, "masq-pair:abc");
                assert!(initiator);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_logs_defaults() {
        let cli = Cli::try_parse_from(["masq", "logs"]).unwrap();
        match cli.command {
            Commands::Logs { channel, limit } => {
                assert!(channel.is_none());
                assert_eq!(limit, 50);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_login_args_required() {
        assert!(Cli::try_parse_from(["masq", "app", "list"]).is_err());
    }
}
