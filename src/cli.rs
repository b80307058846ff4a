use std::path::PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use futures::channel::mpsc::channel;
use futures::StreamExt;
use log::{info, warn};

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::error::AppRunError;
use crate::improv::client::ImprovClient;
use crate::improv::types::{ImprovCandidate, ImprovErrorCode, ImprovEvent, ImprovState};
use crate::network::constants::EVENT_BUFFER;
use crate::network::scanner::NetworkScanner;
use crate::network::types::ScannerEvent;

#[derive(Parser, Debug)]
#[command(name = "laika-link", version, about = "Find, connect to and provision LAIKA companion devices")]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise the log level (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the local network and print every discovered device as a JSON line
    Scan,
    /// Connect to the best device and print inbound messages until interrupted
    Connect,
    /// Connect to the best device and send a single command
    Send {
        command: String,
        /// Command payload as JSON
        #[arg(default_value = "{}")]
        data: String,
    },
    /// Talk to a device over BLE using the Improv provisioning protocol
    Improv {
        /// Pick the device whose name or address contains this text
        #[arg(short, long)]
        device: Option<String>,

        #[command(subcommand)]
        action: ImprovAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImprovAction {
    State,
    Capabilities,
    Identify,
    Provision {
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: String,
        /// Wait for the device to answer the RPC command
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write the default config to the config path
    Init,
    /// Print the effective config
    Show,
}

/// Prefers devices advertising the Improv service, then the strongest signal.
pub fn choose_candidate(filter: Option<&str>, candidates: &[ImprovCandidate]) -> Option<usize> {
    candidates.iter()
        .enumerate()
        .filter(|(_, candidate)| match filter {
            None => true,
            Some(text) => candidate.address.contains(text)
                || candidate.name.as_deref().is_some_and(|name| name.contains(text)),
        })
        .max_by_key(|(index, candidate)| {
            (candidate.advertises_service, candidate.rssi.unwrap_or(i16::MIN), std::cmp::Reverse(*index))
        })
        .map(|(index, _)| index)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppRunError> {
    let line = serde_json::to_string(value).map_err(|source| AppRunError::InvalidData { source })?;
    println!("{}", line);
    Ok(())
}

pub async fn execute(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new(cli.config.clone())?;

    if let Commands::Config { action: ConfigAction::Init } = &cli.command {
        config_io.save(&Config::default()).await?;
        println!("{}", config_io.path().to_string_lossy());
        return Ok(());
    }

    let config = config_io.read().await?;

    match cli.command {
        Commands::Config { .. } => {
            let pretty = serde_json::to_string_pretty(&config).map_err(|source| AppRunError::InvalidData { source })?;
            println!("{}", pretty);
        },
        Commands::Scan => {
            let scanner = NetworkScanner::new(config.scanner, vec![])?;
            for device in scanner.start_scan().await? {
                print_json(&device)?;
            }
        },
        Commands::Connect => {
            let (sender, mut receiver) = channel(EVENT_BUFFER);
            let scanner = NetworkScanner::new(config.scanner, vec![sender])?;
            let device = scanner.auto_connect().await?;
            info!("Connected to {}; press Ctrl-C to stop", device.name);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = receiver.next() => match event {
                        Some(ScannerEvent::Message(value)) => print_json(&value)?,
                        Some(ScannerEvent::Disconnected) | None => {
                            warn!("Device disconnected");
                            break;
                        },
                        Some(_) => {},
                    },
                }
            }

            scanner.disconnect().await;
        },
        Commands::Send { command, data } => {
            let data: serde_json::Value = serde_json::from_str(&data).map_err(|source| AppRunError::InvalidData { source })?;

            let scanner = NetworkScanner::new(config.scanner, vec![])?;
            scanner.auto_connect().await?;
            scanner.send_command(&command, &data)?;
            scanner.disconnect().await;
        },
        Commands::Improv { device, action } => {
            let (sender, mut receiver) = channel(EVENT_BUFFER);
            let mut client = ImprovClient::new(config.improv, vec![sender]);

            let candidate = client.scan(|candidates| choose_candidate(device.as_deref(), candidates)).await?;
            info!("Using {} ({})", candidate.name.as_deref().unwrap_or("unnamed"), candidate.address);
            client.connect().await?;

            let result = run_improv_action(&client, action).await;

            // surface whatever the device reported while we were busy
            while let Ok(Some(event)) = receiver.try_next() {
                match event {
                    ImprovEvent::StateChanged(state) => info!("Device state: {}", ImprovState::from(state)),
                    ImprovEvent::ErrorChanged(error) => info!("Device error: {}", ImprovErrorCode::from(error)),
                    ImprovEvent::RpcResult(rpc) => info!("RPC result for command {}: {}", rpc.command, rpc.message),
                    ImprovEvent::Disconnected => warn!("Device disconnected"),
                }
            }

            client.disconnect().await?;
            result?;
        },
    }

    Ok(())
}

async fn run_improv_action(client: &ImprovClient, action: ImprovAction) -> Result<(), AppRunError> {
    match action {
        ImprovAction::State => {
            let state = client.get_current_state().await?;
            println!("{}", ImprovState::from(state));
        },
        ImprovAction::Capabilities => {
            println!("0x{:02x}", client.get_capabilities().await?);
        },
        ImprovAction::Identify => client.identify().await?,
        ImprovAction::Provision { ssid, password, wait } => {
            if wait {
                let result = client.configure_wifi_and_wait(&ssid, &password).await?;
                print_json(&result)?;
            } else {
                client.configure_wifi(&ssid, &password).await?;
            }
        },
    }

    Ok(())
}
