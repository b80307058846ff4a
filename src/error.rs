use std::io;
use std::fmt::Display;
use std::str::Utf8Error;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

use crate::improv::types::ImprovErrorCode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("No devices were discovered on the network")]
    NoDevicesFound,

    #[error("Failed to build http client (reqwest): {source}")]
    Http { #[from] source: reqwest::Error },

    #[error("Failed to connect to discovered device: {source}")]
    Connection { #[from] source: ConnectionError },
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Device {address}:{port} has no working websocket endpoint")]
    NoWebSocketEndpoint { address: String, port: u16 },

    #[error("No websocket connection is open")]
    NotConnected,

    #[error("Opening the websocket took too long")]
    Timeout,

    #[error("Error communicating over websocket (tungstenite): {source}")]
    WebSocket { #[from] source: tungstenite::Error },

    #[error("Failed to encode command as json: {source}")]
    Json { #[from] source: serde_json::Error },

    #[error("The websocket writer task has stopped")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum ImprovError {
    #[error("Bluetooth LE is not available on this system")]
    BluetoothUnavailable,

    #[error("No Improv device has been selected, scan first")]
    NoDeviceSelected,

    #[error("Not connected to an Improv device")]
    NotConnected,

    #[error("The device does not expose the Improv service")]
    MissingService,

    #[error("A required bluetooth characteristic is not available: {0}")]
    MissingCharacteristic(Uuid),

    #[error("The characteristic returned an empty value")]
    EmptyValue,

    #[error("The {field} is {len} bytes long, at most 255 bytes fit in a frame")]
    CredentialTooLong { field: &'static str, len: usize },

    #[error("The device reported an error: {0}")]
    Device(ImprovErrorCode),

    #[error("Timed out waiting for the RPC result")]
    ResultTimeout,

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start runtime: {source}")]
    Runtime { #[from] source: io::Error },

    #[error("{source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("{source}")]
    Discovery { #[from] source: DiscoveryError },

    #[error("{source}")]
    Connection { #[from] source: ConnectionError },

    #[error("{source}")]
    Improv { #[from] source: ImprovError },

    #[error("Invalid json: {source}")]
    InvalidData { #[source] source: serde_json::Error },
}

pub fn print_error<T: Display>(message: &'static str, error: &T) {
    eprintln!("{}: {}", message, error);
}
