use std::fmt;
use serde::Serialize;

use crate::improv::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImprovState {
    Ready,
    Provisioning,
    Provisioned,
    Unknown(u8),
}

impl From<u8> for ImprovState {
    fn from(value: u8) -> Self {
        match value {
            STATE_READY => ImprovState::Ready,
            STATE_PROVISIONING => ImprovState::Provisioning,
            STATE_PROVISIONED => ImprovState::Provisioned,
            other => ImprovState::Unknown(other),
        }
    }
}

impl fmt::Display for ImprovState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImprovState::Ready => write!(f, "Ready"),
            ImprovState::Provisioning => write!(f, "Provisioning"),
            ImprovState::Provisioned => write!(f, "Provisioned"),
            ImprovState::Unknown(value) => write!(f, "Unknown (0x{:02x})", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImprovErrorCode {
    NoError,
    InvalidRpc,
    UnknownRpc,
    UnableToConnect,
    NotAuthorized,
    Unknown(u8),
}

impl ImprovErrorCode {
    pub fn is_error(&self) -> bool {
        *self != ImprovErrorCode::NoError
    }
}

impl From<u8> for ImprovErrorCode {
    fn from(value: u8) -> Self {
        match value {
            ERROR_NONE => ImprovErrorCode::NoError,
            ERROR_INVALID_RPC => ImprovErrorCode::InvalidRpc,
            ERROR_UNKNOWN_RPC => ImprovErrorCode::UnknownRpc,
            ERROR_UNABLE_TO_CONNECT => ImprovErrorCode::UnableToConnect,
            ERROR_NOT_AUTHORIZED => ImprovErrorCode::NotAuthorized,
            other => ImprovErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ImprovErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImprovErrorCode::NoError => write!(f, "no error"),
            ImprovErrorCode::InvalidRpc => write!(f, "invalid RPC packet"),
            ImprovErrorCode::UnknownRpc => write!(f, "unknown RPC command"),
            ImprovErrorCode::UnableToConnect => write!(f, "unable to connect to the WiFi network"),
            ImprovErrorCode::NotAuthorized => write!(f, "not authorized"),
            ImprovErrorCode::Unknown(value) => write!(f, "unknown error (0x{:02x})", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImprovCommand {
    WifiSettings,
    Identify,
}

impl ImprovCommand {
    pub fn byte(&self) -> u8 {
        match self {
            ImprovCommand::WifiSettings => COMMAND_WIFI_SETTINGS,
            ImprovCommand::Identify => COMMAND_IDENTIFY,
        }
    }
}

/// Answer to an RPC command, notified asynchronously on the result characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcResult {
    pub command: u8,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unscanned,
    Scanned,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImprovEvent {
    Disconnected,
    StateChanged(u8),
    ErrorChanged(u8),
    RpcResult(RpcResult),
}

/// A peripheral seen during a scan that matches the Improv filter.
#[derive(Debug, Clone)]
pub struct ImprovCandidate {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub advertises_service: bool,
}
