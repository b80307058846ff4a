//! Binary frames written to / notified from the Improv RPC characteristics.

use crate::error::ImprovError;
use crate::improv::constants::{COMMAND_IDENTIFY, COMMAND_WIFI_SETTINGS, MAX_FIELD_LEN};
use crate::improv::types::RpcResult;

pub fn identify_frame() -> Vec<u8> {
    vec![COMMAND_IDENTIFY]
}

/// `[WifiSettings, len(ssid), ssid..., len(password), password...]`
///
/// Fields longer than 255 bytes are rejected rather than truncated.
pub fn wifi_settings_frame(ssid: &str, password: &str) -> Result<Vec<u8>, ImprovError> {
    let ssid = ssid.as_bytes();
    let password = password.as_bytes();

    let ssid_len = field_len("SSID", ssid)?;
    let password_len = field_len("password", password)?;

    let mut frame = Vec::with_capacity(3 + ssid.len() + password.len());
    frame.push(COMMAND_WIFI_SETTINGS);
    frame.push(ssid_len);
    frame.extend_from_slice(ssid);
    frame.push(password_len);
    frame.extend_from_slice(password);
    Ok(frame)
}

fn field_len(field: &'static str, bytes: &[u8]) -> Result<u8, ImprovError> {
    if bytes.len() > MAX_FIELD_LEN {
        return Err(ImprovError::CredentialTooLong { field, len: bytes.len() });
    }
    Ok(bytes.len() as u8)
}

/// Decodes `[command, message length, message...]`.
///
/// Returns `None` for an empty frame. A missing or truncated message section decodes as an
/// empty message.
pub fn parse_rpc_result(bytes: &[u8]) -> Option<RpcResult> {
    let (&command, rest) = bytes.split_first()?;

    let message = match rest.split_first() {
        Some((&len, body)) if body.len() >= len as usize => {
            String::from_utf8_lossy(&body[..len as usize]).into_owned()
        },
        _ => String::new(),
    };

    Some(RpcResult { command, message })
}
