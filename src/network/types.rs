use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Generic,
    KnownDevice,
}

/// Optional JSON body of a health-check response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub capabilities: Vec<String>,
    pub status: Option<String>,
}

// numbers are accepted for text fields, devices report versions like `2` or `1.4`
fn text_field(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

impl HealthInfo {
    /// Picks each recognised field out of a health body on its own, so a field of an unexpected
    /// type only loses that field. Anything that is not a JSON object yields no info at all.
    pub fn from_body(body: &str) -> HealthInfo {
        let Ok(body) = serde_json::from_str::<Value>(body) else {
            return HealthInfo::default();
        };

        let capabilities = match body.get("capabilities") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => vec![],
        };

        HealthInfo {
            name: text_field(&body, "name"),
            version: text_field(&body, "version"),
            capabilities,
            status: text_field(&body, "status"),
        }
    }
}

fn serialize_rfc3339<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_rfc3339_millis(*time))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub address: String,
    pub port: u16,
    pub base_url: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub status: Option<String>,
    pub websocket_url: Option<String>,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub timestamp: SystemTime,
}

impl DiscoveredDevice {
    pub fn new(address: &str, port: u16, info: HealthInfo, device_type: DeviceType) -> Self {
        let mut capabilities: Vec<String> = Vec::with_capacity(info.capabilities.len());
        for capability in info.capabilities {
            if !capabilities.contains(&capability) {
                capabilities.push(capability);
            }
        }

        DiscoveredDevice {
            address: address.to_string(),
            port,
            base_url: format!("http://{}:{}", address, port),
            name: info.name.unwrap_or_else(|| format!("Device at {}", address)),
            device_type,
            capabilities,
            version: info.version,
            status: info.status,
            websocket_url: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn key(&self) -> (String, u16) {
        (self.address.clone(), self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    ScanStarted,
    DeviceFound(DiscoveredDevice),
    ScanFinished(usize),
    Connected(String),
    /// Inbound JSON from the control channel, passed through as-is.
    Message(serde_json::Value),
    Disconnected,
}

/// Outbound control-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command<'a> {
    pub command: &'a str,
    pub data: &'a serde_json::Value,
    pub timestamp: u64,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
