use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScannerConfig {
    /// The first three octets of every class-C style range to probe, e.g. `192.168.1`.
    pub network_prefixes: Vec<String>,
    /// Host suffixes probed first in every range.
    pub priority_hosts: Vec<u8>,
    pub mdns_hosts: Vec<String>,
    pub ports: Vec<u16>,
    pub health_paths: Vec<String>,
    pub websocket_paths: Vec<String>,
    /// Case-insensitive substrings of the reported `name` that mark a known device.
    pub known_device_names: Vec<String>,
    pub probe_timeout_ms: u64,
    pub websocket_probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl ScannerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn websocket_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.websocket_probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            network_prefixes: ["192.168.1", "192.168.0", "10.0.0", "192.168.4", "172.16.0"]
                .into_iter().map(String::from).collect(),
            priority_hosts: vec![1, 100, 101, 200, 254],
            mdns_hosts: ["laika.local", "laika-robot.local", "raspberrypi.local"]
                .into_iter().map(String::from).collect(),
            ports: vec![8080, 3000, 5000, 8000, 80],
            health_paths: ["/health", "/api/status", "/status", "/"]
                .into_iter().map(String::from).collect(),
            websocket_paths: ["/ws", "/websocket", "/api/ws"]
                .into_iter().map(String::from).collect(),
            known_device_names: ["laika", "companion", "robot"]
                .into_iter().map(String::from).collect(),
            probe_timeout_ms: 2000,
            websocket_probe_timeout_ms: 1000,
            connect_timeout_ms: 5000,
            batch_size: 20,
            batch_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImprovConfig {
    /// Advertised local name prefixes accepted in addition to the Improv service uuid.
    pub name_prefixes: Vec<String>,
    pub scan_duration_ms: u64,
    pub result_timeout_ms: u64,
}

impl ImprovConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

impl Default for ImprovConfig {
    fn default() -> Self {
        ImprovConfig {
            name_prefixes: vec![String::from("LAIKA"), String::from("Laika")],
            scan_duration_ms: 5000,
            result_timeout_ms: 30000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub improv: ImprovConfig,
}
