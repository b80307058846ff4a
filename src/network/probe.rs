//! Probes a single host for a companion device: HTTP health checks first, then a trial
//! WebSocket open. Failures are never errors here, they mean "nothing at this address".

use std::sync::Arc;
use log::debug;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use crate::config::types::ScannerConfig;
use crate::error::DiscoveryError;
use crate::network::types::{DeviceType, DiscoveredDevice, HealthInfo};

pub fn classify(info: &HealthInfo, known_device_names: &[String]) -> DeviceType {
    let Some(name) = &info.name else {
        return DeviceType::Generic;
    };
    let name = name.to_lowercase();

    if known_device_names.iter().any(|known| name.contains(&known.to_lowercase())) {
        DeviceType::KnownDevice
    } else {
        DeviceType::Generic
    }
}

#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    config: Arc<ScannerConfig>,
}

impl Prober {
    pub fn new(config: Arc<ScannerConfig>) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("laika-link/", env!("CARGO_PKG_VERSION")))
            .timeout(config.probe_timeout())
            // LAN addresses must never go through a proxy
            .no_proxy()
            .build()?;

        Ok(Prober { client, config })
    }

    /// Tries every port against every health path; the first `(host, port)` that answers wins and
    /// the remaining ports and paths of this host are skipped.
    pub async fn probe_host(&self, host: &str) -> Option<DiscoveredDevice> {
        for port in &self.config.ports {
            for path in &self.config.health_paths {
                let Some(info) = self.probe_http(host, *port, path).await else {
                    continue;
                };

                let device_type = classify(&info, &self.config.known_device_names);
                let mut device = DiscoveredDevice::new(host, *port, info, device_type);
                device.websocket_url = self.probe_websocket(host, *port).await;

                debug!("Found {:?} device {} at {}", device.device_type, device.name, device.base_url);
                return Some(device);
            }
        }

        None
    }

    async fn probe_http(&self, host: &str, port: u16, path: &str) -> Option<HealthInfo> {
        let url = format!("http://{}:{}{}", host, port, path);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("Probe {} failed: {}", url, err);
                return None;
            },
        };

        if !response.status().is_success() {
            debug!("Probe {} answered {}", url, response.status());
            return None;
        }

        // a non-json body still counts as a responding device
        let info = match response.text().await {
            Ok(body) => HealthInfo::from_body(&body),
            Err(err) => {
                debug!("Failed to read body of {}: {}", url, err);
                HealthInfo::default()
            },
        };

        Some(info)
    }

    /// Returns the url of the first WebSocket path that accepts a connection.
    pub async fn probe_websocket(&self, host: &str, port: u16) -> Option<String> {
        for path in &self.config.websocket_paths {
            let url = format!("ws://{}:{}{}", host, port, path);

            match timeout(self.config.websocket_probe_timeout(), connect_async(url.as_str())).await {
                Ok(Ok((mut stream, _))) => {
                    if let Err(err) = stream.close(None).await {
                        debug!("Failed to close websocket probe {}: {}", url, err);
                    }
                    return Some(url);
                },
                Ok(Err(err)) => debug!("Websocket probe {} failed: {}", url, err),
                Err(_) => debug!("Websocket probe {} timed out", url),
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        vec!["laika".to_string(), "companion".to_string()]
    }

    #[test]
    fn classify_matches_known_substrings_case_insensitively() {
        let info = HealthInfo { name: Some("My LAIKA Robot".to_string()), ..HealthInfo::default() };
        assert_eq!(classify(&info, &known()), DeviceType::KnownDevice);

        let info = HealthInfo { name: Some("Companion-2".to_string()), ..HealthInfo::default() };
        assert_eq!(classify(&info, &known()), DeviceType::KnownDevice);
    }

    #[test]
    fn classify_defaults_to_generic() {
        let info = HealthInfo { name: Some("printer".to_string()), ..HealthInfo::default() };
        assert_eq!(classify(&info, &known()), DeviceType::Generic);
        assert_eq!(classify(&HealthInfo::default(), &known()), DeviceType::Generic);
    }

    #[test]
    fn classify_uses_name_even_when_version_is_numeric() {
        let info = HealthInfo::from_body(r#"{"name": "LAIKA Companion", "version": 2, "capabilities": ["camera", 7]}"#);
        assert_eq!(classify(&info, &known()), DeviceType::KnownDevice);
    }
}
