use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use futures::channel::mpsc::Sender;
use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, info};
use tokio::time::sleep;

use crate::config::types::ScannerConfig;
use crate::error::{ConnectionError, DiscoveryError};
use crate::network::constants::{FIRST_HOST, LAST_HOST};
use crate::network::probe::Prober;
use crate::network::session::{publish, Session};
use crate::network::types::{unix_millis, Command, ConnectionState, DeviceType, DiscoveredDevice, ScannerEvent};

type DeviceMap = IndexMap<(String, u16), DiscoveredDevice>;

/// Orders devices by type, then WebSocket availability, then number of capabilities.
fn compare_devices(a: &DiscoveredDevice, b: &DiscoveredDevice) -> CmpOrdering {
    let a_known = a.device_type == DeviceType::KnownDevice;
    let b_known = b.device_type == DeviceType::KnownDevice;

    a_known.cmp(&b_known)
        .then(a.websocket_url.is_some().cmp(&b.websocket_url.is_some()))
        .then(a.capabilities.len().cmp(&b.capabilities.len()))
}

/// Picks the best device; among equally ranked devices the one discovered first wins.
pub fn rank_devices(devices: &[DiscoveredDevice]) -> Option<&DiscoveredDevice> {
    devices.iter()
        .enumerate()
        .max_by(|(a_index, a), (b_index, b)| compare_devices(a, b).then(b_index.cmp(a_index)))
        .map(|(_, device)| device)
}

// resets the scanning flag however the scan ends
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Discovers companion devices on the local network and owns the single live control channel.
///
/// All methods take `&self`; share the scanner behind an `Arc` to let a scan and a connection
/// attempt overlap.
pub struct NetworkScanner {
    config: Arc<ScannerConfig>,
    prober: Prober,
    senders: Vec<Sender<ScannerEvent>>,
    scanning: AtomicBool,
    devices: Mutex<Vec<DiscoveredDevice>>,
    connecting: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
    // serializes connect and disconnect so at most one socket is ever live
    connect_lock: tokio::sync::Mutex<()>,
}

impl NetworkScanner {
    pub fn new(config: ScannerConfig, senders: Vec<Sender<ScannerEvent>>) -> Result<Self, DiscoveryError> {
        let config = Arc::new(config);
        let prober = Prober::new(config.clone())?;

        Ok(NetworkScanner {
            config,
            prober,
            senders,
            scanning: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
            connecting: AtomicBool::new(false),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn publish(&self, event: ScannerEvent) {
        let mut senders = self.senders.clone();
        publish(&mut senders, event);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Devices found by the last completed scan.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().map(|devices| devices.clone()).unwrap_or_default()
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }

        self.current_session()
            .map(|session| session.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Probes the priority hosts of every configured range and the mDNS names. Only if that
    /// finds nothing are the remaining hosts of every range probed, in delayed batches.
    pub async fn start_scan(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Scan requested while another scan is running");
            return Err(DiscoveryError::ScanInProgress);
        }
        let _guard = ScanGuard(&self.scanning);

        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
        self.publish(ScannerEvent::ScanStarted);
        info!("Scanning {} network ranges", self.config.network_prefixes.len());

        let mut found = DeviceMap::new();

        for prefix in &self.config.network_prefixes {
            let hosts: Vec<String> = self.config.priority_hosts.iter()
                .map(|suffix| format!("{}.{}", prefix, suffix))
                .collect();
            self.probe_batch(&hosts, &mut found).await;
        }
        self.probe_batch(&self.config.mdns_hosts, &mut found).await;

        if found.is_empty() {
            info!("No devices at priority addresses; scanning full ranges");
            self.broad_scan(&mut found).await;
        }

        let devices: Vec<DiscoveredDevice> = found.into_values().collect();
        if let Ok(mut stored) = self.devices.lock() {
            *stored = devices.clone();
        }

        info!("Scan finished, {} device(s) found", devices.len());
        self.publish(ScannerEvent::ScanFinished(devices.len()));
        Ok(devices)
    }

    async fn broad_scan(&self, found: &mut DeviceMap) {
        let batch_size = self.config.batch_size.max(1);
        let mut first_batch = true;

        for prefix in &self.config.network_prefixes {
            let hosts: Vec<String> = (FIRST_HOST..=LAST_HOST)
                .filter(|suffix| !self.config.priority_hosts.contains(suffix))
                .map(|suffix| format!("{}.{}", prefix, suffix))
                .collect();

            for batch in hosts.chunks(batch_size) {
                if !first_batch {
                    sleep(self.config.batch_delay()).await;
                }
                first_batch = false;

                self.probe_batch(batch, found).await;
            }
        }
    }

    async fn probe_batch(&self, hosts: &[String], found: &mut DeviceMap) {
        let results = join_all(hosts.iter().map(|host| self.prober.probe_host(host))).await;

        for device in results.into_iter().flatten() {
            let key = device.key();
            if found.contains_key(&key) {
                continue;
            }

            info!("Discovered {} at {}", device.name, device.base_url);
            self.publish(ScannerEvent::DeviceFound(device.clone()));
            found.insert(key, device);
        }
    }

    /// The best device of the last scan.
    pub fn get_best_device(&self) -> Option<DiscoveredDevice> {
        let devices = self.devices.lock().ok()?;
        rank_devices(&devices).cloned()
    }

    /// Closes any live session, then opens the device's WebSocket. Resolves once the socket is
    /// open.
    pub async fn connect_to_device(&self, device: &DiscoveredDevice) -> Result<(), ConnectionError> {
        let url = device.websocket_url.as_deref().ok_or_else(|| ConnectionError::NoWebSocketEndpoint {
            address: device.address.clone(),
            port: device.port,
        })?;

        let _lock = self.connect_lock.lock().await;
        self.close_session().await;

        self.connecting.store(true, Ordering::SeqCst);
        let result = Session::open(url, self.config.connect_timeout(), self.senders.clone()).await;
        self.connecting.store(false, Ordering::SeqCst);

        let session = result?;
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(Arc::new(session));
        }

        self.publish(ScannerEvent::Connected(url.to_string()));
        Ok(())
    }

    async fn close_session(&self) {
        let session = self.session.lock().ok().and_then(|mut slot| slot.take());

        if let Some(session) = session {
            if session.close().await == ConnectionState::Connected {
                self.publish(ScannerEvent::Disconnected);
            }
        }
    }

    /// Closes the live session, if any.
    pub async fn disconnect(&self) {
        let _lock = self.connect_lock.lock().await;
        self.close_session().await;
    }

    /// Fire-and-forget: sends `{command, data, timestamp}` as a JSON text frame.
    pub fn send_command(&self, command: &str, data: &serde_json::Value) -> Result<(), ConnectionError> {
        let session = self.current_session().ok_or(ConnectionError::NotConnected)?;

        let frame = Command {
            command,
            data,
            timestamp: unix_millis(),
        };
        let text = serde_json::to_string(&frame)?;

        debug!("Sending command {} to {}", command, session.url());
        session.send_text(text)
    }

    pub async fn auto_connect(&self) -> Result<DiscoveredDevice, DiscoveryError> {
        self.start_scan().await?;

        let device = self.get_best_device().ok_or(DiscoveryError::NoDevicesFound)?;
        info!("Best device is {} at {}", device.name, device.base_url);

        self.connect_to_device(&device).await?;
        Ok(device)
    }
}
