use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::mpsc::Sender;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::ImprovConfig;
use crate::error::ImprovError;
use crate::improv::constants::*;
use crate::improv::frame::{identify_frame, parse_rpc_result, wifi_settings_frame};
use crate::improv::types::{ImprovCandidate, ImprovCommand, ImprovErrorCode, ImprovEvent, RpcResult, SessionState};

#[derive(Debug, Clone)]
struct ImprovCharacteristics {
    current_state: Characteristic,
    error_state: Characteristic,
    rpc_command: Characteristic,
    rpc_result: Characteristic,
    capabilities: Characteristic,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    // resolved once per connection, cleared on disconnect
    characteristics: Option<ImprovCharacteristics>,
}

type PendingSender = oneshot::Sender<Result<RpcResult, ImprovErrorCode>>;

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    by_command: HashMap<u8, Vec<(u64, PendingSender)>>,
}

/// RPC commands waiting for their answer on the result characteristic, keyed by command byte.
#[derive(Debug, Clone, Default)]
pub struct PendingResults {
    inner: Arc<Mutex<Waiters>>,
}

impl PendingResults {
    pub fn register(&self, command: u8, deadline: Duration) -> PendingResult {
        let (tx, rx) = oneshot::channel();
        let mut id = 0;
        if let Ok(mut inner) = self.inner.lock() {
            id = inner.next_id;
            inner.next_id += 1;
            inner.by_command.entry(command).or_default().push((id, tx));
        }
        PendingResult { rx, deadline, command, id, owner: self.clone() }
    }

    fn forget(&self, command: u8, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if let Some(waiters) = inner.by_command.get_mut(&command) {
            waiters.retain(|(waiter_id, _)| *waiter_id != id);
            if waiters.is_empty() {
                inner.by_command.remove(&command);
            }
        }
    }

    /// Returns true if at least one waiter received the result.
    pub fn resolve(&self, result: &RpcResult) -> bool {
        let waiters = match self.inner.lock() {
            Ok(mut inner) => inner.by_command.remove(&result.command).unwrap_or_default(),
            Err(_) => return false,
        };

        let mut delivered = false;
        for (_, waiter) in waiters {
            delivered |= waiter.send(Ok(result.clone())).is_ok();
        }
        delivered
    }

    pub fn reject_all(&self, code: ImprovErrorCode) {
        let waiters: Vec<(u64, PendingSender)> = match self.inner.lock() {
            Ok(mut inner) => inner.by_command.drain().flat_map(|(_, waiters)| waiters).collect(),
            Err(_) => return,
        };

        for (_, waiter) in waiters {
            let _ = waiter.send(Err(code));
        }
    }

    /// Drops every waiter; they observe `NotConnected`.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.by_command.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.by_command.values().map(Vec::len).sum()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered waiter. Dropping it, or a timed out [`PendingResult::wait`], removes it from
/// its [`PendingResults`].
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Result<RpcResult, ImprovErrorCode>>,
    deadline: Duration,
    command: u8,
    id: u64,
    owner: PendingResults,
}

impl PendingResult {
    pub async fn wait(mut self) -> Result<RpcResult, ImprovError> {
        match timeout(self.deadline, &mut self.rx).await {
            Err(_) => Err(ImprovError::ResultTimeout),
            Ok(Err(_)) => Err(ImprovError::NotConnected),
            Ok(Ok(Err(code))) => Err(ImprovError::Device(code)),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        self.owner.forget(self.command, self.id);
    }
}

fn publish(senders: &mut [Sender<ImprovEvent>], event: ImprovEvent) {
    for sender in senders.iter_mut() {
        if let Err(err) = sender.try_send(event.clone()) {
            debug!("Dropping improv event for subscriber: {}", err);
        }
    }
}

fn matches_filter(config: &ImprovConfig, services: &[Uuid], local_name: Option<&str>) -> bool {
    if services.contains(&IMPROV_SERVICE) {
        return true;
    }

    match local_name {
        Some(name) => config.name_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())),
        None => false,
    }
}

fn find_characteristic(characteristics: &[Characteristic], uuid: Uuid) -> Result<Characteristic, ImprovError> {
    characteristics.iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .cloned()
        .ok_or(ImprovError::MissingCharacteristic(uuid))
}

async fn setup_improv_service(peripheral: &Peripheral) -> Result<ImprovCharacteristics, ImprovError> {
    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    let service = peripheral.services()
        .into_iter()
        .find(|service| service.uuid == IMPROV_SERVICE)
        .ok_or(ImprovError::MissingService)?;
    let available: Vec<Characteristic> = service.characteristics.into_iter().collect();

    let characteristics = ImprovCharacteristics {
        current_state: find_characteristic(&available, CURRENT_STATE_CHARACTERISTIC)?,
        error_state: find_characteristic(&available, ERROR_STATE_CHARACTERISTIC)?,
        rpc_command: find_characteristic(&available, RPC_COMMAND_CHARACTERISTIC)?,
        rpc_result: find_characteristic(&available, RPC_RESULT_CHARACTERISTIC)?,
        capabilities: find_characteristic(&available, CAPABILITIES_CHARACTERISTIC)?,
    };

    for characteristic in [&characteristics.current_state, &characteristics.error_state, &characteristics.rpc_result] {
        debug!("Subscribing to characteristic {:?}", characteristic.uuid);
        peripheral.subscribe(characteristic).await?;
    }

    Ok(characteristics)
}

/// Runs `disconnect` when `result` is an error. The original error is returned even if
/// disconnecting fails too.
async fn close_on_failure<T, D, F>(result: Result<T, ImprovError>, disconnect: D) -> Result<T, ImprovError>
where
    D: FnOnce() -> F,
    F: Future<Output = Result<(), btleplug::Error>>,
{
    if let Err(err) = &result {
        info!("Improv setup failed ({}); Disconnecting", err);
        if let Err(disconnect_err) = disconnect().await {
            warn!("Failed to disconnect after setup failure: {}", disconnect_err);
        }
    }
    result
}

/// Drives the Improv WiFi provisioning protocol over a single GATT connection.
pub struct ImprovClient {
    config: ImprovConfig,
    senders: Vec<Sender<ImprovEvent>>,
    manager: Option<Manager>,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    session: Arc<Mutex<Session>>,
    pending: PendingResults,
    cancel: CancellationToken,
    connection_cancel: CancellationToken,
    disconnect_listener: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<Result<(), ImprovError>>>,
}

impl ImprovClient {
    pub fn new(config: ImprovConfig, senders: Vec<Sender<ImprovEvent>>) -> Self {
        let cancel = CancellationToken::new();
        let connection_cancel = cancel.child_token();

        ImprovClient {
            config,
            senders,
            manager: None,
            adapter: None,
            peripheral: None,
            session: Arc::new(Mutex::new(Session {
                state: SessionState::Unscanned,
                characteristics: None,
            })),
            pending: PendingResults::default(),
            cancel,
            connection_cancel,
            disconnect_listener: None,
            notifications: None,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.lock().map(|session| session.state).unwrap_or(SessionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    fn set_session(&self, state: SessionState, characteristics: Option<ImprovCharacteristics>) {
        if let Ok(mut session) = self.session.lock() {
            session.state = state;
            session.characteristics = characteristics;
        }
    }

    fn connected_characteristics(&self) -> Result<(Peripheral, ImprovCharacteristics), ImprovError> {
        let session = self.session.lock().map_err(|_| ImprovError::NotConnected)?;

        match (&self.peripheral, session.state, &session.characteristics) {
            (Some(peripheral), SessionState::Connected, Some(characteristics)) => {
                Ok((peripheral.clone(), characteristics.clone()))
            },
            _ => Err(ImprovError::NotConnected),
        }
    }

    async fn first_adapter(&mut self) -> Result<Adapter, ImprovError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(ImprovError::BluetoothUnavailable)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        self.manager = Some(manager);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Scans for peripherals that advertise the Improv service or whose name starts with one of
    /// the configured prefixes, and lets `chooser` pick one of them.
    pub async fn scan<F>(&mut self, chooser: F) -> Result<ImprovCandidate, ImprovError>
    where
        F: FnOnce(&[ImprovCandidate]) -> Option<usize>,
    {
        let adapter = self.first_adapter().await?;

        // name prefix matches need an unfiltered scan
        adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for Improv devices for {:?}...", self.config.scan_duration());
        sleep(self.config.scan_duration()).await;
        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scanning: {:?}", err);
        }

        let mut found: Vec<(Peripheral, ImprovCandidate)> = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                    continue;
                },
            };

            if !matches_filter(&self.config, &properties.services, properties.local_name.as_deref()) {
                continue;
            }

            let candidate = ImprovCandidate {
                name: properties.local_name.clone(),
                address: properties.address.to_string(),
                rssi: properties.rssi,
                advertises_service: properties.services.contains(&IMPROV_SERVICE),
            };
            debug!("Improv candidate {:?}", candidate);
            found.push((peripheral, candidate));
        }

        let candidates: Vec<ImprovCandidate> = found.iter().map(|(_, candidate)| candidate.clone()).collect();
        let index = chooser(&candidates)
            .filter(|index| *index < found.len())
            .ok_or(ImprovError::NoDeviceSelected)?;
        let (peripheral, candidate) = found.swap_remove(index);

        info!(
            "Selected peripheral {} {}",
            candidate.address,
            candidate.name.as_deref().unwrap_or("NONE"),
        );

        // a new selection replaces the previous one
        self.disconnect().await?;
        if let Some(handle) = self.disconnect_listener.take() {
            handle.abort();
        }

        self.disconnect_listener = Some(self.disconnect_listener_task(&adapter, &peripheral).await?);
        self.peripheral = Some(peripheral);
        self.set_session(SessionState::Scanned, None);

        Ok(candidate)
    }

    async fn disconnect_listener_task(&self, adapter: &Adapter, peripheral: &Peripheral) -> Result<JoinHandle<()>, ImprovError> {
        let mut events = adapter.events().await?;
        let peripheral_id = peripheral.id();
        let session = self.session.clone();
        let pending = self.pending.clone();
        let cancel = self.cancel.clone();
        let mut senders = self.senders.clone();

        Ok(spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = events.next() => match event {
                        None => break 'mainloop,
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            warn!("Improv device disconnected");
                            if let Ok(mut session) = session.lock() {
                                session.state = SessionState::Disconnected;
                                session.characteristics = None;
                            }
                            pending.clear();
                            publish(&mut senders, ImprovEvent::Disconnected);
                        },
                        Some(_) => {},
                    },
                }
            }
        }))
    }

    /// Opens the GATT link, resolves the five Improv characteristics and arms notifications on
    /// current-state, error-state and RPC-result.
    pub async fn connect(&mut self) -> Result<(), ImprovError> {
        let peripheral = self.peripheral.clone().ok_or(ImprovError::NoDeviceSelected)?;

        info!("Connecting to peripheral...");
        peripheral.connect().await?;

        let setup = setup_improv_service(&peripheral).await;
        let characteristics = close_on_failure(setup, || peripheral.disconnect()).await?;

        self.stop_notifications().await;
        self.notifications = Some(self.read_notifications_task(&peripheral));
        self.set_session(SessionState::Connected, Some(characteristics));

        info!("Improv device ready");
        Ok(())
    }

    fn read_notifications_task(&self, peripheral: &Peripheral) -> JoinHandle<Result<(), ImprovError>> {
        let peripheral = peripheral.clone();
        let cancel = self.connection_cancel.clone();
        let pending = self.pending.clone();
        let mut senders = self.senders.clone();

        spawn(async move {
            let mut notification_stream = peripheral.notifications().await?;

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    notification = notification_stream.next() => {
                        let Some(data) = notification else {
                            break 'mainloop;
                        };

                        if data.uuid == CURRENT_STATE_CHARACTERISTIC {
                            match data.value.first() {
                                Some(state) => publish(&mut senders, ImprovEvent::StateChanged(*state)),
                                None => warn!("Empty current state notification"),
                            }
                        }
                        else if data.uuid == ERROR_STATE_CHARACTERISTIC {
                            match data.value.first() {
                                Some(error) => {
                                    let code = ImprovErrorCode::from(*error);
                                    if code.is_error() {
                                        pending.reject_all(code);
                                    }
                                    publish(&mut senders, ImprovEvent::ErrorChanged(*error));
                                },
                                None => warn!("Empty error state notification"),
                            }
                        }
                        else if data.uuid == RPC_RESULT_CHARACTERISTIC {
                            match parse_rpc_result(&data.value) {
                                Some(result) => {
                                    pending.resolve(&result);
                                    publish(&mut senders, ImprovEvent::RpcResult(result));
                                },
                                None => warn!("Empty RPC result notification"),
                            }
                        }
                    }
                }
            }

            Ok(())
        })
    }

    async fn stop_notifications(&mut self) {
        self.connection_cancel.cancel();
        self.connection_cancel = self.cancel.child_token();

        if let Some(handle) = self.notifications.take() {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => warn!("Error during read notifications task: {}", err),
                Err(err) => warn!("Failed to join read notifications task: {}", err),
            }
        }
    }

    async fn read_byte(&self, select: fn(&ImprovCharacteristics) -> &Characteristic) -> Result<u8, ImprovError> {
        let (peripheral, characteristics) = self.connected_characteristics()?;
        let value = peripheral.read(select(&characteristics)).await?;
        value.first().copied().ok_or(ImprovError::EmptyValue)
    }

    async fn write_command(&self, frame: &[u8]) -> Result<(), ImprovError> {
        let (peripheral, characteristics) = self.connected_characteristics()?;
        peripheral.write(&characteristics.rpc_command, frame, WriteType::WithResponse).await?;
        Ok(())
    }

    pub async fn get_current_state(&self) -> Result<u8, ImprovError> {
        self.read_byte(|characteristics| &characteristics.current_state).await
    }

    pub async fn get_error_state(&self) -> Result<u8, ImprovError> {
        self.read_byte(|characteristics| &characteristics.error_state).await
    }

    pub async fn get_capabilities(&self) -> Result<u8, ImprovError> {
        self.read_byte(|characteristics| &characteristics.capabilities).await
    }

    pub async fn identify(&self) -> Result<(), ImprovError> {
        self.connected_characteristics()?;
        info!("Sending identify command");
        self.write_command(&identify_frame()).await
    }

    /// Writes the WiFi credentials. The outcome is reported asynchronously through
    /// [`ImprovEvent::ErrorChanged`] and [`ImprovEvent::RpcResult`].
    pub async fn configure_wifi(&self, ssid: &str, password: &str) -> Result<(), ImprovError> {
        self.connected_characteristics()?;
        let frame = wifi_settings_frame(ssid, password)?;
        info!("Sending WiFi settings for SSID {:?}", ssid);
        self.write_command(&frame).await
    }

    /// Registers interest in the next RPC result for `command`. Register before writing the
    /// command so a fast answer is not missed.
    pub fn expect_rpc_result(&self, command: ImprovCommand) -> PendingResult {
        self.pending.register(command.byte(), self.config.result_timeout())
    }

    pub async fn configure_wifi_and_wait(&self, ssid: &str, password: &str) -> Result<RpcResult, ImprovError> {
        let pending = self.expect_rpc_result(ImprovCommand::WifiSettings);
        self.configure_wifi(ssid, password).await?;
        pending.wait().await
    }

    /// Tears down the GATT link if connected and forgets the cached characteristics. Calling
    /// this when not connected is a no-op.
    pub async fn disconnect(&mut self) -> Result<(), ImprovError> {
        self.stop_notifications().await;
        self.pending.clear();

        let was_connected = self.is_connected();
        if self.peripheral.is_some() {
            self.set_session(SessionState::Disconnected, None);
        }

        if let (true, Some(peripheral)) = (was_connected, &self.peripheral) {
            info!("Disconnecting from Improv device");
            peripheral.disconnect().await?;
        }

        Ok(())
    }
}

impl Drop for ImprovClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
