use std::sync::{Arc, Mutex};
use futures::channel::mpsc::Sender;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;
use crate::network::types::{ConnectionState, ScannerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn publish(senders: &mut [Sender<ScannerEvent>], event: ScannerEvent) {
    for sender in senders.iter_mut() {
        if let Err(err) = sender.try_send(event.clone()) {
            debug!("Dropping scanner event for subscriber: {}", err);
        }
    }
}

/// A single live control-channel WebSocket. Dropping the handles is not enough to close it, call
/// [`Session::close`].
pub struct Session {
    url: String,
    state: Arc<Mutex<ConnectionState>>,
    outbound: UnboundedSender<Message>,
    cancel: CancellationToken,
    close_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub async fn open(url: &str, connect_timeout: Duration, senders: Vec<Sender<ScannerEvent>>) -> Result<Session, ConnectionError> {
        info!("Opening websocket {}", url);

        let (stream, _) = match timeout(connect_timeout, connect_async(url)).await {
            Err(_) => return Err(ConnectionError::Timeout),
            Ok(result) => result?,
        };

        let (sink, stream) = stream.split();
        let (outbound, outbound_rx) = unbounded_channel();
        let state = Arc::new(Mutex::new(ConnectionState::Connected));
        let cancel = CancellationToken::new();

        let writer = spawn(write_task(cancel.clone(), sink, outbound_rx));
        let reader = spawn(read_task(cancel.clone(), stream, state.clone(), senders));

        info!("Websocket {} connected", url);
        Ok(Session {
            url: url.to_string(),
            state,
            outbound,
            cancel,
            close_timeout: connect_timeout,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().map(|state| *state).unwrap_or(ConnectionState::Disconnected)
    }

    /// True once both socket tasks have stopped, either after [`Session::close`] or because the
    /// device went away.
    pub fn is_finished(&self) -> bool {
        self.tasks.lock()
            .map(|tasks| tasks.iter().all(|task| task.is_finished()))
            .unwrap_or(true)
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }

        self.outbound.send(Message::Text(text)).map_err(|_| ConnectionError::ChannelClosed)
    }

    /// Sends a close frame and waits for both socket tasks to stop. A task that does not stop
    /// within the connect timeout is aborted. Returns the state the session was in before
    /// closing.
    pub async fn close(&self) -> ConnectionState {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, ConnectionState::Disconnected),
            Err(_) => ConnectionState::Disconnected,
        };

        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => vec![],
        };
        for mut task in tasks {
            match timeout(self.close_timeout, &mut task).await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => warn!("Failed to join websocket task: {}", err),
                Err(_) => {
                    warn!("Websocket task did not stop within {:?}; aborting it", self.close_timeout);
                    task.abort();
                },
            }
        }

        info!("Websocket {} closed", self.url);
        previous
    }
}

async fn write_task(cancel: CancellationToken, mut sink: SplitSink<WsStream, Message>, mut outbound: UnboundedReceiver<Message>) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // flush what was queued before the close was requested
                while let Ok(message) = outbound.try_recv() {
                    if let Err(err) = sink.send(message).await {
                        debug!("Failed to flush websocket message: {}", err);
                        break;
                    }
                }
                break 'mainloop;
            },
            message = outbound.recv() => {
                let Some(message) = message else {
                    break 'mainloop;
                };

                if let Err(err) = sink.send(message).await {
                    warn!("Failed to send websocket message: {}", err);
                    break 'mainloop;
                }
            }
        }
    }

    if let Err(err) = sink.close().await {
        debug!("Failed to close websocket: {}", err);
    }
}

async fn read_task(cancel: CancellationToken, mut stream: SplitStream<WsStream>, state: Arc<Mutex<ConnectionState>>, mut senders: Vec<Sender<ScannerEvent>>) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // closed on purpose, close() reports the state change
                return;
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => publish(&mut senders, ScannerEvent::Message(value)),
                        Err(err) => warn!("Dropping malformed websocket message: {}", err),
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Websocket closed by device: {:?}", frame);
                    break 'mainloop;
                },
                Some(Ok(_)) => {},
                Some(Err(err)) => {
                    warn!("Websocket error: {}", err);
                    break 'mainloop;
                },
                None => break 'mainloop,
            },
        }
    }

    // the device went away; no automatic reconnection
    cancel.cancel();
    if let Ok(mut state) = state.lock() {
        *state = ConnectionState::Disconnected;
    }
    publish(&mut senders, ScannerEvent::Disconnected);
}
