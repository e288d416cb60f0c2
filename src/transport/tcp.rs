//! TCP listener transport.
//!
//! Accepts any number of TCP clients on one listening socket. Every
//! accepted stream gets a fresh [`ClientId`], a reader task that reports
//! raw chunks to the handler, and a writer task draining a bounded
//! outbound queue.
//!
//! # Connection Lifecycle
//!
//! 1. Accept loop assigns a `ClientId` and registers the outbound queue
//! 2. `on_connect` - a rejected session closes the socket silently
//! 3. Reader loop - one `on_raw_data` per socket read
//! 4. EOF, read error, or `stop()` - `on_disconnect`, exactly once
//!
//! # Example
//!
//! ```ignore
//! let transport = TcpTransport::new(TcpOptions::new().with_max_connections(128))?;
//! let mux = SessionMux::new(transport, factory);
//! mux.open().await?;
//! println!("listening on {:?}", mux.transport().local_addr());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ClientId;

use super::options::TcpOptions;
use super::{Transport, TransportHandler};

// ============================================================================
// Types
// ============================================================================

/// Outbound queues by client.
type ClientMap = FxHashMap<ClientId, mpsc::Sender<Bytes>>;

/// An accepted stream already counted against the connection limit.
struct Admitted {
    client_id: ClientId,
    addr: SocketAddr,
    stream: TcpStream,
    outbound_rx: mpsc::Receiver<Bytes>,
}

// ============================================================================
// TcpTransport
// ============================================================================

/// [`Transport`] over a single TCP listener.
pub struct TcpTransport {
    /// Listener and per-client settings.
    options: TcpOptions,

    /// State shared with the accept loop and session tasks.
    shared: Arc<Shared>,

    /// Present while started.
    running: tokio::sync::Mutex<Option<Running>>,
}

/// State reachable from background tasks.
struct Shared {
    /// Notification receiver.
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,

    /// Live clients.
    clients: RwLock<ClientMap>,

    /// Bound address while started.
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Handles for one start/stop cycle.
struct Running {
    /// Flipped to `true` to stop the accept loop and every session.
    stop_tx: watch::Sender<bool>,

    /// Accept loop task.
    accept: JoinHandle<()>,

    /// Yields `None` once every session task has finished.
    drained_rx: mpsc::Receiver<()>,
}

// ============================================================================
// TcpTransport - Constructor
// ============================================================================

impl TcpTransport {
    /// Creates a stopped transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: TcpOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            options,
            shared: Arc::new(Shared {
                handler: RwLock::new(None),
                clients: RwLock::new(ClientMap::default()),
                local_addr: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        })
    }
}

// ============================================================================
// TcpTransport - Public API
// ============================================================================

impl TcpTransport {
    /// Returns the bound address while started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Returns the number of live clients.
    #[inline]
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    /// Returns the configured options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }
}

// ============================================================================
// TcpTransport - Transport
// ============================================================================

#[async_trait]
impl Transport for TcpTransport {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        let previous = self.shared.handler.write().replace(handler);
        if previous.is_some() {
            warn!("TcpTransport handler replaced");
        }
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::config("TcpTransport already started"));
        }

        let handler = self
            .shared
            .handler
            .read()
            .clone()
            .ok_or_else(|| Error::config("TcpTransport has no handler registered"))?;

        let listener = TcpListener::bind(self.options.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.shared.local_addr.lock() = Some(local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (drained_tx, drained_rx) = mpsc::channel(1);

        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            handler,
            listener,
            self.options.clone(),
            stop_rx,
            drained_tx,
        ));

        *running = Some(Running {
            stop_tx,
            accept,
            drained_rx,
        });

        info!(%local_addr, "TcpTransport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        let Some(Running {
            stop_tx,
            accept,
            mut drained_rx,
        }) = running
        else {
            debug!("TcpTransport stop while not running");
            return Ok(());
        };

        let _ = stop_tx.send(true);

        if let Err(e) = accept.await {
            error!(error = %e, "Accept loop panicked");
        }

        // Every session holds a drain sender; recv resolves once all are gone.
        let _ = drained_rx.recv().await;

        *self.shared.local_addr.lock() = None;
        info!("TcpTransport stopped");
        Ok(())
    }

    async fn send(&self, client_id: ClientId, data: Bytes) -> Result<()> {
        let outbound = self
            .shared
            .clients
            .read()
            .get(&client_id)
            .cloned()
            .ok_or_else(|| Error::client_not_connected(client_id))?;

        outbound
            .try_send(data)
            .map_err(|e| send_error(client_id, e))
    }
}

/// Maps a queue rejection to the crate error.
fn send_error(client_id: ClientId, err: TrySendError<Bytes>) -> Error {
    match err {
        TrySendError::Full(_) => {
            warn!(client_id = %client_id, "Outbound queue full");
            Error::busy(format!("send to client {client_id}"))
        }
        TrySendError::Closed(_) => Error::client_not_connected(client_id),
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Accepts connections until the stop signal flips.
async fn accept_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn TransportHandler>,
    listener: TcpListener,
    options: TcpOptions,
    mut stop_rx: watch::Receiver<bool>,
    drained_tx: mpsc::Sender<()>,
) {
    debug!("Accept loop started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let Some(admitted) = admit(&shared, &options, stream, addr) else {
                            warn!(
                                ?addr,
                                max = ?options.max_connections,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        };

                        tokio::spawn(run_session(
                            Arc::clone(&shared),
                            Arc::clone(&handler),
                            admitted,
                            options.read_buffer_size,
                            stop_rx.clone(),
                            drained_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }

            _ = stop_rx.changed() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }

    debug!("Accept loop terminated");
}

/// Registers an accepted stream unless the connection limit is reached.
///
/// The check and the insert happen under one write lock, so a burst of
/// accepts cannot overshoot the limit. Dropping a refused stream closes it.
fn admit(
    shared: &Shared,
    options: &TcpOptions,
    stream: TcpStream,
    addr: SocketAddr,
) -> Option<Admitted> {
    let mut clients = shared.clients.write();
    if options
        .max_connections
        .is_some_and(|max| clients.len() >= max)
    {
        return None;
    }

    let client_id = ClientId::next();
    let (outbound_tx, outbound_rx) = mpsc::channel(options.send_queue_capacity);
    clients.insert(client_id, outbound_tx);

    Some(Admitted {
        client_id,
        addr,
        stream,
        outbound_rx,
    })
}

// ============================================================================
// Session
// ============================================================================

/// Drives one client from connect to disconnect.
///
/// `_drained` is held for the task's lifetime so `stop()` can wait on it.
async fn run_session(
    shared: Arc<Shared>,
    handler: Arc<dyn TransportHandler>,
    admitted: Admitted,
    read_buffer_size: usize,
    stop_rx: watch::Receiver<bool>,
    _drained: mpsc::Sender<()>,
) {
    let Admitted {
        client_id,
        addr,
        stream,
        outbound_rx,
    } = admitted;
    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(client_id, write_half, outbound_rx));

    debug!(client_id = %client_id, ?addr, "TCP connection accepted");

    if let Err(e) = handler.on_connect(client_id).await {
        warn!(client_id = %client_id, error = %e, "Session rejected, closing connection");
        shared.clients.write().remove(&client_id);
        let _ = writer.await;
        return;
    }

    read_loop(client_id, &handler, read_half, read_buffer_size, stop_rx).await;

    // Dropping the queue sender lets the writer flush and shut down.
    shared.clients.write().remove(&client_id);
    handler.on_disconnect(client_id).await;
    let _ = writer.await;

    debug!(client_id = %client_id, ?addr, "TCP connection closed");
}

/// Forwards socket reads to the handler until EOF, error, or stop.
async fn read_loop(
    client_id: ClientId,
    handler: &Arc<dyn TransportHandler>,
    mut read_half: OwnedReadHalf,
    read_buffer_size: usize,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buffer = BytesMut::with_capacity(read_buffer_size);

    loop {
        buffer.reserve(read_buffer_size);

        tokio::select! {
            read = read_half.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => {
                        debug!(client_id = %client_id, "Connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        trace!(client_id = %client_id, len = n, "Bytes received");
                        let chunk = buffer.split().freeze();
                        handler.on_raw_data(client_id, chunk).await;
                    }
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Read failed");
                        break;
                    }
                }
            }

            _ = stop_rx.changed() => {
                debug!(client_id = %client_id, "Transport stopping");
                break;
            }
        }
    }
}

/// Writes queued chunks until the queue closes or a write fails.
async fn write_loop(
    client_id: ClientId,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) {
    while let Some(data) = outbound_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            warn!(client_id = %client_id, error = %e, "Write failed");
            break;
        }
        trace!(client_id = %client_id, len = data.len(), "Bytes sent");
    }

    let _ = write_half.shutdown().await;
}

// ============================================================================
// Tests
// ============================================================================
