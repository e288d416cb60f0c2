//! Session multiplexer.
//!
//! Routes a shared transport's per-client byte streams to per-client
//! decoders and re-exposes decoded messages and lifecycle events through a
//! single [`EventSink`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 SessionMux                    │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │ ClientId=1 → Decoder 1                  │  │
//! │  │ ClientId=2 → Decoder 2                  │  │
//! │  │ ClientId=3 → (pending: factory running) │  │
//! │  └─────────────────────────────────────────┘  │
//! │                     │                         │
//! │                     ▼                         │
//! │   EventSink: parsed data / connect / disconnect│
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Session Lifecycle
//!
//! 1. `handle_connect` - Reserve slot, create and subscribe decoder, publish, emit connect
//! 2. `handle_receive` - Feed bytes to the client's decoder, or drop them
//! 3. `handle_disconnect` - Remove slot, tear decoder down once, emit disconnect
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | Multiplexer switches |
//! | `sink` | Upstream callbacks |
//! | `table` | Concurrent connection table (internal) |

// ============================================================================
// Submodules
// ============================================================================

/// Multiplexer options.
pub mod options;

/// Session event sink.
pub mod sink;

mod table;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::decoder::{Decoder, DecoderFactory};
use crate::error::{Error, Result};
use crate::identifiers::ClientId;
use crate::transport::{Transport, TransportHandler};

use self::table::{ConnectionTable, DecoderHandle, Slot};

// ============================================================================
// Re-exports
// ============================================================================

pub use options::MuxOptions;
pub use sink::{EventSink, LifecycleHandler, ParsedDataHandler, SessionEvent};

// ============================================================================
// Types
// ============================================================================

/// Message type produced by a factory's decoders.
pub type MessageOf<F> = <<F as DecoderFactory>::Decoder as Decoder>::Message;

// ============================================================================
// SessionMux
// ============================================================================

/// Multiplexes one transport's clients onto per-client decoders.
///
/// Thread-safe; every method takes `&self`.
///
/// # Example
///
/// ```ignore
/// let transport = TcpTransport::new(TcpOptions::new())?;
/// let factory = DelimiterDecoder::factory(b"\n".as_slice())?;
/// let mux = SessionMux::new(transport, factory);
///
/// mux.on_parsed_data(|client_id, line| println!("{client_id}: {line:?}"));
/// mux.open().await?;
/// ```
pub struct SessionMux<T, F>
where
    T: Transport,
    F: DecoderFactory,
{
    /// Underlying transport.
    transport: Arc<T>,

    /// State shared with the transport's handler registration.
    core: Arc<MuxCore<F>>,
}

/// Connection table, factory, and sink.
///
/// Registered with the transport as its [`TransportHandler`].
struct MuxCore<F: DecoderFactory> {
    factory: F,
    table: ConnectionTable<F::Decoder>,
    sink: Arc<EventSink<MessageOf<F>>>,
    options: MuxOptions,
}

// ============================================================================
// SessionMux - Constructor
// ============================================================================

impl<T, F> SessionMux<T, F>
where
    T: Transport,
    F: DecoderFactory,
{
    /// Creates a multiplexer with default options.
    ///
    /// Registers itself as the transport's handler.
    pub fn new(transport: T, factory: F) -> Self {
        Self::with_options(transport, factory, MuxOptions::default())
    }

    /// Creates a multiplexer with explicit options.
    pub fn with_options(transport: T, factory: F, options: MuxOptions) -> Self {
        let core = Arc::new(MuxCore {
            factory,
            table: ConnectionTable::new(),
            sink: Arc::new(EventSink::default()),
            options,
        });

        let transport = Arc::new(transport);
        transport.set_handler(Arc::clone(&core) as Arc<dyn TransportHandler>);

        debug!("SessionMux registered with transport");

        Self { transport, core }
    }
}

// ============================================================================
// SessionMux - Public API
// ============================================================================

impl<T, F> SessionMux<T, F>
where
    T: Transport,
    F: DecoderFactory,
{
    /// Returns the underlying transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Starts the transport.
    ///
    /// # Errors
    ///
    /// Propagates the transport's start failure.
    pub async fn open(&self) -> Result<()> {
        self.transport.start().await?;
        info!("SessionMux opened");
        Ok(())
    }

    /// Stops the transport.
    ///
    /// Sessions end through the disconnects the transport reports. With
    /// [`MuxOptions::drain_on_close`], any session still in the table
    /// afterwards is torn down and reported as disconnected.
    ///
    /// # Errors
    ///
    /// Propagates the transport's stop failure; nothing is drained then.
    pub async fn close(&self) -> Result<()> {
        self.transport.stop().await?;

        if self.core.options.drain_on_close {
            let remaining = self.core.table.all_ids();
            if !remaining.is_empty() {
                debug!(count = remaining.len(), "Draining sessions on close");
            }
            for client_id in remaining {
                self.core.disconnect(client_id).await;
            }
        }

        info!("SessionMux closed");
        Ok(())
    }

    /// Sends bytes to a client through the transport.
    ///
    /// # Errors
    ///
    /// - [`Error::ClientNotConnected`] if the transport does not know the client
    /// - [`Error::Busy`] if the transport cannot accept more data right now
    pub async fn send(&self, client_id: ClientId, data: impl Into<Bytes>) -> Result<()> {
        let result = self.transport.send(client_id, data.into()).await;
        if let Err(ref e) = result {
            debug!(client_id = %client_id, error = %e, "Send failed");
        }
        result
    }

    /// Returns the number of clients with a completed handshake.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.core.table.ready_count()
    }

    /// Returns `true` if `client_id` has a completed handshake.
    #[inline]
    #[must_use]
    pub fn is_connected(&self, client_id: ClientId) -> bool {
        self.core.table.is_ready(client_id)
    }

    /// Returns the clients with a completed handshake, in no particular order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.core.table.ready_ids()
    }
}

// ============================================================================
// SessionMux - Event Handlers
// ============================================================================

impl<T, F> SessionMux<T, F>
where
    T: Transport,
    F: DecoderFactory,
{
    /// Returns the event sink.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventSink<MessageOf<F>> {
        &self.core.sink
    }

    /// Sets the parsed data callback.
    pub fn on_parsed_data(&self, handler: impl Fn(ClientId, MessageOf<F>) + Send + Sync + 'static) {
        self.core.sink.set_on_parsed_data(handler);
    }

    /// Sets the connect callback.
    pub fn on_connect(&self, handler: impl Fn(ClientId) + Send + Sync + 'static) {
        self.core.sink.set_on_connect(handler);
    }

    /// Sets the disconnect callback.
    pub fn on_disconnect(&self, handler: impl Fn(ClientId) + Send + Sync + 'static) {
        self.core.sink.set_on_disconnect(handler);
    }

    /// Replaces all callbacks with a channel receiving every event.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent<MessageOf<F>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.core.sink.forward_to(tx);
        rx
    }
}

// ============================================================================
// SessionMux - Session Lifecycle
// ============================================================================

impl<T, F> SessionMux<T, F>
where
    T: Transport,
    F: DecoderFactory,
{
    /// Sets up a session for a newly connected client.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConnected`] if the client already has a session
    /// - [`Error::DecoderCreationFailed`] if the factory fails
    /// - [`Error::ClientNotConnected`] if the client disconnected while its
    ///   decoder was being created
    pub async fn handle_connect(&self, client_id: ClientId) -> Result<()> {
        self.core.connect(client_id).await
    }

    /// Routes bytes to the client's decoder, or drops them if it has none.
    pub async fn handle_receive(&self, client_id: ClientId, data: &[u8]) {
        self.core.receive(client_id, data).await;
    }

    /// Ends the client's session and emits the disconnect event.
    pub async fn handle_disconnect(&self, client_id: ClientId) {
        self.core.disconnect(client_id).await;
    }
}

// ============================================================================
// MuxCore
// ============================================================================

impl<F: DecoderFactory> MuxCore<F> {
    async fn connect(&self, client_id: ClientId) -> Result<()> {
        let reservation = self.table.reserve(client_id).ok_or_else(|| {
            warn!(client_id = %client_id, "Duplicate connect rejected");
            Error::already_connected(client_id)
        })?;

        let mut decoder = self.factory.create().await.map_err(|e| {
            warn!(client_id = %client_id, error = %e, "Decoder creation failed");
            Error::decoder_creation_failed(client_id, e)
        })?;

        let closed = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&closed);
        let sink = Arc::clone(&self.sink);
        decoder.subscribe(Box::new(move |message| {
            if gate.load(Ordering::Acquire) {
                trace!(client_id = %client_id, "Message after teardown dropped");
                return;
            }
            sink.emit_parsed_data(client_id, message);
        }));

        let handle = Arc::new(DecoderHandle::new(decoder, closed));

        // Feeds and a racing teardown wait here until the connect event is out.
        let published = {
            let guard = handle.hold().await;
            let published = reservation.commit(Arc::clone(&handle)).is_ok();
            if published {
                info!(client_id = %client_id, "Client connected");
                self.sink.emit_connect(client_id);
            }
            drop(guard);
            published
        };

        if !published {
            handle.close().await;
            debug!(client_id = %client_id, "Client disconnected during handshake");
            return Err(Error::client_not_connected(client_id));
        }

        Ok(())
    }

    async fn receive(&self, client_id: ClientId, data: &[u8]) {
        let Some(handle) = self.table.lookup(client_id) else {
            trace!(client_id = %client_id, len = data.len(), "Bytes for unknown client dropped");
            return;
        };

        match handle.feed(data).await {
            Ok(true) => {}
            Ok(false) => {
                trace!(client_id = %client_id, len = data.len(), "Bytes after disconnect dropped");
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Decoder rejected input");
            }
        }
    }

    async fn disconnect(&self, client_id: ClientId) {
        match self.table.remove(client_id) {
            Some(Slot::Ready(handle)) => {
                if handle.close().await {
                    debug!(client_id = %client_id, "Decoder torn down");
                }
            }
            Some(Slot::Pending(_)) => {
                debug!(client_id = %client_id, "Disconnect during handshake");
            }
            None => {
                debug!(client_id = %client_id, "Disconnect for unknown client");
            }
        }

        info!(client_id = %client_id, "Client disconnected");
        self.sink.emit_disconnect(client_id);
    }
}

#[async_trait]
impl<F: DecoderFactory> TransportHandler for MuxCore<F> {
    async fn on_connect(&self, client_id: ClientId) -> Result<()> {
        self.connect(client_id).await
    }

    async fn on_raw_data(&self, client_id: ClientId, data: Bytes) {
        self.receive(client_id, &data).await;
    }

    async fn on_disconnect(&self, client_id: ClientId) {
        self.disconnect(client_id).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use parking_lot::Mutex;
    use proptest::prelude::*;
    use tokio::sync::Semaphore;

    use crate::decoder::MessageHandler;

    // ------------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------------

    /// Message tagged with the serial number of the decoder that produced it.
    type Tagged = (usize, Vec<u8>);

    #[derive(Default)]
    struct DecoderLog {
        fed: Mutex<Vec<Vec<u8>>>,
        teardowns: AtomicUsize,
    }

    /// Emits every fed chunk as one message; rejects the chunk `bad`.
    struct ChunkDecoder {
        serial: usize,
        log: Arc<DecoderLog>,
        handler: Option<MessageHandler<Tagged>>,
    }

    #[async_trait]
    impl Decoder for ChunkDecoder {
        type Message = Tagged;

        fn subscribe(&mut self, handler: MessageHandler<Tagged>) {
            self.handler = Some(handler);
        }

        async fn feed(&mut self, data: &[u8]) -> Result<()> {
            self.log.fed.lock().push(data.to_vec());
            if data == b"bad" {
                return Err(Error::decoder("bad chunk"));
            }
            if let Some(ref handler) = self.handler {
                handler((self.serial, data.to_vec()));
            }
            Ok(())
        }

        fn teardown(&mut self) {
            self.log.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct ChunkFactory {
        logs: Arc<Mutex<Vec<Arc<DecoderLog>>>>,
        fail: Arc<AtomicBool>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ChunkFactory {
        fn gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let factory = Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::default()
            };
            (factory, gate)
        }

        fn created(&self) -> usize {
            self.logs.lock().len()
        }

        fn log(&self, serial: usize) -> Arc<DecoderLog> {
            Arc::clone(&self.logs.lock()[serial])
        }
    }

    #[async_trait]
    impl DecoderFactory for ChunkFactory {
        type Decoder = ChunkDecoder;

        async fn create(&self) -> Result<ChunkDecoder> {
            if let Some(ref gate) = self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| Error::decoder("gate closed"))?
                    .forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::decoder("factory offline"));
            }

            let log = Arc::new(DecoderLog::default());
            let mut logs = self.logs.lock();
            let serial = logs.len();
            logs.push(Arc::clone(&log));

            Ok(ChunkDecoder {
                serial,
                log,
                handler: None,
            })
        }
    }

    type SharedEmitter = Arc<Mutex<Option<MessageHandler<Tagged>>>>;

    /// Keeps its subscription through teardown and exposes it to the test.
    struct LingeringDecoder {
        emitter: SharedEmitter,
    }

    #[async_trait]
    impl Decoder for LingeringDecoder {
        type Message = Tagged;

        fn subscribe(&mut self, handler: MessageHandler<Tagged>) {
            *self.emitter.lock() = Some(handler);
        }

        async fn feed(&mut self, data: &[u8]) -> Result<()> {
            if let Some(ref handler) = *self.emitter.lock() {
                handler((0, data.to_vec()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct LingeringFactory {
        emitter: SharedEmitter,
    }

    #[async_trait]
    impl DecoderFactory for LingeringFactory {
        type Decoder = LingeringDecoder;

        async fn create(&self) -> Result<LingeringDecoder> {
            Ok(LingeringDecoder {
                emitter: Arc::clone(&self.emitter),
            })
        }
    }

    #[derive(Default)]
    struct MockTransport {
        handler: Mutex<Option<Arc<dyn TransportHandler>>>,
        registrations: AtomicUsize,
        running: AtomicBool,
        disconnect_on_stop: AtomicBool,
        live: Mutex<HashSet<ClientId>>,
        sent: Mutex<Vec<(ClientId, Bytes)>>,
    }

    impl MockTransport {
        fn handler(&self) -> Arc<dyn TransportHandler> {
            self.handler.lock().clone().expect("handler registered")
        }

        async fn connect(&self, client_id: ClientId) -> Result<()> {
            self.live.lock().insert(client_id);
            self.handler().on_connect(client_id).await
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            *self.handler.lock() = Some(handler);
        }

        async fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            if self.disconnect_on_stop.load(Ordering::SeqCst) {
                let ids: Vec<ClientId> = self.live.lock().drain().collect();
                let handler = self.handler();
                for client_id in ids {
                    handler.on_disconnect(client_id).await;
                }
            }
            Ok(())
        }

        async fn send(&self, client_id: ClientId, data: Bytes) -> Result<()> {
            if !self.live.lock().contains(&client_id) {
                return Err(Error::client_not_connected(client_id));
            }
            self.sent.lock().push((client_id, data));
            Ok(())
        }
    }

    type TestMux = SessionMux<MockTransport, ChunkFactory>;
    type Events = mpsc::UnboundedReceiver<SessionEvent<Tagged>>;

    fn setup_with(factory: ChunkFactory, options: MuxOptions) -> (TestMux, ChunkFactory, Events) {
        let mux = SessionMux::with_options(MockTransport::default(), factory.clone(), options);
        let events = mux.subscribe();
        (mux, factory, events)
    }

    fn setup() -> (TestMux, ChunkFactory, Events) {
        setup_with(ChunkFactory::default(), MuxOptions::default())
    }

    fn drain(events: &mut Events) -> Vec<SessionEvent<Tagged>> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn wait_pending(mux: &TestMux, client_id: ClientId) {
        for _ in 0..100 {
            if mux.core.table.all_ids().contains(&client_id) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connect for {client_id} never reserved its slot");
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    #[test]
    fn test_registers_with_transport_once() {
        let (mux, _, _) = setup();
        assert_eq!(mux.transport().registrations.load(Ordering::SeqCst), 1);
        assert_eq!(mux.connection_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_receive_disconnect() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        assert!(mux.is_connected(c1));

        mux.handle_receive(c1, b"m1").await;
        mux.handle_disconnect(c1).await;

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"m1".to_vec())),
                SessionEvent::Disconnected(c1),
            ]
        );
        assert!(!mux.is_connected(c1));
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_client_is_absorbed() {
        let (mux, factory, mut events) = setup();
        let ghost = ClientId::new(99);

        mux.handle_receive(ghost, b"lost").await;
        mux.handle_disconnect(ghost).await;

        assert_eq!(drain(&mut events), vec![SessionEvent::Disconnected(ghost)]);
        assert_eq!(mux.connection_count(), 0);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("first connect");
        let second = mux.handle_connect(c1).await;

        assert!(matches!(second, Err(Error::AlreadyConnected { client_id }) if client_id == c1));
        assert_eq!(factory.created(), 1);
        assert_eq!(mux.connection_count(), 1);

        mux.handle_receive(c1, b"x").await;
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"x".to_vec())),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_disconnect_tears_down_once() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        mux.handle_disconnect(c1).await;
        mux.handle_disconnect(c1).await;

        let disconnects = drain(&mut events)
            .into_iter()
            .filter(|e| *e == SessionEvent::Disconnected(c1))
            .count();
        assert_eq!(disconnects, 2);
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bytes_after_disconnect_dropped() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        mux.handle_receive(c1, b"before").await;
        mux.handle_disconnect(c1).await;
        mux.handle_receive(c1, b"after").await;

        assert_eq!(factory.log(0).fed.lock().as_slice(), &[b"before".to_vec()]);
        assert!(
            !drain(&mut events)
                .iter()
                .any(|e| *e == SessionEvent::ParsedData(c1, (0, b"after".to_vec())))
        );
    }

    #[tokio::test]
    async fn test_reconnect_gets_fresh_decoder() {
        let (mux, factory, _events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        mux.handle_disconnect(c1).await;
        mux.handle_connect(c1).await.expect("reconnect");
        mux.handle_receive(c1, b"again").await;

        assert_eq!(factory.created(), 2);
        assert!(factory.log(0).fed.lock().is_empty());
        assert_eq!(factory.log(1).fed.lock().as_slice(), &[b"again".to_vec()]);
    }

    #[tokio::test]
    async fn test_concurrent_clients_isolated() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);
        let c2 = ClientId::new(2);

        let (r1, r2) = tokio::join!(mux.handle_connect(c1), mux.handle_connect(c2));
        r1.expect("c1");
        r2.expect("c2");
        assert_eq!(factory.created(), 2);

        tokio::join!(mux.handle_receive(c1, b"for-c1"), mux.handle_receive(c2, b"for-c2"));

        let mut serial_of = std::collections::HashMap::new();
        for event in drain(&mut events) {
            if let SessionEvent::ParsedData(client_id, (serial, payload)) = event {
                let expected: &[u8] = if client_id == c1 { b"for-c1" } else { b"for-c2" };
                assert_eq!(payload, expected);
                serial_of.insert(client_id, serial);
            }
        }

        assert_eq!(serial_of.len(), 2);
        assert_ne!(serial_of[&c1], serial_of[&c2]);
        for client_id in [c1, c2] {
            let fed = factory.log(serial_of[&client_id]).fed.lock().clone();
            assert_eq!(fed.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_decoder_error_keeps_session() {
        let (mux, _, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        mux.handle_receive(c1, b"bad").await;
        mux.handle_receive(c1, b"good").await;

        assert!(mux.is_connected(c1));
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"good".to_vec())),
            ]
        );
    }

    // ------------------------------------------------------------------------
    // Handshake Races
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_factory_failure_aborts_handshake() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        factory.fail.store(true, Ordering::SeqCst);
        let result = mux.handle_connect(c1).await;

        let Err(Error::DecoderCreationFailed { client_id, source }) = result else {
            panic!("expected decoder creation failure");
        };
        assert_eq!(client_id, c1);
        assert!(matches!(*source, Error::Decoder { ref message } if message == "factory offline"));
        assert!(!mux.is_connected(c1));
        assert!(mux.core.table.all_ids().is_empty());
        assert!(drain(&mut events).is_empty());

        factory.fail.store(false, Ordering::SeqCst);
        mux.handle_connect(c1).await.expect("retry after failure");
        assert!(mux.is_connected(c1));
    }

    #[tokio::test]
    async fn test_bytes_during_handshake_dropped() {
        let (factory, gate) = ChunkFactory::gated();
        let (mux, factory, mut events) = setup_with(factory, MuxOptions::default());
        let mux = Arc::new(mux);
        let c1 = ClientId::new(1);

        let connecting = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.handle_connect(c1).await }
        });
        wait_pending(&mux, c1).await;

        mux.handle_receive(c1, b"early").await;
        assert!(!mux.is_connected(c1));

        gate.add_permits(1);
        connecting.await.expect("join").expect("connect");

        assert!(factory.log(0).fed.lock().is_empty());
        assert_eq!(drain(&mut events), vec![SessionEvent::Connected(c1)]);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake() {
        let (factory, gate) = ChunkFactory::gated();
        let (mux, factory, mut events) = setup_with(factory, MuxOptions::default());
        let mux = Arc::new(mux);
        let c1 = ClientId::new(1);

        let connecting = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.handle_connect(c1).await }
        });
        wait_pending(&mux, c1).await;

        mux.handle_disconnect(c1).await;
        gate.add_permits(1);
        let result = connecting.await.expect("join");

        assert!(matches!(result, Err(Error::ClientNotConnected { .. })));
        assert!(!mux.is_connected(c1));
        assert!(mux.core.table.all_ids().is_empty());
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut events), vec![SessionEvent::Disconnected(c1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_waits_for_connect_event() {
        let (mux, factory, _events) = setup();
        let mux = Arc::new(mux);
        let c1 = ClientId::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&order);
        mux.on_connect(move |_| {
            std::thread::sleep(Duration::from_millis(100));
            seen.lock().push("connect");
        });
        let seen = Arc::clone(&order);
        mux.on_disconnect(move |_| seen.lock().push("disconnect"));

        let disconnecting = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move {
                while !mux.is_connected(c1) {
                    tokio::task::yield_now().await;
                }
                mux.handle_disconnect(c1).await;
            }
        });

        mux.handle_connect(c1).await.expect("connect");
        disconnecting.await.expect("join");

        assert_eq!(order.lock().as_slice(), &["connect", "disconnect"]);
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_waits_for_connect_event() {
        let (mux, _, mut events) = setup();
        let mux = Arc::new(mux);
        let c1 = ClientId::new(1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connects = tx.clone();
        mux.events().set_on_connect(move |id| {
            std::thread::sleep(Duration::from_millis(100));
            let _ = connects.send(SessionEvent::Connected(id));
        });
        mux.events().set_on_parsed_data(move |id, message| {
            let _ = tx.send(SessionEvent::ParsedData(id, message));
        });

        let receiving = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move {
                while !mux.is_connected(c1) {
                    tokio::task::yield_now().await;
                }
                mux.handle_receive(c1, b"eager").await;
            }
        });

        mux.handle_connect(c1).await.expect("connect");
        receiving.await.expect("join");

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"eager".to_vec())),
            ]
        );
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_slot() {
        let (factory, gate) = ChunkFactory::gated();
        let (mux, _, _events) = setup_with(factory, MuxOptions::default());
        let mux = Arc::new(mux);
        let c1 = ClientId::new(1);

        let connecting = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.handle_connect(c1).await }
        });
        wait_pending(&mux, c1).await;

        connecting.abort();
        let _ = connecting.await;
        assert!(mux.core.table.all_ids().is_empty());

        gate.add_permits(1);
        mux.handle_connect(c1).await.expect("connect after cancel");
    }

    #[tokio::test]
    async fn test_messages_after_teardown_suppressed() {
        let factory = LingeringFactory::default();
        let emitter = Arc::clone(&factory.emitter);
        let mux = SessionMux::new(MockTransport::default(), factory);
        let mut events = mux.subscribe();
        let c1 = ClientId::new(1);

        mux.handle_connect(c1).await.expect("connect");
        mux.handle_receive(c1, b"live").await;
        mux.handle_disconnect(c1).await;

        tokio::spawn(async move {
            if let Some(ref handler) = *emitter.lock() {
                handler((0, b"late".to_vec()));
            }
        })
        .await
        .expect("join");

        let seen = drain(&mut events);
        assert_eq!(
            seen,
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"live".to_vec())),
                SessionEvent::Disconnected(c1),
            ]
        );
    }

    // ------------------------------------------------------------------------
    // Transport Delegation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_transport_notifications_route_to_sessions() {
        let (mux, _, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.transport().connect(c1).await.expect("connect");
        let handler = mux.transport().handler();
        handler.on_raw_data(c1, Bytes::from_static(b"hi")).await;
        handler.on_disconnect(c1).await;

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::Connected(c1),
                SessionEvent::ParsedData(c1, (0, b"hi".to_vec())),
                SessionEvent::Disconnected(c1),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_delegates_to_transport() {
        let (mux, _, _events) = setup();
        let c1 = ClientId::new(1);

        mux.transport().connect(c1).await.expect("connect");
        mux.send(c1, &b"reply"[..]).await.expect("send");

        let sent = mux.transport().sent.lock().clone();
        assert_eq!(sent, vec![(c1, Bytes::from_static(b"reply"))]);

        let err = mux.send(ClientId::new(2), &b"nobody"[..]).await.unwrap_err();
        assert!(matches!(err, Error::ClientNotConnected { .. }));
    }

    #[tokio::test]
    async fn test_open_close_drive_transport() {
        let (mux, _, _events) = setup();

        mux.open().await.expect("open");
        assert!(mux.transport().running.load(Ordering::SeqCst));

        mux.close().await.expect("close");
        assert!(!mux.transport().running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_relies_on_transport_disconnects() {
        let (mux, factory, mut events) = setup();
        let c1 = ClientId::new(1);

        mux.transport().connect(c1).await.expect("connect");
        mux.close().await.expect("close");
        assert!(mux.is_connected(c1));
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 0);

        mux.transport().disconnect_on_stop.store(true, Ordering::SeqCst);
        mux.close().await.expect("close");
        assert!(!mux.is_connected(c1));
        assert!(drain(&mut events).contains(&SessionEvent::Disconnected(c1)));
    }

    #[tokio::test]
    async fn test_close_drains_when_configured() {
        let (mux, factory, mut events) = setup_with(
            ChunkFactory::default(),
            MuxOptions::new().with_drain_on_close(true),
        );
        let (c1, c2) = (ClientId::new(1), ClientId::new(2));

        mux.handle_connect(c1).await.expect("c1");
        mux.handle_connect(c2).await.expect("c2");
        mux.close().await.expect("close");

        assert_eq!(mux.connection_count(), 0);
        assert_eq!(factory.log(0).teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(factory.log(1).teardowns.load(Ordering::SeqCst), 1);

        let disconnected: HashSet<ClientId> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Disconnected(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(disconnected, HashSet::from([c1, c2]));
    }

    #[tokio::test]
    async fn test_callbacks_via_setters() {
        let (mux, _, _events) = setup();
        let connects = Arc::new(AtomicUsize::new(0));
        let c1 = ClientId::new(1);

        let counter = Arc::clone(&connects);
        mux.on_connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        mux.handle_connect(c1).await.expect("connect");

        mux.events().clear();
        mux.handle_disconnect(c1).await;
        mux.handle_connect(c1).await.expect("reconnect");

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(mux.client_ids(), vec![c1]);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Connect(u64),
        Receive(u64),
        Disconnect(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        (0..3u8, 1..5u64).prop_map(|(kind, id)| match kind {
            0 => Op::Connect(id),
            1 => Op::Receive(id),
            _ => Op::Disconnect(id),
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        #[test]
        fn test_table_follows_lifecycle(ops in prop::collection::vec(op_strategy(), 1..40)) {
            tokio_test::block_on(async {
                let (mux, factory, mut events) = setup();
                let mut model: HashSet<u64> = HashSet::new();

                for op in &ops {
                    match *op {
                        Op::Connect(id) => {
                            let result = mux.handle_connect(ClientId::new(id)).await;
                            if model.insert(id) {
                                assert!(result.is_ok());
                            } else {
                                assert!(matches!(result, Err(Error::AlreadyConnected { .. })));
                            }
                        }
                        Op::Receive(id) => mux.handle_receive(ClientId::new(id), b"m").await,
                        Op::Disconnect(id) => {
                            mux.handle_disconnect(ClientId::new(id)).await;
                            model.remove(&id);
                        }
                    }

                    assert_eq!(mux.connection_count(), model.len());
                    for id in 1..5 {
                        assert_eq!(mux.is_connected(ClientId::new(id)), model.contains(&id));
                    }
                }

                let logs = factory.logs.lock().clone();
                let torn_down: usize = logs
                    .iter()
                    .map(|log| log.teardowns.load(Ordering::SeqCst))
                    .sum();
                assert!(logs.iter().all(|log| log.teardowns.load(Ordering::SeqCst) <= 1));
                assert_eq!(logs.len() - torn_down, model.len());

                let mut live = HashSet::new();
                for event in drain(&mut events) {
                    match event {
                        SessionEvent::Connected(id) => assert!(live.insert(id)),
                        SessionEvent::ParsedData(id, _) => assert!(live.contains(&id)),
                        SessionEvent::Disconnected(id) => {
                            live.remove(&id);
                        }
                    }
                }
            });
        }
    }
}
