//! Peer mesh transport over Unix domain sockets.
//!
//! Every process owns one socket in a shared root directory and keeps an
//! outbound connection to every peer it knows about:
//! ```text
//!            /tmp/peerbus/
//!    ┌──────────┬──────────┬──────────┐
//!    │ a.sock   │ b.sock   │ c.sock   │
//!    └──────────┴──────────┴──────────┘
//!         ▲ ╲        ▲  ╲       ▲
//!         │  ╲───────┼───╲──────┤   outbound: push records
//!         └──────────┴──────────┘   inbound: read loop per connection
//! ```
//!
//! Membership grows two ways:
//! 1. Bootstrap: a new transport dials every endpoint already in the directory
//! 2. Announcement: on listen, a transport broadcasts a peer-online record;
//!    receivers dial the announced endpoint and answer with their own
//!    peer-online record on that new connection
//!
//! On close a peer-offline record is broadcast and receivers drop the
//! departing endpoint. Records are newline-delimited JSON messages.
//!
//! Each outbound connection is owned by a writer task fed through a bounded
//! outbox, so a peer that stops reading never blocks `push` or `close`.
//! A write that does not finish within `write_timeout` retires the peer.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    is_reserved_event, MessageTransport, TransportError, PEER_OFFLINE_EVENT, PEER_ONLINE_EVENT,
};
use crate::id::{IdGenerator, UuidGenerator};
use crate::message::Message;

/// Default shared root directory for peer sockets.
pub const DEFAULT_ROOT_DIR: &str = "/tmp/peerbus";

/// Default file extension of peer sockets.
pub const DEFAULT_SOCKET_EXTENSION: &str = "sock";

/// Default limit on connecting to, or writing one record to, a peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of records queued per peer before new ones are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// One encoded record, shared by every peer outbox it is queued on.
type Record = Arc<[u8]>;

/// Configuration for the peer mesh transport.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Shared directory holding every peer's socket.
    pub root_dir: PathBuf,
    /// Extension of this transport's socket file.
    pub socket_extension: String,
    /// Limit on connecting to, or writing one record to, a peer.
    pub write_timeout: Duration,
    /// Records queued per peer before new ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            socket_extension: DEFAULT_SOCKET_EXTENSION.to_string(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl MeshConfig {
    /// Create config with custom root directory.
    pub fn with_root_dir(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Socket path for a given endpoint id.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.root_dir
            .join(format!("{}.{}", id, self.socket_extension))
    }
}

/// Lifecycle of a mesh transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Unbound,
    Listening,
    Closed,
}

/// Outbound side of one peer connection.
struct PeerLink {
    outbox: mpsc::Sender<Record>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    fn spawn(endpoint: PathBuf, stream: UnixStream, config: &MeshConfig) -> Self {
        let (outbox, rx) = mpsc::channel(config.outbox_capacity.max(1));
        let writer = tokio::spawn(write_loop(endpoint, stream, rx, config.write_timeout));
        Self { outbox, writer }
    }
}

/// Unix domain socket mesh transport.
///
/// Used by a bus to:
/// 1. Push locally emitted messages to every known peer
/// 2. Receive peer messages and membership announcements
/// 3. Announce its own arrival and departure
pub struct PeerMeshTransport {
    config: MeshConfig,
    /// This transport's own endpoint.
    socket: PathBuf,
    /// Outbound connections keyed by peer endpoint. Never held across I/O.
    peers: Mutex<HashMap<PathBuf, PeerLink>>,
    inbound: StdMutex<Option<mpsc::Sender<Message>>>,
    state: StdMutex<MeshState>,
    /// Flipped to true on close; stops the accept loop and read loops.
    shutdown: watch::Sender<bool>,
}

impl PeerMeshTransport {
    /// Create a transport and connect to every peer already in the root
    /// directory.
    pub async fn new(config: MeshConfig) -> Result<Self, TransportError> {
        Self::with_id_generator(config, &UuidGenerator).await
    }

    /// Same as [`PeerMeshTransport::new`] with a custom endpoint id source.
    pub async fn with_id_generator(
        config: MeshConfig,
        ids: &dyn IdGenerator,
    ) -> Result<Self, TransportError> {
        let root = config.root_dir.clone();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| TransportError::CreateRoot {
                path: root.clone(),
                source,
            })?;

        let endpoints = list_endpoints(&root).await?;
        let socket = config.socket_path(&ids.next_id());

        let mut peers = HashMap::new();
        for endpoint in endpoints {
            if let Some(stream) = connect_peer(&endpoint, config.write_timeout).await {
                let link = PeerLink::spawn(endpoint.clone(), stream, &config);
                peers.insert(endpoint, link);
            }
        }

        info!(
            socket = %socket.display(),
            peers = peers.len(),
            "Peer mesh transport created"
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            socket,
            peers: Mutex::new(peers),
            inbound: StdMutex::new(None),
            state: StdMutex::new(MeshState::Unbound),
            shutdown,
        })
    }

    /// Path of this transport's own socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Shared root directory.
    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    pub fn state(&self) -> MeshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn has_peers(&self) -> bool {
        !self.peers.lock().await.is_empty()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Endpoints this transport currently holds connections to.
    pub async fn peers(&self) -> Vec<PathBuf> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Open a client connection to this transport's own socket.
    pub async fn dial(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.socket).await
    }

    /// Spawn the accept loop and wait until the socket is bound.
    ///
    /// Returns the accept loop's handle, which resolves when the transport is
    /// closed or accepting fails.
    pub async fn start(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<(), TransportError>>, TransportError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(self).listen(ready_tx));

        if ready_rx.await.is_ok() {
            return Ok(handle);
        }

        match handle.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(TransportError::Closed),
            Err(e) => Err(TransportError::ListenerTask(e.to_string())),
        }
    }

    /// Bind the socket, announce it, and accept connections until closed.
    ///
    /// `ready` fires once the socket is bound, before the first accept.
    pub async fn listen(self: Arc<Self>, ready: oneshot::Sender<()>) -> Result<(), TransportError> {
        let listener = self.bind()?;
        info!(socket = %self.socket.display(), "Peer mesh transport listening");

        let _ = ready.send(());

        self.announce(PEER_ONLINE_EVENT).await;
        self.accept_loop(listener).await
    }

    fn bind(&self) -> Result<UnixListener, TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            MeshState::Unbound => {}
            MeshState::Listening => return Err(TransportError::AlreadyListening),
            MeshState::Closed => return Err(TransportError::Closed),
        }

        let listener = UnixListener::bind(&self.socket).map_err(|source| TransportError::Bind {
            path: self.socket.clone(),
            source,
        })?;
        *state = MeshState::Listening;
        Ok(listener)
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) -> Result<(), TransportError> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = closed(&mut shutdown) => {
                    debug!(socket = %self.socket.display(), "Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!(socket = %self.socket.display(), "Accepted peer connection");
                        tokio::spawn(Arc::clone(&self).read_loop(stream));
                    }
                    Err(e) => {
                        error!(socket = %self.socket.display(), error = %e, "Failed to accept connection");
                        return Err(TransportError::Accept(e));
                    }
                }
            }
        }
    }

    /// Read newline-delimited records from one inbound connection.
    async fn read_loop(self: Arc<Self>, stream: UnixStream) {
        let mut shutdown = self.shutdown.subscribe();
        let mut reader = BufReader::new(stream);
        let mut record = Vec::new();

        loop {
            record.clear();
            let read = tokio::select! {
                _ = closed(&mut shutdown) => break,
                read = reader.read_until(b'\n', &mut record) => read,
            };

            match read {
                Ok(0) => {
                    debug!(socket = %self.socket.display(), "Peer connection closed");
                    break;
                }
                Ok(_) => self.handle_record(&record, &mut shutdown).await,
                Err(e) => {
                    warn!(socket = %self.socket.display(), error = %e, "Peer connection read failed");
                    break;
                }
            }
        }
    }

    async fn handle_record(&self, record: &[u8], shutdown: &mut watch::Receiver<bool>) {
        if record.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let msg = match Message::decode_record(record) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(socket = %self.socket.display(), error = %e, "Skipping undecodable record");
                return;
            }
        };

        match msg.event.as_str() {
            PEER_ONLINE_EVENT => self.handle_online(&msg).await,
            PEER_OFFLINE_EVENT => self.handle_offline(&msg).await,
            _ => {}
        }

        self.deliver(msg, shutdown).await;
    }

    async fn handle_online(&self, msg: &Message) {
        let Some(endpoint) = announced_endpoint(msg) else {
            return;
        };
        if endpoint == self.socket || self.peers.lock().await.contains_key(&endpoint) {
            return;
        }

        let Some(stream) = connect_peer(&endpoint, self.config.write_timeout).await else {
            return;
        };
        let link = PeerLink::spawn(endpoint.clone(), stream, &self.config);

        let mut peers = self.peers.lock().await;
        if self.state() == MeshState::Closed || peers.contains_key(&endpoint) {
            return;
        }

        // The announcing peer may have dialed us at bootstrap without ever
        // hearing our own announcement.
        match self.control_message(PEER_ONLINE_EVENT).encode_line() {
            Ok(record) => {
                if link.outbox.try_send(Record::from(record)).is_err() {
                    warn!(peer = %endpoint.display(), "Failed to answer peer announcement");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode peer announcement"),
        }

        info!(peer = %endpoint.display(), "Peer online");
        peers.insert(endpoint, link);
    }

    async fn handle_offline(&self, msg: &Message) {
        let Some(endpoint) = announced_endpoint(msg) else {
            return;
        };
        if self.teardown_peer(&endpoint).await {
            info!(peer = %endpoint.display(), "Peer offline");
        }
    }

    /// Hand a decoded message to the owning bus, giving up once closed.
    async fn deliver(&self, msg: Message, shutdown: &mut watch::Receiver<bool>) {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = inbound else {
            return;
        };

        tokio::select! {
            _ = closed(shutdown) => debug!("Transport closed, message discarded"),
            sent = tx.send(msg) => {
                if sent.is_err() {
                    debug!("Inbound receiver dropped, message discarded");
                }
            }
        }
    }

    fn control_message(&self, event: &str) -> Message {
        Message::new(event, self.socket.to_string_lossy().into_owned())
    }

    async fn announce(&self, event: &str) {
        self.broadcast_message(&self.control_message(event)).await;
    }

    async fn broadcast_message(&self, msg: &Message) {
        match msg.encode_line() {
            Ok(record) => self.broadcast(Record::from(record)).await,
            Err(e) => error!(event = %msg.event, error = %e, "Failed to encode message"),
        }
    }

    /// Queue one record for every peer, pruning peers whose writer has
    /// stopped. Never waits on a socket.
    async fn broadcast(&self, record: Record) {
        let mut peers = self.peers.lock().await;
        peers.retain(|endpoint, link| {
            match link.outbox.try_send(Arc::clone(&record)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %endpoint.display(), "Peer outbox full, dropping record");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    info!(peer = %endpoint.display(), "Pruning departed peer");
                    false
                }
            }
        });
    }

    /// Forget one peer. Its writer flushes what is queued and then closes
    /// the connection. Returns false if the peer was unknown.
    async fn teardown_peer(&self, endpoint: &Path) -> bool {
        self.peers.lock().await.remove(endpoint).is_some()
    }

    /// Forget every peer and wait, bounded by the write timeout, for their
    /// writers to flush.
    async fn teardown_peers(&self) {
        let writers: Vec<JoinHandle<()>> = self
            .peers
            .lock()
            .await
            .drain()
            .map(|(_, PeerLink { writer, .. })| writer)
            .collect();
        if writers.is_empty() {
            return;
        }

        let aborts: Vec<_> = writers.iter().map(JoinHandle::abort_handle).collect();
        if timeout(self.config.write_timeout, join_all(writers))
            .await
            .is_err()
        {
            warn!(socket = %self.socket.display(), "Peer writers did not finish, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl MessageTransport for PeerMeshTransport {
    fn subscribe(&self, inbound: mpsc::Sender<Message>) {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
    }

    async fn push(&self, msg: Message) {
        if is_reserved_event(&msg.event) {
            warn!(event = %msg.event, "Refusing to send reserved event name");
            return;
        }
        self.broadcast_message(&msg).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, MeshState::Closed)
        };
        if previous == MeshState::Closed {
            return Ok(());
        }

        let had_peers = self.has_peers().await;
        let mut failures = Vec::new();

        if previous == MeshState::Listening {
            if let Err(source) = fs::remove_file(&self.socket).await {
                failures.push(TransportError::RemoveSocket {
                    path: self.socket.clone(),
                    source,
                });
            }
        }

        self.announce(PEER_OFFLINE_EVENT).await;
        self.teardown_peers().await;
        self.shutdown.send_replace(true);
        // Lets the owning bus's drain task finish.
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if !had_peers {
            match fs::remove_dir_all(&self.config.root_dir).await {
                Ok(()) => debug!(root = %self.config.root_dir.display(), "Removed root directory"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => failures.push(TransportError::RemoveRoot {
                    path: self.config.root_dir.clone(),
                    source,
                }),
            }
        }

        info!(socket = %self.socket.display(), "Peer mesh transport closed");
        TransportError::from_failures(failures)
    }
}

/// List candidate peer endpoints in the root directory.
async fn list_endpoints(root: &Path) -> Result<Vec<PathBuf>, TransportError> {
    let read_err = |source| TransportError::ReadRoot {
        path: root.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(root).await.map_err(read_err)?;
    let mut endpoints = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        if entry.file_type().await.map_err(read_err)?.is_dir() {
            continue;
        }
        endpoints.push(entry.path());
    }

    Ok(endpoints)
}

async fn connect_peer(endpoint: &Path, limit: Duration) -> Option<UnixStream> {
    match timeout(limit, UnixStream::connect(endpoint)).await {
        Ok(Ok(stream)) => {
            debug!(peer = %endpoint.display(), "Connected to peer");
            Some(stream)
        }
        Ok(Err(e)) => {
            warn!(peer = %endpoint.display(), error = %e, "Failed to connect to peer");
            None
        }
        Err(_) => {
            warn!(peer = %endpoint.display(), "Timed out connecting to peer");
            None
        }
    }
}

/// Result of writing one record to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    /// The record was lost but the connection is kept.
    Failed,
    /// The peer is unreachable; its writer stops.
    Gone,
}

fn write_outcome(endpoint: &Path, result: io::Result<()>) -> WriteOutcome {
    match result {
        Ok(()) => WriteOutcome::Written,
        Err(e) if is_peer_gone(&e) => {
            warn!(peer = %endpoint.display(), error = %e, "Peer unexpectedly closed");
            WriteOutcome::Gone
        }
        Err(e) => {
            warn!(peer = %endpoint.display(), error = %e, "Failed to write to peer");
            WriteOutcome::Failed
        }
    }
}

/// Drain one peer's outbox onto its connection until the outbox closes or
/// the peer stops accepting records.
async fn write_loop(
    endpoint: PathBuf,
    mut stream: UnixStream,
    mut outbox: mpsc::Receiver<Record>,
    limit: Duration,
) {
    while let Some(record) = outbox.recv().await {
        let outcome = match timeout(limit, stream.write_all(&record)).await {
            Ok(result) => write_outcome(&endpoint, result),
            Err(_) => {
                warn!(peer = %endpoint.display(), "Timed out writing to peer");
                WriteOutcome::Gone
            }
        };
        if outcome == WriteOutcome::Gone {
            break;
        }
    }
    shutdown_stream(&endpoint, stream).await;
}

async fn shutdown_stream(endpoint: &Path, mut stream: UnixStream) {
    if let Err(e) = stream.shutdown().await {
        debug!(peer = %endpoint.display(), error = %e, "Failed to close peer connection");
    }
}

fn announced_endpoint(msg: &Message) -> Option<PathBuf> {
    match msg.data_str() {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => {
            warn!(event = %msg.event, "Unable to process announcement data");
            None
        }
    }
}

/// Resolves once the transport has been closed.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Write failures meaning the peer is no longer there.
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}
