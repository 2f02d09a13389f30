//! Peer transport links.
//!
//! Each configured peer has exactly one logical [`Connection`], holding at
//! most one live TCP session at a time. The higher-indexed member dials the
//! lower-indexed one (the active side); the lower-indexed member accepts and
//! routes the socket to the right peer slot using the 4-byte little-endian
//! member index the dialer writes immediately after connecting.
//!
//! A connection runs its own threads: a writer draining a bounded outbound
//! queue, plus (active side) a dial loop that reconnects with a short backoff
//! for as long as the node lives, or (passive side) a reader spawned per
//! accepted socket. Inbound envelopes are decoded on the reader thread and
//! handed to the node, which processes them under its own lock -- connections
//! carry bytes, never consensus state.
//!
//! The session socket sits behind a per-connection lock so that writer
//! dispatch and reader teardown never race; replacing or closing a session
//! shuts the socket down, which terminates any reader blocked on it.

use super::address::AddressResolver;
use super::message::Envelope;
use super::node::MemberId;
use super::{CONNECTION_ALIVE_WINDOW, CONNECT_TIMEOUT, OUTBOUND_QUEUE_SIZE, RECONNECT_BACKOFF};
use crate::encoding;
use crate::error::Result;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::io::Write as _;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receives inbound envelopes from peer connections. Implemented by the node;
/// processing happens under the node lock, one message at a time. An error is
/// fatal for the session that delivered the message.
pub(crate) trait Inbound: Send + Sync {
    fn receive(&self, from: MemberId, epoch: u64, envelope: Envelope) -> Result<()>;
}

/// A transport link to one configured peer.
pub(crate) struct Connection {
    /// The peer's member index: the slot this connection occupies.
    peer: MemberId,
    /// The local member index, written as the dial handshake.
    local: MemberId,
    /// The configuration epoch the connection belongs to. Messages from
    /// connections of a replaced configuration are discarded by the node.
    epoch: u64,
    /// Whether we dial the peer. The higher-indexed member dials the
    /// lower-indexed one.
    active: bool,
    /// The peer's address, re-resolved on every dial attempt.
    resolver: Arc<dyn AddressResolver>,
    /// The current session socket, if connected.
    socket: Mutex<Option<TcpStream>>,
    out_tx: Sender<Envelope>,
    out_rx: Receiver<Envelope>,
    /// When bytes last arrived from the peer, for the liveness window.
    last_received: Mutex<Instant>,
    disposed: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Creates the connection for a peer slot and starts its threads. The
    /// active side begins dialing immediately; the passive side waits for
    /// [`Connection::accept_session`].
    pub(crate) fn spawn(
        peer: MemberId,
        local: MemberId,
        epoch: u64,
        resolver: Arc<dyn AddressResolver>,
        inbound: Arc<dyn Inbound>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = crossbeam::channel::bounded(OUTBOUND_QUEUE_SIZE);
        let connection = Arc::new(Self {
            peer,
            local,
            epoch,
            active: local > peer,
            resolver,
            socket: Mutex::new(None),
            out_tx,
            out_rx,
            last_received: Mutex::new(Instant::now()),
            disposed: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let writer = {
            let connection = connection.clone();
            std::thread::spawn(move || connection.run_writer())
        };
        connection.threads.lock().push(writer);

        if connection.active {
            let dialer = {
                let connection = connection.clone();
                std::thread::spawn(move || connection.run_dialer(inbound))
            };
            connection.threads.lock().push(dialer);
        }

        connection
    }

    /// The peer slot this connection serves.
    pub(crate) fn peer(&self) -> MemberId {
        self.peer
    }

    /// Whether this is the dialing side of the link.
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Enqueues an envelope for sending. Never blocks: when the queue is
    /// full or the peer is unreachable, the message is discarded and left to
    /// the protocol's retransmission timers.
    pub(crate) fn dispatch(&self, envelope: Envelope) {
        match self.out_tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("outbound queue to peer {} full, discarding message", self.peer);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Whether a session socket is currently installed.
    pub(crate) fn has_session(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Whether the connection is alive: a session exists and bytes arrived
    /// within the liveness window.
    pub(crate) fn is_alive(&self) -> bool {
        self.has_session() && self.last_received.lock().elapsed() < CONNECTION_ALIVE_WINDOW
    }

    /// Installs an accepted socket as the current session and spawns a
    /// reader for it. Passive side only; the dialer reads its own sessions.
    pub(crate) fn accept_session(self: &Arc<Self>, socket: TcpStream, inbound: Arc<dyn Inbound>) {
        debug_assert!(!self.active, "accepted a session on the dialing side");
        if self.is_disposed() {
            return;
        }
        let reader = match socket.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                error!("cloning accepted socket for peer {} failed: {err}", self.peer);
                return;
            }
        };
        self.install(socket);
        debug!("peer {} connected", self.peer);

        let connection = self.clone();
        let handle = std::thread::spawn(move || {
            match connection.read_session(reader, &inbound) {
                Ok(()) => debug!("peer {} disconnected", connection.peer),
                Err(err) => warn!("session with peer {} failed: {err}", connection.peer),
            }
            connection.close_session();
        });
        self.threads.lock().push(handle);
    }

    /// Closes the current session, if any. Shutting the socket down
    /// terminates a reader blocked on it; the slot is then free for a redial
    /// or a fresh accept.
    pub(crate) fn close_session(&self) {
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Stops the connection: closes the session and joins every thread.
    /// Must not be called while holding the node lock, since readers may be
    /// blocked on it. Idempotent.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.close_session();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Makes the given socket the current session, shutting down any
    /// previous one.
    fn install(&self, socket: TcpStream) {
        let _ = socket.set_nodelay(true);
        *self.last_received.lock() = Instant::now();
        if let Some(old) = self.socket.lock().replace(socket) {
            let _ = old.shutdown(Shutdown::Both);
        }
    }

    /// Dials the peer and performs the handshake.
    fn dial(&self) -> Result<TcpStream> {
        let address = self.resolver.resolve()?;
        let mut socket = TcpStream::connect_timeout(&address.to_socket_addr()?, CONNECT_TIMEOUT)?;
        // The first bytes on a fresh socket identify the dialer, so the
        // acceptor can route the connection to the right peer slot.
        socket.write_all(&self.local.to_le_bytes())?;
        Ok(socket)
    }

    /// Dials the peer until the node is disposed, reading each established
    /// session until it fails, with a short backoff between attempts.
    fn run_dialer(&self, inbound: Arc<dyn Inbound>) {
        while !self.is_disposed() {
            match self.dial().and_then(|socket| Ok((socket.try_clone()?, socket))) {
                Ok((reader, socket)) => {
                    self.install(socket);
                    debug!("connected to peer {}", self.peer);
                    match self.read_session(reader, &inbound) {
                        Ok(()) => debug!("peer {} disconnected", self.peer),
                        Err(err) => warn!("session with peer {} failed: {err}", self.peer),
                    }
                    self.close_session();
                }
                Err(err) => debug!("connecting to peer {} failed: {err}", self.peer),
            }
            if !self.is_disposed() {
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }

    /// Reads envelopes from a session socket and hands them to the node, in
    /// arrival order, until the session ends.
    fn read_session(&self, socket: TcpStream, inbound: &Arc<dyn Inbound>) -> Result<()> {
        let mut reader = std::io::BufReader::new(socket);
        while !self.is_disposed() {
            match encoding::maybe_deserialize_from::<_, Envelope>(&mut reader)? {
                Some(envelope) => {
                    *self.last_received.lock() = Instant::now();
                    inbound.receive(self.peer, self.epoch, envelope)?;
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Drains the outbound queue onto the session socket.
    fn run_writer(&self) {
        while !self.is_disposed() {
            match self.out_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(envelope) => self.write(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Serializes and writes one envelope. The whole message is written with
    /// a single call so concurrent teardown never interleaves mid-message.
    fn write(&self, envelope: Envelope) {
        // Clone the handle under the lock, write outside it: a slow write
        // must not hold up session teardown.
        let Some(socket) = self.socket.lock().as_ref().and_then(|s| s.try_clone().ok()) else {
            debug!("no session with peer {}, discarding message", self.peer);
            return;
        };
        let bytes = match encoding::serialize(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("encoding message for peer {} failed: {err}", self.peer);
                return;
            }
        };
        if let Err(err) = (&socket).write_all(&bytes) {
            warn!("writing to peer {} failed: {err}", self.peer);
            self.close_session();
        }
    }
}
