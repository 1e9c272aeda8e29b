//! Request/reply sockets over mio TCP streams.
//!
//! [`ReqSocket`] is the driver end: it strictly alternates send and receive
//! and never waits longer than asked. [`RepSocket`] is the service end: it
//! accepts any number of peers and routes each reply back to the peer that
//! sent the request. Both carry payloads in the frames of
//! [`crate::protocol::frame`].

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use minstant::Instant;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use super::ServiceAddress;
use crate::protocol::frame::{FrameDecoder, FrameError, encode_frame};
use crate::trace::{debug, trace, warn};

/// Token for the single stream of a [`ReqSocket`] and the listener of a [`RepSocket`].
const PRIMARY: Token = Token(0);

/// Bytes read per `read` call.
const READ_CHUNK: usize = 4096;

/// Upper bound on how long a reply may take to drain into the kernel.
const REPLY_FLUSH_WAIT: Duration = Duration::from_secs(1);

/// Delay between connect attempts while the peer refuses connections.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Socket-level failure.
#[derive(Debug, Error)]
pub enum SocketError {
    /// `send` called while the previous request is still unanswered.
    #[error("previous request has not been answered yet")]
    ReplyPending,
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Disconnected,
    /// The byte stream violated the framing rules.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    /// Underlying I/O failure (including a refused connect).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One accepted peer of a [`RepSocket`].
struct Conn {
    stream: TcpStream,
    outbound: Vec<u8>,
    decoder: FrameDecoder,
    closed: bool,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outbound: Vec::new(),
            decoder: FrameDecoder::new(),
            closed: false,
        }
    }

    fn flush(&mut self) -> Result<(), SocketError> {
        write_queued(&mut self.stream, &mut self.outbound)
    }

    /// End-of-stream only marks the connection closed so frames already
    /// buffered can still be delivered.
    fn fill(&mut self) -> Result<(), SocketError> {
        if !self.closed {
            self.closed = read_available(&mut self.stream, &mut self.decoder)?;
        }
        Ok(())
    }
}

/// Writes queued bytes until the kernel buffer is full.
fn write_queued(stream: &mut TcpStream, outbound: &mut Vec<u8>) -> Result<(), SocketError> {
    while !outbound.is_empty() {
        match stream.write(outbound.as_slice()) {
            Ok(0) => return Err(SocketError::Disconnected),
            Ok(n) => {
                outbound.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads everything available into `decoder`. Returns whether the peer
/// closed its end.
fn read_available(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Result<bool, SocketError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Waits on `poll` for at most `timeout`, treating `EINTR` as a wake-up.
fn poll_once(poll: &mut Poll, events: &mut Events, timeout: Duration) -> io::Result<()> {
    match poll.poll(events, Some(timeout)) {
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
        other => other,
    }
}

/// The requesting end of a request/reply channel.
///
/// Connecting is non-blocking: bytes sent before the TCP handshake finishes
/// are queued and written once the stream becomes writable. Until the first
/// connect succeeds, a refused or reset attempt is retried every
/// [`RECONNECT_INTERVAL`] with the queued request kept, so a service that
/// comes up while the caller is waiting is still reached. Once connected, a
/// failure surfaces as a [`SocketError`] from the next call.
pub struct ReqSocket {
    poll: Poll,
    events: Events,
    /// `None` while waiting to retry a failed connect.
    stream: Option<TcpStream>,
    outbound: Vec<u8>,
    decoder: FrameDecoder,
    closed: bool,
    peer: ServiceAddress,
    connected: bool,
    retry_at: Option<Instant>,
    awaiting_reply: bool,
}

impl ReqSocket {
    /// Starts connecting to `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or registered.
    pub fn connect(peer: ServiceAddress) -> Result<Self, SocketError> {
        let mut socket = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(8),
            stream: None,
            outbound: Vec::new(),
            decoder: FrameDecoder::new(),
            closed: false,
            peer,
            connected: false,
            retry_at: None,
            awaiting_reply: false,
        };
        socket.open()?;
        debug!(peer = %peer, "request socket connecting");
        Ok(socket)
    }

    /// Whether the TCP connection has been established.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a request has been sent and its reply not yet received.
    #[must_use]
    pub const fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Queues one request and writes as much of it as the stream accepts.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::ReplyPending`] if the previous request is still
    /// unanswered, or any transport error detected while writing.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        if self.awaiting_reply {
            return Err(SocketError::ReplyPending);
        }
        encode_frame(payload, &mut self.outbound)?;
        self.awaiting_reply = true;
        trace!(peer = %self.peer, len = payload.len(), "request queued");
        self.pump()
    }

    /// Returns the next reply if one arrives within `wait`.
    ///
    /// A zero `wait` performs a single non-blocking check.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the established connection failed or the
    /// peer closed it without a pending reply.
    pub fn try_recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SocketError> {
        let deadline = Instant::now() + wait;
        loop {
            self.pump()?;
            if let Some(frame) = self.decoder.next_frame()? {
                self.awaiting_reply = false;
                return Ok(Some(frame));
            }
            if self.closed {
                return Err(SocketError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = self.retry_at.map_or(deadline, |retry| retry.min(deadline));
            poll_once(&mut self.poll, &mut self.events, wake.saturating_duration_since(now))?;
        }
    }

    /// Advances the connection: finishes the connect, writes, then reads.
    fn pump(&mut self) -> Result<(), SocketError> {
        if !self.connected && !self.finish_connect()? {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        write_queued(stream, &mut self.outbound)?;
        if !self.closed {
            self.closed = read_available(stream, &mut self.decoder)?;
        }
        Ok(())
    }

    fn finish_connect(&mut self) -> Result<bool, SocketError> {
        if let Some(retry) = self.retry_at {
            if Instant::now() < retry {
                return Ok(false);
            }
            self.retry_at = None;
            trace!(peer = %self.peer, "request socket reconnecting");
            self.open()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };

        let failure = match stream.take_error()? {
            Some(err) => err,
            None => match stream.peer_addr() {
                Ok(_) => {
                    debug!(peer = %self.peer, "request socket connected");
                    self.connected = true;
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::NotConnected => return Ok(false),
                Err(e) => e,
            },
        };
        if is_retryable(&failure) {
            self.schedule_retry(&failure);
            return Ok(false);
        }
        Err(failure.into())
    }

    /// Starts a connect attempt. A refusal reported straight away is retried
    /// like one reported later.
    fn open(&mut self) -> Result<(), SocketError> {
        match open_stream(&self.poll, self.peer) {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(SocketError::Io(e)) if is_retryable(&e) => {
                self.schedule_retry(&e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn schedule_retry(&mut self, _cause: &io::Error) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        self.retry_at = Some(Instant::now() + RECONNECT_INTERVAL);
        debug!(peer = %self.peer, error = %_cause, "connect failed, retrying");
    }
}

/// Opens a non-blocking connection to `peer` and registers it on `poll`.
fn open_stream(poll: &Poll, peer: ServiceAddress) -> Result<TcpStream, SocketError> {
    let mut stream = TcpStream::connect(peer.into())?;
    poll.registry().register(
        &mut stream,
        PRIMARY,
        Interest::READABLE | Interest::WRITABLE,
    )?;
    Ok(stream)
}

/// Connect failures worth another attempt: the peer may not be listening yet.
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
    )
}

/// Identifies the peer a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(usize);

/// A request received by a [`RepSocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Peer to reply to.
    pub peer: PeerId,
    /// Request payload.
    pub payload: Vec<u8>,
}

/// The replying end of a request/reply channel.
pub struct RepSocket {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local: ServiceAddress,
    peers: BTreeMap<PeerId, Conn>,
    next_peer: usize,
}

impl RepSocket {
    /// Binds a listener on `addr`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g. already in use).
    pub fn bind(addr: ServiceAddress) -> Result<Self, SocketError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr.into())?;
        poll.registry()
            .register(&mut listener, PRIMARY, Interest::READABLE)?;
        let local = ServiceAddress::from(listener.local_addr()?);
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            listener,
            local,
            peers: BTreeMap::new(),
            next_peer: 1,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_address(&self) -> ServiceAddress {
        self.local
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Returns the next request if one arrives within `wait`.
    ///
    /// Peers that disconnect or violate the framing are dropped silently.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener or poller itself fails.
    pub fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Incoming>, SocketError> {
        let deadline = Instant::now() + wait;
        loop {
            self.accept_pending()?;
            if let Some(incoming) = self.next_request() {
                return Ok(Some(incoming));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            poll_once(&mut self.poll, &mut self.events, deadline.duration_since(now))?;
        }
    }

    /// Sends `payload` back to `peer`, waiting briefly for it to drain.
    ///
    /// Replying to a peer that has gone away is not an error.
    ///
    /// # Errors
    ///
    /// Returns a transport error if writing to the peer fails; the peer is
    /// dropped in that case.
    pub fn reply(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), SocketError> {
        let Some(conn) = self.peers.get_mut(&peer) else {
            debug!(peer = ?peer, "reply dropped, peer is gone");
            return Ok(());
        };
        encode_frame(payload, &mut conn.outbound)?;

        let deadline = Instant::now() + REPLY_FLUSH_WAIT;
        loop {
            let Some(conn) = self.peers.get_mut(&peer) else {
                return Ok(());
            };
            if let Err(e) = conn.flush() {
                self.drop_peer(peer);
                return Err(e);
            }
            if conn.outbound.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(peer = ?peer, "reply not drained in time, dropping peer");
                self.drop_peer(peer);
                return Err(io::Error::from(ErrorKind::TimedOut).into());
            }
            poll_once(&mut self.poll, &mut self.events, deadline.duration_since(now))?;
        }
    }

    fn accept_pending(&mut self) -> Result<(), SocketError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _from)) => {
                    let id = PeerId(self.next_peer);
                    self.next_peer += 1;
                    self.poll.registry().register(
                        &mut stream,
                        Token(id.0),
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    debug!(peer = ?id, from = %_from, "accepted peer");
                    self.peers.insert(id, Conn::new(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pops the first complete request across peers, pruning dead ones.
    fn next_request(&mut self) -> Option<Incoming> {
        let mut dead = Vec::new();
        let mut found = None;
        for (&id, conn) in &mut self.peers {
            let step = conn
                .flush()
                .and_then(|()| conn.fill())
                .and_then(|()| conn.decoder.next_frame().map_err(SocketError::from));
            match step {
                Ok(Some(payload)) => {
                    found = Some(Incoming { peer: id, payload });
                    break;
                }
                Ok(None) if conn.closed => dead.push(id),
                Ok(None) => {}
                Err(_e) => {
                    debug!(peer = ?id, error = %_e, "dropping peer");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.drop_peer(id);
        }
        found
    }

    fn drop_peer(&mut self, id: PeerId) {
        if let Some(mut conn) = self.peers.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            trace!(peer = ?id, "peer removed");
        }
    }
}
