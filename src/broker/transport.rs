//! Stream transport for the broker
//!
//! Emulates ROUTER/DEALER sockets on top of TCP and Unix domain streams:
//! - `Endpoint`: `tcp://host:port` / `ipc:///path` addresses
//! - frame encoding: every frame is `[flags u8][length u32 BE][bytes]`,
//!   flag `0x01` meaning another frame of the same message follows
//! - `Router`: the broker side; owns listeners and accepted connections,
//!   tags everything it receives with a routing id and routes everything it
//!   sends by the leading routing id frame
//! - `FrameReader` / `write_frames`: the blocking peer side (clients, workers)

use crate::broker::protocol::Frame;
use crate::error::BrokerError;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum frame size (64MB to prevent memory exhaustion)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum total payload of one multi-frame message
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Maximum frames in one message
pub const MAX_MESSAGE_FRAMES: usize = 1024;

/// Frame flag: more frames of this message follow
const FLAG_MORE: u8 = 0x01;

/// Flag byte + 4 length bytes
const HEADER_LEN: usize = 5;

/// Read buffer size per syscall
const READ_CHUNK: usize = 64 * 1024;

/// Reads per connection per poll, so one busy peer cannot starve the rest
const MAX_READS_PER_POLL: usize = 16;

/// Written outbound bytes kept around before compacting the buffer
const OUTBOUND_COMPACT_THRESHOLD: usize = 1024 * 1024;

// =============================================================================
// Endpoints
// =============================================================================

/// Transport address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `tcp://host:port` (`*` binds all interfaces, port 0 is ephemeral)
    Tcp(String),
    /// `ipc:///path/to/socket`
    Ipc(PathBuf),
}

impl FromStr for Endpoint {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::InvalidEndpoint(s.to_string());

        if let Some(address) = s.strip_prefix("tcp://") {
            let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            let host = if host == "*" { "0.0.0.0" } else { host };
            Ok(Endpoint::Tcp(format!("{}:{}", host, port)))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid());
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(address) => write!(f, "tcp://{}", address),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl Endpoint {
    /// Bind a non-blocking listener
    pub fn bind(&self) -> io::Result<Listener> {
        match self {
            Endpoint::Tcp(address) => {
                let listener = TcpListener::bind(address.as_str())?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Ipc(path) => {
                // Remove stale socket if it exists
                if path.exists() {
                    fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Ipc(listener, path.clone()))
            }
        }
    }

    /// Open a blocking connection
    pub fn connect(&self) -> io::Result<Stream> {
        match self {
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str())?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Endpoint::Ipc(path) => Ok(Stream::Ipc(UnixStream::connect(path)?)),
        }
    }
}

/// Bound listener
pub enum Listener {
    Tcp(TcpListener),
    Ipc(UnixListener, PathBuf),
}

impl Listener {
    /// The endpoint actually bound (resolves ephemeral TCP ports)
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Listener::Ipc(_, path) => Ok(Endpoint::Ipc(path.clone())),
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _addr) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Listener::Ipc(listener, _) => {
                let (stream, _addr) = listener.accept()?;
                Ok(Stream::Ipc(stream))
            }
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Ipc(listener, _) => listener.as_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Ipc(_, path) = self {
            let _ = fs::remove_file(path.as_path());
        }
    }
}

/// Connected stream
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Ipc(UnixStream),
}

impl Stream {
    /// Connected pair of in-process streams
    pub fn pair() -> io::Result<(Stream, Stream)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Stream::Ipc(a), Stream::Ipc(b)))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Stream::Ipc(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            Stream::Ipc(stream) => stream.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Stream::Ipc(stream) => stream.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Ipc(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Ipc(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            Stream::Ipc(stream) => stream.flush(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(stream) => stream.as_fd(),
            Stream::Ipc(stream) => stream.as_fd(),
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Append the wire encoding of one message to `out`
pub fn encode_frames(frames: &[Frame], out: &mut Vec<u8>) -> io::Result<()> {
    let last = frames.len().saturating_sub(1);
    for (index, frame) in frames.iter().enumerate() {
        let len = u32::try_from(frame.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Frame too large: {} bytes", frame.len()),
                )
            })?;
        out.push(if index < last { FLAG_MORE } else { 0 });
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(frame);
    }
    Ok(())
}

/// Write one message to a blocking stream
pub fn write_frames<W: Write>(writer: &mut W, frames: &[Frame]) -> io::Result<()> {
    let mut buffer = Vec::new();
    encode_frames(frames, &mut buffer)?;
    writer.write_all(&buffer)?;
    writer.flush()
}

/// Incremental decoder turning a byte stream back into messages
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    start: usize,
    pending: Vec<Frame>,
    pending_bytes: usize,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder rejecting messages whose frames total more than `max` bytes
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            buffer: Vec::new(),
            start: 0,
            pending: Vec::new(),
            pending_bytes: 0,
            max_message_size: max,
        }
    }

    /// Feed received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message, if one has been fully received
    pub fn next_message(&mut self) -> io::Result<Option<Vec<Frame>>> {
        loop {
            let available = &self.buffer[self.start..];
            if available.len() < HEADER_LEN {
                self.compact();
                return Ok(None);
            }

            let flags = available[0];
            let len = u32::from_be_bytes([available[1], available[2], available[3], available[4]]);
            if len > MAX_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Frame too large: {} bytes", len),
                ));
            }

            if self.pending.len() >= MAX_MESSAGE_FRAMES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Message exceeds {} frames", MAX_MESSAGE_FRAMES),
                ));
            }
            if self.pending_bytes + len as usize > self.max_message_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Message too large: over {} bytes", self.max_message_size),
                ));
            }

            let total = HEADER_LEN + len as usize;
            if available.len() < total {
                self.compact();
                return Ok(None);
            }

            self.pending.push(available[HEADER_LEN..total].to_vec());
            self.pending_bytes += len as usize;
            self.start += total;

            if flags & FLAG_MORE == 0 {
                self.pending_bytes = 0;
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Blocking message reader with deadline support
///
/// Keeps partial frames across timeouts, so a timed out read never
/// desynchronises the stream.
#[derive(Debug)]
pub struct FrameReader {
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Read the next message, waiting at most `timeout` (`None` waits forever)
    ///
    /// Returns `Ok(None)` on timeout and `UnexpectedEof` when the peer closed.
    pub fn read_message(
        &mut self,
        stream: &mut Stream,
        timeout: Option<Duration>,
    ) -> io::Result<Option<Vec<Frame>>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    stream.set_read_timeout(Some(deadline - now))?;
                }
                None => stream.set_read_timeout(None)?,
            }

            match stream.read(&mut self.chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => self.decoder.extend(&self.chunk[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Wakes a router blocked in `poll`
#[derive(Debug, Clone)]
pub struct Waker(Arc<UnixStream>);

impl Waker {
    pub fn wake(&self) {
        // A full buffer already guarantees a pending wake-up
        let _ = (&*self.0).write(&[1]);
    }
}

/// What the router observed during a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A complete message; the first frame is the sender's routing id
    Message { internal: bool, frames: Vec<Frame> },
    /// A peer connection went away
    Closed { routing_id: Frame, internal: bool },
}

struct Connection {
    stream: Stream,
    decoder: FrameDecoder,
    outbound: Vec<u8>,
    written: usize,
    internal: bool,
}

impl Connection {
    fn new(stream: Stream, internal: bool) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            outbound: Vec::new(),
            written: 0,
            internal,
        }
    }

    /// Read what is available; returns false once the peer has closed
    fn read_ready(&mut self, chunk: &mut [u8], messages: &mut Vec<Vec<Frame>>) -> io::Result<bool> {
        let mut open = true;
        for _ in 0..MAX_READS_PER_POLL {
            match self.stream.read(chunk) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        while let Some(message) = self.decoder.next_message()? {
            messages.push(message);
        }
        Ok(open)
    }

    fn wants_write(&self) -> bool {
        self.written < self.outbound.len()
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed")),
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if self.written == self.outbound.len() {
            self.outbound.clear();
            self.written = 0;
        } else if self.written > OUTBOUND_COMPACT_THRESHOLD {
            self.outbound.drain(..self.written);
            self.written = 0;
        }
        Ok(())
    }
}

/// Broker-side socket set: listeners, accepted peers and the waker
pub struct Router {
    listeners: Vec<Listener>,
    connections: HashMap<Frame, Connection>,
    next_id: u32,
    waker: UnixStream,
    chunk: Vec<u8>,
}

impl Router {
    /// Create an empty router and the waker that interrupts its polls
    pub fn new() -> io::Result<(Self, Waker)> {
        let (receiver, sender) = UnixStream::pair()?;
        receiver.set_nonblocking(true)?;
        sender.set_nonblocking(true)?;

        let router = Self {
            listeners: Vec::new(),
            connections: HashMap::new(),
            next_id: 0,
            waker: receiver,
            chunk: vec![0u8; READ_CHUNK],
        };
        Ok((router, Waker(Arc::new(sender))))
    }

    /// Bind an additional listener; returns the resolved endpoint
    pub fn bind(&mut self, endpoint: &Endpoint) -> io::Result<Endpoint> {
        let listener = endpoint.bind()?;
        let bound = listener.local_endpoint()?;
        self.listeners.push(listener);
        Ok(bound)
    }

    /// Endpoints of all bound listeners
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_endpoint().ok())
            .collect()
    }

    /// Adopt an already connected stream (e.g. one end of an in-process pair)
    pub fn attach(&mut self, stream: Stream, internal: bool) -> io::Result<Frame> {
        stream.set_nonblocking(true)?;
        let id = self.next_routing_id();
        self.connections.insert(id.clone(), Connection::new(stream, internal));
        Ok(id)
    }

    /// Number of live peer connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a message; the first frame names the destination peer
    ///
    /// Messages for unknown peers are dropped, as a ROUTER socket does.
    pub fn send(&mut self, frames: &[Frame]) -> bool {
        let Some((routing_id, message)) = frames.split_first() else {
            return false;
        };
        if message.is_empty() {
            return false;
        }

        match self.connections.get_mut(routing_id) {
            Some(connection) => match encode_frames(message, &mut connection.outbound) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping unencodable message");
                    false
                }
            },
            None => {
                tracing::debug!(peer = ?routing_id, "dropping message for unknown peer");
                false
            }
        }
    }

    /// Wait up to `timeout` for activity and collect what arrived
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<RouterEvent>, BrokerError> {
        let ids: Vec<Frame> = self.connections.keys().cloned().collect();
        let listener_count = self.listeners.len();

        let ready: Vec<PollFlags> = {
            let mut fds = Vec::with_capacity(1 + listener_count + ids.len());
            fds.push(PollFd::new(self.waker.as_fd(), PollFlags::POLLIN));
            for listener in &self.listeners {
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            }
            for id in &ids {
                if let Some(connection) = self.connections.get(id) {
                    let mut flags = PollFlags::POLLIN;
                    if connection.wants_write() {
                        flags |= PollFlags::POLLOUT;
                    }
                    fds.push(PollFd::new(connection.stream.as_fd(), flags));
                }
            }

            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
                Ok(_) => {}
                Err(e) => return Err(BrokerError::Poll(e)),
            }

            fds.iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect()
        };

        if ready[0].contains(PollFlags::POLLIN) {
            self.drain_waker();
        }

        for index in 0..listener_count {
            if ready[1 + index].contains(PollFlags::POLLIN) {
                self.accept_pending(index);
            }
        }

        let mut events = Vec::new();
        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;

        for (id, flags) in ids.into_iter().zip(ready[1 + listener_count..].iter()) {
            if flags.is_empty() {
                continue;
            }
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };

            let mut open = true;
            if flags.intersects(readable) {
                let mut messages = Vec::new();
                match connection.read_ready(&mut self.chunk, &mut messages) {
                    Ok(still_open) => open = still_open,
                    Err(e) => {
                        tracing::debug!(peer = ?id, error = %e, "read failed, closing connection");
                        open = false;
                    }
                }
                for frames in messages {
                    let mut routed = Vec::with_capacity(frames.len() + 1);
                    routed.push(id.clone());
                    routed.extend(frames);
                    events.push(RouterEvent::Message {
                        internal: connection.internal,
                        frames: routed,
                    });
                }
            }

            if open && flags.contains(PollFlags::POLLOUT) {
                if let Err(e) = connection.flush() {
                    tracing::debug!(peer = ?id, error = %e, "write failed, closing connection");
                    open = false;
                }
            }

            if !open {
                if let Some(connection) = self.connections.remove(&id) {
                    events.push(RouterEvent::Closed {
                        routing_id: id,
                        internal: connection.internal,
                    });
                }
            }
        }

        Ok(events)
    }

    /// Push queued output to every peer; returns peers lost while writing
    pub fn flush(&mut self) -> Vec<RouterEvent> {
        let mut failed = Vec::new();
        for (id, connection) in self.connections.iter_mut() {
            if connection.wants_write() {
                if let Err(e) = connection.flush() {
                    tracing::debug!(peer = ?id, error = %e, "write failed, closing connection");
                    failed.push(id.clone());
                }
            }
        }

        failed
            .into_iter()
            .filter_map(|id| {
                self.connections.remove(&id).map(|connection| RouterEvent::Closed {
                    routing_id: id,
                    internal: connection.internal,
                })
            })
            .collect()
    }

    /// Drop a peer connection
    pub fn disconnect(&mut self, routing_id: &[u8]) {
        if let Some(connection) = self.connections.remove(routing_id) {
            let _ = connection.stream.shutdown();
        }
    }

    /// Drop every peer connection, keeping the listeners
    pub fn disconnect_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            let _ = connection.stream.shutdown();
        }
    }

    fn next_routing_id(&mut self) -> Frame {
        self.next_id = self.next_id.wrapping_add(1);
        let mut id = Vec::with_capacity(5);
        id.push(0);
        id.extend_from_slice(&self.next_id.to_be_bytes());
        id
    }

    fn accept_pending(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok(stream) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::debug!(error = %e, "failed to configure accepted connection");
                        continue;
                    }
                    let id = self.next_routing_id();
                    tracing::debug!(peer = ?id, "accepted connection");
                    self.connections.insert(id, Connection::new(stream, false));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "error accepting connection");
                    break;
                }
            }
        }
    }

    fn drain_waker(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.waker.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX))
}
