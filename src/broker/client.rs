//! Client APIs
//!
//! - `SyncClient`: one request at a time; waits for the reply, reconnecting
//!   and resending on timeout until the retry budget is spent
//! - `AsyncClient`: fire-and-forget `send`, caller-driven `recv`; no retries
//!   and no request tracking

use crate::broker::protocol::{ClientMessage, Frame, Message};
use crate::broker::transport::{encode_frames, write_frames, Endpoint, FrameReader, Stream};
use crate::error::ClientError;
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Default time to wait for a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of resends after the first attempt
pub const DEFAULT_RETRIES: usize = 3;

fn connect(endpoint: &Endpoint) -> Result<Stream, ClientError> {
    endpoint.connect().map_err(|source| ClientError::ConnectionFailed {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// Blocking request/reply client with retries
#[derive(Debug)]
pub struct SyncClient {
    endpoint: Endpoint,
    stream: Option<Stream>,
    reader: FrameReader,
    timeout: Duration,
    retries: usize,
}

impl SyncClient {
    /// Connect to a broker endpoint
    pub fn connect(endpoint: &str) -> Result<Self, ClientError> {
        let endpoint: Endpoint = endpoint.parse()?;
        let stream = connect(&endpoint)?;

        Ok(Self {
            endpoint,
            stream: Some(stream),
            reader: FrameReader::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        })
    }

    /// Per-attempt reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resends after the first attempt
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Send a request and wait for its reply
    ///
    /// Returns `Ok(None)` once every attempt has timed out.
    pub fn request(
        &mut self,
        service: &str,
        payload: Vec<Frame>,
    ) -> Result<Option<ClientMessage>, ClientError> {
        let frames = ClientMessage::new(service, payload).encode();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tracing::debug!(service, attempt, "no reply, reconnecting");
                self.reconnect();
            } else if self.stream.is_none() {
                tracing::debug!(service, "connection lost earlier, reconnecting");
                self.reconnect();
            }

            let Some(stream) = self.stream.as_mut() else {
                // Broker unreachable; give it one timeout before the next attempt
                thread::sleep(self.timeout);
                continue;
            };

            if let Err(e) = write_frames(stream, &frames) {
                tracing::debug!(service, error = %e, "send failed");
                self.stream = None;
                continue;
            }

            if let Some(reply) = self.await_reply(service)? {
                return Ok(Some(reply));
            }
        }

        tracing::warn!(service, retries = self.retries, "request abandoned");
        Ok(None)
    }

    /// Wait up to the timeout for a reply from `service`
    fn await_reply(&mut self, service: &str) -> Result<Option<ClientMessage>, ClientError> {
        let deadline = Instant::now() + self.timeout;

        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };

            match self.reader.read_message(stream, Some(remaining)) {
                Ok(Some(frames)) => match Message::decode(frames, false) {
                    Message::Client(reply) if reply.service_name == service => return Ok(Some(reply)),
                    other => {
                        tracing::debug!(service, message = ?other, "discarding unexpected message");
                    }
                },
                Ok(None) => return Ok(None),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                    ) =>
                {
                    self.stream = None;
                    return Ok(None);
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
        Ok(None)
    }

    /// Replace the socket (and so the routing identity) with a fresh one
    fn reconnect(&mut self) {
        if let Some(old) = self.stream.take() {
            let _ = old.shutdown();
        }
        self.reader = FrameReader::new();

        match connect(&self.endpoint) {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => tracing::debug!(error = %e, "reconnect failed"),
        }
    }
}

/// Fire-and-forget client; replies are collected with `recv`
#[derive(Debug)]
pub struct AsyncClient {
    stream: Stream,
    reader: FrameReader,
    encode_buffer: Vec<u8>,
}

impl AsyncClient {
    /// Connect to a broker endpoint
    pub fn connect(endpoint: &str) -> Result<Self, ClientError> {
        let endpoint: Endpoint = endpoint.parse()?;
        let stream = connect(&endpoint)?;

        Ok(Self {
            stream,
            reader: FrameReader::new(),
            encode_buffer: Vec::new(),
        })
    }

    /// Send a request; true when it was handed to the transport
    pub fn send(&mut self, service: &str, payload: Vec<Frame>) -> bool {
        let frames = ClientMessage::new(service, payload).encode();

        self.encode_buffer.clear();
        if let Err(e) = encode_frames(&frames, &mut self.encode_buffer) {
            tracing::debug!(service, error = %e, "request not encodable");
            return false;
        }

        match self.stream.write_all(&self.encode_buffer) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(service, error = %e, "send failed");
                false
            }
        }
    }

    /// Next reply, waiting at most `timeout`
    pub fn recv(&mut self, timeout: Duration) -> Option<ClientMessage> {
        let deadline = Instant::now() + timeout;

        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.reader.read_message(&mut self.stream, Some(remaining)) {
                Ok(Some(frames)) => match Message::decode(frames, false) {
                    Message::Client(reply) => return Some(reply),
                    other => tracing::debug!(message = ?other, "discarding unexpected message"),
                },
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!(error = %e, "receive failed");
                    return None;
                }
            }
        }
        None
    }
}
