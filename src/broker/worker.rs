//! External worker API
//!
//! Connects to a broker, announces a service with READY and then alternates
//! between `receive` and `reply`. While waiting it heartbeats the broker every
//! interval; if the broker stays silent for `liveness` intervals, closes the
//! connection or sends DISCONNECT, the worker reconnects and announces itself
//! again.

use crate::broker::protocol::{Frame, Message, WorkerCommand, WorkerMessage};
use crate::broker::transport::{write_frames, Endpoint, FrameReader, Stream};
use crate::error::ClientError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Default heartbeat interval, matching the broker default
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Default missed heartbeats before reconnecting
pub const DEFAULT_LIVENESS: u32 = 3;

/// Default pause before reconnecting
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// A request handed to this worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Routing id of the requesting client; pass it back to `reply`
    pub client: Frame,
    pub payload: Vec<Frame>,
}

/// Worker connected to a broker, serving one service
#[derive(Debug)]
pub struct MdpWorker {
    endpoint: Endpoint,
    service: String,
    stream: Option<Stream>,
    reader: FrameReader,
    heartbeat_interval: Duration,
    liveness: u32,
    reconnect_delay: Duration,
    heartbeat_at: Instant,
    last_seen: Instant,
}

impl MdpWorker {
    /// Connect and send READY for `service`
    pub fn connect(endpoint: &str, service: &str) -> Result<Self, ClientError> {
        let now = Instant::now();
        let mut worker = Self {
            endpoint: endpoint.parse()?,
            service: service.to_string(),
            stream: None,
            reader: FrameReader::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness: DEFAULT_LIVENESS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_at: now,
            last_seen: now,
        };
        worker.reconnect()?;
        Ok(worker)
    }

    /// Heartbeat interval and tolerated silent intervals
    pub fn with_heartbeat(mut self, interval: Duration, liveness: u32) -> Self {
        self.heartbeat_interval = interval;
        self.liveness = liveness.max(1);
        self.heartbeat_at = Instant::now() + interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wait for the next request; `None` when `timeout` elapses first
    ///
    /// Heartbeats and reconnects happen inside this call.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<WorkerRequest>, ClientError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(None);
            }

            if self.stream.is_none() || now.duration_since(self.last_seen) > self.silence_limit() {
                tracing::warn!(service = %self.service, "broker unreachable, reconnecting");
                thread::sleep(self.reconnect_delay);
                if let Err(e) = self.reconnect() {
                    tracing::debug!(error = %e, "reconnect failed");
                }
                continue;
            }

            if now >= self.heartbeat_at {
                self.send(WorkerCommand::Heartbeat);
                self.heartbeat_at = now + self.heartbeat_interval;
            }

            let mut wait = self.heartbeat_at.saturating_duration_since(now);
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            let frames = match self.reader.read_message(stream, Some(wait)) {
                Ok(Some(frames)) => frames,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "lost broker connection");
                    self.stream = None;
                    continue;
                }
            };

            self.last_seen = Instant::now();
            match Message::decode(frames, false) {
                Message::Worker(WorkerMessage {
                    command: WorkerCommand::Request { client_id, payload },
                    ..
                }) => {
                    return Ok(Some(WorkerRequest {
                        client: client_id,
                        payload,
                    }))
                }
                Message::Worker(WorkerMessage {
                    command: WorkerCommand::Heartbeat,
                    ..
                }) => {}
                Message::Worker(WorkerMessage {
                    command: WorkerCommand::Disconnect,
                    ..
                }) => {
                    tracing::info!(service = %self.service, "broker sent DISCONNECT, reconnecting");
                    self.stream = None;
                }
                other => {
                    tracing::debug!(message = ?other, "ignoring unexpected message");
                }
            }
        }
    }

    /// Answer a request
    pub fn reply(&mut self, client: Frame, payload: Vec<Frame>) -> Result<(), ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::NotConnected);
        };

        let reply = WorkerMessage::new(WorkerCommand::Reply {
            client_id: client,
            payload,
        });
        if let Err(e) = write_frames(stream, &reply.encode()) {
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Serve requests with `handler` until `stop` is set
    ///
    /// Handler errors are sent back as an `"error: ..."` payload.
    pub fn run<F>(&mut self, mut handler: F, stop: &AtomicBool) -> Result<(), ClientError>
    where
        F: FnMut(&WorkerRequest) -> anyhow::Result<Vec<Frame>>,
    {
        while !stop.load(Ordering::SeqCst) {
            let Some(request) = self.receive(Some(self.heartbeat_interval))? else {
                continue;
            };

            let payload = match handler(&request) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(service = %self.service, error = %format!("{:#}", e), "handler failed");
                    vec![format!("error: {:#}", e).into_bytes()]
                }
            };

            if let Err(e) = self.reply(request.client, payload) {
                tracing::warn!(service = %self.service, error = %e, "reply lost");
            }
        }
        Ok(())
    }

    fn silence_limit(&self) -> Duration {
        self.heartbeat_interval * self.liveness
    }

    /// Open a fresh connection and announce the service
    fn reconnect(&mut self) -> Result<(), ClientError> {
        if let Some(old) = self.stream.take() {
            let _ = old.shutdown();
        }

        let mut stream = self.endpoint.connect().map_err(|source| ClientError::ConnectionFailed {
            endpoint: self.endpoint.to_string(),
            source,
        })?;
        let ready = WorkerMessage::new(WorkerCommand::Ready {
            service_name: self.service.clone(),
        });
        write_frames(&mut stream, &ready.encode())?;

        let now = Instant::now();
        self.stream = Some(stream);
        self.reader = FrameReader::new();
        self.last_seen = now;
        self.heartbeat_at = now + self.heartbeat_interval;
        tracing::debug!(service = %self.service, endpoint = %self.endpoint, "worker connected");
        Ok(())
    }

    fn send(&mut self, command: WorkerCommand) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = write_frames(stream, &WorkerMessage::new(command).encode()) {
                tracing::debug!(error = %e, "send to broker failed");
                self.stream = None;
            }
        }
    }
}

impl Drop for MdpWorker {
    fn drop(&mut self) {
        self.send(WorkerCommand::Disconnect);
    }
}
