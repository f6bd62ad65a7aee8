//! Broker core
//!
//! One thread, one loop. Each iteration:
//! 1. poll the router (listeners, peers, internal pool sockets, waker) for at
//!    most the time left until the next heartbeat
//! 2. decode everything that arrived; client requests are parked on their
//!    client, worker messages drive the worker state machine
//! 3. take one parked request per client, queue it on its service and dispatch
//! 4. once the heartbeat deadline passes: purge expired workers and clients,
//!    heartbeat every idle worker
//! 5. flush outbound buffers
//!
//! Worker lifecycle:
//!
//! ```text
//!   (absent) --READY--> Idle --REQUEST sent--> Busy --REPLY--> Idle
//!   READY while known, READY for mmi.*, REQUEST from a worker --> deleted + DISCONNECT
//!   DISCONNECT, connection lost, expiry --> deleted silently
//! ```

use crate::broker::config::BrokerConfig;
use crate::broker::protocol::{ClientMessage, Frame, Message, WorkerCommand, WorkerMessage};
use crate::broker::registry::{BrokerStats, Enqueued, Registry};
use crate::broker::transport::{Endpoint, Router, RouterEvent, Stream, Waker};
use crate::broker::worker_pool::{InternalPool, RequestHandler};
use crate::error::BrokerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prefix reserved for broker management services
pub const MMI_PREFIX: &str = "mmi.";

/// Service lookup: replies "200" if the named service exists, else "400"
pub const MMI_SERVICE: &str = "mmi.service";

/// Loop-back service
pub const MMI_ECHO: &str = "mmi.echo";

/// Bound endpoints as a comma separated list
pub const MMI_DNS: &str = "mmi.dns";

/// Reply codes
const CODE_OK: &[u8] = b"200";
const CODE_NOT_FOUND: &[u8] = b"400";
const CODE_UNKNOWN_SERVICE: &[u8] = b"501";
const CODE_QUEUE_FULL: &[u8] = b"503";

/// Stops a running broker from another thread
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    running: Arc<AtomicBool>,
    waker: Waker,
}

impl BrokerHandle {
    /// Ask the loop to exit; wakes it if it is blocked in poll
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Majordomo broker
pub struct Broker {
    // Must drop before `registry`: pool threads exit once their sockets close
    router: Router,
    registry: Registry,
    config: BrokerConfig,
    running: Arc<AtomicBool>,
    waker: Waker,
    heartbeat_at: Instant,
}

impl Broker {
    /// Create a broker with no endpoints and no services
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let (router, waker) = Router::new()?;

        Ok(Self {
            router,
            registry: Registry::from_config(&config),
            heartbeat_at: Instant::now() + config.heartbeat_interval,
            config,
            running: Arc::new(AtomicBool::new(true)),
            waker,
        })
    }

    /// Bind a listener; returns the resolved endpoint (real port for port 0)
    pub fn bind(&mut self, endpoint: &str) -> Result<Endpoint, BrokerError> {
        let endpoint: Endpoint = endpoint.parse()?;
        let bound = self.router.bind(&endpoint)?;
        tracing::info!(endpoint = %bound, "broker listening");
        Ok(bound)
    }

    /// Bind every endpoint from the configuration
    pub fn bind_configured(&mut self) -> Result<Vec<Endpoint>, BrokerError> {
        let endpoints = self.config.endpoints.clone();
        endpoints.iter().map(|endpoint| self.bind(endpoint)).collect()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.router.endpoints()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            running: Arc::clone(&self.running),
            waker: self.waker.clone(),
        }
    }

    /// Register the built-in `mmi.echo` service
    ///
    /// `mmi.service` and `mmi.dns` are answered by the broker itself.
    pub fn register_default_services(&mut self) -> Result<(), BrokerError> {
        let echo: RequestHandler =
            Arc::new(|request: &ClientMessage| -> anyhow::Result<Vec<Frame>> { Ok(request.payload.clone()) });
        // One thread keeps replies in request order per connection
        self.register_internal(MMI_ECHO, 1, echo)
    }

    /// Register an in-process service with `threads` handler threads
    ///
    /// `threads == 0` uses the configured default.
    pub fn register_service<F>(&mut self, name: &str, threads: usize, handler: F) -> Result<(), BrokerError>
    where
        F: Fn(&ClientMessage) -> anyhow::Result<Vec<Frame>> + Send + Sync + 'static,
    {
        if name.starts_with(MMI_PREFIX) {
            return Err(BrokerError::ReservedServiceName(name.to_string()));
        }
        let threads = if threads == 0 { self.config.internal_threads } else { threads };
        self.register_internal(name, threads, Arc::new(handler))
    }

    fn register_internal(&mut self, name: &str, threads: usize, handler: RequestHandler) -> Result<(), BrokerError> {
        if self.registry.has_service(name) {
            return Err(BrokerError::DuplicateService(name.to_string()));
        }

        let mut addresses = Vec::with_capacity(threads);
        let mut streams = Vec::with_capacity(threads);
        for _ in 0..threads.max(1) {
            let (broker_end, pool_end) = Stream::pair()?;
            addresses.push(self.router.attach(broker_end, true)?);
            streams.push(pool_end);
        }

        let pool = match InternalPool::spawn(name, handler, streams) {
            Ok(pool) => pool,
            Err(e) => {
                for address in &addresses {
                    self.router.disconnect(address);
                }
                return Err(e.into());
            }
        };
        let size = pool.size();
        self.registry.add_internal_service(name, pool, addresses)?;

        tracing::info!(service = name, threads = size, "registered internal service");
        Ok(())
    }

    /// Run until stopped, then shut down
    pub fn run(&mut self) -> Result<(), BrokerError> {
        tracing::info!(
            endpoints = ?self.endpoints().iter().map(ToString::to_string).collect::<Vec<_>>(),
            roles = ?self.registry.roles().roles(),
            "broker started"
        );

        let result = (|| -> Result<(), BrokerError> {
            while self.running.load(Ordering::SeqCst) {
                self.run_once()?;
            }
            Ok(())
        })();

        if let Err(ref e) = result {
            tracing::error!(error = %e, "broker loop failed");
        }
        self.shutdown();

        result
    }

    /// One loop iteration
    pub fn run_once(&mut self) -> Result<(), BrokerError> {
        let timeout = if self.registry.has_pending_client_messages() {
            Duration::ZERO
        } else {
            self.heartbeat_at.saturating_duration_since(Instant::now())
        };

        for event in self.router.poll(timeout)? {
            self.handle_event(event);
        }

        self.process_clients();

        if Instant::now() >= self.heartbeat_at {
            self.maintenance();
        }

        for event in self.router.flush() {
            self.handle_event(event);
        }
        Ok(())
    }

    pub fn stats(&self) -> BrokerStats {
        self.registry.stats()
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Message { frames, .. } => self.handle_message(frames),
            RouterEvent::Closed { routing_id, internal } => {
                if internal {
                    tracing::warn!(peer = ?routing_id, "internal worker socket closed");
                }
                if let Some(worker) = self.registry.delete_worker(&routing_id) {
                    tracing::info!(worker = ?worker.address, service = ?worker.service, "worker connection lost");
                }
                self.registry.remove_client(&routing_id);
            }
        }
    }

    fn handle_message(&mut self, frames: Vec<Frame>) {
        match Message::decode(frames, true) {
            Message::Client(request) => self.registry.offer_client(request, Instant::now()),
            Message::Worker(message) => self.handle_worker_message(message),
            Message::Unknown(reason) => {
                tracing::debug!(%reason, "dropping malformed message");
            }
        }
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        let Some(address) = message.sender_id else {
            return;
        };
        let known = self.registry.contains_worker(&address);
        let now = Instant::now();
        tracing::trace!(worker = ?address, command = message.command.name(), known, "worker message");

        match message.command {
            WorkerCommand::Ready { service_name } => {
                if known {
                    tracing::warn!(worker = ?address, "duplicate READY, disconnecting worker");
                    self.delete_worker(&address, true);
                } else if service_name.starts_with(MMI_PREFIX) {
                    tracing::warn!(worker = ?address, service = %service_name, "READY for reserved service, disconnecting worker");
                    self.delete_worker(&address, true);
                } else {
                    tracing::info!(worker = ?address, service = %service_name, "worker ready");
                    self.registry.attach_worker(&address, &service_name);
                    self.worker_waiting(&address, now);
                }
            }
            WorkerCommand::Reply { client_id, payload } => {
                if !known {
                    self.delete_worker(&address, true);
                    return;
                }
                let service_name = self
                    .registry
                    .worker(&address)
                    .and_then(|worker| worker.service.clone())
                    .unwrap_or_default();
                let reply = ClientMessage {
                    sender_id: Some(client_id),
                    service_name,
                    payload,
                };
                self.router.send(&reply.encode());
                self.worker_waiting(&address, now);
            }
            WorkerCommand::Heartbeat => {
                if !self.registry.refresh_worker(&address, now) {
                    self.delete_worker(&address, true);
                }
            }
            WorkerCommand::Disconnect => {
                tracing::info!(worker = ?address, "worker disconnected");
                self.delete_worker(&address, false);
            }
            WorkerCommand::Request { .. } => {
                tracing::warn!(worker = ?address, "worker sent REQUEST, disconnecting worker");
                self.delete_worker(&address, true);
            }
        }
    }

    /// Forget a worker, optionally telling it to go away; safe to repeat
    fn delete_worker(&mut self, address: &[u8], notify: bool) {
        if notify {
            let disconnect = WorkerMessage::new(WorkerCommand::Disconnect).with_sender(address.to_vec());
            self.router.send(&disconnect.encode());
        }
        self.registry.delete_worker(address);
    }

    /// Put a worker back on the idle stacks and serve its service
    fn worker_waiting(&mut self, address: &[u8], now: Instant) {
        if let Some(service) = self.registry.worker_waiting(address, now) {
            self.dispatch(&service);
        }
    }

    /// Hand pending requests to idle workers (or to the pool, for internal services)
    fn dispatch(&mut self, service: &str) {
        if self.registry.service(service).is_some_and(|s| s.is_internal()) {
            self.registry.forward_internal(service);
            return;
        }

        while let Some((worker, request)) = self.registry.next_dispatch(service) {
            let client_id = request.sender_id.unwrap_or_default();
            tracing::debug!(service, worker = ?worker, client = ?client_id, "dispatching request");
            let message = WorkerMessage::new(WorkerCommand::Request {
                client_id,
                payload: request.payload,
            })
            .with_sender(worker);
            self.router.send(&message.encode());
        }
    }

    /// Classify one parked request per client
    fn process_clients(&mut self) {
        for request in self.registry.next_client_messages() {
            self.process_request(request);
        }
    }

    fn process_request(&mut self, request: ClientMessage) {
        if request.service_name == MMI_SERVICE || request.service_name == MMI_DNS {
            self.handle_mmi(request);
            return;
        }

        let service = request.service_name.clone();
        match self.registry.enqueue_request(request) {
            Enqueued::Queued => self.dispatch(&service),
            Enqueued::UnknownService(request) => {
                tracing::debug!(service = %service, "request for unknown service");
                self.reply_to_client(request, vec![CODE_UNKNOWN_SERVICE.to_vec()]);
            }
            Enqueued::QueueFull(request) => {
                tracing::warn!(service = %service, "service queue full, rejecting request");
                self.reply_to_client(request, vec![CODE_QUEUE_FULL.to_vec()]);
            }
        }
    }

    fn handle_mmi(&mut self, request: ClientMessage) {
        let payload = if request.service_name == MMI_DNS {
            let endpoints: Vec<String> = self.endpoints().iter().map(ToString::to_string).collect();
            endpoints.join(",").into_bytes()
        } else {
            let queried = request
                .payload
                .first()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_default();
            let known = self.registry.has_service(&queried) || queried == MMI_SERVICE || queried == MMI_DNS;
            let code = if known { CODE_OK } else { CODE_NOT_FOUND };
            code.to_vec()
        };
        self.reply_to_client(request, vec![payload]);
    }

    fn reply_to_client(&mut self, request: ClientMessage, payload: Vec<Frame>) {
        let reply = ClientMessage {
            sender_id: request.sender_id,
            service_name: request.service_name,
            payload,
        };
        if reply.sender_id.is_some() {
            self.router.send(&reply.encode());
        }
    }

    /// Purge the dead and heartbeat the idle
    fn maintenance(&mut self) {
        let now = Instant::now();

        for worker in self.registry.purge_workers(now) {
            tracing::warn!(worker = ?worker.address, service = ?worker.service, "worker expired");
        }
        let purged = self.registry.purge_clients(now);
        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "purged idle clients");
        }

        for address in self.registry.idle_workers() {
            let heartbeat = WorkerMessage::new(WorkerCommand::Heartbeat).with_sender(address.clone());
            self.router.send(&heartbeat.encode());
        }

        self.heartbeat_at = now + self.config.heartbeat_interval;
    }

    /// Tell external workers to leave, then stop the internal pools
    fn shutdown(&mut self) {
        tracing::info!(stats = ?self.stats(), "broker shutting down");

        for address in self.registry.external_workers() {
            let disconnect = WorkerMessage::new(WorkerCommand::Disconnect).with_sender(address);
            self.router.send(&disconnect.encode());
        }
        self.router.flush();

        // Closing the pool sockets first unblocks threads stuck writing replies
        self.router.disconnect_all();
        self.registry.shutdown_pools();
    }
}
