//! Worker, service and client registries
//!
//! All state is owned by the broker thread; nothing here is shared or locked.
//!
//! Idle workers are kept twice: in a global list (for heartbeating) and in
//! their service's list (for dispatch). Both are LIFO stacks and every
//! mutation updates both, so a worker is idle in both or in neither.

use crate::broker::config::BrokerConfig;
use crate::broker::protocol::{ClientMessage, Frame, Protocol};
use crate::broker::rbac::{PriorityQueues, RbacRoleSet};
use crate::broker::worker_pool::InternalPool;
use crate::error::BrokerError;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A worker known to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// Routing id of the worker's connection
    pub address: Frame,
    /// Service the worker announced with READY
    pub service: Option<String>,
    /// Deadline for the next sign of life
    pub expiry: Instant,
    /// Pool thread inside the broker process
    pub internal: bool,
}

impl Worker {
    fn new(address: Frame, expiry: Instant, internal: bool) -> Self {
        Self {
            address,
            service: None,
            expiry,
            internal,
        }
    }

    /// True once the expiry deadline has strictly passed
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.internal && now > self.expiry
    }
}

/// A named service with its pending requests and idle workers
#[derive(Debug)]
pub struct Service {
    pub name: String,
    internal: Option<InternalPool>,
    requests: PriorityQueues<ClientMessage>,
    waiting: Vec<Frame>,
}

impl Service {
    fn new(name: &str, ranks: usize) -> Self {
        Self {
            name: name.to_string(),
            internal: None,
            requests: PriorityQueues::new(ranks),
            waiting: Vec::new(),
        }
    }

    /// Served by an in-process pool
    pub fn is_internal(&self) -> bool {
        self.internal.is_some()
    }

    /// Requests not yet handed to a worker
    pub fn pending(&self) -> usize {
        self.requests.len() + self.internal.as_ref().map_or(0, InternalPool::queued)
    }

    /// Idle workers of this service
    pub fn idle_count(&self) -> usize {
        self.waiting.len()
    }

    /// Pending requests for one RBAC rank (`None` = default queue)
    pub fn pending_for_rank(&self, rank: Option<usize>) -> usize {
        self.requests.len_of(rank)
    }
}

/// A peer that has sent client requests
#[derive(Debug)]
pub struct Client {
    pub identity: Frame,
    pub protocol: Protocol,
    requests: VecDeque<ClientMessage>,
    expiry: Instant,
}

impl Client {
    fn new(identity: Frame, protocol: Protocol, expiry: Instant) -> Self {
        Self {
            identity,
            protocol,
            requests: VecDeque::new(),
            expiry,
        }
    }

    /// Queue a request and push the expiry out to `expiry`
    pub fn offer(&mut self, request: ClientMessage, expiry: Instant) {
        self.requests.push_back(request);
        self.expiry = expiry;
    }

    /// Requests received but not yet classified
    pub fn queued(&self) -> usize {
        self.requests.len()
    }
}

/// Result of queueing a client request on its service
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Accepted into the service's priority queues
    Queued,
    /// No such service
    UnknownService(ClientMessage),
    /// Service already holds its maximum of pending requests
    QueueFull(ClientMessage),
}

/// Counters for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub services: usize,
    pub workers: usize,
    pub idle_workers: usize,
    pub clients: usize,
    pub pending_requests: usize,
}

/// Broker-owned registries
#[derive(Debug)]
pub struct Registry {
    roles: RbacRoleSet,
    services: HashMap<String, Service>,
    workers: HashMap<Frame, Worker>,
    waiting: Vec<Frame>,
    clients: HashMap<Frame, Client>,
    ready_clients: VecDeque<Frame>,
    worker_expiry: Duration,
    client_timeout: Option<Duration>,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(
        roles: RbacRoleSet,
        worker_expiry: Duration,
        client_timeout: Option<Duration>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            roles,
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: Vec::new(),
            clients: HashMap::new(),
            ready_clients: VecDeque::new(),
            worker_expiry,
            client_timeout,
            queue_capacity,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.role_set(),
            config.worker_expiry(),
            config.client_expiry(),
            config.service_queue_capacity,
        )
    }

    pub fn roles(&self) -> &RbacRoleSet {
        &self.roles
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Get or create a service
    pub fn require_service(&mut self, name: &str) -> &mut Service {
        let ranks = self.roles.len();
        self.services
            .entry(name.to_string())
            .or_insert_with(|| Service::new(name, ranks))
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Register a service served by an in-process pool
    ///
    /// `addresses` are the router ids of the pool threads' sockets.
    pub fn add_internal_service(
        &mut self,
        name: &str,
        pool: InternalPool,
        addresses: Vec<Frame>,
    ) -> Result<(), BrokerError> {
        if self.services.contains_key(name) {
            return Err(BrokerError::DuplicateService(name.to_string()));
        }

        let now = Instant::now();
        for address in addresses {
            let mut worker = Worker::new(address.clone(), now, true);
            worker.service = Some(name.to_string());
            self.workers.insert(address, worker);
        }

        self.require_service(name).internal = Some(pool);
        Ok(())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Get or create an external worker
    pub fn require_worker(&mut self, address: &[u8]) -> &mut Worker {
        let expiry = Instant::now() + self.worker_expiry;
        self.workers
            .entry(address.to_vec())
            .or_insert_with(|| Worker::new(address.to_vec(), expiry, false))
    }

    pub fn worker(&self, address: &[u8]) -> Option<&Worker> {
        self.workers.get(address)
    }

    pub fn contains_worker(&self, address: &[u8]) -> bool {
        self.workers.contains_key(address)
    }

    /// Create the worker and bind it to a service (creating the service too)
    pub fn attach_worker(&mut self, address: &[u8], service: &str) {
        self.require_worker(address).service = Some(service.to_string());
        self.require_service(service);
    }

    /// Forget a worker; deleting an unknown worker is a no-op
    pub fn delete_worker(&mut self, address: &[u8]) -> Option<Worker> {
        let worker = self.workers.remove(address)?;

        self.waiting.retain(|idle| idle.as_slice() != address);
        if let Some(service) = worker.service.as_deref().and_then(|name| self.services.get_mut(name)) {
            service.waiting.retain(|idle| idle.as_slice() != address);
        }

        Some(worker)
    }

    /// Mark a worker idle; returns the service that should now be dispatched
    ///
    /// The worker goes on top of both idle stacks. Internal workers are
    /// never idled; for them this only refreshes the expiry.
    pub fn worker_waiting(&mut self, address: &[u8], now: Instant) -> Option<String> {
        let expiry = now + self.worker_expiry;
        let worker = self.workers.get_mut(address)?;
        worker.expiry = expiry;

        if worker.internal {
            return None;
        }

        let name = worker.service.clone()?;
        let service = self.services.get_mut(&name)?;

        if !service.waiting.iter().any(|idle| idle.as_slice() == address) {
            service.waiting.push(address.to_vec());
            self.waiting.push(address.to_vec());
        }
        Some(name)
    }

    /// Push a worker's expiry out; false for unknown workers
    pub fn refresh_worker(&mut self, address: &[u8], now: Instant) -> bool {
        let expiry = now + self.worker_expiry;
        match self.workers.get_mut(address) {
            Some(worker) => {
                worker.expiry = expiry;
                true
            }
            None => false,
        }
    }

    /// Idle external workers, oldest first
    pub fn idle_workers(&self) -> &[Frame] {
        &self.waiting
    }

    /// Remove every expired external worker
    pub fn purge_workers(&mut self, now: Instant) -> Vec<Worker> {
        let expired: Vec<Frame> = self
            .workers
            .values()
            .filter(|worker| worker.is_expired(now))
            .map(|worker| worker.address.clone())
            .collect();

        expired
            .iter()
            .filter_map(|address| self.delete_worker(address))
            .collect()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Queue a client request on its service, ranked by its RBAC token
    pub fn enqueue_request(&mut self, request: ClientMessage) -> Enqueued {
        let rank = self.roles.rank_of_token(request.rbac_token());
        let capacity = self.queue_capacity;

        let Some(service) = self.services.get_mut(&request.service_name) else {
            return Enqueued::UnknownService(request);
        };
        if capacity > 0 && service.pending() >= capacity {
            return Enqueued::QueueFull(request);
        }

        service.requests.push(rank, request);
        Enqueued::Queued
    }

    /// Pop the next request together with the most recently idle worker
    ///
    /// Returns `None`, touching nothing, unless the service has both.
    pub fn next_dispatch(&mut self, name: &str) -> Option<(Frame, ClientMessage)> {
        let service = self.services.get_mut(name)?;
        if service.is_internal() || service.waiting.is_empty() || service.requests.is_empty() {
            return None;
        }

        let request = service.requests.pop_next()?;
        let worker = service.waiting.pop()?;
        if let Some(position) = self.waiting.iter().rposition(|idle| *idle == worker) {
            self.waiting.remove(position);
        }
        Some((worker, request))
    }

    /// Move every pending request of an internal service onto its pool channel
    pub fn forward_internal(&mut self, name: &str) -> usize {
        let Some(service) = self.services.get_mut(name) else {
            return 0;
        };
        let Some(pool) = service.internal.as_ref() else {
            return 0;
        };

        let mut forwarded = 0;
        while let Some(request) = service.requests.pop_next() {
            if !pool.submit(request) {
                tracing::warn!(service = %name, "internal pool is shut down, dropping request");
                continue;
            }
            forwarded += 1;
        }
        forwarded
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Record a request from a client (creating the client on first contact)
    pub fn offer_client(&mut self, request: ClientMessage, now: Instant) {
        let identity = request.sender_id.clone().unwrap_or_default();
        let expiry = now + self.client_timeout.unwrap_or(Duration::ZERO);

        let client = self
            .clients
            .entry(identity.clone())
            .or_insert_with(|| Client::new(identity.clone(), Protocol::Client, expiry));

        if client.requests.is_empty() {
            self.ready_clients.push_back(identity);
        }
        client.offer(request, expiry);
    }

    /// Take at most one queued request from every client with work, in turn
    pub fn next_client_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::with_capacity(self.ready_clients.len());

        for _ in 0..self.ready_clients.len() {
            let Some(identity) = self.ready_clients.pop_front() else {
                break;
            };
            let Some(client) = self.clients.get_mut(&identity) else {
                continue;
            };
            if let Some(request) = client.requests.pop_front() {
                messages.push(request);
            }
            if !client.requests.is_empty() {
                self.ready_clients.push_back(identity);
            }
        }

        messages
    }

    pub fn has_pending_client_messages(&self) -> bool {
        !self.ready_clients.is_empty()
    }

    pub fn client(&self, identity: &[u8]) -> Option<&Client> {
        self.clients.get(identity)
    }

    /// Forget a client (e.g. its connection closed)
    pub fn remove_client(&mut self, identity: &[u8]) -> Option<Client> {
        let client = self.clients.remove(identity)?;
        self.ready_clients.retain(|ready| ready.as_slice() != identity);
        Some(client)
    }

    /// Drop clients idle past the client timeout; no-op when it is disabled
    pub fn purge_clients(&mut self, now: Instant) -> Vec<Client> {
        if self.client_timeout.is_none() {
            return Vec::new();
        }

        let expired: Vec<Frame> = self
            .clients
            .values()
            .filter(|client| now > client.expiry)
            .map(|client| client.identity.clone())
            .collect();

        expired
            .iter()
            .filter_map(|identity| self.remove_client(identity))
            .collect()
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// External workers, for the shutdown DISCONNECT round
    pub fn external_workers(&self) -> Vec<Frame> {
        self.workers
            .values()
            .filter(|worker| !worker.internal)
            .map(|worker| worker.address.clone())
            .collect()
    }

    /// Stop every internal pool, waiting for in-flight handlers
    pub fn shutdown_pools(&mut self) {
        for service in self.services.values_mut() {
            if let Some(mut pool) = service.internal.take() {
                pool.shutdown();
            }
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            services: self.services.len(),
            workers: self.workers.len(),
            idle_workers: self.waiting.len(),
            clients: self.clients.len(),
            pending_requests: self.services.values().map(Service::pending).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_millis(7500);

    fn registry() -> Registry {
        Registry::new(RbacRoleSet::new(["ADMIN", "USER"]), EXPIRY, None, 0)
    }

    fn request(client: &[u8], service: &str, token: Option<&str>) -> ClientMessage {
        let mut payload = vec![b"body".to_vec()];
        if let Some(token) = token {
            payload.push(token.as_bytes().to_vec());
        }
        ClientMessage::new(service, payload).with_sender(client.to_vec())
    }

    fn idle_worker(registry: &mut Registry, address: &[u8], service: &str, now: Instant) {
        registry.attach_worker(address, service);
        assert_eq!(registry.worker_waiting(address, now), Some(service.to_string()));
    }

    fn assert_lists_consistent(registry: &Registry) {
        for address in registry.idle_workers() {
            let worker = registry.worker(address).expect("idle worker is registered");
            let service = registry.service(worker.service.as_deref().unwrap()).unwrap();
            assert!(service.waiting.contains(address));
        }
        for service in registry.services.values() {
            for address in &service.waiting {
                assert!(registry.idle_workers().contains(address));
            }
        }
    }

    #[test]
    fn test_require_is_idempotent() {
        let mut registry = registry();
        registry.require_service("echo");
        registry.require_service("echo");
        registry.require_worker(b"w1");
        registry.require_worker(b"w1");

        let stats = registry.stats();
        assert_eq!(stats.services, 1);
        assert_eq!(stats.workers, 1);
        assert_eq!(registry.worker(b"w1").unwrap().service, None);
    }

    #[test]
    fn test_dispatch_pops_one_request_and_most_recent_worker() {
        let mut registry = registry();
        let now = Instant::now();
        idle_worker(&mut registry, b"w1", "echo", now);
        idle_worker(&mut registry, b"w2", "echo", now);
        idle_worker(&mut registry, b"w3", "echo", now);

        assert_eq!(registry.enqueue_request(request(b"c1", "echo", None)), Enqueued::Queued);
        assert_eq!(registry.enqueue_request(request(b"c2", "echo", None)), Enqueued::Queued);

        let before = registry.stats();
        let (worker, dispatched) = registry.next_dispatch("echo").unwrap();
        let after = registry.stats();

        assert_eq!(worker, b"w3".to_vec());
        assert_eq!(dispatched.sender_id, Some(b"c1".to_vec()));
        assert_eq!(after.idle_workers, before.idle_workers - 1);
        assert_eq!(after.pending_requests, before.pending_requests - 1);
        assert_eq!(registry.service("echo").unwrap().idle_count(), 2);
        assert_lists_consistent(&registry);
    }

    #[test]
    fn test_dispatch_requires_both_sides() {
        let mut registry = registry();
        let now = Instant::now();

        registry.require_service("echo");
        registry.enqueue_request(request(b"c1", "echo", None));
        assert!(registry.next_dispatch("echo").is_none());
        assert_eq!(registry.stats().pending_requests, 1);

        idle_worker(&mut registry, b"w1", "echo", now);
        let (worker, _) = registry.next_dispatch("echo").unwrap();
        assert_eq!(worker, b"w1".to_vec());

        idle_worker(&mut registry, b"w1", "echo", now);
        assert!(registry.next_dispatch("echo").is_none());
        assert_eq!(registry.stats().idle_workers, 1);
        assert!(registry.next_dispatch("missing").is_none());
    }

    #[test]
    fn test_waiting_twice_does_not_duplicate() {
        let mut registry = registry();
        let now = Instant::now();
        idle_worker(&mut registry, b"w1", "echo", now);
        idle_worker(&mut registry, b"w1", "echo", now);

        assert_eq!(registry.idle_workers().len(), 1);
        assert_eq!(registry.service("echo").unwrap().idle_count(), 1);
    }

    #[test]
    fn test_delete_worker_twice_is_safe() {
        let mut registry = registry();
        let now = Instant::now();
        idle_worker(&mut registry, b"w1", "echo", now);
        idle_worker(&mut registry, b"w2", "echo", now);

        assert!(registry.delete_worker(b"w1").is_some());
        assert!(registry.delete_worker(b"w1").is_none());

        assert!(!registry.idle_workers().contains(&b"w1".to_vec()));
        assert!(!registry.service("echo").unwrap().waiting.contains(&b"w1".to_vec()));
        assert_eq!(registry.stats().workers, 1);
        assert_lists_consistent(&registry);
    }

    #[test]
    fn test_expiry_boundary() {
        let mut registry = registry();
        let heartbeat = Instant::now();
        idle_worker(&mut registry, b"w1", "echo", heartbeat);

        let deadline = heartbeat + EXPIRY;
        assert!(!registry.worker(b"w1").unwrap().is_expired(deadline));
        assert!(registry.purge_workers(deadline).is_empty());

        let later = deadline + Duration::from_millis(1);
        assert!(registry.worker(b"w1").unwrap().is_expired(later));
        let purged = registry.purge_workers(later);
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].address, b"w1".to_vec());
        assert!(registry.idle_workers().is_empty());
    }

    #[test]
    fn test_heartbeat_postpones_purge() {
        let mut registry = registry();
        let start = Instant::now();
        idle_worker(&mut registry, b"w1", "echo", start);

        let heartbeat = start + Duration::from_secs(5);
        assert!(registry.refresh_worker(b"w1", heartbeat));
        assert!(registry.purge_workers(start + EXPIRY + Duration::from_secs(1)).is_empty());
        assert!(!registry.refresh_worker(b"ghost", heartbeat));
    }

    #[test]
    fn test_requests_dispatched_by_rank() {
        let mut registry = registry();
        let now = Instant::now();
        registry.require_service("svc");

        registry.enqueue_request(request(b"anon", "svc", None));
        registry.enqueue_request(request(b"user", "svc", Some("RBAC=USER,sig")));
        registry.enqueue_request(request(b"admin", "svc", Some("RBAC=ADMIN,sig")));

        let service = registry.service("svc").unwrap();
        assert_eq!(service.pending_for_rank(Some(0)), 1);
        assert_eq!(service.pending_for_rank(None), 1);

        let mut order = Vec::new();
        for _ in 0..3 {
            idle_worker(&mut registry, b"w", "svc", now);
            let (_, request) = registry.next_dispatch("svc").unwrap();
            order.push(request.sender_id.unwrap());
        }
        assert_eq!(order, vec![b"admin".to_vec(), b"user".to_vec(), b"anon".to_vec()]);
    }

    #[test]
    fn test_unknown_service_and_capacity() {
        let mut registry = Registry::new(RbacRoleSet::default(), EXPIRY, None, 1);
        assert!(matches!(
            registry.enqueue_request(request(b"c", "nope", None)),
            Enqueued::UnknownService(_)
        ));

        registry.require_service("svc");
        assert_eq!(registry.enqueue_request(request(b"c", "svc", None)), Enqueued::Queued);
        assert!(matches!(
            registry.enqueue_request(request(b"c", "svc", None)),
            Enqueued::QueueFull(_)
        ));
    }

    #[test]
    fn test_clients_drained_round_robin() {
        let mut registry = registry();
        let now = Instant::now();
        for i in 0..3 {
            registry.offer_client(request(b"a", &format!("a{}", i), None), now);
        }
        registry.offer_client(request(b"b", "b0", None), now);

        assert_eq!(registry.client(b"a").map(Client::queued), Some(3));

        let first: Vec<String> = registry.next_client_messages().into_iter().map(|m| m.service_name).collect();
        assert_eq!(first, vec!["a0", "b0"]);
        assert_eq!(registry.client(b"a").map(Client::queued), Some(2));
        assert_eq!(registry.client(b"b").map(Client::queued), Some(0));
        let second: Vec<String> = registry.next_client_messages().into_iter().map(|m| m.service_name).collect();
        assert_eq!(second, vec!["a1"]);
        assert!(registry.has_pending_client_messages());
        registry.next_client_messages();
        assert!(!registry.has_pending_client_messages());
        assert_eq!(registry.stats().clients, 2);
    }

    #[test]
    fn test_client_purge() {
        let timeout = Duration::from_secs(10);
        let mut bounded = Registry::new(RbacRoleSet::default(), EXPIRY, Some(timeout), 0);
        let now = Instant::now();
        bounded.offer_client(request(b"c", "svc", None), now);

        assert!(bounded.purge_clients(now + timeout).is_empty());
        assert_eq!(bounded.purge_clients(now + timeout + Duration::from_secs(1)).len(), 1);
        assert!(!bounded.has_pending_client_messages());

        // Disabled timeout never purges
        let mut registry = registry();
        registry.offer_client(request(b"c", "svc", None), now);
        assert!(registry.purge_clients(now + Duration::from_secs(86_400)).is_empty());
    }
}
