//! Shared helpers: a broker running on a background thread

#![allow(dead_code)]

use majordomo::broker::transport::{write_frames, FrameReader, Stream};
use majordomo::broker::{Broker, BrokerConfig, BrokerHandle, Frame, Message, WorkerCommand, WorkerMessage};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct TestBroker {
    pub endpoint: String,
    handle: BrokerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestBroker {
    /// Default services on an ephemeral TCP port
    pub fn start() -> Self {
        Self::start_with(test_config(), |_| {})
    }

    /// Custom config; `setup` runs before the loop starts
    pub fn start_with<F: FnOnce(&mut Broker)>(config: BrokerConfig, setup: F) -> Self {
        let mut broker = Broker::new(config).expect("valid config");
        let endpoint = broker.bind("tcp://127.0.0.1:0").expect("bind").to_string();
        broker.register_default_services().expect("default services");
        setup(&mut broker);

        let handle = broker.handle();
        let thread = thread::spawn(move || {
            broker.run().expect("broker loop");
        });

        Self {
            endpoint,
            handle,
            thread: Some(thread),
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        heartbeat_interval: Duration::from_millis(250),
        heartbeat_liveness: 3,
        internal_threads: 2,
        ..BrokerConfig::default()
    }
}

/// Hand-driven worker connection speaking raw MDPW01
pub struct RawWorker {
    stream: Stream,
    reader: FrameReader,
}

impl RawWorker {
    pub fn connect(endpoint: &str) -> Self {
        let endpoint: majordomo::broker::Endpoint = endpoint.parse().unwrap();
        Self {
            stream: endpoint.connect().unwrap(),
            reader: FrameReader::new(),
        }
    }

    pub fn send(&mut self, command: WorkerCommand) {
        write_frames(&mut self.stream, &WorkerMessage::new(command).encode()).unwrap();
    }

    pub fn ready(&mut self, service: &str) {
        self.send(WorkerCommand::Ready {
            service_name: service.to_string(),
        });
    }

    /// Next command from the broker other than HEARTBEAT
    pub fn next_command(&mut self, timeout: Duration) -> Option<WorkerCommand> {
        let deadline = Instant::now() + timeout;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let frames = match self.reader.read_message(&mut self.stream, Some(remaining)) {
                Ok(Some(frames)) => frames,
                Ok(None) | Err(_) => return None,
            };
            match Message::decode(frames, false) {
                Message::Worker(WorkerMessage {
                    command: WorkerCommand::Heartbeat,
                    ..
                }) => continue,
                Message::Worker(message) => return Some(message.command),
                other => panic!("unexpected message for worker: {:?}", other),
            }
        }
        None
    }

    /// Wait for a REQUEST; returns (client id, payload)
    pub fn next_request(&mut self) -> (Frame, Vec<Frame>) {
        match self.next_command(Duration::from_secs(5)) {
            Some(WorkerCommand::Request { client_id, payload }) => (client_id, payload),
            other => panic!("expected REQUEST, got {:?}", other),
        }
    }

    pub fn reply(&mut self, client_id: Frame, payload: Vec<Frame>) {
        self.send(WorkerCommand::Reply { client_id, payload });
    }
}
