//! Majordomo protocol implementation
//!
//! This module contains the two sub-protocols spoken through the broker:
//!
//! ## 1. Client Protocol (`MDPC01`)
//!
//! Used between clients and the broker. Requests and replies share one layout:
//!
//! ```text
//! ┌──────────────┬─────────┬──────────┬──────────────┬──────────────┐
//! │ [routing-id] │  empty  │ "MDPC01" │ service name │ payload ...  │
//! └──────────────┴─────────┴──────────┴──────────────┴──────────────┘
//! ```
//!
//! ## 2. Worker Protocol (`MDPW01`)
//!
//! Used between workers and the broker. The fourth frame is a one-byte command:
//!
//! ```text
//! ┌──────────────┬─────────┬──────────┬─────────┬─────────────────────────────┐
//! │ [routing-id] │  empty  │ "MDPW01" │ command │ command specific frames ... │
//! └──────────────┴─────────┴──────────┴─────────┴─────────────────────────────┘
//! ```
//!
//! - READY (0x01): `[service name]`
//! - REQUEST (0x02) / REPLY (0x03): `[client id][empty][payload ...]`
//! - HEARTBEAT (0x04) / DISCONNECT (0x05): nothing
//!
//! The routing id is only present on the broker side, where the router prepends
//! it to everything it receives and strips it from everything it sends.
//!
//! Decoding never fails: anything that does not parse becomes
//! [`Message::Unknown`], which the broker drops.

use thiserror::Error;

/// A single message frame
pub type Frame = Vec<u8>;

/// Client sub-protocol tag
pub const CLIENT_PROTOCOL: &[u8] = b"MDPC01";

/// Worker sub-protocol tag
pub const WORKER_PROTOCOL: &[u8] = b"MDPW01";

/// Protocol tags understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `MDPC01`
    Client,
    /// `MDPW01`
    Worker,
}

impl Protocol {
    /// Wire tag of this protocol
    pub fn tag(self) -> &'static [u8] {
        match self {
            Protocol::Client => CLIENT_PROTOCOL,
            Protocol::Worker => WORKER_PROTOCOL,
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            CLIENT_PROTOCOL => Some(Protocol::Client),
            WORKER_PROTOCOL => Some(Protocol::Worker),
            _ => None,
        }
    }
}

/// Worker command bytes
pub mod command {
    pub const READY: u8 = 0x01;
    pub const REQUEST: u8 = 0x02;
    pub const REPLY: u8 = 0x03;
    pub const HEARTBEAT: u8 = 0x04;
    pub const DISCONNECT: u8 = 0x05;
}

/// Why a raw message could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("too few frames ({0})")]
    TooFewFrames(usize),
    #[error("missing empty delimiter frame")]
    MissingDelimiter,
    #[error("unknown protocol tag {0:?}")]
    UnknownProtocol(Vec<u8>),
    #[error("unknown worker command {0:#04x}")]
    UnknownCommand(u8),
    #[error("service name is not valid UTF-8")]
    InvalidServiceName,
}

/// Decoded message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client request or reply
    Client(ClientMessage),
    /// Worker protocol message
    Worker(WorkerMessage),
    /// Anything the codec does not understand
    Unknown(Malformed),
}

/// Client sub-protocol message (request or reply)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// Routing id of the peer (broker side only)
    pub sender_id: Option<Frame>,
    /// Target (request) or originating (reply) service
    pub service_name: String,
    /// Payload frames
    pub payload: Vec<Frame>,
}

impl ClientMessage {
    /// Create a message without a routing id
    pub fn new(service_name: impl Into<String>, payload: Vec<Frame>) -> Self {
        Self {
            sender_id: None,
            service_name: service_name.into(),
            payload,
        }
    }

    /// Address this message to (or mark it as coming from) a routing id
    pub fn with_sender(mut self, sender_id: Frame) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    /// Authorization token: the last payload frame when two or more are present
    pub fn rbac_token(&self) -> Option<&[u8]> {
        if self.payload.len() >= 2 {
            self.payload.last().map(Vec::as_slice)
        } else {
            None
        }
    }

    /// Encode into frames (routing id first, when present)
    pub fn encode(&self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(4 + self.payload.len());
        if let Some(id) = &self.sender_id {
            frames.push(id.clone());
        }
        frames.push(Vec::new());
        frames.push(Protocol::Client.tag().to_vec());
        frames.push(self.service_name.as_bytes().to_vec());
        frames.extend(self.payload.iter().cloned());
        frames
    }
}

/// Worker command with its command-specific frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Worker offers to serve a service
    Ready { service_name: String },
    /// Broker hands a client request to a worker
    Request { client_id: Frame, payload: Vec<Frame> },
    /// Worker answers a request
    Reply { client_id: Frame, payload: Vec<Frame> },
    /// Liveness signal, either direction
    Heartbeat,
    /// Either side ends the relationship
    Disconnect,
}

impl WorkerCommand {
    /// Command byte on the wire
    pub fn byte(&self) -> u8 {
        match self {
            WorkerCommand::Ready { .. } => command::READY,
            WorkerCommand::Request { .. } => command::REQUEST,
            WorkerCommand::Reply { .. } => command::REPLY,
            WorkerCommand::Heartbeat => command::HEARTBEAT,
            WorkerCommand::Disconnect => command::DISCONNECT,
        }
    }

    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Ready { .. } => "READY",
            WorkerCommand::Request { .. } => "REQUEST",
            WorkerCommand::Reply { .. } => "REPLY",
            WorkerCommand::Heartbeat => "HEARTBEAT",
            WorkerCommand::Disconnect => "DISCONNECT",
        }
    }
}

/// Worker sub-protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    /// Routing id of the worker (broker side only)
    pub sender_id: Option<Frame>,
    pub command: WorkerCommand,
}

impl WorkerMessage {
    /// Create a message without a routing id
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            sender_id: None,
            command,
        }
    }

    /// Address this message to (or mark it as coming from) a routing id
    pub fn with_sender(mut self, sender_id: Frame) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    /// Service name carried by READY
    pub fn service_name(&self) -> Option<&str> {
        match &self.command {
            WorkerCommand::Ready { service_name } => Some(service_name),
            _ => None,
        }
    }

    /// Encode into frames (routing id first, when present)
    pub fn encode(&self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(8);
        if let Some(id) = &self.sender_id {
            frames.push(id.clone());
        }
        frames.push(Vec::new());
        frames.push(Protocol::Worker.tag().to_vec());
        frames.push(vec![self.command.byte()]);
        match &self.command {
            WorkerCommand::Ready { service_name } => {
                frames.push(service_name.as_bytes().to_vec());
            }
            WorkerCommand::Request { client_id, payload }
            | WorkerCommand::Reply { client_id, payload } => {
                frames.push(client_id.clone());
                frames.push(Vec::new());
                frames.extend(payload.iter().cloned());
            }
            WorkerCommand::Heartbeat | WorkerCommand::Disconnect => {}
        }
        frames
    }
}

impl Message {
    /// Decode raw frames
    ///
    /// `routed` says whether the first frame is a routing id (true for
    /// everything the broker's router receives).
    pub fn decode(mut frames: Vec<Frame>, routed: bool) -> Message {
        let sender_id = if routed {
            if frames.is_empty() {
                return Message::Unknown(Malformed::TooFewFrames(0));
            }
            Some(frames.remove(0))
        } else {
            None
        };

        // [empty][tag][service or command]
        if frames.len() < 3 {
            return Message::Unknown(Malformed::TooFewFrames(frames.len()));
        }
        if !frames[0].is_empty() {
            return Message::Unknown(Malformed::MissingDelimiter);
        }

        let mut rest = frames.into_iter().skip(1);
        let tag = rest.next().unwrap_or_default();

        match Protocol::from_tag(&tag) {
            Some(Protocol::Client) => {
                let service = rest.next().unwrap_or_default();
                let service_name = match String::from_utf8(service) {
                    Ok(name) => name,
                    Err(_) => return Message::Unknown(Malformed::InvalidServiceName),
                };
                Message::Client(ClientMessage {
                    sender_id,
                    service_name,
                    payload: rest.collect(),
                })
            }
            Some(Protocol::Worker) => {
                let cmd = rest.next().unwrap_or_default();
                let remaining: Vec<Frame> = rest.collect();
                match decode_worker_command(&cmd, remaining) {
                    Ok(command) => Message::Worker(WorkerMessage { sender_id, command }),
                    Err(malformed) => Message::Unknown(malformed),
                }
            }
            None => Message::Unknown(Malformed::UnknownProtocol(tag)),
        }
    }

    /// Encode into frames
    ///
    /// `Unknown` has no wire form and encodes to nothing.
    pub fn encode(&self) -> Vec<Frame> {
        match self {
            Message::Client(msg) => msg.encode(),
            Message::Worker(msg) => msg.encode(),
            Message::Unknown(_) => Vec::new(),
        }
    }
}

fn decode_worker_command(cmd: &[u8], mut frames: Vec<Frame>) -> Result<WorkerCommand, Malformed> {
    let byte = match cmd {
        [byte] => *byte,
        _ => return Err(Malformed::UnknownCommand(cmd.first().copied().unwrap_or(0))),
    };

    match byte {
        command::READY => {
            if frames.is_empty() {
                return Err(Malformed::TooFewFrames(3));
            }
            let service_name =
                String::from_utf8(frames.swap_remove(0)).map_err(|_| Malformed::InvalidServiceName)?;
            Ok(WorkerCommand::Ready { service_name })
        }
        command::REQUEST | command::REPLY => {
            // [client id][empty][payload ...]
            if frames.len() < 2 {
                return Err(Malformed::TooFewFrames(3 + frames.len()));
            }
            if !frames[1].is_empty() {
                return Err(Malformed::MissingDelimiter);
            }
            let mut iter = frames.into_iter();
            let client_id = iter.next().unwrap_or_default();
            let payload: Vec<Frame> = iter.skip(1).collect();
            if byte == command::REQUEST {
                Ok(WorkerCommand::Request { client_id, payload })
            } else {
                Ok(WorkerCommand::Reply { client_id, payload })
            }
        }
        command::HEARTBEAT => Ok(WorkerCommand::Heartbeat),
        command::DISCONNECT => Ok(WorkerCommand::Disconnect),
        other => Err(Malformed::UnknownCommand(other)),
    }
}
