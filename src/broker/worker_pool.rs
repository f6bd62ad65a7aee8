//! Internal worker pool for in-process services
//!
//! ## Architecture
//! - The broker pushes requests onto a crossbeam channel shared by N threads
//! - Each thread owns one end of a Unix socket pair; the broker's router owns
//!   the other end and sees the thread as an ordinary worker connection
//! - Threads answer with MDPW01 REPLY messages over their own socket, so no
//!   socket is ever touched by two threads
//! - Handler errors and panics are turned into an `"error: ..."` reply payload

use crate::broker::protocol::{ClientMessage, Frame, WorkerCommand, WorkerMessage};
use crate::broker::transport::{write_frames, Stream};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// User handler for an internal service
///
/// Receives the full client request (sender id, service name, payload) and
/// returns the reply payload.
pub type RequestHandler = Arc<dyn Fn(&ClientMessage) -> anyhow::Result<Vec<Frame>> + Send + Sync>;

/// Fixed set of handler threads serving one service
pub struct InternalPool {
    service: String,
    sender: Option<Sender<ClientMessage>>,
    threads: Vec<JoinHandle<()>>,
}

impl InternalPool {
    /// Spawn one thread per stream; each stream is that thread's reply socket
    pub fn spawn(service: &str, handler: RequestHandler, streams: Vec<Stream>) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<ClientMessage>();
        let mut threads = Vec::with_capacity(streams.len());

        for (index, stream) in streams.into_iter().enumerate() {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            let name = service.to_string();

            let handle = thread::Builder::new()
                .name(format!("{}#{}", service, index))
                .spawn(move || serve(&name, handler, receiver, stream))?;
            threads.push(handle);
        }

        Ok(Self {
            service: service.to_string(),
            sender: Some(sender),
            threads,
        })
    }

    /// Hand a request to the pool; false once the pool is shutting down
    pub fn submit(&self, request: ClientMessage) -> bool {
        match &self.sender {
            Some(sender) => sender.send(request).is_ok(),
            None => false,
        }
    }

    /// Number of handler threads
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Requests waiting for a free thread
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Close the channel and wait for every thread to finish its current request
    pub fn shutdown(&mut self) {
        // Disconnecting the channel ends every thread's recv loop
        self.sender.take();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(service = %self.service, "pool thread terminated abnormally");
            }
        }
    }
}

impl Drop for InternalPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for InternalPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalPool")
            .field("service", &self.service)
            .field("threads", &self.threads.len())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Pool thread loop
fn serve(service: &str, handler: RequestHandler, requests: Receiver<ClientMessage>, mut stream: Stream) {
    while let Ok(request) = requests.recv() {
        let client_id = request.sender_id.clone().unwrap_or_default();
        let payload = run_handler(service, handler.as_ref(), &request);

        let reply = WorkerMessage::new(WorkerCommand::Reply { client_id, payload });
        if let Err(e) = write_frames(&mut stream, &reply.encode()) {
            tracing::debug!(service, error = %e, "broker socket closed, stopping pool thread");
            break;
        }
    }
}

/// Run a handler, converting errors and panics into a reply payload
pub fn run_handler(
    service: &str,
    handler: &(dyn Fn(&ClientMessage) -> anyhow::Result<Vec<Frame>> + Send + Sync),
    request: &ClientMessage,
) -> Vec<Frame> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => {
            tracing::error!(service, error = %format!("{:#}", e), "handler failed");
            vec![format!("error: {:#}", e).into_bytes()]
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(service, panic = %message, "handler panicked");
            vec![format!("error: handler panicked: {}", message).into_bytes()]
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::Message;
    use crate::broker::transport::FrameReader;
    use anyhow::anyhow;
    use std::time::Duration;

    fn echo() -> RequestHandler {
        Arc::new(|request: &ClientMessage| -> anyhow::Result<Vec<Frame>> { Ok(request.payload.clone()) })
    }

    fn request(client: &[u8], payload: &[u8]) -> ClientMessage {
        ClientMessage::new("test", vec![payload.to_vec()]).with_sender(client.to_vec())
    }

    fn read_reply(reader: &mut FrameReader, stream: &mut Stream) -> WorkerMessage {
        let frames = reader
            .read_message(stream, Some(Duration::from_secs(5)))
            .unwrap()
            .expect("reply within timeout");
        match Message::decode(frames, false) {
            Message::Worker(msg) => msg,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_handler_result_passes_through() {
        let request = request(b"c1", b"hello");
        let payload = run_handler("test", echo().as_ref(), &request);
        assert_eq!(payload, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_handler_error_becomes_payload() {
        let failing = |_: &ClientMessage| -> anyhow::Result<Vec<Frame>> {
            Err(anyhow!("disk full").context("saving state"))
        };
        let payload = run_handler("test", &failing, &request(b"c1", b"x"));
        assert_eq!(payload, vec![b"error: saving state: disk full".to_vec()]);
    }

    #[test]
    fn test_handler_panic_becomes_payload() {
        let panicking = |_: &ClientMessage| -> anyhow::Result<Vec<Frame>> { panic!("boom") };
        let payload = run_handler("test", &panicking, &request(b"c1", b"x"));
        assert_eq!(payload, vec![b"error: handler panicked: boom".to_vec()]);
    }

    #[test]
    fn test_pool_replies_over_its_socket() {
        let (mut broker_end, thread_end) = Stream::pair().unwrap();
        let pool = InternalPool::spawn("test", echo(), vec![thread_end]).unwrap();
        assert_eq!(pool.size(), 1);

        assert!(pool.submit(request(b"client-a", b"one")));
        assert!(pool.submit(request(b"client-b", b"two")));

        let mut reader = FrameReader::new();
        for (client, payload) in [(&b"client-a"[..], &b"one"[..]), (&b"client-b"[..], &b"two"[..])] {
            let reply = read_reply(&mut reader, &mut broker_end);
            assert_eq!(
                reply.command,
                WorkerCommand::Reply {
                    client_id: client.to_vec(),
                    payload: vec![payload.to_vec()],
                }
            );
        }
    }

    #[test]
    fn test_pool_survives_panics() {
        let (mut broker_end, thread_end) = Stream::pair().unwrap();
        let handler: RequestHandler = Arc::new(|request: &ClientMessage| -> anyhow::Result<Vec<Frame>> {
            if request.payload.first().map(Vec::as_slice) == Some(b"crash") {
                panic!("requested crash");
            }
            Ok(vec![b"ok".to_vec()])
        });
        let pool = InternalPool::spawn("test", handler, vec![thread_end]).unwrap();

        pool.submit(request(b"c", b"crash"));
        pool.submit(request(b"c", b"fine"));

        let mut reader = FrameReader::new();
        let first = read_reply(&mut reader, &mut broker_end);
        let second = read_reply(&mut reader, &mut broker_end);

        match first.command {
            WorkerCommand::Reply { payload, .. } => {
                assert!(String::from_utf8_lossy(&payload[0]).contains("requested crash"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(
            second.command,
            WorkerCommand::Reply { client_id: b"c".to_vec(), payload: vec![b"ok".to_vec()] }
        );
    }

    #[test]
    fn test_shutdown_joins_threads() {
        let (_broker_end, a) = Stream::pair().unwrap();
        let (_other_end, b) = Stream::pair().unwrap();
        let mut pool = InternalPool::spawn("test", echo(), vec![a, b]).unwrap();
        assert_eq!(pool.size(), 2);

        pool.shutdown();
        assert_eq!(pool.size(), 0);
        assert!(!pool.submit(request(b"c", b"late")));
    }
}
