mod common;

use anyhow::anyhow;
use common::{test_config, TestBroker};
use majordomo::broker::{AsyncClient, ClientMessage, Frame, SyncClient, MMI_DNS, MMI_ECHO, MMI_SERVICE};
use std::time::Duration;

fn single_frame(reply: Option<ClientMessage>) -> Vec<u8> {
    let reply = reply.expect("reply");
    assert_eq!(reply.payload.len(), 1, "unexpected payload: {:?}", reply.payload);
    reply.payload.into_iter().next().unwrap()
}

#[test]
fn test_echo_round_trip() {
    let broker = TestBroker::start();
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    let reply = client
        .request(MMI_ECHO, vec![b"Hello World!".to_vec()])
        .unwrap()
        .expect("echo reply");

    assert_eq!(reply.service_name, MMI_ECHO);
    assert_eq!(reply.payload, vec![b"Hello World!".to_vec()]);
}

#[test]
fn test_echo_preserves_all_frames() {
    let broker = TestBroker::start();
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    let payload = vec![b"one".to_vec(), Vec::new(), vec![0u8, 255, 7]];
    let reply = client.request(MMI_ECHO, payload.clone()).unwrap().unwrap();
    assert_eq!(reply.payload, payload);
}

#[test]
fn test_service_discovery_codes() {
    let broker = TestBroker::start();
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    let known = client.request(MMI_SERVICE, vec![b"mmi.echo".to_vec()]).unwrap();
    assert_eq!(single_frame(known), b"200");

    let unknown = client.request(MMI_SERVICE, vec![b"unknownService".to_vec()]).unwrap();
    assert_eq!(single_frame(unknown), b"400");

    let direct = client.request("unknownService", vec![b"hello".to_vec()]).unwrap();
    assert_eq!(single_frame(direct), b"501");
}

#[test]
fn test_dns_lists_endpoints() {
    let broker = TestBroker::start();
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    let reply = client.request(MMI_DNS, vec![]).unwrap();
    assert_eq!(String::from_utf8(single_frame(reply)).unwrap(), broker.endpoint);
}

#[test]
fn test_failing_handler_reports_error_and_broker_continues() {
    let broker = TestBroker::start_with(test_config(), |broker| {
        broker
            .register_service("faulty", 1, |_: &ClientMessage| -> anyhow::Result<Vec<Frame>> {
                Err(anyhow!("handler always fails"))
            })
            .unwrap();
        broker
            .register_service("panicky", 1, |_: &ClientMessage| -> anyhow::Result<Vec<Frame>> {
                panic!("handler always panics")
            })
            .unwrap();
    });
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    for _ in 0..2 {
        let text = String::from_utf8(single_frame(client.request("faulty", vec![b"x".to_vec()]).unwrap())).unwrap();
        assert!(text.starts_with("error:"), "got {:?}", text);
        assert!(text.contains("handler always fails"));

        let text = String::from_utf8(single_frame(client.request("panicky", vec![b"x".to_vec()]).unwrap())).unwrap();
        assert!(text.contains("handler always panics"), "got {:?}", text);
    }

    let echo = client.request(MMI_ECHO, vec![b"still alive".to_vec()]).unwrap().unwrap();
    assert_eq!(echo.payload, vec![b"still alive".to_vec()]);
}

#[test]
fn test_internal_service_with_several_threads() {
    let broker = TestBroker::start_with(test_config(), |broker| {
        broker
            .register_service("upper", 4, |request: &ClientMessage| -> anyhow::Result<Vec<Frame>> {
                Ok(request.payload.iter().map(|frame| frame.to_ascii_uppercase()).collect())
            })
            .unwrap();
    });
    let mut client = SyncClient::connect(&broker.endpoint).unwrap();

    for word in ["alpha", "beta", "gamma"] {
        let reply = client.request("upper", vec![word.as_bytes().to_vec()]).unwrap().unwrap();
        assert_eq!(reply.payload, vec![word.to_uppercase().into_bytes()]);
    }
}

fn pipeline(count: usize) {
    let broker = TestBroker::start();
    let mut client = AsyncClient::connect(&broker.endpoint).unwrap();

    for i in 0..count {
        assert!(client.send(MMI_ECHO, vec![i.to_string().into_bytes()]), "send {} failed", i);
    }

    for i in 0..count {
        let reply = client
            .recv(Duration::from_secs(30))
            .unwrap_or_else(|| panic!("reply {} of {} missing", i, count));
        assert_eq!(reply.payload, vec![i.to_string().into_bytes()], "reply out of order");
    }
    assert!(client.recv(Duration::from_millis(50)).is_none());
}

#[test]
fn test_async_pipeline_keeps_order() {
    pipeline(100_000);
}

#[test]
#[ignore] // slow: cargo test --release -- --ignored
fn test_async_pipeline_one_million() {
    pipeline(1_000_000);
}

#[test]
fn test_many_clients_share_the_broker() {
    let broker = TestBroker::start();
    let endpoint = broker.endpoint.clone();

    let threads: Vec<_> = (0..8)
        .map(|id| {
            let endpoint = endpoint.clone();
            std::thread::spawn(move || {
                let mut client = SyncClient::connect(&endpoint).unwrap();
                for n in 0..50 {
                    let body = format!("{}-{}", id, n).into_bytes();
                    let reply = client.request(MMI_ECHO, vec![body.clone()]).unwrap().unwrap();
                    assert_eq!(reply.payload, vec![body]);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
}
