use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use majordomo::broker::{AsyncClient, Broker, BrokerConfig, BrokerHandle, SyncClient, MMI_ECHO};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Broker lifecycle helpers
// ---------------------------------------------------------------------------

struct RunningBroker {
    endpoint: String,
    handle: BrokerHandle,
    thread: Option<JoinHandle<()>>,
}

fn start_broker(endpoint: &str) -> RunningBroker {
    let config = BrokerConfig {
        internal_threads: 2,
        ..BrokerConfig::default()
    };
    let mut broker = Broker::new(config).expect("valid config");
    let endpoint = broker.bind(endpoint).expect("bind").to_string();
    broker.register_default_services().expect("default services");

    let handle = broker.handle();
    let thread = thread::spawn(move || {
        broker.run().expect("broker loop");
    });

    RunningBroker {
        endpoint,
        handle,
        thread: Some(thread),
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_echo_round_trip(c: &mut Criterion) {
    let tcp = start_broker("tcp://127.0.0.1:0");
    let dir = tempfile::tempdir().expect("tempdir");
    let ipc = start_broker(&format!("ipc://{}", dir.path().join("bench.sock").display()));

    let mut group = c.benchmark_group("echo_round_trip");
    group.measurement_time(Duration::from_secs(5));

    for (transport, broker) in [("tcp", &tcp), ("ipc", &ipc)] {
        let mut client = SyncClient::connect(&broker.endpoint).expect("connect");
        group.bench_function(BenchmarkId::new("sync", transport), |b| {
            b.iter(|| {
                let reply = client
                    .request(MMI_ECHO, vec![b"Hello World!".to_vec()])
                    .expect("request");
                black_box(reply)
            })
        });
    }

    group.finish();
}

fn bench_pipelined_echo(c: &mut Criterion) {
    let broker = start_broker("tcp://127.0.0.1:0");
    let mut client = AsyncClient::connect(&broker.endpoint).expect("connect");

    let mut group = c.benchmark_group("pipelined_echo");
    group.sample_size(20);

    for batch in [100u64, 1_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                for i in 0..batch {
                    client.send(MMI_ECHO, vec![i.to_be_bytes().to_vec()]);
                }
                let mut received = 0;
                while received < batch {
                    if client.recv(Duration::from_secs(5)).is_none() {
                        break;
                    }
                    received += 1;
                }
                black_box(received)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_echo_round_trip, bench_pipelined_echo);
criterion_main!(benches);
