#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use majordomo::broker::{AsyncClient, Frame, MdpWorker, SyncClient};
use std::env;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "request" if args.len() >= 4 => request(&args[2], &args[3], &args[4..]),
        "echo-worker" if args.len() >= 4 => echo_worker(&args[2], &args[3]),
        "send-many" if args.len() >= 5 => {
            let count: usize = args[4]
                .parse()
                .with_context(|| format!("invalid count '{}'", args[4]))?;
            send_many(&args[2], &args[3], count)
        }
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown or incomplete command '{}'", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("majordomo=info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// One synchronous request; prints each reply frame on its own line
fn request(endpoint: &str, service: &str, payload: &[String]) -> Result<()> {
    let payload: Vec<Frame> = payload.iter().map(|frame| frame.as_bytes().to_vec()).collect();
    let mut client = SyncClient::connect(endpoint)?;

    match client.request(service, payload)? {
        Some(reply) => {
            for frame in &reply.payload {
                println!("{}", String::from_utf8_lossy(frame));
            }
            Ok(())
        }
        None => Err(anyhow!("no reply from service '{}'", service)),
    }
}

/// External worker answering every request with its own payload
fn echo_worker(endpoint: &str, service: &str) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let mut worker = MdpWorker::connect(endpoint, service)?;
    eprintln!("Serving '{}' via {} (Ctrl-C to stop)", service, endpoint);
    worker.run(|request| Ok(request.payload.clone()), &stop)?;
    Ok(())
}

/// Fire `count` requests, then collect `count` replies
fn send_many(endpoint: &str, service: &str, count: usize) -> Result<()> {
    let mut client = AsyncClient::connect(endpoint)?;
    let started = Instant::now();

    for i in 0..count {
        if !client.send(service, vec![i.to_string().into_bytes()]) {
            return Err(anyhow!("send failed after {} requests", i));
        }
    }

    let mut received = 0;
    while received < count {
        if client.recv(Duration::from_secs(10)).is_none() {
            break;
        }
        received += 1;
    }

    let elapsed = started.elapsed();
    println!(
        "{} sent, {} received in {:.3}s ({:.0} msg/s)",
        count,
        received,
        elapsed.as_secs_f64(),
        received as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    if received < count {
        process::exit(1);
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: majordomo <command> [args]");
    println!();
    println!("Commands:");
    println!("  request <endpoint> <service> [payload...]   Send one request and print the reply");
    println!("  echo-worker <endpoint> <service>            Serve a service by echoing payloads");
    println!("  send-many <endpoint> <service> <count>      Pipeline <count> requests and time them");
    println!();
    println!("Endpoints: tcp://host:port or ipc:///path");
}
