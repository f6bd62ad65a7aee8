//! Majordomo broker daemon
//!
//! Runs a broker in the foreground until SIGINT or SIGTERM.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use majordomo::broker::{Broker, BrokerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::process;
use std::thread;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "start" => start_broker(&args[2..]),
        "config" => show_config(),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown command '{}'", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_broker(endpoints: &[String]) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("majordomo=info")))
        .with(fmt::layer())
        .init();

    let mut config = BrokerConfig::load();
    if !endpoints.is_empty() {
        config.endpoints = endpoints.to_vec();
    }

    let mut broker = Broker::new(config).context("invalid broker configuration")?;
    let bound = broker.bind_configured().context("failed to bind endpoints")?;
    broker.register_default_services()?;

    let handle = broker.handle();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::info!(signal, "received signal, stopping broker");
            handle.stop();
        }
    });

    for endpoint in &bound {
        println!("Majordomo broker listening on {}", endpoint);
    }
    println!("Press Ctrl-C to stop the broker.");

    broker.run()?;
    Ok(())
}

fn show_config() -> Result<()> {
    let config = BrokerConfig::load();
    println!("rc file:              {}", BrokerConfig::rc_path().display());
    println!("heartbeat interval:   {:?}", config.heartbeat_interval);
    println!("heartbeat liveness:   {}", config.heartbeat_liveness);
    println!("client timeout:       {:?}", config.client_expiry());
    println!("endpoints:            {}", config.endpoints.join(" "));
    println!("rbac roles:           {}", config.rbac_roles.join(" "));
    println!("queue capacity:       {}", config.service_queue_capacity);
    println!("internal threads:     {}", config.internal_threads);
    println!("per-user ipc default: {}", BrokerConfig::default_ipc_endpoint());
    config.validate()?;
    Ok(())
}

fn print_usage() {
    println!("Usage: mdbrokerd <command>");
    println!();
    println!("Commands:");
    println!("  start [endpoint...]  Run the broker in the foreground");
    println!("  config               Show the effective configuration");
    println!();
    println!("Configuration is read from ~/.mdbrokerrc and MDP_* environment variables.");
}
