//! Audio relay server example
//!
//! Run with: cargo run --example relay_server [BIND_ADDR] [ORIGIN_URL]
//!
//! Examples:
//!   cargo run --example relay_server                                   # 0.0.0.0:1337, origin localhost:8000
//!   cargo run --example relay_server 127.0.0.1:8001                    # custom bind address
//!   cargo run --example relay_server 0.0.0.0:1337 http://radio:8000/   # custom origin
//!
//! ## Listening
//!
//! With ffplay:
//!   ffplay http://localhost:1337/jazz
//!
//! With curl:
//!   curl -o capture.mp3 http://localhost:1337/jazz
//!
//! ## Features
//!
//! - One origin fetch per channel, shared by every listener
//! - Catch-up: new listeners replay the buffered tracks first
//! - Resume: a dropped origin connection continues at the exact byte offset

use std::net::SocketAddr;
use std::time::Duration;

use audio_relay::{RegistryConfig, RelayServer, ServerConfig, UpstreamConfig};

fn parse_bind_addr(arg: Option<&String>) -> Result<SocketAddr, String> {
    let Some(arg) = arg else {
        return Ok(ServerConfig::default().bind_addr);
    };

    if arg == "localhost" {
        return Ok(SocketAddr::from(([127, 0, 0, 1], 1337)));
    }

    // Bare host: use the default port
    if !arg.contains(':') {
        let with_port = format!("{}:1337", arg);
        return with_port
            .parse()
            .map_err(|e| format!("Invalid address '{}': {}", arg, e));
    }

    arg.parse()
        .map_err(|e| format!("Invalid address '{}': {}", arg, e))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audio_relay=debug".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let bind_addr = parse_bind_addr(args.get(1))?;
    let origin = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| audio_relay::upstream::config::DEFAULT_ORIGIN.to_string());

    let config = ServerConfig::with_addr(bind_addr).max_listeners(1000);
    let upstream = UpstreamConfig::with_origin(origin.clone())
        .connect_timeout(Duration::from_secs(5))
        .resume_backoff(Duration::from_millis(250), Duration::from_secs(10));

    let server = RelayServer::with_upstream(config, RegistryConfig::default(), upstream)?;

    println!("Audio relay listening on {}", bind_addr);
    println!("Relaying from origin {}", origin);
    println!();
    println!("Listen with: ffplay http://localhost:{}/<channel>", bind_addr.port());
    println!();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            println!(
                "\nShutting down... listeners={} total={} rejected={} channels={}",
                stats.active_connections,
                stats.total_connections,
                stats.rejected_connections,
                stats.active_channels,
            );
        }
    }

    Ok(())
}
