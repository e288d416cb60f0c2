//! Line echo server.
//!
//! Demonstrates:
//! - Running a SessionMux over the stock TcpTransport
//! - Splitting each client's stream into lines with DelimiterDecoder
//! - Consuming session events from a channel and replying per client
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug
//!   cargo run --example echo_server -- --port 9000
//!
//! Then connect with `nc 127.0.0.1 7878` and type lines.

// ============================================================================
// Imports
// ============================================================================

use std::net::{Ipv4Addr, SocketAddr};

use session_mux::{DelimiterDecoder, Result, SessionEvent, SessionMux, TcpOptions, TcpTransport};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_PORT: u16 = 7878;
const MAX_CLIENTS: usize = 64;

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "session_mux=debug"
    } else {
        "session_mux=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== Echo Server ===\n");

    // ========================================================================
    // Open
    // ========================================================================

    let options = TcpOptions::new()
        .with_bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, args.port)))
        .with_max_connections(MAX_CLIENTS);
    let transport = TcpTransport::new(options)?;
    let factory = DelimiterDecoder::factory(b"\n".as_slice())?;

    let mux = SessionMux::new(transport, factory);
    let mut events = mux.subscribe();
    mux.open().await?;

    if let Some(addr) = mux.transport().local_addr() {
        println!("[1] Listening on {addr}");
    }
    println!("    Press Ctrl+C to exit...\n");

    // ========================================================================
    // Serve
    // ========================================================================

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected(id) => println!("[+] {id} connected"),
                    SessionEvent::ParsedData(id, line) => {
                        println!("    {id}: {}", String::from_utf8_lossy(&line));

                        let mut reply = line.to_vec();
                        reply.push(b'\n');
                        if let Err(e) = mux.send(id, reply).await {
                            println!("    ✗ Reply to {id} failed: {e}");
                        }
                    }
                    SessionEvent::Disconnected(id) => println!("[-] {id} disconnected"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\n[2] Shutting down...");
                break;
            }
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    mux.close().await?;
    println!("    ✓ Closed");

    Ok(())
}
