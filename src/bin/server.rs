use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use btcp::{Accepter, Config};

/// Reference accepter front end: waits for one connector and writes
/// everything it receives to a file.
#[derive(Parser, Debug)]
#[command(name = "btcp-server")]
struct Args {
    /// Advertised window, in segments (1..255).
    #[arg(short = 'w', long, default_value_t = btcp::DEFAULT_WINDOW)]
    window: u8,

    /// Retransmission / handshake timeout, in milliseconds.
    #[arg(short = 't', long, default_value_t = btcp::DEFAULT_TIMEOUT_MS)]
    timeout: u64,

    /// File the received byte stream is written to.
    #[arg(short = 'o', long)]
    output: String,

    /// Local address to bind the UDP socket to and accept on.
    #[arg(short = 'l', long, default_value = "0.0.0.0:9090")]
    listen: SocketAddr,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> btcp::Result<()> {
    let cfg = Config::new(args.window, args.timeout)?;
    let accepter = Accepter::new(args.listen, cfg)?;

    info!("server: waiting for a connector on {}", args.listen);
    let peer = accepter.accept()?;
    info!("server: accepted connection from {peer}");

    let mut out = File::create(&args.output)?;
    let mut total = 0usize;
    loop {
        let chunk = accepter.recv()?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len();
        out.write_all(&chunk)?;
    }

    info!("server: wrote {total} bytes to {}", args.output);
    Ok(())
}
