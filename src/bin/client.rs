use std::fs;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use btcp::{Config, Connector};

/// Reference connector front end: streams a file to a listening accepter.
#[derive(Parser, Debug)]
#[command(name = "btcp-client")]
struct Args {
    /// Advertised window, in segments (1..255).
    #[arg(short = 'w', long, default_value_t = btcp::DEFAULT_WINDOW)]
    window: u8,

    /// Retransmission / handshake timeout, in milliseconds.
    #[arg(short = 't', long, default_value_t = btcp::DEFAULT_TIMEOUT_MS)]
    timeout: u64,

    /// File whose bytes are streamed to the peer.
    #[arg(short = 'i', long)]
    input: String,

    /// Local address to bind the UDP socket to.
    #[arg(short = 'l', long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Address of the listening accepter.
    #[arg(short = 'c', long)]
    connect: SocketAddr,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("client: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> btcp::Result<()> {
    let bytes = fs::read(&args.input)?;
    let cfg = Config::new(args.window, args.timeout)?;

    let connector = Connector::new(args.listen, cfg)?;
    info!("client: connecting to {}", args.connect);
    connector.connect(args.connect)?;

    let mut offset = 0;
    while offset < bytes.len() {
        offset += connector.send(&bytes[offset..])?;
    }

    connector.shutdown()?;
    info!("client: sent {} bytes", bytes.len());
    Ok(())
}
