//! Interactive client for the echo-relay server.

use clap::Parser;
use echo_relay::client::{Client, SessionEnd};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{stdin, stdout, BufReader};

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for the echo-relay server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Seconds to wait for each response before giving up
    #[arg(long)]
    io_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    println!("Client: Connecting to server...");
    let client = match Client::connect(args.server).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Client: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("Client: Connected to server!");

    let mut client = client.with_response_timeout(args.io_timeout.map(Duration::from_secs));
    match client.run(BufReader::new(stdin()), stdout()).await {
        Ok(end) => {
            if end == SessionEnd::InputClosed {
                println!();
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Client: {e}");
            ExitCode::FAILURE
        }
    }
}
