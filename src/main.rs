//! echo-relay server binary.
//!
//! Exit codes: 0 after a normal shutdown, 1 on any configuration or
//! startup failure.

use echo_relay::{shutdown, Config, LogSink, Server};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; tracing output shares the handlers' sink
    let sink = LogSink::stdout().with_timestamps(config.timestamps);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(sink.clone())
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_clients = config.max_clients,
        io_timeout_secs = config.io_timeout.as_secs(),
        "Starting echo-relay server"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(serve(config, sink))
}

async fn serve(config: Config, sink: LogSink) -> ExitCode {
    let server = match Server::start(&config, sink) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Server failed to start");
            return ExitCode::FAILURE;
        }
    };

    info!(address = %server.local_addr(), "Press Ctrl+C to stop");
    let signals = shutdown::install_signal_handler(server.shutdown_handle());

    server.run().await;
    signals.abort();
    ExitCode::SUCCESS
}
