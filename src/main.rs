//! line-pool: a line-based TCP request/response server
//!
//! Features:
//! - Newline-delimited request/response protocol with a `SUCC`/`ERR` handshake
//! - Fixed-size worker pool with admission control; overflow clients are
//!   rejected instead of queued
//! - Pluggable request processors, swappable at runtime
//! - Pause/resume of client admission (SIGUSR1/SIGUSR2 on Unix)
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod pool;
mod processor;
mod protocol;
mod server;
mod worker;

use config::Config;
use server::Server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        core_size = config.pool.core_size,
        max_size = config.pool.max_size,
        queue_capacity = config.pool.queue_capacity,
        idle_timeout_secs = config.pool.idle_timeout.as_secs(),
        processor = ?config.processor,
        "Starting line-pool server"
    );

    let server = Arc::new(Server::new(&config));
    server.set_request_processor(config.processor.build());

    #[cfg(unix)]
    spawn_signal_handlers(Arc::clone(&server))?;

    server.start(config.port).await?;
    Ok(())
}

/// SIGUSR1 pauses client admission, SIGUSR2 resumes it.
#[cfg(unix)]
fn spawn_signal_handlers(server: Arc<Server>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pause = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = pause.recv() => {
                    if !server.pause_client_connections() {
                        info!(state = ?server.state(), "Ignoring pause request");
                    }
                }
                Some(()) = resume.recv() => {
                    if !server.resume_client_connections() {
                        info!(state = ?server.state(), "Ignoring resume request");
                    }
                }
                else => break,
            }
        }
    });

    Ok(())
}
