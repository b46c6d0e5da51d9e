//! TCP server core.
//!
//! Owns the listening socket, the lifecycle state, and the accept loop that
//! feeds admitted connections into the worker pool.

use crate::config::Config;
use crate::error::ServerError;
use crate::pool::AdmissionPool;
use crate::processor::{EchoProcessor, RequestProcessor};
use crate::protocol;
use crate::worker::ConnectionWorker;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pending-connection backlog for the listening socket
const LISTEN_BACKLOG: i32 = 128;

/// Server lifecycle.
///
/// ```text
/// Stopped --bind--> Started --serve--> Running <--pause/resume--> Paused
/// ```
///
/// There is no way back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not started yet.
    Stopped,
    /// Listener bound, accept loop not yet entered.
    Started,
    /// Accepting and admitting connections.
    Running,
    /// Listener bound but not accepting.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Bind,
    Serve,
    Pause,
    Resume,
}

impl LifecycleState {
    pub fn is_started(self) -> bool {
        self != LifecycleState::Stopped
    }

    pub fn is_running(self) -> bool {
        self == LifecycleState::Running
    }

    fn on(self, transition: Transition) -> Option<Self> {
        use LifecycleState::*;

        match (self, transition) {
            (Stopped, Transition::Bind) => Some(Started),
            (Started, Transition::Serve) => Some(Running),
            (Started | Running, Transition::Pause) => Some(Paused),
            (Paused, Transition::Resume) => Some(Running),
            _ => None,
        }
    }
}

/// Server instance
pub struct Server {
    host: String,
    pool: AdmissionPool,
    processor: RwLock<Arc<dyn RequestProcessor>>,
    state: watch::Sender<LifecycleState>,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    /// Create a new server instance answering with the echo processor.
    pub fn new(config: &Config) -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);

        Server {
            host: config.host.clone(),
            pool: AdmissionPool::new(config.pool),
            processor: RwLock::new(Arc::new(EchoProcessor)),
            state,
            local_addr: OnceLock::new(),
        }
    }

    /// Bind to `port` and run the accept loop.
    ///
    /// Does not return while the server is alive. Fails if the server was
    /// already started or the listener cannot be bound.
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        if self.is_started() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = format!("{}:{}", self.host, port);
        let listener = bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let local_addr = listener.local_addr()?;
        if !self.transition(Transition::Bind) {
            return Err(ServerError::AlreadyStarted);
        }

        let _ = self.local_addr.set(local_addr);
        self.transition(Transition::Serve);

        info!(
            address = %local_addr,
            capacity = self.pool.capacity(),
            "Server listening"
        );

        self.accept_loop(listener).await;
        Ok(())
    }

    /// Stop admitting new connections. The listener stays bound and
    /// connections already being served are unaffected.
    ///
    /// Returns `false` if the server was not accepting.
    pub fn pause_client_connections(&self) -> bool {
        let paused = self.transition(Transition::Pause);
        if paused {
            info!("Pausing client connections");
        }
        paused
    }

    /// Resume admitting connections after a pause.
    ///
    /// Returns `false` if the server was not paused.
    pub fn resume_client_connections(&self) -> bool {
        let resumed = self.transition(Transition::Resume);
        if resumed {
            info!("Resuming client connections");
        }
        resumed
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Address the listener is bound to, once `start` has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of connections currently holding a pool slot.
    pub fn active_connections(&self) -> usize {
        self.pool.active()
    }

    pub fn request_processor(&self) -> Arc<dyn RequestProcessor> {
        let processor = self.processor.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&processor)
    }

    /// Replace the active processor. Connections dispatched before the call
    /// keep the processor they were given.
    pub fn set_request_processor(&self, processor: Arc<dyn RequestProcessor>) {
        *self.processor.write().unwrap_or_else(PoisonError::into_inner) = processor;
    }

    fn transition(&self, transition: Transition) -> bool {
        self.state.send_if_modified(|state| match state.on(transition) {
            Some(next) => {
                debug!(from = ?state, to = ?next, "Lifecycle transition");
                *state = next;
                true
            }
            None => false,
        })
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut state = self.state.subscribe();

        loop {
            let running = state.borrow_and_update().is_running();
            if !running {
                debug!("Accept loop waiting for resume");
                if state.wait_for(|s| s.is_running()).await.is_err() {
                    return;
                }
                continue;
            }

            tokio::select! {
                biased;

                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.pool.try_admit() else {
            warn!(
                peer = %peer,
                active = self.pool.active(),
                capacity = self.pool.capacity(),
                "Server at capacity, rejecting client"
            );
            if let Err(e) = reject_client(stream).await {
                debug!(peer = %peer, error = %e, "Failed to send rejection");
            }
            return;
        };

        let worker = ConnectionWorker::new(stream, peer.to_string(), self.request_processor(), slot);
        let dispatched = self.pool.submit(async move {
            worker.run().await.ok();
        });

        if let Err(e) = dispatched {
            error!(peer = %peer, error = %e, "Failed to dispatch connection");
        }
    }
}

/// Tell an over-capacity client to go away and close its socket.
async fn reject_client<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&protocol::line(protocol::REJECTED)).await?;
    stream.flush().await?;
    stream.shutdown().await
}

async fn bind(addr: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
