//! Per-connection worker.
//!
//! A worker owns one admitted connection for its whole life:
//! handshake, the read/respond loop, and teardown. The socket and the pool
//! slot are both owned values, so they are released on every exit path.

use crate::pool::Slot;
use crate::processor::RequestProcessor;
use crate::protocol;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Why a session ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `quit`.
    Quit,
    /// Client closed its end of the connection.
    Disconnected,
}

/// Services a single admitted connection.
pub struct ConnectionWorker<S> {
    stream: S,
    peer: String,
    processor: Arc<dyn RequestProcessor>,
    slot: Slot,
}

impl<S> ConnectionWorker<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(stream: S, peer: String, processor: Arc<dyn RequestProcessor>, slot: Slot) -> Self {
        Self {
            stream,
            peer,
            processor,
            slot,
        }
    }

    /// Serve the connection until the client quits, disconnects, or an I/O
    /// error occurs, then close the socket and release the slot.
    pub async fn run(self) -> io::Result<CloseReason> {
        let ConnectionWorker {
            stream,
            peer,
            processor,
            slot,
        } = self;

        info!(peer = %peer, "Client connected");
        let result = serve(stream, processor.as_ref()).await;

        match &result {
            Ok(reason) => info!(peer = %peer, ?reason, "Client connection terminated"),
            Err(e) => warn!(peer = %peer, error = %e, "Client connection failed"),
        }

        drop(slot);
        result
    }
}

async fn serve<S>(stream: S, processor: &dyn RequestProcessor) -> io::Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    writer.write_all(&protocol::line(protocol::ADMITTED)).await?;
    writer.flush().await?;

    loop {
        line.clear();

        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(CloseReason::Disconnected);
        }

        let decoded = String::from_utf8_lossy(&line);
        let request = protocol::trim_line(&decoded);
        debug!(request, "Client request");

        writer.write_all(&protocol::line(protocol::PROCESSING)).await?;
        writer.flush().await?;

        if request == protocol::QUIT {
            writer.shutdown().await?;
            return Ok(CloseReason::Quit);
        }

        let response = processor.process(request);
        writer.write_all(&protocol::response(&response)).await?;
        writer.flush().await?;
    }
}
