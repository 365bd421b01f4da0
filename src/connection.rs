//! Per-connection request loop.
//!
//! Each accepted socket gets one task running [`handle_connection`]. The
//! loop reads an increment request, applies it to the shared counter and
//! writes back the new total, strictly one request at a time.

use crate::codec::{self, ReadError};
use crate::counter::Counter;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::sync::watch;
use tracing::trace;

/// How a connection reacts when the server closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownBehavior {
    /// Finish the read in progress; the loop exits at its next closed check
    /// or when the peer disconnects.
    Linger,
    /// Abandon the read in progress and close the connection at once.
    Close,
}

/// Error that ended a connection
#[derive(Debug)]
pub enum ConnectionError {
    /// Reading a request failed (other than a clean end-of-stream)
    Read(ReadError),
    /// Writing or flushing a response failed
    Write(io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Read(e) => write!(f, "reading request: {}", e),
            ConnectionError::Write(e) => write!(f, "writing response: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Read(e) => Some(e),
            ConnectionError::Write(e) => Some(e),
        }
    }
}

/// Serve increment requests on `stream` until the peer disconnects, an I/O
/// error occurs, or the server closes.
///
/// `closed` carries the owning server's closed flag. The stream is dropped,
/// and so closed, on every return path. Returns the number of requests
/// served when the connection ends without error.
pub async fn handle_connection<S>(
    stream: S,
    counter: Counter,
    mut closed: watch::Receiver<bool>,
    on_shutdown: ShutdownBehavior,
) -> Result<u64, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);
    let mut served = 0u64;

    loop {
        if *closed.borrow() {
            trace!(served, "Server closed, dropping connection");
            return Ok(served);
        }

        let request = match on_shutdown {
            ShutdownBehavior::Linger => codec::read_u64(&mut stream).await,
            ShutdownBehavior::Close => {
                tokio::select! {
                    biased;
                    _ = closed.wait_for(|closed| *closed) => {
                        trace!(served, "Server closed, abandoning read");
                        return Ok(served);
                    }
                    request = codec::read_u64(&mut stream) => request,
                }
            }
        };

        let amount = match request {
            Ok(amount) => amount,
            Err(ReadError::Closed) => {
                trace!(served, "Connection closed by client");
                return Ok(served);
            }
            Err(e) => return Err(ConnectionError::Read(e)),
        };

        let total = counter.add_and_get(amount);
        trace!(amount, total, "Applied increment");

        codec::write_u64(&mut stream, total)
            .await
            .map_err(ConnectionError::Write)?;
        served += 1;
    }
}
