//! Client for the increment protocol.
//!
//! A [`Client`] dials once at construction and then issues one request per
//! [`Client::increment`] call, waiting for the matching response before
//! returning. Requests are never pipelined.

use crate::address::{AddrError, Endpoint};
use crate::codec::{self, ReadError};
use std::fmt;
use std::io;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Connection to an increment server
#[derive(Debug)]
pub struct Client {
    stream: BufStream<TcpStream>,
}

impl Client {
    /// Parse `url` (e.g. `tcp://localhost:8080`) and connect to it.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let endpoint: Endpoint = url.parse()?;
        Self::connect_endpoint(&endpoint).await
    }

    /// Connect to the first resolved address of `endpoint` that accepts.
    pub async fn connect_endpoint(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let addrs = endpoint.lookup().await.map_err(ClientError::Connect)?;
        let mut last_error = None;

        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(ClientError::Connect)?;
                    return Ok(Client {
                        stream: BufStream::new(stream),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(ClientError::Connect(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to")
        })))
    }

    /// Add `amount` to the server's counter and return the new total.
    ///
    /// An amount of zero reads the current total without changing it.
    pub async fn increment(&mut self, amount: u64) -> Result<u64, ClientError> {
        codec::write_u64(&mut self.stream, amount).await?;

        match codec::read_u64(&mut self.stream).await {
            Ok(total) => Ok(total),
            Err(ReadError::Closed) => Err(ClientError::Disconnected),
            Err(ReadError::Truncated { received }) => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("response truncated after {} bytes", received),
            ))),
            Err(ReadError::Io(e)) => Err(ClientError::Io(e)),
        }
    }

    /// Shut down the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    /// The address specification could not be parsed
    Addr(AddrError),
    /// The server could not be reached
    Connect(io::Error),
    /// The connection failed while a request was in flight
    Io(io::Error),
    /// The server closed the connection before responding
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Addr(e) => write!(f, "invalid server address: {}", e),
            ClientError::Connect(e) => write!(f, "failed to connect: {}", e),
            ClientError::Io(e) => write!(f, "connection error: {}", e),
            ClientError::Disconnected => write!(f, "server closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Addr(e) => Some(e),
            ClientError::Connect(e) | ClientError::Io(e) => Some(e),
            ClientError::Disconnected => None,
        }
    }
}

impl From<AddrError> for ClientError {
    fn from(e: AddrError) -> Self {
        ClientError::Addr(e)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}
