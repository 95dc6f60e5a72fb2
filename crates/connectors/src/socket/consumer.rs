//! Client side of the stream: connects to a server and reads records.

use super::config::SocketConfig;
use futures::StreamExt;
use linefeed_core::{Error, Record, RecordCodec, RecordSource, Result};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

/// Reads framed records from a stream server until EOF.
///
/// # Example
///
/// ```ignore
/// use linefeed_connectors::socket::{SocketConfig, SocketConsumer};
///
/// let mut consumer = SocketConsumer::connect(&SocketConfig::client("localhost", 9009)).await?;
/// while let Some(record) = consumer.next_record().await? {
///     println!("{:?}", record);
/// }
/// ```
#[derive(Debug)]
pub struct SocketConsumer {
    reader: FramedRead<TcpStream, RecordCodec>,
    peer: SocketAddr,
    config: SocketConfig,
    received: u64,
}

impl SocketConsumer {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &SocketConfig) -> Result<Self> {
        let addr = config.address();
        info!(address = %addr, "Consumer connecting");

        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", addr),
                ))
            })??;
        let peer = stream.peer_addr()?;

        info!(address = %addr, "Connected to server");

        let codec = RecordCodec::new(config.framing, config.max_frame_len);
        Ok(Self {
            reader: FramedRead::new(stream, codec),
            peer,
            config: config.clone(),
            received: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Records read so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Next record, or `None` once the server closed the stream.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        let next = match self.config.read_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.reader.next())
                .await
                .map_err(|_| {
                    Error::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                })?,
            None => self.reader.next().await,
        };

        match next {
            Some(Ok(record)) => {
                self.received += 1;
                debug!(record = self.received, "Received record");
                Ok(Some(record))
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                info!(peer = %self.peer, received = self.received, "Server closed the stream");
                Ok(None)
            }
        }
    }

    /// Read up to `limit` records (all of them when `None`).
    pub async fn collect(&mut self, limit: Option<usize>) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while limit.map_or(true, |limit| records.len() < limit) {
            match self.next_record().await? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }
}

/// A consumer is itself a record source, so a stream can be relayed.
#[async_trait::async_trait]
impl RecordSource for SocketConsumer {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        SocketConsumer::next_record(self).await
    }
}
