//! Downstream byte sinks
//!
//! A listener session writes relayed bytes into a sink. A failed write
//! means the listener is gone.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Destination for one listener's bytes
pub trait ListenerSink: Send + 'static {
    /// Write one chunk; an error ends the session
    fn write(&mut self, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Sink feeding a bounded channel, e.g. an HTTP response body
///
/// The write suspends while the channel is full; it fails once the
/// receiving side is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Wrap an existing sender
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver that drains it
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl ListenerSink for ChannelSink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.tx.send(data).await.map_err(|_| Error::SinkClosed)
    }
}

/// Sink over any async writer (TCP stream, duplex pipe, file)
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> ListenerSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.writer.write_all(&data).await?;
        Ok(())
    }
}
