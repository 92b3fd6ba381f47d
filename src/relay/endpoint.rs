//! One side of a relay: the connection halves plus their bookkeeping

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{Instant, Sleep};
use tracing::trace;

use crate::common::{Side, Stream};

/// Upper bound on the best-effort shutdown of a closing writer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection owned by the relay
///
/// The halves are `None` while a read or write future borrows them, and
/// after the endpoint is closed.
pub(crate) struct Endpoint {
    pub side: Side,
    pub reader: Option<ReadHalf<Stream>>,
    pub writer: Option<WriteHalf<Stream>>,
    /// Bytes received before the shovel started, delivered before any read
    pub pre_read: BytesMut,
    /// Something was written to this side; an error reply is no longer possible
    pub dirty: bool,
    pub closed: bool,
    /// Close requested while a write into this side is still in flight
    pub closing: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Consecutive reads delayed because the quota granted a single byte
    pub delayed_loops: u32,
    pub timer: Pin<Box<Sleep>>,
    read_timeout: Duration,
}

impl Endpoint {
    pub fn new(side: Side, stream: Stream, pre_read: &[u8], read_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            side,
            reader: Some(reader),
            writer: Some(writer),
            pre_read: BytesMut::from(pre_read),
            dirty: false,
            closed: false,
            closing: false,
            bytes_read: 0,
            bytes_written: 0,
            delayed_loops: 0,
            timer: Box::pin(tokio::time::sleep(read_timeout)),
            read_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Push the idle deadline out by one read timeout
    pub fn refresh_timeout(&mut self) {
        let deadline = Instant::now() + self.read_timeout;
        self.timer.as_mut().reset(deadline);
    }

    /// Resolves when the peer sends bytes (kept in `pre_read`) or goes away.
    ///
    /// Cancel safe. `Ok(0)` means end of stream.
    pub async fn watch_closure(&mut self) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_buf(&mut self.pre_read).await,
            None => std::future::pending().await,
        }
    }

    /// Write `data` completely; used for the reply lines sent outside the shovel
    pub async fn write_whole(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        self.dirty = true;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Mark closed and hand back the shutdown of the writer, if it is still here
    pub fn shut(&mut self) -> Option<BoxFuture<'static, ()>> {
        trace!("{} connection shut", self.side);
        self.closed = true;
        self.closing = false;
        self.reader = None;
        self.writer.take().map(|mut writer| {
            Box::pin(async move {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
            }) as BoxFuture<'static, ()>
        })
    }

    /// Close and wait for the writer shutdown
    pub async fn close(&mut self) {
        if let Some(closer) = self.shut() {
            closer.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_closure_buffers_then_sees_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut ep = Endpoint::new(Side::Client, Box::new(a), b"x", Duration::from_secs(1));

        b.write_all(b"hello").await.unwrap();
        assert_eq!(ep.watch_closure().await.unwrap(), 5);
        assert_eq!(&ep.pre_read[..], b"xhello");

        drop(b);
        assert_eq!(ep.watch_closure().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_whole_marks_dirty() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut ep = Endpoint::new(Side::Client, Box::new(a), &[], Duration::from_secs(1));
        assert!(!ep.dirty);

        ep.write_whole(b"ack").await.unwrap();
        assert!(ep.dirty);
        assert_eq!(ep.bytes_written, 3);

        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ack");
    }

    #[tokio::test]
    async fn test_close_sends_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut ep = Endpoint::new(Side::Server, Box::new(a), &[], Duration::from_secs(1));
        ep.close().await;
        assert!(!ep.is_open());
        assert!(ep.write_whole(b"late").await.is_err());

        let mut buf = Vec::new();
        assert_eq!(b.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
