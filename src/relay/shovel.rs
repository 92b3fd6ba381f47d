//! Byte Shovel - moves bytes both ways once a relay is committed
//!
//! Two pumps, one per direction, each alternating read then write:
//! ```text
//! upload:   client.read  -> server.write -> client.read  -> ...
//! download: server.read  -> client.write -> server.read  -> ...
//! ```
//! Closing one side closes the other, but never while a write into that
//! other side is still in flight.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::common::{Side, Stream};
use crate::config::RelayConfig;
use crate::quota::QuotaDelegate;

use super::endpoint::Endpoint;

struct ReadDone {
    reader: ReadHalf<Stream>,
    /// False for bytes buffered before the shovel started
    fresh: bool,
    result: io::Result<Bytes>,
}

struct WriteDone {
    writer: WriteHalf<Stream>,
    result: io::Result<usize>,
}

enum PumpDone {
    Read(ReadDone),
    Wrote(WriteDone),
}

/// One direction's operation in flight
enum Pump {
    Idle,
    Reading(BoxFuture<'static, ReadDone>),
    Writing(BoxFuture<'static, WriteDone>),
}

impl Pump {
    fn is_writing(&self) -> bool {
        matches!(self, Pump::Writing(_))
    }

    fn is_reading(&self) -> bool {
        matches!(self, Pump::Reading(_))
    }

    /// Cancel safe; never resolves while idle
    async fn wait(&mut self) -> PumpDone {
        let done = match self {
            Pump::Idle => return std::future::pending().await,
            Pump::Reading(future) => PumpDone::Read(future.await),
            Pump::Writing(future) => PumpDone::Wrote(future.await),
        };
        *self = Pump::Idle;
        done
    }
}

enum Event {
    Pump(Side, PumpDone),
    Idle(Side),
    Shutdown,
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ShovelTotals {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

pub(crate) struct Shovel {
    id: u64,
    client: Endpoint,
    server: Endpoint,
    /// Reads from the client, writes to the server
    upload: Pump,
    /// Reads from the server, writes to the client
    download: Pump,
    quota: Arc<dyn QuotaDelegate>,
    buffer_size: usize,
    quota_delay: Duration,
    quota_delay_loops: u32,
    closers: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl Shovel {
    pub fn new(
        id: u64,
        client: Endpoint,
        server: Endpoint,
        quota: Arc<dyn QuotaDelegate>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            id,
            client,
            server,
            upload: Pump::Idle,
            download: Pump::Idle,
            quota,
            buffer_size: config.buffer_size.max(1),
            quota_delay: config.quota_delay(),
            quota_delay_loops: config.quota_delay_loops,
            closers: FuturesUnordered::new(),
        }
    }

    /// Shovel until both sides are closed
    pub async fn run(mut self, shutdown: &mut broadcast::Receiver<()>) -> ShovelTotals {
        self.client.refresh_timeout();
        self.server.refresh_timeout();
        self.start_read(Side::Client);
        self.start_read(Side::Server);

        while self.client.is_open() || self.server.is_open() {
            let event = tokio::select! {
                done = self.upload.wait() => Event::Pump(Side::Client, done),
                done = self.download.wait() => Event::Pump(Side::Server, done),
                _ = self.client.timer.as_mut(), if self.client.is_open() => Event::Idle(Side::Client),
                _ = self.server.timer.as_mut(), if self.server.is_open() => Event::Idle(Side::Server),
                Some(()) = self.closers.next(), if !self.closers.is_empty() => continue,
                _ = shutdown.recv() => Event::Shutdown,
            };

            match event {
                Event::Pump(from, PumpDone::Read(done)) => self.on_read(from, done),
                Event::Pump(from, PumpDone::Wrote(done)) => self.on_written(from, done),
                Event::Idle(side) => {
                    warn!("[#{}] {} idle timeout", self.id, side);
                    self.close_now(side);
                }
                Event::Shutdown => {
                    debug!("[#{}] Shutdown, closing both sides", self.id);
                    self.close_now(Side::Client);
                    self.close_now(Side::Server);
                }
            }
        }

        while self.closers.next().await.is_some() {}

        ShovelTotals {
            client_to_server: self.client.bytes_read,
            server_to_client: self.server.bytes_read,
        }
    }

    fn endpoint(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// The pump reading from `from`
    fn pump(&mut self, from: Side) -> &mut Pump {
        match from {
            Side::Client => &mut self.upload,
            Side::Server => &mut self.download,
        }
    }

    fn start_read(&mut self, from: Side) {
        let (ep, pump) = match from {
            Side::Client => (&mut self.client, &mut self.upload),
            Side::Server => (&mut self.server, &mut self.download),
        };
        if ep.closed || ep.closing {
            return;
        }
        let Some(mut reader) = ep.reader.take() else {
            return;
        };

        if !ep.pre_read.is_empty() {
            let data = ep.pre_read.split().freeze();
            trace!("[#{}] {} delivering {} buffered bytes", self.id, from, data.len());
            *pump = Pump::Reading(Box::pin(async move {
                ReadDone {
                    reader,
                    fresh: false,
                    result: Ok(data),
                }
            }));
            return;
        }

        let granted = self.quota.quota(from);
        let size = self.buffer_size.min(granted).max(1);
        let delay = if granted <= 1 {
            ep.delayed_loops = ep.delayed_loops.saturating_add(1);
            (ep.delayed_loops < self.quota_delay_loops).then_some(self.quota_delay)
        } else {
            ep.delayed_loops = 0;
            None
        };

        *pump = Pump::Reading(Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut buf = vec![0u8; size];
            let result = reader.read(&mut buf).await.map(|n| {
                buf.truncate(n);
                Bytes::from(buf)
            });
            ReadDone {
                reader,
                fresh: true,
                result,
            }
        }));
    }

    fn start_write(&mut self, from: Side, data: Bytes) {
        let (to, pump) = match from {
            Side::Client => (&mut self.server, &mut self.upload),
            Side::Server => (&mut self.client, &mut self.download),
        };
        let Some(mut writer) = to.writer.take() else {
            self.close_now(from);
            return;
        };

        *pump = Pump::Writing(Box::pin(async move {
            let len = data.len();
            let result: io::Result<usize> = async {
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(len)
            }
            .await;
            WriteDone { writer, result }
        }));
    }

    fn on_read(&mut self, from: Side, done: ReadDone) {
        let id = self.id;
        let ep = self.endpoint(from);
        if ep.closed {
            return;
        }
        ep.reader = Some(done.reader);

        match done.result {
            Ok(data) if !data.is_empty() => {
                let n = data.len();
                self.client.refresh_timeout();
                self.server.refresh_timeout();
                self.endpoint(from).bytes_read += n as u64;
                if done.fresh {
                    self.quota.consumed(from, n);
                }
                trace!("[#{}] {} read {} bytes", id, from, n);

                if !self.endpoint(from.peer()).is_open() {
                    self.close_now(from);
                    return;
                }
                self.start_write(from, data);
            }
            Ok(_) => {
                debug!("[#{}] {} closed its side", id, from);
                self.close_gracefully(from);
            }
            Err(e) => {
                debug!("[#{}] {} read failed: {}", id, from, e);
                self.close_now(from);
            }
        }
    }

    fn on_written(&mut self, from: Side, done: WriteDone) {
        let id = self.id;
        let to = from.peer();
        let ep = self.endpoint(to);
        if ep.closed {
            return;
        }
        ep.writer = Some(done.writer);

        match done.result {
            Ok(n) => {
                ep.dirty = true;
                ep.bytes_written += n as u64;
                ep.refresh_timeout();

                if ep.closing {
                    self.close_now(to);
                } else if !self.endpoint(from).is_open() {
                    self.close_gracefully(to);
                } else {
                    self.start_read(from);
                }
            }
            Err(e) => {
                debug!("[#{}] {} write failed: {}", id, to, e);
                self.close_now(to);
            }
        }
    }

    /// Close `side` once no write into it is in flight
    fn close_gracefully(&mut self, side: Side) {
        let write_pending = self.pump(side.peer()).is_writing();
        if self.endpoint(side).closed {
            return;
        }
        if !write_pending {
            self.close_now(side);
            return;
        }

        trace!("[#{}] {} close deferred until its write completes", self.id, side);
        self.endpoint(side).closing = true;
        let pump = self.pump(side);
        if pump.is_reading() {
            *pump = Pump::Idle;
        }
    }

    /// Close `side` at once, dropping its reads and the writes into it
    fn close_now(&mut self, side: Side) {
        let id = self.id;
        let ep = self.endpoint(side);
        if ep.closed {
            return;
        }
        let closer = ep.shut();
        debug!(
            "[#{}] {} closed (read {}, written {})",
            id, side, ep.bytes_read, ep.bytes_written
        );
        if let Some(closer) = closer {
            self.closers.push(closer);
        }

        let own = self.pump(side);
        if own.is_reading() {
            *own = Pump::Idle;
        }
        let into = self.pump(side.peer());
        if into.is_writing() {
            *into = Pump::Idle;
        }

        self.close_gracefully(side.peer());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::Unlimited;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    fn config() -> RelayConfig {
        RelayConfig::default()
    }

    fn endpoints(
        client_buf: usize,
        client_pre: &[u8],
        server_pre: &[u8],
    ) -> (Endpoint, DuplexStream, Endpoint, DuplexStream) {
        let cfg = config();
        let (client, client_peer) = tokio::io::duplex(client_buf);
        let (server, server_peer) = tokio::io::duplex(64 * 1024);
        (
            Endpoint::new(Side::Client, Box::new(client), client_pre, cfg.read_timeout()),
            client_peer,
            Endpoint::new(Side::Server, Box::new(server), server_pre, cfg.read_timeout()),
            server_peer,
        )
    }

    fn spawn_shovel(
        client: Endpoint,
        server: Endpoint,
        quota: Arc<dyn QuotaDelegate>,
    ) -> (tokio::task::JoinHandle<ShovelTotals>, broadcast::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let cfg = config();
        let handle = tokio::spawn(async move {
            Shovel::new(1, client, server, quota, &cfg)
                .run(&mut shutdown_rx)
                .await
        });
        (handle, shutdown_tx)
    }

    #[tokio::test]
    async fn test_relays_both_ways_with_buffered_bytes_first() {
        let (client, mut browser, server, mut origin) = endpoints(4096, b"early ", b"hello ");
        let (handle, _shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        browser.write_all(b"request").await.unwrap();
        let mut buf = vec![0u8; 13];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early request");

        origin.write_all(b"world").await.unwrap();
        let mut buf = vec![0u8; 11];
        browser.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        drop(browser);
        let mut rest = Vec::new();
        origin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let totals = handle.await.unwrap();
        assert_eq!(totals.client_to_server, 13);
        assert_eq!(totals.server_to_client, 11);
    }

    #[tokio::test]
    async fn test_server_eof_closes_client() {
        let (client, mut browser, server, origin) = endpoints(4096, b"", b"");
        let (handle, _shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        drop(origin);
        let mut rest = Vec::new();
        browser.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_waits_for_queued_write() {
        // The client buffer holds 64 bytes, so 200 bytes stay queued
        let (client, mut browser, server, mut origin) = endpoints(64, b"", b"");
        let (handle, _shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        origin.write_all(&[7u8; 200]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(origin);

        // Writing towards the vanished server fails and closes it
        browser.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![7u8; 200]);

        let totals = handle.await.unwrap();
        assert_eq!(totals.server_to_client, 200);
    }

    #[tokio::test]
    async fn test_server_eof_drains_queued_write_first() {
        // The client buffer holds 64 bytes, so most of the 200 stay queued
        let (client, mut browser, server, mut origin) = endpoints(64, b"", b"");
        let (handle, _shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        origin.write_all(&[9u8; 200]).await.unwrap();
        drop(origin);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![9u8; 200]);

        let totals = handle.await.unwrap();
        assert_eq!(totals.server_to_client, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_both() {
        let (client, mut browser, server, mut origin) = endpoints(4096, b"", b"");
        let (handle, _shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        let mut buf = Vec::new();
        browser.read_to_end(&mut buf).await.unwrap();
        origin.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_both() {
        let (client, mut browser, server, _origin) = endpoints(4096, b"", b"");
        let (handle, shutdown) = spawn_shovel(client, server, Arc::new(Unlimited));

        shutdown.send(()).unwrap();
        let mut buf = Vec::new();
        browser.read_to_end(&mut buf).await.unwrap();
        handle.await.unwrap();
    }

    /// Grants one byte at a time and records what was consumed
    #[derive(Default)]
    struct Starved {
        consumed: Mutex<Vec<(Side, usize)>>,
    }

    impl QuotaDelegate for Starved {
        fn quota(&self, _side: Side) -> usize {
            1
        }

        fn consumed(&self, side: Side, bytes: usize) {
            self.consumed.lock().push((side, bytes));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starved_quota_delays_reads() {
        let (client, mut browser, server, mut origin) = endpoints(4096, b"", b"");
        let quota = Arc::new(Starved::default());
        let (_handle, _shutdown) = spawn_shovel(client, server, quota.clone());

        let start = tokio::time::Instant::now();
        browser.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        origin.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"abc");
        assert!(start.elapsed() >= Duration::from_millis(900));
        let consumed = quota.consumed.lock().clone();
        assert_eq!(consumed, vec![(Side::Client, 1); 3]);
    }

    #[tokio::test]
    async fn test_starved_loop_count_saturates() {
        let (mut client, _browser, server, _origin) = endpoints(4096, b"", b"");
        client.delayed_loops = u32::MAX;
        let mut shovel = Shovel::new(1, client, server, Arc::new(Starved::default()), &config());

        shovel.start_read(Side::Client);
        assert_eq!(shovel.client.delayed_loops, u32::MAX);
        assert!(shovel.upload.is_reading());
    }
}
