//! Runtime - configuration-driven relay service
//!
//! The runtime is responsible for:
//! - Building the relay and its collaborators from configuration
//! - Accepting CONNECT requests and handing them to the relay
//! - Periodic statistics and shutdown on Ctrl+C

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::common::{IntoStream, Result, Transaction};
use crate::config::Config;
use crate::error::Error;
use crate::protocol::{bad_request, method_not_allowed, read_connect_request};
use crate::quota::TokenBucketPolicy;
use crate::relay::{Accepted, Relay};
use crate::selector::ConfiguredSelector;
use crate::session::TlsEncryptor;
use crate::transport::PinnedPool;

use super::metrics::{self, format_bytes};

/// The running proxy: one listener feeding one relay service
pub struct Runtime {
    listen: SocketAddr,
    relay: Arc<Relay>,
    pinned: Arc<PinnedPool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Create runtime from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let pinned = Arc::new(PinnedPool::new(config.relay.pinned_idle()));
        let selector = ConfiguredSelector::new(config.peer_destinations(), config.direct)
            .with_prefer_direct(config.prefer_direct)
            .with_pinned(pinned.clone());

        let mut builder = Relay::builder(config.relay.clone(), Arc::new(selector))
            .encryptor(Arc::new(TlsEncryptor::new(&config.tls)?))
            .pinned(pinned.clone());
        if let Some(quota) = &config.quota {
            debug!(
                "Quota: client {} B/s, server {} B/s, burst {} B",
                quota.client_rate, quota.server_rate, quota.burst
            );
            builder = builder.quota(Arc::new(TokenBucketPolicy::new(quota)));
        }

        info!(
            "Runtime: {} peers, direct {}",
            config.peers.len(),
            if config.direct { "allowed" } else { "disabled" }
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listen: config.listen,
            relay: Arc::new(builder.build()?),
            pinned,
            shutdown_tx,
        })
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Run the runtime until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("Listening on {}", listener.local_addr()?);

        let relay = self.relay.clone();
        let mut accept_shutdown_rx = self.shutdown_tx.subscribe();
        let accept_handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, relay, &mut accept_shutdown_rx).await {
                error!("Listener error: {}", e);
            }
        });

        let pinned = self.pinned.clone();
        let mut stats_shutdown_rx = self.shutdown_tx.subscribe();
        let stats_handle = tokio::spawn(async move {
            stats_reporter(pinned, &mut stats_shutdown_rx).await;
        });

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        self.relay.shutdown();
        let _ = self.shutdown_tx.send(());

        let _ = accept_handle.await;
        let _ = stats_handle.await;
        log_stats(&self.pinned);

        Ok(())
    }
}

/// Accept connections until shutdown; each one is served in its own task
pub(crate) async fn serve(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        debug!("New connection #{} from {}", conn_id, source);

                        let relay = relay.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(relay, stream, source).await {
                                debug!("Connection #{} from {} ended: {}", conn_id, source, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Listener stopped (handled {} connections)", conn_count);
                break;
            }
        }
    }

    Ok(())
}

/// Read the CONNECT head and relay the rest of the connection
async fn handle_connection(relay: Arc<Relay>, stream: TcpStream, source: SocketAddr) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut stream = stream.into_stream();
    let request = read_connect_request(&mut stream).await?;

    if !request.is_connect() {
        stream.write_all(&method_not_allowed(&request.method)).await?;
        let _ = stream.shutdown().await;
        return Err(Error::Protocol(format!(
            "{} {} is not a tunnel request",
            request.method, request.authority
        )));
    }

    let target = match request.target() {
        Ok(target) => target,
        Err(e) => {
            stream.write_all(&bad_request(&e)).await?;
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let transaction = Transaction::connect(source.into(), target);
    let accepted = Accepted::new(stream).with_pre_read(request.leftover);
    relay.start_relay(transaction, accepted).await.map(|_| ())
}

/// Stats reporter task - logs stats periodically and on SIGUSR1
#[cfg(unix)]
async fn stats_reporter(pinned: Arc<PinnedPool>, shutdown_rx: &mut broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(sigusr1) => Some(sigusr1),
        Err(e) => {
            debug!("SIGUSR1 handler unavailable: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            _ = interval.tick() => {
                pinned.cleanup();
                log_stats(&pinned);
            }
            Some(_) = async { sigusr1.as_mut()?.recv().await } => {
                info!("Received SIGUSR1, printing relay statistics...");
                log_stats(&pinned);
                debug!("Metrics:\n{}", metrics::render());
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Stats reporter task - logs stats periodically (non-Unix)
#[cfg(not(unix))]
async fn stats_reporter(pinned: Arc<PinnedPool>, shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                pinned.cleanup();
                log_stats(&pinned);
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

fn log_stats(pinned: &PinnedPool) {
    let stats = metrics::summary();
    info!(
        "Stats: {} relays ({} active), ↑{} ↓{}, {} pinned",
        stats.total,
        stats.active,
        format_bytes(stats.upload),
        format_bytes(stats.download),
        pinned.len()
    );
}
