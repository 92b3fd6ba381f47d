//! One relay: path finding, retry policy, commit and bail

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::app::metrics::{format_bytes, RelayMetrics};
use crate::common::{Candidate, Destination, Side, Stream, Transaction};
use crate::error::{Error, Result};
use crate::protocol::{connection_established, error_response};
use crate::quota::QuotaDelegate;
use crate::selector::SelectorEvent;

use super::cursor::DestinationCursor;
use super::endpoint::Endpoint;
use super::shovel::Shovel;
use super::subtask::{PendingSubtask, SubtaskOutcome};
use super::{Accepted, Relay, RelayReport, ServerConnection};

/// Where the relay goes after handling an event
enum Flow {
    Continue,
    Commit(Chosen),
    Bail(Error),
}

/// The path the relay commits to
struct Chosen {
    connection: ServerConnection,
    reused: bool,
}

enum Event {
    Subtask(SubtaskOutcome),
    Selector(SelectorEvent),
    Client(io::Result<usize>),
    Shutdown,
    Deadline,
}

pub(crate) struct Tunnel<'a> {
    relay: &'a Relay,
    id: u64,
    transaction: Transaction,
    client: Endpoint,
    cursor: DestinationCursor,
    subtask: PendingSubtask,
    attempts: usize,
    last_error: Option<Error>,
    /// Status of the last upstream answer seen
    last_status: Option<u16>,
    /// Set when retrying is forbidden whatever the other limits say
    ban_reason: Option<String>,
    /// The current path is the client's pinned connection
    using_pinned: bool,
    quota: Arc<dyn QuotaDelegate>,
    metrics: RelayMetrics,
    shutdown: broadcast::Receiver<()>,
    started: Instant,
}

impl<'a> Tunnel<'a> {
    pub fn new(relay: &'a Relay, id: u64, transaction: Transaction, client: Accepted) -> Self {
        let shutdown = relay.subscribe_shutdown();
        let quota = relay.quota.delegate(&transaction);
        let client = Endpoint::new(
            Side::Client,
            client.stream,
            &client.pre_read,
            relay.config.read_timeout(),
        );

        Self {
            relay,
            id,
            transaction,
            client,
            cursor: DestinationCursor::detached(),
            subtask: PendingSubtask::Idle,
            attempts: 0,
            last_error: None,
            last_status: None,
            ban_reason: None,
            using_pinned: false,
            quota,
            metrics: RelayMetrics::new(),
            shutdown,
            started: Instant::now(),
        }
    }

    pub async fn run(mut self) -> Result<RelayReport> {
        debug!(
            "[#{}] Relay {} -> {}",
            self.id, self.transaction.client, self.transaction.target
        );
        if self.relay.is_shutting_down() {
            return Err(self.bail(Error::Shutdown).await);
        }

        self.cursor = DestinationCursor::subscribe(self.relay.selector.as_ref(), &self.transaction);
        match self.find_path().await {
            Ok(chosen) => {
                let acknowledge = self.transaction.reply.expects_reply();
                self.commit(chosen, acknowledge).await
            }
            Err(error) => Err(self.bail(error).await),
        }
    }

    pub async fn run_switched(mut self, server: ServerConnection) -> Result<RelayReport> {
        debug!(
            "[#{}] Relay {} -> {} switched to {}",
            self.id, self.transaction.client, self.transaction.target, server.destination
        );
        if self.relay.is_shutting_down() {
            return Err(self.bail(Error::Shutdown).await);
        }
        let chosen = Chosen {
            connection: server,
            reused: false,
        };
        self.commit(chosen, false).await
    }

    /// Drive selection and setup stages until a path is chosen or the relay gives up
    async fn find_path(&mut self) -> Result<Chosen> {
        let deadline = tokio::time::sleep_until(self.forward_deadline().into());
        tokio::pin!(deadline);

        let mut flow = self.kick();
        loop {
            match flow {
                Flow::Continue => {}
                Flow::Commit(chosen) => return Ok(chosen),
                Flow::Bail(error) => return Err(error),
            }

            let watch_client =
                self.client.is_open() && self.client.pre_read.len() < self.relay.config.buffer_size;

            let event = tokio::select! {
                outcome = self.subtask.wait() => Event::Subtask(outcome),
                event = self.cursor.next_event() => Event::Selector(event),
                read = self.client.watch_closure(), if watch_client => Event::Client(read),
                _ = self.shutdown.recv() => Event::Shutdown,
                _ = &mut deadline => Event::Deadline,
            };

            flow = match event {
                Event::Subtask(outcome) => self.on_subtask(outcome),
                Event::Selector(event) => {
                    if let SelectorEvent::End(Some(e)) = &event {
                        debug!("[#{}] Selection ended: {}", self.id, e);
                    }
                    self.cursor.note(event);
                    Flow::Continue
                }
                Event::Client(Ok(n)) if n > 0 => {
                    trace!("[#{}] Client sent {} bytes early", self.id, n);
                    Flow::Continue
                }
                Event::Client(result) => {
                    if let Err(e) = result {
                        debug!("[#{}] Client read failed: {}", self.id, e);
                    }
                    drop(self.client.shut());
                    Flow::Bail(Error::ConnectionClosed)
                }
                Event::Shutdown => Flow::Bail(Error::Shutdown),
                Event::Deadline => {
                    debug!("[#{}] Forwarding timeout", self.id);
                    Flow::Bail(self.last_error.take().unwrap_or(Error::Timeout))
                }
            };

            if let Flow::Continue = flow {
                flow = self.kick();
            }
        }
    }

    /// Start on the next candidate if nothing is in flight
    fn kick(&mut self) -> Flow {
        loop {
            if !self.subtask.is_idle() {
                return Flow::Continue;
            }

            match self.cursor.pop() {
                Some(Candidate::Path(destination)) => {
                    self.using_pinned = false;
                    self.start_open(destination);
                    return Flow::Continue;
                }
                Some(Candidate::Pinned) => {
                    self.using_pinned = true;
                    self.count_attempts(1);
                    let flow = match self.relay.pinned.borrow_pinned(&self.transaction) {
                        Ok(pinned) => {
                            debug!("[#{}] Using pinned connection to {}", self.id, pinned.destination);
                            self.on_opened(pinned.destination, pinned.stream, true, pinned.secured)
                        }
                        Err(e) => self.on_failure(e),
                    };
                    if !matches!(flow, Flow::Continue) {
                        return flow;
                    }
                }
                None if self.cursor.is_finished() => {
                    return Flow::Bail(self.exhaustion_error());
                }
                None => return Flow::Continue,
            }
        }
    }

    fn on_subtask(&mut self, outcome: SubtaskOutcome) -> Flow {
        match outcome {
            SubtaskOutcome::Opened(outcome) => {
                self.count_attempts(outcome.attempts_used);
                match outcome.result {
                    Ok(opened) => {
                        debug!(
                            "[#{}] Connected to {}{}",
                            self.id,
                            opened.destination,
                            if opened.reused { " (reused)" } else { "" }
                        );
                        self.on_opened(opened.destination, opened.stream, opened.reused, false)
                    }
                    Err(e) => self.on_failure(e),
                }
            }
            SubtaskOutcome::Secured {
                destination,
                reused,
                result,
            } => match result {
                Ok(stream) => {
                    debug!("[#{}] Secured {}", self.id, destination);
                    self.on_secured(destination, stream, reused)
                }
                Err(e) => self.on_failure(e),
            },
            SubtaskOutcome::Handshaken {
                destination,
                reused,
                result,
            } => match result {
                Ok(handshaken) => {
                    debug!(
                        "[#{}] {} accepted CONNECT ({})",
                        self.id, destination, handshaken.status
                    );
                    self.last_status = Some(handshaken.status);
                    Flow::Commit(Chosen {
                        connection: ServerConnection {
                            stream: handshaken.stream,
                            destination,
                            leftover: handshaken.leftover,
                        },
                        reused,
                    })
                }
                Err(e) => self.on_failure(e),
            },
        }
    }

    fn on_opened(&mut self, destination: Destination, stream: Stream, reused: bool, secured: bool) -> Flow {
        if destination.encrypted && !secured {
            self.start_encrypting(destination, stream, reused);
            return Flow::Continue;
        }
        self.on_secured(destination, stream, reused)
    }

    fn on_secured(&mut self, destination: Destination, stream: Stream, reused: bool) -> Flow {
        if destination.is_peer() {
            self.start_handshake(destination, stream, reused);
            return Flow::Continue;
        }
        Flow::Commit(Chosen {
            connection: ServerConnection {
                stream,
                destination,
                leftover: Bytes::new(),
            },
            reused,
        })
    }

    fn start_open(&mut self, destination: Destination) {
        let opener = Arc::clone(&self.relay.opener);
        let timeout = self.stage_timeout();
        debug!(
            "[#{}] Trying {} (attempt {}/{})",
            self.id,
            destination,
            self.attempts + 1,
            self.relay.config.max_attempts
        );
        self.subtask = PendingSubtask::Opening(Box::pin(async move {
            opener.open(std::slice::from_ref(&destination), timeout).await
        }));
    }

    fn start_encrypting(&mut self, destination: Destination, stream: Stream, reused: bool) {
        let encryptor = Arc::clone(&self.relay.encryptor);
        let timeout = self.stage_timeout();
        let target = destination.clone();
        debug!("[#{}] TLS with {}", self.id, destination);
        self.subtask = PendingSubtask::Encrypting {
            destination,
            reused,
            future: Box::pin(async move {
                match tokio::time::timeout(timeout, encryptor.secure(stream, &target)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                }
            }),
        };
    }

    fn start_handshake(&mut self, destination: Destination, stream: Stream, reused: bool) {
        let handshake = Arc::clone(&self.relay.handshake);
        let timeout = self.stage_timeout();
        let peer = destination.clone();
        let target = self.transaction.target.clone();
        debug!("[#{}] CONNECT {} via {}", self.id, target, destination);
        self.subtask = PendingSubtask::Handshaking {
            destination,
            reused,
            future: Box::pin(async move {
                match tokio::time::timeout(timeout, handshake.handshake(stream, &peer, &target)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                }
            }),
        };
    }

    /// Record a failed setup stage and decide whether another path may be tried
    fn on_failure(&mut self, error: Error) -> Flow {
        debug!("[#{}] Attempt {} failed: {}", self.id, self.attempts, error);
        if let Some(status) = error.upstream_status() {
            self.last_status = Some(status);
        }
        if self.using_pinned && self.ban_reason.is_none() {
            self.ban_reason = Some("pinned connection failed".to_string());
        }

        match self.retry_refusal() {
            Some(reason) => {
                debug!("[#{}] Not retrying: {}", self.id, reason);
                Flow::Bail(error)
            }
            None => {
                self.last_error = Some(error);
                Flow::Continue
            }
        }
    }

    /// Why another attempt is not allowed, if it is not
    fn retry_refusal(&self) -> Option<String> {
        let config = &self.relay.config;

        if self.relay.is_shutting_down() {
            return Some("shutting down".to_string());
        }
        if self.attempts >= config.max_attempts {
            return Some(format!("{} attempts made", self.attempts));
        }
        if Instant::now() >= self.forward_deadline() {
            return Some("forwarding timeout".to_string());
        }
        if let Some(reason) = &self.ban_reason {
            return Some(reason.clone());
        }
        // No server side exists before commit, so the client is the last one open
        if !self.client.is_open() {
            return Some("both sides closed".to_string());
        }
        if let Some(status) = self.last_status.filter(|s| config.is_non_retriable(*s)) {
            return Some(format!("upstream status {} is final", status));
        }
        None
    }

    fn exhaustion_error(&mut self) -> Error {
        debug!("[#{}] Out of paths ({} noted)", self.id, self.cursor.noted());
        if let Some(error) = self.last_error.take() {
            return error;
        }
        if let Some(error) = self.cursor.take_selection_error() {
            return error;
        }
        Error::NoPaths
    }

    fn count_attempts(&mut self, used: usize) {
        self.metrics.record_attempts(used);
        self.attempts = (self.attempts + used).min(self.relay.config.max_attempts);
    }

    fn forward_deadline(&self) -> Instant {
        self.transaction.started + self.relay.config.forward_timeout()
    }

    /// Time allowed for the next setup stage
    fn stage_timeout(&self) -> Duration {
        let remaining = self
            .forward_deadline()
            .saturating_duration_since(Instant::now());
        self.relay.config.connect_timeout().min(remaining)
    }

    /// Attach the server, acknowledge if owed, then shovel until both sides close
    async fn commit(mut self, chosen: Chosen, acknowledge: bool) -> Result<RelayReport> {
        self.subtask.cancel();
        self.cursor.unsubscribe();

        let Chosen { connection, reused } = chosen;
        let ServerConnection {
            stream,
            destination,
            leftover,
        } = connection;

        let path = if self.using_pinned {
            "pinned"
        } else if destination.is_peer() {
            "peer"
        } else {
            "origin"
        };
        self.metrics.record_commit(path);
        info!(
            "[#{}] {} -> {} via {} (attempts: {})",
            self.id, self.transaction.client, self.transaction.target, destination, self.attempts
        );

        let relay = self.relay;
        let config = &relay.config;
        let mut server = Endpoint::new(Side::Server, stream, &leftover, config.read_timeout());

        if acknowledge {
            let written = tokio::time::timeout(
                config.connect_timeout(),
                self.client.write_whole(connection_established()),
            )
            .await;
            let failure = match written {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Error::Io(e)),
                Err(_) => Some(Error::Timeout),
            };
            if let Some(error) = failure {
                warn!("[#{}] Could not acknowledge the tunnel: {}", self.id, error);
                self.client.close().await;
                server.close().await;
                return Err(error);
            }
        }

        let shovel = Shovel::new(self.id, self.client, server, self.quota, config);
        let totals = shovel.run(&mut self.shutdown).await;
        self.metrics
            .record_bytes(totals.client_to_server, totals.server_to_client);

        let duration = self.started.elapsed();
        info!(
            "[#{}] Closed: {} -> {} (↑{} ↓{} {:?})",
            self.id,
            self.transaction.client,
            self.transaction.target,
            format_bytes(totals.client_to_server),
            format_bytes(totals.server_to_client),
            duration
        );

        Ok(RelayReport {
            id: self.id,
            destination,
            attempts: self.attempts,
            reused,
            client_to_server: totals.client_to_server,
            server_to_client: totals.server_to_client,
            duration,
        })
    }

    /// Give up: answer the client if it still may be answered, then close it
    async fn bail(&mut self, error: Error) -> Error {
        self.subtask.cancel();
        self.cursor.unsubscribe();
        self.metrics.record_bail(bail_label(&error));
        warn!(
            "[#{}] {} -> {} failed after {} attempts: {}",
            self.id, self.transaction.client, self.transaction.target, self.attempts, error
        );

        if self.client.is_open() && !self.client.dirty && self.transaction.reply.expects_reply() {
            let reply = error_response(&error);
            let written = tokio::time::timeout(
                self.relay.config.connect_timeout(),
                self.client.write_whole(&reply),
            )
            .await;
            if !matches!(written, Ok(Ok(()))) {
                debug!("[#{}] Error reply not delivered", self.id);
            }
        }
        self.client.close().await;
        error
    }
}

fn bail_label(error: &Error) -> &'static str {
    match error {
        Error::NoPaths => "no_paths",
        Error::Timeout => "timeout",
        Error::Shutdown => "shutdown",
        Error::ConnectionClosed => "client_closed",
        Error::PeerRefused { .. } => "peer_refused",
        Error::Resolve(_) => "resolve",
        _ => "connect_failed",
    }
}
