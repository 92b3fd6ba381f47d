//! Configured selector - pinned connection, peers, then origin addresses

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{Address, Destination, Transaction};
use crate::error::{Error, Result};
use crate::transport::PinnedPool;

use super::{DestinationSelector, DestinationSink};

/// Selector driven by configuration
///
/// Order of candidates:
/// 1. the connection pinned to the client, if one is stored
/// 2. configured peers (after the origin addresses when `prefer_direct`)
/// 3. origin addresses from DNS, each reported as soon as it is known
pub struct ConfiguredSelector {
    peers: Vec<Destination>,
    direct: bool,
    prefer_direct: bool,
    pinned: Option<Arc<PinnedPool>>,
}

impl ConfiguredSelector {
    pub fn new(peers: Vec<Destination>, direct: bool) -> Self {
        Self {
            peers,
            direct,
            prefer_direct: false,
            pinned: None,
        }
    }

    /// Builder: try origin addresses before peers
    pub fn with_prefer_direct(mut self, prefer_direct: bool) -> Self {
        self.prefer_direct = prefer_direct;
        self
    }

    /// Builder: offer pinned connections stored in `pool`
    pub fn with_pinned(mut self, pool: Arc<PinnedPool>) -> Self {
        self.pinned = Some(pool);
        self
    }
}

impl DestinationSelector for ConfiguredSelector {
    fn begin(&self, transaction: &Transaction, sink: DestinationSink) {
        if let Some(pool) = &self.pinned {
            if pool.is_pinned(&transaction.client) {
                debug!("Selector: {} has a pinned connection", transaction.client);
                sink.note_pinned();
            }
        }

        if !self.direct {
            for peer in &self.peers {
                sink.note_destination(peer.clone());
            }
            sink.note_destinations_end(None);
            return;
        }

        let peers = self.peers.clone();
        let prefer_direct = self.prefer_direct;
        let target = transaction.target.clone();

        tokio::spawn(async move {
            if !prefer_direct {
                for peer in &peers {
                    sink.note_destination(peer.clone());
                }
            }

            let resolved = note_origins(&sink, &target).await;

            if prefer_direct {
                for peer in &peers {
                    sink.note_destination(peer.clone());
                }
            }

            match resolved {
                Err(e) if peers.is_empty() => sink.note_destinations_end(Some(e)),
                Err(e) => {
                    warn!("Selector: {}, continuing with peers only", e);
                    sink.note_destinations_end(None);
                }
                Ok(_) => sink.note_destinations_end(None),
            }
        });
    }
}

/// Report every origin address of `target`; returns how many were found
async fn note_origins(sink: &DestinationSink, target: &Address) -> Result<usize> {
    let (host, port) = match target {
        Address::Socket(_) => {
            sink.note_destination(Destination::origin(target.clone()));
            return Ok(1);
        }
        Address::Domain(host, port) => (host.as_str(), *port),
    };

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?;

    let mut count = 0;
    for addr in addrs {
        if sink.is_closed() {
            break;
        }
        sink.note_destination(Destination::origin(Address::Socket(addr)));
        count += 1;
    }

    if count == 0 {
        return Err(Error::Resolve(format!("{}: no addresses", host)));
    }
    debug!("Selector: {} resolved to {} addresses", host, count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Candidate;
    use crate::selector::SelectorEvent;
    use crate::transport::PinnedConnection;

    async fn collect(selector: &ConfiguredSelector, tx: &Transaction) -> (Vec<Candidate>, Option<Error>) {
        let (sink, mut rx) = DestinationSink::channel();
        selector.begin(tx, sink);

        let mut candidates = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SelectorEvent::Candidate(c) => candidates.push(c),
                SelectorEvent::End(err) => return (candidates, err),
            }
        }
        panic!("selector never ended");
    }

    fn tx(target: Address) -> Transaction {
        Transaction::connect(Address::Socket("127.0.0.1:40000".parse().unwrap()), target)
    }

    #[tokio::test]
    async fn test_peers_then_origin() {
        let peer = Destination::peer("parent", Address::domain("proxy.local", 3128));
        let selector = ConfiguredSelector::new(vec![peer.clone()], true);
        let origin: Address = Address::Socket("10.0.0.1:443".parse().unwrap());

        let (candidates, err) = collect(&selector, &tx(origin.clone())).await;
        assert!(err.is_none());
        assert_eq!(
            candidates,
            vec![
                Candidate::Path(peer),
                Candidate::Path(Destination::origin(origin))
            ]
        );
    }

    #[tokio::test]
    async fn test_prefer_direct() {
        let peer = Destination::peer("parent", Address::domain("proxy.local", 3128));
        let selector = ConfiguredSelector::new(vec![peer.clone()], true).with_prefer_direct(true);
        let origin: Address = Address::Socket("10.0.0.1:443".parse().unwrap());

        let (candidates, _) = collect(&selector, &tx(origin.clone())).await;
        assert_eq!(candidates[0], Candidate::Path(Destination::origin(origin)));
        assert_eq!(candidates[1], Candidate::Path(peer));
    }

    #[tokio::test]
    async fn test_no_direct_no_peers_is_empty() {
        let selector = ConfiguredSelector::new(vec![], false);
        let (candidates, err) = collect(&selector, &tx(Address::domain("example.com", 443))).await;
        assert!(candidates.is_empty());
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let selector = ConfiguredSelector::new(vec![], true);
        let (candidates, err) = collect(&selector, &tx(Address::domain("localhost", 8080))).await;
        assert!(err.is_none());
        assert!(!candidates.is_empty());
        for candidate in candidates {
            match candidate {
                Candidate::Path(dest) => assert_eq!(dest.address.port(), 8080),
                Candidate::Pinned => panic!("unexpected pinned candidate"),
            }
        }
    }

    #[tokio::test]
    async fn test_pinned_offered_first() {
        let pool = Arc::new(PinnedPool::default());
        let transaction = tx(Address::Socket("10.0.0.1:443".parse().unwrap()));
        let (stream, _peer) = tokio::io::duplex(64);
        pool.pin(
            transaction.client.clone(),
            PinnedConnection {
                stream: Box::new(stream),
                destination: Destination::origin(transaction.target.clone()),
                secured: false,
            },
        );

        let selector = ConfiguredSelector::new(vec![], true).with_pinned(pool);
        let (candidates, _) = collect(&selector, &transaction).await;
        assert_eq!(candidates[0], Candidate::Pinned);
    }
}
