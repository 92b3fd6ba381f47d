//! Token-bucket bandwidth shaping keyed by client IP

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::common::{Side, Transaction};
use crate::config::QuotaConfig;

use super::{QuotaDelegate, QuotaPolicy, Unlimited};

/// Byte bucket refilled continuously at `rate` bytes per second.
///
/// Tokens may go negative: a read is granted at least one byte, and the
/// overshoot is paid back by later refills.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_update = now;
    }
}

/// Limits of one direction; a zero rate disables shaping for it
#[derive(Debug, Clone, Copy)]
struct Limit {
    rate: f64,
    capacity: f64,
}

impl Limit {
    fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }
}

/// Buckets of one client, one per side read from
#[derive(Debug)]
pub struct ClientQuota {
    client: Limit,
    server: Limit,
    from_client: Mutex<TokenBucket>,
    from_server: Mutex<TokenBucket>,
}

impl ClientQuota {
    fn new(client: Limit, server: Limit) -> Self {
        Self {
            client,
            server,
            from_client: Mutex::new(TokenBucket::new(client.capacity)),
            from_server: Mutex::new(TokenBucket::new(server.capacity)),
        }
    }

    fn side(&self, side: Side) -> (&Limit, &Mutex<TokenBucket>) {
        match side {
            Side::Client => (&self.client, &self.from_client),
            Side::Server => (&self.server, &self.from_server),
        }
    }
}

impl QuotaDelegate for ClientQuota {
    fn quota(&self, side: Side) -> usize {
        let (limit, bucket) = self.side(side);
        if limit.is_unlimited() {
            return usize::MAX;
        }

        let mut bucket = bucket.lock();
        bucket.refill(limit.rate, limit.capacity);
        if bucket.tokens < 1.0 {
            1
        } else {
            bucket.tokens as usize
        }
    }

    fn consumed(&self, side: Side, bytes: usize) {
        let (limit, bucket) = self.side(side);
        if limit.is_unlimited() {
            return;
        }
        let mut bucket = bucket.lock();
        bucket.refill(limit.rate, limit.capacity);
        bucket.tokens -= bytes as f64;
    }
}

/// Shares one `ClientQuota` between all relays of the same client IP
pub struct TokenBucketPolicy {
    client: Limit,
    server: Limit,
    clients: Mutex<LruCache<IpAddr, Arc<ClientQuota>>>,
}

impl TokenBucketPolicy {
    pub fn new(config: &QuotaConfig) -> Self {
        let burst = config.burst.max(1) as f64;
        let capacity = NonZeroUsize::new(config.max_tracked_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            client: Limit {
                rate: config.client_rate as f64,
                capacity: burst,
            },
            server: Limit {
                rate: config.server_rate as f64,
                capacity: burst,
            },
            clients: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of clients currently tracked
    pub fn tracked(&self) -> usize {
        self.clients.lock().len()
    }
}

impl QuotaPolicy for TokenBucketPolicy {
    fn delegate(&self, transaction: &Transaction) -> Arc<dyn QuotaDelegate> {
        let Some(addr) = transaction.client.as_socket() else {
            trace!("Quota: {} has no IP, not shaped", transaction.client);
            return Arc::new(Unlimited);
        };

        let mut clients = self.clients.lock();
        let quota = clients
            .get_or_insert(addr.ip(), || Arc::new(ClientQuota::new(self.client, self.server)))
            .clone();
        quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    fn config(client_rate: u64, server_rate: u64, burst: u64) -> QuotaConfig {
        QuotaConfig {
            client_rate,
            server_rate,
            burst,
            max_tracked_clients: 2,
        }
    }

    fn tx(client: &str) -> Transaction {
        Transaction::connect(
            Address::Socket(client.parse().unwrap()),
            Address::domain("example.com", 443),
        )
    }

    #[test]
    fn test_burst_then_starved() {
        let policy = TokenBucketPolicy::new(&config(1, 0, 1000));
        let quota = policy.delegate(&tx("10.0.0.1:5000"));

        assert_eq!(quota.quota(Side::Client), 1000);
        quota.consumed(Side::Client, 1000);
        assert_eq!(quota.quota(Side::Client), 1);

        // Unshaped direction
        assert_eq!(quota.quota(Side::Server), usize::MAX);
    }

    #[test]
    fn test_same_ip_shares_buckets() {
        let policy = TokenBucketPolicy::new(&config(1, 1, 100));
        let a = policy.delegate(&tx("10.0.0.1:5000"));
        let b = policy.delegate(&tx("10.0.0.1:5001"));

        a.consumed(Side::Server, 100);
        assert_eq!(b.quota(Side::Server), 1);
        assert_eq!(policy.tracked(), 1);
    }

    #[test]
    fn test_lru_bounds_tracked_clients() {
        let policy = TokenBucketPolicy::new(&config(1, 1, 100));
        for i in 1..=5 {
            policy.delegate(&tx(&format!("10.0.0.{}:5000", i)));
        }
        assert_eq!(policy.tracked(), 2);
    }

    #[test]
    fn test_domain_client_is_not_shaped() {
        let policy = TokenBucketPolicy::new(&config(1, 1, 100));
        let tx = Transaction::connect(
            Address::domain("client.local", 5000),
            Address::domain("example.com", 443),
        );
        let quota = policy.delegate(&tx);

        quota.consumed(Side::Client, 1000);
        assert_eq!(quota.quota(Side::Client), usize::MAX);
        assert_eq!(policy.tracked(), 0);
    }

    #[test]
    fn test_unlimited() {
        let quota = Unlimited.delegate(&tx("10.0.0.1:5000"));
        quota.consumed(Side::Client, 1 << 20);
        assert_eq!(quota.quota(Side::Client), usize::MAX);
    }
}
