//! Sharded upstream client
//!
//! A [`ShardedClient`] presents the same interface as a single upstream
//! client while delegating each connection request to one of several child
//! clients according to a load balancing policy. Policies are a closed set
//! of variants, each carrying exactly the state it needs.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::prelude::IndexedRandom;

use crate::client::{Client, ClientStats};
use crate::error::{Error, Result};
use crate::pool::PooledConn;

/// The minimum time after a client error before its backoff history is
/// forgotten. A client that fails again within this window has its
/// quarantine doubled instead of restarted.
const FAILED_CLIENT_EXPIRY: Duration = Duration::from_secs(30);

/// The quarantine duration applied to a client's first failure.
const INITIAL_ERROR_EXPIRY: Duration = Duration::from_millis(100);

/// The load balancing decision policy to apply when proxying requests
/// through a sharded network client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingPolicy {
    /// Statefully iterates through each client on every connection request.
    #[default]
    RoundRobin,
    /// Selects a client at random to provide the connection.
    Random,
    /// Selects the client that has, up until the time of request, provided
    /// the fewest successful connections.
    HistoricalConnections,
    /// Randomly selects among clients not currently quarantined by failure,
    /// backing failed clients off exponentially.
    Availability,
    /// Provides connections from clients in serial priority order, failing
    /// over to secondary clients only when the primary fails.
    Failover,
}

impl fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingPolicy::RoundRobin => "RoundRobin",
            LoadBalancingPolicy::Random => "Random",
            LoadBalancingPolicy::HistoricalConnections => "HistoricalConnections",
            LoadBalancingPolicy::Availability => "Availability",
            LoadBalancingPolicy::Failover => "Failover",
        };
        write!(f, "{name}")
    }
}

impl FromStr for LoadBalancingPolicy {
    type Err = Error;

    /// Parses a policy name case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "roundrobin" => Ok(LoadBalancingPolicy::RoundRobin),
            "random" => Ok(LoadBalancingPolicy::Random),
            "historicalconnections" => Ok(LoadBalancingPolicy::HistoricalConnections),
            "availability" => Ok(LoadBalancingPolicy::Availability),
            "failover" => Ok(LoadBalancingPolicy::Failover),
            _ => Err(Error::UnknownPolicy(s.to_string())),
        }
    }
}

/// Per-client failure tracking for the availability policy.
#[derive(Debug, Clone, Copy, Default)]
struct BackoffState {
    /// When the client last errored; `None` if it never has.
    last_error: Option<Instant>,
    /// How long after `last_error` the client stays out of the eligible set.
    error_expiry: Duration,
}

enum PolicyState {
    RoundRobin { cursor: AtomicUsize },
    Random,
    HistoricalConnections,
    Availability { states: RwLock<Vec<BackoffState>> },
    Failover,
}

/// A virtual client that manages several child clients, supplying
/// connections in accordance with a load balancing policy.
pub struct ShardedClient {
    clients: Vec<Arc<dyn Client>>,
    policy: PolicyState,
}

impl ShardedClient {
    /// Creates a sharded client over the given child clients.
    pub fn new(clients: Vec<Arc<dyn Client>>, policy: LoadBalancingPolicy) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::Client(
                "sharded client requires at least one upstream client".into(),
            ));
        }

        let policy = match policy {
            LoadBalancingPolicy::RoundRobin => PolicyState::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            LoadBalancingPolicy::Random => PolicyState::Random,
            LoadBalancingPolicy::HistoricalConnections => PolicyState::HistoricalConnections,
            LoadBalancingPolicy::Availability => PolicyState::Availability {
                states: RwLock::new(vec![BackoffState::default(); clients.len()]),
            },
            LoadBalancingPolicy::Failover => PolicyState::Failover,
        };

        Ok(Self { clients, policy })
    }

    async fn round_robin(&self, cursor: &AtomicUsize) -> Result<PooledConn> {
        // Benign cursor races only skew fairness, never correctness.
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[idx].conn().await
    }

    async fn random(&self) -> Result<PooledConn> {
        let client = self
            .clients
            .choose(&mut rand::rng())
            .expect("clients is non-empty");
        client.conn().await
    }

    async fn historical_connections(&self) -> Result<PooledConn> {
        let mut selected = &self.clients[0];

        for candidate in &self.clients[1..] {
            if candidate.stats().successful < selected.stats().successful {
                selected = candidate;
            }
        }

        selected.conn().await
    }

    async fn availability(&self, states: &RwLock<Vec<BackoffState>>) -> Result<PooledConn> {
        loop {
            let candidate = {
                let states = states.read().unwrap();
                let eligible: Vec<usize> = states
                    .iter()
                    .enumerate()
                    .filter(|(_, state)| match state.last_error {
                        None => true,
                        Some(at) => at.elapsed() > state.error_expiry,
                    })
                    .map(|(idx, _)| idx)
                    .collect();

                if eligible.is_empty() {
                    return Err(Error::NoLiveClients);
                }

                *eligible
                    .choose(&mut rand::rng())
                    .expect("eligible set is non-empty")
            };

            match self.clients[candidate].conn().await {
                Ok(conn) => return Ok(conn),
                Err(_) => {
                    let mut states = states.write().unwrap();
                    let state = &mut states[candidate];

                    state.error_expiry = match state.last_error {
                        // A repeat failure in quick succession doubles the
                        // current quarantine.
                        Some(at) if at.elapsed() <= FAILED_CLIENT_EXPIRY => state.error_expiry * 2,
                        // First failure, or the last one is far enough in
                        // the past to start over.
                        _ => INITIAL_ERROR_EXPIRY,
                    };
                    state.last_error = Some(Instant::now());

                    // Retry across the remaining eligible clients; the
                    // just-failed client has quarantined itself out.
                }
            }
        }
    }

    async fn failover(&self) -> Result<PooledConn> {
        for client in &self.clients {
            if let Ok(conn) = client.conn().await {
                return Ok(conn);
            }
        }

        Err(Error::AllClientsFailed)
    }

    #[cfg(test)]
    fn backoff_state(&self, idx: usize) -> (Option<Instant>, Duration) {
        match &self.policy {
            PolicyState::Availability { states } => {
                let state = states.read().unwrap()[idx];
                (state.last_error, state.error_expiry)
            }
            _ => panic!("not an availability-sharded client"),
        }
    }
}

#[async_trait]
impl Client for ShardedClient {
    async fn conn(&self) -> Result<PooledConn> {
        match &self.policy {
            PolicyState::RoundRobin { cursor } => self.round_robin(cursor).await,
            PolicyState::Random => self.random().await,
            PolicyState::HistoricalConnections => self.historical_connections().await,
            PolicyState::Availability { states } => self.availability(states).await,
            PolicyState::Failover => self.failover().await,
        }
    }

    fn stats(&self) -> ClientStats {
        let mut aggregated = ClientStats::default();

        for client in &self.clients {
            let stats = client.stats();
            aggregated.successful += stats.successful;
            aggregated.failed += stats.failed;
        }

        aggregated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClient;

    fn sharded(
        clients: Vec<Arc<MockClient>>,
        policy: LoadBalancingPolicy,
    ) -> ShardedClient {
        let clients: Vec<Arc<dyn Client>> = clients
            .into_iter()
            .map(|c| c as Arc<dyn Client>)
            .collect();
        ShardedClient::new(clients, policy).unwrap()
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            "roundrobin".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::RoundRobin
        );
        assert_eq!(
            "RANDOM".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::Random
        );
        assert_eq!(
            "HistoricalConnections".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::HistoricalConnections
        );
        assert_eq!(
            "availability".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::Availability
        );
        assert_eq!(
            "Failover".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::Failover
        );
    }

    #[test]
    fn parse_rejects_unknown_policy() {
        assert!(matches!(
            "leastconn".parse::<LoadBalancingPolicy>(),
            Err(Error::UnknownPolicy(_))
        ));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for policy in [
            LoadBalancingPolicy::RoundRobin,
            LoadBalancingPolicy::Random,
            LoadBalancingPolicy::HistoricalConnections,
            LoadBalancingPolicy::Availability,
            LoadBalancingPolicy::Failover,
        ] {
            assert_eq!(policy.to_string().parse::<LoadBalancingPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn empty_client_list_is_rejected() {
        assert!(ShardedClient::new(Vec::new(), LoadBalancingPolicy::RoundRobin).is_err());
    }

    #[tokio::test]
    async fn round_robin_cycles_in_order() {
        let clients = vec![
            Arc::new(MockClient::succeeding()),
            Arc::new(MockClient::succeeding()),
            Arc::new(MockClient::succeeding()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::RoundRobin);

        sharded.conn().await.unwrap();
        assert_eq!(
            (clients[0].attempts(), clients[1].attempts(), clients[2].attempts()),
            (1, 0, 0)
        );

        sharded.conn().await.unwrap();
        sharded.conn().await.unwrap();
        sharded.conn().await.unwrap();
        assert_eq!(
            (clients[0].attempts(), clients[1].attempts(), clients[2].attempts()),
            (2, 1, 1)
        );
    }

    #[tokio::test]
    async fn random_eventually_reaches_every_client() {
        let clients = vec![
            Arc::new(MockClient::succeeding()),
            Arc::new(MockClient::succeeding()),
            Arc::new(MockClient::succeeding()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Random);

        for _ in 0..100 {
            sharded.conn().await.unwrap();
        }

        for client in &clients {
            assert!(client.attempts() > 0);
        }
    }

    #[tokio::test]
    async fn historical_connections_picks_fewest_successful() {
        let clients = vec![
            Arc::new(MockClient::succeeding().with_successful(5)),
            Arc::new(MockClient::succeeding().with_successful(2)),
            Arc::new(MockClient::succeeding().with_successful(7)),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::HistoricalConnections);

        sharded.conn().await.unwrap();
        assert_eq!(clients[1].attempts(), 1);
        assert_eq!(clients[0].attempts() + clients[2].attempts(), 0);
    }

    #[tokio::test]
    async fn historical_connections_breaks_ties_by_list_order() {
        let clients = vec![
            Arc::new(MockClient::succeeding().with_successful(3)),
            Arc::new(MockClient::succeeding().with_successful(3)),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::HistoricalConnections);

        sharded.conn().await.unwrap();
        assert_eq!(clients[0].attempts(), 1);
        assert_eq!(clients[1].attempts(), 0);
    }

    #[tokio::test]
    async fn availability_fails_when_no_clients_are_live() {
        let clients = vec![Arc::new(MockClient::failing())];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Availability);

        let err = sharded.conn().await.unwrap_err();
        assert!(matches!(err, Error::NoLiveClients));
        assert_eq!(clients[0].attempts(), 1);

        // The failed client is quarantined; the next request does not even
        // attempt it.
        let err = sharded.conn().await.unwrap_err();
        assert!(matches!(err, Error::NoLiveClients));
        assert_eq!(clients[0].attempts(), 1);
    }

    #[tokio::test]
    async fn availability_backoff_doubles_on_rapid_failures() {
        let clients = vec![Arc::new(MockClient::failing())];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Availability);

        sharded.conn().await.unwrap_err();
        assert_eq!(sharded.backoff_state(0).1, Duration::from_millis(100));

        // Wait out the quarantine, then fail again within the freshness
        // window: the expiry doubles.
        tokio::time::sleep(Duration::from_millis(150)).await;
        sharded.conn().await.unwrap_err();
        assert_eq!(clients[0].attempts(), 2);
        assert_eq!(sharded.backoff_state(0).1, Duration::from_millis(200));

        // Still quarantined at +120 ms.
        tokio::time::sleep(Duration::from_millis(120)).await;
        sharded.conn().await.unwrap_err();
        assert_eq!(clients[0].attempts(), 2);

        // Eligible again past 200 ms; the third failure doubles once more.
        tokio::time::sleep(Duration::from_millis(120)).await;
        sharded.conn().await.unwrap_err();
        assert_eq!(clients[0].attempts(), 3);
        assert_eq!(sharded.backoff_state(0).1, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn availability_fails_over_to_healthy_clients() {
        let clients = vec![
            Arc::new(MockClient::failing()),
            Arc::new(MockClient::succeeding()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Availability);

        for _ in 0..20 {
            sharded.conn().await.unwrap();
        }

        // The failing client is attempted at most once before its first
        // quarantine; after that the healthy client serves everything
        // within the quarantine window.
        assert!(clients[1].attempts() >= 19);
    }

    #[tokio::test]
    async fn failover_walks_clients_in_priority_order() {
        let clients = vec![
            Arc::new(MockClient::failing()),
            Arc::new(MockClient::succeeding()),
            Arc::new(MockClient::succeeding()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Failover);

        sharded.conn().await.unwrap();
        assert_eq!(
            (clients[0].attempts(), clients[1].attempts(), clients[2].attempts()),
            (1, 1, 0)
        );
    }

    #[tokio::test]
    async fn failover_reports_when_all_clients_fail() {
        let clients = vec![
            Arc::new(MockClient::failing()),
            Arc::new(MockClient::failing()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Failover);

        let err = sharded.conn().await.unwrap_err();
        assert!(matches!(err, Error::AllClientsFailed));
        assert_eq!(clients[0].attempts(), 1);
        assert_eq!(clients[1].attempts(), 1);
    }

    #[tokio::test]
    async fn stats_aggregate_across_children() {
        let clients = vec![
            Arc::new(MockClient::failing()),
            Arc::new(MockClient::succeeding()),
        ];
        let sharded = sharded(clients.clone(), LoadBalancingPolicy::Failover);

        sharded.conn().await.unwrap();
        sharded.conn().await.unwrap();

        let stats = Client::stats(&sharded);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 2);
    }
}
