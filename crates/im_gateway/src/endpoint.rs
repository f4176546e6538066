//! Identity endpoints: one logical actor per identity.
//!
//! Every call against an identity is queued on that identity's mailbox and
//! handled by a single task, so per-identity presence bookkeeping needs no
//! locking. Endpoints activate on first use and deactivate after sitting
//! idle with no live sessions.
//!
//! Presence is the set of connection ids currently online, so Offline for a
//! connection whose Online never landed is a no-op.

use crate::client::ConnectionId;
use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Configuration for the endpoint runtime.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How long an endpoint with no sessions stays activated.
    pub idle_timeout: Duration,
    /// Mailbox depth per endpoint.
    pub mailbox_size: usize,
    /// Upper bound on a single call, queueing included.
    pub call_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            mailbox_size: 64,
            call_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Online {
        session: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    Offline {
        session: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    IsPresent { reply: oneshot::Sender<bool> },
}

struct Activation {
    id: u64,
    tx: mpsc::Sender<Command>,
}

enum CallError {
    /// Mailbox closed before the command was handled; safe to retry.
    Gone,
    TimedOut,
}

/// Activation table and mailbox dispatch for identity endpoints.
pub struct EndpointRuntime {
    activations: Arc<DashMap<String, Activation>>,
    next_id: AtomicU64,
    config: EndpointConfig,
}

impl EndpointRuntime {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            activations: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Mark `session` live for `identity`. Returns the session count.
    pub async fn online(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.call(identity, |reply| Command::Online { session, reply })
            .await
    }

    /// Mark `session` gone for `identity`. Returns the remaining count.
    ///
    /// Safe to send whether or not the matching Online was confirmed.
    pub async fn offline(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.call(identity, |reply| Command::Offline { session, reply })
            .await
    }

    /// Whether `identity` has at least one live session.
    pub async fn is_online(&self, identity: &str) -> Result<bool> {
        self.call(identity, |reply| Command::IsPresent { reply }).await
    }

    /// Number of currently activated endpoints.
    pub fn active_count(&self) -> usize {
        self.activations.len()
    }

    async fn call<T>(
        &self,
        identity: &str,
        make: impl Fn(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        // A mailbox can close between lookup and send when the endpoint
        // deactivates; one reactivation covers that window.
        for attempt in 0..2 {
            let (activation_id, tx) = self.activate(identity);
            match self.try_call(&tx, &make).await {
                Ok(value) => return Ok(value),
                Err(CallError::Gone) => {
                    debug!(
                        "Endpoint {} gone on attempt {}, reactivating",
                        identity,
                        attempt + 1
                    );
                    self.activations
                        .remove_if(identity, |_, a| a.id == activation_id);
                }
                Err(CallError::TimedOut) => break,
            }
        }

        error!("Endpoint activation failed for {}", identity);
        counter!("im_activation_errors_total").increment(1);
        Err(GatewayError::Activation(identity.to_string()))
    }

    async fn try_call<T>(
        &self,
        tx: &mpsc::Sender<Command>,
        make: &impl Fn(oneshot::Sender<T>) -> Command,
    ) -> std::result::Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            tx.send(make(reply_tx)).await.map_err(|_| CallError::Gone)?;
            reply_rx.await.map_err(|_| CallError::Gone)
        };
        tokio::time::timeout(self.config.call_timeout, exchange)
            .await
            .unwrap_or(Err(CallError::TimedOut))
    }

    fn activate(&self, identity: &str) -> (u64, mpsc::Sender<Command>) {
        let mut entry = self
            .activations
            .entry(identity.to_string())
            .or_insert_with(|| self.spawn_endpoint(identity));

        if entry.tx.is_closed() {
            *entry = self.spawn_endpoint(identity);
        }

        (entry.id, entry.tx.clone())
    }

    fn spawn_endpoint(&self, identity: &str) -> Activation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.mailbox_size);

        debug!("Activating endpoint {} ({})", identity, id);
        tokio::spawn(run_endpoint(
            identity.to_string(),
            id,
            rx,
            self.activations.clone(),
            self.config.idle_timeout,
        ));

        Activation { id, tx }
    }
}

impl Default for EndpointRuntime {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

async fn run_endpoint(
    identity: String,
    activation_id: u64,
    mut rx: mpsc::Receiver<Command>,
    activations: Arc<DashMap<String, Activation>>,
    idle_timeout: Duration,
) {
    let mut sessions: HashSet<ConnectionId> = HashSet::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Online { session, reply } => {
                        sessions.insert(session);
                        let _ = reply.send(sessions.len());
                    }
                    Command::Offline { session, reply } => {
                        if !sessions.remove(&session) {
                            debug!("Offline for {} with unknown session {}", identity, session);
                        }
                        let _ = reply.send(sessions.len());
                    }
                    Command::IsPresent { reply } => {
                        let _ = reply.send(!sessions.is_empty());
                    }
                }
            }

            _ = tokio::time::sleep(idle_timeout), if sessions.is_empty() => {
                // Queued commands are dropped with the mailbox; their callers retry.
                activations.remove_if(&identity, |_, a| a.id == activation_id);
                debug!("Endpoint {} ({}) deactivated", identity, activation_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fast_runtime(idle_ms: u64) -> EndpointRuntime {
        EndpointRuntime::new(EndpointConfig {
            idle_timeout: Duration::from_millis(idle_ms),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_presence_follows_sessions() {
        let runtime = EndpointRuntime::default();
        let session = Uuid::new_v4();

        assert!(!runtime.is_online("u1").await.unwrap());
        assert_eq!(runtime.online("u1", session).await.unwrap(), 1);
        assert!(runtime.is_online("u1").await.unwrap());
        assert_eq!(runtime.offline("u1", session).await.unwrap(), 0);
        assert!(!runtime.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_replaced_session_offline_keeps_identity_present() {
        let runtime = EndpointRuntime::default();
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());

        runtime.online("u1", old).await.unwrap();
        runtime.online("u1", new).await.unwrap();
        runtime.offline("u1", old).await.unwrap();

        assert!(runtime.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_for_unknown_session_is_a_no_op() {
        let runtime = EndpointRuntime::default();
        let live = Uuid::new_v4();

        assert_eq!(runtime.offline("u1", Uuid::new_v4()).await.unwrap(), 0);
        assert_eq!(runtime.online("u1", live).await.unwrap(), 1);

        // A teardown whose Online never landed must not evict the live one.
        assert_eq!(runtime.offline("u1", Uuid::new_v4()).await.unwrap(), 1);
        assert_eq!(runtime.offline("u1", live).await.unwrap(), 0);
        assert_eq!(runtime.offline("u1", live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_online_is_balanced_by_offline() {
        let runtime = EndpointRuntime::new(EndpointConfig {
            idle_timeout: Duration::from_millis(20),
            call_timeout: Duration::ZERO,
            ..Default::default()
        });
        let session = Uuid::new_v4();

        // Either call may time out after its command was queued.
        let _ = runtime.online("u1", session).await;
        let _ = runtime.offline("u1", session).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let runtime = Arc::new(EndpointRuntime::default());
        let mut handles = vec![];

        for _ in 0..100 {
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                runtime.online("busy", Uuid::new_v4()).await.unwrap()
            }));
        }

        let mut counts = vec![];
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=100).collect::<Vec<usize>>());
        assert_eq!(runtime.active_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_endpoint_deactivates_and_reactivates() {
        let runtime = fast_runtime(50);
        let session = Uuid::new_v4();

        runtime.online("u1", session).await.unwrap();
        runtime.offline("u1", session).await.unwrap();
        assert_eq!(runtime.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runtime.active_count(), 0);

        assert_eq!(runtime.online("u1", Uuid::new_v4()).await.unwrap(), 1);
        assert_eq!(runtime.active_count(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_with_sessions_stays_active() {
        let runtime = fast_runtime(30);

        runtime.online("u1", Uuid::new_v4()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(runtime.active_count(), 1);
        assert!(runtime.is_online("u1").await.unwrap());
    }
}
