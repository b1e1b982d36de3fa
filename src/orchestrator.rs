//! Per-scope state machine that turns a stored preference into a live
//! connection, sharing dials with every other orchestrator in the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::time::timeout;

use crate::catalogue::{NetworkCatalogue, Protocol, AUTO_MODE};
use crate::connection::{ConnectionHandle, Connector};
use crate::pool::ConnectionPool;
use crate::prober::LatencyProber;
use crate::selector::FastestEndpointSelector;
use crate::store::{now_ms, EndpointPreference, PreferenceStore, Scope};
use crate::telemetry::ConnectionStats;

/// Waiting on a peer's dial, then re-reading the pool, is retried this often.
const MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub enum ConnectionState {
    Idle,
    Loading,
    Connected {
        endpoint_url: String,
        connection: ConnectionHandle,
    },
    Error(String),
}

impl ConnectionState {
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            ConnectionState::Connected { connection, .. } => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Loading => "loading",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Error(_) => "error",
        }
    }

    fn connected(connection: ConnectionHandle) -> Self {
        ConnectionState::Connected {
            endpoint_url: connection.endpoint_url().to_string(),
            connection,
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected { endpoint_url, .. } => {
                f.debug_tuple("Connected").field(endpoint_url).finish()
            }
            ConnectionState::Error(msg) => f.debug_tuple("Error").field(msg).finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// Collaborators shared by every orchestrator of one process.
#[derive(Clone)]
pub struct EndpointServices {
    pub pool: Arc<ConnectionPool>,
    pub catalogue: Arc<dyn NetworkCatalogue>,
    pub selector: FastestEndpointSelector,
    pub live: Arc<dyn Connector>,
    pub light: Option<Arc<dyn Connector>>,
    pub stats: Arc<ConnectionStats>,
}

impl EndpointServices {
    pub fn new(
        catalogue: Arc<dyn NetworkCatalogue>,
        live: Arc<dyn Connector>,
        worst_case: Duration,
        in_flight_ttl: Duration,
    ) -> Self {
        let stats = Arc::new(ConnectionStats::default());
        let prober = LatencyProber::new(live.clone(), worst_case, stats.clone());
        Self {
            pool: Arc::new(ConnectionPool::new(in_flight_ttl)),
            catalogue,
            selector: FastestEndpointSelector::new(prober),
            live,
            light: None,
            stats,
        }
    }

    pub fn with_light_client(mut self, light: Arc<dyn Connector>) -> Self {
        self.light = Some(light);
        self
    }
}

enum Step {
    Done(ConnectionState),
    /// A peer held the dial; look at the pool again.
    Retry,
}

pub struct ConnectionOrchestrator<S: Scope> {
    scope: S,
    store: Arc<PreferenceStore<S>>,
    services: EndpointServices,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl<S: Scope> ConnectionOrchestrator<S> {
    pub fn new(scope: S, store: Arc<PreferenceStore<S>>, services: EndpointServices) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            scope,
            store,
            services,
            state,
            generation: AtomicU64::new(0),
        })
    }

    pub fn scope(&self) -> &S {
        &self.scope
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Re-derives the connection from the current preference. A newer call
    /// supersedes an older one still in progress; the older result is not
    /// published.
    pub async fn evaluate(&self) -> ConnectionState {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.resolve(generation).await;
        if let ConnectionState::Error(msg) = &outcome {
            self.services.stats.set_last_error(msg);
            crate::logging::warn_kv(
                "endpoint resolution failed",
                &[("chain", self.scope.chain_id()), ("err", msg)],
            );
        }
        if !self.publish(generation, outcome.clone()) {
            crate::logging::info_kv(
                "discarding superseded evaluation",
                &[("chain", self.scope.chain_id()), ("state", outcome.label())],
            );
        }
        outcome
    }

    /// Evaluates once, then again whenever this scope's preference changes
    /// or the current connection is found dead on a keepalive tick.
    pub async fn run(self: Arc<Self>, keepalive: Duration, shutdown: Arc<Notify>) {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut changes = self.store.changes();
        self.evaluate().await;

        let mut tick = tokio::time::interval(keepalive);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                msg = changes.recv() => match msg {
                    Ok((scope, _)) if scope == self.scope => {
                        self.evaluate().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.evaluate().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    if let Some(conn) = self.state().connection() {
                        if !conn.is_connected() {
                            crate::logging::warn_kv(
                                "connection dropped, reconnecting",
                                &[("chain", self.scope.chain_id()), ("url", conn.endpoint_url())],
                            );
                            self.evaluate().await;
                        }
                    }
                }
            }
        }
    }

    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    async fn resolve(&self, generation: u64) -> ConnectionState {
        let chain_id = self.scope.chain_id().to_string();
        for _ in 0..MAX_ATTEMPTS {
            let pref = self.store.effective(&self.scope, now_ms());
            let desired = pref.desired_endpoint().to_string();
            let step = match Protocol::of(&desired) {
                Some(Protocol::Auto) => self.resolve_auto(&chain_id, &pref, generation).await,
                Some(Protocol::Wss) => {
                    let live = self.services.live.clone();
                    self.resolve_direct(&chain_id, &desired, live, generation).await
                }
                Some(Protocol::Light) => match self.services.light.clone() {
                    Some(light) => self.resolve_direct(&chain_id, &desired, light, generation).await,
                    None => Step::Done(ConnectionState::Error(format!(
                        "no light client available for {desired}"
                    ))),
                },
                None => Step::Done(ConnectionState::Error(format!(
                    "unsupported endpoint {desired}"
                ))),
            };
            match step {
                Step::Done(state) => return state,
                Step::Retry => continue,
            }
        }
        ConnectionState::Error(format!("gave up waiting for a concurrent dial on {chain_id}"))
    }

    async fn resolve_auto(&self, chain_id: &str, pref: &EndpointPreference, generation: u64) -> Step {
        let pool = &self.services.pool;
        if !pref.check_for_new_one {
            if let Some(conn) = pool.reuse_if_connected(chain_id) {
                self.services.stats.on_reuse();
                self.remember(pref, conn.endpoint_url());
                return Step::Done(ConnectionState::connected(conn));
            }
        }

        if !pool.register_in_flight(chain_id, AUTO_MODE) {
            self.wait_for_peer(chain_id, AUTO_MODE).await;
            return Step::Retry;
        }
        self.publish(generation, ConnectionState::Loading);

        let candidates = match self.services.catalogue.live_socket_endpoints(chain_id) {
            Ok(candidates) => candidates,
            Err(err) => {
                pool.abandon_request(chain_id, AUTO_MODE);
                return Step::Done(ConnectionState::Error(format!("{err:#}")));
            }
        };

        self.services.stats.on_race();
        let Some(winner) = self.services.selector.select_fastest(&candidates).await else {
            self.services.stats.on_race_failure();
            pool.abandon_request(chain_id, AUTO_MODE);
            return Step::Done(ConnectionState::Error(format!(
                "no endpoint for {chain_id} answered in time"
            )));
        };

        // A live connection a peer pooled for the same url wins over ours.
        let connection = match pool.register_connected(
            chain_id,
            &winner.endpoint_url,
            winner.connection.clone(),
            true,
        ) {
            Some(existing) => {
                winner.connection.disconnect().await;
                existing
            }
            None => winner.connection,
        };
        self.store.set(
            &self.scope,
            EndpointPreference::auto_resolved(&winner.endpoint_url, now_ms()),
        );
        Step::Done(ConnectionState::connected(connection))
    }

    async fn resolve_direct(
        &self,
        chain_id: &str,
        url: &str,
        connector: Arc<dyn Connector>,
        generation: u64,
    ) -> Step {
        let pool = &self.services.pool;
        if let Some(entry) = pool.lookup(chain_id, url) {
            if let Some(conn) = entry.connection.as_ref().filter(|c| c.is_connected()) {
                self.services.stats.on_reuse();
                return Step::Done(ConnectionState::connected(conn.clone()));
            }
            if entry.connection.is_some() {
                pool.remove(chain_id, url);
            }
        }

        if !pool.register_in_flight(chain_id, url) {
            self.wait_for_peer(chain_id, url).await;
            return Step::Retry;
        }
        self.publish(generation, ConnectionState::Loading);

        self.services.stats.on_dial();
        match connector.dial(url).await {
            Ok(conn) => {
                let conn = match pool.register_connected(chain_id, url, conn.clone(), false) {
                    Some(existing) => {
                        conn.disconnect().await;
                        existing
                    }
                    None => conn,
                };
                crate::logging::info_kv("connected", &[("chain", chain_id), ("url", url)]);
                Step::Done(ConnectionState::connected(conn))
            }
            Err(err) => {
                self.services.stats.on_dial_failure(format!("{err:#}"));
                pool.abandon_request(chain_id, url);
                Step::Done(ConnectionState::Error(format!("{err:#}")))
            }
        }
    }

    /// Records the endpoint auto mode settled on, unless already stored.
    fn remember(&self, pref: &EndpointPreference, url: &str) {
        if pref.is_auto && !pref.check_for_new_one && pref.remembered_endpoint() == Some(url) {
            return;
        }
        self.store
            .set(&self.scope, EndpointPreference::auto_resolved(url, now_ms()));
    }

    /// Blocks until the placeholder for the key resolves, disappears, or
    /// outlives the in-flight TTL.
    async fn wait_for_peer(&self, chain_id: &str, url: &str) {
        let pool = &self.services.pool;
        let mut rx = pool.watch();
        let waited = timeout(pool.in_flight_ttl(), async {
            loop {
                match pool.lookup(chain_id, url) {
                    Some(entry) if entry.connection.is_none() => {}
                    _ => return,
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if waited.is_err() {
            crate::logging::warn_kv(
                "in-flight dial outlived its ttl",
                &[("chain", chain_id), ("url", url)],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{EndpointDescriptor, StaticCatalogue};
    use crate::storage::{MemoryStorage, Storage};
    use crate::store::{AccountChainScope, ChainScope, NO_PASS_PERIOD};
    use crate::testing::{MockConnector, Script};

    const CHAIN: &str = "0x91b1";

    fn catalogue(urls: &[&str]) -> Arc<dyn NetworkCatalogue> {
        let mut cat = StaticCatalogue::default();
        cat.insert(
            CHAIN,
            urls.iter()
                .map(|u| EndpointDescriptor::new(*u, *u).unwrap())
                .collect(),
        );
        Arc::new(cat)
    }

    fn services(connector: Arc<MockConnector>, urls: &[&str]) -> EndpointServices {
        EndpointServices::new(
            catalogue(urls),
            connector,
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }

    async fn chain_store(storage: &MemoryStorage) -> Arc<PreferenceStore<ChainScope>> {
        let storage: Arc<dyn Storage> = Arc::new(storage.clone());
        PreferenceStore::open(storage, NO_PASS_PERIOD).await
    }

    #[tokio::test]
    async fn auto_mode_races_and_remembers_winner() {
        let connector = MockConnector::new();
        connector.script("wss://slow.io", Script::after(200));
        connector.script("wss://fast.io", Script::after(20));
        let services = services(connector.clone(), &["wss://slow.io", "wss://fast.io"]);
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        let orch = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());

        let state = orch.evaluate().await;
        let conn = state.connection().expect("connected");
        assert_eq!(conn.endpoint_url(), "wss://fast.io");
        assert_eq!(orch.state().label(), "connected");

        let pref = store.get(&scope).unwrap();
        assert_eq!(pref.endpoint, "wss://fast.io");
        assert!(pref.is_auto);
        assert!(!pref.check_for_new_one);

        assert!(services.pool.lookup(CHAIN, AUTO_MODE).is_none());
        assert!(services.pool.lookup(CHAIN, "wss://fast.io").unwrap().is_live());

        // Settled preferences reuse the pooled connection.
        let again = orch.evaluate().await.connection().unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(connector.total_dials(), 2);
    }

    #[tokio::test]
    async fn concurrent_auto_orchestrators_share_one_race() {
        let connector = MockConnector::new();
        connector.script("wss://a.io", Script::after(60));
        connector.script("wss://b.io", Script::after(120));
        let services = services(connector.clone(), &["wss://a.io", "wss://b.io"]);

        let chain_orch = ConnectionOrchestrator::new(
            ChainScope::new(CHAIN),
            chain_store(&MemoryStorage::new()).await,
            services.clone(),
        );
        let account_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let account_store: Arc<PreferenceStore<AccountChainScope>> =
            PreferenceStore::open(account_storage, NO_PASS_PERIOD).await;
        let account_scope = AccountChainScope::new("5Grw", CHAIN);
        let account_orch =
            ConnectionOrchestrator::new(account_scope.clone(), account_store.clone(), services);

        let (a, b) = tokio::join!(chain_orch.evaluate(), account_orch.evaluate());
        let a = a.connection().unwrap();
        let b = b.connection().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.total_dials(), 2);
        assert_eq!(account_store.get(&account_scope).unwrap().endpoint, "wss://a.io");
    }

    #[tokio::test]
    async fn manual_choice_is_dialed_once_and_reused() {
        let connector = MockConnector::new();
        connector.script(
            "wss://mine.io",
            Script::Healthy {
                dial: Duration::from_millis(50),
                liveness: Duration::ZERO,
            },
        );
        let services = services(connector.clone(), &["wss://other.io"]);
        let storage = MemoryStorage::new();
        let store = chain_store(&storage).await;
        let scope = ChainScope::new(CHAIN);
        store.set(&scope, EndpointPreference::manual("wss://mine.io", now_ms()));

        let first = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());
        let second = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());
        let (a, b) = tokio::join!(first.evaluate(), second.evaluate());
        assert!(Arc::ptr_eq(&a.connection().unwrap(), &b.connection().unwrap()));
        assert_eq!(connector.dial_count("wss://mine.io"), 1);
        assert_eq!(connector.dial_count("wss://other.io"), 0);
        assert!(!store.get(&scope).unwrap().is_auto);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced_on_reevaluation() {
        let connector = MockConnector::new();
        let services = services(connector.clone(), &[]);
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        store.set(&scope, EndpointPreference::manual("wss://mine.io", now_ms()));
        let orch = ConnectionOrchestrator::new(scope, store, services);

        orch.evaluate().await;
        connector.connection("wss://mine.io").unwrap().drop_remote();
        let state = orch.evaluate().await;
        assert!(state.connection().unwrap().is_connected());
        assert_eq!(connector.dial_count("wss://mine.io"), 2);
    }

    #[tokio::test]
    async fn auto_race_and_slow_direct_dial_on_one_url_share_a_handle() {
        let slow = MockConnector::new();
        slow.script(
            "wss://a.io",
            Script::Healthy {
                dial: Duration::from_millis(200),
                liveness: Duration::ZERO,
            },
        );
        let fast = MockConnector::new();
        let mut services = services(slow.clone(), &["wss://a.io"]);
        services.selector = FastestEndpointSelector::new(LatencyProber::new(
            fast.clone(),
            Duration::from_millis(500),
            services.stats.clone(),
        ));

        let manual_store = chain_store(&MemoryStorage::new()).await;
        let manual_scope = ChainScope::new(CHAIN);
        manual_store.set(&manual_scope, EndpointPreference::manual("wss://a.io", now_ms()));
        let manual = ConnectionOrchestrator::new(manual_scope, manual_store, services.clone());

        let account_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let account_store: Arc<PreferenceStore<AccountChainScope>> =
            PreferenceStore::open(account_storage, NO_PASS_PERIOD).await;
        let auto = ConnectionOrchestrator::new(
            AccountChainScope::new("5Grw", CHAIN),
            account_store,
            services.clone(),
        );

        let (m, a) = tokio::join!(manual.evaluate(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            auto.evaluate().await
        });
        let m = m.connection().unwrap();
        let a = a.connection().unwrap();
        assert!(Arc::ptr_eq(&m, &a));
        assert!(a.is_connected());

        let pooled = services.pool.lookup(CHAIN, "wss://a.io").unwrap();
        assert!(Arc::ptr_eq(pooled.connection.as_ref().unwrap(), &a));
        assert_eq!(services.pool.snapshot(CHAIN).len(), 1);
        // The direct dial lost and closed its own socket.
        assert_eq!(slow.dial_count("wss://a.io"), 1);
        assert!(slow.connection("wss://a.io").unwrap().was_disconnected());
        assert!(!fast.connection("wss://a.io").unwrap().was_disconnected());
    }

    #[tokio::test]
    async fn auto_winner_adopts_pooled_direct_connection() {
        let direct = MockConnector::new();
        let racer = MockConnector::new();
        let mut services = services(direct.clone(), &["wss://a.io"]);
        services.selector = FastestEndpointSelector::new(LatencyProber::new(
            racer.clone(),
            Duration::from_millis(500),
            services.stats.clone(),
        ));
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        store.set(&scope, EndpointPreference::manual("wss://a.io", now_ms()));
        let manual = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());
        let pooled = manual.evaluate().await.connection().unwrap();

        let account_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let account_store: Arc<PreferenceStore<AccountChainScope>> =
            PreferenceStore::open(account_storage, NO_PASS_PERIOD).await;
        let account_scope = AccountChainScope::new("5Grw", CHAIN);
        account_store.set(&account_scope, EndpointPreference::auto_refresh(now_ms()));
        let auto = ConnectionOrchestrator::new(account_scope, account_store, services.clone());

        let adopted = auto.evaluate().await.connection().unwrap();
        assert!(Arc::ptr_eq(&pooled, &adopted));
        assert_eq!(racer.dial_count("wss://a.io"), 1);
        assert!(racer.connection("wss://a.io").unwrap().was_disconnected());
        assert!(pooled.is_connected());
    }

    #[tokio::test]
    async fn failed_dial_reports_error_and_clears_placeholder() {
        let connector = MockConnector::new();
        connector.script("wss://down.io", Script::Refuse(Duration::from_millis(5)));
        let services = services(connector.clone(), &[]);
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        let pref = EndpointPreference::manual("wss://down.io", now_ms());
        store.set(&scope, pref.clone());
        let orch = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());

        let state = orch.evaluate().await;
        assert_eq!(state.label(), "error");
        assert!(services.pool.lookup(CHAIN, "wss://down.io").is_none());
        assert_eq!(store.get(&scope), Some(pref));
        assert_eq!(services.stats.snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn failed_race_leaves_preference_untouched() {
        let connector = MockConnector::new();
        connector.script("wss://quiet.io", Script::Silent);
        let mut services = services(connector.clone(), &["wss://quiet.io"]);
        services.selector = FastestEndpointSelector::new(LatencyProber::new(
            connector,
            Duration::from_millis(50),
            services.stats.clone(),
        ));
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        let orch = ConnectionOrchestrator::new(scope.clone(), store.clone(), services.clone());

        assert_eq!(orch.evaluate().await.label(), "error");
        assert!(store.get(&scope).is_none());
        assert!(services.pool.snapshot(CHAIN).is_empty());
        assert_eq!(services.stats.snapshot().race_failures, 1);
    }

    #[tokio::test]
    async fn unknown_chain_and_missing_light_client_are_errors() {
        let connector = MockConnector::new();
        let services = services(connector, &[]);
        let store = chain_store(&MemoryStorage::new()).await;

        let unknown = ConnectionOrchestrator::new(ChainScope::new("0xdead"), store.clone(), services.clone());
        assert_eq!(unknown.evaluate().await.label(), "error");
        assert!(services.pool.snapshot("0xdead").is_empty());

        let scope = ChainScope::new(CHAIN);
        store.set(
            &scope,
            EndpointPreference::manual("light://substrate-connect/polkadot", now_ms()),
        );
        let light = ConnectionOrchestrator::new(scope, store, services);
        assert_eq!(light.evaluate().await.label(), "error");
    }

    #[tokio::test]
    async fn light_endpoints_use_the_light_connector() {
        let live = MockConnector::new();
        let light = MockConnector::new();
        let services = services(live.clone(), &[]).with_light_client(light.clone());
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        store.set(
            &scope,
            EndpointPreference::manual("light://substrate-connect/polkadot", now_ms()),
        );
        let orch = ConnectionOrchestrator::new(scope, store, services);

        assert_eq!(orch.evaluate().await.label(), "connected");
        assert_eq!(light.total_dials(), 1);
        assert_eq!(live.total_dials(), 0);
    }

    #[tokio::test]
    async fn stale_manual_choice_falls_back_to_auto() {
        let connector = MockConnector::new();
        let services = services(connector.clone(), &["wss://fresh.io"]);
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        let long_ago = now_ms() - 31 * 60 * 1000;
        store.set(&scope, EndpointPreference::manual("wss://old.io", long_ago));
        let orch = ConnectionOrchestrator::new(scope.clone(), store.clone(), services);

        let state = orch.evaluate().await;
        assert_eq!(state.connection().unwrap().endpoint_url(), "wss://fresh.io");
        let pref = store.get(&scope).unwrap();
        assert!(pref.is_auto);
        assert_eq!(pref.endpoint, "wss://fresh.io");
        assert_eq!(connector.dial_count("wss://old.io"), 0);
    }

    #[tokio::test]
    async fn duplicate_storage_event_converges_on_one_connection() {
        let connector = MockConnector::new();
        let services = services(connector.clone(), &[]);
        let store = chain_store(&MemoryStorage::new()).await;
        let scope = ChainScope::new(CHAIN);
        let orch = ConnectionOrchestrator::new(scope.clone(), store.clone(), services);

        let pref = EndpointPreference::manual("wss://tab.io", now_ms());
        let change = crate::storage::StorageChange {
            key: "endpoints_by_chain".to_string(),
            old_value: None,
            new_value: Some(serde_json::json!({ CHAIN: pref }).to_string()),
            source: uuid::Uuid::new_v4(),
        };

        assert_eq!(store.apply_storage_change(&change), 1);
        let first = orch.evaluate().await.connection().unwrap();
        assert_eq!(store.apply_storage_change(&change), 0);
        let second = orch.evaluate().await.connection().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.dial_count("wss://tab.io"), 1);
        assert_eq!(store.get(&scope), Some(pref));
    }

    #[tokio::test]
    async fn run_follows_preference_changes_from_another_context() {
        let connector = MockConnector::new();
        let services = services(connector.clone(), &["wss://auto.io"]);
        let storage = MemoryStorage::new();
        let store = chain_store(&storage).await;
        let other_tab = chain_store(&storage.sibling()).await;
        let scope = ChainScope::new(CHAIN);
        let orch = ConnectionOrchestrator::new(scope.clone(), store, services);
        let states = orch.subscribe_state();

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(orch.clone().run(Duration::from_millis(50), shutdown.clone()));

        let wait_for = |url: &'static str, states: &watch::Receiver<ConnectionState>| {
            let mut states = states.clone();
            async move {
                timeout(Duration::from_secs(2), async {
                    loop {
                        if let Some(conn) = states.borrow_and_update().connection() {
                            if conn.endpoint_url() == url {
                                return;
                            }
                        }
                        if states.changed().await.is_err() {
                            return;
                        }
                    }
                })
                .await
                .is_ok()
            }
        };
        assert!(wait_for("wss://auto.io", &states).await);

        other_tab.set(&scope, EndpointPreference::manual("wss://picked.io", now_ms()));
        other_tab.persist_now().await.unwrap();
        assert!(wait_for("wss://picked.io", &states).await);

        // Keepalive notices the dropped socket and dials again.
        connector.connection("wss://picked.io").unwrap().drop_remote();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.dial_count("wss://picked.io"), 2);
        assert!(orch.state().connection().unwrap().is_connected());

        shutdown.notify_waiters();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
