//! Endpoint preference store.
//!
//! One in-memory map per scope variant, mirrored into a single storage key as
//! a nested JSON object (`chain → preference` or
//! `address → chain → preference`). Writes made by other contexts are merged
//! back through [`PreferenceStore::apply_storage_change`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::catalogue::AUTO_MODE;
use crate::storage::{Storage, StorageChange};

/// Idle time after which a manual choice is reconsidered.
pub const NO_PASS_PERIOD: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPreference {
    pub endpoint: String,
    pub is_auto: bool,
    #[serde(default)]
    pub check_for_new_one: bool,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl EndpointPreference {
    pub fn auto(now_ms: i64) -> Self {
        Self {
            endpoint: AUTO_MODE.to_string(),
            is_auto: true,
            check_for_new_one: false,
            timestamp: now_ms,
        }
    }

    /// Auto mode that must race for a fresh endpoint instead of reusing one.
    pub fn auto_refresh(now_ms: i64) -> Self {
        Self {
            check_for_new_one: true,
            ..Self::auto(now_ms)
        }
    }

    /// Auto mode that has settled on a concrete endpoint.
    pub fn auto_resolved(endpoint: impl Into<String>, now_ms: i64) -> Self {
        Self {
            endpoint: endpoint.into(),
            is_auto: true,
            check_for_new_one: false,
            timestamp: now_ms,
        }
    }

    pub fn manual(endpoint: impl Into<String>, now_ms: i64) -> Self {
        Self {
            endpoint: endpoint.into(),
            is_auto: false,
            check_for_new_one: false,
            timestamp: now_ms,
        }
    }

    /// The value the orchestrator acts on.
    pub fn desired_endpoint(&self) -> &str {
        if self.is_auto {
            AUTO_MODE
        } else {
            &self.endpoint
        }
    }

    /// Last concrete endpoint, also while in auto mode.
    pub fn remembered_endpoint(&self) -> Option<&str> {
        if self.endpoint == AUTO_MODE || self.endpoint.is_empty() {
            None
        } else {
            Some(&self.endpoint)
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// True when a manual choice has stood untouched for longer than `period`.
pub fn should_be_on_auto_mode(pref: &EndpointPreference, now_ms: i64, period: Duration) -> bool {
    if pref.is_auto {
        return false;
    }
    let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(pref.timestamp) > period_ms
}

pub trait Scope: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    const STORAGE_KEY: &'static str;
    /// Nesting depth of the persisted object.
    const DEPTH: usize;

    fn chain_id(&self) -> &str;

    fn path(&self) -> Vec<&str>;

    fn from_path(path: &[String]) -> Option<Self>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainScope {
    pub chain_id: String,
}

impl ChainScope {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
        }
    }
}

impl Scope for ChainScope {
    const STORAGE_KEY: &'static str = "endpoints_by_chain";
    const DEPTH: usize = 1;

    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn path(&self) -> Vec<&str> {
        vec![self.chain_id.as_str()]
    }

    fn from_path(path: &[String]) -> Option<Self> {
        match path {
            [chain_id] => Some(Self::new(chain_id.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountChainScope {
    pub address: String,
    pub chain_id: String,
}

impl AccountChainScope {
    pub fn new(address: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            chain_id: chain_id.into(),
        }
    }
}

impl Scope for AccountChainScope {
    const STORAGE_KEY: &'static str = "endpoints_by_account";
    const DEPTH: usize = 2;

    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn path(&self) -> Vec<&str> {
        vec![self.address.as_str(), self.chain_id.as_str()]
    }

    fn from_path(path: &[String]) -> Option<Self> {
        match path {
            [address, chain_id] => Some(Self::new(address.clone(), chain_id.clone())),
            _ => None,
        }
    }
}

pub type ListenerId = u64;

type Listener<S> = Arc<dyn Fn(&S, &EndpointPreference) + Send + Sync>;

pub struct PreferenceStore<S: Scope> {
    storage: Arc<dyn Storage>,
    prefs: Mutex<HashMap<S, EndpointPreference>>,
    listeners: Mutex<Vec<(ListenerId, Listener<S>)>>,
    next_listener: AtomicU64,
    changes: broadcast::Sender<(S, EndpointPreference)>,
    persist: watch::Sender<Option<String>>,
    no_pass_period: Duration,
    storage_listener: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Scope> PreferenceStore<S> {
    /// Loads the persisted snapshot and starts following changes made by
    /// other contexts. Storage failures leave the store empty.
    pub async fn open(storage: Arc<dyn Storage>, no_pass_period: Duration) -> Arc<Self> {
        // Subscribe before reading so nothing written in between is lost.
        let mut storage_rx = storage.subscribe();
        let initial = match storage.read(S::STORAGE_KEY).await {
            Ok(Some(raw)) => match decode_snapshot::<S>(&raw) {
                Ok(prefs) => prefs,
                Err(err) => {
                    crate::logging::error(format!(
                        "discarding unreadable {}: {err:#}",
                        S::STORAGE_KEY
                    ));
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(err) => {
                crate::logging::error(format!("read {} failed: {err:#}", S::STORAGE_KEY));
                HashMap::new()
            }
        };

        let (changes, _) = broadcast::channel(64);
        let (persist, mut persist_rx) = watch::channel(None::<String>);
        let store = Arc::new(Self {
            storage: storage.clone(),
            prefs: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            changes,
            persist,
            no_pass_period,
            storage_listener: Mutex::new(None),
        });

        // persister: only the newest snapshot is ever written
        let persist_storage = storage.clone();
        tokio::spawn(async move {
            while persist_rx.changed().await.is_ok() {
                let snapshot = persist_rx.borrow_and_update().clone();
                let Some(raw) = snapshot else {
                    continue;
                };
                if let Err(err) = persist_storage.write(S::STORAGE_KEY, raw).await {
                    crate::logging::error(format!(
                        "persist {} failed: {err:#}",
                        S::STORAGE_KEY
                    ));
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        let listener = tokio::spawn(async move {
            loop {
                let change = match storage_rx.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(store) = weak.upgrade() else { break };
                        store.reload().await;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(store) = weak.upgrade() else { break };
                store.apply_storage_change(&change);
            }
        });
        if let Ok(mut slot) = store.storage_listener.lock() {
            *slot = Some(listener);
        }
        store
    }

    pub fn no_pass_period(&self) -> Duration {
        self.no_pass_period
    }

    pub fn get(&self, scope: &S) -> Option<EndpointPreference> {
        self.prefs.lock().ok()?.get(scope).cloned()
    }

    pub fn all(&self) -> Vec<(S, EndpointPreference)> {
        match self.prefs.lock() {
            Ok(prefs) => prefs.iter().map(|(s, p)| (s.clone(), p.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stored preference, or auto mode when there is none. A stale manual
    /// choice turns into auto mode that looks for a new endpoint.
    pub fn effective(&self, scope: &S, now_ms: i64) -> EndpointPreference {
        match self.get(scope) {
            None => EndpointPreference::auto(now_ms),
            Some(pref) if should_be_on_auto_mode(&pref, now_ms, self.no_pass_period) => {
                EndpointPreference::auto_refresh(now_ms)
            }
            Some(pref) => pref,
        }
    }

    /// Updates memory, notifies listeners, then hands the snapshot to the
    /// background persister. Writing an unchanged value does nothing.
    pub fn set(&self, scope: &S, mut pref: EndpointPreference) {
        let snapshot = {
            let Ok(mut prefs) = self.prefs.lock() else {
                return;
            };
            if let Some(current) = prefs.get(scope) {
                if *current == pref {
                    return;
                }
                // A local edit must outrank what it replaces in other contexts.
                if pref.timestamp <= current.timestamp {
                    pref.timestamp = current.timestamp + 1;
                }
            }
            prefs.insert(scope.clone(), pref.clone());
            encode_snapshot(&prefs)
        };
        self.notify(scope, &pref);
        match snapshot {
            Ok(raw) => {
                self.persist.send_replace(Some(raw));
            }
            Err(err) => crate::logging::error(format!("encode preferences: {err:#}")),
        }
    }

    /// Writes the current snapshot and waits for the storage to accept it.
    pub async fn persist_now(&self) -> Result<()> {
        let raw = {
            let prefs = self
                .prefs
                .lock()
                .map_err(|_| anyhow::anyhow!("preference map poisoned"))?;
            encode_snapshot(&prefs)?
        };
        self.storage
            .write(S::STORAGE_KEY, raw)
            .await
            .with_context(|| format!("persist {}", S::STORAGE_KEY))
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&S, &EndpointPreference) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }

    /// Async view of the same notifications listeners receive.
    pub fn changes(&self) -> broadcast::Receiver<(S, EndpointPreference)> {
        self.changes.subscribe()
    }

    /// Merges a snapshot written by another context. Returns how many scopes
    /// changed; re-delivering the same change returns 0.
    pub fn apply_storage_change(&self, change: &StorageChange) -> usize {
        if change.key != S::STORAGE_KEY || change.source == self.storage.context_id() {
            return 0;
        }
        let Some(raw) = change.new_value.as_deref() else {
            return 0;
        };
        match decode_snapshot::<S>(raw) {
            Ok(incoming) => self.merge(incoming),
            Err(err) => {
                crate::logging::warn(format!(
                    "ignoring unreadable {} change: {err:#}",
                    S::STORAGE_KEY
                ));
                0
            }
        }
    }

    async fn reload(&self) {
        match self.storage.read(S::STORAGE_KEY).await {
            Ok(Some(raw)) => match decode_snapshot::<S>(&raw) {
                Ok(incoming) => {
                    self.merge(incoming);
                }
                Err(err) => crate::logging::warn(format!("reload {}: {err:#}", S::STORAGE_KEY)),
            },
            Ok(None) => {}
            Err(err) => crate::logging::error(format!("reload {}: {err:#}", S::STORAGE_KEY)),
        }
    }

    fn merge(&self, incoming: HashMap<S, EndpointPreference>) -> usize {
        let mut updated: Vec<(S, EndpointPreference)> = Vec::new();
        let republish = {
            let Ok(mut prefs) = self.prefs.lock() else {
                return 0;
            };
            for (scope, pref) in &incoming {
                if let Some(local) = prefs.get(scope) {
                    if !supersedes(pref, local) {
                        continue;
                    }
                }
                prefs.insert(scope.clone(), pref.clone());
                updated.push((scope.clone(), pref.clone()));
            }
            // The foreign snapshot dropped or predates something we hold.
            let behind = prefs.iter().any(|(scope, local)| match incoming.get(scope) {
                None => true,
                Some(remote) => supersedes(local, remote),
            });
            behind.then(|| encode_snapshot(&prefs))
        };
        for (scope, pref) in &updated {
            self.notify(scope, pref);
        }
        match republish {
            Some(Ok(raw)) => {
                self.persist.send_replace(Some(raw));
            }
            Some(Err(err)) => crate::logging::error(format!("encode preferences: {err:#}")),
            None => {}
        }
        updated.len()
    }

    fn notify(&self, scope: &S, pref: &EndpointPreference) {
        // Called without holding the map lock so listeners may read back.
        let listeners: Vec<Listener<S>> = match self.listeners.lock() {
            Ok(l) => l.iter().map(|(_, f)| f.clone()).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(scope, pref);
        }
        let _ = self.changes.send((scope.clone(), pref.clone()));
    }
}

impl<S: Scope> Drop for PreferenceStore<S> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.storage_listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Total order on competing values for one scope: the newer timestamp wins
/// and ties break on content, so every context settles on the same value.
fn supersedes(candidate: &EndpointPreference, current: &EndpointPreference) -> bool {
    (
        candidate.timestamp,
        &candidate.endpoint,
        candidate.is_auto,
        candidate.check_for_new_one,
    ) > (
        current.timestamp,
        &current.endpoint,
        current.is_auto,
        current.check_for_new_one,
    )
}

fn encode_snapshot<S: Scope>(prefs: &HashMap<S, EndpointPreference>) -> Result<String> {
    let mut root = Map::new();
    for (scope, pref) in prefs {
        let path = scope.path();
        let Some((leaf, parents)) = path.split_last() else {
            continue;
        };
        let mut node = &mut root;
        for key in parents {
            let entry = node
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                anyhow::bail!("preference node {key} is not an object");
            };
            node = map;
        }
        node.insert(leaf.to_string(), serde_json::to_value(pref)?);
    }
    Ok(serde_json::to_string(&Value::Object(root))?)
}

fn decode_snapshot<S: Scope>(raw: &str) -> Result<HashMap<S, EndpointPreference>> {
    let root: Value = serde_json::from_str(raw).context("parse preference snapshot")?;
    let mut out = HashMap::new();
    let mut path = Vec::with_capacity(S::DEPTH);
    collect_leaves::<S>(&root, &mut path, &mut out);
    Ok(out)
}

fn collect_leaves<S: Scope>(
    node: &Value,
    path: &mut Vec<String>,
    out: &mut HashMap<S, EndpointPreference>,
) {
    if path.len() == S::DEPTH {
        match (S::from_path(path), serde_json::from_value::<EndpointPreference>(node.clone())) {
            (Some(scope), Ok(pref)) => {
                out.insert(scope, pref);
            }
            (_, Err(err)) => {
                crate::logging::warn(format!("skipping preference {}: {err}", path.join("/")))
            }
            (None, _) => {}
        }
        return;
    }
    let Value::Object(map) = node else {
        return;
    };
    for (key, child) in map {
        path.push(key.clone());
        collect_leaves::<S>(child, path, out);
        path.pop();
    }
}
