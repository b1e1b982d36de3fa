//! Scripted connector used by the timing-sensitive unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::connection::{ConnectionHandle, Connector, RpcConnection};

#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// Dial succeeds after `dial`, liveness answers after `liveness`.
    Healthy { dial: Duration, liveness: Duration },
    /// Dial fails after the given delay.
    Refuse(Duration),
    /// Dial succeeds immediately but liveness never answers.
    Silent,
    /// Dial never completes.
    Hang,
}

impl Script {
    pub fn after(ms: u64) -> Script {
        Script::Healthy {
            dial: Duration::ZERO,
            liveness: Duration::from_millis(ms),
        }
    }
}

pub struct MockConnection {
    url: String,
    chain_id: String,
    liveness_delay: Option<Duration>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockConnection {
    pub fn was_disconnected(&self) -> bool {
        self.disconnects.load(Ordering::SeqCst) > 0
    }

    /// Simulates the node dropping the socket.
    pub fn drop_remote(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcConnection for MockConnection {
    fn endpoint_url(&self) -> &str {
        &self.url
    }

    fn chain_id(&self) -> Option<String> {
        Some(self.chain_id.clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, _method: &str, _params: Value) -> Result<Value> {
        if !self.is_connected() {
            anyhow::bail!("closed");
        }
        Ok(Value::Null)
    }

    async fn liveness(&self) -> Result<Value> {
        match self.liveness_delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Value::String(self.chain_id.clone()))
            }
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockConnector {
    scripts: Mutex<HashMap<String, Script>>,
    opened: Mutex<Vec<Arc<MockConnection>>>,
    dials: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn dial_count(&self, url: &str) -> usize {
        self.dials.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn total_dials(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    /// Most recent connection opened against `url`.
    pub fn connection(&self, url: &str) -> Option<Arc<MockConnection>> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.url == url)
            .cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn dial(&self, url: &str) -> Result<ConnectionHandle> {
        self.dials.lock().unwrap().push(url.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(Script::after(0));
        let liveness_delay = match script {
            Script::Healthy { dial, liveness } => {
                tokio::time::sleep(dial).await;
                Some(liveness)
            }
            Script::Refuse(delay) => {
                tokio::time::sleep(delay).await;
                anyhow::bail!("connection refused: {url}");
            }
            Script::Silent => None,
            Script::Hang => std::future::pending().await,
        };
        let conn = Arc::new(MockConnection {
            url: url.to_string(),
            chain_id: "0xmock".to_string(),
            liveness_delay,
            connected: AtomicBool::new(true),
            disconnects: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
