//! Live RPC sessions and the dialers that open them.
//!
//! A [`ConnectionHandle`] is shared between the pool and every consumer that
//! reuses it; whoever decides a session is no longer needed calls
//! [`RpcConnection::disconnect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};

use crate::wsproto::{self, Decoded, RpcFailure};

pub type ConnectionHandle = Arc<dyn RpcConnection>;

#[async_trait]
pub trait RpcConnection: Send + Sync {
    fn endpoint_url(&self) -> &str;

    /// Genesis hash reported by the node, once a liveness call has succeeded.
    fn chain_id(&self) -> Option<String>;

    fn is_connected(&self) -> bool;

    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    async fn liveness(&self) -> Result<Value>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &str) -> Result<ConnectionHandle>;
}

#[derive(Debug)]
pub struct ConnectionClosed {
    pub endpoint_url: String,
}

impl std::fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection to {} is closed", self.endpoint_url)
    }
}

impl std::error::Error for ConnectionClosed {}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, RpcFailure>>>>>;

/// Dials `ws://` / `wss://` JSON-RPC endpoints.
#[derive(Clone, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn dial(&self, url: &str) -> Result<ConnectionHandle> {
        let conn = WsConnection::open(url).await?;
        Ok(Arc::new(conn))
    }
}

pub struct WsConnection {
    endpoint_url: String,
    chain_id: OnceLock<String>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: PendingReplies,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsConnection {
    pub async fn open(url: &str) -> Result<Self> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(wsproto::WS_MAX_MESSAGE_BYTES);
        let (ws_stream, _) = connect_async_with_config(url, Some(config), false)
            .await
            .with_context(|| format!("dial {url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let connected = Arc::new(AtomicBool::new(true));
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        // writer
        let writer_connected = connected.clone();
        let writer_url = url.to_string();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(err) = write.send(msg).await {
                    crate::logging::warn_kv(
                        "ws send error",
                        &[("url", &writer_url), ("err", &err.to_string())],
                    );
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // reader
        let reader_connected = connected.clone();
        let reader_pending = pending.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let txt = match msg {
                    Ok(Message::Text(txt)) => txt,
                    Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                        Ok(txt) => txt,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if let Ok(Decoded::Response { id, result }) = wsproto::decode_frame(&txt) {
                    let waiter = reader_pending.lock().ok().and_then(|mut p| p.remove(&id));
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(result);
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every caller with a closed error.
            if let Ok(mut p) = reader_pending.lock() {
                p.clear();
            }
        });

        Ok(Self {
            endpoint_url: url.to_string(),
            chain_id: OnceLock::new(),
            connected,
            next_id: AtomicU64::new(1),
            pending,
            outbound: tx,
            reader: read_task,
            writer: write_task,
        })
    }

    fn closed(&self) -> anyhow::Error {
        ConnectionClosed {
            endpoint_url: self.endpoint_url.clone(),
        }
        .into()
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}

#[async_trait]
impl RpcConnection for WsConnection {
    fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    fn chain_id(&self) -> Option<String> {
        self.chain_id.get().cloned()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut p = self
                .pending
                .lock()
                .map_err(|_| anyhow::anyhow!("pending table poisoned"))?;
            p.insert(id, tx);
        }
        // The reader flips the flag before draining, so checking after insert
        // cannot miss a concurrent shutdown.
        if !self.is_connected() {
            self.forget(id);
            return Err(self.closed());
        }
        let text = wsproto::encode_request(id, method, &params)?;
        if self.outbound.send(Message::Text(text)).await.is_err() {
            self.forget(id);
            return Err(self.closed());
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(self.closed()),
        }
    }

    async fn liveness(&self) -> Result<Value> {
        let value = self
            .request(wsproto::LIVENESS_METHOD, wsproto::liveness_params())
            .await?;
        if let Some(hash) = value.as_str() {
            let _ = self.chain_id.set(hash.to_string());
        }
        Ok(value)
    }

    async fn disconnect(&self) {
        // The flag may already be down after a failed write; the reader and
        // any waiters still need releasing then.
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None)).await;
        }
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
        // The writer exits on its own after flushing the close frame.
        self.reader.abort();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accepts websocket clients and never answers them.
    async fn mute_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn disconnect_after_write_failure_releases_waiters() {
        let url = mute_node().await;
        let conn = Arc::new(WsConnection::open(&url).await.unwrap());

        let caller = conn.clone();
        let waiting = tokio::spawn(async move { caller.request("system_name", Value::Null).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // What the writer leaves behind when a send fails.
        conn.connected.store(false, Ordering::SeqCst);
        conn.disconnect().await;

        let err = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter released")
            .unwrap()
            .unwrap_err();
        assert!(err.downcast_ref::<ConnectionClosed>().is_some());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.reader.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reader stopped");
    }
}
