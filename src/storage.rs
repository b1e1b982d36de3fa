//! Durable key-value areas shared between processes ("tabs").
//!
//! Every context writing to an area has its own [`Storage::context_id`];
//! change events carry the id of the writer so a context can skip its own
//! echoes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: Uuid,
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn context_id(&self) -> Uuid;

    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, value: String) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

struct MemoryArea {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
    fail_writes: AtomicBool,
}

/// In-process area; [`MemoryStorage::sibling`] opens a second context on it.
#[derive(Clone)]
pub struct MemoryStorage {
    area: Arc<MemoryArea>,
    context: Uuid,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            area: Arc::new(MemoryArea {
                values: Mutex::new(HashMap::new()),
                changes,
                fail_writes: AtomicBool::new(false),
            }),
            context: Uuid::new_v4(),
        }
    }

    pub fn sibling(&self) -> Self {
        Self {
            area: self.area.clone(),
            context: Uuid::new_v4(),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.area.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn context_id(&self) -> Uuid {
        self.context
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .area
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage poisoned"))?;
        Ok(values.get(key).cloned())
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        if self.area.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("storage write rejected for {key}");
        }
        let old_value = {
            let mut values = self
                .area
                .values
                .lock()
                .map_err(|_| anyhow::anyhow!("memory storage poisoned"))?;
            values.insert(key.to_string(), value.clone())
        };
        if old_value.as_deref() != Some(value.as_str()) {
            let _ = self.area.changes.send(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value),
                source: self.context,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.area.changes.subscribe()
    }
}

/// One JSON file per key; changes made by other processes are picked up
/// through a filesystem watcher.
pub struct FileStorage {
    dir: PathBuf,
    context: Uuid,
    known: Arc<Mutex<HashMap<String, Option<String>>>>,
    changes: broadcast::Sender<StorageChange>,
    _watcher: RecommendedWatcher,
}

impl FileStorage {
    /// Must be called inside a tokio runtime: the watcher feeds a spawned task.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let (changes, _) = broadcast::channel(64);
        let known: Arc<Mutex<HashMap<String, Option<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = event_tx.blocking_send(res);
            },
            notify::Config::default(),
        )?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))?;

        let task_known = known.clone();
        let task_changes = changes.clone();
        tokio::spawn(async move {
            while let Some(res) = event_rx.recv().await {
                let event = match res {
                    Ok(ev) => ev,
                    Err(err) => {
                        crate::logging::warn(format!("storage watch error: {err:?}"));
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                for path in event.paths {
                    let Some(key) = key_from_path(&path) else {
                        continue;
                    };
                    let new_value = tokio::fs::read_to_string(&path).await.ok();
                    if new_value.is_none() {
                        continue;
                    }
                    let old_value = {
                        let Ok(mut known) = task_known.lock() else {
                            continue;
                        };
                        let previous = known.get(&key).cloned().flatten();
                        if previous == new_value {
                            continue;
                        }
                        known.insert(key.clone(), new_value.clone());
                        previous
                    };
                    let _ = task_changes.send(StorageChange {
                        key,
                        old_value,
                        new_value,
                        source: Uuid::nil(),
                    });
                }
            }
        });

        Ok(Self {
            dir: dir.to_path_buf(),
            context: Uuid::new_v4(),
            known,
            changes,
            _watcher: watcher,
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("invalid storage key: {key:?}");
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn context_id(&self) -> Uuid {
        self.context
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        let value = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", path.display()));
            }
        };
        if let Ok(mut known) = self.known.lock() {
            known.insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key)?;
        // Recorded before the rename so the watcher recognises our own write.
        if let Ok(mut known) = self.known.lock() {
            known.insert(key.to_string(), Some(value.clone()));
        }
        let tmp = self.dir.join(format!(".{key}.{}.tmp", self.context.as_simple()));
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

fn key_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(".json").map(str::to_string)
}
