use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Preference value meaning "pick the fastest responding endpoint".
pub const AUTO_MODE: &str = "AutoMode";

const AUTO_MODE_NAME: &str = "Auto Mode";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Wss,
    Light,
    Auto,
}

impl Protocol {
    pub fn of(url: &str) -> Option<Protocol> {
        let url = url.trim();
        if url == AUTO_MODE {
            return Some(Protocol::Auto);
        }
        if url.starts_with("light://") {
            return Some(Protocol::Light);
        }
        if url.starts_with("wss://") || url.starts_with("ws://") {
            return Some(Protocol::Wss);
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Wss => "wss",
            Protocol::Light => "light",
            Protocol::Auto => "auto",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    pub display_name: String,
    pub url: String,
    pub protocol: Protocol,
}

impl EndpointDescriptor {
    pub fn new(display_name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let protocol = Protocol::of(&url).with_context(|| format!("unsupported endpoint {url}"))?;
        if protocol != Protocol::Auto {
            Url::parse(&url).with_context(|| format!("invalid endpoint url {url}"))?;
        }
        Ok(Self {
            display_name: display_name.into(),
            url,
            protocol,
        })
    }

    pub fn auto() -> Self {
        Self {
            display_name: AUTO_MODE_NAME.to_string(),
            url: AUTO_MODE.to_string(),
            protocol: Protocol::Auto,
        }
    }

    pub fn is_live_socket(&self) -> bool {
        self.protocol == Protocol::Wss
    }
}

#[derive(Debug)]
pub struct UnknownChain(pub String);

impl std::fmt::Display for UnknownChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no endpoints known for chain {}", self.0)
    }
}

impl std::error::Error for UnknownChain {}

/// Source of candidate endpoints per chain.
pub trait NetworkCatalogue: Send + Sync {
    fn endpoints(&self, chain_id: &str) -> Result<Vec<EndpointDescriptor>>;

    fn live_socket_endpoints(&self, chain_id: &str) -> Result<Vec<EndpointDescriptor>> {
        Ok(self
            .endpoints(chain_id)?
            .into_iter()
            .filter(EndpointDescriptor::is_live_socket)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    chains: Vec<ChainEntry>,
}

#[derive(Debug, Deserialize)]
struct ChainEntry {
    chain_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    name: String,
    url: String,
}

#[derive(Clone, Debug, Default)]
pub struct StaticCatalogue {
    chains: HashMap<String, Vec<EndpointDescriptor>>,
    names: HashMap<String, String>,
}

impl StaticCatalogue {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read catalogue {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parse catalogue {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: CatalogueFile = serde_yaml::from_str(raw)?;
        let mut out = StaticCatalogue::default();
        for chain in file.chains {
            let chain_id = chain.chain_id.trim().to_lowercase();
            if chain_id.is_empty() {
                anyhow::bail!("chain entry without chain_id");
            }
            let mut endpoints = Vec::with_capacity(chain.endpoints.len());
            for ep in chain.endpoints {
                let desc = EndpointDescriptor::new(ep.name, ep.url.trim())
                    .with_context(|| format!("chain {chain_id}"))?;
                endpoints.push(desc);
            }
            if let Some(name) = chain.name {
                out.names.insert(chain_id.clone(), name);
            }
            out.insert(chain_id, endpoints);
        }
        Ok(out)
    }

    /// Adds or replaces a chain, keeping exactly one auto entry in front and
    /// dropping repeated urls.
    pub fn insert(&mut self, chain_id: impl Into<String>, endpoints: Vec<EndpointDescriptor>) {
        let mut seen = HashSet::new();
        let mut normalized = vec![EndpointDescriptor::auto()];
        seen.insert(AUTO_MODE.to_string());
        for ep in endpoints {
            if seen.insert(ep.url.clone()) {
                normalized.push(ep);
            }
        }
        self.chains.insert(chain_id.into().to_lowercase(), normalized);
    }

    pub fn chain_name(&self, chain_id: &str) -> Option<&str> {
        self.names.get(chain_id).map(String::as_str)
    }

    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl NetworkCatalogue for StaticCatalogue {
    fn endpoints(&self, chain_id: &str) -> Result<Vec<EndpointDescriptor>> {
        self.chains
            .get(&chain_id.to_lowercase())
            .cloned()
            .ok_or_else(|| UnknownChain(chain_id.to_string()).into())
    }
}
