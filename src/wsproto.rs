use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness probe: the hash of block zero, i.e. the chain's genesis hash.
pub const LIVENESS_METHOD: &str = "chain_getBlockHash";

pub const WS_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFailure>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFailure {}

#[derive(Debug)]
pub enum Decoded {
    Response {
        id: u64,
        result: std::result::Result<Value, RpcFailure>,
    },
    Notification {
        method: String,
    },
    Other,
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<String> {
    let req = Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    };
    Ok(serde_json::to_string(&req)?)
}

pub fn liveness_params() -> Value {
    serde_json::json!([0])
}

pub fn decode_frame(raw: &str) -> Result<Decoded> {
    let env: Envelope = serde_json::from_str(raw)?;
    if let Some(method) = env.method {
        return Ok(Decoded::Notification { method });
    }
    // Servers echo ids either as numbers or as numeric strings.
    let id = match env.id {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        _ => None,
    };
    let Some(id) = id else {
        return Ok(Decoded::Other);
    };
    let result = match env.error {
        Some(err) => Err(err),
        None => Ok(env.result.unwrap_or(Value::Null)),
    };
    Ok(Decoded::Response { id, result })
}
