//! Minimal Lotus JSON-RPC client.

use crate::error::{ChainError, ChainResult};
use cid::Cid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A CID in Lotus JSON form: `{"/": "bafy..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidJson(pub Cid);

impl Serialize for CidJson {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut m = s.serialize_map(Some(1))?;
        m.serialize_entry("/", &self.0.to_string())?;
        m.end()
    }
}

impl<'de> Deserialize<'de> for CidJson {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Inner {
            #[serde(rename = "/")]
            cid: String,
        }
        let inner = Inner::deserialize(d)?;
        inner
            .cid
            .parse()
            .map(CidJson)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC v2 client for a Lotus daemon endpoint.
pub struct LotusClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl LotusClient {
    /// Build a client with the given per-call timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> ChainResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: api_endpoint(url.into()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Invoke a `Filecoin.*` method.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> ChainResult<R> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let resp: RpcResponse = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        // `result` may legitimately be null (e.g. a client with no datacap),
        // so decode whatever is there into the caller's shape.
        serde_json::from_value(resp.result)
            .map_err(|e| ChainError::Decode(format!("{method} result: {e}")))
    }
}

/// Accept both bare host URLs and full RPC paths.
fn api_endpoint(mut url: String) -> String {
    if !url.contains("/rpc/") {
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("rpc/v0");
    }
    url
}
