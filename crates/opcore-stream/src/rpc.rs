//! Minimal JSON-RPC 2.0 client over `reqwest`, with optional engine-API JWT auth.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy_rpc_types_engine::{Claims, JwtSecret};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::L1SourceError;

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct Response<R> {
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// A JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcClient {
    client: Client,
    url: String,
    jwt: Option<JwtSecret>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, L1SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::from_client(client, url))
    }

    /// Wrap a preconfigured client, e.g. one holding a TLS identity.
    pub fn from_client(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into(), jwt: None, next_id: AtomicU64::new(1) }
    }

    /// Authenticate every request with a fresh HS256 token, as the engine API requires.
    pub fn with_jwt(mut self, secret: JwtSecret) -> Self {
        self.jwt = Some(secret);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method`; a `null` result is reported as `NotFound`.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, L1SourceError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        self.request_opt(method, params)
            .await?
            .ok_or_else(|| L1SourceError::NotFound(format!("{method} returned null")))
    }

    /// Call `method`, passing a `null` result through as `None`.
    pub async fn request_opt<P, R>(&self, method: &str, params: P) -> Result<Option<R>, L1SourceError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = Request { jsonrpc: "2.0", id, method, params };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(secret) = &self.jwt {
            req = req.bearer_auth(token(secret)?);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(L1SourceError::Jwt(format!("{method}: {status}")));
        }
        let bytes = resp.bytes().await?;
        let resp: Response<R> = serde_json::from_slice(&bytes)?;

        if let Some(err) = resp.error {
            return Err(L1SourceError::Rpc { code: err.code, message: err.message });
        }
        Ok(resp.result)
    }
}

fn token(secret: &JwtSecret) -> Result<String, L1SourceError> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| L1SourceError::Jwt(e.to_string()))?
        .as_secs();
    secret
        .encode(&Claims { iat, exp: Some(iat + 60) })
        .map_err(|e| L1SourceError::Jwt(e.to_string()))
}

/// `0x`-prefixed quantity, the way JSON-RPC block numbers are passed.
pub fn quantity(n: u64) -> String {
    format!("{n:#x}")
}
