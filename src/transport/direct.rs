//! Reqwest-backed direct transport strategy.
//!
//! Clients are pooled per proxy endpoint because reqwest binds the proxy at
//! client construction time. Pool entries are built lazily and reused for
//! the lifetime of the transport.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;

use super::{RequestDescriptor, ResponseEnvelope, Transport, TransportError};

/// Plain HTTP strategy honoring proxy, timeout, and headers.
pub struct DirectTransport {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().cookie_store(false);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportError::Network(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<ResponseEnvelope, TransportError> {
        let client = self
            .client(request.proxy.as_ref().map(|p| p.endpoint.as_str()))
            .await?;

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let mut builder = client
            .request(method, request.url.as_str())
            .headers(to_reqwest_headers(&request.headers)?)
            .timeout(request.timeout);
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = from_reqwest_headers(response.headers())?;
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(ResponseEnvelope {
            status,
            body,
            headers,
            elapsed: started.elapsed(),
            proxy_id: request.proxy.as_ref().map(|p| p.id),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

fn to_reqwest_headers(headers: &HeaderMap) -> Result<reqwest::header::HeaderMap, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn from_reqwest_headers(map: &reqwest::header::HeaderMap) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        let name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}
