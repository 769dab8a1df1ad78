use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::mapping::{Snapshot, Target};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no mapping for port {0}")]
    RouteNotFound(u16),

    #[error("upstream {upstream} is unavailable: {reason}")]
    UpstreamUnavailable { upstream: String, reason: String },

    #[error("upstream {upstream} did not answer within {timeout:?}")]
    UpstreamTimeout { upstream: String, timeout: Duration },

    #[error("malformed request: {0}")]
    Protocol(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "route_not_found",
            Self::UpstreamUnavailable { .. } | Self::UpstreamTimeout { .. } => {
                "upstream_unavailable"
            }
            Self::Protocol(_) => "protocol_error",
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        json_response(self.status(), &body)
    }
}

pub fn json_response<T>(status: StatusCode, body: &T) -> Response<Full<Bytes>>
where
    T: serde::Serialize,
{
    let body = serde_json::to_vec(body).unwrap_or_default();

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Where requests for one external port are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    target: Target,
}

impl Upstream {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.target)
    }

    fn authority(&self) -> String {
        self.target.to_string()
    }
}

/// Port to upstream table. Never modified once built.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<u16, Upstream>,
}

impl RouteTable {
    pub fn get(&self, port: u16) -> Option<&Upstream> {
        self.routes.get(&port)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.routes.keys().copied().collect()
    }
}

impl From<&Snapshot> for RouteTable {
    fn from(snapshot: &Snapshot) -> Self {
        let routes = snapshot
            .iter()
            .map(|(port, mapping)| (*port, Upstream::new(mapping.target())))
            .collect();

        Self { routes }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Resolves inbound ports to upstreams and forwards HTTP requests to them.
#[derive(Debug)]
pub struct ProxyRouter {
    table: RwLock<Arc<RouteTable>>,
    timeout: Duration,
}

impl ProxyRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: RwLock::default(),
            timeout,
        }
    }

    /// The current table. Requests keep the table they started with even if
    /// a reload happens meanwhile.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&table)
    }

    /// Replace the whole table. Returns the number of routes.
    pub fn reload(&self, snapshot: &Snapshot) -> usize {
        let table = Arc::new(RouteTable::from(snapshot));
        let n = table.len();
        if table.is_empty() {
            warn!("no active mappings, every proxied request will be rejected");
        }

        for (port, upstream) in &table.routes {
            debug!("route {port} -> {}", upstream.base_url());
        }

        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        info!("loaded {n} route(s)");
        n
    }

    pub fn resolve(&self, port: u16) -> Option<Upstream> {
        self.snapshot().get(port).cloned()
    }

    /// Resolve and forward, turning every failure into an error response.
    pub async fn handle(&self, port: u16, req: ForwardRequest) -> Response<Full<Bytes>> {
        let Some(upstream) = self.resolve(port) else {
            debug!("no route for port {port}");
            return ProxyError::RouteNotFound(port).into_response();
        };

        let method = req.method.clone();
        let path = req.path_and_query.clone();

        match self.forward(req, &upstream).await {
            Ok(response) => {
                info!(
                    "{method} {path} -> {}{path} ({})",
                    upstream.base_url(),
                    response.status()
                );
                response
            }
            Err(e) => {
                warn!("{method} {path}: {e}");
                e.into_response()
            }
        }
    }

    /// Send `req` to `upstream` and return its response as is.
    ///
    /// The inbound `Host` header is replaced by the upstream's own. The whole
    /// exchange, including reading the response body, is bounded by the
    /// router's timeout.
    pub async fn forward(
        &self,
        req: ForwardRequest,
        upstream: &Upstream,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        match timeout(self.timeout, send(req, upstream)).await {
            Ok(x) => x,
            Err(_) => Err(ProxyError::UpstreamTimeout {
                upstream: upstream.base_url(),
                timeout: self.timeout,
            }),
        }
    }
}

async fn send(
    req: ForwardRequest,
    upstream: &Upstream,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    let unavailable = |reason: String| ProxyError::UpstreamUnavailable {
        upstream: upstream.base_url(),
        reason,
    };

    let target = &upstream.target;
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("cannot set TCP_NODELAY on upstream: {e}");
    }

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection ended: {e}");
        }
    });

    let host = HeaderValue::from_str(&upstream.authority())
        .map_err(|e| ProxyError::Protocol(e.to_string()))?;

    let mut headers = req.headers;
    headers.remove(header::HOST);
    headers.insert(header::HOST, host);

    let mut request = Request::builder()
        .method(req.method)
        .uri(req.path_and_query)
        .body(Full::new(req.body))
        .map_err(|e| ProxyError::Protocol(e.to_string()))?;
    *request.headers_mut() = headers;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .to_bytes();

    Ok(Response::from_parts(parts, Full::new(body)))
}
