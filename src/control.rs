use std::convert::Infallible;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eyre::{Result, WrapErr, bail};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::app::App;
use crate::forward::listener::is_exhaustion;
use crate::proxy::{ForwardRequest, ProxyError, json_response};

/// Bind the control endpoint on `addr`, moving on to the following ports
/// when it is taken. At most `probe` ports are tried.
pub async fn bind(addr: SocketAddr, probe: u16) -> Result<TcpListener> {
    if addr.port() == 0 {
        return TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind control endpoint on {addr}"));
    }

    for i in 0..probe {
        let Some(port) = addr.port().checked_add(i) else {
            break;
        };

        let candidate = SocketAddr::new(addr.ip(), port);
        match TcpListener::bind(candidate).await {
            Ok(x) => {
                if i == 0 {
                    info!("control endpoint on {}", display!(candidate));
                } else {
                    warn!(
                        "port {} is taken, control endpoint on {}",
                        addr.port(),
                        display!(candidate)
                    );
                }
                return Ok(x);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("{} is in use", display!(candidate));
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to bind control endpoint on {candidate}"));
            }
        }
    }

    bail!(
        "no free port for the control endpoint in {}..{}",
        addr.port(),
        addr.port().saturating_add(probe)
    )
}

/// Serve the control endpoint until `shutdown` flips.
pub async fn serve(listener: TcpListener, app: Arc<App>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            x = listener.accept() => match x {
                Ok(x) => x,
                Err(e) => {
                    warn!("failed to accept control connection: {}", display!(e));
                    if is_exhaustion(&e) {
                        sleep(Duration::from_millis(100)).await;
                    }
                    continue;
                }
            },
        };

        let app = Arc::clone(&app);
        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let app = Arc::clone(&app);
                async move { Ok::<_, Infallible>(handle(&app, req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                debug!("control connection from {peer} ended: {e}");
            }
        });
    }

    debug!("control endpoint stopped");
}

/// Split `/9000/api/items` into `9000` and `/api/items`.
fn split_port(path: &str) -> Option<(u16, &str)> {
    let rest = path.strip_prefix('/')?;
    let (port, rest) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    let port = port.parse().ok()?;
    Some((port, rest))
}

pub async fn handle<B>(app: &App, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, &app.health()),
        (&Method::GET, "/status") => json_response(StatusCode::OK, &app.status().await),
        (&Method::POST, "/reload") => reload(app).await,
        (&Method::POST, x) if x.starts_with("/forward/") => forward_port(app, x).await,
        _ => dispatch(app, req).await,
    }
}

async fn reload(app: &App) -> Response<Full<Bytes>> {
    match app.reload().await {
        Ok(x) => json_response(StatusCode::OK, &x),
        Err(e) => {
            error!("reload failed: {e}");

            let status = if e.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };

            let body = json!({
                "error": "reload_failed",
                "message": e.to_string(),
                "retryable": e.is_retryable(),
                "failed": e.report().map(|x| &x.failed),
            });
            json_response(status, &body)
        }
    }
}

fn not_found(message: String) -> Response<Full<Bytes>> {
    let body = json!({
        "error": "route_not_found",
        "message": message,
    });
    json_response(StatusCode::NOT_FOUND, &body)
}

/// `POST /forward/{port}/start` and `POST /forward/{port}/stop`.
async fn forward_port(app: &App, path: &str) -> Response<Full<Bytes>> {
    let action = path
        .strip_prefix("/forward/")
        .and_then(|x| x.split_once('/'))
        .and_then(|(port, action)| Some((port.parse::<u16>().ok()?, action)));

    match action {
        Some((port, "start")) => match app.start_forwarding(port).await {
            Ok(Some(started)) => {
                let status = if started {
                    "started"
                } else {
                    "already_forwarding"
                };
                json_response(
                    StatusCode::OK,
                    &json!({ "status": status, "external_port": port }),
                )
            }
            Ok(None) => not_found(format!("no active mapping for port {port}")),
            Err(e) => {
                warn!("cannot start port {port}: {e:#}");
                let body = json!({
                    "error": "start_failed",
                    "message": format!("{e:#}"),
                });
                json_response(StatusCode::SERVICE_UNAVAILABLE, &body)
            }
        },

        Some((port, "stop")) => {
            if app.stop_forwarding(port).await {
                json_response(
                    StatusCode::OK,
                    &json!({ "status": "stopped", "external_port": port }),
                )
            } else {
                not_found(format!("port {port} is not forwarded"))
            }
        }

        _ => not_found(format!("no route for {path}")),
    }
}

async fn dispatch<B>(app: &App, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let Some((port, rest)) = split_port(req.uri().path()) else {
        return not_found(format!("no route for {}", req.uri().path()));
    };

    let mut path_and_query = if rest.is_empty() {
        "/".to_owned()
    } else {
        rest.to_owned()
    };
    if let Some(q) = req.uri().query() {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(x) => x.to_bytes(),
        Err(e) => return ProxyError::Protocol(e.to_string()).into_response(),
    };

    let forward = ForwardRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    };

    app.router().handle(port, forward).await
}
