//! Prometheus scrape endpoint
//!
//! `GET /metrics` returns the text exposition of the worker's registry, `GET /health`
//! returns `OK`, anything else is a 404.

use bytes::Bytes;
use frameflow_common::{MetricsRegistry, Result};
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Bind the metrics listener
pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((address, port)).await?;
    Ok(listener)
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Build the response for `path`
pub fn route(path: &str, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    match path {
        "/health" => plain(StatusCode::OK, "OK"),
        "/metrics" => match metrics.gather() {
            Ok(text) => {
                let mut response = plain(StatusCode::OK, text);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
            Err(e) => {
                error!(error = %e, "Failed to gather metrics");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Serve scrapes until `shutdown` flips to `true`
pub async fn serve(
    listener: TcpListener,
    metrics: MetricsRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local: SocketAddr = listener.local_addr()?;
    info!("Metrics endpoint listening on http://{}/metrics", local);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        debug!(%peer, "Metrics connection accepted");

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(req.uri().path(), &metrics);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %err, "Metrics connection ended with error");
            }
        });
    }

    info!("Metrics endpoint stopped");
    Ok(())
}
