//! The metrics web server.
//!
//! Serves the Prometheus exposition of this process' own telemetry on the
//! configured path, plus `/healthz` and `/readyz` probes for orchestrators.
//!
//! ## Metrics
//!
//! `prometheus_hetzner_sd_http_requests_total`: Requests served, per path class
//!

use std::{fmt, io, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, Response, body::Incoming};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::counter;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, pin, task::JoinSet, time};
use tracing::{debug, error, info, warn};

use crate::config;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Buckets for the `*_duration_seconds` histograms, in seconds.
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The Prometheus recorder could not be built or installed.
    #[error("Failed to install Prometheus recorder: {0}")]
    Recorder(#[from] BuildError),
}

/// Install the global Prometheus recorder and return a handle to render it.
///
/// # Errors
///
/// Function will error if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn build_response(
    status: StatusCode,
    headers: &[(header::HeaderName, &str)],
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.clone(), *value);
    }
    match builder.body(full(body)) {
        Ok(resp) => resp,
        Err(e) => {
            error!("Error building response: {e}");
            let mut resp = Response::new(full("Internal error building response"));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

#[derive(Clone)]
struct Handler {
    handle: PrometheusHandle,
    path: Arc<str>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Handler {
    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let path = req.uri().path();

        if req.method() != Method::GET && req.method() != Method::HEAD {
            counter!("prometheus_hetzner_sd_http_requests_total", "path" => "other").increment(1);
            return Ok(build_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &[(header::ALLOW, "GET, HEAD")],
                Bytes::new(),
            ));
        }

        let resp = if path == &*self.path {
            counter!("prometheus_hetzner_sd_http_requests_total", "path" => "metrics").increment(1);
            build_response(
                StatusCode::OK,
                &[(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
                self.handle.render(),
            )
        } else if path == "/healthz" || path == "/readyz" {
            counter!("prometheus_hetzner_sd_http_requests_total", "path" => "probe").increment(1);
            build_response(
                StatusCode::OK,
                &[(header::CONTENT_TYPE, "text/plain")],
                "OK",
            )
        } else if path == "/" {
            counter!("prometheus_hetzner_sd_http_requests_total", "path" => "other").increment(1);
            build_response(StatusCode::FOUND, &[(header::LOCATION, &*self.path)], Bytes::new())
        } else {
            counter!("prometheus_hetzner_sd_http_requests_total", "path" => "other").increment(1);
            build_response(StatusCode::NOT_FOUND, &[], Bytes::new())
        };
        Ok(resp)
    }
}

/// The metrics web server.
#[derive(Debug)]
pub struct Server {
    addr: String,
    handler: Handler,
    shutdown: hetzner_sd_signal::Watcher,
}

impl Server {
    /// Create a new [`Server`] rendering `handle` on the configured path.
    #[must_use]
    pub fn new(
        config: &config::Server,
        handle: PrometheusHandle,
        shutdown: hetzner_sd_signal::Watcher,
    ) -> Self {
        Self {
            addr: config.addr.clone(),
            handler: Handler {
                handle,
                path: Arc::from(config.path.as_str()),
            },
            shutdown,
        }
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Function will error if the address cannot be bound.
    pub async fn run(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr.as_str()).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener` until shutdown.
    ///
    /// Open connections get a short grace period after the shutdown signal
    /// and are aborted afterwards.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        info!(
            "Metrics server listening on {addr}, path {path}",
            addr = listener.local_addr()?,
            path = self.handler.path
        );

        let mut join_set = JoinSet::new();
        let mut upkeep = time::interval(UPKEEP_INTERVAL);

        let shutdown_fut = self.shutdown.recv();
        pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                _ = upkeep.tick() => {
                    self.handler.handle.run_upkeep();
                }

                Some(res) = join_set.join_next(), if !join_set.is_empty() => {
                    if let Err(e) = res {
                        error!("Could not join connection task: {e}");
                    }
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let handler = self.handler.clone();
                    join_set.spawn(async move {
                        let service = hyper::service::service_fn(move |req| {
                            handler.clone().handle_request(req)
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("Error serving {addr}: {e}");
                        }
                    });
                }
            }
        }

        drop(listener);
        let drained = time::timeout(DRAIN_TIMEOUT, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {open} connections still open after shutdown",
                open = join_set.len()
            );
            join_set.shutdown().await;
        }
        Ok(())
    }
}
