//! Operator HTTP server.
//!
//! Serves Prometheus metrics, a JSON stats snapshot and an aggregate health
//! endpoint.

use crate::state::AppState;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Operator HTTP server.
pub struct MetricsServer {
    /// Address to bind.
    address: SocketAddr,
    /// Path for the Prometheus endpoint.
    path: String,
    state: AppState,
}

impl MetricsServer {
    pub fn new(address: SocketAddr, path: String, state: AppState) -> Self {
        Self {
            address,
            path,
            state,
        }
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!(address = %self.address, path = %self.path, "metrics server started");

        let router = Arc::new(Router {
            metrics_path: self.path,
            state: self.state,
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let router = Arc::clone(&router);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let router = Arc::clone(&router);
                                    async move {
                                        Ok::<_, Infallible>(router.route(req.method(), req.uri().path()))
                                    }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

struct Router {
    metrics_path: String,
    state: AppState,
}

impl Router {
    fn route(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        debug!(path = %path, method = %method, "metrics request");

        if method != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
        }

        if path == self.metrics_path {
            match self.state.metrics().encode() {
                Ok(body) => respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, body),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n")
                }
            }
        } else if path == "/stats" {
            json(StatusCode::OK, &self.state.snapshot())
        } else if path == "/health" || path == "/healthz" {
            let report = self.state.balancers().health_report();
            let status = if report.is_serving() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &report)
        } else if path == "/" {
            let body = format!(
                "fleetguard\n\nEndpoints:\n  {} - Prometheus metrics\n  /stats - Balancer and breaker stats (JSON)\n  /health - Aggregate service health\n",
                self.metrics_path
            );
            text(StatusCode::OK, body)
        } else {
            text(StatusCode::NOT_FOUND, "Not found\n")
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", body)
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize response\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, InstanceConfig, StrategyKind};
    use http_body_util::BodyExt;

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn router() -> Router {
        let config = parse_config(
            r#"
services:
  - name: api
    instances:
      - { id: api-1, host: 10.0.0.1, port: 8080 }
"#,
        )
        .unwrap();
        let state = AppState::new(config);
        let api = state.balancers().get_or_create("api", StrategyKind::RoundRobin);
        api.register_instance(InstanceConfig::new("api-1", "10.0.0.1", 8080));
        state.breakers().get_or_default("api");

        Router {
            metrics_path: "/metrics".to_string(),
            state,
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router().route(&Method::GET, "/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        let text = body(response).await;
        assert!(text.contains("fleetguard_breaker_state"));
        assert!(text.contains("fleetguard_instance_health"));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let response = router().route(&Method::GET, "/stats");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let stats: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(stats["balancers"][0]["service"], "api");
        assert_eq!(stats["breakers"][0]["state"], "closed");
    }

    #[tokio::test]
    async fn test_health_endpoint_reflects_instances() {
        let router = router();
        assert_eq!(router.route(&Method::GET, "/health").status(), StatusCode::OK);

        let api = router.state.balancers().get("api").unwrap();
        api.instance("api-1").unwrap().set_healthy(false);

        let response = router.route(&Method::GET, "/health");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body(response).await.contains(r#""status":"unhealthy""#));
    }

    #[tokio::test]
    async fn test_other_routes() {
        let router = router();
        assert_eq!(router.route(&Method::POST, "/metrics").status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(router.route(&Method::GET, "/nope").status(), StatusCode::NOT_FOUND);
        assert!(body(router.route(&Method::GET, "/")).await.contains("/stats"));
    }
}
