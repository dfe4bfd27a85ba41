//! HTTP health probe.

use crate::config::ProbeSettings;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on how much of a probe response body is read.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Why a probe judged an instance unhealthy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("invalid probe request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status: {actual} (expected {expected})")]
    UnexpectedStatus { expected: u16, actual: u16 },

    #[error("response body does not contain {0:?}")]
    BodyMismatch(String),
}

/// Probe `host:port` with `GET {endpoint}`.
///
/// The timeout covers the whole exchange: connect, request and response
/// body.
pub async fn probe(host: &str, port: u16, settings: &ProbeSettings) -> Result<(), ProbeError> {
    match timeout(settings.timeout, exchange(host, port, settings)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(settings.timeout)),
    }
}

async fn exchange(host: &str, port: u16, settings: &ProbeSettings) -> Result<(), ProbeError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(ProbeError::Connect)?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

    // The connection is driven on its own task; abort it whichever way the
    // probe ends, including on timeout.
    let _driver = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "health probe connection error");
        }
    }));

    let request = Request::builder()
        .method(Method::GET)
        .uri(settings.endpoint.as_str())
        .header(HOST, format!("{host}:{port}"))
        .header(USER_AGENT, "fleetguard-health")
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    check_status(response.status().as_u16(), settings)?;

    if let Some(expected) = &settings.expected_body {
        let body = Limited::new(response.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
            .map_err(|e| ProbeError::Body(e.to_string()))?
            .to_bytes();
        check_body(&body, expected)?;
    }

    Ok(())
}

fn check_status(status: u16, settings: &ProbeSettings) -> Result<(), ProbeError> {
    if status == settings.expected_status {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedStatus {
            expected: settings.expected_status,
            actual: status,
        })
    }
}

fn check_body(body: &[u8], expected: &str) -> Result<(), ProbeError> {
    if String::from_utf8_lossy(body).contains(expected) {
        Ok(())
    } else {
        Err(ProbeError::BodyMismatch(expected.to_string()))
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
