//! Replica HTTP probes.
//!
//! Fetching is kept apart from parsing: a probe only returns the raw
//! readiness verdict or metrics text, and `tarn-metrics` turns the text
//! into samples.

use std::future::Future;
use std::time::Duration;

use http_body_util::BodyExt;
use tarn_core::Replica;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("request to {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },
    #[error("{uri} returned status {status}")]
    Status { uri: String, status: u16 },
    #[error("http error on {uri}: {reason}")]
    Http { uri: String, reason: String },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// How the controller observes one replica.
pub trait ReplicaProbe: Send + Sync + 'static {
    /// `Ok(true)` on 200, `Ok(false)` on any other status.
    fn ready(&self, replica: &Replica) -> impl Future<Output = ProbeResult<bool>> + Send;

    /// Raw text exposition from the replica's metrics endpoint.
    fn metrics(&self, replica: &Replica) -> impl Future<Output = ProbeResult<String>> + Send;
}

/// Probes an inference server over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub http_port: u16,
    pub metrics_port: u16,
    pub ready_path: String,
    pub metrics_path: String,
    pub ready_timeout: Duration,
    pub metrics_timeout: Duration,
}

impl HttpProbe {
    /// Probe for a Triton server: readiness on the HTTP port, metrics on
    /// the metrics port.
    pub fn triton(http_port: u16, metrics_port: u16) -> Self {
        Self {
            http_port,
            metrics_port,
            ready_path: "/v2/health/ready".to_string(),
            metrics_path: "/metrics".to_string(),
            ready_timeout: Duration::from_secs(2),
            metrics_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeouts(mut self, ready: Duration, metrics: Duration) -> Self {
        self.ready_timeout = ready;
        self.metrics_timeout = metrics;
        self
    }
}

impl ReplicaProbe for HttpProbe {
    async fn ready(&self, replica: &Replica) -> ProbeResult<bool> {
        let address = format!("{}:{}", replica.host, self.http_port);
        let (status, _) = http_get(&address, &self.ready_path, self.ready_timeout).await?;
        if status != http::StatusCode::OK {
            debug!(replica = %replica.id, %status, "replica not ready");
        }
        Ok(status == http::StatusCode::OK)
    }

    async fn metrics(&self, replica: &Replica) -> ProbeResult<String> {
        let address = format!("{}:{}", replica.host, self.metrics_port);
        let (status, body) = http_get(&address, &self.metrics_path, self.metrics_timeout).await?;
        if !status.is_success() {
            return Err(ProbeError::Status {
                uri: format!("http://{address}{}", self.metrics_path),
                status: status.as_u16(),
            });
        }
        Ok(body)
    }
}

/// GET `path` from `address` and collect the body as text.
///
/// The whole exchange, connect included, is bounded by `timeout`.
pub async fn http_get(
    address: &str,
    path: &str,
    timeout: Duration,
) -> ProbeResult<(http::StatusCode, String)> {
    let uri = format!("http://{address}{path}");

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| ProbeError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Http {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "tarn-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Http {
                uri: uri.clone(),
                reason: e.to_string(),
            })?;

        let resp = sender.send_request(req).await.map_err(|e| ProbeError::Http {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::Http {
                uri: uri.clone(),
                reason: e.to_string(),
            })?
            .to_bytes();

        Ok::<_, ProbeError>((status, String::from_utf8_lossy(&body).into_owned()))
    };

    let outcome = tokio::time::timeout(timeout, exchange).await;
    match outcome {
        Ok(result) => {
            if let Err(e) = &result {
                debug!(error = %e, %uri, "probe failed");
            }
            result
        }
        Err(_) => {
            debug!(%uri, "probe timed out");
            Err(ProbeError::Timeout { uri, timeout })
        }
    }
}
