//! Latency probing through a core's stream dial capability
//!
//! Every probe request is carried by the dialer of the core being measured,
//! so the measured delay is the delay through the tunnel.

use crate::dial::{StreamDialer, TargetAddr};
use crate::error::{Error, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Delay reported for a URL that could not be probed
pub const FAILED_DELAY: i64 = -1;

/// What a failed URL does to the rest of the probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record [`FAILED_DELAY`] and continue with the next URL
    #[default]
    Soft,
    /// Abort the whole probe with the first error
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    /// Used for empty entries of the URL list
    #[serde(default = "default_probe_url")]
    pub default_url: String,
}

fn default_request_timeout_ms() -> u64 { 12_000 }
fn default_overall_timeout_ms() -> u64 { 15_000 }
fn default_probe_url() -> String { DEFAULT_PROBE_URL.to_string() }

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::Soft,
            request_timeout_ms: default_request_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            default_url: default_probe_url(),
        }
    }
}

impl ProbeSettings {
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Outcome for one probed URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub url: String,
    /// Milliseconds to the full response, or [`FAILED_DELAY`]
    pub delay: i64,
}

impl PingResult {
    pub fn failed(url: String) -> Self {
        Self { url, delay: FAILED_DELAY }
    }

    pub fn is_success(&self) -> bool {
        self.delay >= 0
    }
}

/// Probe `urls` in order through `dialer`.
///
/// Each request is bounded by the request timeout and by what is left of the
/// overall timeout; an expired timeout counts as a `Cancelled` failure of that
/// URL. Cancelling `cancel` aborts the probe under either policy.
pub async fn measure_ping(
    dialer: &dyn StreamDialer,
    urls: &[String],
    settings: &ProbeSettings,
    cancel: &CancellationToken,
) -> Result<Vec<PingResult>> {
    let deadline = Instant::now() + settings.overall_timeout();
    let mut results = Vec::with_capacity(urls.len());

    for url in urls {
        let url = if url.is_empty() { settings.default_url.clone() } else { url.clone() };
        let request_deadline = (Instant::now() + settings.request_timeout()).min(deadline);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout_at(request_deadline, probe_url(dialer, &url)) => {
                outcome.unwrap_or(Err(Error::Cancelled))
            }
        };

        match outcome {
            Ok(elapsed) => {
                debug!(url = %url, delay_ms = elapsed.as_millis() as u64, "probe succeeded");
                results.push(PingResult {
                    url,
                    delay: elapsed.as_millis() as i64,
                });
            }
            Err(e) => match settings.policy {
                FailurePolicy::Soft => {
                    debug!(url = %url, error = %e, "probe failed");
                    results.push(PingResult::failed(url));
                }
                FailurePolicy::Strict => return Err(e),
            },
        }
    }

    Ok(results)
}

/// GET `url` and time it until the body has been read
async fn probe_url(dialer: &dyn StreamDialer, url: &str) -> Result<Duration> {
    let uri: Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| Error::ConfigInvalid(format!("invalid probe url {}: {}", url, e)))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::ConfigInvalid(format!("no host in probe url {}", url)))?
        .to_string();
    let is_https = match uri.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        other => {
            return Err(Error::UnsupportedNetwork(format!(
                "probe scheme {}",
                other.unwrap_or("<none>")
            )))
        }
    };
    let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

    let start = Instant::now();
    let stream = dialer
        .dial_stream(&TargetAddr::from_host(&host, port))
        .await
        .map_err(|e| Error::NetworkFailure(e.to_string()))?;

    let status = if is_https {
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| Error::ConfigInvalid(format!("invalid server name {}", host)))?;
        let tls_stream = tls_connector()?
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::NetworkFailure(format!("TLS handshake: {}", e)))?;
        fetch_status(tls_stream, &uri).await?
    } else {
        fetch_status(stream, &uri).await?
    };

    if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
        return Err(Error::UpstreamFailure(format!("unexpected status {}", status)));
    }
    Ok(start.elapsed())
}

fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::NetworkFailure(format!("TLS setup: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn fetch_status<S>(io: S, uri: &Uri) -> Result<StatusCode>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::NetworkFailure(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("probe connection closed: {}", e);
        }
    });

    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority)
        .header(USER_AGENT, concat!("coreswitch/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::NetworkFailure(e.to_string()))?;
    let status = response.status();
    response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::NetworkFailure(e.to_string()))?;

    Ok(status)
}
