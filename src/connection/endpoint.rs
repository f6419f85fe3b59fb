//! DevTools endpoint discovery.
//!
//! A debuggable browser exposes an HTTP endpoint (`/json/version`) that
//! reports the WebSocket URL to attach to. Attach tries an ordered list
//! of candidate endpoints until one answers; the exhausted-candidates
//! error names every endpoint tried plus the last underlying failure.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::ConnectOptions;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for one `/json/version` probe.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// VersionInfo
// ============================================================================

/// Payload of the `/json/version` discovery endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    /// WebSocket URL of the browser-level DevTools endpoint.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,

    /// Browser product string (`Chrome/123.0...`).
    #[serde(rename = "Browser", default)]
    pub browser: String,
}

// ============================================================================
// Candidate Construction
// ============================================================================

/// Builds the ordered candidate list of HTTP discovery endpoints.
///
/// Order: explicit browser URL, configured host:port, IPv4 loopback,
/// `localhost`, IPv6 loopback. Duplicates collapse while preserving the
/// first occurrence.
#[must_use]
pub fn candidate_endpoints(options: &ConnectOptions) -> Vec<String> {
    let port = options.port;
    let mut candidates = Vec::new();

    if let Some(ref url) = options.browser_url {
        candidates.push(url.trim_end_matches('/').to_string());
    }

    candidates.push(format!("http://{}:{port}", options.host));
    candidates.push(format!("http://127.0.0.1:{port}"));
    candidates.push(format!("http://localhost:{port}"));
    candidates.push(format!("http://[::1]:{port}"));

    let mut deduped = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !deduped.contains(&candidate) {
            deduped.push(candidate);
        }
    }
    deduped
}

// ============================================================================
// Probing
// ============================================================================

/// Probes one discovery endpoint.
///
/// # Errors
///
/// [`Error::Http`] on transport failure, [`Error::Protocol`] when the
/// endpoint answers without a WebSocket URL.
pub async fn probe(client: &reqwest::Client, endpoint: &str) -> Result<VersionInfo> {
    let url = format!("{endpoint}/json/version");
    trace!(%url, "Probing discovery endpoint");

    let info: VersionInfo = client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if info.web_socket_debugger_url.is_empty() {
        return Err(Error::protocol(format!(
            "{url} answered without webSocketDebuggerUrl"
        )));
    }
    Ok(info)
}

/// Resolves the WebSocket attach URL by probing candidates in order.
///
/// # Errors
///
/// [`Error::AttachFailed`] naming every candidate tried and the last
/// underlying error once the list is exhausted.
pub async fn resolve_websocket_url(
    client: &reqwest::Client,
    options: &ConnectOptions,
) -> Result<String> {
    let candidates = candidate_endpoints(options);
    let mut attempted = Vec::with_capacity(candidates.len());
    let mut last_error = String::from("no candidates");

    for endpoint in &candidates {
        attempted.push(endpoint.clone());
        match probe(client, endpoint).await {
            Ok(info) => {
                debug!(%endpoint, browser = %info.browser, "Discovery endpoint answered");
                return Ok(info.web_socket_debugger_url);
            }
            Err(e) => {
                trace!(%endpoint, error = %e, "Candidate failed");
                last_error = e.to_string();
            }
        }
    }

    Err(Error::attach_failed(attempted, last_error))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order() {
        let options = ConnectOptions {
            host: "10.0.0.5".into(),
            port: 9333,
            browser_url: Some("http://debug.local:9333/".into()),
            ..ConnectOptions::default()
        };

        let candidates = candidate_endpoints(&options);
        assert_eq!(
            candidates,
            vec![
                "http://debug.local:9333",
                "http://10.0.0.5:9333",
                "http://127.0.0.1:9333",
                "http://localhost:9333",
                "http://[::1]:9333",
            ]
        );
    }

    #[test]
    fn test_candidates_dedupe_default_host() {
        let options = ConnectOptions::default();
        let candidates = candidate_endpoints(&options);

        // Default host is the IPv4 loopback; it must not appear twice.
        let loopbacks = candidates
            .iter()
            .filter(|c| c.contains("127.0.0.1"))
            .count();
        assert_eq!(loopbacks, 1);
        assert_eq!(candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint() {
        let client = reqwest::Client::new();
        // Reserved port with nothing listening.
        let err = probe(&client, "http://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_resolve_exhaustion_lists_candidates() {
        let client = reqwest::Client::new();
        let options = ConnectOptions {
            port: 1,
            ..ConnectOptions::default()
        };

        let err = resolve_websocket_url(&client, &options).await.unwrap_err();
        match err {
            Error::AttachFailed { attempted, .. } => {
                assert_eq!(attempted.len(), 3);
                assert!(attempted[0].contains("127.0.0.1:1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
