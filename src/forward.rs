//! Backend forwarding
//!
//! Relays one request/response pair to a backend through a pooled client.
//! Bodies stream in both directions and are never buffered in full. A
//! protocol upgrade the backend accepts becomes a raw byte tunnel.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, Instrument};
use url::Url;

/// Headers that only make sense for a single connection
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
    #[error("backend did not respond within {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Configuration for the forwarder
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Time allowed to establish a backend connection
    pub connect_timeout: Duration,
    /// Time allowed for the backend to send response headers
    pub request_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Pooled HTTP(S) client that forwards requests to backends
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_webpki_roots()
        .with_no_client_auth();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout));

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Forwarder initialized"
        );

        Ok(Self { client, config })
    }

    /// Send `req` to `target` and hand back the backend's response.
    ///
    /// The request timeout covers the wait for response headers; the body
    /// then streams for as long as the backend keeps sending.
    ///
    /// An upgrade request keeps its `Connection`/`Upgrade` headers. If the
    /// backend answers `101 Switching Protocols`, both connections are
    /// joined once the client side has switched too.
    pub async fn forward(
        &self,
        target: &Url,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let uri = rewrite_uri(target, req.uri())?;

        let protocol = upgrade_protocol(req.headers());
        let client_upgrade = protocol.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = &protocol {
            restore_upgrade(&mut parts.headers, protocol.clone());
        }
        parts.uri = uri;
        // Backends are spoken to over HTTP/1.1 regardless of the inbound protocol
        parts.version = Version::HTTP_11;

        let backend_req = Request::from_parts(parts, body);
        debug!(uri = %backend_req.uri(), "Forwarding request");

        let timeout = self.config.request_timeout;
        let mut response = tokio::time::timeout(timeout, self.client.request(backend_req))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

        let switched = match client_upgrade {
            Some(client) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                let backend = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(client, backend).in_current_span());
                upgrade_protocol(response.headers())
            }
            _ => None,
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = switched {
            restore_upgrade(&mut parts.headers, protocol);
        }

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Protocol named by an upgrade request or a `101` response, if any
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

/// Copy bytes both ways between the switched client and backend connections
async fn tunnel(client: OnUpgrade, backend: OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "Upgrade did not complete");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Point an inbound request URI at the backend.
///
/// Scheme and authority come from the target. The target path is a prefix
/// for the request path and both query strings are kept.
pub fn rewrite_uri(target: &Url, inbound: &Uri) -> Result<Uri, ForwardError> {
    let host = target
        .host_str()
        .ok_or_else(|| ForwardError::RequestBuild(format!("target {} has no host", target)))?;
    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut uri = format!(
        "{}://{}{}",
        target.scheme(),
        authority,
        join_paths(target.path(), inbound.path())
    );

    let queries: Vec<&str> = [target.query(), inbound.query()]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    if !queries.is_empty() {
        uri.push('?');
        uri.push_str(&queries.join("&"));
    }

    uri.parse::<Uri>()
        .map_err(|e| ForwardError::RequestBuild(format!("invalid backend uri '{}': {}", uri, e)))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(target: &str, inbound: &str) -> String {
        let target = Url::parse(target).unwrap();
        let inbound: Uri = inbound.parse().unwrap();
        rewrite_uri(&target, &inbound).unwrap().to_string()
    }

    #[test]
    fn test_rewrite_keeps_path_and_query() {
        assert_eq!(
            rewrite("http://10.0.0.5:3000", "/foo?bar=1"),
            "http://10.0.0.5:3000/foo?bar=1"
        );
        assert_eq!(rewrite("http://10.0.0.5:3000", "/"), "http://10.0.0.5:3000/");
    }

    #[test]
    fn test_rewrite_with_path_prefix() {
        assert_eq!(rewrite("http://backend/app", "/foo"), "http://backend/app/foo");
        assert_eq!(rewrite("http://backend/app/", "/foo"), "http://backend/app/foo");
        assert_eq!(rewrite("http://backend/app", "/"), "http://backend/app/");
    }

    #[test]
    fn test_rewrite_merges_queries() {
        assert_eq!(
            rewrite("http://backend/?token=abc", "/x?page=2"),
            "http://backend/x?token=abc&page=2"
        );
        assert_eq!(rewrite("http://backend/?token=abc", "/x"), "http://backend/x?token=abc");
    }

    #[test]
    fn test_rewrite_https_and_default_port() {
        assert_eq!(
            rewrite("https://192.168.1.1:4000", "/api"),
            "https://192.168.1.1:4000/api"
        );
        assert_eq!(rewrite("https://backend:443", "/api"), "https://backend/api");
    }

    #[test]
    fn test_rewrite_ipv6_target() {
        assert_eq!(rewrite("http://[::1]:8080", "/a"), "http://[::1]:8080/a");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert("host", HeaderValue::from_static("a.example.com"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("host"));
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_forwarder_config_default() {
        let config = ForwarderConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_forwarder_creation() {
        let config = ForwarderConfig {
            max_idle_per_host: 5,
            request_timeout: Duration::from_secs(3),
            ..Default::default()
        };

        let forwarder = Forwarder::new(config).unwrap();
        assert_eq!(forwarder.config.max_idle_per_host, 5);
        assert_eq!(forwarder.config.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert_eq!(
            upgrade_protocol(&headers),
            Some(HeaderValue::from_static("websocket"))
        );

        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        assert_eq!(upgrade_protocol(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("upgrade"));
        assert_eq!(upgrade_protocol(&headers), None);
    }

    #[test]
    fn test_upgrade_headers_survive_stripping() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));

        let protocol = upgrade_protocol(&headers).unwrap();
        strip_hop_by_hop(&mut headers);
        restore_upgrade(&mut headers, protocol);

        assert_eq!(headers.get("connection").unwrap(), "upgrade");
        assert_eq!(headers.get("upgrade").unwrap(), "websocket");
        assert!(headers.contains_key("sec-websocket-key"));
    }
}
