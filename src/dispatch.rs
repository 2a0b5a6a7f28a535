//! Per-request dispatch
//!
//! Picks the info API, the fallback, or a backend for each request, fires
//! the wake signal when a sleeping backend is due one, and forwards.

use crate::error::{fallback_response, json_error_response, ProxyBody, ProxyErrorCode};
use crate::forward::{ForwardError, Forwarder};
use crate::info::handle_info_request;
use crate::routes::{host_matches, normalize_host, BackendRoute, RoutingTable};
use crate::wake::WakeGate;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request handler shared by every connection
pub struct Dispatcher {
    routes: RoutingTable,
    forwarder: Forwarder,
    gate: WakeGate,
    info_host: Option<String>,
}

impl Dispatcher {
    pub fn new(routes: RoutingTable, forwarder: Forwarder, gate: WakeGate) -> Self {
        Self {
            routes,
            forwarder,
            gate,
            info_host: None,
        }
    }

    /// Serve the info API on `host` instead of routing it
    pub fn with_info_host(mut self, host: Option<String>) -> Self {
        self.info_host = host.map(|h| normalize_host(&h)).filter(|h| !h.is_empty());
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Handle one request end to end. Never fails: every error becomes a
    /// response.
    pub async fn handle(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = info_span!("request", request_id = %request_id);

        async move {
            let host = request_host(&req).unwrap_or_default();
            info!(
                host = %host,
                method = %req.method(),
                path = %req.uri().path(),
                remote = %client_addr,
                "Request"
            );

            let mut response = self.dispatch(req, &host, client_addr, &request_id).await;

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            info!(status = response.status().as_u16(), "Response");
            response
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        host: &str,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Response<ProxyBody> {
        if let Some(info_host) = &self.info_host {
            if host_matches(info_host, host) {
                return handle_info_request(req.method(), req.uri().path(), &self.routes, &self.gate)
                    .await;
            }
        }

        let Some(route) = self.routes.lookup(host) else {
            debug!(host, "No route for host");
            return fallback_response();
        };

        self.wake_if_due(route);
        self.forward(route, req, client_addr, request_id).await
    }

    /// Claim the wake window and send in the background; the request
    /// does not wait for the signal.
    fn wake_if_due(&self, route: &BackendRoute) {
        let Some(wake) = route.wake() else {
            return;
        };
        if !self.gate.claim(wake) {
            debug!(service = route.id(), "Backend woken recently, skipping wake signal");
            return;
        }

        let gate = self.gate.clone();
        let service = route.id().to_string();
        let hardware_address = wake.hardware_address().to_string();
        tokio::spawn(
            async move {
                match gate.send(&hardware_address).await {
                    Ok(()) => info!(%service, %hardware_address, "Sent wake signal"),
                    Err(e) => warn!(%service, %hardware_address, error = %e, "Failed to send wake signal"),
                }
            }
            .in_current_span(),
        );
    }

    async fn forward(
        &self,
        route: &BackendRoute,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Response<ProxyBody> {
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&forwarded_for(headers, client_addr.ip())) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        match self.forwarder.forward(route.target(), req).await {
            Ok(response) => response,
            Err(ForwardError::Timeout(timeout)) => {
                warn!(
                    service = route.id(),
                    target = %route.target(),
                    timeout_secs = timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                )
            }
            Err(e) => {
                // Detailed error in the log, generic message to the client
                error!(service = route.id(), target = %route.target(), error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
        }
    }
}

/// Append the client IP to any X-Forwarded-For chain already on the request
fn forwarded_for(headers: &HeaderMap, client_ip: IpAddr) -> String {
    let mut chain: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    chain.push(client_ip.to_string());
    chain.join(", ")
}

/// Host the client addressed: the Host header, or the URI authority for
/// absolute-form and HTTP/2 requests.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .map(|h| normalize_host(&h))
        .filter(|h| !h.is_empty())
}
