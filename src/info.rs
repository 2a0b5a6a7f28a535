//! Info host API
//!
//! Served when the request host is the configured info host: version,
//! service listing and explicit wake endpoints.

use crate::error::{full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::routes::{BackendRoute, RouteSnapshot, RoutingTable};
use crate::wake::{WakeDescriptor, WakeGate};
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVICES_PATH: &str = "/api/v1/services";
const WAKE_PATH: &str = "/wake/";

fn response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(body))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(
            ProxyErrorCode::InternalError,
            format!("Failed to encode response: {}", e),
        ),
    }
}

/// Body of `/api/v1/services/{id}/wol`: the service plus any send error
#[derive(Debug, Serialize)]
struct WakeResult {
    #[serde(flatten)]
    service: RouteSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Route an info host request.
///
/// Only the method and path matter; request bodies are ignored.
pub async fn handle_info_request(
    method: &Method,
    path: &str,
    routes: &RoutingTable,
    gate: &WakeGate,
) -> Response<ProxyBody> {
    debug!(%method, path, "Info API request");

    match (method, path) {
        (&Method::GET, "/api/v1/version") => response(StatusCode::OK, VERSION),

        (&Method::GET, SERVICES_PATH) => json_response(StatusCode::OK, &routes.snapshot()),

        // GET /api/v1/services/{id}/wol
        (&Method::GET, path) if wol_service_id(path).is_some() => {
            let id = wol_service_id(path).unwrap_or_default();
            let (route, wake) = match find_wakeable(routes, id) {
                Ok(found) => found,
                Err(resp) => return resp,
            };

            match gate.wake(wake).await {
                Ok(()) => {
                    info!(service = id, hardware_address = wake.hardware_address(), "Sent wake signal");
                    json_response(
                        StatusCode::OK,
                        &WakeResult { service: route.snapshot(), error: None },
                    )
                }
                Err(e) => {
                    warn!(service = id, error = %e, "Failed to send wake signal");
                    json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &WakeResult { service: route.snapshot(), error: Some(e.to_string()) },
                    )
                }
            }
        }

        // GET /wake/{id}: wake, then send the browser on to the service
        (&Method::GET, path) if path.starts_with(WAKE_PATH) => {
            let id = path.strip_prefix(WAKE_PATH).unwrap_or("");
            let (route, wake) = match find_wakeable(routes, id) {
                Ok(found) => found,
                Err(resp) => return resp,
            };

            match gate.wake(wake).await {
                Ok(()) => {
                    info!(service = id, hardware_address = wake.hardware_address(), "Sent wake signal");
                    Response::builder()
                        .status(StatusCode::SEE_OTHER)
                        .header(LOCATION, route.match_url())
                        .body(full_body(""))
                        .unwrap_or_else(|e| {
                            json_error_response(ProxyErrorCode::InternalError, e.to_string())
                        })
                }
                Err(e) => {
                    warn!(service = id, error = %e, "Failed to send wake signal");
                    json_error_response(
                        ProxyErrorCode::WakeFailed,
                        format!("Error waking up {}: {}", id, e),
                    )
                }
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn wol_service_id(path: &str) -> Option<&str> {
    path.strip_prefix(SERVICES_PATH)?
        .strip_prefix('/')?
        .strip_suffix("/wol")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

fn find_wakeable<'a>(
    routes: &'a RoutingTable,
    id: &str,
) -> Result<(&'a BackendRoute, &'a WakeDescriptor), Response<ProxyBody>> {
    let route = routes.get(id).ok_or_else(|| {
        json_error_response(ProxyErrorCode::UnknownService, format!("No service with id '{}'", id))
    })?;
    let wake = route.wake().ok_or_else(|| {
        json_error_response(
            ProxyErrorCode::WakeNotConfigured,
            format!("Service '{}' has no wake settings", id),
        )
    })?;
    Ok((route, wake))
}
