//! Host-based routing table
//!
//! Built once at startup from validated configuration and read-only after
//! that, so lookups from concurrent requests need no locking.

use crate::config::ServiceConfig;
use crate::wake::{WakeDescriptor, WakeSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid services:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Lowercase a host and strip any `http://` or `https://` prefix.
///
/// Applied identically to configured match hosts and to request hosts.
pub fn normalize_host(host: &str) -> String {
    split_scheme(host.trim()).1.trim_end_matches('/').to_ascii_lowercase()
}

fn split_scheme(host: &str) -> (&'static str, &str) {
    let lower = host.to_ascii_lowercase();
    if lower.starts_with("https://") {
        ("https", &host["https://".len()..])
    } else if lower.starts_with("http://") {
        ("http", &host["http://".len()..])
    } else {
        ("http", host)
    }
}

/// Strip a trailing `:port`, leaving bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Whether a request host addresses `configured`, a normalized host.
/// Uses the same port rule as [`RoutingTable::lookup`].
pub fn host_matches(configured: &str, request_host: &str) -> bool {
    let host = normalize_host(request_host);
    !host.is_empty() && (host == configured || strip_port(&host) == configured)
}

/// Whether some request host would match both normalized hosts
pub fn hosts_overlap(a: &str, b: &str) -> bool {
    a == b || strip_port(a) == b || strip_port(b) == a
}

/// One configured service
#[derive(Debug)]
pub struct BackendRoute {
    id: String,
    match_scheme: &'static str,
    match_host: String,
    target: Url,
    wake: Option<WakeDescriptor>,
}

impl BackendRoute {
    /// Validate one service entry. `now` seeds the wake window so the backend
    /// is eligible for waking straight away.
    pub fn from_config(config: &ServiceConfig, now: DateTime<Utc>) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        let match_host = normalize_host(&config.match_host);
        if match_host.is_empty() {
            errors.push("match_host can't be blank".to_string());
        }

        let target = match config.target.trim() {
            "" => {
                errors.push("target can't be blank".to_string());
                None
            }
            raw => match parse_target(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    errors.push(e);
                    None
                }
            },
        };

        let wake = match &config.wake {
            Some(w) => match WakeDescriptor::new(&w.hardware_address, w.cooldown_minutes, now) {
                Ok(d) => Some(d),
                Err(e) => {
                    errors.push(format!("invalid wake info: {}", e));
                    None
                }
            },
            None => None,
        };

        match target {
            Some(target) if errors.is_empty() => Ok(Self {
                id: config
                    .id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                match_scheme: split_scheme(config.match_host.trim()).0,
                match_host,
                target,
                wake,
            }),
            _ => Err(errors),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Normalized host this route answers to
    pub fn match_host(&self) -> &str {
        &self.match_host
    }

    /// Public URL of the service (`scheme://match_host`)
    pub fn match_url(&self) -> String {
        format!("{}://{}", self.match_scheme, self.match_host)
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn wake(&self) -> Option<&WakeDescriptor> {
        self.wake.as_ref()
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            id: self.id.clone(),
            match_host: self.match_host.clone(),
            target: self.target.to_string(),
            wake: self.wake.as_ref().map(WakeDescriptor::snapshot),
        }
    }
}

fn parse_target(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("error parsing target '{}': {}", raw, e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!(
            "target '{}' must use http or https, not '{}'",
            raw,
            url.scheme()
        ));
    }
    if url.host_str().is_none() {
        return Err(format!("target '{}' has no host", raw));
    }
    Ok(url)
}

/// Serializable view of a route for the info API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    pub id: String,
    pub match_host: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake: Option<WakeSnapshot>,
}

/// Immutable host → route mapping, in configuration order
#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<BackendRoute>,
    by_host: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl RoutingTable {
    /// Build a table from service entries.
    ///
    /// Every invalid entry, every duplicate match host and every duplicate id
    /// is collected and reported in one error.
    pub fn build(services: &[ServiceConfig], now: DateTime<Utc>) -> Result<Self, RouteError> {
        let mut errors = Vec::new();
        let mut routes = Vec::with_capacity(services.len());
        let mut by_host: HashMap<String, usize> = HashMap::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for (i, service) in services.iter().enumerate() {
            let route = match BackendRoute::from_config(service, now) {
                Ok(route) => route,
                Err(entry_errors) => {
                    let label = service_label(i, service);
                    errors.extend(entry_errors.into_iter().map(|e| format!("{}: {}", label, e)));
                    continue;
                }
            };

            if let Some(first) = by_host.get(&route.match_host) {
                errors.push(format!(
                    "duplicate match_host '{}' in services {} and {}",
                    route.match_host, first, i
                ));
                continue;
            }
            if let Some(first) = by_id.get(&route.id) {
                errors.push(format!(
                    "duplicate id '{}' in services {} and {}",
                    route.id, first, i
                ));
                continue;
            }

            by_host.insert(route.match_host.clone(), i);
            by_id.insert(route.id.clone(), i);
            routes.push(route);
        }

        if !errors.is_empty() {
            return Err(RouteError::Invalid(errors));
        }

        // Positions above are config indices; every entry was accepted so they
        // line up with `routes`.
        Ok(Self { routes, by_host, by_id })
    }

    /// Find the route for a request host.
    ///
    /// A configured host without a port matches any port on the request;
    /// a configured host with a port must match it exactly.
    pub fn lookup(&self, host: &str) -> Option<&BackendRoute> {
        let host = normalize_host(host);
        if host.is_empty() {
            return None;
        }
        self.by_host
            .get(&host)
            .or_else(|| self.by_host.get(strip_port(&host)))
            .map(|&i| &self.routes[i])
    }

    pub fn get(&self, id: &str) -> Option<&BackendRoute> {
        self.by_id.get(id).map(|&i| &self.routes[i])
    }

    pub fn routes(&self) -> &[BackendRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RouteSnapshot> {
        self.routes.iter().map(BackendRoute::snapshot).collect()
    }
}

fn service_label(index: usize, service: &ServiceConfig) -> String {
    match service.id.as_deref().filter(|id| !id.trim().is_empty()) {
        Some(id) => format!("service {} ('{}')", index, id),
        None => format!("service {}", index),
    }
}
