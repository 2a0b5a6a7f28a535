//! Wakegate - A host-routed HTTP gateway that wakes sleeping backends
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP traffic based on the Host header to configured backends
//! - Sends a Wake-on-LAN magic packet before forwarding to a backend that
//!   may be asleep, at most once per cooldown window
//! - Answers unknown hosts with a fixed fallback response
//! - Serves a small info API (version, services, explicit wake) on an
//!   optional info host
//! - Drains in-flight connections within a bounded time on shutdown

pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod info;
pub mod proxy;
pub mod routes;
pub mod wake;
