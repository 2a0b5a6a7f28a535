//! Wake-on-LAN coordination
//!
//! Each backend that sleeps carries a [`WakeDescriptor`]. The [`WakeGate`]
//! decides from the descriptor's cooldown window whether a request should
//! emit a wake signal, and the [`WakeSender`] puts the signal on the wire.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Cooldown applied when a wake descriptor doesn't set one
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 60;

/// Default destination for magic packets (discard port on the limited broadcast address)
pub const DEFAULT_WAKE_BROADCAST: &str = "255.255.255.255:9";

const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("hardware address can't be blank")]
    BlankHardwareAddress,
    #[error("invalid hardware address '{0}'")]
    InvalidHardwareAddress(String),
    #[error("cooldown can't be negative (got {0} minutes)")]
    NegativeCooldown(i64),
    #[error("cooldown of {0} minutes is too large")]
    CooldownTooLarge(i64),
    #[error("failed to send wake signal: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of wall-clock time for the wake window
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sends a wake signal to a hardware address. Best effort: a returned error
/// is only ever logged or reported, never fatal to a request.
pub trait WakeSender: Send + Sync + 'static {
    fn send<'a>(&'a self, hardware_address: &'a str) -> BoxFuture<'a, Result<(), WakeError>>;
}

/// Parse `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or `AABBCCDDEEFF`
pub fn parse_hardware_address(address: &str) -> Result<[u8; 6], WakeError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(WakeError::BlankHardwareAddress);
    }

    let invalid = || WakeError::InvalidHardwareAddress(address.to_string());

    let digits: String = if trimmed.contains(':') || trimmed.contains('-') {
        let octets: Vec<&str> = trimmed.split([':', '-']).collect();
        if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
            return Err(invalid());
        }
        octets.concat()
    } else {
        trimmed.to_string()
    };

    let bytes = hex::decode(&digits).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Build the standard magic packet: six `0xFF` bytes then the address sixteen times
pub fn magic_packet(mac: &[u8; 6]) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFF; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(mac);
    }
    packet
}

/// Sends magic packets over UDP broadcast
#[derive(Debug, Clone)]
pub struct MagicPacketSender {
    broadcast: SocketAddr,
}

impl MagicPacketSender {
    pub fn new(broadcast: SocketAddr) -> Self {
        Self { broadcast }
    }

    async fn send_packet(&self, hardware_address: &str) -> Result<(), WakeError> {
        let mac = parse_hardware_address(hardware_address)?;
        let packet = magic_packet(&mac);

        let bind_addr = if self.broadcast.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        socket.send_to(&packet, self.broadcast).await?;

        debug!(hardware_address, broadcast = %self.broadcast, "Magic packet sent");
        Ok(())
    }
}

impl WakeSender for MagicPacketSender {
    fn send<'a>(&'a self, hardware_address: &'a str) -> BoxFuture<'a, Result<(), WakeError>> {
        self.send_packet(hardware_address).boxed()
    }
}

/// The cooldown window of one descriptor.
///
/// Always satisfies `next_eligible_at == last_wake_at + cooldown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeWindow {
    pub last_wake_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
}

/// Per-backend wake state.
///
/// The window sits behind its own lock so concurrent requests for one backend
/// serialize only against each other, never against the rest of the table.
#[derive(Debug)]
pub struct WakeDescriptor {
    hardware_address: String,
    cooldown_minutes: u32,
    window: Mutex<WakeWindow>,
}

impl WakeDescriptor {
    /// Validate and create a descriptor that is eligible for waking at `now`.
    pub fn new(
        hardware_address: &str,
        cooldown_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Self, WakeError> {
        parse_hardware_address(hardware_address)?;

        let cooldown_minutes = match cooldown_minutes {
            None => DEFAULT_COOLDOWN_MINUTES,
            Some(m) if m < 0 => return Err(WakeError::NegativeCooldown(m)),
            Some(m) => u32::try_from(m).map_err(|_| WakeError::CooldownTooLarge(m))?,
        };

        let cooldown = TimeDelta::minutes(i64::from(cooldown_minutes));
        Ok(Self {
            hardware_address: hardware_address.trim().to_string(),
            cooldown_minutes,
            window: Mutex::new(WakeWindow {
                last_wake_at: now - cooldown,
                next_eligible_at: now,
            }),
        })
    }

    pub fn hardware_address(&self) -> &str {
        &self.hardware_address
    }

    pub fn cooldown_minutes(&self) -> u32 {
        self.cooldown_minutes
    }

    pub fn cooldown(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.cooldown_minutes))
    }

    /// Consistent copy of both timestamps
    pub fn window(&self) -> WakeWindow {
        *self.window.lock()
    }

    /// True when `now` is at or past the end of the cooldown window
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.window.lock().next_eligible_at
    }

    /// Start a new window at `now`. `last_wake_at` never moves backwards.
    pub fn record_attempt(&self, now: DateTime<Utc>) -> WakeWindow {
        let mut window = self.window.lock();
        let at = now.max(window.last_wake_at);
        *window = WakeWindow {
            last_wake_at: at,
            next_eligible_at: at + self.cooldown(),
        };
        *window
    }

    /// Check eligibility and start a new window in one step.
    ///
    /// Of any number of concurrent callers inside one window, exactly one
    /// gets `true`.
    pub fn try_claim(&self, now: DateTime<Utc>) -> bool {
        let mut window = self.window.lock();
        if now < window.next_eligible_at {
            return false;
        }
        let at = now.max(window.last_wake_at);
        *window = WakeWindow {
            last_wake_at: at,
            next_eligible_at: at + self.cooldown(),
        };
        true
    }

    pub fn snapshot(&self) -> WakeSnapshot {
        let window = self.window();
        WakeSnapshot {
            hardware_address: self.hardware_address.clone(),
            cooldown_minutes: self.cooldown_minutes,
            last_wake_at: window.last_wake_at,
            next_eligible_at: window.next_eligible_at,
        }
    }
}

/// Serializable view of a descriptor for the info API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeSnapshot {
    pub hardware_address: String,
    pub cooldown_minutes: u32,
    pub last_wake_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
}

/// Decides when to wake a backend and sends the signal.
#[derive(Clone)]
pub struct WakeGate {
    sender: Arc<dyn WakeSender>,
    clock: Arc<dyn Clock>,
}

impl WakeGate {
    pub fn new(sender: Arc<dyn WakeSender>, clock: Arc<dyn Clock>) -> Self {
        Self { sender, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn should_wake(&self, descriptor: &WakeDescriptor) -> bool {
        descriptor.is_eligible(self.clock.now())
    }

    /// Claim the current window for a request-triggered wake. See
    /// [`WakeDescriptor::try_claim`].
    pub fn claim(&self, descriptor: &WakeDescriptor) -> bool {
        descriptor.try_claim(self.clock.now())
    }

    /// Send without touching any window. Used after a successful [`claim`](Self::claim).
    pub async fn send(&self, hardware_address: &str) -> Result<(), WakeError> {
        self.sender.send(hardware_address).await
    }

    /// Send unconditionally, then start a new window whatever the outcome.
    ///
    /// The sender's error is handed back for the caller to log or report.
    pub async fn wake(&self, descriptor: &WakeDescriptor) -> Result<(), WakeError> {
        let result = self.sender.send(descriptor.hardware_address()).await;
        descriptor.record_attempt(self.clock.now());
        result
    }
}
