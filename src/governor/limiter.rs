//! Rate Governor
//!
//! Per-address connection ceilings and sliding-window authentication limits.
//! All counters live behind a single mutex; every operation is a short
//! critical section of plain counter arithmetic.

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Governor limits
#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    /// Maximum simultaneously open connections per source address
    #[serde(default = "default_max_connections")]
    pub max_connections_per_ip: usize,

    /// Maximum authentication attempts per address inside one window
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts_per_minute: usize,

    /// Length of the authentication window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How often the background sweep prunes stale attempts, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_auth_attempts() -> usize {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections(),
            auth_attempts_per_minute: default_auth_attempts(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl GovernorConfig {
    /// Authentication window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sweep period as a duration (never zero)
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Default)]
struct Counters {
    /// Address → open connection count. Entries are removed at zero.
    connections: HashMap<String, usize>,
    /// Address → attempt timestamps, oldest first
    auth_attempts: HashMap<String, VecDeque<Instant>>,
}

/// Tracks open connections and authentication attempts per source address
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    counters: Mutex<Counters>,
}

impl RateGovernor {
    /// Create a governor with the given limits
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Limits this governor enforces
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    // A poisoned lock still holds consistent counters: no operation panics
    // between two related updates.
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `address` has fewer open connections than the ceiling
    pub fn can_admit_connection(&self, address: &str) -> bool {
        let counters = self.lock();
        counters.connections.get(address).copied().unwrap_or(0) < self.config.max_connections_per_ip
    }

    /// Count one more open connection for `address`
    pub fn admit_connection(&self, address: &str) {
        let mut counters = self.lock();
        *counters.connections.entry(address.to_string()).or_insert(0) += 1;
    }

    /// Release one open connection for `address`
    pub fn release_connection(&self, address: &str) {
        let mut counters = self.lock();
        if let Some(count) = counters.connections.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.connections.remove(address);
            }
        }
    }

    /// Check the ceiling and admit in one step
    ///
    /// Returns a guard that releases the connection when dropped, or `None`
    /// if the address is already at its ceiling.
    pub fn try_admit(self: &Arc<Self>, address: &str) -> Option<AdmissionGuard> {
        let mut counters = self.lock();
        let count = counters.connections.entry(address.to_string()).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            if *count == 0 {
                counters.connections.remove(address);
            }
            return None;
        }
        *count += 1;
        drop(counters);

        Some(AdmissionGuard {
            governor: Arc::clone(self),
            address: address.to_string(),
        })
    }

    /// Record an authentication attempt if the window allows one
    ///
    /// Rejected attempts are not recorded.
    pub fn can_attempt_authentication(&self, address: &str) -> bool {
        let now = Instant::now();
        let window = self.config.window();
        let mut counters = self.lock();

        let attempts = counters
            .auth_attempts
            .entry(address.to_string())
            .or_default();
        prune(attempts, now, window);

        if attempts.len() >= self.config.auth_attempts_per_minute {
            return false;
        }

        attempts.push_back(now);
        true
    }

    /// Drop out-of-window attempts for every address
    ///
    /// Returns the number of addresses that still have attempts on record.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        let mut counters = self.lock();

        counters.auth_attempts.retain(|_, attempts| {
            prune(attempts, now, window);
            !attempts.is_empty()
        });
        counters.auth_attempts.len()
    }

    /// Current open connection count for an address
    pub fn open_connections(&self, address: &str) -> usize {
        self.lock().connections.get(address).copied().unwrap_or(0)
    }

    /// Number of addresses with at least one open connection
    pub fn tracked_addresses(&self) -> usize {
        self.lock().connections.len()
    }

    /// Start the periodic sweep
    ///
    /// The task holds only a weak reference and stops once the governor is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let governor: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);

            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(live) = governor.upgrade() else {
                    break;
                };
                let remaining = live.sweep();
                tracing::trace!(addresses = remaining, "Pruned authentication attempts");
            }
        })
    }
}

fn prune(attempts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = attempts.front() {
        if now.duration_since(*oldest) >= window {
            attempts.pop_front();
        } else {
            break;
        }
    }
}

/// An admitted connection slot, released on drop
#[derive(Debug)]
pub struct AdmissionGuard {
    governor: Arc<RateGovernor>,
    address: String,
}

impl AdmissionGuard {
    /// Source address this slot belongs to
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.governor.release_connection(&self.address);
    }
}
