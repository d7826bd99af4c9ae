//! Node configuration.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use crate::common::Id;
use crate::{Error, Result};

/// Default per-request timeout before an outstanding request is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default maintenance period.
pub const DEFAULT_CRON_INTERVAL: Duration = Duration::from_secs(15);
/// Default bucket freshness horizon before a refresh lookup is issued.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
/// Default supervisor cleaner period, a quarter of the request timeout.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Hook invoked on every maintenance pass; the republishing logic itself
/// lives outside this crate.
pub type RepublishHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
/// Node configuration. All values have defaults.
pub struct Config {
    /// Max peers per bucket.
    ///
    /// Controls the redundancy factor of the DHT node.
    pub k: usize,
    /// Iterative-lookup parallelism.
    pub alpha: usize,
    /// Maintenance period.
    pub cron_interval: Duration,
    /// Bucket freshness horizon before refresh.
    pub stale_after: Duration,
    /// Supervisor cleaner period.
    pub sweep_interval: Duration,
    /// Per-request timeout.
    ///
    /// The longer this duration is, the longer lookups take until they are
    /// deemed done. The shorter it is, the more responses from busy peers we
    /// miss out on.
    pub request_timeout: Duration,
    /// Seed peers contacted while the routing table is empty.
    pub bootstrap: Vec<SocketAddrV4>,
    /// Override the generated local id (testing / bootstrap).
    pub local_id: Option<Id>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None: the default DHT port, falling back to an
    /// OS-assigned one.
    pub port: Option<u16>,
    /// Republish hook, called once per maintenance pass.
    pub republish: Option<RepublishHook>,
}

impl Config {
    /// Reject configurations that cannot run. Fatal at startup only.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::InvalidConfig("k must be at least 1"));
        }
        if self.alpha == 0 {
            return Err(Error::InvalidConfig("alpha must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be non-zero"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval must be non-zero"));
        }
        if self.cron_interval.is_zero() {
            return Err(Error::InvalidConfig("cron_interval must be non-zero"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            cron_interval: DEFAULT_CRON_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bootstrap: Vec::new(),
            local_id: None,
            port: None,
            republish: None,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("k", &self.k)
            .field("alpha", &self.alpha)
            .field("cron_interval", &self.cron_interval)
            .field("stale_after", &self.stale_after)
            .field("sweep_interval", &self.sweep_interval)
            .field("request_timeout", &self.request_timeout)
            .field("bootstrap", &self.bootstrap)
            .field("local_id", &self.local_id)
            .field("port", &self.port)
            .field("republish", &self.republish.as_ref().map(|_| "Fn"))
            .finish()
    }
}
