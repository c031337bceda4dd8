//! Relay configuration
//!
//! All limits and timers of the relay client and server live here. Durations
//! serialize as whole seconds so the structure can be embedded in a TOML file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Relay client and server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Select and use an upstream relay
    pub client_enabled: bool,

    /// Accept inbound relay clients
    pub server_enabled: bool,

    /// Protocol version carried in every frame
    pub local_version: u32,

    /// Minimum version demanded of relays
    pub min_server_version: u32,

    /// Inbound relay clients admitted at once
    pub max_server_proxies: usize,

    /// Bound on tracked keys, locally and per inbound client
    pub max_key_state: usize,

    /// Capacity of the failed relay host cache
    pub failed_host_capacity: usize,

    /// Capacity of the backup contact cache
    pub backup_capacity: usize,

    /// Capacity of the failed connection uid cache
    pub failed_uid_capacity: usize,

    /// Concurrent relayed GETs per inbound client
    pub max_active_gets: usize,

    /// Concurrent relayed PUT/REMOVEs per inbound client
    pub max_active_mutations: usize,

    /// Queued relayed operations per inbound client before dropping
    pub max_queued_remote: usize,

    /// Maintenance tick
    #[serde(with = "secs")]
    pub tick_interval: Duration,

    /// Ticks between connection sweeps
    pub sweep_every_ticks: u64,

    /// Interval between republish checks
    #[serde(with = "secs")]
    pub republish_check_interval: Duration,

    /// Age after which a confirmed mutation is republished through a new relay
    #[serde(with = "secs")]
    pub republish_interval: Duration,

    /// Send a keepalive after this long without outbound traffic
    #[serde(with = "secs")]
    pub keepalive_interval: Duration,

    /// Fail a connection silent for this long
    #[serde(with = "secs")]
    pub idle_timeout: Duration,

    /// Age after which an unregistered connection is swept
    #[serde(with = "secs")]
    pub dead_connection_age: Duration,

    /// Bound on establishing a link
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// Forced disconnect of probe connections
    #[serde(with = "secs")]
    pub probe_timeout: Duration,

    /// Time given to a denial reply to flush before disconnecting
    #[serde(with = "secs")]
    pub deny_disconnect_delay: Duration,

    /// GET timeout when none is supplied, and ceiling for relayed GETs
    #[serde(with = "secs")]
    pub default_get_timeout: Duration,

    /// Bound on a local GET still waiting in the queue
    #[serde(with = "secs")]
    pub queued_get_ceiling: Duration,

    /// Relayed GETs with less remaining budget fail immediately
    #[serde(with = "secs")]
    pub min_get_budget: Duration,

    /// Relayed GET result limit when none is supplied
    pub default_num_want: u32,

    /// Requested result limits at or above this are ignored
    pub max_num_want: u32,

    /// Dispatcher idle wait before it checks whether to exit
    #[serde(with = "secs")]
    pub dispatcher_idle: Duration,

    /// Consecutive selection failures before backing off to periodic retries
    pub consecutive_failure_limit: u32,

    /// Retries of a relay that had been active before it failed
    pub failed_target_retries: u32,

    /// Directory contacts sampled per selection
    pub candidate_sample: usize,

    /// Directory contacts sampled for a denial reply
    pub denial_contact_sample: usize,

    /// Contacts included in a denial reply
    pub denial_contact_limit: usize,

    /// Shared inbound byte rate for relay traffic (bytes per second)
    pub inbound_rate_limit: u64,

    /// Announce that peers must use an encrypted handshake
    pub require_crypto: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_enabled: true,
            server_enabled: true,
            local_version: crate::PROTOCOL_VERSION,
            min_server_version: crate::PROTOCOL_VERSION,
            max_server_proxies: 4,
            max_key_state: 256,
            failed_host_capacity: 256,
            backup_capacity: 64,
            failed_uid_capacity: 8,
            max_active_gets: 16,
            max_active_mutations: 16,
            max_queued_remote: 128,
            tick_interval: Duration::from_secs(10),
            sweep_every_ticks: 3,
            republish_check_interval: Duration::from_secs(5 * 60),
            republish_interval: Duration::from_secs(8 * 60 * 60),
            keepalive_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            dead_connection_age: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(60),
            deny_disconnect_delay: Duration::from_secs(10),
            default_get_timeout: Duration::from_secs(120),
            queued_get_ceiling: Duration::from_secs(15),
            min_get_budget: Duration::from_secs(1),
            default_num_want: 32,
            max_num_want: 128,
            dispatcher_idle: Duration::from_secs(10),
            consecutive_failure_limit: 10,
            failed_target_retries: 3,
            candidate_sample: 128,
            denial_contact_sample: 16,
            denial_contact_limit: 5,
            inbound_rate_limit: 50 * 1024,
            require_crypto: false,
        }
    }
}

impl ProxyConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidConfig`] if a limit is zero or the timers
    /// contradict each other.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(ProxyError::invalid_config("tick_interval must be non-zero"));
        }
        if self.sweep_every_ticks == 0 {
            return Err(ProxyError::invalid_config("sweep_every_ticks must be non-zero"));
        }
        if self.keepalive_interval >= self.idle_timeout {
            return Err(ProxyError::invalid_config(
                "keepalive_interval must be shorter than idle_timeout",
            ));
        }
        if self.max_active_gets == 0 || self.max_active_mutations == 0 {
            return Err(ProxyError::invalid_config(
                "inbound concurrency caps must be non-zero",
            ));
        }
        if self.failed_host_capacity == 0 || self.backup_capacity == 0 || self.failed_uid_capacity == 0
        {
            return Err(ProxyError::invalid_config("cache capacities must be non-zero"));
        }
        if self.inbound_rate_limit == 0 {
            return Err(ProxyError::invalid_config("inbound_rate_limit must be non-zero"));
        }
        if self.default_num_want == 0 || self.default_num_want >= self.max_num_want {
            return Err(ProxyError::invalid_config(
                "default_num_want must be between 1 and max_num_want",
            ));
        }
        if self.dispatcher_idle.is_zero() {
            return Err(ProxyError::invalid_config("dispatcher_idle must be non-zero"));
        }
        Ok(())
    }

    /// Ticks between republish checks
    #[must_use]
    pub fn republish_every_ticks(&self) -> u64 {
        let ticks = self.republish_check_interval.as_millis() / self.tick_interval.as_millis().max(1);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_limits() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_server_proxies, 4);
        assert_eq!(config.max_key_state, 256);
        assert_eq!(config.failed_host_capacity, 256);
        assert_eq!(config.backup_capacity, 64);
        assert_eq!(config.failed_uid_capacity, 8);
        assert_eq!(config.republish_every_ticks(), 30);
    }

    #[test]
    fn test_keepalive_must_be_shorter_than_idle() {
        let config = ProxyConfig {
            keepalive_interval: Duration::from_secs(120),
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_caps_rejected() {
        let config = ProxyConfig {
            max_active_gets: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            backup_capacity: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_republish_ticks_at_least_one() {
        let config = ProxyConfig {
            tick_interval: Duration::from_secs(600),
            republish_check_interval: Duration::from_secs(60),
            ..ProxyConfig::default()
        };
        assert_eq!(config.republish_every_ticks(), 1);
    }
}
