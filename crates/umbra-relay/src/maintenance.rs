//! Periodic maintenance.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::ProxyError;
use crate::manager::ProxyInner;

/// Ticks between status lines
const STATUS_EVERY_TICKS: u64 = 6;

impl ProxyInner {
    /// One maintenance tick
    ///
    /// Every tick sweeps request timeouts, runs connection timers and checks
    /// the relay. Every `sweep_every_ticks` inbound queues are swept and dead
    /// connections failed; republishing is checked on its own cadence.
    pub(crate) fn maintenance_tick(self: &Arc<Self>, tick: u64) {
        if self.is_destroyed() {
            return;
        }
        self.check_request_timeouts();
        self.run_timers(tick % self.config.sweep_every_ticks == 0);
        self.check_relay(true);

        if tick % self.config.republish_every_ticks() == 0 {
            self.check_republish();
        }
        if tick % STATUS_EVERY_TICKS == 0 {
            let status = self.status();
            tracing::debug!(
                "Relay status: {} connections, relay {}, {} clients, {} keys, {} queued, {} failures",
                status.connections,
                status
                    .relay
                    .as_ref()
                    .map_or_else(|| "none".to_owned(), |r| format!("{} ({:?})", r.target, r.phase)),
                status.clients.len(),
                status.tracked_keys,
                status.queued_requests,
                status.consecutive_failures
            );
        }
    }

    fn run_timers(self: &Arc<Self>, sweep: bool) {
        let now = Instant::now();
        let (connections, registered) = {
            let registry = self.registry.lock();
            let registered: HashSet<u64> = registry
                .current_relay
                .iter()
                .chain(registry.inbound_relays.iter())
                .map(|conn| conn.id())
                .collect();
            (
                registry.connections.values().cloned().collect::<Vec<_>>(),
                registered,
            )
        };

        for conn in connections {
            if sweep {
                if let Some(server) = conn.as_relay_server() {
                    server.check_requests(&conn, &self.config, now);
                }
            }
            conn.timer_tick(now, &self.config);
            if sweep
                && !conn.is_closed()
                && !registered.contains(&conn.id())
                && conn.age(now) > self.config.dead_connection_age
            {
                conn.fail(ProxyError::timeout("dead connection"));
            }
        }
    }
}
