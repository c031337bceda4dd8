//! Relay selection.
//!
//! Candidates are tried in order: the relay we just lost (a few times), a
//! shuffled directory sample, then backup contacts from denial replies. An
//! attempt counts as made once its connection is opened; the outcome arrives
//! later through the connection's handshake or failure. When nothing can be
//! tried the failed-host cache is reset and the next tick tries again.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use umbra_crypto::random::random_id;

use crate::address::PeerAddress;
use crate::connection::{Connection, OutboundRelay, Role};
use crate::manager::ProxyInner;

/// Per-attempt uid length in bytes
const UID_LEN: usize = 32;

/// Endpoints a relay attempt is made from
struct LocalEndpoints {
    relay: PeerAddress,
    direct: PeerAddress,
    direct_bytes: Vec<u8>,
}

impl ProxyInner {
    /// Start a selection unless a usable relay exists or one is running
    ///
    /// Unforced checks stop after too many consecutive failed attempts.
    pub(crate) fn check_relay(self: &Arc<Self>, force: bool) {
        if self.is_destroyed() || !self.config.client_enabled {
            return;
        }
        if !force
            && self.consecutive_failures.load(Ordering::SeqCst) > self.config.consecutive_failure_limit
        {
            return;
        }
        {
            let mut registry = self.registry.lock();
            if registry.current_relay.as_ref().is_some_and(|conn| !conn.is_closed()) {
                return;
            }
            if registry.selecting {
                registry.recheck = true;
                return;
            }
            registry.selecting = true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.select_relay();
            let recheck = {
                let mut registry = inner.registry.lock();
                registry.selecting = false;
                std::mem::take(&mut registry.recheck)
            };
            if recheck {
                inner.check_relay(false);
            }
        });
    }

    fn select_relay(self: &Arc<Self>) -> bool {
        let Some(local) = self.local_endpoints() else {
            tracing::debug!("Overlay endpoints not ready, skipping relay selection");
            return false;
        };
        if !self.dht.is_ready() {
            tracing::debug!("DHT not ready, skipping relay selection");
            return false;
        }

        let retry = {
            let mut failures = self.failures.lock();
            match failures.failed_target.clone() {
                Some(target) if failures.failed_target_retries < self.config.failed_target_retries => {
                    failures.failed_target_retries += 1;
                    failures.failed_hosts.remove(&target.host);
                    Some(target)
                }
                Some(_) => {
                    failures.failed_target = None;
                    None
                }
                None => None,
            }
        };
        if let Some(target) = retry {
            tracing::debug!("Retrying previous relay {}", target);
            if self.try_relay(target, &local) {
                return true;
            }
        }

        if let Some(mut contacts) = self.directory.contacts(self.config.candidate_sample) {
            contacts.shuffle(&mut rand::thread_rng());
            for contact in contacts {
                if !contact.accepts_version(self.config.min_server_version) {
                    continue;
                }
                let Some(address) = contact.address else {
                    continue;
                };
                if self.try_relay(address, &local) {
                    return true;
                }
            }
        }

        let mut backups = self.failures.lock().backups.drain().into_iter();
        while let Some((address, ())) = backups.next() {
            if self.try_relay(address, &local) {
                let mut failures = self.failures.lock();
                for (rest, ()) in backups {
                    failures.backups.insert(rest, ());
                }
                return true;
            }
        }

        tracing::debug!("No relay candidates left, resetting failed hosts");
        self.failures.lock().failed_hosts.clear();
        false
    }

    fn local_endpoints(&self) -> Option<LocalEndpoints> {
        let relay = self.identity.relay_endpoint()?;
        let direct = self.identity.direct_endpoint()?;
        let direct_bytes = self.identity.host_to_bytes(&direct.host)?;
        Some(LocalEndpoints {
            relay,
            direct,
            direct_bytes,
        })
    }

    fn try_relay(self: &Arc<Self>, target: PeerAddress, local: &LocalEndpoints) -> bool {
        if target.host == local.relay.host || !self.identity.is_overlay_host(&target.host) {
            return false;
        }
        {
            let mut failures = self.failures.lock();
            if failures.failed_hosts.contains(&target.host) {
                return false;
            }
            failures.failed_hosts.insert(target.host.clone(), ());
        }
        let uid = match random_id(UID_LEN) {
            Ok(uid) => uid,
            Err(e) => {
                tracing::error!("Cannot generate relay uid: {}", e);
                return false;
            }
        };

        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Trying relay {}", target);
        let client = OutboundRelay::new(local.direct.clone(), local.direct_bytes.clone(), uid);
        Connection::open(self, target, Role::RelayClient(client));
        true
    }

    /// The current relay accepted us
    pub(crate) fn relay_setup_complete(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            failures.failed_hosts.remove(&conn.remote().host);
            failures.failed_target = None;
            failures.failed_target_retries = 0;
        }
        self.relay_activated(conn);
    }

    /// Fold a denying relay's suggestions into the backup pool
    pub(crate) fn add_backup_contacts(&self, contacts: Vec<PeerAddress>) {
        let mut failures = self.failures.lock();
        for contact in contacts {
            if !failures.failed_hosts.contains(&contact.host) {
                failures.backups.insert(contact, ());
            }
        }
    }

    /// Alternative relays to offer a denied client
    pub(crate) fn denial_contacts(&self, min_version: u32) -> Vec<PeerAddress> {
        let own = self.identity.relay_endpoint().map(|endpoint| endpoint.host);
        let Some(mut contacts) = self.directory.contacts(self.config.denial_contact_sample) else {
            return Vec::new();
        };
        contacts.shuffle(&mut rand::thread_rng());
        contacts
            .into_iter()
            .filter(|contact| contact.accepts_version(min_version))
            .filter_map(|contact| contact.address)
            .filter(|address| own.as_deref() != Some(address.host.as_str()))
            .take(self.config.denial_contact_limit)
            .collect()
    }
}
