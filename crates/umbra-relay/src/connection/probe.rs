//! Reachability probes.
//!
//! A relay only accepts a client after reaching the client's claimed direct
//! endpoint itself and getting back the uid from the allocation request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::Connection;
use crate::error::{ProxyError, Result};
use crate::manager::ProxyInner;
use crate::protocol::ProxyMessage;

/// Probe opened by this node while admitting a relay client
#[derive(Debug)]
pub(crate) struct OutboundProbe {
    target: Weak<Connection>,
    uid: String,
    relay_host: String,
    succeeded: AtomicBool,
}

impl OutboundProbe {
    pub(crate) fn new(target: Weak<Connection>, uid: String, relay_host: String) -> Self {
        Self {
            target,
            uid,
            relay_host,
            succeeded: AtomicBool::new(false),
        }
    }

    pub(crate) fn on_connected(&self, conn: &Arc<Connection>, _inner: &Arc<ProxyInner>) -> Result<()> {
        conn.send(ProxyMessage::ProbeRequest {
            uid: self.uid.clone(),
            source_host: self.relay_host.clone(),
        });
        Ok(())
    }

    pub(crate) fn on_message(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        message: ProxyMessage,
    ) -> Result<()> {
        let ProxyMessage::ProbeReply = message else {
            return Err(ProxyError::protocol("unexpected message for probe"));
        };
        if !self.succeeded.swap(true, Ordering::SeqCst) {
            if let Some(target) = self.target.upgrade() {
                if let Some(server) = target.as_relay_server() {
                    server.probe_succeeded(&target, inner);
                }
            }
        }
        conn.close();
        Ok(())
    }

    pub(crate) fn on_closed(&self, inner: &Arc<ProxyInner>) {
        if self.succeeded.load(Ordering::SeqCst) {
            return;
        }
        if let Some(target) = self.target.upgrade() {
            if let Some(server) = target.as_relay_server() {
                server.probe_failed(&target, inner);
            }
        }
    }
}

/// Probe received from a relay this node asked for service
#[derive(Debug, Default)]
pub(crate) struct InboundProbe;

impl InboundProbe {
    pub(crate) fn on_message(
        &self,
        conn: &Arc<Connection>,
        inner: &Arc<ProxyInner>,
        message: ProxyMessage,
    ) -> Result<()> {
        let ProxyMessage::ProbeRequest { uid, source_host } = message else {
            return Err(ProxyError::protocol("unexpected message for probe"));
        };
        conn.disconnect_after(inner.config.probe_timeout);
        if inner.current_relay_uid().as_deref() != Some(uid.as_str()) {
            return Err(ProxyError::protocol("probe uid mismatch"));
        }
        tracing::debug!("Answering probe from {}", source_host);
        conn.send(ProxyMessage::ProbeReply);
        Ok(())
    }
}
