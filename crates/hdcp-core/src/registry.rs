//! Output -> session table with client admission control.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{HdcpError, RegistryError};
use crate::session::HdcpSession;

/// A display output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId(pub u32);

/// An external client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

#[derive(Default)]
struct Entries {
    sessions: BTreeMap<OutputId, Arc<HdcpSession>>,
    bindings: HashMap<ClientId, OutputId>,
}

/// Bounded table of sessions. Each output accepts one client at a time.
pub struct SessionRegistry {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn register(
        &self,
        output: OutputId,
        session: Arc<HdcpSession>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.sessions.contains_key(&output) {
            return Err(RegistryError::AlreadyRegistered(output.0));
        }
        if entries.sessions.len() >= self.capacity {
            return Err(RegistryError::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        info!(%output, link = %session.link_id(), "output registered");
        entries.sessions.insert(output, session);
        Ok(())
    }

    /// Remove the output, drop its client binding and shut the session down.
    pub async fn unregister(&self, output: OutputId) -> Result<(), RegistryError> {
        let session = {
            let mut entries = self.entries.lock();
            let session = entries
                .sessions
                .remove(&output)
                .ok_or(RegistryError::UnknownOutput(output.0))?;
            entries.bindings.retain(|_, bound| *bound != output);
            session
        };
        session.shutdown().await;
        info!(%output, "output unregistered");
        Ok(())
    }

    /// Bind `client` to `output`. Rebinding the same client is a no-op.
    pub fn open(&self, output: OutputId, client: ClientId) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if !entries.sessions.contains_key(&output) {
            return Err(RegistryError::UnknownOutput(output.0));
        }
        if let Some(owner) = entries
            .bindings
            .iter()
            .find_map(|(c, o)| (*o == output).then_some(*c))
        {
            if owner == client {
                return Ok(());
            }
            return Err(RegistryError::PermissionDenied(output.0));
        }
        if let Some(previous) = entries.bindings.get(&client) {
            if *previous != output {
                return Err(RegistryError::PermissionDenied(previous.0));
            }
        }
        debug!(%output, %client, "client bound");
        entries.bindings.insert(client, output);
        Ok(())
    }

    pub fn close(&self, client: ClientId) -> Result<(), RegistryError> {
        let output = self
            .entries
            .lock()
            .bindings
            .remove(&client)
            .ok_or(RegistryError::UnknownClient(client.0))?;
        debug!(%output, %client, "client released");
        Ok(())
    }

    pub fn session(&self, output: OutputId) -> Option<Arc<HdcpSession>> {
        self.entries.lock().sessions.get(&output).cloned()
    }

    /// The session bound to `client`.
    pub fn session_for(&self, client: ClientId) -> Result<Arc<HdcpSession>, RegistryError> {
        let entries = self.entries.lock();
        let output = entries
            .bindings
            .get(&client)
            .ok_or(RegistryError::UnknownClient(client.0))?;
        entries
            .sessions
            .get(output)
            .cloned()
            .ok_or(RegistryError::UnknownOutput(output.0))
    }

    /// Forward a hotplug event to the output's session.
    pub async fn hotplug(&self, output: OutputId, plugged: bool) -> Result<(), HdcpError> {
        match self.session(output) {
            Some(session) => session.set_plugged(plugged).await,
            None => {
                debug!(%output, plugged, "hotplug for unregistered output ignored");
                Ok(())
            }
        }
    }

    pub fn outputs(&self) -> Vec<OutputId> {
        self.entries.lock().sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.bindings.clear();
            std::mem::take(&mut entries.sessions).into_values().collect()
        };
        for session in sessions {
            session.shutdown().await;
        }
    }
}
