//! Device session registry
//!
//! Tracks every agent that has ever registered, keyed by the identity
//! derived from its connection metadata. Records are never removed on
//! disconnect; they flip to offline and stay until [`DeviceRegistry::prune_offline`]
//! reclaims them.
//!
//! # Push handles
//!
//! The agent transport owns the strong `mpsc::Sender` for its connection.
//! The registry keeps only a [`mpsc::WeakSender`], so a session is online
//! exactly while it holds a handle, and a handle that can no longer be
//! upgraded means the transport is gone. A failed upgrade flips the
//! session offline on the spot.
//!
//! # Connection epochs
//!
//! Each registration gets a fresh epoch. A transport reports its own
//! disconnect with [`DeviceRegistry::disconnect`], which is ignored when
//! the device has since re-registered over a newer connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use fc_core::error::{PushError, RegistryError};
use fc_core::ipc::FleetEvent;
use fc_core::records::{DeviceCounts, DeviceInfo};
use fc_core::time::{self, Timestamp};
use fc_core::types::{DeviceId, DeviceStatus, StatusFilter, UNKNOWN_MODEL};
use fc_protocol::Message;

use crate::events::{self, EventSender};

/// A command queued for delivery to one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Command name or text
    pub request: String,
    /// Extra arguments
    pub extras: Vec<String>,
}

impl AgentCommand {
    /// Create a new command
    pub fn new(request: impl Into<String>, extras: Vec<String>) -> Self {
        Self {
            request: request.into(),
            extras,
        }
    }

    /// Convert to the wire message
    pub fn into_message(self) -> Message {
        Message::Command {
            request: self.request,
            extras: self.extras,
        }
    }
}

/// Identity metadata an agent reports when it registers
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// Host name
    pub host: String,
    /// Device model
    pub model: Option<String>,
    /// Source address of the connection
    pub address: Option<String>,
}

impl DeviceMetadata {
    /// Stable identity for this metadata
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_metadata(&self.host, self.model.as_deref())
    }
}

/// Result of a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identity the session was stored under
    pub device_id: DeviceId,
    /// Epoch of this connection, passed back to [`DeviceRegistry::disconnect`]
    pub epoch: u64,
}

struct DeviceSession {
    model: String,
    address: Option<String>,
    connected_at: Timestamp,
    last_seen: Timestamp,
    disconnected_at: Option<Timestamp>,
    handle: Option<mpsc::WeakSender<AgentCommand>>,
    epoch: u64,
}

impl DeviceSession {
    fn status(&self) -> DeviceStatus {
        if self.handle.is_some() {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }

    fn info(&self, id: &DeviceId) -> DeviceInfo {
        DeviceInfo {
            id: id.clone(),
            model: self.model.clone(),
            address: self.address.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            disconnected_at: self.disconnected_at,
            status: self.status(),
        }
    }

    /// Drop the handle; returns whether the session was online
    fn go_offline(&mut self) -> bool {
        if self.handle.take().is_some() {
            self.disconnected_at = Some(time::now());
            true
        } else {
            false
        }
    }
}

/// Registry of agent device sessions
pub struct DeviceRegistry {
    sessions: DashMap<DeviceId, DeviceSession>,
    next_epoch: AtomicU64,
    events: EventSender,
}

impl DeviceRegistry {
    /// Create an empty registry publishing lifecycle events on `events`
    pub fn new(events: EventSender) -> Self {
        Self {
            sessions: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            events,
        }
    }

    /// Register (or re-register) a device over a live transport.
    ///
    /// Overwrites any previous session with the same identity.
    pub fn register(
        &self,
        metadata: DeviceMetadata,
        link: &mpsc::Sender<AgentCommand>,
    ) -> Registration {
        let device_id = metadata.device_id();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let now = time::now();

        let session = DeviceSession {
            model: metadata
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
            address: metadata.address,
            connected_at: now,
            last_seen: now,
            disconnected_at: None,
            handle: Some(link.downgrade()),
            epoch,
        };
        let info = session.info(&device_id);
        let replaced = self.sessions.insert(device_id.clone(), session);

        let online_count = self.online_count();
        tracing::info!(
            "Device {} connected ({} online{})",
            device_id,
            online_count,
            if replaced.is_some() { ", replaced previous session" } else { "" }
        );

        events::publish(
            &self.events,
            FleetEvent::DeviceConnected {
                device: info,
                online_count,
            },
        );

        Registration { device_id, epoch }
    }

    /// Mark a device offline regardless of which connection it is on
    pub fn mark_offline(&self, id: &DeviceId) -> Result<(), RegistryError> {
        let flipped = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            session.go_offline()
        };

        if flipped {
            self.announce_offline(id);
        }
        Ok(())
    }

    /// Report the end of one connection.
    ///
    /// Only takes effect if `epoch` is still the device's current
    /// connection. Returns whether the device went offline.
    pub fn disconnect(&self, id: &DeviceId, epoch: u64) -> bool {
        let flipped = match self.sessions.get_mut(id) {
            Some(mut session) if session.epoch == epoch => session.go_offline(),
            Some(_) => {
                tracing::debug!("Ignoring stale disconnect for {} (epoch {})", id, epoch);
                false
            }
            None => false,
        };

        if flipped {
            self.announce_offline(id);
        }
        flipped
    }

    /// Bump `last_seen` if the device is online. Returns whether it was.
    pub fn heartbeat(&self, id: &DeviceId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) if session.handle.is_some() => {
                session.last_seen = time::now();
                true
            }
            _ => false,
        }
    }

    /// Record an agent response: bumps `last_seen` and forwards it as an event
    pub fn record_response(&self, id: &DeviceId, kind: String, payload: Vec<u8>) -> bool {
        if !self.heartbeat(id) {
            tracing::debug!("Dropping response from offline or unknown device {}", id);
            return false;
        }

        tracing::debug!("Response '{}' from {} ({} bytes)", kind, id, payload.len());
        events::publish(
            &self.events,
            FleetEvent::DeviceResponse {
                device_id: id.clone(),
                kind,
                payload,
            },
        );
        true
    }

    /// Push a command to an online device.
    ///
    /// A handle whose transport has gone away flips the device offline,
    /// unless the device has re-registered on a newer connection meanwhile.
    pub fn push(&self, id: &DeviceId, command: AgentCommand) -> Result<(), PushError> {
        let (sender, epoch) = self.current_handle(id)?;
        self.deliver(id, epoch, sender, command)
    }

    /// Upgrade the device's handle, tagged with the connection it belongs to
    fn current_handle(
        &self,
        id: &DeviceId,
    ) -> Result<(Option<mpsc::Sender<AgentCommand>>, u64), PushError> {
        let session = self.sessions.get(id).ok_or(PushError::NoHandle)?;
        let handle = session.handle.as_ref().ok_or(PushError::NoHandle)?;
        Ok((handle.upgrade(), session.epoch))
    }

    fn deliver(
        &self,
        id: &DeviceId,
        epoch: u64,
        sender: Option<mpsc::Sender<AgentCommand>>,
        command: AgentCommand,
    ) -> Result<(), PushError> {
        let Some(sender) = sender else {
            tracing::warn!("Transport for {} is gone, marking offline", id);
            self.drop_connection(id, epoch);
            return Err(PushError::Closed);
        };

        match sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Transport for {} stopped reading, marking offline", id);
                self.drop_connection(id, epoch);
                Err(PushError::Closed)
            }
        }
    }

    fn drop_connection(&self, id: &DeviceId, epoch: u64) {
        if !self.disconnect(id, epoch) {
            tracing::debug!("{} already offline or reconnected", id);
        }
    }

    /// Snapshot of one device
    pub fn get(&self, id: &DeviceId) -> Result<DeviceInfo, RegistryError> {
        self.sessions
            .get(id)
            .map(|s| s.info(id))
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Whether a device is online
    pub fn is_online(&self, id: &DeviceId) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.handle.is_some())
            .unwrap_or(false)
    }

    /// Sessions passing `filter`, ordered by connection time then ID
    pub fn list(&self, filter: StatusFilter) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .sessions
            .iter()
            .filter(|entry| filter.matches(entry.status()))
            .map(|entry| entry.info(entry.key()))
            .collect();
        devices.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// IDs of every online device, in [`list`](Self::list) order
    pub fn online_ids(&self) -> Vec<DeviceId> {
        self.list(StatusFilter::Online)
            .into_iter()
            .map(|d| d.id)
            .collect()
    }

    /// Online/offline tallies
    pub fn counts(&self) -> DeviceCounts {
        let mut counts = DeviceCounts::default();
        for entry in self.sessions.iter() {
            match entry.status() {
                DeviceStatus::Online => counts.online += 1,
                DeviceStatus::Offline => counts.offline += 1,
            }
        }
        counts.total = counts.online + counts.offline;
        counts
    }

    /// Remove offline sessions that disconnected more than `older_than` ago
    pub fn prune_offline(&self, older_than: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| match session.disconnected_at {
            Some(at) if session.handle.is_none() => !time::is_older_than(&at, older_than),
            _ => true,
        });
        let pruned = before.saturating_sub(self.sessions.len());
        if pruned > 0 {
            tracing::info!("Pruned {} offline device sessions", pruned);
        }
        pruned
    }

    /// Number of retained sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is retained
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn online_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.handle.is_some()).count()
    }

    fn announce_offline(&self, id: &DeviceId) {
        let online_count = self.online_count();
        tracing::info!("Device {} disconnected ({} online)", id, online_count);
        events::publish(
            &self.events,
            FleetEvent::DeviceDisconnected {
                device_id: id.clone(),
                online_count,
            },
        );
    }
}
