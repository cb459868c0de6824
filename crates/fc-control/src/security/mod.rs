//! Security gate
//!
//! Shared policy component: checks shell commands against the
//! [`CommandPolicy`], counts failed authentication attempts per source
//! address, blocks abusive addresses for a fixed time, and keeps a bounded
//! log of security events. Warning and critical events are also written
//! to the security audit log and broadcast as alerts.
//!
//! Each failure counter and each block owns one timer. Re-arming replaces
//! the entry's [`TimerHandle`], which cancels the old timer; a generation
//! number guards against a timer that was already firing when its entry
//! was replaced.

mod policy;

pub use policy::{
    BlockReason, CommandPolicy, CommandVerdict, BLOCKED_COMMANDS, DANGEROUS_PATTERNS,
    DEFAULT_MAX_COMMAND_LENGTH,
};

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use fc_core::config::SecurityConfig;
use fc_core::ipc::FleetEvent;
use fc_core::records::{SecurityEvent, SecurityReport, SecurityStats};
use fc_core::time::{self, Timestamp};
use fc_core::timer::{self as timers, TimerHandle};
use fc_core::traits::AuditSink;
use fc_core::types::{DeviceId, Severity};
use fc_core::RingBuffer;

use crate::events::{self, EventSender};

/// Agent commands that destroy data on the device
pub const SUSPICIOUS_COMMANDS: &[&str] = &[
    "self_destruct",
    "format_device",
    "delete_all_data",
    "factory_reset",
];

/// Events returned by [`SecurityGate::report`]
pub const REPORT_RECENT_EVENTS: usize = 10;

/// Result of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Failures counted in the current window (0 once blocked)
    pub attempts: u32,
    /// Whether the address is now blocked
    pub blocked: bool,
}

struct FailedAttempts {
    count: u32,
    generation: u64,
    _expiry: Option<TimerHandle>,
}

struct BlockedAddress {
    reason: String,
    since: Timestamp,
    generation: u64,
    _unblock: Option<TimerHandle>,
}

/// Command filtering, address blocking and security event log
pub struct SecurityGate {
    config: SecurityConfig,
    policy: CommandPolicy,
    events_log: Mutex<RingBuffer<SecurityEvent>>,
    attempts: DashMap<IpAddr, FailedAttempts>,
    blocked: DashMap<IpAddr, BlockedAddress>,
    generation: AtomicU64,
    audit: Arc<dyn AuditSink>,
    events: EventSender,
    shutdown: CancellationToken,
    self_ref: Weak<SecurityGate>,
}

impl SecurityGate {
    /// Create a gate. Timers are children of `shutdown`.
    pub fn new(
        config: SecurityConfig,
        policy: CommandPolicy,
        audit: Arc<dyn AuditSink>,
        events: EventSender,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            events_log: Mutex::new(RingBuffer::new(config.event_capacity)),
            config,
            policy,
            attempts: DashMap::new(),
            blocked: DashMap::new(),
            generation: AtomicU64::new(1),
            audit,
            events,
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    /// Check a shell command against the policy
    pub fn check_command(&self, command: &str) -> CommandVerdict {
        self.policy.check(command)
    }

    /// Whether an address is currently blocked
    pub fn is_blocked(&self, address: &IpAddr) -> bool {
        self.blocked.contains_key(address)
    }

    /// Count a failed authentication from `address`.
    ///
    /// Reaching the configured threshold blocks the address and clears its
    /// counter. Otherwise the counter's expiry timer is re-armed for a full
    /// window.
    pub fn record_failed_attempt(&self, address: IpAddr) -> AttemptOutcome {
        let generation = self.next_generation();
        let expiry = self.spawn_counter_expiry(address, generation);

        let count = {
            let mut entry = self.attempts.entry(address).or_insert_with(|| FailedAttempts {
                count: 0,
                generation,
                _expiry: None,
            });
            entry.count += 1;
            entry.generation = generation;
            entry._expiry = Some(expiry);
            entry.count
        };

        let max = self.config.max_failed_attempts;
        self.log_event(
            "failed_attempt",
            format!("Failed attempt from {} ({}/{})", address, count, max),
            Severity::Warning,
        );

        if count >= max {
            self.attempts.remove(&address);
            self.block(address, "Too many failed attempts");
            return AttemptOutcome {
                attempts: 0,
                blocked: true,
            };
        }

        AttemptOutcome {
            attempts: count,
            blocked: self.is_blocked(&address),
        }
    }

    /// Forget the failure counter of an address after a successful login
    pub fn reset_failed_attempts(&self, address: &IpAddr) -> bool {
        self.attempts.remove(address).is_some()
    }

    /// Failures currently counted for an address
    pub fn failed_attempts(&self, address: &IpAddr) -> u32 {
        self.attempts.get(address).map(|e| e.count).unwrap_or(0)
    }

    /// Block an address for the configured duration.
    ///
    /// Blocking an already blocked address restarts its block.
    pub fn block(&self, address: IpAddr, reason: &str) {
        let generation = self.next_generation();
        let unblock = self.spawn_unblock(address, generation);

        self.blocked.insert(
            address,
            BlockedAddress {
                reason: reason.to_string(),
                since: time::now(),
                generation,
                _unblock: Some(unblock),
            },
        );

        self.log_event(
            "ip_blocked",
            format!("IP {} blocked: {}", address, reason),
            Severity::Warning,
        );
    }

    /// Lift a block early. Returns whether the address was blocked.
    pub fn unblock(&self, address: &IpAddr) -> bool {
        if self.blocked.remove(address).is_some() {
            self.log_event(
                "ip_unblocked",
                format!("IP {} unblocked", address),
                Severity::Info,
            );
            true
        } else {
            false
        }
    }

    /// Record a critical event if `command` is one of the destructive agent commands.
    ///
    /// Advisory only: the caller still dispatches the command.
    pub fn detect_suspicious(&self, device_id: &DeviceId, command: &str) -> bool {
        if !SUSPICIOUS_COMMANDS.contains(&command) {
            return false;
        }
        self.log_event(
            "suspicious_command",
            format!("Suspicious command '{}' sent to device {}", command, device_id),
            Severity::Critical,
        );
        true
    }

    /// Append an event to the log.
    ///
    /// Warning and critical events are also persisted and broadcast.
    pub fn log_event(&self, kind: &str, detail: impl Into<String>, severity: Severity) {
        let event = SecurityEvent::new(kind, detail, severity);

        match severity {
            Severity::Info => tracing::info!("[security] {}: {}", event.kind, event.detail),
            Severity::Warning => tracing::warn!("[security] {}: {}", event.kind, event.detail),
            Severity::Critical => tracing::error!("[security] {}: {}", event.kind, event.detail),
        }

        self.events_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());

        if severity.is_persisted() {
            if let Err(e) = self.audit.append(&event.audit_line()) {
                tracing::warn!("Failed to persist security event: {}", e);
            }
            events::publish(&self.events, FleetEvent::SecurityAlert(event));
        }
    }

    /// The newest `limit` events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    /// Drop events older than `older_than`. Returns how many were removed.
    pub fn prune_events(&self, older_than: Duration) -> usize {
        let removed = {
            let mut log = self.events_log.lock().unwrap_or_else(PoisonError::into_inner);
            let before = log.len();
            log.retain(|e| !time::is_older_than(&e.timestamp, older_than));
            before - log.len()
        };

        if removed > 0 {
            self.log_event(
                "logs_cleaned",
                format!("Removed {} old log entries", removed),
                Severity::Info,
            );
        }
        removed
    }

    /// Report over the events of the last `window`
    pub fn report(&self, window: Duration) -> SecurityReport {
        let recent: Vec<SecurityEvent> = {
            let log = self.events_log.lock().unwrap_or_else(PoisonError::into_inner);
            log.iter()
                .filter(|e| !time::is_older_than(&e.timestamp, window))
                .cloned()
                .collect()
        };

        let skip = recent.len().saturating_sub(REPORT_RECENT_EVENTS);
        SecurityReport {
            generated_at: time::now(),
            window_secs: window.as_secs(),
            total_events: recent.len(),
            critical_events: count_severity(&recent, Severity::Critical),
            warning_events: count_severity(&recent, Severity::Warning),
            blocked_addresses: self.blocked.len(),
            tracked_addresses: self.attempts.len(),
            recent_events: recent[skip..].to_vec(),
        }
    }

    /// Counts over the whole event log
    pub fn stats(&self) -> SecurityStats {
        let events = self.recent_events(usize::MAX);
        SecurityStats {
            total_events: events.len(),
            blocked_addresses: self.blocked.len(),
            tracked_addresses: self.attempts.len(),
            critical_events: count_severity(&events, Severity::Critical),
            warning_events: count_severity(&events, Severity::Warning),
        }
    }

    /// Blocked addresses with their reason and start time
    pub fn blocked_addresses(&self) -> Vec<(IpAddr, String, Timestamp)> {
        let mut blocked: Vec<_> = self
            .blocked
            .iter()
            .map(|e| (*e.key(), e.reason.clone(), e.since))
            .collect();
        blocked.sort_by_key(|(_, _, since)| *since);
        blocked
    }

    /// Cancel every unblock and expiry timer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        tracing::debug!("Security gate timers cancelled");
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_counter_expiry(&self, address: IpAddr, generation: u64) -> TimerHandle {
        let gate = self.self_ref.clone();
        timers::spawn_after(&self.shutdown, self.config.failed_attempt_window, move || {
            if let Some(gate) = gate.upgrade() {
                if gate
                    .attempts
                    .remove_if(&address, |_, e| e.generation == generation)
                    .is_some()
                {
                    tracing::debug!("Failed-attempt counter for {} expired", address);
                }
            }
        })
    }

    fn spawn_unblock(&self, address: IpAddr, generation: u64) -> TimerHandle {
        let gate = self.self_ref.clone();
        timers::spawn_after(&self.shutdown, self.config.block_duration, move || {
            if let Some(gate) = gate.upgrade() {
                if gate
                    .blocked
                    .remove_if(&address, |_, b| b.generation == generation)
                    .is_some()
                {
                    gate.log_event(
                        "ip_unblocked",
                        format!("IP {} unblocked after block expired", address),
                        Severity::Info,
                    );
                }
            }
        })
    }
}

fn count_severity(events: &[SecurityEvent], severity: Severity) -> usize {
    events.iter().filter(|e| e.severity == severity).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditSink;

    fn gate() -> (Arc<SecurityGate>, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::default());
        let gate = SecurityGate::new(
            SecurityConfig::default(),
            CommandPolicy::default(),
            audit.clone(),
            events::channel(),
            CancellationToken::new(),
        );
        (gate, audit)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifth_failure_blocks_then_block_expires() {
        let (gate, _) = gate();
        let addr = ip(10);

        for attempt in 1..=4 {
            let outcome = gate.record_failed_attempt(addr);
            assert_eq!(outcome.attempts, attempt);
            assert!(!outcome.blocked);
            assert!(!gate.is_blocked(&addr));
        }

        let outcome = gate.record_failed_attempt(addr);
        assert!(outcome.blocked);
        assert!(gate.is_blocked(&addr));
        assert_eq!(gate.failed_attempts(&addr), 0);

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        settle().await;
        assert!(gate.is_blocked(&addr));

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        settle().await;
        assert!(!gate.is_blocked(&addr));

        let last = gate.recent_events(1).pop().unwrap();
        assert_eq!(last.kind, "ip_unblocked");
        assert_eq!(last.severity, Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires_after_quiet_window() {
        let (gate, _) = gate();
        let addr = ip(11);

        gate.record_failed_attempt(addr);
        gate.record_failed_attempt(addr);

        // Each failure restarts the window
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        settle().await;
        gate.record_failed_attempt(addr);
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        settle().await;
        assert_eq!(gate.failed_attempts(&addr), 3);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        settle().await;
        assert_eq!(gate.failed_attempts(&addr), 0);

        // A fresh window starts from one
        assert_eq!(gate.record_failed_attempt(addr).attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reblock_restarts_timer() {
        let (gate, _) = gate();
        let addr = ip(12);

        gate.block(addr, "manual");
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        settle().await;
        gate.block(addr, "manual again");

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        settle().await;
        assert!(gate.is_blocked(&addr));

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        settle().await;
        assert!(!gate.is_blocked(&addr));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_unblock() {
        let (gate, _) = gate();
        let addr = ip(13);
        gate.block(addr, "manual");
        gate.shutdown();

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        settle().await;
        assert!(gate.is_blocked(&addr));
    }

    #[tokio::test]
    async fn test_only_warning_and_critical_are_persisted() {
        let (gate, audit) = gate();

        gate.log_event("scan", "info only", Severity::Info);
        gate.log_event("scan", "warn", Severity::Warning);
        gate.detect_suspicious(&DeviceId::new("phone"), "self_destruct");
        assert!(!gate.detect_suspicious(&DeviceId::new("phone"), "battery_status"));

        let lines = audit.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("| CRITICAL | suspicious_command |"));
        assert_eq!(gate.recent_events(100).len(), 3);
    }

    #[tokio::test]
    async fn test_report_and_stats() {
        let (gate, _) = gate();
        for i in 0..12 {
            gate.log_event("scan", format!("event {}", i), Severity::Warning);
        }
        gate.detect_suspicious(&DeviceId::new("d"), "factory_reset");
        gate.block(ip(14), "manual");

        let report = gate.report(Duration::from_secs(24 * 60 * 60));
        assert_eq!(report.total_events, 14);
        assert_eq!(report.critical_events, 1);
        assert_eq!(report.warning_events, 13);
        assert_eq!(report.blocked_addresses, 1);
        assert_eq!(report.recent_events.len(), REPORT_RECENT_EVENTS);
        assert_eq!(report.recent_events.last().unwrap().kind, "ip_blocked");

        let stats = gate.stats();
        assert_eq!(stats.total_events, 14);
        assert_eq!(stats.blocked_addresses, 1);
    }

    #[tokio::test]
    async fn test_unblock_and_reset() {
        let (gate, _) = gate();
        let addr = ip(15);

        gate.record_failed_attempt(addr);
        assert!(gate.reset_failed_attempts(&addr));
        assert_eq!(gate.failed_attempts(&addr), 0);

        gate.block(addr, "manual");
        assert!(gate.unblock(&addr));
        assert!(!gate.is_blocked(&addr));
        assert!(!gate.unblock(&addr));
    }

    #[test]
    fn test_event_log_is_bounded() {
        let gate = SecurityGate::new(
            SecurityConfig {
                event_capacity: 1000,
                ..SecurityConfig::default()
            },
            CommandPolicy::default(),
            Arc::new(MemoryAuditSink::default()),
            events::channel(),
            CancellationToken::new(),
        );
        for i in 0..1001 {
            gate.log_event("scan", format!("{}", i), Severity::Info);
        }
        let events = gate.recent_events(usize::MAX);
        assert_eq!(events.len(), 1000);
        assert_eq!(events[0].detail, "1");
    }
}
