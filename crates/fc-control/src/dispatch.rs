//! Command dispatch and the shared command log
//!
//! Dispatch is fire-and-forget: a command counts as sent once the agent
//! transport has queued it. Nothing waits for the agent to receive or run
//! it. Every push made during a fan-out is independent; a failed push is
//! logged and reported in the [`DispatchReport`] but never aborts the rest.

use std::sync::{Arc, Mutex, PoisonError};

use fc_core::error::DispatchError;
use fc_core::records::{
    AuditLine, CommandLogEntry, CommandOrigin, DispatchOutcome, DispatchReport,
};
use fc_core::time;
use fc_core::traits::AuditSink;
use fc_core::types::{DeviceId, Target};
use fc_core::RingBuffer;

use crate::registry::{AgentCommand, DeviceRegistry};
use crate::security::SecurityGate;

/// Bounded log of every command sent to a device, backed by an audit file
pub struct CommandLog {
    entries: Mutex<RingBuffer<CommandLogEntry>>,
    audit: Arc<dyn AuditSink>,
}

impl CommandLog {
    /// Create a log keeping at most `capacity` entries in memory
    pub fn new(capacity: usize, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            entries: Mutex::new(RingBuffer::new(capacity)),
            audit,
        }
    }

    /// Append an entry and its audit line
    pub fn record(&self, entry: CommandLogEntry) {
        let line = AuditLine {
            timestamp: entry.timestamp,
            actor: entry.device_id.to_string(),
            action: match &entry.origin {
                CommandOrigin::Dispatch => "dispatch".to_string(),
                CommandOrigin::Shell(session) => format!("shell:{}", session),
            },
            detail: entry.command.clone(),
        };

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);

        self.write_audit(&line);
    }

    /// Append a free-form audit line without a log entry
    pub fn audit(&self, line: AuditLine) {
        self.write_audit(&line);
    }

    /// The newest `limit` entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<CommandLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(limit)
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries logged since midnight UTC
    pub fn commands_today(&self) -> usize {
        let midnight = time::now().date_naive().and_hms_opt(0, 0, 0);
        let Some(midnight) = midnight else {
            return 0;
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.timestamp.naive_utc() >= midnight)
            .count()
    }

    fn write_audit(&self, line: &AuditLine) {
        if let Err(e) = self.audit.append(line) {
            tracing::warn!("Failed to persist command audit line: {}", e);
        }
    }
}

/// Fans commands out to online devices
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    security: Arc<SecurityGate>,
    log: Arc<CommandLog>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry
    pub fn new(
        registry: Arc<DeviceRegistry>,
        security: Arc<SecurityGate>,
        log: Arc<CommandLog>,
    ) -> Self {
        Self {
            registry,
            security,
            log,
        }
    }

    /// Push `command` to one device or to every online device.
    ///
    /// A specific target that is offline (or unknown) fails with
    /// [`DispatchError::DeviceOffline`] and logs nothing. For `"all"`, one
    /// log entry is written per device online at call time.
    pub fn send(
        &self,
        target: &Target,
        command: &str,
        extras: &[String],
    ) -> Result<DispatchReport, DispatchError> {
        let devices = match target {
            Target::All => self.registry.online_ids(),
            Target::Device(id) => {
                if !self.registry.is_online(id) {
                    return Err(DispatchError::DeviceOffline(id.clone()));
                }
                vec![id.clone()]
            }
        };

        let outcomes: Vec<DispatchOutcome> = devices
            .into_iter()
            .map(|device_id| self.push_one(device_id, command, extras))
            .collect();

        let report = DispatchReport {
            target: target.clone(),
            command: command.to_string(),
            outcomes,
        };

        tracing::info!(
            "Dispatched '{}' to {}: {} delivered, {} failed",
            command,
            target,
            report.delivered(),
            report.failed()
        );
        Ok(report)
    }

    /// Shared command log
    pub fn log(&self) -> &Arc<CommandLog> {
        &self.log
    }

    fn push_one(&self, device_id: DeviceId, command: &str, extras: &[String]) -> DispatchOutcome {
        self.security.detect_suspicious(&device_id, command);
        self.log.record(CommandLogEntry::new(
            device_id.clone(),
            command,
            CommandOrigin::Dispatch,
        ));

        let result = self
            .registry
            .push(&device_id, AgentCommand::new(command, extras.to_vec()));
        if let Err(e) = &result {
            tracing::warn!("Failed to push '{}' to {}: {}", command, device_id, e);
        }

        DispatchOutcome {
            device_id,
            error: result.err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::registry::DeviceMetadata;
    use crate::security::CommandPolicy;
    use crate::store::MemoryAuditSink;
    use fc_core::config::SecurityConfig;
    use fc_core::error::PushError;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        security: Arc<SecurityGate>,
        audit: Arc<MemoryAuditSink>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let events = events::channel();
        let registry = Arc::new(DeviceRegistry::new(events.clone()));
        let security = SecurityGate::new(
            SecurityConfig::default(),
            CommandPolicy::default(),
            Arc::new(MemoryAuditSink::default()),
            events,
            CancellationToken::new(),
        );
        let audit = Arc::new(MemoryAuditSink::default());
        let log = Arc::new(CommandLog::new(1000, audit.clone()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&security), log);
        Fixture {
            registry,
            security,
            audit,
            dispatcher,
        }
    }

    fn connect(
        registry: &DeviceRegistry,
        host: &str,
    ) -> (DeviceId, mpsc::Sender<AgentCommand>, mpsc::Receiver<AgentCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let reg = registry.register(
            DeviceMetadata {
                host: host.to_string(),
                model: Some("m".into()),
                address: None,
            },
            &tx,
        );
        (reg.device_id, tx, rx)
    }

    #[tokio::test]
    async fn test_send_all_logs_one_entry_per_online_device() {
        let f = fixture();
        let (a, _ta, mut ra) = connect(&f.registry, "a");
        let (b, _tb, mut rb) = connect(&f.registry, "b");
        let (c, _tc, _rc) = connect(&f.registry, "c");
        f.registry.mark_offline(&c).unwrap();

        let report = f
            .dispatcher
            .send(&Target::All, "battery_status", &[])
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.delivered(), 2);
        let logged: Vec<DeviceId> = f
            .dispatcher
            .log()
            .recent(10)
            .into_iter()
            .map(|e| e.device_id)
            .collect();
        assert_eq!(logged, vec![a, b]);
        assert_eq!(ra.try_recv().unwrap().request, "battery_status");
        assert_eq!(rb.try_recv().unwrap().request, "battery_status");
        assert_eq!(f.audit.lines().len(), 2);
    }

    #[tokio::test]
    async fn test_send_to_offline_device_logs_nothing() {
        let f = fixture();
        let (a, _ta, _ra) = connect(&f.registry, "a");
        f.registry.mark_offline(&a).unwrap();

        let err = f
            .dispatcher
            .send(&Target::Device(a.clone()), "ping", &[])
            .unwrap_err();
        assert_eq!(err, DispatchError::DeviceOffline(a));

        let err = f
            .dispatcher
            .send(&Target::from("nobody"), "ping", &[])
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceOffline(_)));

        assert!(f.dispatcher.log().is_empty());
        assert!(f.audit.lines().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_does_not_abort_fan_out() {
        let f = fixture();
        let (_a, _ta, ra) = connect(&f.registry, "a");
        let (b, _tb, mut rb) = connect(&f.registry, "b");
        // Receiver gone: the push to `a` fails
        drop(ra);

        let report = f.dispatcher.send(&Target::All, "ping", &["x".into()]).unwrap();

        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcomes[0].error, Some(PushError::Closed));
        assert_eq!(report.outcomes[1].device_id, b);
        assert_eq!(rb.try_recv().unwrap().extras, vec!["x".to_string()]);
        assert_eq!(f.dispatcher.log().len(), 2);
    }

    #[tokio::test]
    async fn test_suspicious_command_is_audited_but_sent() {
        let f = fixture();
        let (a, _ta, mut ra) = connect(&f.registry, "a");

        let report = f
            .dispatcher
            .send(&Target::Device(a), "factory_reset", &[])
            .unwrap();

        assert_eq!(report.delivered(), 1);
        assert_eq!(ra.try_recv().unwrap().request, "factory_reset");
        assert_eq!(f.security.stats().critical_events, 1);
    }

    #[test]
    fn test_command_log_is_bounded() {
        let log = CommandLog::new(1000, Arc::new(MemoryAuditSink::default()));
        for i in 0..1001 {
            log.record(CommandLogEntry::new(
                DeviceId::new("d"),
                format!("cmd-{}", i),
                CommandOrigin::Dispatch,
            ));
        }
        assert_eq!(log.len(), 1000);
        assert_eq!(log.recent(1000)[0].command, "cmd-1");
        assert_eq!(log.commands_today(), 1000);
    }
}
