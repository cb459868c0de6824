//! Global control-plane state

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fc_core::config::ControlConfig;
use fc_core::ipc::{ControlStatus, FleetEvent};
use fc_core::records::StatusReport;
use fc_core::time;
use fc_core::traits::{AuditSink, ProcessExecutor, SummaryStore, TaskStore};

use crate::dispatch::{CommandLog, Dispatcher};
use crate::events::{self, EventSender};
use crate::registry::DeviceRegistry;
use crate::scheduler::TaskScheduler;
use crate::security::{CommandPolicy, SecurityGate};
use crate::shell::{LocalExecutor, ShellDeps, ShellGateway};
use crate::store::{
    DataPaths, FileAuditSink, JsonSummaryStore, JsonTaskStore, MemoryAuditSink,
    MemorySummaryStore, MemoryTaskStore,
};

/// External collaborators: durable stores and the process executor
pub struct Collaborators {
    pub tasks: Arc<dyn TaskStore>,
    pub command_audit: Arc<dyn AuditSink>,
    pub security_audit: Arc<dyn AuditSink>,
    pub summaries: Arc<dyn SummaryStore>,
    pub executor: Arc<dyn ProcessExecutor>,
}

impl Collaborators {
    /// File stores under `data_dir` and the local executor
    pub fn on_disk(data_dir: &Path) -> Self {
        let paths = DataPaths::new(data_dir);
        Self {
            tasks: Arc::new(JsonTaskStore::new(paths.tasks)),
            command_audit: Arc::new(FileAuditSink::new(paths.command_log)),
            security_audit: Arc::new(FileAuditSink::new(paths.security_log)),
            summaries: Arc::new(JsonSummaryStore::new(paths.shell_stats)),
            executor: Arc::new(LocalExecutor::new()),
        }
    }

    /// Memory stores and the local executor
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::default()),
            command_audit: Arc::new(MemoryAuditSink::default()),
            security_audit: Arc::new(MemoryAuditSink::default()),
            summaries: Arc::new(MemorySummaryStore::default()),
            executor: Arc::new(LocalExecutor::new()),
        }
    }
}

/// Global state for the control-plane daemon
pub struct ControlState {
    /// Configuration
    pub config: ControlConfig,
    /// Lifecycle notification channel
    pub events: EventSender,
    /// Device session registry
    pub registry: Arc<DeviceRegistry>,
    /// Security gate
    pub security: Arc<SecurityGate>,
    /// Shared command log
    pub command_log: Arc<CommandLog>,
    /// Command dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Scheduled task engine
    pub scheduler: Arc<TaskScheduler>,
    /// Shell session gateway
    pub shell: Arc<ShellGateway>,
    /// Root of every timer and server task
    pub shutdown: CancellationToken,
    started: Instant,
}

impl ControlState {
    /// Wire every component together
    pub fn new(config: ControlConfig, collaborators: Collaborators) -> Self {
        let shutdown = CancellationToken::new();
        let events = events::channel();

        let registry = Arc::new(DeviceRegistry::new(events.clone()));
        let security = SecurityGate::new(
            config.security.clone(),
            CommandPolicy::new(config.shell.max_command_length),
            collaborators.security_audit,
            events.clone(),
            shutdown.child_token(),
        );
        let command_log = Arc::new(CommandLog::new(
            config.dispatch.history_capacity,
            collaborators.command_audit,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&security),
            Arc::clone(&command_log),
        ));
        let scheduler = TaskScheduler::new(
            Arc::clone(&dispatcher),
            collaborators.tasks,
            events.clone(),
            shutdown.child_token(),
        );
        let shell = ShellGateway::new(
            config.shell.clone(),
            ShellDeps {
                registry: Arc::clone(&registry),
                security: Arc::clone(&security),
                command_log: Arc::clone(&command_log),
                executor: collaborators.executor,
                summaries: collaborators.summaries,
                events: events.clone(),
            },
            shutdown.child_token(),
        );

        Self {
            config,
            events,
            registry,
            security,
            command_log,
            dispatcher,
            scheduler,
            shell,
            shutdown,
            started: Instant::now(),
        }
    }

    /// State persisted under `config.data_dir`
    pub fn with_data_dir(config: ControlConfig) -> Self {
        let collaborators = Collaborators::on_disk(&config.data_dir);
        Self::new(config, collaborators)
    }

    /// State with nothing persisted
    pub fn in_memory(config: ControlConfig) -> Self {
        Self::new(config, Collaborators::in_memory())
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Status snapshot for operator clients
    pub fn status(&self) -> ControlStatus {
        ControlStatus {
            uptime_secs: self.uptime().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            agent_bind_address: self.config.agent_bind_address.clone(),
            devices: self.registry.counts(),
            task_count: self.scheduler.len(),
            active_shell_sessions: self.shell.active_count(),
            blocked_addresses: self.security.stats().blocked_addresses,
        }
    }

    /// Periodic fleet report
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            generated_at: time::now(),
            devices: self.registry.counts(),
            commands_today: self.command_log.commands_today(),
            active_tasks: self.scheduler.stats().enabled,
            active_shell_sessions: self.shell.active_count(),
        }
    }

    /// Stop every component. No timer fires afterwards.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.shell.shutdown();
        self.security.shutdown();
        self.shutdown.cancel();
    }
}
