//! Periodic status reporter
//!
//! Broadcasts a [`StatusReport`](fc_core::records::StatusReport) every
//! `report_interval` and applies the retention policy: security events and
//! offline device records older than [`RETENTION`] are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use fc_core::ipc::FleetEvent;

use crate::events;
use crate::state::ControlState;

/// Age after which security events and offline devices are pruned
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Run the reporter until cancelled.
///
/// The first report goes out one full interval after start.
pub async fn run_status_reporter(state: Arc<ControlState>, cancel: CancellationToken) {
    let period = state.config.report_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Starting status reporter (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                report_once(&state);
            }
            _ = cancel.cancelled() => {
                tracing::info!("Status reporter shutting down");
                break;
            }
        }
    }
}

/// Publish one report and prune expired records
pub fn report_once(state: &ControlState) {
    let report = state.status_report();
    tracing::info!(
        "Status: {} online / {} devices, {} commands today, {} active tasks",
        report.devices.online,
        report.devices.total,
        report.commands_today,
        report.active_tasks
    );
    events::publish(&state.events, FleetEvent::StatusReport(report));

    let events_pruned = state.security.prune_events(RETENTION);
    let devices_pruned = state.registry.prune_offline(RETENTION);
    if events_pruned > 0 || devices_pruned > 0 {
        tracing::debug!(
            "Pruned {} security events and {} offline devices",
            events_pruned,
            devices_pruned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::config::ControlConfig;

    #[tokio::test(start_paused = true)]
    async fn test_reporter_publishes_each_interval() {
        let config = ControlConfig {
            report_interval: Duration::from_secs(60),
            ..ControlConfig::default()
        };
        let state = Arc::new(ControlState::in_memory(config));
        let mut rx = state.subscribe();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_status_reporter(Arc::clone(&state), cancel.clone()));

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        match rx.try_recv().unwrap() {
            FleetEvent::StatusReport(report) => {
                assert_eq!(report.devices.total, 0);
                assert_eq!(report.commands_today, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
