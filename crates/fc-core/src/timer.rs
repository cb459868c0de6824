//! Cancellable scheduled callbacks
//!
//! Every timer the control plane owns (task intervals, shell inactivity
//! watchdogs, unblock and counter-expiry timers, grace-period reclaimers)
//! is a [`TimerHandle`]. The handle owns a child of a component-wide
//! shutdown token: cancelling the handle, dropping it, or cancelling the
//! parent all stop the timer, and a cancelled timer never invokes its
//! callback again.
//!
//! Callbacks are synchronous and must not block; they run on the tokio
//! task backing the timer.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Owner of a single live timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop the timer. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the backing task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `callback` once after `delay`, unless cancelled first.
pub fn spawn_after<F>(parent: &CancellationToken, delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancel = parent.child_token();
    let token = cancel.clone();
    let at = Instant::now() + delay;

    let task = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = tokio::time::sleep_until(at) => {
                if !token.is_cancelled() {
                    callback();
                }
            }
        }
    });

    TimerHandle { cancel, task }
}

/// Run `callback` every `period`, first firing one full period from now.
pub fn spawn_every<F>(parent: &CancellationToken, period: Duration, mut callback: F) -> TimerHandle
where
    F: FnMut() + Send + 'static,
{
    let cancel = parent.child_token();
    let token = cancel.clone();
    let first = Instant::now() + period;

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if token.is_cancelled() {
                        break;
                    }
                    callback();
                }
            }
        }
    });

    TimerHandle { cancel, task }
}

/// Watch a moving deadline and run `on_expire` once it passes.
///
/// `deadline` is polled each time the previously observed deadline is
/// reached; returning `None` ends the watch without firing. This lets an
/// inactivity timer be refreshed by simply bumping the deadline rather than
/// re-arming a new timer.
pub fn spawn_deadline<D, F>(parent: &CancellationToken, mut deadline: D, on_expire: F) -> TimerHandle
where
    D: FnMut() -> Option<Instant> + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let cancel = parent.child_token();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            let Some(at) = deadline() else {
                return;
            };

            if Instant::now() >= at {
                if !token.is_cancelled() {
                    on_expire();
                }
                return;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(at) => {}
            }
        }
    });

    TimerHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Let spawned timer tasks observe the advanced clock
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_after_fires_once() {
        let root = CancellationToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let _timer = spawn_after(&root, Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_never_fires() {
        let root = CancellationToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let timer = spawn_after(&root, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_every_and_parent_cancel() {
        let root = CancellationToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let timer = spawn_every(&root, Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(60)).await;
            settle().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        root.cancel();
        assert!(timer.is_cancelled());

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_deadline_follows_refresh() {
        let root = CancellationToken::new();
        let deadline = Arc::new(Mutex::new(Instant::now() + Duration::from_secs(30)));
        let expired = Arc::new(AtomicU32::new(0));

        let watched = Arc::clone(&deadline);
        let counter = Arc::clone(&expired);
        let _timer = spawn_deadline(
            &root,
            move || watched.lock().ok().map(|d| *d),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        *deadline.lock().unwrap() = Instant::now() + Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(expired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }
}
