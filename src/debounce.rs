//! Notification Debouncing
//!
//! Coalesces bursts of change events into one settled delivery per quiet
//! period. The newest event always overwrites the pending one, and a
//! timer delivers it once nothing new has arrived for `delay`. The delay
//! can be changed while the aggregator runs; a zero delay forwards events
//! as they come.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

/// Pending state of a debounce window
#[derive(Debug)]
pub struct DebounceWindow<T> {
    pending: Option<T>,
    pending_at: Option<Instant>,
    quiet_period: Duration,
}

impl<T> DebounceWindow<T> {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            pending: None,
            pending_at: None,
            quiet_period,
        }
    }

    /// Replace the pending event
    pub fn push(&mut self, event: T, now: Instant) {
        self.pending = Some(event);
        self.pending_at = Some(now);
    }

    /// Take the pending event if it has been quiet for the full period
    pub fn take_settled(&mut self, now: Instant) -> Option<T> {
        let since = self.pending_at?;
        if now.saturating_duration_since(since) < self.quiet_period {
            return None;
        }
        self.pending_at = None;
        self.pending.take()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }

    pub fn set_quiet_period(&mut self, quiet_period: Duration) {
        self.quiet_period = quiet_period;
    }
}

/// Handle to a running debounce task
#[derive(Debug, Clone)]
pub struct DebounceAggregator<T> {
    inbox: mpsc::UnboundedSender<T>,
    outbox: mpsc::UnboundedSender<T>,
    delay: Arc<watch::Sender<Duration>>,
}

impl<T: Send + 'static> DebounceAggregator<T> {
    /// Start the aggregator. The timer task owns the window until `cancel`.
    pub fn spawn(delay: Duration, outbox: mpsc::UnboundedSender<T>, cancel: CancellationToken) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (delay_tx, delay_rx) = watch::channel(delay);
        tokio::spawn(run_timer(delay_rx, rx, outbox.clone(), cancel).with_current_subscriber());
        Self {
            inbox,
            outbox,
            delay: Arc::new(delay_tx),
        }
    }

    /// Hand an event to the aggregator; false once it has shut down
    pub fn enqueue(&self, event: T) -> bool {
        if self.delay.borrow().is_zero() {
            return self.outbox.send(event).is_ok();
        }
        self.inbox.send(event).is_ok()
    }

    /// Change the quiet period. A pending event is measured against the new one.
    pub fn set_delay(&self, delay: Duration) {
        let previous = self.delay.send_replace(delay);
        if previous != delay {
            tracing::debug!("Debounce delay changed from {:?} to {:?}", previous, delay);
        }
    }
}

async fn run_timer<T>(
    mut delay: watch::Receiver<Duration>,
    mut rx: mpsc::UnboundedReceiver<T>,
    outbox: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
) {
    let mut window = DebounceWindow::new(*delay.borrow_and_update());
    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Ok(()) = delay.changed() => {
                window.set_quiet_period(*delay.borrow_and_update());
                timer.as_mut().reset(Instant::now());
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let now = Instant::now();
                window.push(event, now);
                timer.as_mut().reset(now + *delay.borrow());
            }
            _ = &mut timer, if !window.is_empty() => {
                let now = Instant::now();
                match window.take_settled(now) {
                    Some(event) => {
                        tracing::debug!("Debounce window settled, delivering");
                        if outbox.send(event).is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("Debounce window still busy, holding event");
                        timer.as_mut().reset(now + *delay.borrow());
                    }
                }
            }
        }
    }

    tracing::debug!("Debounce timer stopped");
}
