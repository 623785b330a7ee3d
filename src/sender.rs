//! Bounded-retry broadcast with delivery confirmation.
//!
//! Every call to [`ReliableSender::send`] makes at most `max_retries + 1`
//! attempts. An attempt is one broadcast request followed by a wait for the
//! link's delivery report, bounded by `delivery_timeout`. The first confirmed
//! attempt ends the call; exhausting the budget fires the failure
//! notification. Exactly one of the two notifications fires per call.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::link::{DeliveryReport, Link, broadcast_address};

pub const MAX_RETRIES: u8 = 2;
pub const RETRY_DELAY: Duration = Duration::from_millis(10);
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub retry_delay: Duration,
    pub delivery_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            delivery_timeout: DELIVERY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Upper bound on how long a single `send` can take.
    pub fn worst_case(&self) -> Duration {
        let retries = u32::from(self.max_retries);
        self.delivery_timeout * (retries + 1) + self.retry_delay * retries
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { attempts: u8 },
    Failed { attempts: u8 },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u8 {
        match self {
            SendOutcome::Delivered { attempts } | SendOutcome::Failed { attempts } => *attempts,
        }
    }
}

type Notify = Box<dyn FnMut() + Send>;

pub struct ReliableSender<L: Link> {
    link: L,
    reports: mpsc::UnboundedReceiver<DeliveryReport>,
    policy: RetryPolicy,
    on_success: Vec<Notify>,
    on_failure: Vec<Notify>,
}

impl<L: Link> ReliableSender<L> {
    pub fn new(
        link: L,
        reports: mpsc::UnboundedReceiver<DeliveryReport>,
        policy: RetryPolicy,
    ) -> Self {
        ReliableSender {
            link,
            reports,
            policy,
            on_success: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn add_on_send_success(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_success.push(Box::new(callback));
    }

    pub fn add_on_send_failure(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_failure.push(Box::new(callback));
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Broadcasts `payload` until the link confirms delivery or the retry
    /// budget runs out. Cannot be cancelled once started.
    pub async fn send(&mut self, payload: &[u8]) -> SendOutcome {
        let destination = broadcast_address();
        let max_retries = self.policy.max_retries;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("Retry attempt {}/{}", attempt, max_retries);
                sleep(self.policy.retry_delay).await;
            }

            // Reports left over from an attempt that already timed out say
            // nothing about this one.
            while self.reports.try_recv().is_ok() {}

            if let Err(err) = self.link.broadcast(&destination, payload) {
                warn!("Broadcast rejected: {}", err);
                continue;
            }

            match timeout(self.policy.delivery_timeout, self.reports.recv()).await {
                Ok(Some(report)) if report.success => {
                    self.notify_success();
                    return SendOutcome::Delivered {
                        attempts: attempt + 1,
                    };
                }
                Ok(Some(report)) => debug!(
                    "Attempt {} to {} not delivered",
                    attempt + 1,
                    report.destination
                ),
                Ok(None) => warn!("Delivery report channel closed"),
                Err(_) => debug!(
                    "No delivery report within {:?}",
                    self.policy.delivery_timeout
                ),
            }
        }

        self.notify_failure();
        warn!("Send failed after {} attempts", u16::from(max_retries) + 1);
        SendOutcome::Failed {
            attempts: max_retries + 1,
        }
    }

    fn notify_success(&mut self) {
        for callback in self.on_success.iter_mut() {
            callback();
        }
    }

    fn notify_failure(&mut self) {
        for callback in self.on_failure.iter_mut() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use mac_address::MacAddress;

    use super::*;
    use crate::link::LinkError;

    #[derive(Clone, Copy)]
    enum Reply {
        Reject,
        Deliver(bool),
        Silent,
    }

    struct MockLink {
        replies: Mutex<VecDeque<Reply>>,
        attempts: Arc<AtomicUsize>,
        reports: mpsc::UnboundedSender<DeliveryReport>,
    }

    impl Link for MockLink {
        fn broadcast(&self, destination: &MacAddress, _payload: &[u8]) -> Result<(), LinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Deliver(false));
            match reply {
                Reply::Reject => Err(LinkError::QueueFull),
                Reply::Deliver(success) => {
                    let _ = self.reports.send(DeliveryReport {
                        destination: *destination,
                        success,
                    });
                    Ok(())
                }
                Reply::Silent => Ok(()),
            }
        }

        fn address(&self) -> MacAddress {
            MacAddress::new([0x02, 0, 0, 0, 0, 0x01])
        }
    }

    struct Harness {
        sender: ReliableSender<MockLink>,
        attempts: Arc<AtomicUsize>,
        successes: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
        reports: mpsc::UnboundedSender<DeliveryReport>,
    }

    fn harness(replies: Vec<Reply>) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let link = MockLink {
            replies: Mutex::new(replies.into()),
            attempts: attempts.clone(),
            reports: tx.clone(),
        };

        let mut sender = ReliableSender::new(link, rx, RetryPolicy::default());
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        sender.add_on_send_success(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = failures.clone();
        sender.add_on_send_failure(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Harness {
            sender,
            attempts,
            successes,
            failures,
            reports: tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let mut h = harness(vec![Reply::Deliver(true)]);
        let outcome = h.sender.send(b"line").await;

        assert_eq!(outcome, SendOutcome::Delivered { attempts: 1 });
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.successes.load(Ordering::SeqCst), 1);
        assert_eq!(h.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_late_success() {
        let mut h = harness(vec![Reply::Deliver(false), Reply::Deliver(true), Reply::Deliver(true)]);
        let outcome = h.sender.send(b"line").await;

        assert_eq!(outcome, SendOutcome::Delivered { attempts: 2 });
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_link() {
        let mut h = harness(vec![Reply::Deliver(false); 10]);
        let outcome = h.sender.send(b"line").await;

        assert_eq!(outcome, SendOutcome::Failed { attempts: 3 });
        assert!(!outcome.is_delivered());
        assert_eq!(h.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(h.successes.load(Ordering::SeqCst), 0);
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_attempts_are_retried() {
        let mut h = harness(vec![Reply::Reject, Reply::Reject, Reply::Deliver(true)]);
        let outcome = h.sender.send(b"line").await;

        assert_eq!(outcome, SendOutcome::Delivered { attempts: 3 });
        assert_eq!(h.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_is_bounded() {
        let mut h = harness(vec![Reply::Silent; 3]);
        let policy = *h.sender.policy();
        let started = tokio::time::Instant::now();
        let outcome = h.sender.send(b"line").await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.attempts(), 3);
        assert!(!outcome.is_delivered());
        assert!(elapsed <= policy.worst_case(), "{elapsed:?}");
        assert!(elapsed >= policy.delivery_timeout * 3);
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_report_is_ignored() {
        let mut h = harness(vec![Reply::Silent; 3]);
        h.reports
            .send(DeliveryReport {
                destination: broadcast_address(),
                success: true,
            })
            .unwrap();

        let outcome = h.sender.send(b"line").await;
        assert_eq!(outcome, SendOutcome::Failed { attempts: 3 });
    }

    #[test]
    fn test_worst_case_bound() {
        assert_eq!(
            RetryPolicy::default().worst_case(),
            Duration::from_millis(3 * 100 + 2 * 10)
        );
    }
}
