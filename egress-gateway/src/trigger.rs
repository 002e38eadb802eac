use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Coalescing debouncer for the reconciler.
///
/// `trigger_with_reason` returns immediately; reasons accumulate until the
/// callback task picks them up. At most one callback runs at a time, at most
/// one further run is pending, and consecutive callback starts are at least
/// `min_interval` apart.
pub(crate) struct Trigger {
    tx: mpsc::UnboundedSender<String>,
}

impl Trigger {
    pub fn new<F, Fut>(name: &'static str, min_interval: Duration, callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut last_start: Option<Instant> = None;

            while let Some(first) = rx.recv().await {
                let mut reasons = vec![first];
                while let Ok(reason) = rx.try_recv() {
                    reasons.push(reason);
                }

                if let Some(last) = last_start {
                    sleep_until(last + min_interval).await;
                    // fold in anything that arrived during the cool-down
                    while let Ok(reason) = rx.try_recv() {
                        reasons.push(reason);
                    }
                }

                last_start = Some(Instant::now());
                let reason = reasons.join(", ");
                debug!(trigger = name, reason = %reason, "firing");
                callback(reason).await;
            }
        });

        Self { tx }
    }

    pub fn trigger_with_reason(&self, reason: &str) {
        // the receiver only goes away when the trigger is dropped
        let _ = self.tx.send(reason.to_string());
    }
}
