//! Recurring fetch timer owned by a query.

use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

/// Handle for a running poll loop.
///
/// Cancelling stops future ticks; a fetch already started by the loop runs to
/// completion. Dropping the handle cancels it as well.
pub(crate) struct PollHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    period: Duration,
}

impl PollHandle {
    /// Spawns a loop calling `tick` every `period`, starting one period from now.
    ///
    /// The loop ends when cancelled or when `tick` returns `None`.
    pub(crate) fn spawn<F>(period: Duration, tick: F) -> Self
    where
        F: Fn() -> Option<BoxFuture<'static, ()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        // NOTE: Skip missed ticks: a slow fetch delays the next one instead of
        // triggering a burst of catch-up fetches.
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let join = tokio::spawn(async move {
            let ticks = IntervalStream::new(timer)
                .skip(1) // Skip the first immediate tick
                .take_until(cancelled.cancelled_owned());
            let mut ticks = std::pin::pin!(ticks);

            while ticks.next().await.is_some() {
                match tick() {
                    Some(fetch) => fetch.await,
                    None => break,
                }
            }
        });

        Self {
            token,
            join,
            period,
        }
    }

    pub(crate) const fn period(&self) -> Duration {
        self.period
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
