//! In-memory progress fan-out.
//!
//! Each execution id gets a bounded history (oldest dropped) and a set of
//! callback subscribers. New subscribers first receive the buffered history,
//! then live events. Subscriber failures are logged and never reach the
//! publisher.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::domain::ProgressUpdate;

/// Events kept per execution for late subscribers
pub const HISTORY_CAPACITY: usize = 50;

/// Called without any broadcaster lock held, so it may publish or subscribe
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscriber {
    id: u64,
    callback: ProgressCallback,
    /// `Some` while history is being replayed; live events wait here
    backlog: Mutex<Option<Vec<ProgressUpdate>>>,
}

impl Subscriber {
    fn offer(&self, update: &ProgressUpdate) {
        if let Some(queued) = lock(&self.backlog).as_mut() {
            queued.push(update.clone());
            return;
        }
        deliver(&self.callback, update);
    }

    /// Delivers events queued during replay, then switches to live delivery
    fn drain_backlog(&self) {
        loop {
            let queued = {
                let mut backlog = lock(&self.backlog);
                let queued = backlog.take().unwrap_or_default();
                if queued.is_empty() {
                    return;
                }
                *backlog = Some(Vec::new());
                queued
            };
            for update in &queued {
                deliver(&self.callback, update);
            }
        }
    }
}

#[derive(Default)]
struct Channel {
    history: VecDeque<ProgressUpdate>,
    subscribers: Vec<Arc<Subscriber>>,
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<String, Channel>>,
    next_subscriber: AtomicU64,
}

impl Inner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        lock(&self.channels)
    }

    fn remove_subscriber(&self, execution_id: &str, subscriber_id: u64) {
        if let Some(channel) = self.channels().get_mut(execution_id) {
            channel.subscribers.retain(|s| s.id != subscriber_id);
        }
    }
}

#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    inner: Arc<Inner>,
}

impl ProgressBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `execution_id` subscribable before its first event
    pub fn open(&self, execution_id: &str) {
        self.inner.channels().entry(execution_id.to_string()).or_default();
    }

    /// Buffers `update` and delivers it to the current subscribers of its execution
    pub fn publish(&self, update: ProgressUpdate) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut channels = self.inner.channels();
            let channel = channels.entry(update.execution_id.clone()).or_default();
            if channel.history.len() == HISTORY_CAPACITY {
                channel.history.pop_front();
            }
            channel.history.push_back(update.clone());
            channel.subscribers.clone()
        };

        for subscriber in subscribers {
            subscriber.offer(&update);
        }
    }

    /// Registers `callback`, replaying buffered history first. The callback
    /// stays registered until the returned [`Subscription`] is dropped or
    /// the execution is cleaned up. An execution that was never opened, or
    /// is already cleaned up, gets an inert subscription and the callback is
    /// dropped.
    pub fn subscribe(&self, execution_id: &str, callback: ProgressCallback) -> Subscription {
        let subscriber = Arc::new(Subscriber {
            id: self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed),
            callback,
            backlog: Mutex::new(Some(Vec::new())),
        });

        let history: Vec<ProgressUpdate> = {
            let mut channels = self.inner.channels();
            let Some(channel) = channels.get_mut(execution_id) else {
                debug!("No progress channel for {}; subscription is inert", execution_id);
                return Subscription {
                    inner: Weak::new(),
                    execution_id: execution_id.to_string(),
                    subscriber_id: subscriber.id,
                };
            };
            channel.subscribers.push(Arc::clone(&subscriber));
            channel.history.iter().cloned().collect()
        };

        for update in &history {
            deliver(&subscriber.callback, update);
        }
        subscriber.drain_backlog();

        debug!("Subscriber {} attached to {}", subscriber.id, execution_id);
        Subscription {
            inner: Arc::downgrade(&self.inner),
            execution_id: execution_id.to_string(),
            subscriber_id: subscriber.id,
        }
    }

    /// Stream view of [`subscribe`](Self::subscribe). Ends when the execution
    /// is cleaned up, or at once for an unknown execution.
    pub fn subscribe_stream(&self, execution_id: &str) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(
            execution_id,
            Arc::new(move |update: &ProgressUpdate| -> anyhow::Result<()> {
                tx.send(update.clone())
                    .map_err(|_| anyhow::anyhow!("progress stream receiver dropped"))
            }),
        );
        ProgressStream {
            updates: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }

    /// Buffered events of an execution, oldest first
    pub fn history(&self, execution_id: &str) -> Vec<ProgressUpdate> {
        self.inner
            .channels()
            .get(execution_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.inner
            .channels()
            .get(execution_id)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Executions currently holding history or subscribers
    pub fn channel_count(&self) -> usize {
        self.inner.channels().len()
    }

    /// Drops history and subscribers of an execution
    pub fn cleanup(&self, execution_id: &str) {
        if self.inner.channels().remove(execution_id).is_some() {
            debug!("🧹 Progress channel {} cleaned up", execution_id);
        }
    }

    /// Cleans up after `grace`, on the runtime this is called from
    pub fn schedule_cleanup(&self, execution_id: &str, grace: Duration) -> tokio::task::JoinHandle<()> {
        let broadcaster = self.clone();
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            broadcaster.cleanup(&execution_id);
        })
    }
}

fn deliver(callback: &ProgressCallback, update: &ProgressUpdate) {
    match catch_unwind(AssertUnwindSafe(|| callback(update))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Progress subscriber of {} failed: {}", update.execution_id, e),
        Err(_) => warn!("Progress subscriber of {} panicked", update.execution_id),
    }
}

/// Handle of one subscriber; dropping it unsubscribes
pub struct Subscription {
    inner: Weak<Inner>,
    execution_id: String,
    subscriber_id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_subscriber(&self.execution_id, self.subscriber_id);
        }
    }
}

/// Live progress of one execution as a [`Stream`]
pub struct ProgressStream {
    updates: UnboundedReceiverStream<ProgressUpdate>,
    _subscription: Subscription,
}

impl Stream for ProgressStream {
    type Item = ProgressUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.updates).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressStatus;
    use futures::StreamExt;

    fn update(execution_id: &str, processed: u64) -> ProgressUpdate {
        ProgressUpdate::new(execution_id, "sales", "Sales sync", ProgressStatus::Progress)
            .with_counts(processed, 0)
    }

    fn collector() -> (ProgressCallback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |u: &ProgressUpdate| -> anyhow::Result<()> {
            sink.lock().unwrap().push(u.processed);
            Ok(())
        });
        (callback, seen)
    }

    #[test]
    fn history_is_bounded() {
        let broadcaster = ProgressBroadcaster::new();
        for i in 0..(HISTORY_CAPACITY as u64 + 10) {
            broadcaster.publish(update("e1", i));
        }
        let history = broadcaster.history("e1");
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].processed, 10);
    }

    #[test]
    fn late_subscriber_gets_replay_then_live() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(update("e1", 1));
        broadcaster.publish(update("e1", 2));

        let (callback, seen) = collector();
        let subscription = broadcaster.subscribe("e1", callback);
        broadcaster.publish(update("e1", 3));
        broadcaster.publish(update("other", 99));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        subscription.unsubscribe();
        broadcaster.publish(update("e1", 4));
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(broadcaster.subscriber_count("e1"), 0);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.open("e1");
        let _failing = broadcaster.subscribe(
            "e1",
            Arc::new(|_: &ProgressUpdate| -> anyhow::Result<()> { anyhow::bail!("closed") }),
        );
        let _panicking = broadcaster.subscribe(
            "e1",
            Arc::new(|_: &ProgressUpdate| -> anyhow::Result<()> { panic!("observer bug") }),
        );
        let (callback, seen) = collector();
        let _healthy = broadcaster.subscribe("e1", callback);

        broadcaster.publish(update("e1", 7));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn stream_ends_on_cleanup() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(update("e1", 1));
        let stream = broadcaster.subscribe_stream("e1");
        broadcaster.publish(update("e1", 2));
        broadcaster.cleanup("e1");

        let received: Vec<u64> = stream.map(|u| u.processed).collect().await;
        assert_eq!(received, vec![1, 2]);
        assert!(broadcaster.history("e1").is_empty());
    }

    #[tokio::test]
    async fn stream_of_cleaned_up_or_unknown_execution_ends_at_once() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(update("e1", 1));
        broadcaster.cleanup("e1");

        let mut stream = broadcaster.subscribe_stream("e1");
        assert!(stream.next().await.is_none());
        let mut stream = broadcaster.subscribe_stream("never-started");
        assert!(stream.next().await.is_none());
        assert_eq!(broadcaster.channel_count(), 0);
    }

    #[tokio::test]
    async fn opened_execution_streams_its_first_events() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.open("e1");
        let stream = broadcaster.subscribe_stream("e1");
        broadcaster.publish(update("e1", 1));
        broadcaster.cleanup("e1");

        let received: Vec<u64> = stream.map(|u| u.processed).collect().await;
        assert_eq!(received, vec![1]);
    }

    #[test]
    fn callbacks_may_reenter_the_broadcaster() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(update("e1", 1));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let inner = broadcaster.clone();
        let _subscription = broadcaster.subscribe(
            "e1",
            Arc::new(move |u: &ProgressUpdate| -> anyhow::Result<()> {
                sink.lock().unwrap().push(u.processed);
                if u.processed == 1 {
                    // publishing from the replayed event queues behind it
                    inner.publish(update("e1", 2));
                    let _ = inner.history("e1");
                }
                Ok(())
            }),
        );

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        broadcaster.publish(update("e1", 3));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(broadcaster.history("e1").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_cleanup_waits_for_grace() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(update("e1", 1));

        let handle = broadcaster.schedule_cleanup("e1", Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(broadcaster.history("e1").len(), 1);

        handle.await.unwrap();
        assert!(broadcaster.history("e1").is_empty());
    }
}
