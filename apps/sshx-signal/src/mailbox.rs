//! Per-identity message queues with an inactivity watchdog.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sshx_proto::SignalingMessage;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};

use crate::config::Config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox for {0} is full")]
    Full(String),
}

#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<Inner>,
}

struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    ttl: Duration,
    depth: usize,
    pull_timeout: Duration,
    generations: AtomicU64,
}

struct Slot {
    sender: mpsc::Sender<SignalingMessage>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<SignalingMessage>>>,
    deadline: Instant,
    generation: u64,
}

impl Mailbox {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                ttl: config.mailbox_ttl,
                depth: config.queue_depth.max(1),
                pull_timeout: config.pull_timeout,
                generations: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueues without blocking. A push always refreshes the watchdog,
    /// even when the queue is full and the message is dropped.
    pub fn push(&self, identity: &str, message: SignalingMessage) -> Result<(), MailboxError> {
        let mut slots = self.inner.slots.lock();
        let slot = match slots.entry(identity.to_string()) {
            Entry::Occupied(entry) => {
                let slot = entry.into_mut();
                slot.deadline = Instant::now() + self.inner.ttl;
                slot
            }
            Entry::Vacant(entry) => entry.insert(self.inner.open_slot(identity)),
        };
        match slot.sender.try_send(message) {
            Ok(()) => {
                trace!(target = "mailbox", identity, "queued message");
                Ok(())
            }
            Err(_) => Err(MailboxError::Full(identity.to_string())),
        }
    }

    /// Waits up to the pull timeout for the next message for `identity`.
    pub async fn pull(&self, identity: &str) -> Option<SignalingMessage> {
        let receiver = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .entry(identity.to_string())
                .or_insert_with(|| self.inner.open_slot(identity));
            Arc::clone(&slot.receiver)
        };
        timeout(self.inner.pull_timeout, async move {
            receiver.lock().await.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.inner.slots.lock().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn open_slot(self: &Arc<Self>, identity: &str) -> Slot {
        let (sender, receiver) = mpsc::channel(self.depth);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        debug!(target = "mailbox", identity, generation, "opened mailbox");
        tokio::spawn(watchdog(Arc::clone(self), identity.to_string(), generation));
        Slot {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            deadline: Instant::now() + self.ttl,
            generation,
        }
    }
}

async fn watchdog(inner: Arc<Inner>, identity: String, generation: u64) {
    loop {
        let deadline = match inner.slots.lock().get(&identity) {
            Some(slot) if slot.generation == generation => slot.deadline,
            _ => return,
        };
        sleep_until(deadline).await;

        let mut slots = inner.slots.lock();
        match slots.get(&identity) {
            Some(slot) if slot.generation == generation => {
                if slot.deadline <= Instant::now() {
                    slots.remove(&identity);
                    debug!(target = "mailbox", identity = %identity, "mailbox expired");
                    return;
                }
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshx_proto::{Direction, PoolId};
    use tokio::time::sleep;

    fn config(depth: usize) -> Config {
        Config {
            queue_depth: depth,
            ..Config::default()
        }
    }

    fn message(value: i64) -> SignalingMessage {
        SignalingMessage::candidate(
            PoolId::new(0, value, Direction::Outbound),
            "a",
            "b",
            Vec::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_mailbox_is_evicted_after_ttl() {
        let mailbox = Mailbox::new(&config(4));
        mailbox.push("b", message(1)).unwrap();
        assert!(mailbox.contains("b"));

        sleep(Duration::from_secs(16)).await;
        assert!(!mailbox.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_expiry_resets_the_watchdog() {
        let mailbox = Mailbox::new(&config(4));
        mailbox.push("b", message(1)).unwrap();

        sleep(Duration::from_secs(10)).await;
        mailbox.push("b", message(2)).unwrap();

        sleep(Duration::from_secs(10)).await;
        assert!(mailbox.contains("b"), "second push should extend the lifetime");
        assert_eq!(mailbox.pull("b").await.unwrap().id.value, 1);

        sleep(Duration::from_secs(6)).await;
        assert!(!mailbox.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_the_newest_message() {
        let mailbox = Mailbox::new(&config(2));
        mailbox.push("b", message(1)).unwrap();
        mailbox.push("b", message(2)).unwrap();
        assert_eq!(
            mailbox.push("b", message(3)),
            Err(MailboxError::Full("b".into()))
        );

        assert_eq!(mailbox.pull("b").await.unwrap().id.value, 1);
        assert_eq!(mailbox.pull("b").await.unwrap().id.value, 2);
        assert!(mailbox.pull("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pull_times_out_and_creates_the_queue() {
        let mailbox = Mailbox::new(&config(4));
        let started = Instant::now();
        assert!(mailbox.pull("nobody").await.is_none());
        assert!(started.elapsed() >= crate::config::DEFAULT_PULL_TIMEOUT);
        assert!(mailbox.contains("nobody"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_pull_is_woken_by_push() {
        let mailbox = Mailbox::new(&config(4));
        let puller = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pull("b").await })
        };
        sleep(Duration::from_secs(1)).await;
        mailbox.push("b", message(9)).unwrap();
        let received = puller.await.unwrap().unwrap();
        assert_eq!(received.id.value, 9);
    }
}
