//! Registry of live pairs keyed by their pool id string.
//!
//! At most one pair is admitted per key. Children spawned by a forwarding
//! listener are tracked under their parent so that removing the parent
//! removes the whole group.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use sshx_proto::Status;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::now_millis;
use crate::pair::{CleanupNotice, CleanupSender, Pair};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pair already exists, drop new: {0}")]
    AlreadyExists(String),
    #[error("cannot get pair for id {0}")]
    NotFound(String),
    #[error("admission timed out for {0}")]
    AdmissionTimeout(String),
    #[error("pair {0} closed while waiting for admission")]
    Closed(String),
}

#[derive(Default)]
struct PoolInner {
    pairs: HashMap<String, Arc<dyn Pair>>,
    stats: HashMap<String, Status>,
    children: HashMap<String, Vec<String>>,
}

enum Admission {
    Registered,
    Replaced(Arc<dyn Pair>),
    Rejected,
    Wait,
}

impl PoolInner {
    fn register(&mut self, key: &str, pair: Arc<dyn Pair>) {
        let adapter = pair.adapter();
        let parent = adapter.parent_id();
        self.stats.insert(
            key.to_string(),
            Status {
                pair_id: key.to_string(),
                target_id: adapter.host_id(),
                app_code: adapter.code(),
                parent_pair_id: parent.clone(),
                start_time: now_millis(),
            },
        );
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().push(key.to_string());
        }
        self.pairs.insert(key.to_string(), pair);
    }

    fn unlink_from_parent(&mut self, key: &str, parent: &str) {
        if let Some(siblings) = self.children.get_mut(parent) {
            siblings.retain(|child| child != key);
            if siblings.is_empty() {
                self.children.remove(parent);
            }
        }
    }

    /// Detaches `key` and its descendants. With `serial` set, nothing is
    /// taken unless the pair under `key` still carries that serial.
    fn take_group(&mut self, key: &str, serial: Option<u64>) -> Option<Vec<Arc<dyn Pair>>> {
        let owned = self
            .pairs
            .get(key)
            .is_some_and(|pair| serial.is_none_or(|serial| pair.serial() == serial));
        if !owned {
            return None;
        }
        let mut removed = Vec::new();
        let mut pending = vec![key.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(children) = self.children.remove(&current) {
                pending.extend(children);
            }
            if let Some(pair) = self.pairs.remove(&current) {
                removed.push(pair);
            }
            if let Some(parent) = self.stats.remove(&current).and_then(|s| s.parent_pair_id) {
                self.unlink_from_parent(&current, &parent);
            }
        }
        Some(removed)
    }

    fn evaluate(&mut self, key: &str, candidate: &Arc<dyn Pair>) -> Admission {
        let Some(existing) = self.pairs.get(key).cloned() else {
            self.register(key, Arc::clone(candidate));
            return Admission::Registered;
        };
        if existing.serial() == candidate.serial() {
            return Admission::Registered;
        }
        if existing.is_closed() || (!existing.is_ready() && candidate.is_ready()) {
            if let Some(parent) = self.stats.remove(key).and_then(|s| s.parent_pair_id) {
                self.unlink_from_parent(key, &parent);
            }
            self.register(key, Arc::clone(candidate));
            return Admission::Replaced(existing);
        }
        if existing.is_ready() {
            return Admission::Rejected;
        }
        Admission::Wait
    }
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    poll_interval: Duration,
    admission_timeout: Duration,
    cleanup: CleanupSender,
}

impl ConnectionPool {
    /// Creates the pool and starts the task that reaps closed pairs.
    pub fn new(poll_interval: Duration, admission_timeout: Duration) -> Arc<Self> {
        let (cleanup, notices) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            poll_interval,
            admission_timeout,
            cleanup,
        });
        tokio::spawn(reap(Arc::downgrade(&pool), notices));
        pool
    }

    /// Pairs hand this to their close path.
    pub fn cleanup_sender(&self) -> CleanupSender {
        self.cleanup.clone()
    }

    pub async fn add_pair(&self, pair: Arc<dyn Pair>) -> Result<(), PoolError> {
        let key = pair.key();
        let deadline = Instant::now() + self.admission_timeout;
        loop {
            let admission = self.inner.lock().evaluate(&key, &pair);
            match admission {
                Admission::Registered => {
                    debug!(target = "pool", pair_id = %key, "pair registered");
                    return Ok(());
                }
                Admission::Replaced(previous) => {
                    info!(target = "pool", pair_id = %key, "replacing pending pair");
                    previous.close().await;
                    return Ok(());
                }
                Admission::Rejected => {
                    warn!(target = "pool", pair_id = %key, "pair already exists, drop new");
                    pair.close().await;
                    return Err(PoolError::AlreadyExists(key));
                }
                Admission::Wait => {
                    if pair.is_closed() {
                        return Err(PoolError::Closed(key));
                    }
                    if Instant::now() >= deadline {
                        pair.close().await;
                        return Err(PoolError::AdmissionTimeout(key));
                    }
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Removes `key` and every pair registered beneath it, then closes them
    /// children first.
    pub async fn remove_pair(&self, key: &str) -> Result<(), PoolError> {
        let removed = self.inner.lock().take_group(key, None);
        let removed = removed.ok_or_else(|| PoolError::NotFound(key.to_string()))?;
        self.close_group(key, removed).await;
        Ok(())
    }

    pub fn get_pair(&self, key: &str) -> Option<Arc<dyn Pair>> {
        self.inner.lock().pairs.get(key).cloned()
    }

    /// Drops `key` only if it still belongs to the pair that asked.
    pub async fn release(&self, key: &str, serial: u64) {
        let removed = self.inner.lock().take_group(key, Some(serial));
        if let Some(removed) = removed {
            self.close_group(key, removed).await;
        }
    }

    async fn close_group(&self, key: &str, removed: Vec<Arc<dyn Pair>>) {
        info!(target = "pool", pair_id = %key, count = removed.len(), "removing pair group");
        for pair in removed.iter().rev() {
            pair.close().await;
        }
    }

    pub fn stats(&self) -> Vec<Status> {
        let mut stats: Vec<Status> = self.inner.lock().stats.values().cloned().collect();
        stats.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.pair_id.cmp(&b.pair_id))
        });
        stats
    }

    pub fn children_of(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .children
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) {
        let pairs: Vec<Arc<dyn Pair>> = {
            let mut inner = self.inner.lock();
            inner.stats.clear();
            inner.children.clear();
            inner.pairs.drain().map(|(_, pair)| pair).collect()
        };
        for pair in pairs {
            pair.close().await;
        }
    }
}

async fn reap(pool: Weak<ConnectionPool>, mut notices: mpsc::UnboundedReceiver<CleanupNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.release(&notice.key, notice.serial).await;
    }
}
