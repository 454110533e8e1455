//! Fixed-size broker channel pool
//!
//! All channels are created up front over one shared connection. A borrower
//! holds a [`PooledChannel`] exclusively; dropping it hands the channel back,
//! unless the channel has died, in which case it is discarded and the next
//! borrow that finds the idle list empty opens a replacement. A semaphore
//! bounds the number of outstanding borrows to the pool size.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::{broker_metrics, BrokerError, Result};

/// Opens, checks and closes channels on one underlying broker connection.
#[async_trait]
pub trait ChannelManager: Send + Sync + 'static {
    type Channel: Send + Sync + 'static;

    async fn create_channel(&self) -> Result<Self::Channel>;

    fn is_open(&self, channel: &Self::Channel) -> bool;

    async fn close_channel(&self, channel: Self::Channel);

    /// Close the shared connection. Called once, after all idle channels are closed.
    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Label used in logs and metrics
    pub name: String,
    pub size: usize,
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            size: 10,
            borrow_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
}

struct PoolInner<M: ChannelManager> {
    config: PoolConfig,
    manager: M,
    idle: Mutex<Vec<M::Channel>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<M: ChannelManager> PoolInner<M> {
    /// Readmit a returned channel, or hand it back if it must be closed instead.
    fn give_back(&self, channel: M::Channel) -> Option<M::Channel> {
        if self.closed.load(Ordering::SeqCst) || !self.manager.is_open(&channel) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            broker_metrics::record_channel_discarded(&self.config.name);
            debug!(pool = %self.config.name, "Discarding returned channel");
            return Some(channel);
        }
        self.idle.lock().push(channel);
        None
    }
}

pub struct ChannelPool<M: ChannelManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ChannelManager> Clone for ChannelPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ChannelManager> ChannelPool<M> {
    /// Build the pool and eagerly open `config.size` channels.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self> {
        let mut channels = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            channels.push(manager.create_channel().await?);
        }

        info!(pool = %config.name, size = config.size, "Channel pool initialized");

        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.size)),
                created: AtomicU64::new(config.size as u64),
                idle: Mutex::new(channels),
                config,
                manager,
                closed: AtomicBool::new(false),
                discarded: AtomicU64::new(0),
            }),
        })
    }

    /// Wait up to the configured timeout for a channel.
    pub async fn borrow(&self) -> Result<PooledChannel<M>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::PoolClosed);
        }

        let waited = self.inner.config.borrow_timeout;
        let permit = match tokio::time::timeout(waited, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BrokerError::PoolClosed),
            Err(_) => {
                warn!(pool = %self.inner.config.name, ?waited, "Timed out waiting for a channel");
                broker_metrics::record_pool_exhausted(&self.inner.config.name);
                return Err(BrokerError::PoolExhausted { waited });
            }
        };

        let channel = loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(channel) if self.inner.manager.is_open(&channel) => break channel,
                Some(dead) => {
                    self.inner.discarded.fetch_add(1, Ordering::Relaxed);
                    broker_metrics::record_channel_discarded(&self.inner.config.name);
                    self.inner.manager.close_channel(dead).await;
                }
                None => {
                    let channel = self.inner.manager.create_channel().await?;
                    self.inner.created.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.inner.config.name, "Opened replacement channel");
                    break channel;
                }
            }
        };

        broker_metrics::set_pool_in_use(&self.inner.config.name, self.in_use());

        Ok(PooledChannel {
            channel: Some(channel),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    fn in_use(&self) -> usize {
        self.inner.config.size - self.inner.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.config.size,
            idle: self.inner.idle.lock().len(),
            in_use: self.in_use(),
            created: self.inner.created.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fail pending and future borrows, close idle channels, then the connection.
    ///
    /// Channels still borrowed are closed when their holders drop them.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<M::Channel> = std::mem::take(&mut *self.inner.idle.lock());
        let count = idle.len();
        for channel in idle {
            self.inner.manager.close_channel(channel).await;
        }
        self.inner.manager.close().await;

        info!(pool = %self.inner.config.name, closed_channels = count, "Channel pool closed");
    }
}

/// Exclusive handle on a pooled channel; returned to the pool on drop.
pub struct PooledChannel<M: ChannelManager> {
    channel: Option<M::Channel>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ChannelManager> PooledChannel<M> {
    /// Close the channel instead of returning it.
    ///
    /// The borrow slot stays taken until the close completes.
    pub async fn discard(mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
            broker_metrics::record_channel_discarded(&self.pool.config.name);
            self.pool.manager.close_channel(channel).await;
        }
    }
}

impl<M: ChannelManager> Deref for PooledChannel<M> {
    type Target = M::Channel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel,
            None => unreachable!("channel is only taken on drop or discard"),
        }
    }
}

impl<M: ChannelManager> Drop for PooledChannel<M> {
    fn drop(&mut self) {
        let Some(rejected) = self.channel.take().and_then(|c| self.pool.give_back(c)) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.manager.close_channel(rejected).await;
                });
            }
            Err(_) => {
                warn!(pool = %self.pool.config.name, "No runtime to close a rejected channel on");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingManager {
        next: AtomicUsize,
    }

    #[async_trait]
    impl ChannelManager for CountingManager {
        type Channel = usize;

        async fn create_channel(&self) -> Result<usize> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn is_open(&self, _channel: &usize) -> bool {
            true
        }

        async fn close_channel(&self, _channel: usize) {}

        async fn close(&self) {}
    }

    async fn pool(size: usize) -> ChannelPool<CountingManager> {
        ChannelPool::new(
            CountingManager { next: AtomicUsize::new(0) },
            PoolConfig {
                name: "unit".to_string(),
                size,
                borrow_timeout: Duration::from_millis(50),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_eager_creation() {
        let pool = pool(4).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.created, 4);
    }

    #[tokio::test]
    async fn test_return_on_drop() {
        let pool = pool(1).await;
        {
            let ch = pool.borrow().await.unwrap();
            assert_eq!(*ch, 0);
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().in_use, 0);
        let ch = pool.borrow().await.unwrap();
        assert_eq!(*ch, 0);
    }

    #[tokio::test]
    async fn test_exhausted_times_out() {
        let pool = pool(1).await;
        let _held = pool.borrow().await.unwrap();
        assert!(matches!(
            pool.borrow().await,
            Err(BrokerError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_discard_opens_replacement() {
        let pool = pool(1).await;
        pool.borrow().await.unwrap().discard().await;

        let ch = pool.borrow().await.unwrap();
        assert_eq!(*ch, 1);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().created, 2);
    }
}
