//! Fan-out Consumer
//!
//! Per delivery: broadcast the raw payload to the room's registered session
//! (if any and still open), enqueue it for persistence, then ack. A full
//! write buffer is logged but still acked. Any processing error rejects the
//! delivery without requeue, so the message is dropped rather than retried.
//!
//! With more than one worker per room, deliveries for that room may be
//! broadcast and enqueued out of publish order. A single worker preserves
//! broker order into both.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cr_broker::BrokerError;

use crate::error::FanoutError;
use crate::server_metrics;
use crate::session::{SessionError, SessionRegistry};
use crate::writer::WriteSink;

/// One broker delivery awaiting settlement
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), FanoutError>;

    /// Negative acknowledgment without requeue
    async fn reject(&self) -> Result<(), FanoutError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStats {
    pub processed: u64,
    pub broadcasts: u64,
    pub nacked: u64,
    pub enqueue_rejected: u64,
    /// Acks or rejects the broker did not take
    pub settle_failures: u64,
    pub restarts: u64,
}

#[derive(Default)]
pub struct FanoutCounters {
    processed: AtomicU64,
    broadcasts: AtomicU64,
    nacked: AtomicU64,
    enqueue_rejected: AtomicU64,
    settle_failures: AtomicU64,
    restarts: AtomicU64,
}

impl FanoutCounters {
    pub fn snapshot(&self) -> FanoutStats {
        FanoutStats {
            processed: self.processed.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            enqueue_rejected: self.enqueue_rejected.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Processes deliveries for one room.
#[derive(Clone)]
pub struct FanoutProcessor {
    room_id: String,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn WriteSink>,
    send_timeout: Duration,
    counters: Arc<FanoutCounters>,
}

impl FanoutProcessor {
    pub fn new(
        room_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn WriteSink>,
        send_timeout: Duration,
        counters: Arc<FanoutCounters>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            registry,
            sink,
            send_timeout,
            counters,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn process<D: Delivery + ?Sized>(&self, delivery: &D) -> DeliveryOutcome {
        match self.handle_payload(delivery.payload()).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    self.on_settle_failure("ack", &e);
                }
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                server_metrics::record_delivery(&self.room_id, true);
                DeliveryOutcome::Acked
            }
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Delivery processing failed, rejecting");
                if let Err(e) = delivery.reject().await {
                    self.on_settle_failure("reject", &e);
                }
                self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                server_metrics::record_delivery(&self.room_id, false);
                DeliveryOutcome::Rejected
            }
        }
    }

    fn on_settle_failure(&self, action: &'static str, error: &FanoutError) {
        self.counters.settle_failures.fetch_add(1, Ordering::Relaxed);
        server_metrics::record_settle_failure(&self.room_id, action);
        error!(room_id = %self.room_id, action, error = %error, "Failed to settle delivery");
    }

    async fn handle_payload(&self, payload: &[u8]) -> Result<(), FanoutError> {
        let text = std::str::from_utf8(payload)?;

        self.broadcast(text).await?;

        if !self.sink.enqueue(text.to_string()).await {
            self.counters.enqueue_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(room_id = %self.room_id, "Write buffer full, message will not be persisted");
        }
        Ok(())
    }

    async fn broadcast(&self, text: &str) -> Result<(), FanoutError> {
        let Some(session) = self.registry.get(&self.room_id) else {
            return Ok(());
        };
        if !session.is_open() {
            return Ok(());
        }

        match session.send(text.to_string(), self.send_timeout).await {
            Ok(()) => {
                self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
                server_metrics::record_broadcast(&self.room_id);
                Ok(())
            }
            // Closed between the check and the send: same as absent
            Err(SessionError::Closed) => {
                debug!(room_id = %self.room_id, "Subscriber closed, broadcast dropped");
                Ok(())
            }
            Err(e @ SessionError::Timeout(_)) => Err(FanoutError::Broadcast {
                room_id: self.room_id.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Used in this instance's queue names
    pub instance_id: String,
    pub rooms: Vec<String>,
    pub consumers_per_room: usize,
    pub prefetch_count: u16,
    pub send_timeout: Duration,
    /// Delay before a failed worker re-establishes its consumer
    pub restart_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            instance_id: "chatrelay".to_string(),
            rooms: (1..=20).map(|i| format!("room{}", i)).collect(),
            consumers_per_room: 1,
            prefetch_count: 100,
            send_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens consuming subscriptions on room queues.
#[async_trait]
pub trait DeliverySource: Send + Sync + 'static {
    type Subscription: Subscription;

    async fn subscribe(&self, room_id: &str, worker: usize) -> Result<Self::Subscription, BrokerError>;
}

/// One worker's live consumer on a room queue
#[async_trait]
pub trait Subscription: Send + 'static {
    type Delivery: Delivery + 'static;

    /// `None` once the broker has ended the stream.
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery, BrokerError>>;

    /// Close the underlying channel after the stream failed or ended.
    async fn discard(&mut self);
}

/// Runs `consumers_per_room` workers for every configured room. Each worker
/// holds one subscription for as long as it consumes, and opens a new one
/// after `restart_delay` when the stream fails.
pub struct FanoutConsumer<S: DeliverySource> {
    config: FanoutConfig,
    source: Arc<S>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn WriteSink>,
    counters: Arc<FanoutCounters>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: DeliverySource> FanoutConsumer<S> {
    pub fn new(config: FanoutConfig, source: Arc<S>, registry: Arc<SessionRegistry>, sink: Arc<dyn WriteSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            source,
            registry,
            sink,
            counters: Arc::new(FanoutCounters::default()),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for room in &self.config.rooms {
            let processor = FanoutProcessor::new(
                room.clone(),
                self.registry.clone(),
                self.sink.clone(),
                self.config.send_timeout,
                self.counters.clone(),
            );
            for index in 0..self.config.consumers_per_room {
                handles.push(tokio::spawn(run_worker(
                    processor.clone(),
                    index,
                    self.source.clone(),
                    self.config.restart_delay,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }
        info!(
            rooms = self.config.rooms.len(),
            consumers_per_room = self.config.consumers_per_room,
            "Fan-out consumers started"
        );
    }

    pub fn stats(&self) -> FanoutStats {
        self.counters.snapshot()
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        if tokio::time::timeout(self.config.shutdown_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Fan-out consumers did not stop in time");
        }
        info!(workers = count, "Fan-out consumers stopped");
    }
}

async fn run_worker<S: DeliverySource>(
    processor: FanoutProcessor,
    index: usize,
    source: Arc<S>,
    restart_delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        match consume(&processor, index, source.as_ref(), &mut shutdown).await {
            Ok(()) | Err(BrokerError::PoolClosed) => return,
            Err(e) => {
                processor.counters.restarts.fetch_add(1, Ordering::Relaxed);
                server_metrics::record_consumer_restart(processor.room_id());
                error!(room_id = %processor.room_id(), worker = index, error = %e, "Consumer failed, restarting");
            }
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

/// Consume until shutdown (`Ok`) or a broker failure (`Err`).
async fn consume<S: DeliverySource>(
    processor: &FanoutProcessor,
    index: usize,
    source: &S,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), BrokerError> {
    let mut subscription = source.subscribe(processor.room_id(), index).await?;

    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            next = subscription.next_delivery() => next,
        };
        match next {
            Some(Ok(delivery)) => {
                processor.process(&delivery).await;
            }
            Some(Err(e)) => {
                subscription.discard().await;
                return Err(e);
            }
            None => {
                subscription.discard().await;
                return Err(BrokerError::Channel("Consumer stream ended".to_string()));
            }
        }
    }
}

#[cfg(feature = "amqp")]
pub use self::amqp::{AmqpDelivery, AmqpRoomSource, AmqpSubscription};

#[cfg(feature = "amqp")]
mod amqp {
    use async_trait::async_trait;
    use futures::StreamExt;
    use lapin::{
        message::Delivery as LapinDelivery,
        options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
        types::FieldTable,
        Consumer,
    };
    use tracing::info;

    use cr_broker::{topology, AmqpChannelManager, BrokerError, ChannelPool, PooledChannel};

    use super::{Delivery, DeliverySource, FanoutConfig, Subscription};
    use crate::error::FanoutError;

    pub struct AmqpDelivery(pub LapinDelivery);

    #[async_trait]
    impl Delivery for AmqpDelivery {
        fn payload(&self) -> &[u8] {
            &self.0.data
        }

        async fn ack(&self) -> Result<(), FanoutError> {
            self.0
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| FanoutError::Acknowledge(e.to_string()))
        }

        async fn reject(&self) -> Result<(), FanoutError> {
            self.0
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
                .map(|_| ())
                .map_err(|e| FanoutError::Acknowledge(e.to_string()))
        }
    }

    /// Consumes `queue_<instance>_<room>` on channels borrowed from the consumer pool.
    pub struct AmqpRoomSource {
        pool: ChannelPool<AmqpChannelManager>,
        instance_id: String,
        prefetch_count: u16,
    }

    impl AmqpRoomSource {
        pub fn new(pool: ChannelPool<AmqpChannelManager>, config: &FanoutConfig) -> Self {
            Self {
                pool,
                instance_id: config.instance_id.clone(),
                prefetch_count: config.prefetch_count,
            }
        }
    }

    #[async_trait]
    impl DeliverySource for AmqpRoomSource {
        type Subscription = AmqpSubscription;

        async fn subscribe(&self, room_id: &str, worker: usize) -> Result<AmqpSubscription, BrokerError> {
            let channel = self.pool.borrow().await?;

            topology::declare_room_exchange(&channel, room_id).await?;
            let queue = topology::declare_room_queue(&channel, &self.instance_id, room_id).await?;

            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to set QoS: {}", e)))?;

            let tag = format!("{}-{}-{}", self.instance_id, room_id, worker);
            let consumer = channel
                .basic_consume(&queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to start consumer: {}", e)))?;

            info!(room_id, queue = %queue, worker, "Consuming room queue");
            Ok(AmqpSubscription {
                channel: Some(channel),
                consumer,
            })
        }
    }

    pub struct AmqpSubscription {
        channel: Option<PooledChannel<AmqpChannelManager>>,
        consumer: Consumer,
    }

    #[async_trait]
    impl Subscription for AmqpSubscription {
        type Delivery = AmqpDelivery;

        async fn next_delivery(&mut self) -> Option<Result<AmqpDelivery, BrokerError>> {
            self.consumer.next().await.map(|next| {
                next.map(AmqpDelivery)
                    .map_err(|e| BrokerError::Channel(format!("Consumer stream error: {}", e)))
            })
        }

        async fn discard(&mut self) {
            if let Some(channel) = self.channel.take() {
                channel.discard().await;
            }
        }
    }
}
