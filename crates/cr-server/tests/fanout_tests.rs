//! Fan-out consumer worker loop against a scripted delivery source
//!
//! - Restart after the stream ends or errors, with the channel discarded
//! - Retry after a failed subscribe
//! - Prompt stop while idle
//! - Broker order preserved into the session and the write sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use cr_broker::BrokerError;
use cr_common::{ChatMessage, MessageType};
use cr_server::{
    Delivery, DeliverySource, FanoutConfig, FanoutConsumer, FanoutError, Outbound, SessionHandle, SessionRegistry,
    Subscription, WriteSink,
};

struct ScriptedDelivery {
    payload: Vec<u8>,
}

#[async_trait]
impl Delivery for ScriptedDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), FanoutError> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), FanoutError> {
        Ok(())
    }
}

/// What one subscribe call yields
enum Script {
    /// Deliver these, then end the stream
    Ends(Vec<String>),
    /// Deliver these, then fail the stream
    Fails(Vec<String>),
    /// Deliver these, then wait forever
    Idles(Vec<String>),
    Refused(BrokerError),
}

#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    subscribes: AtomicUsize,
    discards: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }
}

struct ScriptedSubscription {
    pending: VecDeque<String>,
    tail: Option<BrokerError>,
    idle: bool,
    discards: Arc<AtomicUsize>,
}

#[async_trait]
impl DeliverySource for ScriptedSource {
    type Subscription = ScriptedSubscription;

    async fn subscribe(&self, _room_id: &str, _worker: usize) -> Result<ScriptedSubscription, BrokerError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Idles(Vec::new()));
        let (payloads, tail, idle) = match script {
            Script::Ends(p) => (p, None, false),
            Script::Fails(p) => (p, Some(BrokerError::Channel("connection reset".to_string())), false),
            Script::Idles(p) => (p, None, true),
            Script::Refused(e) => return Err(e),
        };
        Ok(ScriptedSubscription {
            pending: payloads.into(),
            tail,
            idle,
            discards: self.discards.clone(),
        })
    }
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    type Delivery = ScriptedDelivery;

    async fn next_delivery(&mut self) -> Option<Result<ScriptedDelivery, BrokerError>> {
        if let Some(raw) = self.pending.pop_front() {
            return Some(Ok(ScriptedDelivery {
                payload: raw.into_bytes(),
            }));
        }
        if self.idle {
            std::future::pending::<()>().await;
        }
        self.tail.take().map(Err)
    }

    async fn discard(&mut self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<String>>,
}

#[async_trait]
impl WriteSink for RecordingSink {
    async fn enqueue(&self, raw: String) -> bool {
        self.received.lock().push(raw);
        true
    }
}

fn config() -> FanoutConfig {
    FanoutConfig {
        rooms: vec!["room3".to_string()],
        consumers_per_room: 1,
        send_timeout: Duration::from_millis(100),
        restart_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn payloads(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            ChatMessage::new("11", "dora", &format!("m{}", i), "room3", MessageType::Text)
                .to_json()
                .unwrap()
        })
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_stream_end_discards_and_resubscribes() {
    let first = payloads(2);
    let second = payloads(1);
    let source = Arc::new(ScriptedSource::new(vec![
        Script::Ends(first.clone()),
        Script::Idles(second.clone()),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let consumer = FanoutConsumer::new(config(), source.clone(), Arc::new(SessionRegistry::new()), sink.clone());

    consumer.start();
    wait_until(|| sink.received.lock().len() == 3).await;

    assert_eq!(*sink.received.lock(), [first, second].concat());
    assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(source.discards.load(Ordering::SeqCst), 1);
    let stats = consumer.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.processed, 3);

    consumer.stop().await;
}

#[tokio::test]
async fn test_stream_error_discards_and_resubscribes() {
    let source = Arc::new(ScriptedSource::new(vec![
        Script::Fails(payloads(1)),
        Script::Fails(Vec::new()),
        Script::Idles(Vec::new()),
    ]));
    let consumer = FanoutConsumer::new(
        config(),
        source.clone(),
        Arc::new(SessionRegistry::new()),
        Arc::new(RecordingSink::default()),
    );

    consumer.start();
    wait_until(|| source.subscribes.load(Ordering::SeqCst) == 3).await;

    assert_eq!(source.discards.load(Ordering::SeqCst), 2);
    assert_eq!(consumer.stats().restarts, 2);
    consumer.stop().await;
}

#[tokio::test]
async fn test_refused_subscribe_is_retried() {
    let source = Arc::new(ScriptedSource::new(vec![
        Script::Refused(BrokerError::Topology("queue declare failed".to_string())),
        Script::Idles(payloads(1)),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let consumer = FanoutConsumer::new(config(), source.clone(), Arc::new(SessionRegistry::new()), sink.clone());

    consumer.start();
    wait_until(|| sink.received.lock().len() == 1).await;

    assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(source.discards.load(Ordering::SeqCst), 0);
    assert_eq!(consumer.stats().restarts, 1);
    consumer.stop().await;
}

#[tokio::test]
async fn test_closed_pool_ends_worker() {
    let source = Arc::new(ScriptedSource::new(vec![Script::Refused(BrokerError::PoolClosed)]));
    let consumer = FanoutConsumer::new(
        config(),
        source.clone(),
        Arc::new(SessionRegistry::new()),
        Arc::new(RecordingSink::default()),
    );

    consumer.start();
    wait_until(|| source.subscribes.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.stats().restarts, 0);
    consumer.stop().await;
}

#[tokio::test]
async fn test_stop_interrupts_idle_workers() {
    let source = Arc::new(ScriptedSource::new(Vec::new()));
    let consumer = FanoutConsumer::new(
        FanoutConfig {
            rooms: vec!["room1".to_string(), "room2".to_string()],
            consumers_per_room: 2,
            ..config()
        },
        source.clone(),
        Arc::new(SessionRegistry::new()),
        Arc::new(RecordingSink::default()),
    );

    consumer.start();
    wait_until(|| source.subscribes.load(Ordering::SeqCst) == 4).await;

    tokio::time::timeout(Duration::from_millis(500), consumer.stop())
        .await
        .expect("idle workers did not stop");
    assert_eq!(source.discards.load(Ordering::SeqCst), 0);
    assert_eq!(consumer.stats().restarts, 0);
}

#[tokio::test]
async fn test_single_worker_keeps_broker_order() {
    let sent = payloads(20);
    let source = Arc::new(ScriptedSource::new(vec![Script::Idles(sent.clone())]));
    let registry = Arc::new(SessionRegistry::new());
    let (tx, mut rx) = mpsc::channel(64);
    registry.register(SessionHandle::new("room3", None, tx));
    let sink = Arc::new(RecordingSink::default());
    let consumer = FanoutConsumer::new(config(), source, registry, sink.clone());

    consumer.start();
    wait_until(|| sink.received.lock().len() == sent.len()).await;

    assert_eq!(*sink.received.lock(), sent);
    for raw in &sent {
        assert_eq!(rx.recv().await, Some(Outbound::Text(raw.clone())));
    }
    assert_eq!(consumer.stats().broadcasts, sent.len() as u64);
    consumer.stop().await;
}
