//! ChatRelay server
//!
//! Accepts room WebSocket connections, acknowledges and publishes valid
//! messages to per-room fan-out exchanges, consumes this instance's room
//! queues to rebroadcast to connected subscribers, and persists every
//! delivered message through the durable writer.
//!
//! Configuration comes from a TOML file (`--config`, `CHATRELAY_CONFIG` or the
//! standard search paths) with `CHATRELAY_*` environment overrides.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use cr_broker::{
    topology, AmqpChannelManager, AmqpPublisher, ChannelPool, CircuitBreaker, CircuitBreakerConfig,
    GuardedPublisher, MessagePublisher, PoolConfig,
};
use cr_config::{AppConfig, ConfigLoader};
use cr_server::{
    connect_store, router, AmqpRoomSource, AppState, DurableWriter, FanoutConfig, FanoutConsumer, IngressConfig,
    IngressHandler, SessionRegistry, WriterConfig,
};

/// Per-connection outbound wait for acks and broadcasts
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long open room connections get to close on shutdown
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "chatrelay-server", about = "ChatRelay WebSocket relay server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_example_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    cr_common::logging::init_logging("chatrelay-server");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    info!(
        instance_id = %config.server.instance_id,
        rooms = config.broker.rooms.len(),
        "Starting ChatRelay server"
    );

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // 1. Broker pools, one connection each
    let producer_pool = ChannelPool::new(
        AmqpChannelManager::connect(&config.broker.uri, "chatrelay-producer", true).await?,
        PoolConfig {
            name: "producer".to_string(),
            size: config.broker.producer_pool_size,
            borrow_timeout: config.broker.borrow_timeout(),
        },
    )
    .await?;
    let consumer_pool = ChannelPool::new(
        AmqpChannelManager::connect(&config.broker.uri, "chatrelay-consumer", false).await?,
        PoolConfig {
            name: "consumer".to_string(),
            size: config.broker.consumer_pool_size,
            borrow_timeout: config.broker.borrow_timeout(),
        },
    )
    .await?;

    topology::declare_exchanges(&producer_pool, &config.broker.rooms).await?;

    // 2. Publish path, optionally behind the circuit breaker
    let amqp_publisher = AmqpPublisher::new(producer_pool.clone());
    let (publisher, breaker): (Arc<dyn MessagePublisher>, Option<Arc<CircuitBreaker>>) = if config.breaker.enabled {
        let breaker = Arc::new(CircuitBreaker::new(
            "broker-publish",
            CircuitBreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                cooldown: Duration::from_millis(config.breaker.cooldown_ms),
                half_open_success_threshold: config.breaker.half_open_success_threshold,
            },
        ));
        info!(
            failure_threshold = config.breaker.failure_threshold,
            cooldown_ms = config.breaker.cooldown_ms,
            "Circuit breaker enabled for broker publish"
        );
        let guarded: Arc<dyn MessagePublisher> = Arc::new(GuardedPublisher::new(amqp_publisher, breaker.clone()));
        (guarded, Some(breaker))
    } else {
        let plain: Arc<dyn MessagePublisher> = Arc::new(amqp_publisher);
        (plain, None)
    };

    // 3. Store and durable writer
    let store = connect_store(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    if config.database.init_schema {
        store.init_schema().await?;
    }
    let writer = DurableWriter::start(store, writer_config(&config));

    // 4. Sessions, ingress and fan-out
    let registry = Arc::new(SessionRegistry::new());
    let ingress = Arc::new(IngressHandler::new(
        IngressConfig {
            server_id: config.server.instance_id.clone(),
            send_timeout: SEND_TIMEOUT,
        },
        registry.clone(),
        publisher,
    ));

    let fanout_config = FanoutConfig {
        instance_id: config.server.instance_id.clone(),
        rooms: config.broker.rooms.clone(),
        consumers_per_room: config.broker.consumers_per_room,
        prefetch_count: config.broker.prefetch_count,
        send_timeout: SEND_TIMEOUT,
        ..Default::default()
    };
    let fanout = FanoutConsumer::new(
        fanout_config.clone(),
        Arc::new(AmqpRoomSource::new(consumer_pool.clone(), &fanout_config)),
        registry.clone(),
        writer.clone(),
    );
    fanout.start();

    // 5. HTTP / WebSocket surface
    let state = AppState {
        ingress: ingress.clone(),
        registry: registry.clone(),
        writer: writer.clone(),
        breaker,
        session_buffer: config.server.session_buffer,
    };
    let app = router(state, &config.server.path_prefix)
        .merge(metrics_router(metrics_handle))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, path_prefix = %config.server.path_prefix, "Listening for room connections");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server failed");
    }
    info!("Shutdown signal received, closing room connections...");

    // Upgraded WebSocket connections are not tracked by the HTTP server
    let closed = registry.close_all();
    let drained = ingress.wait_drained(CONNECTION_DRAIN_TIMEOUT).await;
    info!(sessions = closed, drained, "Room connections closed");

    fanout.stop().await;
    writer.shutdown().await;

    if config.broker.delete_exchanges_on_shutdown {
        topology::delete_exchanges(&producer_pool, &config.broker.rooms).await;
    }
    producer_pool.close().await;
    consumer_pool.close().await;

    info!("ChatRelay server shutdown complete");
    Ok(())
}

fn writer_config(config: &AppConfig) -> WriterConfig {
    let writer = &config.writer;
    WriterConfig {
        workers: writer.threads,
        batch_size: writer.batch_size,
        flush_interval: Duration::from_millis(writer.flush_interval_ms),
        buffer_size: writer.buffer_size,
        enqueue_timeout: Duration::from_millis(writer.enqueue_timeout_ms),
        idle_poll: Duration::from_millis(writer.idle_poll_ms),
        shutdown_grace: Duration::from_secs(writer.shutdown_grace_secs),
    }
}

fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
