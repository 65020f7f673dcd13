use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::time::MissedTickBehavior;

use stockflow_events::{EventBus, EventEnvelope, InMemoryEventBus, InMemoryQueue};
use stockflow_infra::{
    config::ReconcilerConfig,
    ledger_store::{InMemoryLedgerStore, StockLedgerStore},
    notifications::NotificationPublisher,
    reconciler::ReconciliationEngine,
    workers::{ReconciliationWorker, WorkerConfig, WorkerHandle},
};
use stockflow_inventory::StockNotification;

#[cfg(feature = "redis")]
use stockflow_infra::{
    event_bus::{RedisStreamsSettings, RedisStreamsTransport},
    ledger_store::PostgresLedgerStore,
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

type Envelope = EventEnvelope<JsonValue>;

type InMemoryEngine = ReconciliationEngine<Arc<InMemoryLedgerStore>, Arc<InMemoryEventBus<Envelope>>>;

#[cfg(feature = "redis")]
type PersistentEngine = ReconciliationEngine<Arc<PostgresLedgerStore>, Arc<RedisStreamsTransport>>;

pub enum ReconcilerServices {
    /// Local queue and bus; nothing outside the process feeds the queue.
    InMemory {
        queue: Arc<InMemoryQueue<Envelope>>,
        bus: Arc<InMemoryEventBus<Envelope>>,
        engine: Arc<InMemoryEngine>,
    },
    #[cfg(feature = "redis")]
    Persistent {
        transport: Arc<RedisStreamsTransport>,
        engine: Arc<PersistentEngine>,
    },
}

impl ReconcilerServices {
    pub fn mode(&self) -> &'static str {
        match self {
            ReconcilerServices::InMemory { .. } => "in-memory",
            #[cfg(feature = "redis")]
            ReconcilerServices::Persistent { .. } => "persistent",
        }
    }

    /// Spawn the worker that feeds inbound deliveries to the engine.
    pub fn start(&self, config: WorkerConfig) -> io::Result<WorkerHandle> {
        match self {
            ReconcilerServices::InMemory { queue, bus, engine } => {
                spawn_notification_log(bus.as_ref())?;
                let engine = Arc::clone(engine);
                ReconciliationWorker::spawn(
                    config,
                    Arc::clone(queue),
                    Arc::new(move |env: &Envelope| engine.handle_envelope(env).map(|_| ())),
                )
            }
            #[cfg(feature = "redis")]
            ReconcilerServices::Persistent { transport, engine } => {
                let engine = Arc::clone(engine);
                ReconciliationWorker::spawn(
                    config,
                    Arc::clone(transport),
                    Arc::new(move |env: &Envelope| engine.handle_envelope(env).map(|_| ())),
                )
            }
        }
    }

    /// Drop idempotency markers recorded more than `retention` ago.
    ///
    /// Blocks on the ledger; call it off the async runtime.
    pub fn prune_markers(&self, retention: Duration) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).context("marker retention out of range")?;
        let removed = match self {
            ReconcilerServices::InMemory { engine, .. } => engine.store().prune_markers(cutoff)?,
            #[cfg(feature = "redis")]
            ReconcilerServices::Persistent { engine, .. } => engine.store().prune_markers(cutoff)?,
        };
        Ok(removed)
    }
}

/// Prune markers every `interval` until the task is aborted.
pub async fn prune_markers_periodically(services: Arc<ReconcilerServices>, retention: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let services = Arc::clone(&services);
        match tokio::task::spawn_blocking(move || services.prune_markers(retention)).await {
            Ok(Ok(removed)) => tracing::info!(removed, "pruned idempotency markers"),
            Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), "marker pruning failed"),
            Err(e) => tracing::error!(error = %e, "marker pruning task panicked"),
        }
    }
}

pub async fn build_services(config: &ReconcilerConfig) -> anyhow::Result<ReconcilerServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }

        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    Ok(build_in_memory_services(config))
}

fn build_in_memory_services(config: &ReconcilerConfig) -> ReconcilerServices {
    let queue = Arc::new(InMemoryQueue::new("inbound"));
    let bus = Arc::new(InMemoryEventBus::new());
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(InMemoryLedgerStore::new()),
        NotificationPublisher::new(Arc::clone(&bus), config.publish_retry.clone()),
    ));

    ReconcilerServices::InMemory { queue, bus, engine }
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &ReconcilerConfig) -> anyhow::Result<ReconcilerServices> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresLedgerStore::new(pool, tokio::runtime::Handle::current(), config.store_timeout);
    store.ensure_schema().await.context("failed to apply ledger schema")?;

    let settings = RedisStreamsSettings {
        stream_prefix: config.stream_prefix.clone(),
        consumer_group: config.consumer_group.clone(),
        consumer_name: config.consumer_name.clone(),
        pending_idle: config.pending_idle,
        io_timeout: config.publish_timeout,
        ..RedisStreamsSettings::default()
    };
    let transport = Arc::new(
        RedisStreamsTransport::new(&config.redis_url, settings).context("failed to create Redis Streams transport")?,
    );

    let groups = Arc::clone(&transport);
    tokio::task::spawn_blocking(move || groups.ensure_consumer_groups())
        .await
        .context("consumer group setup panicked")?
        .context("failed to create consumer groups")?;

    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(store),
        NotificationPublisher::new(Arc::clone(&transport), config.publish_retry.clone()),
    ));

    Ok(ReconcilerServices::Persistent { transport, engine })
}

/// Log every notification the in-memory bus carries.
fn spawn_notification_log(bus: &InMemoryEventBus<Envelope>) -> io::Result<()> {
    let subscription = bus.subscribe();

    thread::Builder::new()
        .name("notification-log".to_string())
        .spawn(move || {
            while let Ok(envelope) = subscription.recv() {
                match StockNotification::from_envelope(&envelope) {
                    Ok(Some(notification)) => tracing::info!(
                        topic = envelope.topic(),
                        product_id = %notification.product_id(),
                        "notification published"
                    ),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(topic = envelope.topic(), error = %e, "unreadable notification"),
                }
            }
        })?;

    Ok(())
}
