use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use stockflow_events::{ConsumerQueue, Delivery, PartitionKeyed, Subscription};

use super::Retryable;
use crate::retry::RetryPolicy;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Number of shard threads
    pub shards: usize,
    /// Wait before nacking a retryable failure. Retryable failures are
    /// never dead-lettered; past `max_attempts` they are logged at error
    /// level and still redelivered.
    pub redelivery: RetryPolicy,
    /// How often the dispatcher checks for shutdown while idle
    pub tick: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "reconciler".to_string(),
            shards: 4,
            redelivery: RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(5)),
            tick: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_redelivery(mut self, redelivery: RetryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// ack/nack/dead-letter calls the transport rejected
    pub settle_errors: u64,
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    stopping: Arc<AtomicBool>,
    dispatcher: Option<thread::JoinHandle<()>>,
    shards: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Request graceful shutdown and wait for every thread to stop.
    ///
    /// The dispatcher stops taking deliveries; each shard finishes what it
    /// already holds (ledger write and publish included) before exiting.
    /// Returns the final counters.
    ///
    /// A shard waiting out a redelivery backoff cuts the wait short and
    /// nacks straight away.
    pub fn shutdown(mut self) -> WorkerStats {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        if let Some(j) = self.dispatcher.take() {
            let _ = j.join();
        }
        for j in self.shards.drain(..) {
            let _ = j.join();
        }
        self.stats()
    }
}

/// Sharded consumer for an at-least-once queue.
///
/// ```text
/// ConsumerQueue ─consume─▶ dispatcher ─hash(partition key)─▶ shard[i] ─▶ handler
///                                                                  │
///                                     ack / nack / dead_letter ◀───┘
/// ```
///
/// Deliveries with the same partition key always land on the same shard and
/// are handled in arrival order. Settlement:
///
/// - `Ok` → `ack`
/// - retryable error → wait `redelivery.delay_for_attempt(attempt)`, then `nack`
/// - non-retryable error → `dead_letter` with the error as the reason
#[derive(Debug)]
pub struct ReconciliationWorker;

impl ReconciliationWorker {
    pub fn spawn<M, Q, H, E>(config: WorkerConfig, queue: Arc<Q>, handler: Arc<H>) -> io::Result<WorkerHandle>
    where
        M: PartitionKeyed + Send + 'static,
        Q: ConsumerQueue<M> + 'static,
        H: Fn(&M) -> Result<(), E> + Send + Sync + 'static,
        E: Retryable + Display,
    {
        let shard_count = config.shards.max(1);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stopping = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let mut shard_txs = Vec::with_capacity(shard_count);
        let mut shards = Vec::with_capacity(shard_count);
        for idx in 0..shard_count {
            let (tx, rx) = mpsc::channel::<Delivery<M>>();
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&stats);
            let stopping = Arc::clone(&stopping);
            let shard = Shard {
                name: config.name.clone(),
                redelivery: config.redelivery.clone(),
                tick: config.tick,
            };

            let join = thread::Builder::new()
                .name(format!("{}-shard-{idx}", config.name))
                .spawn(move || {
                    while let Ok(delivery) = rx.recv() {
                        shard.settle(&*queue, &*handler, delivery, &stats, &stopping);
                    }
                    debug!(worker = %shard.name, shard = idx, "shard stopped");
                })?;

            shard_txs.push(tx);
            shards.push(join);
        }

        let sub: Subscription<Delivery<M>> = queue.consume();
        let name = config.name.clone();
        let tick = config.tick;
        let dispatcher = thread::Builder::new()
            .name(format!("{}-dispatch", config.name))
            .spawn(move || dispatch_loop(&name, sub, shutdown_rx, shard_txs, tick))?;

        info!(worker = %config.name, shards = shard_count, "reconciliation worker started");

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            stopping,
            dispatcher: Some(dispatcher),
            shards,
            stats,
        })
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn dispatch_loop<M: PartitionKeyed>(
    name: &str,
    sub: Subscription<Delivery<M>>,
    shutdown_rx: mpsc::Receiver<()>,
    shard_txs: Vec<mpsc::Sender<Delivery<M>>>,
    tick: Duration,
) {
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(delivery) => {
                let shard = shard_for(delivery.partition_key(), shard_txs.len());
                if shard_txs[shard].send(delivery).is_err() {
                    error!(worker = name, shard, "shard thread gone; stopping dispatcher");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Dropping the senders lets each shard drain and exit.
    info!(worker = name, "dispatcher stopped");
}

/// Per-shard settlement settings.
struct Shard {
    name: String,
    redelivery: RetryPolicy,
    tick: Duration,
}

impl Shard {
    fn settle<M, Q, H, E>(
        &self,
        queue: &Q,
        handler: &H,
        delivery: Delivery<M>,
        stats: &Mutex<WorkerStats>,
        stopping: &AtomicBool,
    ) where
        Q: ConsumerQueue<M>,
        H: Fn(&M) -> Result<(), E>,
        E: Retryable + Display,
    {
        let name = self.name.as_str();
        let bump = |f: fn(&mut WorkerStats)| {
            if let Ok(mut s) = stats.lock() {
                f(&mut s);
            }
        };
        bump(|s| s.received += 1);

        let tag = delivery.tag().clone();
        let settled = match handler(delivery.message()) {
            Ok(()) => queue.ack(&tag).map(|()| bump(|s| s.acked += 1)),
            Err(err) if err.is_retryable() => {
                let attempt = tag.attempt();
                let delay = self.redelivery.delay_for_attempt(attempt);
                if self.redelivery.should_retry(attempt) {
                    warn!(
                        worker = name,
                        message_id = tag.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed; message will be redelivered"
                    );
                } else {
                    error!(
                        worker = name,
                        message_id = tag.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler still failing; message will be redelivered"
                    );
                }
                self.back_off(delay, stopping);
                queue.nack(&tag).map(|()| bump(|s| s.redelivered += 1))
            }
            Err(err) => {
                let reason = err.to_string();
                error!(
                    worker = name,
                    message_id = tag.id(),
                    attempt = tag.attempt(),
                    error = %reason,
                    "handler failed permanently; dead-lettering"
                );
                queue
                    .dead_letter(delivery, &reason)
                    .map(|()| bump(|s| s.dead_lettered += 1))
            }
        };

        if let Err(err) = settled {
            error!(worker = name, message_id = tag.id(), error = ?err, "failed to settle delivery");
            bump(|s| s.settle_errors += 1);
        }
    }

    /// Sleep for `delay` in `tick` slices, returning early on shutdown.
    fn back_off(&self, delay: Duration, stopping: &AtomicBool) {
        let deadline = Instant::now() + delay;
        let slice = self.tick.max(Duration::from_millis(1));
        loop {
            if stopping.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use stockflow_events::InMemoryQueue;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        key: String,
        n: u32,
    }

    impl PartitionKeyed for Msg {
        fn partition_key(&self) -> &str {
            &self.key
        }
    }

    #[derive(Debug)]
    struct Failure {
        retryable: bool,
    }

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failure (retryable: {})", self.retryable)
        }
    }

    impl Retryable for Failure {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn msg(key: &str, n: u32) -> Msg {
        Msg {
            key: key.to_string(),
            n,
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for worker");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn config(shards: usize) -> WorkerConfig {
        WorkerConfig {
            tick: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
        .with_name("test-worker")
        .with_shards(shards)
        .with_redelivery(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    #[test]
    fn same_key_always_maps_to_same_shard() {
        for shards in 1..8 {
            assert_eq!(shard_for("product-a", shards), shard_for("product-a", shards));
            assert!(shard_for("product-a", shards) < shards);
        }
    }

    #[test]
    fn successful_deliveries_are_acked() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Arc::new(move |m: &Msg| -> Result<(), Failure> {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        });

        let handle = ReconciliationWorker::spawn(config(4), Arc::clone(&queue), handler).unwrap();
        for n in 0..20 {
            queue.enqueue(msg(&format!("k{}", n % 5), n)).unwrap();
        }

        wait_until(|| handle.stats().acked == 20);
        handle.shutdown();

        assert_eq!(queue.outstanding(), 0);
        assert_eq!(seen.lock().unwrap().len(), 20);
    }

    #[test]
    fn per_key_order_is_preserved() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Arc::new(move |m: &Msg| -> Result<(), Failure> {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        });

        let handle = ReconciliationWorker::spawn(config(3), Arc::clone(&queue), handler).unwrap();
        for n in 0..30 {
            queue.enqueue(msg(if n % 2 == 0 { "even" } else { "odd" }, n)).unwrap();
        }
        wait_until(|| handle.stats().acked == 30);
        handle.shutdown();

        let seen = seen.lock().unwrap();
        for key in ["even", "odd"] {
            let ns: Vec<u32> = seen.iter().filter(|m| m.key == key).map(|m| m.n).collect();
            let mut sorted = ns.clone();
            sorted.sort();
            assert_eq!(ns, sorted, "order broken for {key}");
        }
    }

    #[test]
    fn retryable_failure_is_nacked_then_succeeds() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = Arc::new(move |_: &Msg| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Failure { retryable: true })
            } else {
                Ok(())
            }
        });

        let handle = ReconciliationWorker::spawn(config(1), Arc::clone(&queue), handler).unwrap();
        queue.enqueue(msg("k", 1)).unwrap();

        wait_until(|| handle.stats().acked == 1);
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.received, 2);
        assert_eq!(queue.redelivered_count(), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[test]
    fn non_retryable_failure_is_dead_lettered_immediately() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let handler = Arc::new(|_: &Msg| -> Result<(), Failure> { Err(Failure { retryable: false }) });

        let handle = ReconciliationWorker::spawn(config(2), Arc::clone(&queue), handler).unwrap();
        queue.enqueue(msg("k", 1)).unwrap();

        wait_until(|| handle.stats().dead_lettered == 1);
        handle.shutdown();

        let parked = queue.dead_letters();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].delivery.tag().attempt(), 1);
        assert_eq!(parked[0].reason, "failure (retryable: false)");
    }

    #[test]
    fn retryable_failures_are_never_dead_lettered() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        // Fails well past the redelivery policy's attempt count.
        let handler = Arc::new(move |_: &Msg| {
            if counter.fetch_add(1, Ordering::SeqCst) < 10 {
                Err(Failure { retryable: true })
            } else {
                Ok(())
            }
        });

        let handle = ReconciliationWorker::spawn(config(1), Arc::clone(&queue), handler).unwrap();
        queue.enqueue(msg("k", 1)).unwrap();

        wait_until(|| handle.stats().acked == 1);
        let stats = handle.shutdown();

        assert_eq!(stats.received, 11);
        assert_eq!(stats.redelivered, 10);
        assert_eq!(stats.dead_lettered, 0);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn redelivery_waits_out_the_backoff() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = Arc::new(move |_: &Msg| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(Failure { retryable: true })
            } else {
                Ok(())
            }
        });

        let worker = config(1).with_redelivery(RetryPolicy::fixed(10, Duration::from_millis(30)));
        let started = Instant::now();
        let handle = ReconciliationWorker::spawn(worker, Arc::clone(&queue), handler).unwrap();
        queue.enqueue(msg("k", 1)).unwrap();

        wait_until(|| handle.stats().acked == 1);
        let elapsed = started.elapsed();
        handle.shutdown();

        assert!(elapsed >= Duration::from_millis(90), "three backoffs took only {elapsed:?}");
    }

    #[test]
    fn shutdown_cuts_backoff_short() {
        let queue = Arc::new(InMemoryQueue::new("test"));
        let handler = Arc::new(|_: &Msg| -> Result<(), Failure> { Err(Failure { retryable: true }) });

        let worker = config(1).with_redelivery(RetryPolicy::fixed(10, Duration::from_secs(30)));
        let handle = ReconciliationWorker::spawn(worker, Arc::clone(&queue), handler).unwrap();
        queue.enqueue(msg("k", 1)).unwrap();
        wait_until(|| handle.stats().received == 1);

        let started = Instant::now();
        let stats = handle.shutdown();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stats.redelivered >= 1);
        assert_eq!(stats.dead_lettered, 0);
    }
}
