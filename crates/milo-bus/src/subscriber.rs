// Subscriber side of the bus: one receive loop, a pool of compute workers.
//
// The receive loop must stay near empty or the transport's receive queue
// backs up and cascades into sender-side drops, so user handlers never run
// on the I/O thread. Each received message becomes a task on the worker
// pool, which records metrics and invokes the handler.
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::BusConfig;
use crate::message::Message;
use crate::metrics::{Metrics, Stats};
use crate::pool::WorkerPool;
use crate::{MessageHandler, Result, stamp};

const IDLE_SLEEP: Duration = Duration::from_micros(10);

struct SubscriberState {
    io_thread: thread::JoinHandle<()>,
    pool: WorkerPool,
    started_at: Instant,
}

/// Topic-filtered subscriber: connects to a publisher, subscribes to a fixed
/// set of topic prefixes, and dispatches each message to a worker pool that
/// feeds the [`Metrics`] collector and the user handler.
///
/// Created stopped; `start`/`stop` are idempotent and `stop` also runs on
/// drop. A stopped bus can be started again with fresh sockets and workers.
pub struct SubscriberBus {
    config: BusConfig,
    topics: Vec<Bytes>,
    handler: MessageHandler,
    context: zmq::Context,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<SubscriberState>>,
}

impl SubscriberBus {
    /// The empty prefix subscribes to every topic.
    pub fn new<I, T>(config: BusConfig, topics: I, handler: MessageHandler) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let context = zmq::Context::new();
        if let Err(err) = context.set_io_threads(config.io_threads) {
            tracing::warn!(error = %err, "set_io_threads failed; transport default applies");
        }
        let metrics = Arc::new(Metrics::new(config.metrics_period));
        Self {
            config,
            topics: topics.into_iter().map(Into::into).collect(),
            handler,
            context,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Connect the SUB socket, register every topic prefix, and spawn the
    /// I/O thread and worker pool. No-op while running; connect failures
    /// leave the bus stopped.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock");
        if state.is_some() {
            return Ok(());
        }

        let socket = self.context.socket(zmq::SUB)?;
        socket.set_rcvhwm(self.config.hwm)?;
        socket.set_linger(0)?;
        socket.connect(&self.config.sub_connect_addr)?;
        for topic in &self.topics {
            socket.set_subscribe(topic)?;
        }

        let pool = WorkerPool::new(self.config.effective_workers());
        let Some(tasks) = pool.task_sender() else {
            unreachable!("freshly built pool has an open queue");
        };

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let metrics = Arc::clone(&self.metrics);
        let handler = Arc::clone(&self.handler);
        let io_thread = thread::Builder::new()
            .name("milo-sub-io".to_string())
            .spawn(move || io_loop(socket, tasks, metrics, handler, running))
            .map_err(|err| {
                self.running.store(false, Ordering::Relaxed);
                err
            })?;

        *state = Some(SubscriberState {
            io_thread,
            pool,
            started_at: Instant::now(),
        });
        tracing::info!(
            connect = %self.config.sub_connect_addr,
            topics = self.topics.len(),
            workers = self.config.effective_workers(),
            "subscriber bus started"
        );
        Ok(())
    }

    /// Stop in dependency order: clear `running`, join the I/O thread (its
    /// SUB socket drops with it), then stop and join the worker pool so
    /// pending handler work drains. No-op when already stopped.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("state lock");
        let Some(SubscriberState {
            io_thread,
            mut pool,
            started_at,
        }) = state.take()
        else {
            return;
        };
        self.running.store(false, Ordering::Relaxed);
        if io_thread.join().is_err() {
            tracing::error!("subscriber i/o thread exited via panic");
        }
        pool.stop();
        pool.join();
        tracing::info!(
            uptime_ms = started_at.elapsed().as_millis() as u64,
            "subscriber bus stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Snapshot of the latency/throughput counters. Valid on a stopped bus.
    pub fn metrics(&self) -> Stats {
        self.metrics.stats()
    }
}

impl Drop for SubscriberBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn io_loop(
    socket: zmq::Socket,
    tasks: crossbeam::channel::Sender<Box<dyn FnOnce() + Send + 'static>>,
    metrics: Arc<Metrics>,
    handler: MessageHandler,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => {
                let Some(message) = Message::from_frames(frames) else {
                    tracing::debug!("short multipart on sub socket; dropped");
                    continue;
                };
                metrics::counter!("milo_sub_received_total").increment(1);
                let task_metrics = Arc::clone(&metrics);
                let task_handler = Arc::clone(&handler);
                let task = move || process(&task_metrics, task_handler.as_ref(), &message);
                if tasks.send(Box::new(task)).is_err() {
                    metrics.record_dropped();
                    tracing::warn!("worker pool unavailable; message dropped");
                }
                let depth = tasks.len();
                metrics.update_queue_depth(depth);
                metrics::gauge!("milo_sub_queue_depth").set(depth as f64);
            }
            Err(zmq::Error::EAGAIN) => thread::sleep(IDLE_SLEEP),
            Err(err) => {
                tracing::warn!(error = %err, "sub receive failed");
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

// Runs on a worker thread. Panics out of the handler are contained and
// logged by the pool.
fn process(metrics: &Metrics, handler: &(dyn Fn(&Message) + Send + Sync), message: &Message) {
    metrics.record_processed();
    if let Some(sent) = stamp::read_stamp(&message.payload) {
        // Negative deltas mean the stamp came from a foreign clock domain.
        if let Some(latency) = stamp::elapsed_since(sent) {
            metrics.record_latency(latency);
        }
    }
    handler(message);
}
