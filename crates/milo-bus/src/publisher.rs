// Publisher side of the bus: many producers, one egress socket.
//
// ZeroMQ sockets must stay on one thread, so the bus cannot hand a shared
// PUB socket to arbitrary producer threads, and serializing them on a mutex
// would put a lock on the hot path. Instead each producing thread owns a
// lazily created PUSH handle connected to an inproc ingress address; a
// single I/O thread owns the PULL end and the public PUB socket and bridges
// the two. The transport's internal queues merge the producer streams while
// preserving per-producer order.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::BusConfig;
use crate::message::Message;
use crate::{BusError, Result};

// Idle delay for the non-blocking I/O loop.
const IDLE_SLEEP: Duration = Duration::from_micros(10);

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // One slot per producing thread holding the PUSH handles it has opened,
    // at most one per live bus. Dropped with the thread.
    static PRODUCER_HANDLES: RefCell<Vec<ProducerHandle>> = const { RefCell::new(Vec::new()) };
}

struct ProducerHandle {
    bus_id: u64,
    generation: u64,
    socket: zmq::Socket,
}

/// Fan-in publisher: accepts `produce` from any thread and forwards every
/// message to subscribers over one PUB socket.
///
/// Created stopped; `start` binds the sockets and spawns the I/O thread,
/// `stop` (also run on drop) tears everything down. Both are idempotent.
pub struct PublisherBus {
    config: BusConfig,
    context: zmq::Context,
    bus_id: u64,
    // Bumped on stop so producer threads discard their stale PUSH handles.
    generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PublisherBus {
    pub fn new(config: BusConfig) -> Self {
        let context = zmq::Context::new();
        if let Err(err) = context.set_io_threads(config.io_threads) {
            tracing::warn!(error = %err, "set_io_threads failed; transport default applies");
        }
        Self {
            config,
            context,
            bus_id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            generation: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            io_thread: Mutex::new(None),
        }
    }

    /// Bind the ingress PULL and public PUB sockets, spawn the I/O thread,
    /// then sleep the configured warm-up so early subscribers do not miss
    /// the first publications (the slow-joiner problem). No-op while
    /// running; bind failures leave the bus stopped.
    pub fn start(&self) -> Result<()> {
        let mut io_thread = self.io_thread.lock().expect("io thread lock");
        if io_thread.is_some() {
            return Ok(());
        }

        let pull = self.context.socket(zmq::PULL)?;
        let egress = self.context.socket(zmq::PUB)?;
        pull.set_rcvhwm(self.config.hwm)?;
        egress.set_sndhwm(self.config.hwm)?;
        // Undelivered frames must not pin the context at teardown.
        pull.set_linger(0)?;
        egress.set_linger(0)?;
        pull.bind(&self.config.inproc_ingress)?;
        egress.bind(&self.config.pub_bind_addr)?;

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("milo-pub-io".to_string())
            .spawn(move || io_loop(pull, egress, running))
            .map_err(|err| {
                self.running.store(false, Ordering::Relaxed);
                BusError::Spawn(err)
            })?;
        *io_thread = Some(handle);

        tracing::info!(
            pub_bind = %self.config.pub_bind_addr,
            ingress = %self.config.inproc_ingress,
            "publisher bus started"
        );
        thread::sleep(self.config.warmup);
        Ok(())
    }

    /// Stop the I/O thread and invalidate every producer handle. No-op when
    /// already stopped; also run on drop.
    pub fn stop(&self) {
        let mut io_thread = self.io_thread.lock().expect("io thread lock");
        let Some(handle) = io_thread.take() else {
            return;
        };
        self.running.store(false, Ordering::Relaxed);
        if handle.join().is_err() {
            tracing::error!("publisher i/o thread exited via panic");
        }
        // Producer threads drop their PUSH handles on their next produce;
        // TLS destructors cover threads that never produce again.
        self.generation.fetch_add(1, Ordering::Relaxed);
        tracing::info!("publisher bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Publish one message. The calling thread's PUSH handle is created and
    /// connected on first use. Delivery is best-effort under the transport's
    /// high-water-mark policy: transport errors are logged and the message
    /// dropped, never panicking the producer.
    pub fn produce(&self, message: Message) {
        if !self.running.load(Ordering::Relaxed) {
            tracing::warn!("produce on a stopped publisher bus; message dropped");
            return;
        }
        let result = self.with_producer_socket(|socket| {
            socket.send_multipart([&message.topic[..], &message.payload[..]], 0)
        });
        match result {
            Ok(()) => metrics::counter!("milo_pub_produced_total").increment(1),
            Err(err) => {
                metrics::counter!("milo_pub_send_errors_total").increment(1);
                tracing::warn!(error = %err, "produce failed; message dropped");
            }
        }
    }

    // Run `send` against this thread's PUSH handle for this bus, creating
    // the handle if the thread has none or its generation is stale.
    fn with_producer_socket<F>(&self, send: F) -> Result<()>
    where
        F: FnOnce(&zmq::Socket) -> std::result::Result<(), zmq::Error>,
    {
        let generation = self.generation.load(Ordering::Relaxed);
        PRODUCER_HANDLES.with(|handles| {
            let mut handles = handles.borrow_mut();
            // Stale entries belong to stopped incarnations of this bus.
            handles.retain(|handle| handle.bus_id != self.bus_id || handle.generation == generation);
            let position = match handles.iter().position(|handle| handle.bus_id == self.bus_id) {
                Some(position) => position,
                None => {
                    let socket = self.connect_producer_socket()?;
                    handles.push(ProducerHandle {
                        bus_id: self.bus_id,
                        generation,
                        socket,
                    });
                    handles.len() - 1
                }
            };
            send(&handles[position].socket)?;
            Ok(())
        })
    }

    fn connect_producer_socket(&self) -> Result<zmq::Socket> {
        let socket = self.context.socket(zmq::PUSH)?;
        socket.set_sndhwm(self.config.hwm)?;
        socket.set_linger(0)?;
        socket.connect(&self.config.inproc_ingress)?;
        tracing::debug!(
            thread = ?thread::current().id(),
            "producer push handle connected"
        );
        Ok(socket)
    }
}

impl Drop for PublisherBus {
    fn drop(&mut self) {
        self.stop();
    }
}

// Bridge loop owned by the I/O thread: drain the ingress PULL and forward
// topic + payload to the PUB socket as one multipart.
fn io_loop(pull: zmq::Socket, egress: zmq::Socket, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match pull.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) if frames.len() >= 2 => {
                if let Err(err) = egress.send_multipart([&frames[0][..], &frames[1][..]], 0) {
                    metrics::counter!("milo_pub_send_errors_total").increment(1);
                    tracing::warn!(error = %err, "egress send failed; message dropped");
                } else {
                    metrics::counter!("milo_pub_forwarded_total").increment(1);
                }
            }
            Ok(frames) => {
                tracing::debug!(frames = frames.len(), "short multipart on ingress; dropped");
            }
            Err(zmq::Error::EAGAIN) => thread::sleep(IDLE_SLEEP),
            Err(err) => {
                tracing::warn!(error = %err, "ingress receive failed");
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
}
