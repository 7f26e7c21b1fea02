use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use crate::config::EventBusConfig;
use super::{Event, EventKind};

type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

// In-process publish-subscribe with one bounded queue. Constructed once and
// passed by handle; there is no process-wide singleton.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

struct Shared {
    tx: mpsc::Sender<Arc<Event>>,
    handlers: RwLock<Handlers>,
    replay: Mutex<VecDeque<Arc<Event>>>,
    replay_size: usize,
    dropped: AtomicU64,
    processed: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<EventKind, Vec<Handler>>,
    wildcard: Vec<Handler>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventBusStats {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub replay_len: usize,
}

impl EventBus {

    // Returns the bus and the dispatcher task handle; dropping the handle is
    // fine, `shutdown` cancels the task cleanly.
    pub fn start(config: &EventBusConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            tx,
            handlers: RwLock::new(Handlers::default()),
            replay: Mutex::new(VecDeque::with_capacity(config.replay_size)),
            replay_size: config.replay_size,
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            shutdown_tx,
        });

        let bus = EventBus { shared: shared.clone() };
        let handle = tokio::spawn(dispatch_loop(shared, rx, shutdown_rx));
        (bus, handle)
    }

    // Registers a handler for one event kind.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| {
            Box::pin(handler(event)) as BoxFuture<'static, Result<(), HandlerError>>
        });
        self.shared
            .handlers
            .write()
            .expect("handler table poisoned")
            .by_kind
            .entry(kind)
            .or_default()
            .push(handler);
    }

    // Registers a handler for every event.
    pub fn subscribe_all<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| {
            Box::pin(handler(event)) as BoxFuture<'static, Result<(), HandlerError>>
        });
        self.shared
            .handlers
            .write()
            .expect("handler table poisoned")
            .wildcard
            .push(handler);
    }

    // Best-effort enqueue. A full queue drops the event and counts it.
    pub fn emit(&self, event: Event) {
        let event = Arc::new(event);

        {
            let mut replay = self.shared.replay.lock().expect("replay buffer poisoned");
            if replay.len() == self.shared.replay_size && self.shared.replay_size > 0 {
                replay.pop_front();
            }
            if self.shared.replay_size > 0 {
                replay.push_back(event.clone());
            }
        }

        if let Err(mpsc::error::TrySendError::Full(event)) = self.shared.tx.try_send(event) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("event queue full, dropping event: {:?}", event.kind());
        }
    }

    // Most recent events, optionally filtered by kind.
    pub fn replay(&self, kind: Option<EventKind>, limit: usize) -> Vec<Arc<Event>> {
        let replay = self.shared.replay.lock().expect("replay buffer poisoned");
        replay
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind() == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_processed: self.shared.processed.load(Ordering::Relaxed),
            events_dropped: self.shared.dropped.load(Ordering::Relaxed),
            replay_len: self.shared.replay.lock().expect("replay buffer poisoned").len(),
        }
    }

    // Stops the dispatcher; handlers already in flight run to completion.
    pub fn shutdown(&self) {
        self.shared.shutdown_tx.send(true).ok();
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Arc<Event>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("event bus dispatcher stopping");
                    break;
                }
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                dispatch_one(&shared, event).await;
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn dispatch_one(shared: &Shared, event: Arc<Event>) {
    let handlers: Vec<Handler> = {
        let table = shared.handlers.read().expect("handler table poisoned");
        table
            .by_kind
            .get(&event.kind())
            .into_iter()
            .flatten()
            .chain(table.wildcard.iter())
            .cloned()
            .collect()
    };

    if handlers.is_empty() {
        return;
    }

    // Handlers run concurrently; a failing handler is logged and the rest
    // still complete.
    let results = futures::future::join_all(
        handlers.iter().map(|handler| handler(event.clone())),
    )
    .await;

    for result in results {
        if let Err(e) = result {
            tracing::error!("event handler failed for {:?}: {}", event.kind(), e);
        }
    }
}
