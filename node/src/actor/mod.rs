//! Single-threaded-turn actors
//!
//! Every actor instance is owned by one tokio task draining its mailbox. A
//! turn runs one message handler to completion before the next starts, so
//! handlers see their state without interleaving. Two exceptions to strict
//! queueing exist, both decided by the call chain a message carries:
//!
//! - a non-reentrant actor rejects a message whose chain already contains
//!   its own id with [`ActorError::Reentrancy`], since queueing it behind the
//!   suspended outer turn could never complete
//! - a reentrant actor (`Actor::REENTRANT`) runs such a message while the
//!   outer turn is suspended; unrelated messages wait until the outer turn ends
//!
//! State sits behind an async mutex. Handlers must drop the guard before
//! awaiting a call to another actor.

mod directory;

pub use directory::ActorDirectory;

use crate::error::ActorError;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{error, warn};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};

/// Calls that get no reply within this window fail with `ActorError::Timeout`
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId {
    pub kind: &'static str,
    pub key: u64,
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// The actors a logical request has passed through, outermost first
#[derive(Debug, Clone, Default)]
pub struct CallChain(Arc<Vec<ActorId>>);

impl CallChain {
    /// Chain for a request entering from outside any actor
    pub fn root() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ActorId) -> bool {
        self.0.contains(id)
    }

    pub fn extend(&self, id: ActorId) -> Self {
        let mut ids = Vec::with_capacity(self.0.len() + 1);
        ids.extend_from_slice(&self.0);
        ids.push(id);
        Self(Arc::new(ids))
    }

    pub fn ids(&self) -> &[ActorId] {
        &self.0
    }
}

pub trait Actor: Send + 'static {
    const KIND: &'static str;
    const REENTRANT: bool = false;
}

/// Bookkeeping shared by an actor's mailbox task, its refs and its directory
#[derive(Debug)]
pub(crate) struct Cell {
    born: Instant,
    last_active_ms: AtomicU64,
    in_flight: AtomicUsize,
    pinned: AtomicBool,
    deactivated: AtomicBool,
}

impl Cell {
    fn new() -> Self {
        Self {
            born: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            pinned: AtomicBool::new(false),
            deactivated: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        let now = self.born.elapsed().as_millis() as u64;
        self.last_active_ms.store(now, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last)
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    pub(crate) fn deactivate(&self) {
        self.deactivated.store(true, Ordering::Release);
    }

    fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::Acquire)
    }
}

/// Handle given to a message handler for the duration of its turn
pub struct Turn<A: Actor> {
    id: ActorId,
    state: Arc<Mutex<A>>,
    chain: CallChain,
    cell: Arc<Cell>,
}

impl<A: Actor> Turn<A> {
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Locks the actor's state. Drop the guard before calling other actors.
    pub async fn state(&self) -> MutexGuard<'_, A> {
        self.state.lock().await
    }

    /// Chain to pass on outbound calls; already includes this actor
    pub fn chain(&self) -> &CallChain {
        &self.chain
    }

    /// Keeps the actor alive through idle collection
    pub fn pin(&self) {
        self.cell.pinned.store(true, Ordering::Release);
    }

    pub fn unpin(&self) {
        self.cell.pinned.store(false, Ordering::Release);
    }
}

type Job<A> = Box<dyn FnOnce(Turn<A>) -> BoxFuture<'static, ()> + Send>;

struct Envelope<A: Actor> {
    chain: CallChain,
    job: Job<A>,
}

/// Address of a running actor
pub struct ActorRef<A: Actor> {
    id: ActorId,
    tx: mpsc::UnboundedSender<Envelope<A>>,
    cell: Arc<Cell>,
    timeout: Duration,
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            cell: Arc::clone(&self.cell),
            timeout: self.timeout,
        }
    }
}

impl<A: Actor> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.id).finish()
    }
}

impl<A: Actor> ActorRef<A> {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.cell.is_deactivated() && !self.tx.is_closed()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn cell(&self) -> &Arc<Cell> {
        &self.cell
    }

    /// Runs `f` as a turn on this actor and waits for its result
    pub async fn call<R, F, Fut>(&self, chain: &CallChain, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(Turn<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, ActorError>> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(
            chain,
            Box::new(move |turn| {
                Box::pin(async move {
                    let _ = reply_tx.send(f(turn).await);
                })
            }),
        )?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActorError::Stopped(self.id.to_string())),
            Err(_) => Err(ActorError::Timeout(self.id.to_string())),
        }
    }

    /// Queues `f` as a turn without waiting for it
    pub fn tell<F, Fut>(&self, chain: &CallChain, f: F) -> Result<(), ActorError>
    where
        F: FnOnce(Turn<A>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(chain, Box::new(move |turn| Box::pin(f(turn))))
    }

    fn enqueue(&self, chain: &CallChain, job: Job<A>) -> Result<(), ActorError> {
        if self.cell.is_deactivated() {
            return Err(ActorError::Stopped(self.id.to_string()));
        }
        if chain.contains(&self.id) && !A::REENTRANT {
            return Err(ActorError::Reentrancy(self.id.to_string()));
        }

        self.cell.in_flight.fetch_add(1, Ordering::AcqRel);
        self.cell.touch();
        let envelope = Envelope {
            chain: chain.clone(),
            job,
        };
        self.tx.send(envelope).map_err(|_| {
            self.cell.in_flight.fetch_sub(1, Ordering::AcqRel);
            ActorError::Stopped(self.id.to_string())
        })
    }
}

/// Starts the mailbox task for `actor` and returns its address
pub fn spawn_actor<A: Actor>(key: u64, actor: A) -> ActorRef<A> {
    let id = ActorId { kind: A::KIND, key };
    let (tx, rx) = mpsc::unbounded_channel();
    let cell = Arc::new(Cell::new());
    let state = Arc::new(Mutex::new(actor));

    tokio::spawn(run_mailbox(id, state, Arc::clone(&cell), rx));

    ActorRef {
        id,
        tx,
        cell,
        timeout: DEFAULT_CALL_TIMEOUT,
    }
}

async fn run_mailbox<A: Actor>(
    id: ActorId,
    state: Arc<Mutex<A>>,
    cell: Arc<Cell>,
    mut rx: mpsc::UnboundedReceiver<Envelope<A>>,
) {
    let mut deferred: VecDeque<Envelope<A>> = VecDeque::new();
    let mut closed = false;

    loop {
        let next = match deferred.pop_front() {
            Some(envelope) => envelope,
            None if closed => break,
            None => match rx.recv().await {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let outer = start_turn(id, &state, &cell, next);
        if !A::REENTRANT {
            outer.await;
            continue;
        }

        // Reentrant: admit same-chain calls while the outer turn is suspended
        let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        running.push(outer);
        while !running.is_empty() {
            tokio::select! {
                _ = running.next() => {}
                incoming = rx.recv(), if !closed => match incoming {
                    Some(envelope) if envelope.chain.contains(&id) => {
                        running.push(start_turn(id, &state, &cell, envelope));
                    }
                    Some(envelope) => deferred.push_back(envelope),
                    None => closed = true,
                },
            }
        }
    }
}

fn start_turn<A: Actor>(
    id: ActorId,
    state: &Arc<Mutex<A>>,
    cell: &Arc<Cell>,
    envelope: Envelope<A>,
) -> BoxFuture<'static, ()> {
    let turn = Turn {
        id,
        state: Arc::clone(state),
        chain: envelope.chain.extend(id),
        cell: Arc::clone(cell),
    };
    let cell = Arc::clone(cell);
    let job = (envelope.job)(turn);

    Box::pin(async move {
        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Turn on {} panicked: {}", id, reason);
        }
        cell.touch();
        if cell.in_flight.fetch_sub(1, Ordering::AcqRel) == 0 {
            warn!("In-flight counter underflow on {}", id);
        }
    })
}
