//! Session queue
//!
//! Each session owns one thread that runs its serialized context. Other
//! threads submit work as boxed tasks over an unbounded mpsc queue and wait
//! on a oneshot reply; code already running on the session thread (for
//! instance a delegate notification) runs inline instead of queueing behind
//! itself.
//!
//! ```text
//! caller thread ── Task ──▶ mpsc ──▶ session thread ── reply ──▶ oneshot
//! wire engine ── notify() ─┘              │
//!                                         └─ poll_events / dispatch / flush
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};

use super::core::Context;

pub(crate) type Task = Box<dyn FnOnce(&Context) + Send>;

/// Items processed by the session thread, in submission order
pub(crate) enum QueueItem {
    Task(Task),
    /// The wire engine has events or writable window
    TransportReady,
    /// The last session handle was dropped
    Shutdown,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };
}

/// The context of `session_id`, if the calling thread is that session's thread
pub(crate) fn current_context(session_id: u64) -> Option<Rc<Context>> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|ctx| ctx.session_id() == session_id)
            .cloned()
    })
}

pub(crate) fn enter_context(ctx: Rc<Context>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(ctx));
}

pub(crate) fn leave_context() {
    CURRENT.with(|current| current.borrow_mut().take());
}

/// Wakes a session when its transport needs servicing.
///
/// Holds only a weak queue sender, so it never keeps a dropped session's
/// queue alive. Wakeups are coalesced until the session consumes one.
#[derive(Clone)]
pub struct ReadinessNotifier {
    tx: WeakUnboundedSender<QueueItem>,
    pending: Arc<AtomicBool>,
}

impl ReadinessNotifier {
    pub(crate) fn new(tx: &UnboundedSender<QueueItem>) -> Self {
        Self {
            tx: tx.downgrade(),
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn notify(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let delivered = self
            .tx
            .upgrade()
            .map(|tx| tx.send(QueueItem::TransportReady).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.pending.store(false, Ordering::Release);
        }
    }

    /// Called by the session thread before it polls the engine
    pub(crate) fn consume(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ReadinessNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessNotifier")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}
