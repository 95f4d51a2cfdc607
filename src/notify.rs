//! Edge-triggered wakeups used to tell the dispatcher loop "the command
//! queue has new work" without it busy-polling the ring.
//!
//! `op.c` wakes its dispatch loop from a seL4 notification; this crate's
//! analogue is [`tokio::sync::Notify`], already a teacher dependency
//! (`tokio` with the `sync` feature).

use std::rc::Rc;
use tokio::sync::Notify as TokioNotify;

/// A wakeup source the client side signals and the dispatcher awaits.
///
/// Kept as a trait (rather than using `tokio::sync::Notify` directly in
/// `Dispatcher`) so tests can drive the loop with a notifier that never
/// blocks.
pub trait Notifier {
    fn notify(&self);
    async fn notified(&self);
}

/// Default notifier backed by `tokio::sync::Notify`.
#[derive(Clone, Default)]
pub struct TokioNotifier {
    inner: Rc<TokioNotify>,
}

impl TokioNotifier {
    pub fn new() -> Self {
        Self { inner: Rc::new(TokioNotify::new()) }
    }
}

impl Notifier for TokioNotifier {
    fn notify(&self) {
        self.inner.notify_one();
    }

    async fn notified(&self) {
        self.inner.notified().await;
    }
}
