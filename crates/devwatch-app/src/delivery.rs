//! The single delivery context
//!
//! All listener notification and every publish out of a [`Refreshable`] runs
//! here, one job at a time, in submission order. Jobs are short synchronous
//! closures; they must never block on another job.
//!
//! [`Refreshable`]: crate::refreshable::Refreshable

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};

use devwatch_core::prelude::*;

type Job = Box<dyn FnOnce() + Send>;

/// Handle to the delivery context; cheap to clone
#[derive(Clone)]
pub struct DeliveryContext {
    tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryContext {
    /// Start the delivery task on the current tokio runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                invoke_guarded("delivery job", job);
            }
            debug!("Delivery context stopped");
        });
        Self { tx }
    }

    /// Queue `job` behind everything already submitted
    pub fn invoke_later<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            debug!("Delivery context gone; dropping job");
        }
    }

    /// Run `f` on the delivery context and wait for its result
    pub async fn invoke_and_wait<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.invoke_later(move || {
            let _ = tx.send(f());
        });
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Wait until every job submitted before this call has run
    pub async fn flush(&self) {
        let _ = self.invoke_and_wait(|| ()).await;
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext").finish_non_exhaustive()
    }
}

/// Run `f`, logging instead of propagating a panic
pub fn invoke_guarded<F: FnOnce()>(what: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        error!("{} panicked: {}", what, message);
    }
}
