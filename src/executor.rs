//! Single background execution slot.
//!
//! [ExecutionSlot] runs at most one unit of work at a time on the blocking thread pool and
//! reports its outcome as a [Completion] on a channel. Occupancy is managed with a Tokio
//! Semaphore holding a single permit: a dispatch takes the permit and the caller holds it until
//! it has finished handling the completion.

use crate::error::ReductionError;

use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

/// Outcome of a unit of work, together with the context it was dispatched with.
#[derive(Debug)]
pub struct Completion<C, T> {
    /// Context passed to [ExecutionSlot::dispatch], returned unchanged
    pub context: C,
    pub outcome: Result<T, ReductionError>,
}

/// A background execution slot.
#[derive(Debug)]
pub struct ExecutionSlot<C, T> {
    permit: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<Completion<C, T>>,
}

impl<C, T> ExecutionSlot<C, T>
where
    C: Send + 'static,
    T: Send + 'static,
{
    /// Returns a new slot and the receiving end of its completion channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Completion<C, T>>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let slot = ExecutionSlot {
            permit: Arc::new(Semaphore::new(1)),
            completions,
        };
        (slot, receiver)
    }

    /// Whether a unit of work is in flight or its completion has not been handled yet.
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Run `work` in the background.
    ///
    /// Fails with [ReductionError::SlotBusy] if the slot is occupied. The returned permit keeps
    /// the slot occupied until it is dropped. Panics in `work` are reported as
    /// [ReductionError::BackgroundTask].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch<F>(&self, context: C, work: F) -> Result<OwnedSemaphorePermit, ReductionError>
    where
        F: FnOnce() -> Result<T, ReductionError> + Send + 'static,
    {
        let permit = self
            .permit
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReductionError::SlotBusy)?;
        let completions = self.completions.clone();
        let span = tracing::Span::current();
        let blocking_span = span.clone();
        tokio::spawn(
            async move {
                let outcome =
                    match tokio::task::spawn_blocking(move || blocking_span.in_scope(work)).await {
                        Ok(outcome) => outcome,
                        Err(err) => Err(err.into()),
                    };
                if completions.send(Completion { context, outcome }).is_err() {
                    tracing::warn!("completion dropped, the scheduler has gone away");
                }
            }
            .instrument(span),
        );
        Ok(permit)
    }
}
