//! Completion slot bridging engine callbacks to waiting request handlers
//!
//! A slot is filled at most once, from any thread, and observed by any
//! number of waiters. Waiting is a real bounded wait on a watch channel.
//! A waiter that times out leaves the slot untouched, so a value that lands
//! later is still visible to the next waiter.

use std::time::Duration;

use tokio::sync::watch;

/// Current content of a [`CompletionSlot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState<T> {
    Pending,
    Ready(T),
    Failed(String),
    Cancelled,
}

impl<T> SlotState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, SlotState::Pending)
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    Failed(String),
    /// Slot was cancelled (session closed) while waiting
    Closed,
    TimedOut,
}

/// Single-assignment value with broadcast wake-up
#[derive(Debug)]
pub struct CompletionSlot<T> {
    tx: watch::Sender<SlotState<T>>,
}

impl<T> Default for CompletionSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::Pending);
        Self { tx }
    }

    /// Fill the slot. Returns false if it was already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(SlotState::Ready(value))
    }

    /// Settle the slot with a failure. Returns false if already settled.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(SlotState::Failed(reason.into()))
    }

    /// Release all waiters with [`WaitOutcome::Closed`]
    pub fn cancel(&self) -> bool {
        self.settle(SlotState::Cancelled)
    }

    fn settle(&self, next: SlotState<T>) -> bool {
        self.tx.send_if_modified(move |state| {
            if !state.is_pending() {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Snapshot of the current state
    pub fn peek(&self) -> SlotState<T> {
        self.tx.borrow().clone()
    }

    /// Register interest before triggering the operation that fills the slot
    pub fn waiter(&self) -> SlotWaiter<T> {
        SlotWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`CompletionSlot`]
#[derive(Debug)]
pub struct SlotWaiter<T> {
    rx: watch::Receiver<SlotState<T>>,
}

impl<T> SlotWaiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wait until the slot settles or `timeout` elapses
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome<T> {
        let rx = &mut self.rx;
        let settled = async move {
            rx.wait_for(|state| !state.is_pending())
                .await
                .map(|state| (*state).clone())
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(SlotState::Ready(value))) => WaitOutcome::Ready(value),
            Ok(Ok(SlotState::Failed(reason))) => WaitOutcome::Failed(reason),
            Ok(Ok(SlotState::Cancelled)) | Ok(Ok(SlotState::Pending)) => WaitOutcome::Closed,
            // Slot dropped together with its session
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
