//! Callback completion layer.
//!
//! Every asynchronous ledger operation completes by invoking a caller-supplied
//! callback exactly once, on the ordered worker of its ledger. The awaited
//! variants (`add_entry`, `read_entries`, ...) are thin wrappers that install
//! a one-shot callback and wait for it.
//!
//! # Panicking callbacks
//!
//! A callback that panics does not take the worker down. The panic is caught,
//! logged, counted in [`ClientStats`], and reported through the
//! [`Completion`] returned by the `async_*` call as
//! [`LedgerError::UnexpectedCondition`].

use std::{
    any::Any,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use quorumlog_cluster::{ClientStats, LedgerId};
use tokio::sync::oneshot;

use crate::{
    entry::LedgerEntry,
    error::{LedgerError, LedgerResult},
};

/// Opaque caller value handed back to a callback untouched.
pub type CallbackContext = Option<Arc<dyn Any + Send + Sync>>;

/// Completion of an add: the assigned entry id, or the failure.
pub trait AddCallback: Send + 'static {
    /// Called once when the add completes.
    fn add_complete(self: Box<Self>, result: LedgerResult<i64>, ledger_id: LedgerId, ctx: CallbackContext);
}

impl<F> AddCallback for F
where
    F: FnOnce(LedgerResult<i64>, LedgerId, CallbackContext) + Send + 'static,
{
    fn add_complete(self: Box<Self>, result: LedgerResult<i64>, ledger_id: LedgerId, ctx: CallbackContext) {
        (*self)(result, ledger_id, ctx);
    }
}

/// Completion of a range or batch read.
pub trait ReadCallback: Send + 'static {
    /// Called once when the read completes.
    fn read_complete(
        self: Box<Self>,
        result: LedgerResult<Vec<LedgerEntry>>,
        ledger_id: LedgerId,
        ctx: CallbackContext,
    );
}

impl<F> ReadCallback for F
where
    F: FnOnce(LedgerResult<Vec<LedgerEntry>>, LedgerId, CallbackContext) + Send + 'static,
{
    fn read_complete(
        self: Box<Self>,
        result: LedgerResult<Vec<LedgerEntry>>,
        ledger_id: LedgerId,
        ctx: CallbackContext,
    ) {
        (*self)(result, ledger_id, ctx);
    }
}

/// Completion of a last-add-confirmed query.
pub trait LastConfirmedCallback: Send + 'static {
    /// Called once with the last-add-confirmed id, or the failure.
    fn last_confirmed_complete(self: Box<Self>, result: LedgerResult<i64>, ledger_id: LedgerId, ctx: CallbackContext);
}

impl<F> LastConfirmedCallback for F
where
    F: FnOnce(LedgerResult<i64>, LedgerId, CallbackContext) + Send + 'static,
{
    fn last_confirmed_complete(
        self: Box<Self>,
        result: LedgerResult<i64>,
        ledger_id: LedgerId,
        ctx: CallbackContext,
    ) {
        (*self)(result, ledger_id, ctx);
    }
}

/// Resolves once the callback of an `async_*` call has run.
///
/// Yields `Ok(())` if the callback returned normally and
/// [`LedgerError::UnexpectedCondition`] if it panicked or the operation was
/// dropped without completing. Dropping a `Completion` does not cancel the
/// operation.
#[derive(Debug)]
#[must_use = "dropping a Completion does not cancel the operation but loses panic reports"]
pub struct Completion {
    rx: oneshot::Receiver<LedgerResult<()>>,
}

impl Future for Completion {
    type Output = LedgerResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(LedgerError::unexpected_condition("operation dropped before its callback ran"))
            })
        })
    }
}

/// A caller's callback, its context, and the signal behind its [`Completion`].
pub(crate) struct PendingCallback<C: ?Sized> {
    callback: Box<C>,
    ctx: CallbackContext,
    done: oneshot::Sender<LedgerResult<()>>,
}

impl<C: ?Sized> PendingCallback<C> {
    /// Pairs a callback with a fresh [`Completion`].
    ///
    /// Fails with `InvalidArgument` when no callback was supplied.
    pub(crate) fn new(callback: Option<Box<C>>, ctx: CallbackContext) -> LedgerResult<(Self, Completion)> {
        let callback = callback.ok_or_else(|| LedgerError::invalid_argument("callback is required"))?;
        let (done, rx) = oneshot::channel();
        Ok((Self { callback, ctx, done }, Completion { rx }))
    }
}

impl PendingCallback<dyn AddCallback> {
    pub(crate) fn complete(self, stats: &ClientStats, ledger_id: LedgerId, result: LedgerResult<i64>) {
        let Self { callback, ctx, done } = self;
        deliver(stats, done, ledger_id, move || callback.add_complete(result, ledger_id, ctx));
    }
}

impl PendingCallback<dyn ReadCallback> {
    pub(crate) fn complete(
        self,
        stats: &ClientStats,
        ledger_id: LedgerId,
        result: LedgerResult<Vec<LedgerEntry>>,
    ) {
        let Self { callback, ctx, done } = self;
        deliver(stats, done, ledger_id, move || callback.read_complete(result, ledger_id, ctx));
    }
}

impl PendingCallback<dyn LastConfirmedCallback> {
    pub(crate) fn complete(self, stats: &ClientStats, ledger_id: LedgerId, result: LedgerResult<i64>) {
        let Self { callback, ctx, done } = self;
        deliver(stats, done, ledger_id, move || callback.last_confirmed_complete(result, ledger_id, ctx));
    }
}

pub(crate) type AddCompletion = PendingCallback<dyn AddCallback>;
pub(crate) type ReadCompletion = PendingCallback<dyn ReadCallback>;
pub(crate) type LastConfirmedCompletion = PendingCallback<dyn LastConfirmedCallback>;

fn deliver(
    stats: &ClientStats,
    done: oneshot::Sender<LedgerResult<()>>,
    ledger_id: LedgerId,
    invoke: impl FnOnce(),
) {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(()) => Ok(()),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(ledger_id = %ledger_id, panic = %message, "completion callback panicked");
            stats.record_callback_panic();
            Err(LedgerError::unexpected_condition(format!("callback panicked: {message}")))
        },
    };
    // Nobody may be waiting on the Completion.
    let _ = done.send(outcome);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// A callback that forwards its result into a oneshot channel.
pub(crate) fn add_waiter() -> (Box<dyn AddCallback>, oneshot::Receiver<LedgerResult<i64>>) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: LedgerResult<i64>, _: LedgerId, _: CallbackContext| {
        let _ = tx.send(result);
    };
    (Box::new(callback), rx)
}

/// A read callback that forwards its result into a oneshot channel.
pub(crate) fn read_waiter() -> (Box<dyn ReadCallback>, oneshot::Receiver<LedgerResult<Vec<LedgerEntry>>>) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: LedgerResult<Vec<LedgerEntry>>, _: LedgerId, _: CallbackContext| {
        let _ = tx.send(result);
    };
    (Box::new(callback), rx)
}

/// A last-confirmed callback that forwards its result into a oneshot channel.
pub(crate) fn last_confirmed_waiter() -> (Box<dyn LastConfirmedCallback>, oneshot::Receiver<LedgerResult<i64>>) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: LedgerResult<i64>, _: LedgerId, _: CallbackContext| {
        let _ = tx.send(result);
    };
    (Box::new(callback), rx)
}

/// Waits for a waiter installed by one of the `*_waiter` helpers.
pub(crate) async fn wait<T>(rx: oneshot::Receiver<LedgerResult<T>>) -> LedgerResult<T> {
    rx.await.unwrap_or_else(|_| {
        Err(LedgerError::unexpected_condition("operation dropped before its callback ran"))
    })
}
