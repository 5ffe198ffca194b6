//! Dispatch bridge: runs servant work on a bounded worker pool.
//!
//! Network-facing tasks never execute domain code. They package a call,
//! submit it to the pool and get the outcome back through a [`Completion`].
//!
//! - A fixed number of worker tasks share one bounded queue
//! - A full queue makes submitters wait; nothing is spawned per call
//! - Domain errors are mapped to the wire taxonomy on the worker
//! - Panics and internal errors are logged in full and answered generically

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use keel_protocol::{CallContext, HandlerResult, RpcError};
use keel_services::{ServiceError, ServiceResult};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info};

use crate::servant::Servant;

type Job = BoxFuture<'static, ()>;

// ─────────────────────────────────────────────────────────────────────────────
// Completion channel
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot callback handle for an invocation outcome.
pub struct Completion {
    tx: oneshot::Sender<HandlerResult>,
}

/// The waiting side of a [`Completion`].
pub struct PendingResult {
    rx: oneshot::Receiver<HandlerResult>,
}

impl Completion {
    pub fn new() -> (Self, PendingResult) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, PendingResult { rx })
    }

    pub fn respond(self, value: Value) {
        self.deliver(Ok(value));
    }

    pub fn fail(self, error: RpcError) {
        self.deliver(Err(error));
    }

    fn deliver(self, result: HandlerResult) {
        if self.tx.send(result).is_err() {
            debug!("Invocation outcome dropped: caller stopped waiting");
        }
    }
}

impl PendingResult {
    /// Wait for the outcome. A completion dropped unanswered means the pool
    /// went away underneath the call.
    pub async fn wait(self) -> HandlerResult {
        self.rx.await.unwrap_or_else(|_| Err(RpcError::shutting_down()))
    }
}

/// A captured call, consumed exactly once by [`DispatchBridge::invoke`].
pub struct PendingInvocation {
    pub servant: Servant,
    pub method: String,
    pub context: CallContext,
    pub args: Value,
    pub done: Completion,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────────────────

pub struct DispatchBridge {
    /// `None` once shut down.
    job_tx: RwLock<Option<mpsc::Sender<Job>>>,
}

impl DispatchBridge {
    /// Start `pool_size` workers behind a queue of `queue_depth` jobs.
    pub fn new(pool_size: usize, queue_depth: usize) -> Self {
        let pool_size = pool_size.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));

        for i in 0..pool_size {
            let job_rx = Arc::clone(&job_rx);
            tokio::spawn(async move {
                worker_task(i, job_rx).await;
            });
        }
        info!("Dispatch pool started with {pool_size} workers (queue {queue_depth})");

        Self {
            job_tx: RwLock::new(Some(job_tx)),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.job_tx.read().is_none()
    }

    /// Stop accepting work. Queued jobs still run; workers exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        if self.job_tx.write().take().is_some() {
            info!("Dispatch pool shutting down");
        }
    }

    /// Look up `method` on the servant and run it on the pool. The outcome,
    /// success or failure, is only ever delivered through `done`.
    pub async fn invoke(&self, call: PendingInvocation) {
        let PendingInvocation {
            servant,
            method,
            context,
            args,
            done,
        } = call;

        if let Err(e) = servant.ensure_active() {
            done.fail(e);
            return;
        }
        let Some(invocation) = servant.lookup(&method) else {
            done.fail(RpcError::method_not_found(&format!(
                "{}.{method}",
                servant.interface()
            )));
            return;
        };

        let label = context.call_id.clone();
        let work = invocation(context, args);
        self.run_work(label, work, done).await;
    }

    /// Run an arbitrary unit of work on the pool with the same queueing and
    /// error mapping as [`invoke`](Self::invoke).
    pub async fn run_work<F>(&self, label: String, work: F, done: Completion)
    where
        F: Future<Output = ServiceResult<Value>> + Send + 'static,
    {
        let job: Job = Box::pin(async move {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => done.respond(value),
                Ok(Err(e)) => done.fail(map_service_error(&label, e)),
                Err(panic) => {
                    error!("Call {label} panicked: {}", panic_message(&*panic));
                    done.fail(RpcError::internal_generic());
                }
            }
        });
        self.submit(job).await;
    }

    /// [`invoke`](Self::invoke) and wait for the outcome.
    pub async fn invoke_and_wait(
        &self,
        servant: Servant,
        method: impl Into<String>,
        context: CallContext,
        args: Value,
    ) -> HandlerResult {
        let (done, pending) = Completion::new();
        self.invoke(PendingInvocation {
            servant,
            method: method.into(),
            context,
            args,
            done,
        })
        .await;
        pending.wait().await
    }

    /// [`run_work`](Self::run_work) and wait for the outcome.
    pub async fn run_and_wait<F>(&self, label: impl Into<String>, work: F) -> HandlerResult
    where
        F: Future<Output = ServiceResult<Value>> + Send + 'static,
    {
        let (done, pending) = Completion::new();
        self.run_work(label.into(), work, done).await;
        pending.wait().await
    }

    /// Queue a job, waiting for room if the queue is full. A job refused
    /// because the pool is gone is dropped, which drops its completion.
    async fn submit(&self, job: Job) {
        let tx = self.job_tx.read().clone();
        let Some(tx) = tx else {
            debug!("Job refused: dispatch pool is shut down");
            return;
        };
        if tx.send(job).await.is_err() {
            debug!("Job refused: dispatch workers are gone");
        }
    }
}

async fn worker_task(worker_id: usize, job_rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => {
                    debug!("Dispatch worker {worker_id} exiting (queue closed)");
                    return;
                }
            }
        };
        job.await;
    }
}

/// Map a domain error to the wire taxonomy. Internal detail stays in the log.
pub fn map_service_error(label: &str, err: ServiceError) -> RpcError {
    if err.is_internal() {
        error!("Call {label} failed internally: {err}");
    }
    let rpc: RpcError = err.into();
    if rpc.is(keel_protocol::RpcErrorCode::InternalError) && rpc != RpcError::internal_generic() {
        error!("Call {label} failed internally: {}", rpc.message);
        return RpcError::internal_generic();
    }
    rpc
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
