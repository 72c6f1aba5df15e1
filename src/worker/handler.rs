use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::HandlerError;
use crate::protocol::{Dispatch, Outcome, WorkerMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerResult = Result<Value, HandlerError>;

/// A registered capability implementation.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub(crate) fn from_async<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Synchronous handlers run on the blocking pool so CPU-bound work does not
/// stall the worker's message loop.
pub(crate) fn from_sync<F>(f: F) -> Handler
where
    F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |args| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f(args))
                .await
                .unwrap_or_else(|_| Err(HandlerError::panicked()))
        })
    })
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<HandlerResult>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `handler` for `dispatch` and queue the result message.
///
/// The handler runs in its own task so a panic is reported to the caller as
/// a failure instead of tearing down the worker.
pub(crate) fn invoke(
    handler: Option<Handler>,
    dispatch: Dispatch,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    tasks: &mut JoinSet<()>,
) {
    tasks.spawn(async move {
        let Dispatch { id, request, args } = dispatch;
        let outcome = match handler {
            None => {
                tracing::warn!(request_id = %id, capability = %request, "Dispatch for unknown capability");
                Outcome::failure(id, HandlerError::not_provided(request.as_str()))
            }
            Some(handler) => {
                let mut running = AbortOnDrop(tokio::spawn(async move { handler(args).await }));
                match (&mut running.0).await {
                    Ok(Ok(value)) => Outcome::success(id, value),
                    Ok(Err(err)) => {
                        tracing::debug!(request_id = %id, capability = %request, error = %err, "Handler failed");
                        Outcome::failure(id, err)
                    }
                    Err(_) => {
                        tracing::error!(request_id = %id, capability = %request, "Handler panicked");
                        Outcome::failure(id, HandlerError::panicked())
                    }
                }
            }
        };
        let _ = outbound.send(WorkerMessage::Result(outcome));
    });
}
