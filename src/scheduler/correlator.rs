use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::protocol::{CapabilityName, ControllerMessage, Dispatch, Outcome, RequestId};
use crate::supervisor::WorkerId;

pub type RequestResult = Result<Value, RequestError>;

pub(crate) type CompletionSender = oneshot::Sender<RequestResult>;

/// Caller's handle on a request; resolves once with its outcome.
///
/// Resolves to [`RequestError::Abandoned`] if the supervisor goes away
/// before the request completes.
#[derive(Debug)]
pub struct Completion {
    id: RequestId,
    rx: oneshot::Receiver<RequestResult>,
}

impl Completion {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// A completion that is already resolved.
    pub(crate) fn ready(id: RequestId, result: RequestResult) -> Self {
        let (tx, completion) = completion(id);
        let _ = tx.send(result);
        completion
    }
}

impl Future for Completion {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Abandoned)))
    }
}

pub(crate) fn completion(id: RequestId) -> (CompletionSender, Completion) {
    let (tx, rx) = oneshot::channel();
    (tx, Completion { id, rx })
}

/// A request the controller has accepted and not yet resolved.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    /// Acceptance order, used to keep relocated requests in order.
    pub seq: u64,
    pub capability: CapabilityName,
    pub args: Vec<Value>,
    /// Worker counting this request as in flight; `None` while queued.
    pub assigned: Option<WorkerId>,
    reply: CompletionSender,
}

impl PendingRequest {
    pub fn dispatch_message(&self) -> ControllerMessage {
        ControllerMessage::Dispatch(Dispatch {
            id: self.id,
            request: self.capability.clone(),
            args: self.args.clone(),
        })
    }
}

/// What happened to an incoming result message.
#[derive(Debug, PartialEq)]
pub enum Resolution {
    Resolved,
    /// No pending request has this id.
    Unknown,
    /// The request is pending but assigned elsewhere (or queued).
    NotAssigned { assigned: Option<WorkerId> },
}

/// Pending requests by id.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<RequestId, PendingRequest>,
    next_seq: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &mut self,
        id: RequestId,
        capability: CapabilityName,
        args: Vec<Value>,
        reply: CompletionSender,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            id,
            PendingRequest {
                id,
                seq,
                capability,
                args,
                assigned: None,
                reply,
            },
        );
    }

    pub fn get(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.pending.get(id)
    }

    /// Mark `id` as in flight on `worker`.
    pub fn assign(&mut self, id: &RequestId, worker: WorkerId) -> Option<&PendingRequest> {
        let request = self.pending.get_mut(id)?;
        request.assigned = Some(worker);
        Some(request)
    }

    /// Return `id` to the queued state.
    pub fn release(&mut self, id: &RequestId) -> Option<&PendingRequest> {
        let request = self.pending.get_mut(id)?;
        request.assigned = None;
        Some(request)
    }

    /// Resolve the caller of `outcome.id` if `from` is the assigned worker.
    pub fn resolve(&mut self, from: WorkerId, outcome: Outcome) -> Resolution {
        let assigned = match self.pending.get(&outcome.id) {
            None => return Resolution::Unknown,
            Some(request) => request.assigned,
        };
        if assigned != Some(from) {
            return Resolution::NotAssigned { assigned };
        }
        if let Some(request) = self.pending.remove(&outcome.id) {
            let result = outcome.into_result().map_err(RequestError::Rejected);
            let _ = request.reply.send(result);
        }
        Resolution::Resolved
    }

    /// Requests in flight on `worker`, oldest first.
    pub fn assigned_to(&self, worker: WorkerId) -> Vec<RequestId> {
        let mut requests: Vec<&PendingRequest> = self
            .pending
            .values()
            .filter(|request| request.assigned == Some(worker))
            .collect();
        requests.sort_by_key(|request| request.seq);
        requests.into_iter().map(|request| request.id).collect()
    }

    /// Resolve every pending request as abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.reply.send(Err(RequestError::Abandoned));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
