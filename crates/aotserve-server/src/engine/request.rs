use crate::collab::{CompletionHandle, MethodHandle};
use tokio::sync::oneshot;

/// A compilation the engine has agreed to consider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilePlan {
    pub method: MethodHandle,
    /// Worker chosen when the plan was created.
    pub worker: usize,
}

/// A message sent from the worker pool to an individual worker task.
///
/// [`WorkRequest`]s travel over bounded channels and are consumed by the
/// worker's main loop in order.
#[derive(Debug)]
pub enum WorkRequest {
    /// Compile `plan` and answer the client through `completion`.
    Compile {
        plan: CompilePlan,
        completion: CompletionHandle,
    },

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}
