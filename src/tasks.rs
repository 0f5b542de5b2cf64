//! Remote tasks.
//!
//! Operator requests reach the control loop as [`RemoteTask`] values. The
//! loop runs at most one per tick, on the master only. A task that depends
//! on its effects being visible in the cluster is not completed until a
//! version containing them has converged on every distributor, or fails
//! once its deadline passes.

use crate::cluster::NodeRegistry;
use crate::events::EventLog;
use crate::state::{ClusterState, Node, NodeState};
use crate::state_change::StateChangeHandler;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Why a task did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// This replica is not, or is no longer, the master.
    #[error("Leadership lost before the task could complete")]
    LeadershipLost,

    /// The task's version did not converge in time.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The task's input was invalid.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The controller went away without completing the task.
    #[error("Controller stopped")]
    Cancelled,
}

impl TaskFailure {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskFailure::LeadershipLost => "leadership_lost",
            TaskFailure::DeadlineExceeded(_) => "deadline_exceeded",
            TaskFailure::Rejected(_) => "rejected",
            TaskFailure::Cancelled => "cancelled",
        }
    }
}

/// What a task may touch while it runs.
pub struct TaskContext<'a> {
    pub registry: &'a mut NodeRegistry,
    pub state_change: &'a mut StateChangeHandler,
    /// Baseline of the last published state.
    pub current: &'a ClusterState,
    pub events: &'a mut EventLog,
    pub now: u64,
}

pub trait RemoteTask: Send {
    /// Whether completion waits for the task's effects to converge.
    fn has_version_ack_dependency(&self) -> bool {
        false
    }

    /// How long to wait for convergence. `None` uses the configured
    /// maximum.
    fn deadline(&self) -> Option<Duration> {
        None
    }

    fn do_work(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskFailure>;

    fn handle_failure(&mut self, failure: TaskFailure);

    fn notify_completed(&mut self);
}

impl std::fmt::Debug for dyn RemoteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTask")
            .field("version_ack_dependency", &self.has_version_ack_dependency())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Caller's side of a task: resolves once the task completes or fails.
#[derive(Debug)]
pub struct TaskCompletion {
    receiver: oneshot::Receiver<Result<(), TaskFailure>>,
}

impl TaskCompletion {
    pub async fn wait(self) -> Result<(), TaskFailure> {
        self.receiver.await.unwrap_or(Err(TaskFailure::Cancelled))
    }

    /// Block the current thread until the task is done. Must not be called
    /// from within an async runtime.
    pub fn blocking_wait(self) -> Result<(), TaskFailure> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskFailure::Cancelled))
    }

    /// The result, if the task is done.
    pub fn try_result(&mut self) -> Option<Result<(), TaskFailure>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskFailure::Cancelled)),
        }
    }
}

/// Task side of a [`TaskCompletion`]. Only the first result is delivered.
#[derive(Debug)]
pub struct TaskCompleter {
    sender: Option<oneshot::Sender<Result<(), TaskFailure>>>,
}

impl TaskCompleter {
    pub fn complete(&mut self, result: Result<(), TaskFailure>) {
        if let Some(sender) = self.sender.take() {
            // The caller may have stopped waiting.
            let _ = sender.send(result);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender.is_none()
    }
}

pub fn task_completion() -> (TaskCompleter, TaskCompletion) {
    let (sender, receiver) = oneshot::channel();
    (
        TaskCompleter {
            sender: Some(sender),
        },
        TaskCompletion { receiver },
    )
}

/// Sets the wanted state of one node on behalf of an operator.
#[derive(Debug)]
pub struct SetNodeStateTask {
    node: Node,
    wanted: NodeState,
    wait_for_convergence: bool,
    deadline: Option<Duration>,
    completer: TaskCompleter,
}

impl SetNodeStateTask {
    pub fn new(node: Node, wanted: NodeState) -> (Self, TaskCompletion) {
        let (completer, completion) = task_completion();
        (
            Self {
                node,
                wanted,
                wait_for_convergence: false,
                deadline: None,
                completer,
            },
            completion,
        )
    }

    /// Complete only once the new state has converged on all distributors.
    pub fn wait_for_convergence(mut self, wait: bool) -> Self {
        self.wait_for_convergence = wait;
        self
    }

    /// Wait at most `deadline` for convergence instead of the configured
    /// maximum.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl RemoteTask for SetNodeStateTask {
    fn has_version_ack_dependency(&self) -> bool {
        self.wait_for_convergence
    }

    fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    fn do_work(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskFailure> {
        let info = ctx
            .registry
            .get_mut(self.node)
            .ok_or_else(|| TaskFailure::Rejected(format!("Unknown node {}", self.node)))?;
        debug!(node = %self.node, wanted = %self.wanted, "setting wanted node state");
        ctx.state_change
            .propose_new_node_state(ctx.current, info, self.wanted.clone(), ctx.events, ctx.now)
            .map_err(|e| TaskFailure::Rejected(e.to_string()))
    }

    fn handle_failure(&mut self, failure: TaskFailure) {
        self.completer.complete(Err(failure));
    }

    fn notify_completed(&mut self) {
        self.completer.complete(Ok(()));
    }
}

/// A task that finished its work and waits for `min_version` to converge.
#[derive(Debug)]
pub struct VersionDependentTaskCompletion {
    pub min_version: u32,
    pub deadline: u64,
    pub task: Box<dyn RemoteTask>,
}

impl VersionDependentTaskCompletion {
    pub fn new(min_version: u32, deadline: u64, task: Box<dyn RemoteTask>) -> Self {
        Self {
            min_version,
            deadline,
            task,
        }
    }

    pub fn is_satisfied_by(&self, converged_version: u32) -> bool {
        converged_version >= self.min_version
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.deadline
    }
}
