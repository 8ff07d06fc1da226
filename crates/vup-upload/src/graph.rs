//! Dependency-ordered task runner for the stages of one revision.
//!
//! Each task starts once every dependency has settled. A failing `Fatal`
//! task cancels the shared token so siblings wind down at their next
//! checkpoint; the runner still waits for them so their cleanup runs.
//! A failing `Optional` task is logged and counts as settled.

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Fatal,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

struct Node {
    name: &'static str,
    deps: Vec<usize>,
    policy: FailurePolicy,
    task: BoxFuture<'static, Result<(), UploadError>>,
}

#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<Option<Node>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(
        &mut self,
        name: &'static str,
        deps: &[TaskId],
        policy: FailurePolicy,
        task: F,
    ) -> TaskId
    where
        F: std::future::Future<Output = Result<(), UploadError>> + Send + 'static,
    {
        self.nodes.push(Some(Node {
            name,
            deps: deps.iter().map(|d| d.0).collect(),
            policy,
            task: Box::pin(task),
        }));
        TaskId(self.nodes.len() - 1)
    }

    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), UploadError> {
        let total = self.nodes.len();
        let mut settled = vec![false; total];
        let mut policies = vec![FailurePolicy::Fatal; total];
        let mut names = vec![""; total];
        let mut set = JoinSet::new();
        let mut first_error: Option<UploadError> = None;

        loop {
            if first_error.is_none() {
                for i in 0..total {
                    let ready = matches!(&self.nodes[i], Some(node) if node.deps.iter().all(|&d| settled[d]));
                    if !ready {
                        continue;
                    }
                    if let Some(node) = self.nodes[i].take() {
                        policies[i] = node.policy;
                        names[i] = node.name;
                        tracing::trace!(task = node.name, "starting stage");
                        let task = node.task;
                        set.spawn(async move { (i, task.await) });
                    }
                }
            }

            let Some(joined) = set.join_next().await else {
                break;
            };

            match joined {
                Ok((i, Ok(()))) => settled[i] = true,
                Ok((i, Err(e))) => {
                    settled[i] = true;
                    let swallow = policies[i] == FailurePolicy::Optional
                        && !matches!(e, UploadError::Cancelled);
                    if swallow {
                        tracing::warn!(task = names[i], error = %e, "optional stage failed");
                    } else if first_error.is_none() {
                        tracing::debug!(task = names[i], error = %e, "stage failed, cancelling siblings");
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    cancel.cancel();
                    first_error.get_or_insert_with(|| {
                        UploadError::Validation(format!("stage panicked: {join_err}"))
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if self.nodes.iter().any(Option::is_some) => Err(UploadError::Validation(
                "stage graph has unsatisfiable dependencies".into(),
            )),
            None => Ok(()),
        }
    }
}
