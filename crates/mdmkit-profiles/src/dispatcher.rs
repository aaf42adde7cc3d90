//! Concurrent dispatch of install and remove targets.
//!
//! Every target runs on its own task, bounded by a semaphore. Outcomes flow
//! through one channel into a single consumer running on the caller's task,
//! which reports them to a [`DispatchObserver`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::commander::{CommandError, Commander};
use crate::types::{DispatchTarget, OperationType};
use crate::variables;

/// Receives the outcome of each dispatched command, one at a time.
#[async_trait]
pub trait DispatchObserver: Send {
    /// The command is queued for all of its enrollments. Push failures,
    /// partial or total, are reported here too.
    async fn on_enqueued(&mut self, command_uuid: &str);

    /// The command could not be queued.
    async fn on_enqueue_failed(&mut self, command_uuid: &str, err: &CommandError);
}

/// Counts of a dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub enqueued: usize,
    pub failed: usize,
    pub panicked: usize,
}

struct DispatchOutcome {
    command_uuid: String,
    result: Result<(), CommandError>,
}

/// Send every install and remove target.
///
/// `installs` is keyed by profile UUID; its bodies are looked up in
/// `contents`. Returns once every worker has finished and every outcome has
/// been observed.
pub async fn dispatch_targets<O>(
    commander: &Commander,
    installs: HashMap<String, DispatchTarget>,
    removes: HashMap<String, DispatchTarget>,
    contents: &HashMap<String, String>,
    concurrency: usize,
    observer: &mut O,
) -> DispatchSummary
where
    O: DispatchObserver + ?Sized,
{
    let mut summary = DispatchSummary::default();
    let total = installs.len() + removes.len();
    if total == 0 {
        return summary;
    }

    // One outcome per target, so producers never wait on the consumer.
    let (tx, mut rx) = mpsc::channel::<DispatchOutcome>(total);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut workers = JoinSet::new();

    let jobs = installs
        .into_iter()
        .map(|(uuid, target)| (OperationType::Install, uuid, target))
        .chain(
            removes
                .into_iter()
                .map(|(uuid, target)| (OperationType::Remove, uuid, target)),
        );

    for (operation, profile_uuid, target) in jobs {
        let body = match operation {
            OperationType::Install => match contents.get(&profile_uuid) {
                Some(body) => Some(body.clone()),
                None => {
                    // Capacity covers every target, so this never waits.
                    let _ = tx
                        .send(DispatchOutcome {
                            command_uuid: target.command_uuid,
                            result: Err(CommandError::MissingContents(profile_uuid)),
                        })
                        .await;
                    continue;
                }
            },
            OperationType::Remove => None,
        };

        let commander = commander.clone();
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let result = match body {
                Some(body) if variables::contains_secrets(&body) => {
                    commander
                        .install_profile_with_secrets(
                            &target.enrollment_ids,
                            &body,
                            &target.command_uuid,
                        )
                        .await
                }
                Some(body) => {
                    commander
                        .install_profile(&target.enrollment_ids, &body, &target.command_uuid)
                        .await
                }
                None => {
                    commander
                        .remove_profile(
                            &target.enrollment_ids,
                            &target.profile_identifier,
                            &target.command_uuid,
                        )
                        .await
                }
            };
            let _ = tx
                .send(DispatchOutcome {
                    command_uuid: target.command_uuid,
                    result,
                })
                .await;
        });
    }
    drop(tx);

    while let Some(outcome) = rx.recv().await {
        match outcome.result {
            Ok(()) => {
                summary.enqueued += 1;
                observer.on_enqueued(&outcome.command_uuid).await;
            }
            Err(CommandError::Delivery(e)) => {
                debug!(
                    command_uuid = %outcome.command_uuid,
                    failed_ids = ?e.failed_ids(),
                    "push delivery failed for some devices; command stays queued"
                );
                summary.enqueued += 1;
                observer.on_enqueued(&outcome.command_uuid).await;
            }
            Err(CommandError::Push(e)) => {
                error!(
                    command_uuid = %outcome.command_uuid,
                    error = %e,
                    "push failed after the command was queued"
                );
                summary.enqueued += 1;
                observer.on_enqueued(&outcome.command_uuid).await;
            }
            Err(e) => {
                summary.failed += 1;
                observer.on_enqueue_failed(&outcome.command_uuid, &e).await;
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            summary.panicked += 1;
            error!(error = %e, "dispatch worker did not complete");
        }
    }

    info!(
        enqueued = summary.enqueued,
        failed = summary.failed,
        panicked = summary.panicked,
        "dispatch finished"
    );
    summary
}
