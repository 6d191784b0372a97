//! # Reconciler Core
//!
//! Per-intent state machine shared by both custom resource kinds: schedule
//! check → TTL check → terminal short-circuit → probes → credentials →
//! execute (commit or PR) → status writeback → requeue. `GitCommit` and
//! `PullRequest` get their own top-level `reconcile_*` entry points (their
//! status shapes differ enough that a single generic driver would need more
//! machinery than the duplication it would save), but both call the same
//! pure `pre_check`/`execute_intent` helpers so the actual decision logic
//! lives in one place.

use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::constants::{
    REQUEUE_EXECUTION_FAILURE_SECS, REQUEUE_PROBE_UNMET_SECS, REQUEUE_TERMINAL_POLL_SECS,
    STATUS_WRITE_MAX_RETRIES, STATUS_WRITE_RETRY_SPACING_MS,
};
use crate::credentials::resolve_git_credentials;
use crate::encryption;
use crate::git::{merge_files, GitWorker};
use crate::observability::metrics;
use crate::probe::ProbeClient;
use crate::projection::project;
use crate::scheduler::{self, Decision, SchedulerError};
use crate::{GitCommit, IntentCommonSpec, Phase, ProbeStatus, PullRequest};

const FIELD_MANAGER: &str = "git-change-operator";

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("object has no namespace")]
    MissingNamespace,
    #[error("status write failed after exhausting retries: {0}")]
    StatusWrite(#[source] kube::Error),
}

/// Shared dependencies every reconciliation needs, independent of which
/// intent kind it is driving. `worker_slots` bounds how many reconciliations
/// run their Git/forge work concurrently, independent of how many distinct
/// objects `kube_runtime::Controller` happens to be driving at once.
#[derive(Clone)]
pub struct ReconcilerContext {
    pub client: Client,
    pub probe_client: ProbeClient,
    pub worker_slots: Arc<tokio::sync::Semaphore>,
}

impl ReconcilerContext {
    #[must_use]
    pub fn new(client: Client, concurrency: usize) -> Self {
        Self {
            client,
            probe_client: ProbeClient::new(),
            worker_slots: Arc::new(tokio::sync::Semaphore::new(concurrency.max(1))),
        }
    }
}

/// What the schedule/TTL/terminal gate decided to do this pass, before any
/// probe or Git work happens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PreCheck {
    Proceed,
    Suspended,
    Wait { next_scheduled_time: DateTime<Utc> },
    TtlExpired,
    TerminalShortCircuit,
}

/// §4.1 steps 1-3: schedule takes precedence over TTL, which takes
/// precedence over the terminal short-circuit. Pure function over status
/// snapshot fields — no I/O, so unit-testable without a cluster.
fn pre_check(
    common: &IntentCommonSpec,
    phase: Phase,
    creation_timestamp: Option<DateTime<Utc>>,
    last_scheduled_time: Option<&str>,
    next_scheduled_time: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PreCheck, SchedulerError> {
    if let Some(expression) = &common.schedule {
        return Ok(
            match scheduler::decide(
                expression,
                common.suspend,
                last_scheduled_time,
                next_scheduled_time,
                now,
            )? {
                Decision::Suspended => PreCheck::Suspended,
                Decision::ExecuteNow => PreCheck::Proceed,
                Decision::Wait { next_scheduled_time } => PreCheck::Wait { next_scheduled_time },
            },
        );
    }

    if let (Some(ttl_minutes), Some(created)) = (common.ttl_minutes, creation_timestamp) {
        let expires_at = created + chrono::Duration::minutes(i64::try_from(ttl_minutes).unwrap_or(i64::MAX));
        if now > expires_at {
            return Ok(PreCheck::TtlExpired);
        }
    }

    if matches!(phase, Phase::Committed | Phase::Created | Phase::Failed) {
        return Ok(PreCheck::TerminalShortCircuit);
    }

    Ok(PreCheck::Proceed)
}

/// Which kind of Git operation this intent executes, carrying only the
/// fields that differ between `GitCommit` and `PullRequest`.
enum IntentAction<'a> {
    Commit {
        branch: &'a str,
        commit_message: &'a str,
    },
    PullRequest {
        base_branch: &'a str,
        head_branch: &'a str,
        title: &'a str,
        body: Option<&'a str>,
    },
}

enum ExecutionOutcome {
    Commit(String),
    PullRequest(i64, String),
}

enum ExecutionFailure {
    ProbesUnmet(Vec<ProbeStatus>),
    Failed(anyhow::Error),
}

/// §4.1 steps 5-7: probes, credential resolution, projection rendering,
/// selective encryption, and the Git/forge call.
async fn execute_intent(
    ctx: &ReconcilerContext,
    kind: &str,
    namespace: &str,
    common: &IntentCommonSpec,
    action: &IntentAction<'_>,
) -> Result<(Vec<ProbeStatus>, ExecutionOutcome), ExecutionFailure> {
    let (probe_statuses, all_met) = ctx
        .probe_client
        .run_all(&ctx.client, namespace, kind, &common.probes)
        .await;
    if !all_met {
        return Err(ExecutionFailure::ProbesUnmet(probe_statuses));
    }

    let creds = resolve_git_credentials(&ctx.client, namespace, &common.auth_ref)
        .await
        .map_err(ExecutionFailure::Failed)?;

    let mut projected = Vec::new();
    for projection_spec in &common.projections {
        let files = project(&ctx.client, namespace, projection_spec)
            .await
            .map_err(ExecutionFailure::Failed)?;
        projected.extend(files);
    }

    let mut materialized =
        merge_files(&common.files, &probe_statuses, projected).map_err(ExecutionFailure::Failed)?;

    if let Some(enc) = &common.encryption {
        if enc.enabled {
            for file in &mut materialized {
                if encryption::should_encrypt(&file.path, enc) {
                    let recipients = encryption::resolve_recipients(&ctx.client, namespace, &enc.recipients)
                        .await
                        .map_err(ExecutionFailure::Failed)?;
                    file.content =
                        encryption::encrypt(&file.content, recipients).map_err(ExecutionFailure::Failed)?;
                    file.path = encryption::encrypted_path(&file.path, enc);
                }
            }
        }
    }

    let git = GitWorker::new();
    let outcome = match action {
        IntentAction::Commit {
            branch,
            commit_message,
        } => {
            let sha = git
                .execute_commit(
                    kind,
                    &common.repository_url,
                    branch,
                    commit_message,
                    &creds,
                    materialized,
                )
                .map_err(ExecutionFailure::Failed)?;
            ExecutionOutcome::Commit(sha)
        }
        IntentAction::PullRequest {
            base_branch,
            head_branch,
            title,
            body,
        } => {
            let forge_token = creds.token.clone();
            let (number, url) = git
                .execute_pull_request(
                    kind,
                    &common.repository_url,
                    base_branch,
                    head_branch,
                    title,
                    *body,
                    &creds,
                    &forge_token,
                    materialized,
                )
                .await
                .map_err(ExecutionFailure::Failed)?;
            ExecutionOutcome::PullRequest(number, url)
        }
    };

    Ok((probe_statuses, outcome))
}

/// Patches `status` with optimistic-concurrency retry: up to
/// `STATUS_WRITE_MAX_RETRIES` attempts, `STATUS_WRITE_RETRY_SPACING_MS`
/// apart, on a 409 conflict.
async fn patch_status_with_retry<K>(api: &Api<K>, name: &str, patch: serde_json::Value) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let params = PatchParams::apply(FIELD_MANAGER);
    let mut attempt = 0;
    loop {
        match api.patch_status(name, &params, &Patch::Merge(&patch)).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < STATUS_WRITE_MAX_RETRIES => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(STATUS_WRITE_RETRY_SPACING_MS)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn reconcile_git_commit(
    obj: Arc<GitCommit>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    const KIND: &str = "gitcommit";
    let _permit = ctx
        .worker_slots
        .acquire()
        .await
        .expect("worker semaphore is never closed");
    let start = std::time::Instant::now();
    let namespace = obj.namespace().ok_or(ReconcilerError::MissingNamespace)?;
    let name = obj.name_any();
    let key = format!("{namespace}/{name}");
    let generation = obj.metadata.generation;
    let creation_timestamp = obj.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let status = obj.status.clone().unwrap_or_default();
    let common = &obj.spec.common;
    let api: Api<GitCommit> = Api::namespaced(ctx.client.clone(), &namespace);
    let now = Utc::now();

    metrics::increment_reconciliations(KIND);
    info!(intent = %key, generation, "reconciling");

    let pre = match pre_check(
        common,
        status.phase,
        creation_timestamp,
        status.last_scheduled_time.as_deref(),
        status.next_scheduled_time.as_deref(),
        now,
    ) {
        Ok(p) => p,
        Err(e) => {
            warn!(intent = %key, error = %e, "invalid schedule expression");
            metrics::increment_reconciliation_errors(KIND, "invalid_spec");
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Failed", "message": e.to_string()}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            return Ok(Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS)));
        }
    };

    let action = match pre {
        PreCheck::Suspended => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Pending", "message": "schedule suspended"}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS))
        }
        PreCheck::Wait { next_scheduled_time } => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"nextScheduledTime": next_scheduled_time.to_rfc3339()}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            let delay = (next_scheduled_time - now)
                .to_std()
                .unwrap_or(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS));
            Action::requeue(delay)
        }
        PreCheck::TtlExpired => {
            if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
                warn!(intent = %key, error = %e, "failed to delete TTL-expired GitCommit");
            } else {
                info!(intent = %key, "deleted TTL-expired GitCommit");
            }
            Action::await_change()
        }
        PreCheck::TerminalShortCircuit => Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS)),
        PreCheck::Proceed => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Running", "observedGeneration": generation}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;

            let intent_action = IntentAction::Commit {
                branch: &obj.spec.branch,
                commit_message: &obj.spec.commit_message,
            };

            match execute_intent(&ctx, KIND, &namespace, common, &intent_action).await {
                Ok((probe_statuses, ExecutionOutcome::Commit(sha))) => {
                    let mut history = status.execution_history.clone();
                    let mut last_scheduled = status.last_scheduled_time.clone();
                    let mut next_scheduled = status.next_scheduled_time.clone();
                    if let Some(expression) = &common.schedule {
                        scheduler::record_execution(
                            &mut history,
                            now,
                            Phase::Committed,
                            Some(sha.clone()),
                            None,
                            common.max_execution_history,
                        );
                        last_scheduled = Some(now.to_rfc3339());
                        next_scheduled = scheduler::next_fire_after(expression, now)
                            .ok()
                            .map(|t| t.to_rfc3339());
                        metrics::increment_scheduler_fires(KIND);
                    }
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({
                            "status": {
                                "phase": "Committed",
                                "message": serde_json::Value::Null,
                                "commitSha": sha,
                                "lastSync": now.to_rfc3339(),
                                "probeStatuses": probe_statuses,
                                "executionHistory": history,
                                "lastScheduledTime": last_scheduled,
                                "nextScheduledTime": next_scheduled,
                            }
                        }),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS))
                }
                Ok((_, ExecutionOutcome::PullRequest(..))) => {
                    unreachable!("a GitCommit intent never executes a pull request")
                }
                Err(ExecutionFailure::ProbesUnmet(probe_statuses)) => {
                    let message = probe_statuses
                        .last()
                        .map(|s| format!("probe '{}' condition not met", s.name));
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({"status": {"phase": "Pending", "message": message, "probeStatuses": probe_statuses}}),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_PROBE_UNMET_SECS))
                }
                Err(ExecutionFailure::Failed(e)) => {
                    error!(intent = %key, error = %e, "execution failed");
                    metrics::increment_reconciliation_errors(KIND, "execution_failed");
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({"status": {"phase": "Failed", "message": e.to_string()}}),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_EXECUTION_FAILURE_SECS))
                }
            }
        }
    };

    metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
    Ok(action)
}

pub async fn reconcile_pull_request(
    obj: Arc<PullRequest>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    const KIND: &str = "pullrequest";
    let _permit = ctx
        .worker_slots
        .acquire()
        .await
        .expect("worker semaphore is never closed");
    let start = std::time::Instant::now();
    let namespace = obj.namespace().ok_or(ReconcilerError::MissingNamespace)?;
    let name = obj.name_any();
    let key = format!("{namespace}/{name}");
    let generation = obj.metadata.generation;
    let creation_timestamp = obj.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let status = obj.status.clone().unwrap_or_default();
    let common = &obj.spec.common;
    let api: Api<PullRequest> = Api::namespaced(ctx.client.clone(), &namespace);
    let now = Utc::now();

    metrics::increment_reconciliations(KIND);
    info!(intent = %key, generation, "reconciling");

    let pre = match pre_check(
        common,
        status.phase,
        creation_timestamp,
        status.last_scheduled_time.as_deref(),
        status.next_scheduled_time.as_deref(),
        now,
    ) {
        Ok(p) => p,
        Err(e) => {
            warn!(intent = %key, error = %e, "invalid schedule expression");
            metrics::increment_reconciliation_errors(KIND, "invalid_spec");
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Failed", "message": e.to_string()}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            return Ok(Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS)));
        }
    };

    let action = match pre {
        PreCheck::Suspended => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Pending", "message": "schedule suspended"}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS))
        }
        PreCheck::Wait { next_scheduled_time } => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"nextScheduledTime": next_scheduled_time.to_rfc3339()}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;
            let delay = (next_scheduled_time - now)
                .to_std()
                .unwrap_or(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS));
            Action::requeue(delay)
        }
        PreCheck::TtlExpired => {
            if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
                warn!(intent = %key, error = %e, "failed to delete TTL-expired PullRequest");
            } else {
                info!(intent = %key, "deleted TTL-expired PullRequest");
            }
            Action::await_change()
        }
        PreCheck::TerminalShortCircuit => Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS)),
        PreCheck::Proceed => {
            patch_status_with_retry(
                &api,
                &name,
                json!({"status": {"phase": "Running", "observedGeneration": generation}}),
            )
            .await
            .map_err(ReconcilerError::StatusWrite)?;

            let intent_action = IntentAction::PullRequest {
                base_branch: &obj.spec.base_branch,
                head_branch: &obj.spec.head_branch,
                title: &obj.spec.title,
                body: obj.spec.body.as_deref(),
            };

            match execute_intent(&ctx, KIND, &namespace, common, &intent_action).await {
                Ok((probe_statuses, ExecutionOutcome::PullRequest(number, url))) => {
                    let mut history = status.execution_history.clone();
                    let mut last_scheduled = status.last_scheduled_time.clone();
                    let mut next_scheduled = status.next_scheduled_time.clone();
                    if let Some(expression) = &common.schedule {
                        scheduler::record_execution(
                            &mut history,
                            now,
                            Phase::Created,
                            Some(url.clone()),
                            None,
                            common.max_execution_history,
                        );
                        last_scheduled = Some(now.to_rfc3339());
                        next_scheduled = scheduler::next_fire_after(expression, now)
                            .ok()
                            .map(|t| t.to_rfc3339());
                        metrics::increment_scheduler_fires(KIND);
                    }
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({
                            "status": {
                                "phase": "Created",
                                "message": serde_json::Value::Null,
                                "pullRequestNumber": number,
                                "pullRequestUrl": url,
                                "lastSync": now.to_rfc3339(),
                                "probeStatuses": probe_statuses,
                                "executionHistory": history,
                                "lastScheduledTime": last_scheduled,
                                "nextScheduledTime": next_scheduled,
                            }
                        }),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_TERMINAL_POLL_SECS))
                }
                Ok((_, ExecutionOutcome::Commit(_))) => {
                    unreachable!("a PullRequest intent never executes a plain commit")
                }
                Err(ExecutionFailure::ProbesUnmet(probe_statuses)) => {
                    let message = probe_statuses
                        .last()
                        .map(|s| format!("probe '{}' condition not met", s.name));
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({"status": {"phase": "Pending", "message": message, "probeStatuses": probe_statuses}}),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_PROBE_UNMET_SECS))
                }
                Err(ExecutionFailure::Failed(e)) => {
                    error!(intent = %key, error = %e, "execution failed");
                    metrics::increment_reconciliation_errors(KIND, "execution_failed");
                    patch_status_with_retry(
                        &api,
                        &name,
                        json!({"status": {"phase": "Failed", "message": e.to_string()}}),
                    )
                    .await
                    .map_err(ReconcilerError::StatusWrite)?;
                    Action::requeue(Duration::from_secs(REQUEUE_EXECUTION_FAILURE_SECS))
                }
            }
        }
    };

    metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
    Ok(action)
}

/// Catch-all for errors that escape the classified state machine above
/// (e.g. the status write itself failing after its own retries) — these are
/// genuinely unexpected, so the shell just logs and backs off uniformly,
/// the same `error_policy` contract the teacher's own controller loop uses.
pub fn error_policy<K: kube::Resource>(
    obj: Arc<K>,
    error: &ReconcilerError,
    _ctx: Arc<ReconcilerContext>,
) -> Action
where
    K::DynamicType: Default,
{
    error!(name = %obj.name_any(), error = %error, "reconciliation error escaped the state machine");
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn common(schedule: Option<&str>, ttl_minutes: Option<u64>, suspend: bool) -> IntentCommonSpec {
        IntentCommonSpec {
            repository_url: "https://example.com/acme/widgets.git".to_string(),
            auth_ref: crate::AuthRef {
                secret_ref: crate::SecretKeyRef {
                    name: "creds".to_string(),
                    namespace: None,
                    key: None,
                },
            },
            files: vec![],
            projections: vec![],
            encryption: None,
            probes: vec![],
            ttl_minutes,
            schedule: schedule.map(str::to_string),
            suspend,
            max_execution_history: 10,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn terminal_phase_short_circuits_without_schedule() {
        let spec = common(None, None, false);
        let decision =
            pre_check(&spec, Phase::Committed, None, None, None, at(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(decision, PreCheck::TerminalShortCircuit);
    }

    #[test]
    fn ttl_expiry_is_checked_before_terminal_short_circuit() {
        let spec = common(None, Some(5), false);
        let created = at(2026, 1, 1, 0, 0);
        let now = at(2026, 1, 1, 0, 10);
        let decision = pre_check(&spec, Phase::Pending, Some(created), None, None, now).unwrap();
        assert_eq!(decision, PreCheck::TtlExpired);
    }

    #[test]
    fn ttl_not_yet_expired_proceeds() {
        let spec = common(None, Some(30), false);
        let created = at(2026, 1, 1, 0, 0);
        let now = at(2026, 1, 1, 0, 10);
        let decision = pre_check(&spec, Phase::Pending, Some(created), None, None, now).unwrap();
        assert_eq!(decision, PreCheck::Proceed);
    }

    #[test]
    fn schedule_takes_precedence_over_ttl() {
        // schedule set, suspend set: TTL would have expired but the
        // schedule branch returns before TTL is ever consulted.
        let spec = common(Some("@daily"), Some(1), true);
        let created = at(2026, 1, 1, 0, 0);
        let now = at(2026, 1, 1, 1, 0);
        let decision = pre_check(&spec, Phase::Pending, Some(created), None, None, now).unwrap();
        assert_eq!(decision, PreCheck::Suspended);
    }

    #[test]
    fn scheduled_terminal_phase_does_not_short_circuit() {
        // Committed/Failed short-circuit only applies when schedule is
        // unset; a scheduled intent re-executes on its own cadence.
        let spec = common(Some("@daily"), None, false);
        let now = at(2026, 1, 1, 0, 0);
        let decision = pre_check(&spec, Phase::Committed, None, None, None, now).unwrap();
        assert_eq!(decision, PreCheck::Proceed);
    }

    #[test]
    fn invalid_schedule_expression_surfaces_as_error() {
        let spec = common(Some("not a cron expression"), None, false);
        let err = pre_check(&spec, Phase::Pending, None, None, None, at(2026, 1, 1, 0, 0));
        assert!(err.is_err());
    }
}
