//! # Git Change Operator
//!
//! A Kubernetes controller that turns declared intent into real Git history:
//!
//! 1. **`GitCommit`** - materializes files (literal content, probe output,
//!    projected cluster objects, optionally encrypted) and pushes a commit
//!    directly to a branch.
//! 2. **`PullRequest`** - does the same, but opens a pull request against a
//!    forge (GitHub/GitLab/Gitea) instead of pushing straight to the base
//!    branch.
//!
//! Both kinds share the same gating (HTTP probes with policy expressions),
//! scheduling (cron expressions, TTL expiry), and credential/encryption
//! machinery; only the final Git operation differs. See `reconciler` for the
//! shared state machine.
//!
//! ## Features
//!
//! - **Probe-gated execution**: an intent only runs once its configured HTTP
//!   probes report their condition met.
//! - **Cron scheduling**: optional `schedule` field drives periodic
//!   re-execution instead of run-once-then-idle.
//! - **Selective file encryption**: `age` envelope encryption for files
//!   matching a configured pattern before they're committed.
//! - **Prometheus metrics**: exposes metrics for monitoring and observability.
//! - **Health probes**: HTTP endpoints for liveness and readiness checks.

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{api::Api, Client};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use tracing::{error, info};

use git_change_operator::constants::DEFAULT_CONTROLLER_CONCURRENCY;
use git_change_operator::observability::{metrics, otel};
use git_change_operator::reconciler::{self, ReconcilerContext};
use git_change_operator::server::{start_server, ServerState};
use git_change_operator::{GitCommit, PullRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let otel_tracer_provider = otel::init_otel().context("initializing OpenTelemetry")?;

    if otel_tracer_provider.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "git_change_operator=info".into()),
            )
            .init();
    }

    info!("starting Git Change Operator");

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    let server_state_clone = Arc::clone(&server_state);
    let server_port = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);

    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!(error = %e, "HTTP server error");
        }
    });

    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;

    let concurrency = std::env::var("CONTROLLER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CONTROLLER_CONCURRENCY as usize);

    let ctx = Arc::new(ReconcilerContext::new(client.clone(), concurrency));

    let git_commits: Api<GitCommit> = Api::all(client.clone());
    let pull_requests: Api<PullRequest> = Api::all(client.clone());

    server_state
        .is_ready
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let git_commit_controller = Controller::new(git_commits, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconciler::reconcile_git_commit,
            reconciler::error_policy,
            Arc::clone(&ctx),
        )
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = %e, "GitCommit reconciliation error escaped the controller loop");
            }
        });

    let pull_request_controller = Controller::new(pull_requests, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconciler::reconcile_pull_request,
            reconciler::error_policy,
            Arc::clone(&ctx),
        )
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = %e, "PullRequest reconciliation error escaped the controller loop");
            }
        });

    tokio::join!(git_commit_controller, pull_request_controller);

    info!("controller stopped");

    otel::shutdown_otel(otel_tracer_provider);

    Ok(())
}
