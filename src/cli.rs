//! # gcoctl CLI
//!
//! Command-line interface for the Git Change Operator. Lets an operator
//! trigger an out-of-cycle reconciliation, list intents, inspect one
//! intent's status, or toggle `suspend` on a scheduled intent without
//! editing the manifest.
//!
//! ```bash
//! gcoctl reconcile --kind git-commit --namespace default --name nightly-sync
//! gcoctl list --kind pull-request
//! gcoctl status --kind git-commit --namespace default --name nightly-sync
//! gcoctl suspend --kind pull-request --namespace default --name weekly-deps --value true
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

use git_change_operator::{GitCommit, Phase, PullRequest};

/// Which intent kind a command operates on.
#[derive(Copy, Clone, Debug, ValueEnum)]
enum Kind {
    GitCommit,
    PullRequest,
}

#[derive(Parser)]
#[command(name = "gcoctl")]
#[command(about = "Git Change Operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace (defaults to "default")
    #[arg(short, long, global = true)]
    namespace: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger an out-of-cycle reconciliation by bumping an annotation
    Reconcile {
        #[arg(short, long, value_enum)]
        kind: Kind,
        #[arg(short = 'N', long)]
        name: String,
    },
    /// List intents of one kind
    List {
        #[arg(short, long, value_enum)]
        kind: Kind,
    },
    /// Show the status of one intent
    Status {
        #[arg(short, long, value_enum)]
        kind: Kind,
        #[arg(short = 'N', long)]
        name: String,
    },
    /// Set (or clear) `spec.suspend` on a scheduled intent
    Suspend {
        #[arg(short, long, value_enum)]
        kind: Kind,
        #[arg(short = 'N', long)]
        name: String,
        #[arg(long)]
        value: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gcoctl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let namespace = cli.namespace.unwrap_or_else(|| "default".to_string());

    let client = Client::try_default()
        .await
        .context("creating Kubernetes client; is KUBECONFIG configured?")?;

    match cli.command {
        Commands::Reconcile { kind, name } => reconcile_command(client, kind, &namespace, &name).await,
        Commands::List { kind } => list_command(client, kind, &namespace).await,
        Commands::Status { kind, name } => status_command(client, kind, &namespace, &name).await,
        Commands::Suspend { kind, name, value } => {
            suspend_command(client, kind, &namespace, &name, value).await
        }
    }
}

fn timestamp_annotation() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

async fn reconcile_command(client: Client, kind: Kind, namespace: &str, name: &str) -> Result<()> {
    let patch = json!({
        "metadata": {
            "annotations": {
                "git.microscaler.io/reconcile": timestamp_annotation()
            }
        }
    });
    let params = PatchParams::apply("gcoctl").force();

    match kind {
        Kind::GitCommit => {
            let api: Api<GitCommit> = Api::namespaced(client, namespace);
            api.patch(name, &params, &Patch::Merge(patch))
                .await
                .with_context(|| format!("triggering reconciliation for GitCommit {namespace}/{name}"))?;
        }
        Kind::PullRequest => {
            let api: Api<PullRequest> = Api::namespaced(client, namespace);
            api.patch(name, &params, &Patch::Merge(patch))
                .await
                .with_context(|| format!("triggering reconciliation for PullRequest {namespace}/{name}"))?;
        }
    }

    println!("reconciliation triggered for {namespace}/{name}");
    Ok(())
}

async fn list_command(client: Client, kind: Kind, namespace: &str) -> Result<()> {
    println!("{:<30} {:<10} {:<12}", "NAME", "PHASE", "AGE-GEN");
    println!("{}", "-".repeat(54));
    match kind {
        Kind::GitCommit => {
            let api: Api<GitCommit> = Api::namespaced(client, namespace);
            let list = api.list(&ListParams::default()).await.context("listing GitCommit resources")?;
            for item in list.items {
                let name = item.metadata.name.as_deref().unwrap_or("<unknown>");
                let phase = item.status.as_ref().map(|s| s.phase).unwrap_or(Phase::Pending);
                let generation = item.metadata.generation.unwrap_or(0);
                println!("{name:<30} {phase:<10?} {generation:<12}");
            }
        }
        Kind::PullRequest => {
            let api: Api<PullRequest> = Api::namespaced(client, namespace);
            let list = api.list(&ListParams::default()).await.context("listing PullRequest resources")?;
            for item in list.items {
                let name = item.metadata.name.as_deref().unwrap_or("<unknown>");
                let phase = item.status.as_ref().map(|s| s.phase).unwrap_or(Phase::Pending);
                let generation = item.metadata.generation.unwrap_or(0);
                println!("{name:<30} {phase:<10?} {generation:<12}");
            }
        }
    }
    Ok(())
}

async fn status_command(client: Client, kind: Kind, namespace: &str, name: &str) -> Result<()> {
    match kind {
        Kind::GitCommit => {
            let api: Api<GitCommit> = Api::namespaced(client, namespace);
            let item = api.get(name).await.with_context(|| format!("getting GitCommit {namespace}/{name}"))?;
            println!("GitCommit {namespace}/{name}");
            println!("  generation: {}", item.metadata.generation.unwrap_or(0));
            println!("  repositoryUrl: {}", item.spec.common.repository_url);
            println!("  branch: {}", item.spec.branch);
            match item.status {
                Some(status) => {
                    println!("  phase: {:?}", status.phase);
                    println!("  observedGeneration: {:?}", status.observed_generation);
                    if let Some(sha) = &status.commit_sha {
                        println!("  commitSha: {sha}");
                    }
                    if let Some(message) = &status.message {
                        println!("  message: {message}");
                    }
                    if let Some(next) = &status.next_scheduled_time {
                        println!("  nextScheduledTime: {next}");
                    }
                }
                None => println!("  status: not yet reconciled"),
            }
        }
        Kind::PullRequest => {
            let api: Api<PullRequest> = Api::namespaced(client, namespace);
            let item = api.get(name).await.with_context(|| format!("getting PullRequest {namespace}/{name}"))?;
            println!("PullRequest {namespace}/{name}");
            println!("  generation: {}", item.metadata.generation.unwrap_or(0));
            println!("  repositoryUrl: {}", item.spec.common.repository_url);
            println!("  headBranch -> baseBranch: {} -> {}", item.spec.head_branch, item.spec.base_branch);
            match item.status {
                Some(status) => {
                    println!("  phase: {:?}", status.phase);
                    println!("  observedGeneration: {:?}", status.observed_generation);
                    if let Some(url) = &status.pull_request_url {
                        println!("  pullRequestUrl: {url}");
                    }
                    if let Some(message) = &status.message {
                        println!("  message: {message}");
                    }
                    if let Some(next) = &status.next_scheduled_time {
                        println!("  nextScheduledTime: {next}");
                    }
                }
                None => println!("  status: not yet reconciled"),
            }
        }
    }
    Ok(())
}

async fn suspend_command(client: Client, kind: Kind, namespace: &str, name: &str, value: bool) -> Result<()> {
    let patch = json!({"spec": {"suspend": value}});
    let params = PatchParams::apply("gcoctl");

    match kind {
        Kind::GitCommit => {
            let api: Api<GitCommit> = Api::namespaced(client, namespace);
            api.patch(name, &params, &Patch::Merge(patch))
                .await
                .with_context(|| format!("setting suspend={value} on GitCommit {namespace}/{name}"))?;
        }
        Kind::PullRequest => {
            let api: Api<PullRequest> = Api::namespaced(client, namespace);
            api.patch(name, &params, &Patch::Merge(patch))
                .await
                .with_context(|| format!("setting suspend={value} on PullRequest {namespace}/{name}"))?;
        }
    }

    println!("suspend set to {value} for {namespace}/{name}");
    Ok(())
}
