//! Git Change Operator Library
//!
//! Core types and subsystems for a controller that reconciles `GitCommit` and
//! `PullRequest` custom resources into real commits and pull requests.
//! Tests are included alongside the module files they cover.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod constants;
pub mod credentials;
pub mod encryption;
pub mod git;
pub mod observability;
pub mod policy;
pub mod probe;
pub mod projection;
pub mod reconciler;
pub mod scheduler;
pub mod server;

/// Reference to a namespaced Kubernetes Secret plus the key to read from it.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Credential reference used for Git auth and probe bearer tokens.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthRef {
    pub secret_ref: SecretKeyRef,
}

/// File write semantics shared by FileSpec and ProjectionSpec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// A literal file to materialize in the target repository.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Repo-relative destination path. No leading "/", no "..".
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub use_probe_data: bool,
    #[serde(default)]
    pub probe_name: Option<String>,
    #[serde(default = "default_join_delimiter")]
    pub probe_join_delimiter: String,
    #[serde(default)]
    pub write_mode: WriteMode,
}

fn default_join_delimiter() -> String {
    "\n".to_string()
}

/// Strategy for rendering a referenced cluster object into file(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectionStrategy {
    Dump,
    Fields,
    SingleField,
}

/// Reference to an arbitrary cluster object to project into file content.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSpec {
    pub resource_ref: ResourceRef,
    pub strategy: ProjectionStrategy,
    pub strategy_path: String,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub field_key: Option<String>,
    #[serde(default)]
    pub field_file_name: Option<String>,
}

/// Recipient type for the encryption layer. Each variant can open the
/// envelope independently of the others (disjunctive access).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    Age,
    Ssh,
    Passphrase,
    Yubikey,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(rename = "type")]
    pub recipient_type: RecipientType,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_encryption_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

fn default_encryption_extension() -> String {
    ".age".to_string()
}

/// A boolean/string expression trio evaluated against a probe's JSON body.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub data_expression: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    /// Legacy field-path mode: a single dotted/indexed path extracted
    /// verbatim instead of evaluating an expression.
    #[serde(default)]
    pub field_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub name: String,
    pub url: String,
    #[serde(default = "default_probe_method")]
    pub method: String,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth_ref: Option<AuthRef>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub expected_status_codes: Vec<u16>,
    #[serde(default = "default_max_status_code")]
    pub max_status_code: u16,
    #[serde(default)]
    pub response_parsing: Option<PolicySpec>,
}

fn default_probe_method() -> String {
    "GET".to_string()
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_max_status_code() -> u16 {
    399
}

fn default_max_execution_history() -> i32 {
    10
}

/// Fields common to both GitCommit and PullRequest specs. Flattened into
/// each concrete CRD spec rather than shared via a Rust enum, since `kube`
/// derives one concrete type per custom resource kind.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentCommonSpec {
    pub repository_url: String,
    pub auth_ref: AuthRef,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub projections: Vec<ProjectionSpec>,
    #[serde(default)]
    pub encryption: Option<EncryptionSpec>,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
    #[serde(default)]
    pub ttl_minutes: Option<u64>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_max_execution_history")]
    pub max_execution_history: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Committed,
    Created,
    Failed,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub name: String,
    #[serde(default)]
    pub call_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub last_call_time: Option<String>,
    #[serde(default)]
    pub last_status_code: Option<u16>,
    #[serde(default)]
    pub last_response: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub condition_met: bool,
    #[serde(default)]
    pub extracted_data: Vec<String>,
    #[serde(default)]
    pub formatted_output: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_time: String,
    #[serde(default)]
    pub outcome: Option<String>,
    pub phase: Phase,
    #[serde(default)]
    pub message: Option<String>,
}

/// `GitCommit` — direct-push intent.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "git.microscaler.io",
    version = "v1",
    kind = "GitCommit",
    namespaced,
    status = "GitCommitStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.commitSha"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitSpec {
    #[serde(flatten)]
    pub common: IntentCommonSpec,
    pub branch: String,
    pub commit_message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub probe_statuses: Vec<ProbeStatus>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub last_scheduled_time: Option<String>,
    #[serde(default)]
    pub next_scheduled_time: Option<String>,
}

/// `PullRequest` — branch + forge pull-request intent.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "git.microscaler.io",
    version = "v1",
    kind = "PullRequest",
    namespaced,
    status = "PullRequestStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PR", "type":"string", "jsonPath":".status.pullRequestUrl"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSpec {
    #[serde(flatten)]
    pub common: IntentCommonSpec,
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub pull_request_number: Option<i64>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub probe_statuses: Vec<ProbeStatus>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub last_scheduled_time: Option<String>,
    #[serde(default)]
    pub next_scheduled_time: Option<String>,
}

/// Common surface the reconciler core needs regardless of which intent
/// kind it is driving. Implemented by both `GitCommitSpec` and
/// `PullRequestSpec` via thin accessor methods on their owning types.
pub trait IntentLike {
    fn common(&self) -> &IntentCommonSpec;
}

impl IntentLike for GitCommitSpec {
    fn common(&self) -> &IntentCommonSpec {
        &self.common
    }
}

impl IntentLike for PullRequestSpec {
    fn common(&self) -> &IntentCommonSpec {
        &self.common
    }
}
