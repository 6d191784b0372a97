//! # CRD Validation Tests
//!
//! Comprehensive tests for the `GitCommit` and `PullRequest` CRD elements,
//! to catch schema drift early. These validate that realistic manifests
//! deserialize correctly and that every field lands where the spec says it
//! should, without going anywhere near a live cluster.

use git_change_operator::{
    EncryptionSpec, GitCommitSpec, ProjectionStrategy, PullRequestSpec, RecipientType, WriteMode,
};

#[test]
fn git_commit_minimal_manifest_deserializes() {
    let yaml = r#"
repositoryUrl: https://example.com/acme/widgets.git
authRef:
  secretRef:
    name: git-creds
branch: main
commitMessage: "chore: sync config"
files:
  - path: config/a.txt
    content: "hello\n"
"#;
    let spec: GitCommitSpec = serde_yaml::from_str(yaml).expect("minimal GitCommit deserializes");
    assert_eq!(spec.common.repository_url, "https://example.com/acme/widgets.git");
    assert_eq!(spec.branch, "main");
    assert_eq!(spec.common.files.len(), 1);
    assert_eq!(spec.common.files[0].path, "config/a.txt");
    assert_eq!(spec.common.files[0].write_mode, WriteMode::Overwrite);
    assert_eq!(spec.common.max_execution_history, 10);
    assert!(!spec.common.suspend);
    assert!(spec.common.schedule.is_none());
}

#[test]
fn git_commit_full_manifest_round_trips_every_field() {
    let yaml = r#"
repositoryUrl: https://example.com/acme/widgets.git
authRef:
  secretRef:
    name: git-creds
    namespace: ops
    key: token
branch: release
commitMessage: "automated sync"
suspend: false
schedule: "*/15 * * * *"
maxExecutionHistory: 25
ttlMinutes: 1440
files:
  - path: reports/status.txt
    useProbeData: true
    probeName: health
    probeJoinDelimiter: "; "
    writeMode: append
projections:
  - resourceRef:
      apiVersion: v1
      kind: ConfigMap
      name: app-config
      namespace: default
    strategy: fields
    strategyPath: configs/
    writeMode: overwrite
encryption:
  enabled: true
  fileExtension: ".age"
  recipients:
    - type: age
      value: age1qqr9z0c27... # placeholder public key literal
    - type: ssh
      secretRef:
        name: ssh-recipient
        key: publicKey
probes:
  - name: health
    url: https://status.example.com/health
    method: GET
    timeoutSeconds: 10
    expectedStatusCodes: [200, 204]
    responseParsing:
      condition: "status == 'ok'"
      dataExpression: "status"
      outputFormat: "string(status)"
"#;
    let spec: GitCommitSpec = serde_yaml::from_str(yaml).expect("full GitCommit deserializes");
    let common = &spec.common;

    assert_eq!(common.auth_ref.secret_ref.namespace.as_deref(), Some("ops"));
    assert_eq!(common.auth_ref.secret_ref.key.as_deref(), Some("token"));
    assert_eq!(common.schedule.as_deref(), Some("*/15 * * * *"));
    assert_eq!(common.max_execution_history, 25);
    assert_eq!(common.ttl_minutes, Some(1440));

    assert_eq!(common.files[0].write_mode, WriteMode::Append);
    assert!(common.files[0].use_probe_data);
    assert_eq!(common.files[0].probe_name.as_deref(), Some("health"));
    assert_eq!(common.files[0].probe_join_delimiter, "; ");

    assert_eq!(common.projections[0].strategy, ProjectionStrategy::Fields);
    assert_eq!(common.projections[0].strategy_path, "configs/");

    let enc: &EncryptionSpec = common.encryption.as_ref().expect("encryption present");
    assert!(enc.enabled);
    assert_eq!(enc.file_extension, ".age");
    assert_eq!(enc.recipients.len(), 2);
    assert_eq!(enc.recipients[0].recipient_type, RecipientType::Age);
    assert_eq!(enc.recipients[1].recipient_type, RecipientType::Ssh);
    assert_eq!(enc.recipients[1].secret_ref.as_ref().unwrap().name, "ssh-recipient");

    assert_eq!(common.probes.len(), 1);
    let probe = &common.probes[0];
    assert_eq!(probe.expected_status_codes, vec![200, 204]);
    let policy = probe.response_parsing.as_ref().expect("responseParsing present");
    assert_eq!(policy.condition.as_deref(), Some("status == 'ok'"));
}

#[test]
fn pull_request_manifest_deserializes_with_base_and_head_branch() {
    let yaml = r#"
repositoryUrl: https://example.com/acme/widgets.git
authRef:
  secretRef:
    name: git-creds
baseBranch: main
headBranch: automated/nightly-sync
title: "Nightly dependency sync"
body: "Opened automatically by the nightly schedule."
schedule: "@daily"
files:
  - path: deps/lock.json
    content: "{}"
"#;
    let spec: PullRequestSpec = serde_yaml::from_str(yaml).expect("PullRequest deserializes");
    assert_eq!(spec.base_branch, "main");
    assert_eq!(spec.head_branch, "automated/nightly-sync");
    assert_eq!(spec.title, "Nightly dependency sync");
    assert_eq!(spec.common.schedule.as_deref(), Some("@daily"));
}

#[test]
fn single_field_projection_deserializes_with_field_key() {
    let yaml = r#"
resourceRef:
  apiVersion: v1
  kind: Secret
  name: app-secret
strategy: single-field
strategyPath: logs/all.log
fieldKey: log
writeMode: append
"#;
    let projection: git_change_operator::ProjectionSpec =
        serde_yaml::from_str(yaml).expect("singleField projection deserializes");
    assert_eq!(projection.strategy, ProjectionStrategy::SingleField);
    assert_eq!(projection.field_key.as_deref(), Some("log"));
    assert_eq!(projection.write_mode, WriteMode::Append);
}

#[test]
fn unknown_write_mode_fails_to_deserialize() {
    let yaml = r#"
path: a.txt
content: "x"
writeMode: merge
"#;
    let result: Result<git_change_operator::FileSpec, _> = serde_yaml::from_str(yaml);
    assert!(result.is_err(), "writeMode: merge is not a valid variant");
}

#[test]
fn recipient_type_is_case_sensitive_lowercase_on_the_wire() {
    let yaml = r#"
type: Age
value: "age1..."
"#;
    let result: Result<git_change_operator::Recipient, _> = serde_yaml::from_str(yaml);
    assert!(result.is_err(), "recipient type is serialized lowercase, not PascalCase");
}
