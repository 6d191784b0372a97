//! # Git Worker
//!
//! Clones a repository to a scratch workspace, materializes files,
//! commits with the fixed controller identity, and pushes — either
//! directly (`GitCommit`) or onto a new branch followed by a forge PR
//! (`PullRequest`). The workspace is a `tempfile::TempDir`: it is removed
//! on every exit path, including early returns and panics, the same
//! scoped-acquisition discipline the teacher applies to its artifact
//! download/extraction staging directories.

use anyhow::{bail, Context, Result};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository, Signature,
};
use octocrab::Octocrab;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use thiserror::Error;

use crate::constants::{COMMIT_AUTHOR_EMAIL, COMMIT_AUTHOR_NAME, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::credentials::GitCredentials;
use crate::projection::ProjectedFile;
use crate::{FileSpec, ProbeStatus, WriteMode};

#[derive(Debug, Error)]
pub enum GitWorkerError {
    #[error("file path '{0}' escapes the workspace root")]
    PathEscapesWorkspace(String),
    #[error("file path '{0}' is absolute or begins with '..'")]
    UnsafePath(String),
    #[error("push rejected as non-fast-forward")]
    NonFastForward,
    #[error("forge API call failed: {0}")]
    Forge(String),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single materialized file destined for the working tree, combining
/// literal `FileSpec` content, projection output, and probe-sourced
/// content under one shape so the commit path treats them uniformly.
pub struct MaterializedFile {
    pub path: String,
    pub content: Vec<u8>,
    pub write_mode: WriteMode,
}

pub struct GitWorker;

impl Default for GitWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl GitWorker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// `ExecuteCommit`: clone, checkout/create `branch`, write files,
    /// commit, push. Returns the new commit's SHA. `kind` labels the
    /// `git_push_duration_seconds` metric ("gitcommit"/"pullrequest").
    pub fn execute_commit(
        &self,
        kind: &str,
        repository_url: &str,
        branch: &str,
        commit_message: &str,
        creds: &GitCredentials,
        files: Vec<MaterializedFile>,
    ) -> Result<String> {
        let workspace = TempDir::new().context("creating scratch workspace")?;
        let started = std::time::Instant::now();
        let repo = clone_repository(repository_url, workspace.path(), creds)?;
        checkout_or_create_branch(&repo, branch)?;
        write_files(workspace.path(), &files)?;
        stage_all(&repo, &files)?;
        let commit_oid = commit(&repo, commit_message)?;
        // Commit flow does not retry with a pull on non-fast-forward; it
        // surfaces as a plain execution failure like any other push error.
        push(&repo, branch, creds)?;
        crate::observability::metrics::observe_git_push_duration(
            kind,
            started.elapsed().as_secs_f64(),
        );
        Ok(commit_oid.to_string())
    }

    /// `ExecutePullRequest`: clone, create `headBranch`, commit, push
    /// (tolerating non-fast-forward as "branch already exists upstream"),
    /// then open a PR against `baseBranch` via the forge API.
    pub async fn execute_pull_request(
        &self,
        kind: &str,
        repository_url: &str,
        base_branch: &str,
        head_branch: &str,
        title: &str,
        body: Option<&str>,
        creds: &GitCredentials,
        forge_token: &str,
        files: Vec<MaterializedFile>,
    ) -> Result<(i64, String)> {
        let workspace = TempDir::new().context("creating scratch workspace")?;
        let started = std::time::Instant::now();
        let repo = clone_repository(repository_url, workspace.path(), creds)?;
        checkout_or_create_branch(&repo, head_branch)?;
        write_files(workspace.path(), &files)?;
        stage_all(&repo, &files)?;
        let commit_message = format!("Changes for PR: {title}");
        commit(&repo, &commit_message)?;

        match push(&repo, head_branch, creds) {
            Ok(()) => {}
            Err(e) => {
                if matches!(
                    e.downcast_ref::<GitWorkerError>(),
                    Some(GitWorkerError::NonFastForward)
                ) {
                    tracing::info!(
                        branch = head_branch,
                        "non-fast-forward push tolerated for PR flow, branch already carries a head"
                    );
                } else {
                    return Err(e);
                }
            }
        }
        crate::observability::metrics::observe_git_push_duration(
            kind,
            started.elapsed().as_secs_f64(),
        );

        let (owner, repo_name) = parse_owner_repo(repository_url)?;
        open_pull_request(
            forge_token,
            &owner,
            &repo_name,
            title,
            body.unwrap_or_default(),
            head_branch,
            base_branch,
        )
        .await
    }
}

/// Resolve the final materialized-file list for one execution: literal
/// `FileSpec`s (optionally sourced from probe output), then projection
/// output, in declared order (§5).
///
/// When `useProbeData` is set and `probeName` names one probe, that
/// probe's `formattedOutput` becomes the file content. When `probeName`
/// is absent, every probe's `formattedOutput` is joined with
/// `probeJoinDelimiter`, in declared probe order.
pub fn merge_files(
    file_specs: &[FileSpec],
    probe_statuses: &[ProbeStatus],
    projected: Vec<ProjectedFile>,
) -> Result<Vec<MaterializedFile>> {
    let mut out = Vec::with_capacity(file_specs.len() + projected.len());
    for spec in file_specs {
        validate_path(&spec.path)?;
        let content = if spec.use_probe_data {
            content_from_probes(spec, probe_statuses)?
        } else {
            spec.content.clone().unwrap_or_default()
        };
        out.push(MaterializedFile {
            path: spec.path.clone(),
            content: content.into_bytes(),
            write_mode: spec.write_mode,
        });
    }
    for file in projected {
        validate_path(&file.path)?;
        out.push(MaterializedFile {
            path: file.path,
            content: file.content,
            write_mode: file.write_mode,
        });
    }
    Ok(out)
}

fn content_from_probes(spec: &FileSpec, probe_statuses: &[ProbeStatus]) -> Result<String> {
    if let Some(name) = &spec.probe_name {
        let status = probe_statuses
            .iter()
            .find(|s| &s.name == name)
            .with_context(|| format!("file '{}' references unknown probe '{name}'", spec.path))?;
        if !status.condition_met {
            bail!(
                "file '{}' requires probe '{name}' but its condition was not met",
                spec.path
            );
        }
        Ok(status.formatted_output.clone().unwrap_or_default())
    } else {
        if probe_statuses.iter().any(|s| !s.condition_met) {
            bail!(
                "file '{}' uses probe data but not every probe's condition was met",
                spec.path
            );
        }
        Ok(probe_statuses
            .iter()
            .map(|s| s.formatted_output.clone().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(&spec.probe_join_delimiter))
    }
}

/// Rejects absolute paths, `..` traversal, and anything that would not
/// resolve inside the workspace root once joined.
pub fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(GitWorkerError::UnsafePath(path.to_string()).into());
    }
    for component in Path::new(path).components() {
        match component {
            std::path::Component::ParentDir => {
                return Err(GitWorkerError::UnsafePath(path.to_string()).into())
            }
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {
                return Err(GitWorkerError::UnsafePath(path.to_string()).into())
            }
            _ => {}
        }
    }
    Ok(())
}

fn resolve_in_workspace(workspace_root: &Path, path: &str) -> Result<PathBuf> {
    validate_path(path)?;
    let joined = workspace_root.join(path);
    let canonical_root = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());
    if let Some(parent) = joined.parent() {
        fs::create_dir_all(parent)?;
        set_dir_mode(parent);
    }
    let canonical_parent = joined
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| joined.clone());
    if !canonical_parent.starts_with(&canonical_root) {
        return Err(GitWorkerError::PathEscapesWorkspace(path.to_string()).into());
    }
    Ok(joined)
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(dir) {
        let mut perms = metadata.permissions();
        perms.set_mode(DEFAULT_DIR_MODE);
        let _ = fs::set_permissions(dir, perms);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path) {}

#[cfg(unix)]
fn set_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(DEFAULT_FILE_MODE);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) {}

fn write_files(workspace_root: &Path, files: &[MaterializedFile]) -> Result<()> {
    for file in files {
        let target = resolve_in_workspace(workspace_root, &file.path)?;
        match file.write_mode {
            WriteMode::Overwrite => {
                fs::write(&target, &file.content)?;
            }
            WriteMode::Append => {
                if target.exists() {
                    let existing = fs::read(&target)?;
                    let mut combined = existing;
                    combined.push(b'\n');
                    combined.extend_from_slice(&file.content);
                    fs::write(&target, combined)?;
                } else {
                    fs::write(&target, &file.content)?;
                }
            }
        }
        set_file_mode(&target);
    }
    Ok(())
}

fn remote_callbacks(creds: &GitCredentials) -> RemoteCallbacks<'static> {
    let username = creds.username.clone();
    let token = creds.token.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed| {
        Cred::userpass_plaintext(&username, &token)
    });
    callbacks
}

fn clone_repository(url: &str, dest: &Path, creds: &GitCredentials) -> Result<Repository> {
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(creds));

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);

    builder
        .clone(url, dest)
        .with_context(|| format!("cloning {url}"))
}

fn checkout_or_create_branch(repo: &Repository, branch: &str) -> Result<()> {
    let is_default = branch == "main" || branch == "master";
    if is_default {
        let head = repo.head().context("resolving HEAD")?;
        if head.is_branch() && head.shorthand() == Some(branch) {
            return Ok(());
        }
    }

    let head_commit = repo.head()?.peel_to_commit()?;

    match repo.branch(branch, &head_commit, false) {
        Ok(_) => {}
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            let reference = repo
                .find_branch(branch, git2::BranchType::Local)
                .context("finding existing branch")?
                .into_reference();
            reference
                .set_target(head_commit.id(), "reset branch to current HEAD")
                .context("resetting existing branch to HEAD")?;
        }
        Err(e) => return Err(e.into()),
    }

    let ref_name = format!("refs/heads/{branch}");
    repo.set_head(&ref_name)
        .with_context(|| format!("setting HEAD to {ref_name}"))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))
        .context("checking out branch")?;
    Ok(())
}

fn stage_all(repo: &Repository, files: &[MaterializedFile]) -> Result<()> {
    let mut index = repo.index()?;
    for file in files {
        index.add_path(Path::new(&file.path))?;
    }
    index.write()?;
    Ok(())
}

fn commit(repo: &Repository, message: &str) -> Result<git2::Oid> {
    let mut index = repo.index()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let signature = author_signature()?;

    let parent = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    let oid = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )?;
    Ok(oid)
}

fn author_signature() -> Result<Signature<'static>> {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let time = git2::Time::new(now.as_secs() as i64, 0);
    Ok(Signature::new(COMMIT_AUTHOR_NAME, COMMIT_AUTHOR_EMAIL, &time)?)
}

fn push(repo: &Repository, branch: &str, creds: &GitCredentials) -> Result<()> {
    let mut remote = repo.find_remote("origin")?;

    // git2 reports a rejected ref update (e.g. non-fast-forward) through
    // `push_update_reference`, not through `Remote::push`'s own Result —
    // that only fails for transport-level errors.
    let rejection = std::sync::Arc::new(std::sync::Mutex::new(None::<String>));
    let rejection_sink = std::sync::Arc::clone(&rejection);

    let mut callbacks = remote_callbacks(creds);
    callbacks.push_update_reference(move |_refname, status| {
        if let Some(message) = status {
            *rejection_sink.lock().expect("rejection mutex poisoned") = Some(message.to_string());
        }
        Ok(())
    });

    let mut push_options = PushOptions::new();
    push_options.remote_callbacks(callbacks);

    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut push_options))
        .map_err(|e| {
            if e.message().contains("non-fast-forward") {
                anyhow::Error::new(GitWorkerError::NonFastForward)
            } else {
                anyhow::Error::new(e)
            }
        })?;

    if let Some(message) = rejection.lock().expect("rejection mutex poisoned").take() {
        if message.contains("non-fast-forward") || message.contains("fetch first") {
            return Err(GitWorkerError::NonFastForward.into());
        }
        bail!("push to '{branch}' rejected: {message}");
    }
    Ok(())
}

fn parse_owner_repo(repository_url: &str) -> Result<(String, String)> {
    let trimmed = repository_url
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let parts: Vec<&str> = trimmed
        .rsplit('/')
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    match parts.as_slice() {
        [owner, repo] => Ok(((*owner).to_string(), (*repo).to_string())),
        _ => bail!("could not parse owner/repo from '{repository_url}'"),
    }
}

async fn open_pull_request(
    token: &str,
    owner: &str,
    repo: &str,
    title: &str,
    body: &str,
    head: &str,
    base: &str,
) -> Result<(i64, String)> {
    let octocrab = Octocrab::builder()
        .personal_token(token.to_string())
        .build()
        .context("building forge API client")?;

    let pr = octocrab
        .pulls(owner, repo)
        .create(title, head, base)
        .body(body)
        .maintainer_can_modify(true)
        .send()
        .await
        .map_err(|e| map_forge_error(e))?;

    let url = pr
        .html_url
        .map(|u| u.to_string())
        .unwrap_or_else(|| format!("https://github.com/{owner}/{repo}/pull/{}", pr.number));

    Ok((pr.number as i64, url))
}

fn map_forge_error(err: octocrab::Error) -> anyhow::Error {
    if let octocrab::Error::GitHub { source, .. } = &err {
        if source.message.to_lowercase().contains("permission")
            || source.message.contains("403")
        {
            return GitWorkerError::Forge(format!(
                "forge rejected PR creation due to insufficient permissions: {}",
                source.message
            ))
            .into();
        }
    }
    GitWorkerError::Forge(err.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_path_rejects_absolute_and_traversal() {
        assert!(validate_path("config/a.txt").is_ok());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("../escape.txt").is_err());
        assert!(validate_path("config/../../escape.txt").is_err());
    }

    #[test]
    fn parse_owner_repo_handles_dot_git_suffix() {
        let (owner, repo) = parse_owner_repo("https://example.com/acme/widgets.git").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }

    #[test]
    fn parse_owner_repo_handles_trailing_slash() {
        let (owner, repo) = parse_owner_repo("https://example.com/acme/widgets/").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
    }

    fn probe_status(name: &str, formatted: &str, condition_met: bool) -> ProbeStatus {
        ProbeStatus {
            name: name.to_string(),
            call_count: 1,
            success_count: u64::from(condition_met),
            last_call_time: None,
            last_status_code: Some(200),
            last_response: None,
            last_error: None,
            condition_met,
            extracted_data: vec![],
            formatted_output: Some(formatted.to_string()),
        }
    }

    #[test]
    fn merge_files_rejects_traversal_before_any_io() {
        let specs = vec![FileSpec {
            path: "../escape.txt".to_string(),
            content: Some("x".to_string()),
            use_probe_data: false,
            probe_name: None,
            probe_join_delimiter: "\n".to_string(),
            write_mode: WriteMode::Overwrite,
        }];
        let result = merge_files(&specs, &[], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn merge_files_sources_content_from_named_probe() {
        let specs = vec![FileSpec {
            path: "status.txt".to_string(),
            content: None,
            use_probe_data: true,
            probe_name: Some("p".to_string()),
            probe_join_delimiter: "\n".to_string(),
            write_mode: WriteMode::Overwrite,
        }];
        let statuses = vec![probe_status("p", "ok", true)];
        let files = merge_files(&specs, &statuses, vec![]).unwrap();
        assert_eq!(files[0].content, b"ok");
    }

    #[test]
    fn merge_files_joins_all_probes_when_unnamed() {
        let specs = vec![FileSpec {
            path: "status.txt".to_string(),
            content: None,
            use_probe_data: true,
            probe_name: None,
            probe_join_delimiter: ", ".to_string(),
            write_mode: WriteMode::Overwrite,
        }];
        let statuses = vec![probe_status("a", "one", true), probe_status("b", "two", true)];
        let files = merge_files(&specs, &statuses, vec![]).unwrap();
        assert_eq!(files[0].content, b"one, two");
    }

    #[test]
    fn merge_files_errors_when_probe_condition_unmet() {
        let specs = vec![FileSpec {
            path: "status.txt".to_string(),
            content: None,
            use_probe_data: true,
            probe_name: Some("p".to_string()),
            probe_join_delimiter: "\n".to_string(),
            write_mode: WriteMode::Overwrite,
        }];
        let statuses = vec![probe_status("p", "nope", false)];
        let result = merge_files(&specs, &statuses, vec![]);
        assert!(result.is_err());
    }
}
