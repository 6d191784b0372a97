//! # CRD Generator
//!
//! Generates Kubernetes CustomResourceDefinition YAML for `GitCommit` and
//! `PullRequest` from their Rust type definitions, via `kube`'s
//! `CustomResourceExt` trait.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/bases/git.microscaler.io_gitcommits.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```
//!
//! Both CRDs are printed to stdout, separated by a YAML document marker.

use kube::core::CustomResourceExt;

use git_change_operator::{GitCommit, PullRequest};

fn main() {
    let git_commit_crd = GitCommit::crd();
    let pull_request_crd = PullRequest::crd();

    print!(
        "{}",
        serde_yaml::to_string(&git_commit_crd).expect("GitCommit CRD always serializes to YAML")
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&pull_request_crd)
            .expect("PullRequest CRD always serializes to YAML")
    );
}
