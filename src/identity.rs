//! Release identity derivation.
//!
//! A release name is either supplied verbatim or derived from the repository
//! that produced the deployment. Derivation is a pure function of its inputs so
//! a replayed run always lands on the same release.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::InputError;

/// Helm refuses release names longer than this.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Branches that map to the stable release of a repository.
const STABLE_BRANCHES: [&str; 2] = ["main", "master"];

static NON_ALNUM_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

/// Resolved name of the release a run operates on.
///
/// Doubles as the deduplication key for run admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseIdentity {
    name: String,
}

impl ReleaseIdentity {
    /// Use an explicit release name. The name is trimmed but otherwise kept as given.
    pub fn explicit(name: &str) -> Result<Self, InputError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(InputError::EmptyReleaseName);
        }
        check_length(name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReleaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for ReleaseIdentity {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Source-control coordinates a release name can be derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIdentifiers {
    pub org: String,
    pub repo: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

impl SourceIdentifiers {
    pub fn new(org: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            branch: branch.into(),
            pr_number: None,
        }
    }

    /// Attach a pull-request number. `0` means "no pull request".
    pub fn with_pr_number(mut self, pr_number: u64) -> Self {
        self.pr_number = (pr_number > 0).then_some(pr_number);
        self
    }
}

/// Derive the release identity for a set of source identifiers.
///
/// - `{repo}-pr-{number}` for pull-request deployments
/// - `{repo}` for the `main`/`master` branch
/// - `{repo}-{branch}` otherwise
pub fn resolve(ids: &SourceIdentifiers) -> Result<ReleaseIdentity, InputError> {
    let repo = sanitize(&ids.repo);
    if repo.is_empty() {
        return Err(InputError::EmptyComponent {
            field: "repo",
            input: ids.repo.clone(),
        });
    }
    let branch = sanitize(&ids.branch);
    if branch.is_empty() {
        return Err(InputError::EmptyComponent {
            field: "branch",
            input: ids.branch.clone(),
        });
    }

    let name = match ids.pr_number.filter(|n| *n > 0) {
        Some(number) => format!("{repo}-pr-{number}"),
        None if STABLE_BRANCHES.contains(&branch.as_str()) => repo,
        None => format!("{repo}-{branch}"),
    };

    check_length(&name)?;
    Ok(ReleaseIdentity { name })
}

/// Collapse every run of non-alphanumeric characters into one hyphen, trim
/// hyphens from both ends, and lower-case the result.
pub fn sanitize(component: &str) -> String {
    NON_ALNUM_REGEX
        .replace_all(component, "-")
        .trim_matches('-')
        .to_lowercase()
}

fn check_length(name: &str) -> Result<(), InputError> {
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(InputError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_RELEASE_NAME_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(repo: &str, branch: &str) -> SourceIdentifiers {
        SourceIdentifiers::new("acme", repo, branch)
    }

    #[test]
    fn test_sanitize_collapses_runs_and_lowercases() {
        assert_eq!(sanitize("feature/X_1"), "feature-x-1");
        assert_eq!(sanitize("--My..App--"), "my-app");
        assert_eq!(sanitize("a___b///c"), "a-b-c");
        assert_eq!(sanitize("///"), "");
    }

    #[test]
    fn test_resolve_pull_request() {
        let ids = branch("My-App", "feature/thing").with_pr_number(42);
        assert_eq!(resolve(&ids).unwrap().name(), "my-app-pr-42");
    }

    #[test]
    fn test_resolve_feature_branch() {
        let ids = branch("my-app", "feature/X_1");
        assert_eq!(resolve(&ids).unwrap().name(), "my-app-feature-x-1");
    }

    #[test]
    fn test_resolve_stable_branches_use_repo_only() {
        for b in ["main", "master", "MAIN", "Master", "/main/", "--master--", "_Main_"] {
            let ids = branch("My.App", b);
            assert_eq!(resolve(&ids).unwrap().name(), "my-app", "branch {b:?}");
        }
    }

    #[test]
    fn test_resolve_pr_takes_precedence_over_stable_branch() {
        let ids = branch("svc", "main").with_pr_number(7);
        assert_eq!(resolve(&ids).unwrap().name(), "svc-pr-7");
    }

    #[test]
    fn test_pr_number_zero_means_absent() {
        let ids = branch("svc", "dev").with_pr_number(0);
        assert_eq!(ids.pr_number, None);
        assert_eq!(resolve(&ids).unwrap().name(), "svc-dev");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let ids = branch("Some Repo", "Release/2024.10").with_pr_number(3);
        let first = resolve(&ids).unwrap();
        let second = resolve(&ids).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name(), "some-repo-pr-3");
    }

    #[test]
    fn test_empty_repo_after_sanitization_is_rejected() {
        let err = resolve(&branch("***", "dev")).unwrap_err();
        assert!(matches!(err, InputError::EmptyComponent { field: "repo", .. }));
    }

    #[test]
    fn test_empty_branch_after_sanitization_is_rejected() {
        let err = resolve(&branch("svc", " / ")).unwrap_err();
        assert!(matches!(err, InputError::EmptyComponent { field: "branch", .. }));
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let ids = branch(&"r".repeat(40), &"b".repeat(20));
        let err = resolve(&ids).unwrap_err();
        assert!(matches!(err, InputError::NameTooLong { max: 53, .. }));
    }

    #[test]
    fn test_explicit_name_is_trimmed_not_sanitized() {
        let id = ReleaseIdentity::explicit("  Legacy_Release ").unwrap();
        assert_eq!(id.name(), "Legacy_Release");
        assert!(matches!(
            ReleaseIdentity::explicit("   "),
            Err(InputError::EmptyReleaseName)
        ));
    }
}
