//! Repository model and reconciliation planning.
//!
//! Everything here is pure: validation of desired bindings, parsing of
//! observed remotes, and the diff that turns observed state plus desired
//! state into a [`ReconciliationPlan`].

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_OWNER_LEN: usize = 39;
const MAX_NAME_LEN: usize = 100;

/// A validated `owner/name` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoName {
    owner: String,
    name: String,
}

impl RepoName {
    /// Builds a repository name from its parts.
    pub fn new(owner: &str, name: &str) -> Result<Self> {
        validate_owner(owner)?;
        validate_name(name)?;
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Short name, used as the directory name in multi-repo mode.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Returns true if both identifiers name the same repository.
    ///
    /// The source host treats names case-insensitively.
    pub fn same_repo(&self, other: &RepoName) -> bool {
        self.owner.eq_ignore_ascii_case(&other.owner) && self.name.eq_ignore_ascii_case(&other.name)
    }

    /// Parses the `owner/name` a git remote URL points at.
    ///
    /// Accepts `https://host/owner/name(.git)`, `ssh://git@host/owner/name`
    /// and scp-like `git@host:owner/name.git`. Returns `None` when the last
    /// two path segments are not a valid identifier.
    pub fn from_remote_url(url: &str) -> Option<Self> {
        let trimmed = url.trim().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let path = match trimmed.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map(|(_, path)| path)?,
            None => trimmed.rsplit_once(':').map(|(_, path)| path).unwrap_or(trimmed),
        };
        let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
        let name = segments.next()?;
        let owner = segments.next()?;
        RepoName::new(owner, name).ok()
    }

    /// Returns true if `url` points at this repository.
    pub fn matches_remote(&self, url: &str) -> bool {
        RepoName::from_remote_url(url).is_some_and(|remote| self.same_repo(&remote))
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (owner, name) = s
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("'{}' is not in owner/name form", s)))?;
        RepoName::new(owner, name)
    }
}

impl TryFrom<String> for RepoName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RepoName> for String {
    fn from(value: RepoName) -> Self {
        value.full_name()
    }
}

fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() || owner.len() > MAX_OWNER_LEN {
        return Err(Error::Validation(format!(
            "owner '{}' must be 1-{} characters",
            owner, MAX_OWNER_LEN
        )));
    }
    if owner.starts_with('-') {
        return Err(Error::Validation(format!(
            "owner '{}' may not start with '-'",
            owner
        )));
    }
    if !owner.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::Validation(format!(
            "owner '{}' may only contain letters, digits and '-'",
            owner
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "repository name '{}' must be 1-{} characters",
            name, MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::Validation(format!("repository name '{}' is reserved", name)));
    }
    if name.starts_with('-') {
        return Err(Error::Validation(format!(
            "repository name '{}' may not start with '-'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::Validation(format!(
            "repository name '{}' may only contain letters, digits, '.', '_' and '-'",
            name
        )));
    }
    Ok(())
}

fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty() {
        return Err(Error::Validation("branch name may not be empty".into()));
    }
    if branch.starts_with('-') {
        return Err(Error::Validation(format!(
            "branch '{}' may not start with '-'",
            branch
        )));
    }
    if branch.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "branch name may not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Workspace layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    /// The workspace root itself is the checkout.
    Single,
    /// Each repository is a subdirectory of the root.
    Multi,
}

impl LayoutMode {
    /// Mode required for a desired set of `count` repositories.
    pub fn for_count(count: usize) -> Self {
        if count == 1 {
            LayoutMode::Single
        } else {
            LayoutMode::Multi
        }
    }
}

/// A desired repository in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryBinding {
    /// Repository identifier.
    pub repo: RepoName,
    /// Branch to check out; the remote default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl RepositoryBinding {
    pub fn new(repo: RepoName) -> Self {
        Self { repo, branch: None }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Directory this binding occupies under `root` in `mode`.
    pub fn target_path(&self, root: &str, mode: LayoutMode) -> String {
        let root = root.trim_end_matches('/');
        match mode {
            LayoutMode::Single => root.to_string(),
            LayoutMode::Multi => format!("{}/{}", root, self.repo.name()),
        }
    }
}

impl fmt::Display for RepositoryBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}@{}", self.repo, branch),
            None => write!(f, "{}", self.repo),
        }
    }
}

/// Validates a desired set and removes exact duplicates.
///
/// Fails if two different owners contribute the same short name, or if
/// one repository is requested with two different branches.
pub fn validate_desired(desired: &[RepositoryBinding]) -> Result<Vec<RepositoryBinding>> {
    let mut out: Vec<RepositoryBinding> = Vec::with_capacity(desired.len());
    for binding in desired {
        if let Some(branch) = &binding.branch {
            validate_branch(branch)?;
        }
        match out
            .iter()
            .find(|b| b.repo.name().eq_ignore_ascii_case(binding.repo.name()))
        {
            Some(existing) if !existing.repo.same_repo(&binding.repo) => {
                return Err(Error::Validation(format!(
                    "{} and {} share the short name '{}'",
                    existing.repo,
                    binding.repo,
                    binding.repo.name()
                )));
            }
            Some(existing) if existing.branch != binding.branch => {
                return Err(Error::Validation(format!(
                    "{} requested with conflicting branches",
                    binding.repo
                )));
            }
            Some(_) => {}
            None => out.push(binding.clone()),
        }
    }
    Ok(out)
}

/// Layout found in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedLayout {
    /// Nothing in the workspace root.
    Empty,
    /// The root is a git checkout.
    Single,
    /// The root holds entries that are not a root checkout.
    Multi,
}

impl ObservedLayout {
    /// Returns true if the layout has to be cleared before `mode` applies.
    pub fn conflicts_with(self, mode: LayoutMode) -> bool {
        matches!(
            (self, mode),
            (ObservedLayout::Single, LayoutMode::Multi) | (ObservedLayout::Multi, LayoutMode::Single)
        )
    }
}

/// One checkout found in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRepo {
    /// Directory name (multi mode) or repository short name (single mode).
    pub name: String,
    /// `origin` URL, if one is configured.
    pub remote_url: Option<String>,
}

impl ObservedRepo {
    /// Repository the remote points at.
    pub fn remote_repo(&self) -> Option<RepoName> {
        self.remote_url.as_deref().and_then(RepoName::from_remote_url)
    }
}

/// Repository state read back from a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRepoState {
    pub layout: ObservedLayout,
    pub repos: Vec<ObservedRepo>,
}

impl ObservedRepoState {
    pub fn empty() -> Self {
        Self {
            layout: ObservedLayout::Empty,
            repos: Vec::new(),
        }
    }
}

/// Changes needed to converge a workspace.
///
/// Every observed checkout lands in `to_remove` or `unchanged`, every
/// desired binding in `to_clone` or `unchanged`. A checkout whose remote
/// points elsewhere is removed and its name cloned again; the removed
/// entry and the cloned entry name different repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_remove: Vec<ObservedRepo>,
    pub to_clone: Vec<RepositoryBinding>,
    pub unchanged: Vec<RepositoryBinding>,
}

impl ReconciliationPlan {
    /// Diffs observed checkouts against a validated desired set.
    pub fn diff(observed: &ObservedRepoState, desired: &[RepositoryBinding]) -> Self {
        let mut plan = ReconciliationPlan::default();
        let mut satisfied: HashSet<usize> = HashSet::new();

        for repo in &observed.repos {
            let matching = desired.iter().enumerate().find(|(idx, b)| {
                !satisfied.contains(idx)
                    && b.repo.name() == repo.name
                    && repo
                        .remote_url
                        .as_deref()
                        .is_some_and(|url| b.repo.matches_remote(url))
            });
            match matching {
                Some((idx, binding)) => {
                    satisfied.insert(idx);
                    plan.unchanged.push(binding.clone());
                }
                None => plan.to_remove.push(repo.clone()),
            }
        }

        plan.to_clone = desired
            .iter()
            .enumerate()
            .filter(|(idx, _)| !satisfied.contains(idx))
            .map(|(_, b)| b.clone())
            .collect();
        plan
    }

    /// Returns true if nothing needs to change.
    pub fn is_noop(&self) -> bool {
        self.to_remove.is_empty() && self.to_clone.is_empty()
    }
}
