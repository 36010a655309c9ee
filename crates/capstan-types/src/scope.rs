use serde::{Deserialize, Serialize};

/// The administrative unit a runner belongs to: a whole organization
/// when organization-level runners are enabled, an `owner/repo` pair
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerScope {
    Org(String),
    Repo { owner: String, name: String },
}

impl RunnerScope {
    /// Grouping key, `Owner` tag value and GitHub URL path segment:
    /// `acme` for an org scope, `acme/widgets` for a repo scope.
    pub fn key(&self) -> String {
        match self {
            RunnerScope::Org(owner) => owner.clone(),
            RunnerScope::Repo { owner, name } => format!("{owner}/{name}"),
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            RunnerScope::Org(owner) => owner,
            RunnerScope::Repo { owner, .. } => owner,
        }
    }

    pub fn kind(&self) -> RunnerKind {
        match self {
            RunnerScope::Org(_) => RunnerKind::Org,
            RunnerScope::Repo { .. } => RunnerKind::Repo,
        }
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Granularity of a runner registration, mirrored in the `Type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerKind {
    Org,
    Repo,
}

impl RunnerKind {
    pub fn as_tag(self) -> &'static str {
        match self {
            RunnerKind::Org => "Org",
            RunnerKind::Repo => "Repo",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "Org" => Some(RunnerKind::Org),
            "Repo" => Some(RunnerKind::Repo),
            _ => None,
        }
    }
}
