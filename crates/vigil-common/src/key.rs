use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical identity of a tracked pull request: `(owner, repo, number)`.
///
/// Every map in the system — the state store, the per-PR mutex pool, the
/// webhook dispatch table — is keyed on this value rather than on any
/// pointer, per the "no owning pointers between PRState and ReviewRecord"
/// design note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PrKey {
    owner: String,
    repo: String,
    number: u64,
}

impl PrKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// `"owner/repo"`, used to key per-repo resources (bare clones, worktree
    /// mutexes, tracked-repo membership checks).
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

impl From<PrKey> for String {
    fn from(key: PrKey) -> Self {
        key.to_string()
    }
}

/// Error parsing a canonical `"owner/repo#number"` string back into a `PrKey`.
#[derive(Debug, thiserror::Error)]
#[error("invalid PR key {0:?}: expected \"owner/repo#number\"")]
pub struct ParseKeyError(String);

impl TryFrom<String> for PrKey {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (owner_repo, number) = value.split_once('#').ok_or_else(|| ParseKeyError(value.clone()))?;
        let (owner, repo) = owner_repo.split_once('/').ok_or_else(|| ParseKeyError(value.clone()))?;
        let number: u64 = number.parse().map_err(|_| ParseKeyError(value.clone()))?;
        if owner.is_empty() || repo.is_empty() {
            return Err(ParseKeyError(value));
        }
        Ok(PrKey::new(owner, repo, number))
    }
}

impl std::str::FromStr for PrKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrKey::try_from(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_canonical_form() {
        let key = PrKey::new("acme", "widgets", 42);
        assert_eq!(key.to_string(), "acme/widgets#42");
    }

    #[test]
    fn round_trips_through_string() {
        let key = PrKey::new("acme", "widgets", 42);
        let s: String = key.clone().into();
        let parsed: PrKey = s.parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("acmewidgets#42".parse::<PrKey>().is_err());
        assert!("acme/widgets".parse::<PrKey>().is_err());
        assert!("acme/widgets#notanumber".parse::<PrKey>().is_err());
        assert!("/widgets#1".parse::<PrKey>().is_err());
    }

    #[test]
    fn repo_slug() {
        let key = PrKey::new("acme", "widgets", 1);
        assert_eq!(key.repo_slug(), "acme/widgets");
    }
}
