//! Ref advertisement filtering.

use crate::storage::RefName;

/// Decides which refs a client gets to see.
///
/// Staging and lock refs are internal and never advertised. The secrets
/// branch is only shown to privileged clients. The same filter serves
/// fetch and push advertisement.
#[derive(Debug, Clone, Default)]
pub struct RefFilter {
    secrets_branch: Option<RefName>,
}

impl RefFilter {
    pub fn new(secrets_branch: Option<RefName>) -> Self {
        Self { secrets_branch }
    }

    pub fn is_visible(&self, name: &RefName, privileged: bool) -> bool {
        if name.is_staging() || name.is_lock() {
            return false;
        }
        privileged || self.secrets_branch.as_ref() != Some(name)
    }

    pub fn advertise<I>(&self, refs: I, privileged: bool) -> Vec<RefName>
    where
        I: IntoIterator<Item = RefName>,
    {
        refs.into_iter().filter(|r| self.is_visible(r, privileged)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> Vec<RefName> {
        [
            "refs/heads/master",
            "refs/heads/secrets",
            "refs/heads/_staging/01hv0000000000000000000000",
            "refs/locks/store",
            "refs/tags/v1",
        ]
        .iter()
        .map(|r| RefName::new(*r).unwrap())
        .collect()
    }

    #[test]
    fn test_unprivileged_view() {
        let filter = RefFilter::new(Some(RefName::branch("secrets").unwrap()));
        let shown: Vec<String> = filter
            .advertise(refs(), false)
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        assert_eq!(shown, vec!["refs/heads/master", "refs/tags/v1"]);
    }

    #[test]
    fn test_privileged_view_keeps_internal_refs_hidden() {
        let filter = RefFilter::new(Some(RefName::branch("secrets").unwrap()));
        let shown = filter.advertise(refs(), true);
        assert_eq!(shown.len(), 3);
        assert!(shown.iter().all(|r| !r.is_staging() && !r.is_lock()));
    }

    #[test]
    fn test_no_secrets_branch() {
        let filter = RefFilter::default();
        assert_eq!(filter.advertise(refs(), false).len(), 3);
    }
}
