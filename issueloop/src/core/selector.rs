//! Deterministic selection of the next ready issue.

use std::collections::BTreeSet;

use crate::core::types::IssueStatus;
use crate::issue::Issue;

/// Optional allow-set of roles a worker may claim. `None` claims any role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleFilter {
    roles: Option<BTreeSet<String>>,
}

impl RoleFilter {
    pub fn any() -> Self {
        Self { roles: None }
    }

    pub fn only<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roles: BTreeSet<String> = roles
            .into_iter()
            .map(|r| r.as_ref().trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        if roles.is_empty() {
            return Self::any();
        }
        Self { roles: Some(roles) }
    }

    pub fn is_scoped(&self) -> bool {
        self.roles.is_some()
    }

    pub fn contains(&self, role: &str) -> bool {
        match &self.roles {
            None => true,
            Some(roles) => roles.contains(&role.to_ascii_lowercase()),
        }
    }

    pub fn allows(&self, issue: &Issue) -> bool {
        match (&self.roles, issue.role.as_deref()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(roles), Some(role)) => roles.contains(role),
        }
    }
}

/// Pick the ready issue with the lowest priority, tie-broken by file name.
///
/// Returns `None` when nothing matches; an empty queue is not an error.
pub fn pick_next<'a>(candidates: &'a [Issue], filter: &RoleFilter) -> Option<&'a Issue> {
    candidates
        .iter()
        .filter(|issue| issue.status == Some(IssueStatus::Ready))
        .filter(|issue| filter.allows(issue))
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.name.cmp(&b.name))
        })
}
