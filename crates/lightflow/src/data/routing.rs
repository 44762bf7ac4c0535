//! Routing decisions attached to a successful task outcome

use serde::{Deserialize, Serialize};

/// Restricts downstream propagation of a task's output
///
/// By default every outgoing edge receives the output envelope. A task may
/// narrow delivery to named children and/or mark descendants as skipped;
/// skips then propagate through the graph per the skip rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Routing {
    /// When set, only these children receive the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,

    /// Descendants to mark as skipped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip: Vec<String>,
}

impl Routing {
    /// Deliver to every outgoing edge, skip nothing
    pub fn all() -> Self {
        Self::default()
    }

    /// Deliver only to the named children
    pub fn only(children: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            only: Some(children.into_iter().map(Into::into).collect()),
            skip: Vec::new(),
        }
    }

    /// Mark the named descendants as skipped
    pub fn skipping(mut self, nodes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.skip.extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Whether delivery to `child` is suppressed
    pub fn suppresses(&self, child: &str) -> bool {
        self.skip.iter().any(|s| s == child)
            || self
                .only
                .as_ref()
                .is_some_and(|only| !only.iter().any(|c| c == child))
    }
}
