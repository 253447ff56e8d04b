//! Target locators: the canonical `namespace/kind/name` (or `kind/name`) string naming the
//! resource a remediation acts on. Parsed locators are only ever compared for equality; they
//! are the lock key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("target locator is empty")]
    Empty,

    #[error("target locator '{locator}' has {segments} segments; expected namespace/kind/name or kind/name")]
    SegmentCount { locator: String, segments: usize },

    #[error("target locator '{0}' has an empty segment")]
    EmptySegment(String),

    #[error("target locator '{0}' contains whitespace")]
    Whitespace(String),
}

/// A parsed target locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetLocator {
    namespace: Option<String>,
    kind: String,
    name: String,
}

impl TargetLocator {
    pub fn parse(locator: &str) -> Result<Self, TargetError> {
        if locator.is_empty() {
            return Err(TargetError::Empty);
        }
        if locator.chars().any(char::is_whitespace) {
            return Err(TargetError::Whitespace(locator.to_string()));
        }

        let segments: Vec<&str> = locator.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) && (segments.len() == 2 || segments.len() == 3) {
            return Err(TargetError::EmptySegment(locator.to_string()));
        }

        match segments.as_slice() {
            [kind, name] => Ok(Self::cluster_scoped(*kind, *name)),
            [namespace, kind, name] => Ok(Self::namespaced(*namespace, *kind, *name)),
            _ => Err(TargetError::SegmentCount {
                locator: locator.to_string(),
                segments: segments.len(),
            }),
        }
    }

    pub fn namespaced(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_none()
    }
}

impl FromStr for TargetLocator {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespaced() {
        let t = TargetLocator::parse("payment/deployment/payment-api").unwrap();
        assert_eq!(t.namespace(), Some("payment"));
        assert_eq!(t.kind(), "deployment");
        assert_eq!(t.name(), "payment-api");
        assert_eq!(t.to_string(), "payment/deployment/payment-api");
    }

    #[test]
    fn test_parse_cluster_scoped() {
        let t: TargetLocator = "node/worker-3".parse().unwrap();
        assert!(t.is_cluster_scoped());
        assert_eq!(t.kind(), "node");
        assert_eq!(t.to_string(), "node/worker-3");
    }

    #[test]
    fn test_rejects_wrong_segment_counts() {
        assert_eq!(TargetLocator::parse(""), Err(TargetError::Empty));
        assert!(matches!(
            TargetLocator::parse("a/b/c/d"),
            Err(TargetError::SegmentCount { segments: 4, .. })
        ));
        assert!(matches!(
            TargetLocator::parse("deployment"),
            Err(TargetError::SegmentCount { segments: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_empty_segments_and_whitespace() {
        assert!(matches!(
            TargetLocator::parse("payment//api"),
            Err(TargetError::EmptySegment(_))
        ));
        assert!(matches!(
            TargetLocator::parse("/node"),
            Err(TargetError::EmptySegment(_))
        ));
        assert!(matches!(
            TargetLocator::parse("payment/deployment/payment api"),
            Err(TargetError::Whitespace(_))
        ));
    }

    #[test]
    fn test_equality_is_the_lock_key() {
        let a = TargetLocator::parse("payment/deployment/payment-api").unwrap();
        let b = TargetLocator::namespaced("payment", "deployment", "payment-api");
        let c = TargetLocator::parse("deployment/payment-api").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
