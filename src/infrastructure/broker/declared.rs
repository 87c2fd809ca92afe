//! Registry of queues already declared on the broker.

use std::sync::Arc;

use dashmap::DashSet;

/// Names of queues this process has declared.
///
/// Shared by every queue a factory creates, so redeclaring the same queue is
/// skipped. Clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct DeclaredQueues {
    names: Arc<DashSet<String>>,
}

impl DeclaredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` as declared. Returns `false` if it already was.
    pub fn mark(&self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Undo [`mark`](Self::mark) after a failed declaration.
    pub fn forget(&self, name: &str) {
        self.names.remove(name);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_once() {
        let declared = DeclaredQueues::new();
        assert!(declared.mark("jobs"));
        assert!(!declared.mark("jobs"));
        assert_eq!(declared.len(), 1);
    }

    #[test]
    fn test_clones_share_registry() {
        let declared = DeclaredQueues::new();
        let other = declared.clone();
        declared.mark("jobs");
        assert!(other.contains("jobs"));

        other.forget("jobs");
        assert!(declared.is_empty());
    }
}
