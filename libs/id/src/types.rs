//! Typed ID definitions for the scheduler resources the node agent handles.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Scheduling Model
// =============================================================================

define_id!(JobId, "job");
define_id!(EvalId, "eval");
define_id!(DeployId, "dep");

// =============================================================================
// Runtime
// =============================================================================

define_id!(AllocId, "alloc");
define_id!(NodeId, "node");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_id_roundtrip() {
        let id = AllocId::new();
        let s = id.to_string();
        assert!(s.starts_with("alloc_"));
        let parsed = AllocId::parse(&s).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let eval = EvalId::new().to_string();
        let err = AllocId::parse(&eval).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(AllocId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
