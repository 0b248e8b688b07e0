//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identifies one supervised worker node for its whole lifecycle,
    /// independent of the provider instance ID it ends up backed by.
    WorkerNodeId,
    "wn"
);

define_id!(
    /// Identifies a command routed to a worker node; replies and failures
    /// carry it back to the requester.
    CommandId,
    "cmd"
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_worker_node_id_prefix() {
        let id = WorkerNodeId::new();
        assert!(id.to_string().starts_with("wn_"));
    }

    #[test]
    fn test_command_id_rejects_node_prefix() {
        let node = WorkerNodeId::new().to_string();
        let result: Result<CommandId, _> = node.parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { expected: "cmd", .. }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<CommandId, _> = "cmd01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<CommandId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<WorkerNodeId, _> = "wn_not-a-ulid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_serializes_as_string() {
        let id = CommandId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let parsed: CommandId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_later_ids_sort_after_earlier_ones() {
        let first = CommandId::from_ulid(crate::Ulid::from_parts(1_000, 0));
        let second = CommandId::from_ulid(crate::Ulid::from_parts(2_000, 0));
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in "\\PC*") {
            let _ = CommandId::parse(&s);
            let _ = WorkerNodeId::parse(&s);
        }
    }
}
