//! Operations broadcast between board instances.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use web_time::{SystemTime, UNIX_EPOCH};

use crate::board::{ImageObject, ImagePatch, LineObject};

/// A timestamped, attributed unit of change.
///
/// Identity fields are assigned by the channel registry at send time. Once
/// sent an operation is never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sender_id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
}

/// What an operation does. Serialized with an `operation_type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum OperationKind {
    /// A stroke was started; carries the stroke with its first point.
    DrawStart { line: LineObject },
    /// Points appended to an in-progress stroke.
    DrawContinue { line_id: String, points: Vec<Point> },
    /// A stroke was finished and committed to history.
    DrawStop { line_id: String },
    ImagePaste { image: ImageObject },
    ImageUpdate { image_id: String, patch: ImagePatch },
    ImageToggleLock { image_id: String },
    DeleteObjects {
        #[serde(default)]
        line_ids: Vec<String>,
        #[serde(default)]
        image_ids: Vec<String>,
    },
    Undo,
    Redo,
}

impl OperationKind {
    /// Wire name of the operation type.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::DrawStart { .. } => "draw_start",
            OperationKind::DrawContinue { .. } => "draw_continue",
            OperationKind::DrawStop { .. } => "draw_stop",
            OperationKind::ImagePaste { .. } => "image_paste",
            OperationKind::ImageUpdate { .. } => "image_update",
            OperationKind::ImageToggleLock { .. } => "image_toggle_lock",
            OperationKind::DeleteObjects { .. } => "delete_objects",
            OperationKind::Undo => "undo",
            OperationKind::Redo => "redo",
        }
    }

    /// Check if this operation steps history rather than editing content.
    pub fn is_history(&self) -> bool {
        matches!(self, OperationKind::Undo | OperationKind::Redo)
    }
}

impl Operation {
    /// Assign identity to an operation kind on behalf of `sender_id`.
    pub fn stamp(kind: OperationKind, sender_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            sender_id: sender_id.to_string(),
            kind,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode an operation. Unknown operation types are an error.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{LineTool, SerializableColor};

    #[test]
    fn test_stamp_assigns_identity() {
        let a = Operation::stamp(OperationKind::Undo, "alice");
        let b = Operation::stamp(OperationKind::Undo, "alice");
        assert_eq!(a.sender_id, "alice");
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn test_wire_format_uses_operation_type_tag() {
        let op = Operation::stamp(
            OperationKind::DrawStop { line_id: "l1".to_string() },
            "alice",
        );
        let value = op.to_value().unwrap();
        assert_eq!(value["operation_type"], "draw_stop");
        assert_eq!(value["line_id"], "l1");
        assert_eq!(value["sender_id"], "alice");
        // Payload fields sit beside the tag, not under a wrapper.
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_is_history() {
        assert!(OperationKind::Undo.is_history());
        assert!(OperationKind::Redo.is_history());
        assert!(!OperationKind::DrawStop { line_id: "l1".to_string() }.is_history());
        assert!(
            !OperationKind::DeleteObjects {
                line_ids: vec![],
                image_ids: vec![]
            }
            .is_history()
        );
    }

    #[test]
    fn test_decode_draw_start() {
        let line = LineObject::new(LineTool::Highlighter, Point::new(1.0, 2.0), SerializableColor::black(), 8.0);
        let op = Operation::stamp(OperationKind::DrawStart { line: line.clone() }, "bob");
        let json = op.to_json().unwrap();
        let decoded = Operation::from_json(&json).unwrap();
        assert_eq!(decoded.kind, OperationKind::DrawStart { line });
        assert_eq!(decoded.id, op.id);
    }

    #[test]
    fn test_unknown_operation_type_is_rejected() {
        let json = r#"{"id":"x","timestamp":1,"sender_id":"s","operation_type":"laser_pointer"}"#;
        assert!(Operation::from_json(json).is_err());
    }

    #[test]
    fn test_delete_objects_defaults() {
        let json = r#"{"id":"x","timestamp":1,"sender_id":"s","operation_type":"delete_objects","line_ids":["a"]}"#;
        let op = Operation::from_json(json).unwrap();
        assert_eq!(
            op.kind,
            OperationKind::DeleteObjects { line_ids: vec!["a".to_string()], image_ids: vec![] }
        );
    }

    #[test]
    fn test_kind_names_match_wire_tags() {
        let kinds = [
            OperationKind::Undo,
            OperationKind::Redo,
            OperationKind::ImageToggleLock { image_id: "i".to_string() },
        ];
        for kind in kinds {
            let value = serde_json::to_value(&kind).unwrap();
            assert_eq!(value["operation_type"], kind.name());
        }
    }
}
