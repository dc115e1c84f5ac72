//! Notifications pushed by the server over the changes connection.
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ChangesType {
    Document,
    Index,
    Operation,
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Deserialize)]
pub enum DocumentChangeType {
    #[default]
    None,
    Put,
    Delete,
    Conflict,
    Common,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DocumentChange {
    #[serde(rename = "Type")]
    pub change_type: DocumentChangeType,
    pub id: String,
    pub collection_name: Option<String>,
    pub type_name: Option<String>,
    pub change_vector: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Deserialize)]
pub enum IndexChangeType {
    #[default]
    None,
    BatchCompleted,
    IndexAdded,
    IndexRemoved,
    IndexDemotedToIdle,
    IndexPromotedFromIdle,
    IndexDemotedToDisabled,
    IndexMarkedAsErrored,
    SideBySideReplace,
    Renamed,
    IndexPaused,
    LockModeChanged,
    PriorityChanged,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IndexChange {
    #[serde(rename = "Type")]
    pub change_type: IndexChangeType,
    pub name: String,
    pub etag: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct OperationStatusChange {
    pub operation_id: i64,
    pub state: serde_json::Value,
}

/// A decoded notification of any supported type.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Document(DocumentChange),
    Index(IndexChange),
    Operation(OperationStatusChange),
}

impl Notification {
    pub fn changes_type(&self) -> ChangesType {
        match self {
            Notification::Document(_) => ChangesType::Document,
            Notification::Index(_) => ChangesType::Index,
            Notification::Operation(_) => ChangesType::Operation,
        }
    }
}

/// Implemented by every notification payload a [`ChangesObservable`](super::ChangesObservable)
/// can carry.
pub trait ChangeNotification: Send + Sync + 'static {
    const CHANGES_TYPE: ChangesType;

    fn from_notification(notification: &Notification) -> Option<&Self>;
}

impl ChangeNotification for DocumentChange {
    const CHANGES_TYPE: ChangesType = ChangesType::Document;

    fn from_notification(notification: &Notification) -> Option<&Self> {
        match notification {
            Notification::Document(change) => Some(change),
            _ => None,
        }
    }
}

impl ChangeNotification for IndexChange {
    const CHANGES_TYPE: ChangesType = ChangesType::Index;

    fn from_notification(notification: &Notification) -> Option<&Self> {
        match notification {
            Notification::Index(change) => Some(change),
            _ => None,
        }
    }
}

impl ChangeNotification for OperationStatusChange {
    const CHANGES_TYPE: ChangesType = ChangesType::Operation;

    fn from_notification(notification: &Notification) -> Option<&Self> {
        match notification {
            Notification::Operation(change) => Some(change),
            _ => None,
        }
    }
}

/// One message of a frame as sent by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMessage {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    exception: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IncomingMessage {
    Notification(Notification),
    Error(String),
    /// Confirmations and types this client does not know about.
    Ignored(Option<String>),
}

/// Decodes a frame, which holds either one message or an array of them.
pub(crate) fn decode_frame(frame: &str) -> Result<Vec<IncomingMessage>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(frame)?;
    let raw = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<RawMessage>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };

    raw.into_iter().map(decode_message).collect()
}

fn decode_message(raw: RawMessage) -> Result<IncomingMessage, serde_json::Error> {
    if let Some(exception) = raw.exception {
        return Ok(IncomingMessage::Error(exception));
    }

    let value = raw.value.unwrap_or_default();
    let message = match raw.kind.as_deref() {
        Some("DocumentChange") => {
            IncomingMessage::Notification(Notification::Document(serde_json::from_value(value)?))
        }
        Some("IndexChange") => {
            IncomingMessage::Notification(Notification::Index(serde_json::from_value(value)?))
        }
        Some("OperationStatusChange") => {
            IncomingMessage::Notification(Notification::Operation(serde_json::from_value(value)?))
        }
        _ => IncomingMessage::Ignored(raw.kind),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_frame_reads_arrays_of_notifications() {
        let frame = r#"[
            {"Type": "DocumentChange", "Value": {"Type": "Put", "Id": "users/1", "CollectionName": "Users", "ChangeVector": "A:1"}},
            {"Type": "IndexChange", "Value": {"Type": "BatchCompleted", "Name": "Users/ByName", "Etag": 7}}
        ]"#;

        let messages = decode_frame(frame).unwrap();

        assert_eq!(
            messages[0],
            IncomingMessage::Notification(Notification::Document(DocumentChange {
                change_type: DocumentChangeType::Put,
                id: "users/1".to_string(),
                collection_name: Some("Users".to_string()),
                type_name: None,
                change_vector: Some("A:1".to_string()),
            }))
        );
        assert_eq!(
            messages[1],
            IncomingMessage::Notification(Notification::Index(IndexChange {
                change_type: IndexChangeType::BatchCompleted,
                name: "Users/ByName".to_string(),
                etag: 7,
            }))
        );
    }

    #[test]
    fn decode_frame_accepts_single_message_and_ignores_unknown_types() {
        let confirm = decode_frame(r#"{"CommandId": 1, "Type": "Confirm"}"#).unwrap();
        let unknown = decode_frame(r#"[{"Type": "CounterChange", "Value": {}}]"#).unwrap();

        assert_eq!(confirm, vec![IncomingMessage::Ignored(Some("Confirm".to_string()))]);
        assert_eq!(
            unknown,
            vec![IncomingMessage::Ignored(Some("CounterChange".to_string()))]
        );
    }

    #[test]
    fn decode_frame_reports_server_errors() {
        let messages =
            decode_frame(r#"{"Type": "Error", "Exception": "Database is shutting down"}"#).unwrap();

        assert_eq!(
            messages,
            vec![IncomingMessage::Error("Database is shutting down".to_string())]
        );
    }

    #[test]
    fn unknown_change_types_do_not_fail_decoding() {
        let messages = decode_frame(
            r#"{"Type": "DocumentChange", "Value": {"Type": "SomethingNew", "Id": "users/1"}}"#,
        )
        .unwrap();

        match &messages[0] {
            IncomingMessage::Notification(Notification::Document(change)) => {
                assert_eq!(change.change_type, DocumentChangeType::Unknown)
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decode_frame_rejects_garbage() {
        assert!(decode_frame("not json").is_err());
    }
}
