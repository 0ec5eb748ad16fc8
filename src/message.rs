use std::collections::BTreeMap;

use log::debug;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::compress::{self, CompressionWarning};
use crate::error::{Container, SyncError, UniqueConflictEntry};
use crate::oplog::{self, OpKind, Operation};
use crate::registry::{Ref, Registry};
use crate::signing;
use crate::store::{self, Row};

/// Row payloads carried by push and pull envelopes, keyed as
/// `{type: {pk: {col: value}}}`. Pks become strings because JSON object
/// keys are strings.
pub type PayloadMap = BTreeMap<String, BTreeMap<String, Row>>;

pub fn payload_get<'a>(payloads: &'a PayloadMap, target: &Ref) -> Option<&'a Row> {
    payloads
        .get(&target.type_id)
        .and_then(|rows| rows.get(&target.pk.to_string()))
}

pub fn payload_put(payloads: &mut PayloadMap, target: &Ref, row: Row) {
    payloads
        .entry(target.type_id.clone())
        .or_default()
        .insert(target.pk.to_string(), row);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub node_id: i64,
    pub last_known_version: i64,
    pub operations: Vec<Operation>,
    pub payloads: PayloadMap,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReply {
    pub latest_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub node_id: i64,
    pub last_known_version: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessage {
    pub latest_version: i64,
    pub operations: Vec<Operation>,
    pub payloads: PayloadMap,
    /// Parent rows included so the merge never has to chase foreign keys
    /// back over the network.
    #[serde(default)]
    pub included_parents: Vec<Ref>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub node_id: i64,
    pub secret: String,
}

/// Full snapshot used by `repair`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairMessage {
    pub latest_version: i64,
    pub tables: BTreeMap<String, BTreeMap<String, Row>>,
}

/// Wire form of protocol failures, carried in HTTP 4xx bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum WireError {
    PushRejected { client: i64, server: i64 },
    UniqueConflict { entries: Vec<UniqueConflictEntry> },
    Integrity { type_id: String, pk: i64, message: String },
    Auth { message: String },
    Other { message: String },
}

impl WireError {
    pub fn from_error(e: &SyncError) -> Self {
        match e {
            SyncError::PushRejected { client, server } => WireError::PushRejected {
                client: *client,
                server: *server,
            },
            SyncError::UniqueConflict { entries } => WireError::UniqueConflict {
                entries: entries.clone(),
            },
            SyncError::Integrity {
                type_id,
                pk,
                message,
            } => WireError::Integrity {
                type_id: type_id.clone(),
                pk: *pk,
                message: message.clone(),
            },
            SyncError::Auth(message) => WireError::Auth {
                message: message.clone(),
            },
            other => WireError::Other {
                message: other.to_string(),
            },
        }
    }

    pub fn into_error(self) -> SyncError {
        match self {
            WireError::PushRejected { client, server } => {
                SyncError::PushRejected { client, server }
            }
            WireError::UniqueConflict { entries } => SyncError::UniqueConflict { entries },
            WireError::Integrity {
                type_id,
                pk,
                message,
            } => SyncError::Integrity {
                type_id,
                pk,
                message,
            },
            WireError::Auth { message } => SyncError::Auth(message),
            WireError::Other { message } => SyncError::Transport(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: Vec<WireError>,
}

/// Canonical signing input: the document
/// `{last_known_version, node_id, operations, payloads}` rendered with all
/// object keys sorted. Routing everything through `serde_json::Value`
/// keeps struct fields sorted too.
pub fn canonical_bytes(
    node_id: i64,
    last_known_version: i64,
    operations: &[Operation],
    payloads: &PayloadMap,
) -> Result<Vec<u8>, SyncError> {
    let doc = serde_json::json!({
        "last_known_version": last_known_version,
        "node_id": node_id,
        "operations": serde_json::to_value(operations)?,
        "payloads": serde_json::to_value(payloads)?,
    });
    Ok(doc.to_string().into_bytes())
}

/// Collect and compress the unversioned journal, attach the row payloads
/// inserts and updates will need, and sign the envelope.
///
/// An insert/update whose row can no longer be read means the journal and
/// the store have drifted apart; that is an error, not something to paper
/// over.
pub fn build_push(
    conn: &Connection,
    registry: &Registry,
    node_id: i64,
    last_known_version: i64,
    secret: &str,
) -> Result<(PushMessage, Vec<CompressionWarning>), SyncError> {
    let raw = oplog::unversioned(conn)?;
    let (operations, warnings) = compress::compress_local(&raw);

    let mut payloads = PayloadMap::new();
    for op in &operations {
        if op.kind == OpKind::Delete {
            continue;
        }
        let ct = registry.get(&op.type_id)?;
        let row = store::fetch_row(conn, ct, op.pk)?.ok_or(SyncError::MergeFetch {
            type_id: op.type_id.clone(),
            pk: op.pk,
            container: Container::Db,
        })?;
        payload_put(&mut payloads, &op.row_ref(), row);
    }

    let bytes = canonical_bytes(node_id, last_known_version, &operations, &payloads)?;
    let signature = signing::sign(secret, &bytes);
    debug!(
        "built push: {} op(s) from {} journal entr(ies)",
        operations.len(),
        raw.len()
    );

    Ok((
        PushMessage {
            node_id,
            last_known_version,
            operations,
            payloads,
            signature,
        },
        warnings,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(order: i64, kind: OpKind, pk: i64, version: Option<i64>) -> Operation {
        Operation {
            order,
            kind,
            type_id: "city".to_string(),
            pk,
            version,
        }
    }

    #[test]
    fn operation_wire_shape_is_stable() {
        let local = serde_json::to_string(&op(3, OpKind::Insert, 9, None)).unwrap();
        assert_eq!(local, r#"{"order":3,"kind":"i","type":"city","pk":9}"#);

        let versioned = serde_json::to_string(&op(3, OpKind::Delete, 9, Some(2))).unwrap();
        assert_eq!(
            versioned,
            r#"{"order":3,"kind":"d","type":"city","pk":9,"version":2}"#
        );

        let back: Operation = serde_json::from_str(&versioned).unwrap();
        assert_eq!(back, op(3, OpKind::Delete, 9, Some(2)));
    }

    #[test]
    fn payload_map_round_trip() {
        let mut payloads = PayloadMap::new();
        let target = Ref::new("city", 4);
        payload_put(
            &mut payloads,
            &target,
            json!({"id": 4, "name": "A"}).as_object().unwrap().clone(),
        );
        assert!(payload_get(&payloads, &target).is_some());
        assert!(payload_get(&payloads, &Ref::new("city", 5)).is_none());

        let text = serde_json::to_string(&payloads).unwrap();
        assert_eq!(text, r#"{"city":{"4":{"id":4,"name":"A"}}}"#);
    }

    #[test]
    fn canonical_bytes_sort_keys_and_ignore_field_order() {
        let mut payloads = PayloadMap::new();
        payload_put(
            &mut payloads,
            &Ref::new("city", 1),
            json!({"name": "A", "id": 1}).as_object().unwrap().clone(),
        );
        let ops = vec![op(1, OpKind::Insert, 1, None)];
        let bytes = canonical_bytes(7, 0, &ops, &payloads).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"last_known_version":0,"node_id":7,"operations":[{"kind":"i","order":1,"pk":1,"type":"city"}],"payloads":{"city":{"1":{"id":1,"name":"A"}}}}"#
        );
    }

    #[test]
    fn wire_error_survives_the_round_trip() {
        let e = SyncError::PushRejected {
            client: 1,
            server: 4,
        };
        let wire = WireError::from_error(&e);
        let text = serde_json::to_string(&ErrorReply { error: vec![wire] }).unwrap();
        let back: ErrorReply = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            back.error[0].clone().into_error(),
            SyncError::PushRejected {
                client: 1,
                server: 4
            }
        ));
    }
}
