use std::collections::BTreeMap;

use chrono::Utc;
use log::{debug, info};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::compress;
use crate::error::{Container, SyncError};
use crate::message::{
    self, PayloadMap, PullMessage, PullRequest, PushMessage, PushReply, RegisterReply,
    RepairMessage,
};
use crate::oplog::{self, OpKind};
use crate::registry::{self, Ref, Registry};
use crate::signing;
use crate::store::{self, Row};

/// The authoritative side: owns the version ledger and the node registry,
/// validates and commits pushes, services pulls and repairs.
///
/// Version assignment must be serial; callers wanting concurrent requests
/// put the engine behind a lock (see `http::serve_on`).
pub struct ServerEngine {
    conn: Connection,
    registry: Registry,
}

impl ServerEngine {
    pub fn new(conn: Connection, registry: Registry) -> Result<Self, SyncError> {
        registry::create_all(&conn, &registry)?;
        Ok(Self { conn, registry })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn latest_version(&self) -> Result<i64, SyncError> {
        let v: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(version_id), 0) FROM sync_version", [], |r| {
                r.get(0)
            })?;
        Ok(v)
    }

    /// Issue fresh credentials. Re-registration always mints a new node id
    /// and secret; stale credentials simply stop verifying.
    pub fn register(&self) -> Result<RegisterReply, SyncError> {
        let mut buf = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buf);
        let secret = hex::encode(buf);
        self.conn.execute(
            "INSERT INTO sync_node (secret, registered_ms) VALUES (?1, ?2)",
            params![secret, Utc::now().timestamp_millis()],
        )?;
        let node_id = self.conn.last_insert_rowid();
        info!("registered node {node_id}");
        Ok(RegisterReply { node_id, secret })
    }

    fn node_secret(&self, node_id: i64) -> Result<String, SyncError> {
        self.conn
            .query_row(
                "SELECT secret FROM sync_node WHERE node_id = ?1",
                params![node_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| SyncError::Auth(format!("unknown node {node_id}")))
    }

    /// Validate and commit a push. The whole batch gets one fresh version
    /// id and lands in a single transaction; any store failure rolls the
    /// batch back and reports the offending row.
    pub fn handle_push(&self, msg: &PushMessage) -> Result<PushReply, SyncError> {
        let secret = self.node_secret(msg.node_id)?;
        let bytes = message::canonical_bytes(
            msg.node_id,
            msg.last_known_version,
            &msg.operations,
            &msg.payloads,
        )?;
        signing::verify(&secret, &bytes, &msg.signature)?;

        let latest = self.latest_version()?;
        if msg.last_known_version < latest {
            info!(
                "rejecting push from node {}: client at {}, server at {}",
                msg.node_id, msg.last_known_version, latest
            );
            return Err(SyncError::PushRejected {
                client: msg.last_known_version,
                server: latest,
            });
        }
        if msg.operations.is_empty() {
            return Ok(PushReply {
                latest_version: latest,
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        // compressed batches do not preserve every original interleaving,
        // so foreign keys are checked at commit, not per operation
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        tx.execute(
            "INSERT INTO sync_version (created_ms, node_id) VALUES (?1, ?2)",
            params![Utc::now().timestamp_millis(), msg.node_id],
        )?;
        let version = tx.last_insert_rowid();

        for op in &msg.operations {
            let ct = self.registry.get(&op.type_id)?;
            let mut target = op.row_ref();
            match op.kind {
                OpKind::Insert => {
                    let row = message::payload_get(&msg.payloads, &target)
                        .ok_or_else(|| fetch_error(&target, Container::Msg))?;
                    if store::fetch_row(&tx, ct, op.pk)?.is_some() {
                        // two nodes minted the same pk; keep both rows and
                        // move the incoming one to a fresh pk
                        let pk = store::max_pk(&tx, ct)? + 1;
                        let mut moved = row.clone();
                        moved.insert(ct.pk_column.clone(), Value::from(pk));
                        store::insert_row(&tx, ct, &moved)
                            .map_err(|e| e.into_integrity(&op.type_id, pk))?;
                        info!("pk collision on {target}; stored incoming row as pk {pk}");
                        target = Ref::new(target.type_id.clone(), pk);
                    } else {
                        store::insert_row(&tx, ct, row)
                            .map_err(|e| e.into_integrity(&op.type_id, op.pk))?;
                    }
                }
                OpKind::Update => {
                    let row = message::payload_get(&msg.payloads, &target)
                        .ok_or_else(|| fetch_error(&target, Container::Msg))?;
                    store::upsert_row(&tx, ct, row)
                        .map_err(|e| e.into_integrity(&op.type_id, op.pk))?;
                }
                OpKind::Delete => {
                    store::delete_row(&tx, ct, op.pk)
                        .map_err(|e| e.into_integrity(&op.type_id, op.pk))?;
                }
            }
            oplog::append(&tx, op.kind, &target, Some(version))?;
        }
        tx.commit()?;
        info!(
            "accepted push from node {}: {} op(s) as version {}",
            msg.node_id,
            msg.operations.len(),
            version
        );
        Ok(PushReply {
            latest_version: version,
        })
    }

    /// Service a pull: everything newer than the client's version,
    /// compressed, with the row payloads and one hop of parent rows the
    /// merge will need. Read-only and idempotent.
    pub fn handle_pull(&self, req: &PullRequest) -> Result<PullMessage, SyncError> {
        let since = oplog::since(&self.conn, req.last_known_version)?;
        let operations = compress::compress_remote(&since);

        let mut payloads = PayloadMap::new();
        let mut included_parents = Vec::new();
        for op in &operations {
            if op.kind == OpKind::Delete {
                continue;
            }
            let ct = self.registry.get(&op.type_id)?;
            let target = op.row_ref();
            let row = store::fetch_row(&self.conn, ct, op.pk)?
                .ok_or_else(|| fetch_error(&target, Container::Db))?;
            for fk in &ct.foreign_keys {
                let Some(parent_pk) = row.get(&fk.column).and_then(Value::as_i64) else {
                    continue;
                };
                let parent = Ref::new(fk.target.clone(), parent_pk);
                if message::payload_get(&payloads, &parent).is_some() {
                    continue;
                }
                let parent_ct = self.registry.get(&parent.type_id)?;
                if let Some(parent_row) = store::fetch_row(&self.conn, parent_ct, parent_pk)? {
                    message::payload_put(&mut payloads, &parent, parent_row);
                    included_parents.push(parent);
                }
            }
            message::payload_put(&mut payloads, &target, row);
        }

        let latest = self.latest_version()?;
        debug!(
            "pull for node {} since version {}: {} op(s), latest {}",
            req.node_id,
            req.last_known_version,
            operations.len(),
            latest
        );
        Ok(PullMessage {
            latest_version: latest,
            operations,
            payloads,
            included_parents,
        })
    }

    /// Full dump of every tracked table, for `repair`.
    pub fn snapshot(&self) -> Result<RepairMessage, SyncError> {
        let mut tables = BTreeMap::new();
        for ct in self.registry.iter() {
            let mut rows = BTreeMap::new();
            for row in store::all_rows(&self.conn, ct)? {
                let pk = store::row_pk(ct, &row)?;
                rows.insert(pk.to_string(), row);
            }
            tables.insert(ct.id.clone(), rows);
        }
        Ok(RepairMessage {
            latest_version: self.latest_version()?,
            tables,
        })
    }

    /// Application-defined remote read of one tracked table.
    pub fn query(&self, type_id: &str) -> Result<Vec<Row>, SyncError> {
        let ct = self.registry.get(type_id)?;
        store::all_rows(&self.conn, ct)
    }
}

fn fetch_error(target: &Ref, container: Container) -> SyncError {
    SyncError::MergeFetch {
        type_id: target.type_id.clone(),
        pk: target.pk,
        container,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Operation;
    use crate::registry::{ColumnKind, ContentType};
    use serde_json::json;

    fn engine() -> ServerEngine {
        let conn = Connection::open_in_memory().expect("open");
        let mut reg = Registry::new();
        reg.register(ContentType::new("city", "id").column("name", ColumnKind::Text));
        ServerEngine::new(conn, reg).expect("engine")
    }

    fn signed_push(engine: &ServerEngine, ops: Vec<Operation>, payloads: PayloadMap) -> PushMessage {
        let creds = engine.register().expect("register");
        let bytes = message::canonical_bytes(creds.node_id, 0, &ops, &payloads).unwrap();
        PushMessage {
            node_id: creds.node_id,
            last_known_version: 0,
            operations: ops,
            payloads,
            signature: signing::sign(&creds.secret, &bytes),
        }
    }

    #[test]
    fn register_issues_distinct_credentials() {
        let engine = engine();
        let a = engine.register().unwrap();
        let b = engine.register().unwrap();
        assert_ne!(a.node_id, b.node_id);
        assert_ne!(a.secret, b.secret);
        assert_eq!(a.secret.len(), 64);
    }

    #[test]
    fn unknown_node_and_bad_signature_fail_auth() {
        let engine = engine();
        let mut msg = signed_push(&engine, vec![], PayloadMap::new());

        let unknown = PushMessage {
            node_id: msg.node_id + 99,
            ..msg.clone()
        };
        assert!(matches!(
            engine.handle_push(&unknown),
            Err(SyncError::Auth(_))
        ));

        msg.signature = signing::sign("wrong", b"whatever");
        assert!(matches!(engine.handle_push(&msg), Err(SyncError::Auth(_))));
    }

    #[test]
    fn accepted_push_assigns_a_version_and_journals() {
        let engine = engine();
        let ops = vec![Operation {
            order: 1,
            kind: OpKind::Insert,
            type_id: "city".to_string(),
            pk: 1,
            version: None,
        }];
        let mut payloads = PayloadMap::new();
        message::payload_put(
            &mut payloads,
            &Ref::new("city", 1),
            json!({"id": 1, "name": "A"}).as_object().unwrap().clone(),
        );
        let msg = signed_push(&engine, ops, payloads);
        let reply = engine.handle_push(&msg).expect("accepted");
        assert_eq!(reply.latest_version, 1);
        assert_eq!(engine.latest_version().unwrap(), 1);

        let journaled = oplog::since(engine.connection(), 0).unwrap();
        assert_eq!(journaled.len(), 1);
        assert_eq!(journaled[0].version, Some(1));
    }

    #[test]
    fn empty_push_allocates_no_version() {
        let engine = engine();
        let msg = signed_push(&engine, vec![], PayloadMap::new());
        let reply = engine.handle_push(&msg).expect("accepted");
        assert_eq!(reply.latest_version, 0);
        assert_eq!(engine.latest_version().unwrap(), 0);
    }
}
