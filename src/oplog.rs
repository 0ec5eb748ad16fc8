use log::debug;
use rusqlite::{Connection, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::registry::{Ref, Registry};
use crate::store::{self, Row};

/// Logical operation kind captured in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "i" => Some(OpKind::Insert),
            "u" => Some(OpKind::Update),
            "d" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// One journal entry. The row's column values are never stored here; they
/// are read from the tracked tables when a message is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub order: i64,
    pub kind: OpKind,
    #[serde(rename = "type")]
    pub type_id: String,
    pub pk: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<i64>,
}

impl Operation {
    pub fn row_ref(&self) -> Ref {
        Ref::new(self.type_id.clone(), self.pk)
    }
}

/// Record a mutation against a tracked table. Must run on the same
/// transaction as the mutation itself so both commit or roll back together.
pub fn append(
    conn: &Connection,
    kind: OpKind,
    target: &Ref,
    version: Option<i64>,
) -> Result<i64, SyncError> {
    conn.execute(
        "INSERT INTO sync_oplog (kind, content_type, row_pk, version_id)
VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), target.type_id, target.pk, version],
    )?;
    Ok(conn.last_insert_rowid())
}

fn query_ops<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Operation>, SyncError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, Option<i64>>(4)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (order, kind, type_id, pk, version) = row?;
        let kind = OpKind::parse(&kind).ok_or(SyncError::Config("unrecognized journal op kind"))?;
        out.push(Operation {
            order,
            kind,
            type_id,
            pk,
            version,
        });
    }
    Ok(out)
}

/// Local writes not yet accepted by the server, in append order.
pub fn unversioned(conn: &Connection) -> Result<Vec<Operation>, SyncError> {
    query_ops(
        conn,
        "SELECT op_order, kind, content_type, row_pk, version_id
FROM sync_oplog
WHERE version_id IS NULL
ORDER BY op_order ASC",
        [],
    )
}

/// Server-assigned entries newer than `version`, in append order.
pub fn since(conn: &Connection, version: i64) -> Result<Vec<Operation>, SyncError> {
    query_ops(
        conn,
        "SELECT op_order, kind, content_type, row_pk, version_id
FROM sync_oplog
WHERE version_id > ?1
ORDER BY op_order ASC",
        params![version],
    )
}

pub fn clear_unversioned(conn: &Connection) -> Result<usize, SyncError> {
    let n = conn.execute("DELETE FROM sync_oplog WHERE version_id IS NULL", [])?;
    Ok(n)
}

/// Drop every unversioned entry for one row. Used when both sides deleted
/// the row and its local history no longer matters.
pub fn remove_unversioned_for(conn: &Connection, target: &Ref) -> Result<usize, SyncError> {
    let n = conn.execute(
        "DELETE FROM sync_oplog
WHERE version_id IS NULL AND content_type = ?1 AND row_pk = ?2",
        params![target.type_id, target.pk],
    )?;
    Ok(n)
}

/// Drop unversioned delete entries for one row, neutralizing a local delete
/// that lost conflict resolution.
pub fn remove_unversioned_deletes(conn: &Connection, target: &Ref) -> Result<usize, SyncError> {
    let n = conn.execute(
        "DELETE FROM sync_oplog
WHERE version_id IS NULL AND kind = 'd' AND content_type = ?1 AND row_pk = ?2",
        params![target.type_id, target.pk],
    )?;
    Ok(n)
}

pub fn clear_all(conn: &Connection) -> Result<(), SyncError> {
    conn.execute("DELETE FROM sync_oplog", [])?;
    Ok(())
}

/// One application transaction over tracked tables. Every mutation lands in
/// the journal inside the same transaction; dropping the session without
/// calling [`Session::commit`] rolls both back together.
///
/// Sessions must not run concurrently with `push`/`pull` on the same
/// connection; callers serialize.
pub struct Session<'c> {
    tx: Transaction<'c>,
    registry: &'c Registry,
}

impl<'c> Session<'c> {
    pub fn begin(conn: &'c Connection, registry: &'c Registry) -> Result<Self, SyncError> {
        Ok(Self {
            tx: conn.unchecked_transaction()?,
            registry,
        })
    }

    /// Insert a row. A missing pk column is allocated as successor of the
    /// table's current maximum. Returns the pk used.
    pub fn insert(&self, type_id: &str, row: &Row) -> Result<i64, SyncError> {
        let ct = self.registry.get(type_id)?;
        let pk = match row.get(&ct.pk_column).and_then(Value::as_i64) {
            Some(pk) => {
                store::insert_row(&self.tx, ct, row)?;
                pk
            }
            None => {
                let pk = store::max_pk(&self.tx, ct)? + 1;
                let mut owned = row.clone();
                owned.insert(ct.pk_column.clone(), Value::from(pk));
                store::insert_row(&self.tx, ct, &owned)?;
                pk
            }
        };
        append(&self.tx, OpKind::Insert, &Ref::new(type_id, pk), None)?;
        debug!("captured insert {type_id}/{pk}");
        Ok(pk)
    }

    pub fn update(&self, type_id: &str, row: &Row) -> Result<(), SyncError> {
        let ct = self.registry.get(type_id)?;
        let pk = store::row_pk(ct, row)?;
        store::update_row(&self.tx, ct, row)?;
        append(&self.tx, OpKind::Update, &Ref::new(type_id, pk), None)?;
        debug!("captured update {type_id}/{pk}");
        Ok(())
    }

    pub fn delete(&self, type_id: &str, pk: i64) -> Result<(), SyncError> {
        let ct = self.registry.get(type_id)?;
        store::delete_row(&self.tx, ct, pk)?;
        append(&self.tx, OpKind::Delete, &Ref::new(type_id, pk), None)?;
        debug!("captured delete {type_id}/{pk}");
        Ok(())
    }

    pub fn get(&self, type_id: &str, pk: i64) -> Result<Option<Row>, SyncError> {
        let ct = self.registry.get(type_id)?;
        store::fetch_row(&self.tx, ct, pk)
    }

    /// Escape hatch for application queries inside the same transaction.
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn commit(self) -> Result<(), SyncError> {
        self.tx.commit()?;
        Ok(())
    }
}
