use std::collections::BTreeMap;
use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Identity of a tracked row across every node: content type plus integer
/// primary key. Equality is structural; pks are never reused and carry no
/// application meaning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ref {
    #[serde(rename = "type")]
    pub type_id: String,
    pub pk: i64,
}

impl Ref {
    pub fn new(type_id: impl Into<String>, pk: i64) -> Self {
        Self {
            type_id: type_id.into(),
            pk,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_id, self.pk)
    }
}

/// Type tag for a tracked column. Booleans are stored as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Bool,
}

impl ColumnKind {
    fn sql(self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

/// Outgoing foreign-key edge: `column` holds the pk of a `target` row.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub column: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct UniqueConstraint {
    pub columns: Vec<String>,
}

/// A registered table description. The id doubles as the table name.
#[derive(Debug, Clone)]
pub struct ContentType {
    pub id: String,
    pub pk_column: String,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKey>,
    pub uniques: Vec<UniqueConstraint>,
}

impl ContentType {
    /// Start a description; the pk column is declared implicitly as an
    /// integer.
    pub fn new(id: impl Into<String>, pk_column: impl Into<String>) -> Self {
        let pk_column = pk_column.into();
        Self {
            id: id.into(),
            columns: vec![ColumnDef {
                name: pk_column.clone(),
                kind: ColumnKind::Integer,
            }],
            pk_column,
            foreign_keys: Vec::new(),
            uniques: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind,
        });
        self
    }

    /// Declare that `column` references the pk of content type `target`.
    /// The column itself must also be declared with [`ContentType::column`].
    pub fn foreign_key(mut self, column: impl Into<String>, target: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            target: target.into(),
        });
        self
    }

    /// Declare a unique constraint over a nonempty column set. Constraints
    /// are checked during merge in declaration order.
    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.uniques.push(UniqueConstraint {
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    fn create_sql(&self, registry: &Registry) -> Result<String, SyncError> {
        let mut parts = Vec::new();
        for col in &self.columns {
            if col.name == self.pk_column {
                parts.push(format!("\"{}\" INTEGER PRIMARY KEY", col.name));
            } else {
                parts.push(format!("\"{}\" {}", col.name, col.kind.sql()));
            }
        }
        for uc in &self.uniques {
            let cols: Vec<String> = uc.columns.iter().map(|c| format!("\"{c}\"")).collect();
            parts.push(format!("UNIQUE({})", cols.join(", ")));
        }
        for fk in &self.foreign_keys {
            let target = registry.get(&fk.target)?;
            parts.push(format!(
                "FOREIGN KEY(\"{}\") REFERENCES \"{}\"(\"{}\")",
                fk.column, target.id, target.pk_column
            ));
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({});",
            self.id,
            parts.join(", ")
        ))
    }
}

/// Map of tracked content types, fixed before `create_all` and read-only
/// afterwards.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    types: BTreeMap<String, ContentType>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: registering the same id twice keeps the latest
    /// description.
    pub fn register(&mut self, ct: ContentType) {
        self.types.insert(ct.id.clone(), ct);
    }

    pub fn get(&self, id: &str) -> Result<&ContentType, SyncError> {
        self.types
            .get(id)
            .ok_or_else(|| SyncError::UnknownContentType(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentType> {
        self.types.values()
    }
}

/// Engine metadata: operations journal, version ledger, node table and the
/// scalar key/value store.
const META_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_oplog (
op_order INTEGER PRIMARY KEY AUTOINCREMENT,
kind TEXT NOT NULL CHECK(kind IN ('i','u','d')),
content_type TEXT NOT NULL,
row_pk INTEGER NOT NULL,
version_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_oplog_version
ON sync_oplog(version_id, op_order);

CREATE TABLE IF NOT EXISTS sync_version (
version_id INTEGER PRIMARY KEY AUTOINCREMENT,
created_ms INTEGER NOT NULL,
node_id INTEGER
);

CREATE TABLE IF NOT EXISTS sync_node (
node_id INTEGER PRIMARY KEY AUTOINCREMENT,
secret TEXT NOT NULL,
registered_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_kv (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);
"#;

/// Materialize every tracked table plus the engine metadata tables.
/// Safe to call multiple times.
pub fn create_all(conn: &Connection, registry: &Registry) -> Result<(), SyncError> {
    let mut batch = String::from("PRAGMA foreign_keys=ON;\n");
    for ct in registry.iter() {
        batch.push_str(&ct.create_sql(registry)?);
        batch.push('\n');
    }
    batch.push_str(META_SCHEMA);
    conn.execute_batch(&batch)?;
    Ok(())
}
