use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::registry::{ColumnKind, ContentType};

/// Snapshot of all columns of a tracked row, as carried inside messages.
pub type Row = Map<String, Value>;

fn to_sql(v: &Value) -> Result<SqlValue, SyncError> {
    match v {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(SyncError::Config("numeric column value out of range"))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        _ => Err(SyncError::Config("nested values are not valid column data")),
    }
}

fn from_sql(kind: ColumnKind, v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match kind {
            ColumnKind::Bool => Value::Bool(i != 0),
            _ => Value::from(i),
        },
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn column_list(ct: &ContentType) -> String {
    ct.columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read the integer pk out of a row payload.
pub fn row_pk(ct: &ContentType, row: &Row) -> Result<i64, SyncError> {
    row.get(&ct.pk_column)
        .and_then(Value::as_i64)
        .ok_or(SyncError::Config("row payload missing integer primary key"))
}

pub fn fetch_row(conn: &Connection, ct: &ContentType, pk: i64) -> Result<Option<Row>, SyncError> {
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE \"{}\" = ?1",
        column_list(ct),
        ct.id,
        ct.pk_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(params![pk], |r| {
            let mut out = Map::new();
            for (i, col) in ct.columns.iter().enumerate() {
                out.insert(col.name.clone(), from_sql(col.kind, r.get_ref(i)?));
            }
            Ok(out)
        })
        .optional()?;
    Ok(row)
}

pub fn insert_row(conn: &Connection, ct: &ContentType, row: &Row) -> Result<(), SyncError> {
    let marks = (1..=ct.columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        ct.id,
        column_list(ct),
        marks
    );
    let values = ct
        .columns
        .iter()
        .map(|c| to_sql(row.get(&c.name).unwrap_or(&Value::Null)))
        .collect::<Result<Vec<_>, _>>()?;
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

pub fn update_row(conn: &Connection, ct: &ContentType, row: &Row) -> Result<(), SyncError> {
    let pk = row_pk(ct, row)?;
    let assignable: Vec<_> = ct
        .columns
        .iter()
        .filter(|c| c.name != ct.pk_column)
        .collect();
    if assignable.is_empty() {
        return Ok(());
    }
    let sets = assignable
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\"{}\" = ?{}", c.name, i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE \"{}\" = ?{}",
        ct.id,
        sets,
        ct.pk_column,
        assignable.len() + 1
    );
    let mut values = assignable
        .iter()
        .map(|c| to_sql(row.get(&c.name).unwrap_or(&Value::Null)))
        .collect::<Result<Vec<_>, _>>()?;
    values.push(SqlValue::Integer(pk));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Insert or overwrite by pk. Spelled out as exists-then-update so unique
/// constraints still fire instead of silently replacing unrelated rows.
pub fn upsert_row(conn: &Connection, ct: &ContentType, row: &Row) -> Result<(), SyncError> {
    let pk = row_pk(ct, row)?;
    let sql = format!(
        "SELECT 1 FROM \"{}\" WHERE \"{}\" = ?1",
        ct.id, ct.pk_column
    );
    let exists = conn
        .query_row(&sql, params![pk], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        update_row(conn, ct, row)
    } else {
        insert_row(conn, ct, row)
    }
}

/// Delete by pk; reports whether a row was actually removed.
pub fn delete_row(conn: &Connection, ct: &ContentType, pk: i64) -> Result<bool, SyncError> {
    let sql = format!("DELETE FROM \"{}\" WHERE \"{}\" = ?1", ct.id, ct.pk_column);
    let n = conn.execute(&sql, params![pk])?;
    Ok(n > 0)
}

pub fn max_pk(conn: &Connection, ct: &ContentType) -> Result<i64, SyncError> {
    let sql = format!(
        "SELECT COALESCE(MAX(\"{}\"), 0) FROM \"{}\"",
        ct.pk_column, ct.id
    );
    let max: i64 = conn.query_row(&sql, [], |r| r.get(0))?;
    Ok(max)
}

/// Find the pk of a row matching `wanted` on `columns` (NULL-safe equality).
pub fn find_by_values(
    conn: &Connection,
    ct: &ContentType,
    columns: &[String],
    wanted: &[Value],
) -> Result<Option<i64>, SyncError> {
    let cond = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\"{}\" IS ?{}", c, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "SELECT \"{}\" FROM \"{}\" WHERE {}",
        ct.pk_column, ct.id, cond
    );
    let values = wanted.iter().map(to_sql).collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(&sql)?;
    let pk = stmt
        .query_row(params_from_iter(values), |r| r.get(0))
        .optional()?;
    Ok(pk)
}

pub fn all_rows(conn: &Connection, ct: &ContentType) -> Result<Vec<Row>, SyncError> {
    let sql = format!(
        "SELECT {} FROM \"{}\" ORDER BY \"{}\"",
        column_list(ct),
        ct.id,
        ct.pk_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |r| {
        let mut out = Map::new();
        for (i, col) in ct.columns.iter().enumerate() {
            out.insert(col.name.clone(), from_sql(col.kind, r.get_ref(i)?));
        }
        Ok(out)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn clear_table(conn: &Connection, ct: &ContentType) -> Result<(), SyncError> {
    conn.execute(&format!("DELETE FROM \"{}\"", ct.id), [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, ColumnKind, ContentType, Registry};
    use serde_json::json;

    fn setup() -> (Connection, Registry) {
        let conn = Connection::open_in_memory().expect("open");
        let mut reg = Registry::new();
        reg.register(
            ContentType::new("gadget", "id")
                .column("name", ColumnKind::Text)
                .column("weight", ColumnKind::Real)
                .column("active", ColumnKind::Bool)
                .unique(&["name"]),
        );
        registry::create_all(&conn, &reg).expect("create_all");
        (conn, reg)
    }

    fn row(v: serde_json::Value) -> Row {
        v.as_object().expect("object").clone()
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let (conn, reg) = setup();
        let ct = reg.get("gadget").unwrap();
        let r = row(json!({"id": 1, "name": "anvil", "weight": 9.5, "active": true}));
        insert_row(&conn, ct, &r).expect("insert");

        let got = fetch_row(&conn, ct, 1).expect("fetch").expect("present");
        assert_eq!(got, r);
        assert!(fetch_row(&conn, ct, 2).expect("fetch").is_none());
    }

    #[test]
    fn missing_columns_store_as_null() {
        let (conn, reg) = setup();
        let ct = reg.get("gadget").unwrap();
        insert_row(&conn, ct, &row(json!({"id": 1, "name": "bare"}))).expect("insert");
        let got = fetch_row(&conn, ct, 1).unwrap().unwrap();
        assert_eq!(got["weight"], serde_json::Value::Null);
    }

    #[test]
    fn upsert_updates_in_place() {
        let (conn, reg) = setup();
        let ct = reg.get("gadget").unwrap();
        upsert_row(&conn, ct, &row(json!({"id": 3, "name": "a"}))).expect("insert path");
        upsert_row(&conn, ct, &row(json!({"id": 3, "name": "b"}))).expect("update path");
        let got = fetch_row(&conn, ct, 3).unwrap().unwrap();
        assert_eq!(got["name"], json!("b"));
    }

    #[test]
    fn max_pk_and_unique_lookup() {
        let (conn, reg) = setup();
        let ct = reg.get("gadget").unwrap();
        assert_eq!(max_pk(&conn, ct).unwrap(), 0);
        insert_row(&conn, ct, &row(json!({"id": 7, "name": "x"}))).unwrap();
        assert_eq!(max_pk(&conn, ct).unwrap(), 7);

        let found = find_by_values(&conn, ct, &["name".to_string()], &[json!("x")]).unwrap();
        assert_eq!(found, Some(7));
        let missing = find_by_values(&conn, ct, &["name".to_string()], &[json!("y")]).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn delete_reports_whether_row_existed() {
        let (conn, reg) = setup();
        let ct = reg.get("gadget").unwrap();
        insert_row(&conn, ct, &row(json!({"id": 1, "name": "gone"}))).unwrap();
        assert!(delete_row(&conn, ct, 1).unwrap());
        assert!(!delete_row(&conn, ct, 1).unwrap());
    }
}
