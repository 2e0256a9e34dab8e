//! SQLite driver: rows map 1:1 to table rows, writes are parameterised
//! single statements, ids come from the table's integer primary key (or the
//! implicit rowid when the table lacks an `id` column).

use std::path::Path;

use once_cell::sync::Lazy;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::{SourceError, SourceResult};
use crate::row::{Row, Value};
use crate::source::{Op, Params};

pub type DbPool = Pool<SqliteConnectionManager>;

static IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub fn make_pool(path: &Path) -> SourceResult<DbPool> {
    let on_init = |conn: &mut Connection| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;
        Ok(())
    };

    let manager = SqliteConnectionManager::file(path).with_init(on_init);
    Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(SourceError::from)
}

pub struct SqliteSource {
    pool: DbPool,
    pub table: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    ty: String,
    notnull: bool,
}

impl SqliteSource {
    pub fn new(pool: DbPool, table: String, readonly: bool) -> SourceResult<Self> {
        if !IDENT.is_match(&table) {
            return Err(SourceError::validation(format!(
                "'{table}' is not a valid table name"
            )));
        }

        Ok(Self {
            pool,
            table,
            readonly,
        })
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let pool = self.pool.clone();
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            select_all(&conn, &table)
        })
        .await
        .map_err(|e| SourceError::internal(format!("sqlite worker panicked: {e}")))?
    }

    pub async fn apply(&self, op: &Op, params: &Params) -> SourceResult<Vec<Row>> {
        if self.readonly {
            return Err(SourceError::permission(format!(
                "source table '{}' is readonly",
                self.table
            )));
        }

        let pool = self.pool.clone();
        let table = self.table.clone();
        let op = op.clone();
        let params = params.clone();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;

            match &op {
                Op::Add => add(&conn, &table, &params)?,
                Op::Update => update(&conn, &table, &params)?,
                Op::Delete => delete(&conn, &table, &params)?,
                Op::Toggle => toggle(&conn, &table, &params)?,
                Op::Custom(name) => {
                    return Err(SourceError::validation(format!(
                        "sqlite sources have no custom op '{name}'"
                    )))
                }
            }

            select_all(&conn, &table)
        })
        .await
        .map_err(|e| SourceError::internal(format!("sqlite worker panicked: {e}")))?
    }

    /// Execute a user-defined `sql` action statement with `:name` parameter
    /// binding. Statements are always parameterised - the dispatcher never
    /// interpolates values into SQL text.
    pub async fn execute_statement(&self, statement: &str, params: &Params) -> SourceResult<()> {
        if self.readonly {
            return Err(SourceError::permission(format!(
                "source table '{}' is readonly",
                self.table
            )));
        }

        let pool = self.pool.clone();
        let statement = statement.to_owned();
        let params = params.clone();

        tokio::task::spawn_blocking(move || -> SourceResult<()> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&statement)?;

            // Bind only the declared parameters; extra event payload is ignored.
            for idx in 1..=stmt.parameter_count() {
                let Some(name) = stmt.parameter_name(idx).map(str::to_owned) else {
                    return Err(SourceError::validation(
                        "sql action statements must use named parameters (:name)",
                    ));
                };

                let key = name.trim_start_matches([':', '@', '$']);
                let value = params.get(key).cloned().unwrap_or(Value::Null);
                stmt.raw_bind_parameter(idx, ToSqlValue(value))?;
            }

            stmt.raw_execute()?;
            Ok(())
        })
        .await
        .map_err(|e| SourceError::internal(format!("sqlite worker panicked: {e}")))?
    }
}

fn columns(conn: &Connection, table: &str) -> SourceResult<Vec<Column>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let cols = stmt
        .query_map([], |row| {
            Ok(Column {
                name: row.get::<_, String>(1)?,
                ty: row.get::<_, String>(2)?,
                notnull: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if cols.is_empty() {
        return Err(SourceError::not_found(format!("no such table '{table}'")));
    }

    Ok(cols)
}

fn has_id_column(cols: &[Column]) -> bool {
    cols.iter().any(|c| c.name == "id")
}

fn select_all(conn: &Connection, table: &str) -> SourceResult<Vec<Row>> {
    let cols = columns(conn, table)?;
    let query = if has_id_column(&cols) {
        format!("SELECT * FROM \"{table}\"")
    } else {
        format!("SELECT rowid AS id, * FROM \"{table}\"")
    };

    let mut stmt = conn.prepare(&query)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let rows = stmt
        .query_map([], |sql_row| {
            let mut row = Row::new();
            for (i, name) in names.iter().enumerate() {
                row.set(name.clone(), from_sql(sql_row.get_ref(i)?));
            }
            Ok(row)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn add(conn: &Connection, table: &str, params: &Params) -> SourceResult<()> {
    let cols = columns(conn, table)?;

    let present: Vec<&String> = params
        .keys()
        .filter(|k| *k != "id" && cols.iter().any(|c| &c.name == *k))
        .collect();

    if present.is_empty() {
        return Err(SourceError::validation(
            "add requires at least one column value",
        ));
    }

    let names = present
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let holes = (1..=present.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = conn.prepare(&format!(
        "INSERT INTO \"{table}\" ({names}) VALUES ({holes})"
    ))?;

    for (i, name) in present.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, ToSqlValue(params[name.as_str()].clone()))?;
    }
    stmt.raw_execute()?;

    Ok(())
}

fn update(conn: &Connection, table: &str, params: &Params) -> SourceResult<()> {
    let id = require_id(params)?;
    let cols = columns(conn, table)?;

    let present: Vec<&String> = params
        .keys()
        .filter(|k| *k != "id" && cols.iter().any(|c| &c.name == *k))
        .collect();

    if present.is_empty() {
        return Err(SourceError::validation(
            "update requires at least one column value",
        ));
    }

    let sets = present
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\"{c}\" = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = conn.prepare(&format!(
        "UPDATE \"{table}\" SET {sets} WHERE id = ?{}",
        present.len() + 1
    ))?;

    for (i, name) in present.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, ToSqlValue(params[name.as_str()].clone()))?;
    }
    stmt.raw_bind_parameter(present.len() + 1, ToSqlValue(id))?;
    stmt.raw_execute()?;

    Ok(())
}

fn delete(conn: &Connection, table: &str, params: &Params) -> SourceResult<()> {
    let id = require_id(params)?;

    let mut stmt = conn.prepare(&format!("DELETE FROM \"{table}\" WHERE id = ?1"))?;
    stmt.raw_bind_parameter(1, ToSqlValue(id))?;
    stmt.raw_execute()?;

    Ok(())
}

/// Flip the boolean column named `done`, or the single `BOOLEAN NOT NULL`
/// column when exactly one exists.
fn toggle(conn: &Connection, table: &str, params: &Params) -> SourceResult<()> {
    let id = require_id(params)?;
    let cols = columns(conn, table)?;

    let target = if let Some(done) = cols.iter().find(|c| c.name == "done") {
        done.name.clone()
    } else {
        let booleans: Vec<&Column> = cols
            .iter()
            .filter(|c| c.ty.eq_ignore_ascii_case("boolean") && c.notnull)
            .collect();

        match booleans.as_slice() {
            [only] => only.name.clone(),
            [] => {
                return Err(SourceError::validation(format!(
                    "table '{table}' has no 'done' column and no BOOLEAN NOT NULL column to toggle"
                )))
            }
            _ => {
                return Err(SourceError::validation(format!(
                    "table '{table}' has multiple BOOLEAN NOT NULL columns; toggle is ambiguous"
                )))
            }
        }
    };

    let mut stmt = conn.prepare(&format!(
        "UPDATE \"{table}\" SET \"{target}\" = NOT \"{target}\" WHERE id = ?1"
    ))?;
    stmt.raw_bind_parameter(1, ToSqlValue(id))?;
    stmt.raw_execute()?;

    Ok(())
}

fn require_id(params: &Params) -> SourceResult<Value> {
    params
        .get("id")
        .cloned()
        .ok_or_else(|| SourceError::validation("write op requires an 'id' parameter"))
}

fn from_sql(value: ValueRef) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// JSON value → SQL binding.
struct ToSqlValue(Value);

impl rusqlite::ToSql for ToSqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue};

        let out = match &self.0 {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        };

        Ok(ToSqlOutput::Owned(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-sqlite-{name}-{}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn seeded(name: &str) -> SqliteSource {
        let path = temp_db(name);
        let pool = make_pool(&path).unwrap();

        let conn = pool.get().unwrap();
        conn.execute_batch(
            "CREATE TABLE tasks (id INTEGER PRIMARY KEY, text TEXT, done BOOLEAN NOT NULL DEFAULT 0);
             INSERT INTO tasks (text, done) VALUES ('A', 0), ('B', 1);",
        )
        .unwrap();
        drop(conn);

        SqliteSource::new(pool, "tasks".into(), false).unwrap()
    }

    #[tokio::test]
    async fn fetch_maps_rows() {
        let source = seeded("fetch");
        let rows = source.fetch().await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id(), "1");
        assert_eq!(rows[0].get("text"), Some(&json!("A")));
        assert_eq!(rows[1].get("done"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn toggle_flips_done_only_for_target() {
        let source = seeded("toggle");

        let mut params = Params::new();
        params.insert("id".into(), json!(1));
        let rows = source.apply(&Op::Toggle, &params).await.unwrap();

        assert_eq!(rows[0].get("done"), Some(&json!(1)));
        assert_eq!(rows[1].get("done"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn add_then_delete_round_trip() {
        let source = seeded("add");

        let mut params = Params::new();
        params.insert("text".into(), json!("C"));
        params.insert("done".into(), json!(false));
        let rows = source.apply(&Op::Add, &params).await.unwrap();
        assert_eq!(rows.len(), 3);

        let mut params = Params::new();
        params.insert("id".into(), json!(3));
        let rows = source.apply(&Op::Delete, &params).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let path = temp_db("readonly");
        let pool = make_pool(&path).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, x TEXT);")
            .unwrap();

        let source = SqliteSource::new(pool, "t".into(), true).unwrap();
        let err = source.apply(&Op::Delete, &Params::new()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Permission);
    }

    #[tokio::test]
    async fn sql_action_binds_named_params() {
        let source = seeded("action");

        let mut params = Params::new();
        params.insert("id".into(), json!(2));
        params.insert("text".into(), json!("B2"));

        source
            .execute_statement("UPDATE tasks SET text = :text WHERE id = :id", &params)
            .await
            .unwrap();

        let rows = source.fetch().await.unwrap();
        assert_eq!(rows[1].get("text"), Some(&json!("B2")));
    }

    #[test]
    fn rejects_bad_table_ident() {
        let pool = make_pool(&temp_db("ident")).unwrap();
        assert!(SqliteSource::new(pool, "tasks; DROP TABLE x".into(), false).is_err());
    }
}
