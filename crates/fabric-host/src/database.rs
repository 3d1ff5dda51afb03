//! Named SQLite queries.
//!
//! `db_exec(query_type, name_ptr, name_len, ident)` runs a query declared in
//! configuration, binding the call's FFI variables positionally in the order
//! they were added. The variable list is cleared by every `db_exec`.
//!
//! Select queries produce a JSON array of row objects; mutations produce
//! `{"rows_affected": n, "last_insert_id": id}`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use fabric_common::{DatabaseConfig, FabricError, HostCallError, NamedQuery, QueryType};
use fabric_core::{FfiVar, HostCall, HostRegistry, Returns, complete, reject};

const BUSY_TIMEOUT_MS: u64 = 1000;

/// A SQLite connection and the queries guests may run on it.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    queries: Arc<HashMap<String, NamedQuery>>,
}

impl Database {
    /// Open the database described by `config`.
    pub fn open(config: &DatabaseConfig) -> Result<Self, FabricError> {
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open_with_flags(
                Path::new(&config.path),
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
        }
        .map_err(|e| FabricError::invalid_config(format!("cannot open database: {e}")))?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(|e| FabricError::invalid_config(format!("cannot configure database: {e}")))?;

        let queries = config
            .queries
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect::<HashMap<_, _>>();
        info!(path = %config.path, queries = queries.len(), "Database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            queries: Arc::new(queries),
        })
    }

    /// Run raw SQL, for schema setup.
    pub fn execute_batch(&self, sql: &str) -> Result<(), FabricError> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| FabricError::invalid_config(format!("database setup failed: {e}")))
    }

    /// Run query `name`, which must be declared with `query_type`.
    pub async fn exec(
        &self,
        query_type: QueryType,
        name: &str,
        vars: Vec<FfiVar>,
    ) -> Result<Vec<u8>, HostCallError> {
        let query = self
            .queries
            .get(name)
            .ok_or_else(|| HostCallError::Capability(format!("query '{name}' not found")))?;
        if query.query_type != query_type {
            return Err(HostCallError::invalid_argument(format!(
                "query '{name}' is {:?}, not {query_type:?}",
                query.query_type
            )));
        }

        let conn = Arc::clone(&self.conn);
        let sql = query.query.clone();
        debug!(query = name, params = vars.len(), "Running query");

        tokio::task::spawn_blocking(move || run(&conn.lock(), query_type, &sql, &vars))
            .await
            .map_err(|e| HostCallError::Capability(format!("query task failed: {e}")))?
            .map_err(|e| HostCallError::Capability(format!("query '{name}' failed: {e}")))
    }
}

fn run(
    conn: &Connection,
    query_type: QueryType,
    sql: &str,
    vars: &[FfiVar],
) -> Result<Vec<u8>, rusqlite::Error> {
    let params = rusqlite::params_from_iter(
        vars.iter()
            .map(|v| String::from_utf8_lossy(&v.value).into_owned()),
    );
    let mut stmt = conn.prepare(sql)?;

    let value = if query_type == QueryType::Select {
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (i, column) in columns.iter().enumerate() {
                object.insert(column.clone(), to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Value::Array(out)
    } else {
        let rows_affected = stmt.execute(params)?;
        json!({
            "rows_affected": rows_affected,
            "last_insert_id": conn.last_insert_rowid(),
        })
    };

    Ok(value.to_string().into_bytes())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Register `db_exec`.
pub fn register(registry: &mut HostRegistry, database: Option<Database>) {
    registry.register("db_exec", 4, Returns::Value, move |call| {
        db_exec(database.clone(), call)
    });
}

fn db_exec(database: Option<Database>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("db_exec", ident, &e),
        };
        let (query_type, name_ptr, name_len) = (call.arg(0), call.arg(1), call.arg(2));
        let vars = ctx.lock().take_ffi_vars();

        let Some(database) = database else {
            let err = HostCallError::PermissionDenied {
                resource: "database".into(),
            };
            return complete(&ctx, Err(err));
        };
        let Some(query_type) = QueryType::from_i32(query_type) else {
            let err = HostCallError::invalid_argument(format!("unknown query type {query_type}"));
            return complete(&ctx, Err(err));
        };
        let name = match call.read_string(name_ptr, name_len) {
            Ok(name) => name,
            Err(e) => return complete(&ctx, Err(e)),
        };

        let result = database.exec(query_type, &name, vars).await;
        complete(&ctx, result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, value: &str) -> FfiVar {
        FfiVar {
            name: name.into(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn database() -> Database {
        let config = DatabaseConfig {
            path: ":memory:".into(),
            queries: vec![
                NamedQuery {
                    name: "add_user".into(),
                    query_type: QueryType::Insert,
                    query: "INSERT INTO users (name, age) VALUES (?, ?)".into(),
                },
                NamedQuery {
                    name: "users_over".into(),
                    query_type: QueryType::Select,
                    query: "SELECT name, age FROM users WHERE age > ? ORDER BY name".into(),
                },
            ],
        };
        let db = Database::open(&config).unwrap();
        db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_insert_then_select() {
        let db = database();

        let out = db
            .exec(QueryType::Insert, "add_user", vec![var("name", "Ada"), var("age", "36")])
            .await
            .unwrap();
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["rows_affected"], 1);
        assert_eq!(out["last_insert_id"], 1);

        db.exec(QueryType::Insert, "add_user", vec![var("name", "Bob"), var("age", "12")])
            .await
            .unwrap();

        let rows = db
            .exec(QueryType::Select, "users_over", vec![var("age", "18")])
            .await
            .unwrap();
        let rows: Value = serde_json::from_slice(&rows).unwrap();
        assert_eq!(rows, json!([{"name": "Ada", "age": 36}]));
    }

    #[tokio::test]
    async fn test_unknown_query() {
        let db = database();
        let err = db.exec(QueryType::Select, "nope", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_query_type_must_match() {
        let db = database();
        let err = db
            .exec(QueryType::Select, "add_user", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, HostCallError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_sql_errors_are_capability_errors() {
        let db = database();
        let err = db
            .exec(QueryType::Insert, "add_user", vec![var("name", "only-one")])
            .await
            .unwrap_err();
        assert!(matches!(err, HostCallError::Capability(_)));
    }
}
