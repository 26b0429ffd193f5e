/*!
SQLite-backed [`Session`].

Used for embedded deployments and by the test suite. Dates are stored as
`YYYY-MM-DD` text and the enrollment timestamp as Unix seconds; foreign keys
are enforced.
*/
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OpenFlags, OptionalExtension};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    insert_sql, select_sql, TABLES, DATE_FMT,
    ColumnType, DbError, Record, Session, Transaction, Value,
};

static SCHEMA: &[(&str, &str, &str)] = &[
    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'utenti'",
        "CREATE TABLE utenti (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            data_iscrizione INTEGER NOT NULL
                            DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
            login           TEXT UNIQUE NOT NULL,
            password        TEXT NOT NULL,
            email           TEXT NOT NULL,
            nome            TEXT NOT NULL,
            cognome         TEXT NOT NULL,
            tipo_utente     TEXT NOT NULL
        )",
        "DROP TABLE utenti",
    ),

    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'studenti'",
        "CREATE TABLE studenti (
            studente_id INTEGER PRIMARY KEY REFERENCES utenti(id),
            matricola   TEXT NOT NULL
        )",
        "DROP TABLE studenti",
    ),

    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'operatori_ufficio_tirocinio'",
        "CREATE TABLE operatori_ufficio_tirocinio (
            operatore_id   INTEGER PRIMARY KEY REFERENCES utenti(id),
            codice_fiscale TEXT NOT NULL,
            ruolo          TEXT NOT NULL
        )",
        "DROP TABLE operatori_ufficio_tirocinio",
    ),

    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'aziende'",
        "CREATE TABLE aziende (
            azienda_id             INTEGER PRIMARY KEY REFERENCES utenti(id),
            partita_iva            TEXT NOT NULL,
            nome_rappresentante    TEXT NOT NULL,
            cognome_rappresentante TEXT NOT NULL,
            stato_convenzione      TEXT NOT NULL,
            rif_convenzione        TEXT NOT NULL,
            data_convenzione       TEXT NOT NULL,
            indirizzo_sede_legale  TEXT NOT NULL,
            citta_sede_legale      TEXT NOT NULL
        )",
        "DROP TABLE aziende",
    ),

    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'tutor_aziendali'",
        "CREATE TABLE tutor_aziendali (
            tutor_id       INTEGER PRIMARY KEY REFERENCES utenti(id),
            azienda_id     INTEGER NOT NULL REFERENCES aziende(azienda_id),
            codice_fiscale TEXT NOT NULL,
            telefono       TEXT NOT NULL
        )",
        "DROP TABLE tutor_aziendali",
    ),

    (
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'tutor_accademici'",
        "CREATE TABLE tutor_accademici (
            tutor_id       INTEGER PRIMARY KEY REFERENCES utenti(id),
            codice_fiscale TEXT NOT NULL
        )",
        "DROP TABLE tutor_accademici",
    ),
];

fn placeholder(n: usize) -> String { format!("?{}", n) }

fn to_sqlite(v: &Value) -> Result<SqlValue, DbError> {
    let sv = match v {
        Value::Null => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::BigInt(n) => SqlValue::Integer(*n),
        Value::Date(d) => SqlValue::Text(
            d.format(DATE_FMT)
                .map_err(|e| DbError::Db(format!("Unable to format {}: {}", d, &e)))?
        ),
        Value::Timestamp(t) => SqlValue::Integer(t.unix_timestamp()),
    };
    Ok(sv)
}

fn from_sqlite(v: SqlValue, ty: ColumnType) -> Result<Value, DbError> {
    let val = match (v, ty) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Text(s), ColumnType::Text) => Value::Text(s),
        (SqlValue::Integer(n), ColumnType::BigInt) => Value::BigInt(n),
        (SqlValue::Text(s), ColumnType::Date) => Value::Text(s).into_date().map(Value::Date)?,
        (SqlValue::Integer(n), ColumnType::Timestamp) => {
            Value::BigInt(n).into_timestamp().map(Value::Timestamp)?
        },
        (v, ty) => {
            return Err(DbError::DataIntegrity(format!(
                "stored {:?} doesn't fit column type {:?}", &v, &ty
            )));
        },
    };
    Ok(val)
}

/// Read the first `n` columns off `row` as raw SQLite values.
fn raw_columns(row: &rusqlite::Row, n: usize) -> rusqlite::Result<Vec<SqlValue>> {
    (0..n).map(|idx| row.get::<_, SqlValue>(idx)).collect()
}

fn record_from_raw(
    raw: Vec<SqlValue>,
    fields: &[(&str, ColumnType)],
) -> Result<Record, DbError> {
    let mut rec = Record::with_capacity(fields.len());
    for (v, (name, ty)) in raw.into_iter().zip(fields.iter()) {
        rec.push(*name, from_sqlite(v, *ty)?);
    }
    Ok(rec)
}

pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSession {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref();
        log::trace!("SqliteSession::open( {:?} ) called.", path);

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        ).map_err(|e| DbError::from(e).annotate("Unable to open"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        log::trace!("SqliteSession::open_in_memory() called.");
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| DbError::from(e).annotate("Unable to enable foreign keys"))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run one or more raw SQL statements outside any transaction.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        log::trace!("SqliteSession::batch_execute( {:?} ) called.", sql);
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        log::trace!("SqliteSession::begin() called.");

        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")
            .map_err(|e| DbError::from(e)
                .annotate("Data DB unable to begin transaction"))?;

        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }

    async fn select_one(
        &self,
        table: &str,
        key: &str,
        value: &Value,
        fields: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError> {
        log::trace!(
            "SqliteSession::select_one( {:?}, {:?}, {:?}, [ {} fields ] ) called.",
            table, key, value, fields.len()
        );

        let sql = select_sql(table, key, fields, placeholder);
        let param = to_sqlite(value)?;
        let conn = self.conn.lock().await;
        let raw = conn.query_row(
            &sql,
            [param],
            |row| raw_columns(row, fields.len())
        ).optional()?;

        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(record_from_raw(raw, fields)?)),
        }
    }

    async fn ensure_schema(&self) -> Result<(), DbError> {
        log::trace!("SqliteSession::ensure_schema() called.");

        let mut conn = self.conn.lock().await;
        let t = conn.transaction()
            .map_err(|e| DbError::from(e)
                .annotate("Data DB unable to begin transaction"))?;

        for (test_stmt, create_stmt, _) in SCHEMA.iter() {
            let exists = t.query_row(test_stmt, [], |_| Ok(())).optional()?;
            if exists.is_none() {
                log::info!(
                    "{:?} returned no results; attempting to insert table.",
                    test_stmt
                );
                t.execute_batch(create_stmt)?;
            }
        }

        t.commit()
            .map_err(|e| DbError::from(e)
                .annotate("Error committing transaction"))
    }

    async fn count(&self, table: &str) -> Result<i64, DbError> {
        let conn = self.conn.lock().await;
        let n = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table),
            [],
            |row| row.get(0)
        )?;
        Ok(n)
    }

    async fn clear(&self) -> Result<(), DbError> {
        log::trace!("SqliteSession::clear() called.");

        let mut conn = self.conn.lock().await;
        let t = conn.transaction()?;
        for table in TABLES.iter().rev() {
            t.execute(&format!("DELETE FROM {}", table), [])?;
        }
        t.commit()?;
        Ok(())
    }
}

struct SqliteTransaction {
    /// `None` once committed or rolled back.
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl SqliteTransaction {
    fn conn(&self) -> Result<&Connection, DbError> {
        match &self.conn {
            Some(c) => Ok(c),
            None => Err(DbError::Db("transaction already finished".to_owned())),
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        returning: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError> {
        log::trace!(
            "SqliteTransaction::insert( {:?}, [ {} values ] ) called.",
            table, values.len()
        );

        let sql = insert_sql(table, values, returning, placeholder);
        let params = values.iter()
            .map(|(_, v)| to_sqlite(v))
            .collect::<Result<Vec<SqlValue>, DbError>>()?;
        let conn = self.conn()?;

        if returning.is_empty() {
            let n = conn.execute(&sql, params_from_iter(params))?;
            return Ok(if n == 0 { None } else { Some(Record::new()) });
        }

        let raw = conn.query_row(
            &sql,
            params_from_iter(params),
            |row| raw_columns(row, returning.len())
        ).optional()?;

        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(record_from_raw(raw, returning)?)),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        log::trace!("SqliteTransaction::commit() called.");
        match self.conn.take() {
            Some(conn) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    // A failed COMMIT can leave the transaction open.
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(DbError::from(e).annotate("Error committing transaction"));
                }
                Ok(())
            },
            None => Err(DbError::Db("transaction already finished".to_owned())),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        log::trace!("SqliteTransaction::rollback() called.");
        match self.conn.take() {
            Some(conn) => {
                conn.execute_batch("ROLLBACK")
                    .map_err(|e| DbError::from(e)
                        .annotate("Error rolling back transaction"))
            },
            None => Ok(()),
        }
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            log::warn!("Uncommitted transaction dropped; rolling back.");
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                log::error!("Error rolling back dropped transaction: {}", &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ensure_logging;

    use time::macros::date;

    fn base_values(login: &str) -> Vec<(&'static str, Value)> {
        vec![
            ("login", Value::Text(login.to_owned())),
            ("password", Value::Text("x".into())),
            ("email", Value::Text(format!("{}@unisa.it", login))),
            ("nome", Value::Text("Anna".into())),
            ("cognome", Value::Text("Bianchi".into())),
            ("tipo_utente", Value::Text("studente".into())),
        ]
    }

    const GENERATED: &[(&str, ColumnType)] = &[
        ("id", ColumnType::BigInt),
        ("data_iscrizione", ColumnType::Timestamp),
    ];

    async fn new_session() -> SqliteSession {
        let db = SqliteSession::open_in_memory().unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        ensure_logging();
        let db = new_session().await;
        db.ensure_schema().await.unwrap();
        for table in TABLES.iter() {
            assert_eq!(db.count(table).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn insert_returns_generated_columns() {
        ensure_logging();
        let db = new_session().await;

        let mut t = db.begin().await.unwrap();
        let mut rec = t.insert("utenti", &base_values("anna"), GENERATED)
            .await.unwrap().unwrap();
        t.commit().await.unwrap();

        let id = rec.take("id").unwrap().into_bigint().unwrap();
        assert!(id > 0);
        assert!(matches!(rec.take("data_iscrizione").unwrap(), Value::Timestamp(_)));

        let found = db.select_one("utenti", "id", &Value::BigInt(id), GENERATED)
            .await.unwrap().unwrap();
        assert_eq!(found.get("id"), Some(&Value::BigInt(id)));
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_writes() {
        ensure_logging();
        let db = new_session().await;

        let mut t = db.begin().await.unwrap();
        t.insert("utenti", &base_values("anna"), GENERATED).await.unwrap().unwrap();
        t.rollback().await.unwrap();
        assert_eq!(db.count("utenti").await.unwrap(), 0);

        {
            let mut t = db.begin().await.unwrap();
            t.insert("utenti", &base_values("anna"), &[]).await.unwrap().unwrap();
        }
        assert_eq!(db.count("utenti").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn foreign_keys_enforced() {
        ensure_logging();
        let db = new_session().await;

        let mut t = db.begin().await.unwrap();
        let res = t.insert(
            "studenti",
            &[("studente_id", Value::BigInt(99)), ("matricola", Value::Text("1".into()))],
            &[]
        ).await;
        assert!(matches!(res, Err(DbError::Db(_))));
    }

    #[tokio::test]
    async fn dates_round_trip() {
        ensure_logging();
        let db = new_session().await;

        let mut t = db.begin().await.unwrap();
        let id = t.insert("utenti", &base_values("acme"), GENERATED)
            .await.unwrap().unwrap()
            .take("id").unwrap()
            .into_bigint().unwrap();
        let values = vec![
            ("azienda_id", Value::BigInt(id)),
            ("partita_iva", Value::Text("01234567890".into())),
            ("nome_rappresentante", Value::Text("Wile".into())),
            ("cognome_rappresentante", Value::Text("Coyote".into())),
            ("stato_convenzione", Value::Text("attiva".into())),
            ("rif_convenzione", Value::Text("R-1".into())),
            ("data_convenzione", Value::Date(date!(2017 - 06 - 15))),
            ("indirizzo_sede_legale", Value::Text("Via Roma 1".into())),
            ("citta_sede_legale", Value::Text("Salerno".into())),
        ];
        t.insert("aziende", &values, &[]).await.unwrap().unwrap();
        t.commit().await.unwrap();

        let rec = db.select_one(
            "aziende", "azienda_id", &Value::BigInt(id),
            &[("data_convenzione", ColumnType::Date)]
        ).await.unwrap().unwrap();
        assert_eq!(rec.get("data_convenzione"), Some(&Value::Date(date!(2017 - 06 - 15))));
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        ensure_logging();
        let db = new_session().await;
        let found = db.select_one("utenti", "login", &Value::Text("nobody".into()), GENERATED)
            .await.unwrap();
        assert!(found.is_none());
    }
}
