/*!
Postgres-backed [`Session`].

The connection is driven by a spawned tokio task; the `Client` sits behind
an async mutex so a transaction holds it exclusively from `BEGIN` until
`COMMIT`/`ROLLBACK`.
*/
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio_postgres::{Client, NoTls, Row, types::ToSql};

use super::{
    insert_sql, select_sql, TABLES,
    ColumnType, DbError, Record, Session, Transaction, Value,
};

static SCHEMA: &[(&str, &str, &str)] = &[
    (
        "SELECT FROM information_schema.tables WHERE table_name = 'utenti'",
        "CREATE TABLE utenti (
            id              BIGSERIAL PRIMARY KEY,
            data_iscrizione TIMESTAMPTZ NOT NULL DEFAULT now(),
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
        "SELECT FROM information_schema.tables WHERE table_name = 'studenti'",
        "CREATE TABLE studenti (
            studente_id BIGINT PRIMARY KEY REFERENCES utenti(id),
            matricola   TEXT NOT NULL
        )",
        "DROP TABLE studenti",
    ),

    (
        "SELECT FROM information_schema.tables WHERE table_name = 'operatori_ufficio_tirocinio'",
        "CREATE TABLE operatori_ufficio_tirocinio (
            operatore_id   BIGINT PRIMARY KEY REFERENCES utenti(id),
            codice_fiscale TEXT NOT NULL,
            ruolo          TEXT NOT NULL
        )",
        "DROP TABLE operatori_ufficio_tirocinio",
    ),

    (
        "SELECT FROM information_schema.tables WHERE table_name = 'aziende'",
        "CREATE TABLE aziende (
            azienda_id             BIGINT PRIMARY KEY REFERENCES utenti(id),
            partita_iva            TEXT NOT NULL,
            nome_rappresentante    TEXT NOT NULL,
            cognome_rappresentante TEXT NOT NULL,
            stato_convenzione      TEXT NOT NULL,
            rif_convenzione        TEXT NOT NULL,
            data_convenzione       DATE NOT NULL,
            indirizzo_sede_legale  TEXT NOT NULL,
            citta_sede_legale      TEXT NOT NULL
        )",
        "DROP TABLE aziende",
    ),

    (
        "SELECT FROM information_schema.tables WHERE table_name = 'tutor_aziendali'",
        "CREATE TABLE tutor_aziendali (
            tutor_id       BIGINT PRIMARY KEY REFERENCES utenti(id),
            azienda_id     BIGINT NOT NULL REFERENCES aziende(azienda_id),
            codice_fiscale TEXT NOT NULL,
            telefono       TEXT NOT NULL
        )",
        "DROP TABLE tutor_aziendali",
    ),

    (
        "SELECT FROM information_schema.tables WHERE table_name = 'tutor_accademici'",
        "CREATE TABLE tutor_accademici (
            tutor_id       BIGINT PRIMARY KEY REFERENCES utenti(id),
            codice_fiscale TEXT NOT NULL
        )",
        "DROP TABLE tutor_accademici",
    ),
];

/// Bound in place of `Value::Null`.
static NULL: Option<String> = None;

fn placeholder(n: usize) -> String { format!("${}", n) }

fn as_param(v: &Value) -> &(dyn ToSql + Sync) {
    match v {
        Value::Null => &NULL,
        Value::Text(s) => s,
        Value::BigInt(n) => n,
        Value::Date(d) => d,
        Value::Timestamp(t) => t,
    }
}

fn record_from_row(row: &Row, fields: &[(&str, ColumnType)]) -> Result<Record, DbError> {
    let mut rec = Record::with_capacity(fields.len());
    for (idx, (name, ty)) in fields.iter().enumerate() {
        let val = match ty {
            ColumnType::Text => row.try_get::<_, Option<String>>(idx)?
                .map(Value::Text),
            ColumnType::BigInt => row.try_get::<_, Option<i64>>(idx)?
                .map(Value::BigInt),
            ColumnType::Date => row.try_get::<_, Option<Date>>(idx)?
                .map(Value::Date),
            ColumnType::Timestamp => row.try_get::<_, Option<OffsetDateTime>>(idx)?
                .map(Value::Timestamp),
        };
        rec.push(*name, val.unwrap_or(Value::Null));
    }
    Ok(rec)
}

pub struct PgSession {
    client: Arc<Mutex<Client>>,
    /// Set when a transaction was dropped somewhere it couldn't be rolled
    /// back; the client may still be inside it.
    poisoned: Arc<AtomicBool>,
}

impl PgSession {
    pub async fn connect(connection_string: &str) -> Result<Self, DbError> {
        log::trace!(
            "PgSession::connect() called w/connection string {:?}",
            connection_string
        );

        match tokio_postgres::connect(connection_string, NoTls).await {
            Ok((client, connection)) => {
                log::trace!("    ...connection successful.");
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        log::error!("Data DB connection error: {}", &e);
                    } else {
                        log::trace!("tokio connection runtime drops.");
                    }
                });
                Ok(Self::from_client(client))
            },
            Err(e) => {
                let dberr = DbError::from(e);
                log::trace!("    ...connection failed: {:?}", &dberr);
                Err(dberr.annotate("Unable to connect"))
            }
        }
    }

    /// Wrap an already-connected client whose connection task is running.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_poisoned(&self) -> Result<(), DbError> {
        if self.poisoned.load(Ordering::SeqCst) {
            Err(DbError::Db(
                "Data DB session poisoned: a transaction was dropped without being rolled back".to_owned()
            ))
        } else {
            Ok(())
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Client>, DbError> {
        let client = self.client.lock().await;
        self.check_poisoned()?;
        Ok(client)
    }

    /// Run one or more raw SQL statements outside any transaction.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        log::trace!("PgSession::batch_execute( {:?} ) called.", sql);
        let client = self.lock().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    /**
    Drop all user tables to fully reset database state.

    This is only meant for cleanup after testing. It is advisable to look at
    the ERROR level log output when testing to ensure this method did its job.
    */
    pub async fn nuke_database(&self) -> Result<(), DbError> {
        log::trace!("PgSession::nuke_database() called.");

        let client = self.client.lock().await;
        for (_, _, drop_stmt) in SCHEMA.iter().rev() {
            if let Err(e) = client.execute(drop_stmt.to_owned(), &[]).await {
                let err = DbError::from(e);
                log::error!("Error dropping: {:?}: {}", &drop_stmt, &err);
            }
        }

        log::trace!("    ....nuking complete.");
        Ok(())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        log::trace!("PgSession::begin() called.");

        let client = self.client.clone().lock_owned().await;
        self.check_poisoned()?;
        client.batch_execute("BEGIN").await
            .map_err(|e| DbError::from(e)
                .annotate("Data DB unable to begin transaction"))?;

        Ok(Box::new(PgTransaction {
            client: Some(client),
            poisoned: self.poisoned.clone(),
        }))
    }

    async fn select_one(
        &self,
        table: &str,
        key: &str,
        value: &Value,
        fields: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError> {
        log::trace!(
            "PgSession::select_one( {:?}, {:?}, {:?}, [ {} fields ] ) called.",
            table, key, value, fields.len()
        );

        let sql = select_sql(table, key, fields, placeholder);
        let client = self.lock().await?;
        let rows = client.query(sql.as_str(), &[as_param(value)]).await?;

        match rows.first() {
            None => Ok(None),
            Some(row) => Ok(Some(record_from_row(row, fields)?)),
        }
    }

    async fn ensure_schema(&self) -> Result<(), DbError> {
        log::trace!("PgSession::ensure_schema() called.");

        let mut client = self.lock().await?;
        let t = client.transaction().await
            .map_err(|e| DbError::from(e)
                .annotate("Data DB unable to begin transaction"))?;

        for (test_stmt, create_stmt, _) in SCHEMA.iter() {
            if t.query_opt(test_stmt.to_owned(), &[]).await?.is_none() {
                log::info!(
                    "{:?} returned no results; attempting to insert table.",
                    test_stmt
                );
                t.execute(create_stmt.to_owned(), &[]).await?;
            }
        }

        t.commit().await
            .map_err(|e| DbError::from(e)
                .annotate("Error committing transaction"))
    }

    async fn count(&self, table: &str) -> Result<i64, DbError> {
        let client = self.lock().await?;
        let row = client.query_one(
            format!("SELECT COUNT(*) FROM {}", table).as_str(),
            &[]
        ).await?;
        Ok(row.try_get(0)?)
    }

    async fn clear(&self) -> Result<(), DbError> {
        log::trace!("PgSession::clear() called.");

        let mut client = self.lock().await?;
        let t = client.transaction().await?;
        for table in TABLES.iter().rev() {
            t.execute(format!("DELETE FROM {}", table).as_str(), &[]).await?;
        }
        t.commit().await?;
        Ok(())
    }
}

struct PgTransaction {
    /// `None` once committed or rolled back.
    client: Option<OwnedMutexGuard<Client>>,
    poisoned: Arc<AtomicBool>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client, DbError> {
        match &self.client {
            Some(c) => Ok(c),
            None => Err(DbError::Db("transaction already finished".to_owned())),
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        returning: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError> {
        log::trace!(
            "PgTransaction::insert( {:?}, [ {} values ] ) called.",
            table, values.len()
        );

        let sql = insert_sql(table, values, returning, placeholder);
        let params: Vec<&(dyn ToSql + Sync)> = values.iter()
            .map(|(_, v)| as_param(v))
            .collect();
        let client = self.client()?;

        if returning.is_empty() {
            let n = client.execute(sql.as_str(), &params).await?;
            return Ok(if n == 0 { None } else { Some(Record::new()) });
        }

        let rows = client.query(sql.as_str(), &params).await?;
        match rows.first() {
            None => Ok(None),
            Some(row) => Ok(Some(record_from_row(row, returning)?)),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        log::trace!("PgTransaction::commit() called.");
        match self.client.take() {
            Some(client) => {
                client.batch_execute("COMMIT").await
                    .map_err(|e| DbError::from(e)
                        .annotate("Error committing transaction"))
            },
            None => Err(DbError::Db("transaction already finished".to_owned())),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        log::trace!("PgTransaction::rollback() called.");
        match self.client.take() {
            Some(client) => {
                client.batch_execute("ROLLBACK").await
                    .map_err(|e| DbError::from(e)
                        .annotate("Error rolling back transaction"))
            },
            None => Ok(()),
        }
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // The guard moves into the task, so nobody else gets the client
        // until the ROLLBACK has gone through.
        if let Some(client) = self.client.take() {
            log::warn!("Uncommitted transaction dropped; rolling back.");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = client.batch_execute("ROLLBACK").await {
                            log::error!("Error rolling back dropped transaction: {}", &e);
                        }
                    });
                },
                Err(_) => {
                    // The guard is released below with the transaction
                    // still open, so nothing may use the client again.
                    log::error!(
                        "No tokio runtime to roll back dropped transaction; poisoning session."
                    );
                    self.poisoned.store(true, Ordering::SeqCst);
                    drop(client);
                },
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    /*!
    These tests assume you have a Postgres instance running on your local
    machine with resources named according to what you see in the
    `static TEST_CONNECTION &str`:

    ```text
    user: tirocinio_test
    password: tirocinio_test

    with write access to:

    database: tirocinio_test
    ```

    They are ignored by default:

    ```bash
    cargo test postgres -- --ignored
    ```
    */
    use super::*;
    use crate::tests::ensure_logging;

    use serial_test::serial;

    pub static TEST_CONNECTION: &str = "host=localhost user=tirocinio_test password='tirocinio_test' dbname=tirocinio_test";

    /**
    This function is for getting the database back in a blank slate state if
    a test panics partway through and leaves it munged.
    */
    #[tokio::test]
    #[ignore]
    #[serial]
    async fn reset_store() {
        ensure_logging();
        let db = PgSession::connect(TEST_CONNECTION).await.unwrap();
        db.nuke_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn create_store() {
        ensure_logging();

        let db = PgSession::connect(TEST_CONNECTION).await.unwrap();
        db.ensure_schema().await.unwrap();
        // Second time around every table already exists.
        db.ensure_schema().await.unwrap();
        assert_eq!(db.count("utenti").await.unwrap(), 0);
        db.nuke_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn commit_and_rollback() {
        ensure_logging();

        let db = PgSession::connect(TEST_CONNECTION).await.unwrap();
        db.ensure_schema().await.unwrap();
        // Tables may still hold rows from an earlier panicked run.
        db.clear().await.unwrap();

        let values = vec![
            ("login", Value::Text("pg_a".into())),
            ("password", Value::Text("x".into())),
            ("email", Value::Text("a@b.it".into())),
            ("nome", Value::Text("A".into())),
            ("cognome", Value::Text("B".into())),
            ("tipo_utente", Value::Text("studente".into())),
        ];

        let mut t = db.begin().await.unwrap();
        t.insert("utenti", &values, &[("id", ColumnType::BigInt)]).await.unwrap().unwrap();
        t.rollback().await.unwrap();
        assert_eq!(db.count("utenti").await.unwrap(), 0);

        {
            let mut t = db.begin().await.unwrap();
            t.insert("utenti", &values, &[]).await.unwrap().unwrap();
        }
        // The dropped transaction's rollback has to finish before the
        // client is handed out again.
        assert_eq!(db.count("utenti").await.unwrap(), 0);

        let mut t = db.begin().await.unwrap();
        let rec = t.insert(
            "utenti", &values,
            &[("id", ColumnType::BigInt), ("data_iscrizione", ColumnType::Timestamp)]
        ).await.unwrap().unwrap();
        t.commit().await.unwrap();
        assert!(matches!(rec.get("id"), Some(Value::BigInt(_))));
        assert!(matches!(rec.get("data_iscrizione"), Some(Value::Timestamp(_))));
        assert_eq!(db.count("utenti").await.unwrap(), 1);

        db.clear().await.unwrap();
        for table in TABLES.iter() {
            assert_eq!(db.count(table).await.unwrap(), 0, "{}", table);
        }

        db.nuke_database().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn transaction_dropped_off_runtime_poisons_session() {
        ensure_logging();

        let db = PgSession::connect(TEST_CONNECTION).await.unwrap();
        db.ensure_schema().await.unwrap();

        let t = db.begin().await.unwrap();
        std::thread::spawn(move || drop(t)).join().unwrap();

        assert!(matches!(db.begin().await, Err(DbError::Db(_))));
        assert!(matches!(db.count("utenti").await, Err(DbError::Db(_))));

        let fresh = PgSession::connect(TEST_CONNECTION).await.unwrap();
        assert!(fresh.begin().await.is_ok());
        drop(db);
        fresh.nuke_database().await.unwrap();
    }
}
