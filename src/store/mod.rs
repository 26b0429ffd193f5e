/*!
Database interaction module.

Users are stored table-per-subtype: one base table holding the fields every
user has (plus the `tipo_utente` discriminator), and one table per kind of
user holding only that kind's extra fields, keyed by the base row's `id`.

```sql
CREATE TABLE utenti (
    id              BIGSERIAL PRIMARY KEY,
    data_iscrizione TIMESTAMPTZ NOT NULL DEFAULT now(),
    login           TEXT UNIQUE NOT NULL,
    password        TEXT NOT NULL,
    email           TEXT NOT NULL,
    nome            TEXT NOT NULL,
    cognome         TEXT NOT NULL,
    tipo_utente     TEXT NOT NULL   /* 'studente', 'operatore', 'azienda',
                                       'tutor_aziendale', 'tutor_accademico' */
);

CREATE TABLE studenti (
    studente_id BIGINT PRIMARY KEY REFERENCES utenti(id),
    matricola   TEXT NOT NULL
);

CREATE TABLE operatori_ufficio_tirocinio (
    operatore_id   BIGINT PRIMARY KEY REFERENCES utenti(id),
    codice_fiscale TEXT NOT NULL,
    ruolo          TEXT NOT NULL    /* 'operatore', 'direttore_dip',
                                       'presidente_cons_did' */
);

CREATE TABLE aziende (
    azienda_id             BIGINT PRIMARY KEY REFERENCES utenti(id),
    partita_iva            TEXT NOT NULL,
    nome_rappresentante    TEXT NOT NULL,
    cognome_rappresentante TEXT NOT NULL,
    stato_convenzione      TEXT NOT NULL,   /* 'attiva', 'non_attiva' */
    rif_convenzione        TEXT NOT NULL,
    data_convenzione       DATE NOT NULL,
    indirizzo_sede_legale  TEXT NOT NULL,
    citta_sede_legale      TEXT NOT NULL
);

CREATE TABLE tutor_aziendali (
    tutor_id       BIGINT PRIMARY KEY REFERENCES utenti(id),
    azienda_id     BIGINT NOT NULL REFERENCES aziende(azienda_id),
    codice_fiscale TEXT NOT NULL,
    telefono       TEXT NOT NULL
);

CREATE TABLE tutor_accademici (
    tutor_id       BIGINT PRIMARY KEY REFERENCES utenti(id),
    codice_fiscale TEXT NOT NULL
);
```

Two backends implement [`Session`]: [`postgres::PgSession`] and
[`sqlite::SqliteSession`]. Table and column names handed to a session are
always the static identifiers from [`crate::registry`]; only values are
bound as parameters.
*/
use std::fmt::Write;

use async_trait::async_trait;
use thiserror::Error;
use time::{format_description::FormatItem, macros::format_description, Date, OffsetDateTime};

use crate::user::Kind;

pub mod postgres;
pub mod sqlite;

/// Every user table, each after the tables it references.
pub(crate) const TABLES: &[&str] = &[
    "utenti",
    "studenti",
    "operatori_ufficio_tirocinio",
    "aziende",
    "tutor_aziendali",
    "tutor_accademici",
];

/// How dates travel through backends that have no native `DATE` type.
pub(crate) const DATE_FMT: &[FormatItem] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Error)]
pub enum DbError {
    /// The user's kind has no binding in the registry in use.
    #[error("no registered binding for user kind {0}")]
    UnsupportedVariant(Kind),

    #[error("no storage session bound")]
    NoSession,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write affected no rows or didn't yield a generated id.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Stored data breaks an invariant this layer relies on.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("{0}")]
    Db(String),
}

impl DbError {
    /// Prepend some contextual `annotation` for the error.
    ///
    /// Only the message-carrying variants are annotated; the others are
    /// returned as they are so callers can still match on them.
    pub fn annotate(self, annotation: &str) -> Self {
        match self {
            DbError::Db(s) => DbError::Db(format!("{}: {}", annotation, &s)),
            DbError::PersistenceFailure(s) => {
                DbError::PersistenceFailure(format!("{}: {}", annotation, &s))
            },
            DbError::DataIntegrity(s) => {
                DbError::DataIntegrity(format!("{}: {}", annotation, &s))
            },
            other => other,
        }
    }
}

impl From<tokio_postgres::error::Error> for DbError {
    fn from(e: tokio_postgres::error::Error) -> DbError {
        let mut s = format!("Data DB: {}", &e);
        if let Some(dbe) = e.as_db_error() {
            // Writing to a String can't fail.
            let _ = write!(&mut s, "; {}", dbe);
        }
        DbError::Db(s)
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> DbError {
        DbError::Db(format!("Data DB: {}", &e))
    }
}

/// Storage type of a column, used to decode what a backend hands back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Date,
    Timestamp,
}

/// A single column value on its way into or out of storage.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    BigInt(i64),
    Date(Date),
    Timestamp(OffsetDateTime),
}

impl Value {
    pub fn into_text(self) -> Result<String, DbError> {
        match self {
            Value::Text(s) => Ok(s),
            x => Err(DbError::DataIntegrity(format!("expected text, found {:?}", &x))),
        }
    }

    pub fn into_bigint(self) -> Result<i64, DbError> {
        match self {
            Value::BigInt(n) => Ok(n),
            x => Err(DbError::DataIntegrity(format!("expected integer, found {:?}", &x))),
        }
    }

    pub fn into_date(self) -> Result<Date, DbError> {
        match self {
            Value::Date(d) => Ok(d),
            Value::Text(s) => Date::parse(&s, DATE_FMT).map_err(|e| DbError::DataIntegrity(
                format!("unable to parse {:?} as date: {}", &s, &e)
            )),
            x => Err(DbError::DataIntegrity(format!("expected date, found {:?}", &x))),
        }
    }

    pub fn into_timestamp(self) -> Result<OffsetDateTime, DbError> {
        match self {
            Value::Timestamp(t) => Ok(t),
            Value::BigInt(n) => OffsetDateTime::from_unix_timestamp(n).map_err(|e| {
                DbError::DataIntegrity(format!("{} is not a valid timestamp: {}", n, &e))
            }),
            x => Err(DbError::DataIntegrity(format!("expected timestamp, found {:?}", &x))),
        }
    }
}

/// A row: column names paired with values, in select order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(n: usize) -> Self {
        Self { fields: Vec::with_capacity(n) }
    }

    pub fn push<S: Into<String>>(&mut self, name: S, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Remove and return the value of column `name`.
    ///
    /// A column the caller asked for but the row doesn't have is a
    /// `DataIntegrity` error.
    pub fn take(&mut self, name: &str) -> Result<Value, DbError> {
        match self.fields.iter().position(|(n, _)| n == name) {
            Some(idx) => Ok(self.fields.swap_remove(idx).1),
            None => Err(DbError::DataIntegrity(format!("row has no column {:?}", name))),
        }
    }

    pub fn len(&self) -> usize { self.fields.len() }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
}

/// A bound storage session.
///
/// A session serializes its own use: while a [`Transaction`] is open, other
/// calls on the same session wait for it to finish.
#[async_trait]
pub trait Session: Send + Sync {
    /// Begin a transaction. Writes only become visible on `commit`.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Select `fields` from the first row of `table` where `key` equals
    /// `value`, or `None` if no row matches.
    async fn select_one(
        &self,
        table: &str,
        key: &str,
        value: &Value,
        fields: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError>;

    /// Create any of the user tables that don't yet exist.
    async fn ensure_schema(&self) -> Result<(), DbError>;

    /// Number of rows currently in `table`.
    async fn count(&self, table: &str) -> Result<i64, DbError>;

    /// Delete every row from every user table.
    async fn clear(&self) -> Result<(), DbError>;
}

/// An open transaction on a [`Session`].
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
#[async_trait]
pub trait Transaction: Send {
    /// Insert one row into `table`.
    ///
    /// Returns the `returning` columns of the inserted row (an empty
    /// [`Record`] if none were asked for), or `None` if nothing was inserted.
    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        returning: &[(&str, ColumnType)],
    ) -> Result<Option<Record>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Build an `INSERT` statement; `placeholder(n)` renders the n-th
/// (1-based) parameter in the backend's syntax.
pub(crate) fn insert_sql(
    table: &str,
    values: &[(&str, Value)],
    returning: &[(&str, ColumnType)],
    placeholder: fn(usize) -> String,
) -> String {
    let cols: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
    let params: Vec<String> = (1..=values.len()).map(placeholder).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table, cols.join(", "), params.join(", ")
    );
    if !returning.is_empty() {
        let ret: Vec<&str> = returning.iter().map(|(c, _)| *c).collect();
        let _ = write!(&mut sql, " RETURNING {}", ret.join(", "));
    }
    sql
}

/// Build a single-row `SELECT` on `key`.
pub(crate) fn select_sql(
    table: &str,
    key: &str,
    fields: &[(&str, ColumnType)],
    placeholder: fn(usize) -> String,
) -> String {
    let cols: Vec<&str> = fields.iter().map(|(c, _)| *c).collect();
    format!(
        "SELECT {} FROM {} WHERE {} = {} LIMIT 1",
        cols.join(", "), table, key, placeholder(1)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn insert_statement_shape() {
        let values = vec![
            ("login", Value::Text("jsmith".into())),
            ("email", Value::Text("j@smith.it".into())),
        ];
        let sql = insert_sql(
            "utenti", &values,
            &[("id", ColumnType::BigInt)],
            |n| format!("${}", n),
        );
        assert_eq!(
            sql,
            "INSERT INTO utenti (login, email) VALUES ($1, $2) RETURNING id"
        );

        let sql = insert_sql("studenti", &values[..1], &[], |n| format!("?{}", n));
        assert_eq!(sql, "INSERT INTO studenti (login) VALUES (?1)");
    }

    #[test]
    fn select_statement_shape() {
        let sql = select_sql(
            "utenti", "login",
            &[("id", ColumnType::BigInt), ("tipo_utente", ColumnType::Text)],
            |n| format!("${}", n),
        );
        assert_eq!(sql, "SELECT id, tipo_utente FROM utenti WHERE login = $1 LIMIT 1");
    }

    #[test]
    fn record_take() {
        let mut r = Record::new();
        r.push("id", Value::BigInt(3));
        r.push("login", Value::Text("x".into()));
        assert_eq!(r.take("id").unwrap(), Value::BigInt(3));
        assert_eq!(r.len(), 1);
        assert!(matches!(r.take("id"), Err(DbError::DataIntegrity(_))));
        r.take("login").unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn value_conversions() {
        assert_eq!(
            Value::Text("2021-03-04".into()).into_date().unwrap(),
            date!(2021 - 03 - 04)
        );
        assert!(Value::Text("yesterday".into()).into_date().is_err());
        assert!(Value::Null.into_text().is_err());
        assert_eq!(
            Value::BigInt(0).into_timestamp().unwrap(),
            OffsetDateTime::UNIX_EPOCH
        );
    }

    #[test]
    fn annotate_keeps_kind() {
        let e = DbError::Db("boom".into()).annotate("Inserting");
        assert_eq!(e.to_string(), "Inserting: boom");
        assert!(matches!(DbError::NoSession.annotate("x"), DbError::NoSession));
    }
}
