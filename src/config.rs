/*!
Structs to hold configuration data.
*/
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::{
    store::{postgres::PgSession, sqlite::SqliteSession, DbError, Session},
    UserManager,
};

#[derive(Deserialize)]
struct ConfigFile {
    backend: Option<String>,
    data_db_connect_string: Option<String>,
    sqlite_path: Option<String>,
}

/// Which kind of database holds the users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Backend::Postgres),
            "sqlite"   => Ok(Backend::Sqlite),
            _ => Err(format!("{:?} is not a valid backend.", s)),
        }
    }
}

#[derive(Debug)]
pub struct Cfg {
    pub backend: Backend,
    pub data_db_connect_string: String,
    pub sqlite_path: PathBuf,
}

impl std::default::Default for Cfg {
    fn default() -> Self {
        Self {
            backend: Backend::Postgres,
            data_db_connect_string: "host=localhost user=tirocinio_test password='tirocinio_test' dbname=tirocinio_test".to_owned(),
            sqlite_path: PathBuf::from("tirocinio.db"),
        }
    }
}

impl Cfg {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Unable to read config file: {}", &e))?;
        Self::from_toml(&file_contents)
    }

    /// Every key is optional; missing keys keep their default values.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let cf: ConfigFile = toml::from_str(text)
            .map_err(|e| format!("Unable to deserialize config file: {}", &e))?;

        let mut c = Self::default();

        if let Some(s) = cf.backend {
            c.backend = s.parse()?;
        }
        if let Some(s) = cf.data_db_connect_string {
            c.data_db_connect_string = s;
        }
        if let Some(s) = cf.sqlite_path {
            c.sqlite_path = PathBuf::from(s);
        }

        Ok(c)
    }

    /// Connect to (or open) the configured database.
    pub async fn open_session(&self) -> Result<Arc<dyn Session>, DbError> {
        log::trace!("Cfg::open_session() called for {:?} backend.", &self.backend);

        let session: Arc<dyn Session> = match self.backend {
            Backend::Postgres => Arc::new(
                PgSession::connect(&self.data_db_connect_string).await?
            ),
            Backend::Sqlite => Arc::new(SqliteSession::open(&self.sqlite_path)?),
        };
        Ok(session)
    }
}

/// Opens the configured database, ensures all user tables exist, and binds
/// the database to the process-wide `UserManager`.
pub async fn load_configuration(cfg: &Cfg) -> Result<&'static UserManager, String> {
    log::info!("Configuration:\n{:#?}", cfg);

    log::trace!("Opening data DB...");
    let session = cfg.open_session().await
        .map_err(|e| format!("Unable to open data DB: {}", &e))?;

    log::trace!("Checking state of data DB...");
    if let Err(e) = session.ensure_schema().await {
        let estr = format!("Unable to ensure state of data DB: {}", &e);
        return Err(estr);
    }
    log::trace!("...data DB okay.");

    Ok(UserManager::instance_with(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ensure_logging;

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = Cfg::from_toml("backend = \"sqlite\"\n").unwrap();
        assert_eq!(cfg.backend, Backend::Sqlite);
        assert_eq!(cfg.sqlite_path, PathBuf::from("tirocinio.db"));
        assert_eq!(cfg.data_db_connect_string, Cfg::default().data_db_connect_string);

        let cfg = Cfg::from_toml("").unwrap();
        assert_eq!(cfg.backend, Backend::Postgres);
    }

    #[test]
    fn every_key_read() {
        let cfg = Cfg::from_toml(
            "backend = \"postgres\"
            data_db_connect_string = \"host=db user=u dbname=d\"
            sqlite_path = \"/var/lib/tirocinio/users.db\"
            "
        ).unwrap();
        assert_eq!(cfg.backend, Backend::Postgres);
        assert_eq!(cfg.data_db_connect_string, "host=db user=u dbname=d");
        assert_eq!(cfg.sqlite_path, PathBuf::from("/var/lib/tirocinio/users.db"));
    }

    #[test]
    fn bad_config_rejected() {
        assert!(Cfg::from_toml("backend = \"mysql\"").is_err());
        assert!(Cfg::from_toml("backend = [").is_err());
        assert!(Cfg::from_file("/no/such/tirocinio.toml").is_err());
    }

    #[tokio::test]
    async fn sqlite_session_from_config() {
        ensure_logging();

        let cfg = Cfg::from_toml(
            "backend = \"sqlite\"\nsqlite_path = \":memory:\"\n"
        ).unwrap();
        let session = cfg.open_session().await.unwrap();
        session.ensure_schema().await.unwrap();
        assert_eq!(session.count("utenti").await.unwrap(), 0);
    }
}
