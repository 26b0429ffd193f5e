/*!
Table-per-subtype persistence for the users of an internship office:
students, office operators, companies, company tutors and academic tutors.

```no_run
use std::sync::Arc;
use tirocinio::{store::sqlite::SqliteSession, store::Session, user::BaseUser, UserManager};

# async fn demo() -> Result<(), tirocinio::store::DbError> {
let db = Arc::new(SqliteSession::open("tirocinio.db")?);
db.ensure_schema().await?;
let mgr = UserManager::instance_with(db);

let mut s = BaseUser::new("lverdi".into(), "l.verdi@studenti.unisa.it".into())
    .into_student("0512100042".into());
let id = mgr.save(&mut s).await?;
assert_eq!(mgr.find(id).await?, Some(s));
# Ok(())
# }
```
*/
pub mod config;
pub mod manager;
pub mod registry;
pub mod store;
pub mod user;

pub use manager::UserManager;

pub fn log_level_from_env() -> simplelog::LevelFilter {
    use simplelog::LevelFilter;

    let mut level_string = match std::env::var("LOG_LEVEL") {
        Err(_) => { return LevelFilter::Warn; },
        Ok(s) => s,
    };

    level_string.make_ascii_lowercase();
    match level_string.as_str() {
        "max" => LevelFilter::max(),
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn ensure_logging() {
        use simplelog::{TermLogger, TerminalMode, ColorChoice};
        let log_cfg = simplelog::ConfigBuilder::new()
            .add_filter_allow_str("tirocinio")
            .build();
        let res = TermLogger::init(
            log_level_from_env(),
            log_cfg,
            TerminalMode::Stdout,
            ColorChoice::Auto
        );

        match res {
            Ok(_) => { log::info!("Test logging started."); },
            Err(_) => { log::info!("Test logging already started."); },
        }
    }
}
