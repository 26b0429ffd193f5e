/*!
Saving users and finding them again.

A [`UserManager`] writes each user as one base-table row plus one row in the
table for its kind, inside a single transaction, and rebuilds the right kind
of [`User`] from those two rows on lookup.

There is one process-wide manager, reachable through
[`UserManager::instance`], but nothing stops a caller from building its own
with [`UserManager::new`] and passing it around.
*/
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::registry::{
    Binding, Registry,
    BASE_COLUMNS, BASE_GENERATED, BASE_TABLE, DISCRIMINATOR_COLUMN,
};
use crate::store::{DbError, Session, Transaction, Value};
use crate::user::{BaseUser, User};

static INSTANCE: OnceCell<UserManager> = OnceCell::new();

/// Times the process-wide manager has been built.
#[cfg(test)]
static CONSTRUCTED: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

pub struct UserManager {
    session: RwLock<Option<Arc<dyn Session>>>,
    registry: Registry,
}

impl Default for UserManager {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for UserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UserManager")
            .field("bound", &self.session().is_some())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Roll `t` back and return the `PersistenceFailure` explaining why.
async fn abandon(t: Box<dyn Transaction>, why: String) -> DbError {
    log::warn!("Rolling back save: {}", &why);
    if let Err(e) = t.rollback().await {
        log::error!("Error rolling back save: {}", &e);
    }
    DbError::PersistenceFailure(why)
}

impl UserManager {
    /// A manager with no session bound, resolving every kind of user.
    pub fn new() -> Self {
        Self::with_registry(Registry::standard())
    }

    pub fn with_registry(registry: Registry) -> Self {
        log::trace!("UserManager::with_registry( {:?} ) called.", &registry);
        Self {
            session: RwLock::new(None),
            registry,
        }
    }

    /// The process-wide manager, created on first call.
    pub fn instance() -> &'static UserManager {
        INSTANCE.get_or_init(|| {
            log::info!("Creating process-wide UserManager.");
            #[cfg(test)]
            CONSTRUCTED.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            UserManager::new()
        })
    }

    /// The process-wide manager, with `session` bound to it.
    pub fn instance_with(session: Arc<dyn Session>) -> &'static UserManager {
        let mgr = Self::instance();
        mgr.bind_session(session);
        mgr
    }

    /// Bind `session`, replacing any session already bound. Calls already
    /// in flight finish on the session they started with.
    pub fn bind_session(&self, session: Arc<dyn Session>) {
        log::trace!("UserManager::bind_session() called.");
        let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
        if slot.replace(session).is_some() {
            log::info!("UserManager session rebound.");
        }
    }

    /// The currently bound session, if any.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    fn require_session(&self) -> Result<Arc<dyn Session>, DbError> {
        self.session().ok_or(DbError::NoSession)
    }

    fn binding_for(&self, user: &User) -> Result<&'static Binding, DbError> {
        self.registry.by_kind(user.kind())
            .ok_or(DbError::UnsupportedVariant(user.kind()))
    }

    /**
    Turn a plaintext password into what gets stored in `password`.

    This is currently the identity function; nothing stored through it is
    protected.
    */
    pub fn hash_credential(&self, plaintext: &str) -> String {
        plaintext.to_owned()
    }

    /**
    Save a new user, returning its freshly generated id.

    The saved user is not handed back; instead, on success `user` itself
    carries the generated id and the enrollment timestamp the database
    assigned. On failure nothing is written and `user` is left
    untouched.

    A user that already has an id has already been saved and is rejected
    with `InvalidArgument`.
    */
    pub async fn save(&self, user: &mut User) -> Result<i64, DbError> {
        log::trace!(
            "UserManager::save( {} {:?} ) called.",
            user.kind(), user.login()
        );

        let session = self.require_session()?;
        let binding = self.binding_for(user)?;
        if let Some(id) = user.id() {
            return Err(DbError::InvalidArgument(format!(
                "user {:?} has already been saved with id {}", user.login(), id
            )));
        }

        let base = user.base();
        let base_values = [
            ("login", Value::Text(base.login.clone())),
            ("password", Value::Text(base.password.clone())),
            ("email", Value::Text(base.email.clone())),
            ("nome", Value::Text(base.name.clone())),
            ("cognome", Value::Text(base.surname.clone())),
            (DISCRIMINATOR_COLUMN, Value::Text(binding.discriminator.to_owned())),
        ];

        let mut t = session.begin().await?;

        // Any early return via `?` drops `t`, which rolls it back.
        let inserted = t.insert(BASE_TABLE, &base_values, BASE_GENERATED).await
            .map_err(|e| e.annotate("Inserting base user"))?;
        let mut generated = match inserted {
            Some(rec) => rec,
            None => {
                let why = format!("inserting {:?} into {} affected no rows", user.login(), BASE_TABLE);
                return Err(abandon(t, why).await);
            },
        };
        let id = match generated.take("id") {
            Ok(Value::BigInt(id)) => id,
            _ => {
                let why = format!("no id generated for {:?}", user.login());
                return Err(abandon(t, why).await);
            },
        };
        let enrolled = generated.take("data_iscrizione")?.into_timestamp()?;

        let values = binding.values(id, user)?;
        let inserted = t.insert(binding.table, &values, &[]).await
            .map_err(|e| e.annotate(&format!("Inserting into {}", binding.table)))?;
        if inserted.is_none() {
            let why = format!("inserting user {} into {} affected no rows", id, binding.table);
            return Err(abandon(t, why).await);
        }

        t.commit().await?;

        let base = user.base_mut();
        base.id = Some(id);
        base.enrolled = Some(enrolled);

        log::info!(
            "Saved {} {:?} with id {}.",
            binding.discriminator, user.login(), id
        );
        Ok(id)
    }

    /// Find the user with the given `id`. `None` (or a non-positive id) is
    /// an `InvalidArgument`; an unused id is `Ok(None)`.
    pub async fn find<I>(&self, id: I) -> Result<Option<User>, DbError>
    where
        I: Into<Option<i64>>,
    {
        let id = id.into();
        log::trace!("UserManager::find( {:?} ) called.", &id);

        let id = match id {
            Some(n) if n > 0 => n,
            Some(n) => {
                return Err(DbError::InvalidArgument(format!("{} is not a valid user id", n)));
            },
            None => {
                return Err(DbError::InvalidArgument("no user id given".to_owned()));
            },
        };

        let session = self.require_session()?;
        self.hydrate(session.as_ref(), "id", Value::BigInt(id)).await
    }

    /// Find a user by `login`. If more than one user somehow shares the
    /// login, whichever the database returns first wins.
    pub async fn find_by_login<'a, L>(&self, login: L) -> Result<Option<User>, DbError>
    where
        L: Into<Option<&'a str>>,
    {
        let login = login.into();
        log::trace!("UserManager::find_by_login( {:?} ) called.", &login);

        let login = login.ok_or_else(|| {
            DbError::InvalidArgument("no login given".to_owned())
        })?;

        let session = self.require_session()?;
        self.hydrate(session.as_ref(), "login", Value::Text(login.to_owned())).await
    }

    /// Rebuild the user whose base row has `key` = `value`.
    async fn hydrate(
        &self,
        session: &dyn Session,
        key: &str,
        value: Value,
    ) -> Result<Option<User>, DbError> {
        let mut row = match session.select_one(BASE_TABLE, key, &value, BASE_COLUMNS).await? {
            None => {
                log::trace!("    ...no user with {} = {:?}.", key, &value);
                return Ok(None);
            },
            Some(row) => row,
        };

        let id = row.take("id")?.into_bigint()?;
        let disc = row.take(DISCRIMINATOR_COLUMN)?.into_text()?;
        let binding = self.registry.by_discriminator(&disc).ok_or_else(|| {
            DbError::DataIntegrity(format!(
                "user {} has unrecognized {} {:?}", id, DISCRIMINATOR_COLUMN, &disc
            ))
        })?;

        let fields = binding.fields();
        let mut sub = session.select_one(binding.table, binding.key, &Value::BigInt(id), &fields)
            .await?
            .ok_or_else(|| DbError::DataIntegrity(format!(
                "{} {} has no row in {}", binding.discriminator, id, binding.table
            )))?;

        let base = BaseUser {
            id: Some(id),
            enrolled: Some(row.take("data_iscrizione")?.into_timestamp()?),
            login: row.take("login")?.into_text()?,
            email: row.take("email")?.into_text()?,
            ..BaseUser::default()
        };
        let mut user = (binding.blank)(base);
        for col in binding.columns.iter() {
            (col.set)(&mut user, sub.take(col.name)?)
                .map_err(|e| e.annotate(&format!("{}.{} of user {}", binding.table, col.name, id)))?;
        }

        let base = user.base_mut();
        base.name = row.take("nome")?.into_text()?;
        base.surname = row.take("cognome")?.into_text()?;
        base.password = row.take("password")?.into_text()?;

        log::trace!("    ...found {} {:?} ({}).", binding.discriminator, user.login(), id);
        Ok(Some(user))
    }
}
