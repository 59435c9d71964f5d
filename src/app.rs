//! Application container
//!
//! Owns the connection pool, the hook registry, the rate-limit store and the
//! session registry, and hands scoped units of work to request handlers.
//! Built once at boot and injected into callers; there is no global state.

use crate::api::{Directory, Notifier};
use crate::auth::{
    hash_password, Authenticator, GroupRoleMap, RateLimiter, SessionStore, DEFAULT_WINDOW,
};
use crate::config::Config;
use crate::error::{Result, UdbError};
use crate::model::{Entity, Kind, MessageType, Role, Status, User};
use crate::rules;
use crate::session::{hooks, CommitOutcome, HookRegistry, Session};
use crate::store::{Database, Filter, Store};

/// Fallback credential of the bootstrap admin account.
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

pub struct App {
    pub config: Config,
    db: Database,
    pub store: Store,
    hooks: HookRegistry,
    pub rate_limiter: RateLimiter,
    pub auth_sessions: SessionStore,
    pub auth: Authenticator,
    notifier: Option<Box<dyn Notifier + Send + Sync>>,
}

impl App {
    /// Open the database, migrate, seed the builtin rules and the default
    /// admin account, and wire the shared services.
    pub fn bootstrap(config: Config) -> Result<App> {
        let db = Database::open(&config.db_path())?;

        {
            let conn = db.get_conn()?;
            rules::sync_builtin(&conn)?;
        }

        let store = db.store();
        let rate_limiter = RateLimiter::new(db.pool(), config.rate_limit, DEFAULT_WINDOW);
        let auth_sessions = SessionStore::new(db.pool());
        let auth = Authenticator::new(store.clone(), rate_limiter.clone());

        let app = App {
            store,
            hooks: hooks::registry(),
            rate_limiter,
            auth_sessions,
            auth,
            notifier: None,
            config,
            db,
        };
        app.create_default_admin()?;
        Ok(app)
    }

    /// Install the notification collaborator; delivered after each commit.
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier + Send + Sync>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Install the directory collaborator with the configured group-to-role
    /// mapping.
    pub fn with_directory(mut self, directory: Box<dyn Directory + Send + Sync>) -> Self {
        let roles = self.group_role_map();
        self.auth = Authenticator::new(self.store.clone(), self.rate_limiter.clone())
            .with_directory(directory, roles);
        self
    }

    /// Group-to-role mapping derived from the `ldap-*-group` keys.
    pub fn group_role_map(&self) -> GroupRoleMap {
        let config = &self.config;
        GroupRoleMap {
            required: (!config.ldap_required_group.is_empty())
                .then(|| config.ldap_required_group.clone()),
            admin: config.ldap_admin_group.clone(),
            dnszone_mgmt: config.ldap_dnszone_mgmt_group.clone(),
            subnet_mgmt: config.ldap_subnet_mgmt_group.clone(),
            user: config.ldap_user_group.clone(),
            guest: config.ldap_guest_group.clone(),
        }
    }

    /// Open a scoped unit of work attributed to `author_id`.
    pub fn session(&self, author_id: Option<i64>) -> Session<'_> {
        let session = Session::new(self.store.clone(), &self.hooks, author_id);
        match &self.notifier {
            Some(notifier) => session.with_notifier(&**notifier),
            None => session,
        }
    }

    /// One-shot creation: stage, flush, commit; returns the new id.
    pub fn create(&self, author_id: Option<i64>, entity: Entity) -> Result<i64> {
        let kind = entity.kind();
        let mut session = self.session(author_id);
        session.create(entity)?;
        let outcome = session.commit()?;
        outcome
            .changes
            .iter()
            .find(|c| c.kind == kind && c.change_type == MessageType::New)
            .map(|c| c.id)
            .ok_or_else(|| UdbError::Fatal("commit did not record the created entity".into()))
    }

    /// One-shot update; the outcome carries the change set.
    pub fn update(&self, author_id: Option<i64>, entity: Entity) -> Result<CommitOutcome> {
        let mut session = self.session(author_id);
        session.update(entity)?;
        session.commit()
    }

    /// One-shot soft delete.
    pub fn soft_delete(&self, author_id: Option<i64>, kind: Kind, id: i64) -> Result<CommitOutcome> {
        let mut session = self.session(author_id);
        session.soft_delete(kind, id)?;
        session.commit()
    }

    /// One-shot restore of a soft-deleted entity.
    pub fn restore(&self, author_id: Option<i64>, kind: Kind, id: i64) -> Result<CommitOutcome> {
        let mut session = self.session(author_id);
        session.restore(kind, id)?;
        session.commit()
    }

    /// One-shot comment on an entity's audit trail.
    pub fn comment(
        &self,
        author_id: Option<i64>,
        kind: Kind,
        id: i64,
        body: impl Into<String>,
    ) -> Result<CommitOutcome> {
        let mut session = self.session(author_id);
        session.comment(kind, id, body)?;
        session.commit()
    }

    /// Run every enabled rule out-of-band (scheduler entry point).
    pub fn evaluate_rules(&self) -> Result<Vec<rules::RuleOutcome>> {
        rules::evaluate_all(&self.store, rules::DEFAULT_STATEMENT_TIMEOUT)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Seed the admin account when the user table is empty. A pre-hashed
    /// `admin-password` from the configuration wins over the default
    /// credential.
    fn create_default_admin(&self) -> Result<()> {
        let any_user = Filter {
            include_deleted: true,
            ..Filter::default()
        };
        if self.store.count(Kind::User, &any_user)? > 0 {
            return Ok(());
        }
        let mut admin = User::new(&self.config.admin_user).with_role(Role::Admin);
        admin.meta.status = Status::Enabled;
        admin.password = if self.config.admin_password.is_empty() {
            Some(hash_password(DEFAULT_ADMIN_PASSWORD)?)
        } else {
            Some(self.config.admin_password.clone())
        };
        let id = self.create(None, Entity::User(admin))?;
        tracing::info!("created default admin user `{}` (#{})", self.config.admin_user, id);
        Ok(())
    }
}
