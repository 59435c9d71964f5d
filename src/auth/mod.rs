//! Authentication
//!
//! Rate-limited credential checks over the local user table with an optional
//! external directory fallback, plus the persistent session registry. All
//! state-changing callers are expected to pass through here before opening a
//! unit of work.

mod password;
mod ratelimit;
mod sessions;

pub use password::{check_password, hash_password};
pub use ratelimit::{RateLimiter, DEFAULT_LIMIT, DEFAULT_WINDOW};
pub use sessions::{AuthSession, SessionStore, DEFAULT_PERSISTENT_TTL, DEFAULT_TTL};

use crate::api::{Directory, DirectoryUser};
use crate::error::{Result, UdbError};
use crate::model::{Entity, Role, Status, User};
use crate::store::Store;

/// Rate-limit scope of the JSON API surface.
pub const API_SCOPE: &str = "udb-api";
/// Rate-limit scope of the interactive login form.
pub const LOGIN_SCOPE: &str = "login";

/// Maps directory group membership to local roles, most privileged first.
/// `required` gates directory logins entirely.
#[derive(Debug, Clone, Default)]
pub struct GroupRoleMap {
    pub required: Option<String>,
    pub admin: Vec<String>,
    pub dnszone_mgmt: Vec<String>,
    pub subnet_mgmt: Vec<String>,
    pub user: Vec<String>,
    pub guest: Vec<String>,
}

impl GroupRoleMap {
    /// Role granted to a directory user, or `None` when the required group
    /// is missing.
    pub fn role_for(&self, groups: &[String]) -> Option<Role> {
        if let Some(required) = &self.required {
            if !groups.contains(required) {
                return None;
            }
        }
        let matches = |wanted: &[String]| wanted.iter().any(|g| groups.contains(g));
        if matches(&self.admin) {
            Some(Role::Admin)
        } else if matches(&self.dnszone_mgmt) {
            Some(Role::DnszoneMgmt)
        } else if matches(&self.subnet_mgmt) {
            Some(Role::SubnetMgmt)
        } else if matches(&self.user) {
            Some(Role::User)
        } else if matches(&self.guest) {
            Some(Role::Guest)
        } else {
            // No mapped group at all: least privilege.
            Some(Role::Guest)
        }
    }
}

/// Credential checker shared by the login form and the API surface.
pub struct Authenticator {
    store: Store,
    limiter: RateLimiter,
    directory: Option<Box<dyn Directory + Send + Sync>>,
    roles: GroupRoleMap,
}

impl Authenticator {
    pub fn new(store: Store, limiter: RateLimiter) -> Self {
        Self {
            store,
            limiter,
            directory: None,
            roles: GroupRoleMap::default(),
        }
    }

    pub fn with_directory(
        mut self,
        directory: Box<dyn Directory + Send + Sync>,
        roles: GroupRoleMap,
    ) -> Self {
        self.directory = Some(directory);
        self.roles = roles;
        self
    }

    /// Rate-limited credential check. The window check runs before the
    /// credentials, so a blocked client gets 429 even with a valid password;
    /// failed checks count a miss.
    pub fn authenticate(&self, scope: &str, client: &str, username: &str, password: &str) -> Result<User> {
        self.limiter.check(scope, client)?;
        match self.verify_credentials(username, password)? {
            Some(user) => Ok(user),
            None => {
                let hits = self.limiter.hit(scope, client)?;
                if self.limiter.limit() > 0 && hits >= self.limiter.limit() {
                    Err(UdbError::RateLimited)
                } else {
                    Err(UdbError::Unauthorized)
                }
            }
        }
    }

    /// Authenticate and open a session.
    pub fn login(
        &self,
        sessions: &SessionStore,
        client: &str,
        username: &str,
        password: &str,
        persistent: bool,
    ) -> Result<(User, AuthSession)> {
        let user = self.authenticate(LOGIN_SCOPE, client, username, password)?;
        let session = sessions.open(user.meta.id.expect("stored user has an id"), persistent)?;
        Ok((user, session))
    }

    fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        if let Some(user) = self.store.find_user_by_username(username)? {
            if user.meta.status != Status::Enabled {
                return Ok(None);
            }
            if user.password.is_some() {
                if check_password(password, user.password.as_deref()) {
                    return Ok(Some(user));
                }
                return Ok(None);
            }
            // Directory-backed account: probe the external directory.
            if let Some(directory) = &self.directory {
                if let Some(entry) = directory.bind(username, password)? {
                    if self.roles.role_for(&entry.groups).is_some() {
                        return Ok(Some(user));
                    }
                }
            }
            return Ok(None);
        }

        // Unknown locally: a successful directory bind creates the local row
        // with no password, carrying directory attributes.
        if let Some(directory) = &self.directory {
            if let Some(entry) = directory.bind(username, password)? {
                if let Some(role) = self.roles.role_for(&entry.groups) {
                    return Ok(Some(self.create_directory_user(entry, role)?));
                }
            }
        }
        Ok(None)
    }

    fn create_directory_user(&self, entry: DirectoryUser, role: Role) -> Result<User> {
        let mut user = User::new(&entry.username).with_role(role);
        user.fullname = entry.fullname.unwrap_or_default();
        user.email = entry.email;
        user.password = None;

        let conn = self.store.conn()?;
        let mut entity = Entity::User(user);
        crate::store::insert_entity(&conn, &mut entity)?;
        tracing::info!("created user `{}` from directory", entry.username);
        match entity {
            Entity::User(user) => Ok(user),
            _ => unreachable!(),
        }
    }
}
