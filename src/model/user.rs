//! User accounts and roles

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Meta, NameLookup};
use crate::error::{Result, UdbError};

/// Access role granted to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    DnszoneMgmt,
    SubnetMgmt,
    User,
    Guest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::DnszoneMgmt => "dnszone-mgmt",
            Role::SubnetMgmt => "subnet-mgmt",
            Role::User => "user",
            Role::Guest => "guest",
        }
    }
}

impl FromStr for Role {
    type Err = UdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "dnszone-mgmt" => Ok(Role::DnszoneMgmt),
            "subnet-mgmt" => Ok(Role::SubnetMgmt),
            "user" => Ok(Role::User),
            "guest" => Ok(Role::Guest),
            other => Err(UdbError::validation("role", format!("`{other}` is not a valid role"))),
        }
    }
}

/// A user account. The username is unique case-insensitively among
/// non-deleted rows; an empty or absent email never collides. `password`
/// holds a hash (argon2 or legacy SSHA) or nothing for directory-backed
/// accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub meta: Meta,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub fullname: String,
    pub email: Option<String>,
    pub role: Role,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        let username: String = username.into();
        Self {
            meta: Meta::default(),
            username: username.trim().to_string(),
            password: None,
            fullname: String::new(),
            email: None,
            role: Role::User,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn summary(&self) -> String {
        if self.fullname.is_empty() {
            self.username.clone()
        } else {
            self.fullname.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(UdbError::validation("username", "username cannot be empty"));
        }
        if let Some(email) = &self.email {
            if !email.is_empty() && !email.contains('@') {
                return Err(UdbError::validation("email", "expected a valid email address"));
            }
        }
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("username".into(), Value::String(self.username.clone()));
        fields.insert("fullname".into(), Value::String(self.fullname.clone()));
        fields.insert(
            "email".into(),
            self.email.clone().map(Value::String).unwrap_or(Value::Null),
        );
        fields.insert("role".into(), Value::String(self.role.as_str().to_string()));
        // The password hash never appears in audit entries.
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Admin, Role::DnszoneMgmt, Role::SubnetMgmt, Role::User, Role::Guest] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_username_required() {
        assert!(User::new("admin").validate().is_ok());
        assert!(User::new(" ").validate().is_err());
    }

    #[test]
    fn test_empty_email_is_valid() {
        let mut user = User::new("user1");
        user.email = Some(String::new());
        assert!(user.validate().is_ok());
        user.email = Some("nonsense".into());
        assert!(user.validate().is_err());
    }

    #[test]
    fn test_summary_prefers_fullname() {
        let mut user = User::new("jdoe");
        assert_eq!(user.summary(), "jdoe");
        user.fullname = "Jane Doe".into();
        assert_eq!(user.summary(), "Jane Doe");
    }

    #[test]
    fn test_password_hash_not_audited() {
        let mut user = User::new("jdoe");
        user.password = Some("$argon2id$...".into());
        let fields = user.audit_fields(&crate::model::NoLookup);
        assert!(!fields.contains_key("password"));
    }
}
