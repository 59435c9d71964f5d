use crate::config::Config;
use crate::error::{ConfigError, Result, UdbError};

/// Configuration validator: collects every violation before failing.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_server(config, &mut errors);
        Self::validate_database(config, &mut errors);
        Self::validate_ldap(config, &mut errors);
        Self::validate_smtp(config, &mut errors);
        Self::validate_process(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(UdbError::ConfigValidation { errors })
        }
    }

    fn validate_server(config: &Config, errors: &mut Vec<ConfigError>) {
        if config.server_port == 0 {
            errors.push(ConfigError::new("server-port", "port must be non-zero"));
        }
        if config.server_host.trim().is_empty() {
            errors.push(ConfigError::new("server-host", "host must not be empty"));
        }
    }

    fn validate_database(config: &Config, errors: &mut Vec<ConfigError>) {
        if config.db_uri.trim().is_empty() {
            errors.push(ConfigError::new("db-uri", "a database location is required"));
        }
    }

    fn validate_ldap(config: &Config, errors: &mut Vec<ConfigError>) {
        if config.ldap_uri.is_empty() {
            let group_keys = [
                ("ldap-required-group", !config.ldap_required_group.is_empty()),
                ("ldap-admin-group", !config.ldap_admin_group.is_empty()),
                ("ldap-dnszone-mgmt-group", !config.ldap_dnszone_mgmt_group.is_empty()),
                ("ldap-subnet-mgmt-group", !config.ldap_subnet_mgmt_group.is_empty()),
                ("ldap-user-group", !config.ldap_user_group.is_empty()),
                ("ldap-guest-group", !config.ldap_guest_group.is_empty()),
            ];
            for (key, set) in group_keys {
                if set {
                    errors.push(ConfigError::new(key, "requires ldap-uri to be configured"));
                }
            }
        } else if !config.ldap_uri.starts_with("ldap://") && !config.ldap_uri.starts_with("ldaps://") {
            errors.push(ConfigError::new("ldap-uri", "expected an ldap:// or ldaps:// URI"));
        }
    }

    fn validate_smtp(config: &Config, errors: &mut Vec<ConfigError>) {
        if !matches!(config.smtp_encryption.as_str(), "" | "none" | "ssl" | "starttls") {
            errors.push(ConfigError::new(
                "smtp-encryption",
                "expected one of: none, ssl, starttls",
            ));
        }
        if config.smtp_server.is_empty() && !config.notification_catch_all_email.is_empty() {
            errors.push(ConfigError::new(
                "notification-catch-all-email",
                "requires smtp-server to be configured",
            ));
        }
    }

    fn validate_process(config: &Config, errors: &mut Vec<ConfigError>) {
        if !config.umask.is_empty() && u32::from_str_radix(&config.umask, 8).is_err() {
            errors.push(ConfigError::new("umask", "expected an octal mode like 027"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut config = Config::default();
        config.server_port = 0;
        config.db_uri = String::new();
        config.smtp_encryption = "tls13".to_string();
        match ConfigValidator::validate(&config) {
            Err(UdbError::ConfigValidation { errors }) => {
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_ldap_groups_require_uri() {
        let mut config = Config::default();
        config.ldap_admin_group = vec!["net-admins".to_string()];
        assert!(ConfigValidator::validate(&config).is_err());

        config.ldap_uri = "ldaps://ldap.example.com".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_umask_must_be_octal() {
        let mut config = Config::default();
        config.umask = "027".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());
        config.umask = "9x".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
