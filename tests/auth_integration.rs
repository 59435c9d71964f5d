//! Authentication and rate-limit integration tests against the API surface
//! semantics.

use tempfile::TempDir;

use udb::auth::{self, API_SCOPE};
use udb::config::Config;
use udb::{App, UdbError};

fn test_app(rate_limit: u32) -> (TempDir, App) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.rate_limit = rate_limit;
    config.db_uri = temp_dir.path().join("test.db").to_string_lossy().into_owned();
    let app = App::bootstrap(config).unwrap();
    (temp_dir, app)
}

#[test]
fn test_api_rate_limit_sticks_through_valid_credentials() {
    // With rate-limit=20: 40 valid requests pass, 19 invalid ones get 401,
    // the 20th miss gets 429, and even valid credentials stay blocked.
    let (_guard, app) = test_app(20);
    let client = "192.0.2.7";

    for _ in 0..40 {
        let user = app
            .auth
            .authenticate(API_SCOPE, client, "admin", "admin123")
            .unwrap();
        assert_eq!(user.username, "admin");
    }

    for _ in 0..19 {
        match app.auth.authenticate(API_SCOPE, client, "admin", "wrong") {
            Err(UdbError::Unauthorized) => {}
            other => panic!("expected 401, got {other:?}"),
        }
    }

    match app.auth.authenticate(API_SCOPE, client, "admin", "wrong") {
        Err(UdbError::RateLimited) => {}
        other => panic!("expected 429, got {other:?}"),
    }
    match app.auth.authenticate(API_SCOPE, client, "admin", "admin123") {
        Err(UdbError::RateLimited) => {}
        other => panic!("expected 429 with valid credentials, got {other:?}"),
    }

    // The error maps to HTTP 429 at the dispatcher boundary.
    assert_eq!(UdbError::RateLimited.http_status(), 429);
}

#[test]
fn test_login_issues_session_and_logout_clears_it() {
    let (_guard, app) = test_app(20);

    let (user, session) = app
        .auth
        .login(&app.auth_sessions, "127.0.0.1", "admin", "admin123", false)
        .unwrap();
    assert_eq!(user.username, "admin");

    let resolved = app.auth_sessions.get(&session.id).unwrap().unwrap();
    assert_eq!(resolved.user_id, user.meta.id);

    app.auth_sessions.logout(&session.id).unwrap();
    assert!(app.auth_sessions.get(&session.id).unwrap().is_none());
}

#[test]
fn test_persistent_login_extends_expiry() {
    let (_guard, app) = test_app(20);

    let (_, short) = app
        .auth
        .login(&app.auth_sessions, "127.0.0.1", "admin", "admin123", false)
        .unwrap();
    let (_, long) = app
        .auth
        .login(&app.auth_sessions, "127.0.0.1", "admin", "admin123", true)
        .unwrap();
    assert!(long.expires_at > short.expires_at);
    assert!(long.persistent);
}

#[test]
fn test_unknown_user_is_unauthorized_without_directory() {
    let (_guard, app) = test_app(20);
    match app
        .auth
        .authenticate(auth::LOGIN_SCOPE, "127.0.0.1", "ghost", "boo")
    {
        Err(UdbError::Unauthorized) => {}
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_rate_limit_disabled_with_zero() {
    let (_guard, app) = test_app(0);
    for _ in 0..50 {
        match app
            .auth
            .authenticate(auth::LOGIN_SCOPE, "127.0.0.1", "admin", "wrong")
        {
            Err(UdbError::Unauthorized) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }
    app.auth
        .authenticate(auth::LOGIN_SCOPE, "127.0.0.1", "admin", "admin123")
        .unwrap();
}
