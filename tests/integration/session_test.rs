// tests/integration/session_test.rs

//! Integration tests for the built-in `SESSION.*` methods.

use super::test_helpers::{TestPair, test_config, token_for};
use peerlink::CallOptions;
use peerlink::config::UserEntry;
use peerlink::core::auth::{Credential, hash_password};
use peerlink::core::errors::CallError;
use serde_json::{Value, json};

#[tokio::test]
async fn test_token_login_binds_a_session() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    // Session-gated methods are refused before login.
    let err = caller
        .call("b", "whoami", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::SessionRequired);

    let login = caller
        .login("b", &Credential::Token(token_for("alice", "corp", None)))
        .await
        .unwrap();
    assert_eq!(login["session"]["user"], "alice");
    assert_eq!(login["session"]["domain"], "corp");

    let me = caller
        .call("b", "whoami", &Value::Null, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(me["user"], "alice");

    let info = caller.session_info("b").await.unwrap();
    assert_eq!(info["user"], "alice");

    let sso = caller
        .call("b", "SESSION.SSO", &Value::Null, &CallOptions::session())
        .await
        .unwrap();
    assert_eq!(sso["sso"]["sso"], json!({"groups": ["ops"]}));
}

#[tokio::test]
async fn test_second_login_is_refused() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let token = Credential::Token(token_for("alice", "corp", None));

    caller.login("b", &token).await.unwrap();
    let err = caller.login("b", &token).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Application(json!({"reason": "already_logged_in"}))
    );
}

#[tokio::test]
async fn test_bad_token_is_refused() {
    let pair = TestPair::new().await;
    let err = pair
        .a
        .caller()
        .login("b", &Credential::Token("00.00".to_string()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Application(json!({"reason": "bad_credential"}))
    );
}

#[tokio::test]
async fn test_logout_reports_what_it_destroyed() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    caller
        .login("b", &Credential::Token(token_for("alice", "corp", None)))
        .await
        .unwrap();
    assert_eq!(
        caller.logout("b").await.unwrap(),
        json!({"destroyed": true})
    );
    assert_eq!(
        caller.logout("b").await.unwrap(),
        json!({"destroyed": false, "reason": "nothing_to_destroy"})
    );
    assert_eq!(
        caller.session_info("b").await.unwrap_err(),
        CallError::SessionRequired
    );
}

#[tokio::test]
async fn test_per_call_token_does_not_bind_a_session() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let options = CallOptions::default().with_auth_token(token_for("bob", "corp", None));

    let me = caller
        .call("b", "whoami", &Value::Null, &options)
        .await
        .unwrap();
    assert_eq!(me["user"], "bob");

    assert_eq!(
        caller.session_info("b").await.unwrap_err(),
        CallError::SessionRequired
    );
}

#[tokio::test]
async fn test_impersonation() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    caller
        .login("b", &Credential::Token(token_for("alice", "corp", None)))
        .await
        .unwrap();

    let err = caller
        .impersonate("b", &token_for("bob", "corp", Some("carol")))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::NotAuthorized(json!({"reason": "impersonator_mismatch"}))
    );

    let err = caller
        .impersonate("b", &token_for("bob", "other", Some("alice")))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::NotAuthorized(json!({"reason": "cross_domain"}))
    );

    let switched = caller
        .impersonate("b", &token_for("bob", "corp", Some("alice")))
        .await
        .unwrap();
    assert_eq!(switched["session"]["user"], "bob");
    assert_eq!(switched["session"]["impersonator"], "alice");

    let info = caller.session_info("b").await.unwrap();
    assert_eq!(info["user"], "bob");
}

#[tokio::test]
async fn test_session_variables() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let options = CallOptions::session();

    let err = caller
        .call("b", "SESSION.GETVAR", &json!({"name": "k"}), &options)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::SessionRequired);

    caller
        .login("b", &Credential::Token(token_for("alice", "corp", None)))
        .await
        .unwrap();

    let set = caller
        .call("b", "SESSION.SETVAR", &json!({"name": "k", "value": 1}), &options)
        .await
        .unwrap();
    assert_eq!(set, json!({"previous": null}));
    let set = caller
        .call("b", "SESSION.SETVAR", &json!({"name": "k", "value": 2}), &options)
        .await
        .unwrap();
    assert_eq!(set, json!({"previous": 1}));

    let got = caller
        .call("b", "SESSION.GETVAR", &json!({"name": "k"}), &options)
        .await
        .unwrap();
    assert_eq!(got, json!({"value": 2}));

    let err = caller
        .call("b", "SESSION.SETVAR", &json!("not an object"), &options)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Application(json!({"reason": "malformed_request"}))
    );
}

#[tokio::test]
async fn test_password_login() {
    let hash = hash_password("hunter2").unwrap();
    let mut config = test_config("node-b");
    config.auth.users.push(UserEntry {
        domain: Some("corp".to_string()),
        username: "alice".to_string(),
        password_hash: hash,
    });
    let pair = TestPair::with(|a| a, move |_| peerlink::PeerNode::builder(config)).await;
    let caller = pair.a.caller();

    let err = caller
        .login(
            "b",
            &Credential::Password {
                domain: Some("corp".to_string()),
                username: "alice".to_string(),
                password: "wrong".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Application(json!({"reason": "bad_credential"}))
    );

    let login = caller
        .login(
            "b",
            &Credential::Password {
                domain: Some("corp".to_string()),
                username: "alice".to_string(),
                password: "hunter2".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(login["session"]["user"], "alice");
}

#[tokio::test]
async fn test_login_refuses_impersonation_tokens() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    let err = caller
        .login("b", &Credential::Token(token_for("bob", "corp", Some("carol"))))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Application(json!({"reason": "impersonation_token"}))
    );
    assert_eq!(
        caller.session_info("b").await.unwrap_err(),
        CallError::SessionRequired
    );
}

#[tokio::test]
async fn test_per_call_impersonation_token_is_refused() {
    let pair = TestPair::new().await;
    let options =
        CallOptions::default().with_auth_token(token_for("root", "corp", Some("carol")));

    let err = pair
        .a
        .caller()
        .call("b", "whoami", &Value::Null, &options)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::NotAuthorized(json!({"reason": "impersonation_token"}))
    );
}

#[tokio::test]
async fn test_revoked_session_is_dropped() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let token = Credential::Token(token_for("alice", "corp", None));

    // Revocation seen by an application method.
    caller.login("b", &token).await.unwrap();
    let revoked = caller
        .call("b", "revoke_session", &Value::Null, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(revoked, json!({"revoked": "alice"}));

    let err = caller
        .call("b", "whoami", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NotAuthorized(json!({"reason": "revoked"})));
    assert_eq!(
        caller.session_info("b").await.unwrap_err(),
        CallError::SessionRequired
    );

    // Revocation seen by a built-in session method.
    caller.login("b", &token).await.unwrap();
    caller
        .call("b", "revoke_session", &Value::Null, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(
        caller.session_info("b").await.unwrap_err(),
        CallError::NotAuthorized(json!({"reason": "revoked"}))
    );
    assert_eq!(
        caller.logout("b").await.unwrap(),
        json!({"destroyed": false, "reason": "nothing_to_destroy"})
    );
}

#[tokio::test]
async fn test_successful_calls_update_last_activity() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let login = caller
        .login("b", &Credential::Token(token_for("alice", "corp", None)))
        .await
        .unwrap();
    let logged_in_at = parse_time(&login["session"]["last_activity"]);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let before_call = chrono::Utc::now();
    caller
        .call("b", "whoami", &Value::Null, &CallOptions::default())
        .await
        .unwrap();

    let info = caller.session_info("b").await.unwrap();
    let last_activity = parse_time(&info["last_activity"]);
    assert!(last_activity > logged_in_at);
    assert!(last_activity >= before_call);
}

fn parse_time(value: &Value) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value.as_str().unwrap())
        .unwrap()
        .with_timezone(&chrono::Utc)
}
