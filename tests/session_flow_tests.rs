//! End-to-end session flows against a live PostgreSQL.
//! Set `FORGEHUB_TEST_DB` to a connection string to enable these tests;
//! without it every test is a clean skip. Each test installs the schema into
//! its own namespace so the suite can run concurrently.

use std::collections::HashMap;

use anyhow::Result;
use sea_query::{Value, Values};

use forgehub::auth::{
    password_login, ssl_login, ClientIdentity, RequestContext, Session, SessionCreds, SessionInfo,
};
use forgehub::{HubConfig, HubError, PgConn};

const SCHEMA_SQL: &str = include_str!("../scripts/schema.sql");

fn test_dsn() -> Option<String> {
    std::env::var("FORGEHUB_TEST_DB").ok()
}

/// Fresh namespace with the full schema installed. `None` when no test
/// database is configured.
async fn setup(namespace: &str) -> Result<Option<PgConn>> {
    let Some(dsn) = test_dsn() else { return Ok(None) };
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut conn = PgConn::connect(&dsn).await?;
    conn.batch(&format!("DROP SCHEMA IF EXISTS {} CASCADE", namespace)).await?;
    conn.batch(&format!("CREATE SCHEMA {}", namespace)).await?;
    conn.batch(&format!("SET search_path TO {}", namespace)).await?;
    conn.batch(SCHEMA_SQL).await?;
    conn.commit().await?;
    Ok(Some(conn))
}

/// Second connection into an already-installed namespace.
async fn connect_into(namespace: &str) -> Result<PgConn> {
    let dsn = test_dsn().expect("caller checked");
    let mut conn = PgConn::connect(&dsn).await?;
    conn.batch(&format!("SET search_path TO {}", namespace)).await?;
    conn.commit().await?;
    Ok(conn)
}

fn ctx(method: &str) -> RequestContext {
    let config = HubConfig { check_client_ip: false, ..HubConfig::default() };
    RequestContext::new(config, method)
}

fn creds(info: &SessionInfo, callnum: Option<i32>) -> SessionCreds {
    SessionCreds { id: info.session_id, key: info.session_key.clone(), callnum }
}

async fn seed_user(conn: &mut PgConn, name: &str, password: &str) -> Result<i32> {
    let stmt = (
        "INSERT INTO users (name, password) VALUES ($1, $2) RETURNING id".to_string(),
        Values(vec![name.into(), password.into()]),
    );
    let rows = conn.query(&stmt).await?;
    conn.commit().await?;
    Ok(rows[0].try_get(0)?)
}

async fn set_user_status(conn: &mut PgConn, user_id: i32, status: i32) -> Result<()> {
    let stmt = (
        "UPDATE users SET status = $1 WHERE id = $2".to_string(),
        Values(vec![status.into(), user_id.into()]),
    );
    conn.execute(&stmt).await?;
    conn.commit().await?;
    Ok(())
}

/// (expired, exclusive, callnum) of a session row.
async fn session_state(
    conn: &mut PgConn,
    session_id: i32,
) -> Result<(bool, Option<bool>, Option<i32>)> {
    let stmt = (
        "SELECT expired, \"exclusive\", callnum FROM sessions WHERE id = $1".to_string(),
        Values(vec![Value::Int(Some(session_id))]),
    );
    let rows = conn.query(&stmt).await?;
    conn.commit().await?;
    let row = &rows[0];
    Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
}

#[tokio::test]
async fn password_login_rejects_bad_credentials() -> Result<()> {
    let Some(mut conn) = setup("fh_badcreds").await? else { return Ok(()) };
    let user_id = seed_user(&mut conn, "alice", "sekret").await?;

    // empty password short-circuits before any query
    let err = password_login(&ctx("login"), &mut conn, None, "alice", "").await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));

    let err =
        password_login(&ctx("login"), &mut conn, None, "alice", "wrong").await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;

    // blocked users cannot log in even with the right password
    set_user_status(&mut conn, user_id, 1).await?;
    let err =
        password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;

    set_user_status(&mut conn, user_id, 0).await?;
    assert!(password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await.is_ok());
    Ok(())
}

#[tokio::test]
async fn callnum_is_staged_and_committed_with_the_call() -> Result<()> {
    let Some(mut conn) = setup("fh_callnum").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;
    let info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;

    let session =
        Session::resolve(&ctx("build"), &mut conn, &creds(&info, Some(345))).await?;
    assert_eq!(session.callnum, Some(345));
    // the callnum write is staged, not committed
    assert!(conn.in_transaction());
    let mut observer = connect_into("fh_callnum").await?;
    let (_, _, stored) = session_state(&mut observer, info.session_id).await?;
    assert_eq!(stored, None);

    // the dispatcher's final commit makes it durable
    conn.commit().await?;
    let (_, _, stored) = session_state(&mut observer, info.session_id).await?;
    assert_eq!(stored, Some(345));

    // replaying 345 is only allowed for whitelisted methods
    let err = Session::resolve(&ctx("build"), &mut conn, &creds(&info, Some(345)))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Retry(_)));
    conn.rollback().await?;

    Session::resolve(&ctx("host.updateHost"), &mut conn, &creds(&info, Some(345))).await?;
    conn.rollback().await?;

    // a regressed number is never allowed
    let err = Session::resolve(&ctx("build"), &mut conn, &creds(&info, Some(344)))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Sequence(_)));
    conn.rollback().await?;

    // normal progression
    Session::resolve(&ctx("build"), &mut conn, &creds(&info, Some(346))).await?;
    conn.commit().await?;
    let (_, _, stored) = session_state(&mut observer, info.session_id).await?;
    assert_eq!(stored, Some(346));
    Ok(())
}

#[tokio::test]
async fn bad_session_credentials_are_rejected() -> Result<()> {
    let Some(mut conn) = setup("fh_badsession").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;
    let info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;

    let wrong_key = SessionCreds {
        id: info.session_id,
        key: "not-the-key".to_string(),
        callnum: None,
    };
    let err = Session::resolve(&ctx("build"), &mut conn, &wrong_key).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;

    let wrong_id = SessionCreds { id: info.session_id + 999, key: info.session_key.clone(), callnum: None };
    let err = Session::resolve(&ctx("build"), &mut conn, &wrong_id).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn client_ip_binding_rejects_roaming_sessions() -> Result<()> {
    let Some(mut conn) = setup("fh_hostip").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;

    let config = HubConfig::default();
    let login_ctx =
        RequestContext::new(config.clone(), "login").with_remote_addr("10.9.8.7");
    let info = password_login(&login_ctx, &mut conn, None, "alice", "sekret").await?;

    let same_ip = RequestContext::new(config.clone(), "build").with_remote_addr("10.9.8.7");
    Session::resolve(&same_ip, &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;

    let other_ip = RequestContext::new(config, "build").with_remote_addr("10.9.8.8");
    let err = Session::resolve(&other_ip, &mut conn, &creds(&info, None)).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn logout_cascades_to_subsessions() -> Result<()> {
    let Some(mut conn) = setup("fh_cascade").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;
    let info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;

    let master = Session::resolve(&ctx("subsession"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    let sub = master.subsession(&mut conn).await?;
    // a subsession of the subsession still hangs off the original master
    let sub_session =
        Session::resolve(&ctx("subsession"), &mut conn, &creds(&sub, None)).await?;
    conn.commit().await?;
    let sub2 = sub_session.subsession(&mut conn).await?;

    let master_id = info.session_id;
    let master = Session::resolve(&ctx("logout"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    master.logout(&mut conn).await?;

    for id in [master_id, sub.session_id, sub2.session_id] {
        let (expired, exclusive, _) = session_state(&mut conn, id).await?;
        assert!(expired, "session {} should be expired", id);
        assert_eq!(exclusive, None);
    }

    // expiry is terminal: resolving any of them now fails
    let err =
        Session::resolve(&ctx("build"), &mut conn, &creds(&sub, None)).await.unwrap_err();
    assert!(matches!(err, HubError::AuthExpired(_)));
    assert_eq!(err.fault_code(), 1007);
    conn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn logout_child_only_touches_owned_subsessions() -> Result<()> {
    let Some(mut conn) = setup("fh_child").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;
    seed_user(&mut conn, "mallory", "sekret").await?;

    let alice_info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;
    let alice =
        Session::resolve(&ctx("subsession"), &mut conn, &creds(&alice_info, None)).await?;
    conn.commit().await?;
    let sub = alice.subsession(&mut conn).await?;

    let mallory_info =
        password_login(&ctx("login"), &mut conn, None, "mallory", "sekret").await?;
    let mallory =
        Session::resolve(&ctx("logout"), &mut conn, &creds(&mallory_info, None)).await?;
    conn.commit().await?;

    // not mallory's subsession; the guarded update matches nothing
    mallory.logout_child(&mut conn, sub.session_id).await?;
    let (expired, _, _) = session_state(&mut conn, sub.session_id).await?;
    assert!(!expired);

    alice.logout_child(&mut conn, sub.session_id).await?;
    let (expired, _, _) = session_state(&mut conn, sub.session_id).await?;
    assert!(expired);
    Ok(())
}

#[tokio::test]
async fn exclusive_sessions_conflict_and_can_be_stolen() -> Result<()> {
    let Some(mut conn) = setup("fh_exclusive").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;

    let s1_info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;
    let mut s1 =
        Session::resolve(&ctx("exclusiveSession"), &mut conn, &creds(&s1_info, None)).await?;
    conn.commit().await?;
    s1.make_exclusive(&mut conn, false).await?;
    assert!(s1.exclusive);

    // a second session for the same user sees a soft conflict
    let s2_info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;
    let mut s2 =
        Session::resolve(&ctx("exclusiveSession"), &mut conn, &creds(&s2_info, None)).await?;
    conn.commit().await?;
    assert!(!s2.exclusive);
    let err = s2.validate().unwrap_err();
    assert!(matches!(err, HubError::AuthLock(_)));

    // polite claim fails while s1 holds the slot
    let err = s2.make_exclusive(&mut conn, false).await.unwrap_err();
    assert!(matches!(err, HubError::AuthLock(_)));
    conn.rollback().await?;

    // forced claim expires s1 under the same user-row lock
    s2.make_exclusive(&mut conn, true).await?;
    assert!(s2.exclusive);
    let (expired, exclusive, _) = session_state(&mut conn, s1_info.session_id).await?;
    assert!(expired);
    assert_eq!(exclusive, None);

    let err = Session::resolve(&ctx("build"), &mut conn, &creds(&s1_info, None))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AuthExpired(_)));
    conn.rollback().await?;

    // invariant: exactly one active exclusive session for the user
    let stmt = (
        "SELECT COUNT(*) FROM sessions WHERE expired = FALSE AND \"exclusive\" = TRUE"
            .to_string(),
        Values(vec![]),
    );
    let rows = conn.query(&stmt).await?;
    let count: i64 = rows[0].try_get(0)?;
    assert_eq!(count, 1);
    conn.commit().await?;

    // and the slot can be released
    s2.make_shared(&mut conn).await?;
    let (expired, exclusive, _) = session_state(&mut conn, s2_info.session_id).await?;
    assert!(!expired);
    assert_eq!(exclusive, None);
    Ok(())
}

#[tokio::test]
async fn subsessions_cannot_become_exclusive() -> Result<()> {
    let Some(mut conn) = setup("fh_subexcl").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;
    let info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;
    let master = Session::resolve(&ctx("subsession"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    let sub_info = master.subsession(&mut conn).await?;

    let mut sub =
        Session::resolve(&ctx("exclusiveSession"), &mut conn, &creds(&sub_info, None)).await?;
    conn.commit().await?;
    let err = sub.make_exclusive(&mut conn, false).await.unwrap_err();
    assert!(matches!(err, HubError::Generic(_)));
    conn.rollback().await?;

    // the master taking the lock makes its subsessions exclusive too
    let mut master = Session::resolve(&ctx("exclusiveSession"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    master.make_exclusive(&mut conn, false).await?;
    let sub = Session::resolve(&ctx("build"), &mut conn, &creds(&sub_info, None)).await?;
    conn.commit().await?;
    assert!(sub.exclusive);
    assert!(sub.validate().is_ok());
    Ok(())
}

#[tokio::test]
async fn authorization_data_is_lazy_and_fixed_per_resolution() -> Result<()> {
    let Some(mut conn) = setup("fh_access").await? else { return Ok(()) };
    let user_id = seed_user(&mut conn, "alice", "sekret").await?;

    // one permission grant, one group membership, one builder host
    conn.batch(
        "INSERT INTO permissions (name) VALUES ('repo');
         INSERT INTO permissions (name) VALUES ('admin');",
    )
    .await?;
    let stmt = (
        "INSERT INTO user_perms (user_id, perm_id)
         SELECT $1, id FROM permissions WHERE name = 'repo'"
            .to_string(),
        Values(vec![user_id.into()]),
    );
    conn.execute(&stmt).await?;
    let stmt = (
        "INSERT INTO users (name, usertype) VALUES ('packagers', 2) RETURNING id".to_string(),
        Values(vec![]),
    );
    let group_id: i32 = conn.query(&stmt).await?[0].try_get(0)?;
    let stmt = (
        "INSERT INTO user_groups (user_id, group_id) VALUES ($1, $2)".to_string(),
        Values(vec![user_id.into(), group_id.into()]),
    );
    conn.execute(&stmt).await?;
    let stmt = (
        "INSERT INTO host (user_id, name) VALUES ($1, 'builder01.example.com') RETURNING id"
            .to_string(),
        Values(vec![user_id.into()]),
    );
    let host_id: i32 = conn.query(&stmt).await?[0].try_get(0)?;
    conn.commit().await?;

    let info = password_login(&ctx("login"), &mut conn, None, "alice", "sekret").await?;
    let mut session = Session::resolve(&ctx("build"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;

    assert!(session.has_perm(&mut conn, "repo").await?);
    assert!(!session.has_perm(&mut conn, "tag").await?);
    session.assert_perm(&mut conn, "repo").await?;
    let err = session.assert_perm(&mut conn, "tag").await.unwrap_err();
    assert!(matches!(err, HubError::NotAllowed(_)));

    assert!(session.has_group(&mut conn, group_id).await?);
    assert!(session.is_user(&mut conn, group_id).await?);
    assert!(session.is_user(&mut conn, user_id).await?);
    session.assert_user(&mut conn, user_id).await?;
    assert_eq!(session.host_id(&mut conn).await?, Some(host_id));

    // grants changed mid-call are invisible to this resolution
    let mut other = connect_into("fh_access").await?;
    let stmt = (
        "INSERT INTO user_perms (user_id, perm_id)
         SELECT $1, id FROM permissions WHERE name = 'admin'"
            .to_string(),
        Values(vec![user_id.into()]),
    );
    other.execute(&stmt).await?;
    other.commit().await?;
    assert!(!session.has_perm(&mut conn, "admin").await?);

    // a fresh resolution sees the new grant
    let mut fresh = Session::resolve(&ctx("build"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    assert!(fresh.has_perm(&mut conn, "admin").await?);
    Ok(())
}

#[tokio::test]
async fn gssapi_login_provisions_and_proxies() -> Result<()> {
    let Some(mut conn) = setup("fh_gssapi").await? else { return Ok(()) };
    seed_user(&mut conn, "alice", "sekret").await?;

    let config = HubConfig {
        check_client_ip: false,
        login_creates_user: true,
        allowed_krb_realms: "EXAMPLE.COM".to_string(),
        proxy_principals: "hub/web@EXAMPLE.COM".to_string(),
        ..HubConfig::default()
    };

    let identity = ClientIdentity {
        principal: Some("builder@EXAMPLE.COM".to_string()),
        ..ClientIdentity::default()
    };
    let login_ctx = RequestContext::new(config.clone(), "sslLogin").with_identity(identity);

    // first login provisions the account with the principal attached
    let info = ssl_login(&login_ctx, &mut conn, None, None).await?;
    let first = Session::resolve(&ctx("build"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;

    // second login resolves to the same account
    let info2 = ssl_login(&login_ctx, &mut conn, None, None).await?;
    let second = Session::resolve(&ctx("build"), &mut conn, &creds(&info2, None)).await?;
    conn.commit().await?;
    assert_eq!(first.user_id, second.user_id);

    // a disallowed realm is rejected outright
    let bad_identity = ClientIdentity {
        principal: Some("builder@EVIL.COM".to_string()),
        ..ClientIdentity::default()
    };
    let bad_ctx =
        RequestContext::new(config.clone(), "sslLogin").with_identity(bad_identity);
    let err = ssl_login(&bad_ctx, &mut conn, None, None).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;

    // the web front end may log in on behalf of alice
    let proxy_identity = ClientIdentity {
        principal: Some("hub/web@EXAMPLE.COM".to_string()),
        ..ClientIdentity::default()
    };
    let proxy_ctx =
        RequestContext::new(config.clone(), "sslLogin").with_identity(proxy_identity);
    let info3 = ssl_login(&proxy_ctx, &mut conn, None, Some("alice")).await?;
    let proxied = Session::resolve(&ctx("build"), &mut conn, &creds(&info3, None)).await?;
    conn.commit().await?;
    assert_eq!(proxied.user.name, "alice");

    // an unlisted principal may not
    let rogue_identity = ClientIdentity {
        principal: Some("rogue@EXAMPLE.COM".to_string()),
        ..ClientIdentity::default()
    };
    let rogue_ctx = RequestContext::new(config, "sslLogin").with_identity(rogue_identity);
    let err = ssl_login(&rogue_ctx, &mut conn, None, Some("alice")).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));
    conn.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn ssl_login_requires_verified_certificate() -> Result<()> {
    let Some(mut conn) = setup("fh_ssl").await? else { return Ok(()) };
    seed_user(&mut conn, "builder01", "unused-password").await?;

    let config = HubConfig { check_client_ip: false, ..HubConfig::default() };

    // unverified certificate
    let identity = ClientIdentity {
        ssl_verify: Some("FAILED".to_string()),
        ..ClientIdentity::default()
    };
    let bad_ctx = RequestContext::new(config.clone(), "sslLogin").with_identity(identity);
    let err = ssl_login(&bad_ctx, &mut conn, None, None).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));

    // verified, but the configured DN component is missing
    let identity = ClientIdentity {
        ssl_verify: Some("SUCCESS".to_string()),
        ssl_client_dn: Some("O=Example".to_string()),
        ..ClientIdentity::default()
    };
    let no_cn_ctx = RequestContext::new(config.clone(), "sslLogin").with_identity(identity);
    let err = ssl_login(&no_cn_ctx, &mut conn, None, None).await.unwrap_err();
    assert!(matches!(err, HubError::Auth(_)));

    // verified with a CN resolves the account
    let mut components = HashMap::new();
    components.insert("CN".to_string(), "builder01".to_string());
    let identity = ClientIdentity {
        ssl_verify: Some("SUCCESS".to_string()),
        ssl_client_dn: Some("CN=builder01,O=Example".to_string()),
        ssl_dn_components: components,
        ..ClientIdentity::default()
    };
    let good_ctx = RequestContext::new(config, "sslLogin").with_identity(identity);
    let info = ssl_login(&good_ctx, &mut conn, None, None).await?;
    let session = Session::resolve(&ctx("build"), &mut conn, &creds(&info, None)).await?;
    conn.commit().await?;
    assert_eq!(session.user.name, "builder01");
    Ok(())
}
