//! Credential validators.
//! Each strategy resolves an external credential to a user id and then
//! funnels through the same gate (`check_login_allowed`) and session
//! creation. Validators are stateless and consulted only at login.

use sea_query::{Expr, PostgresQueryBuilder, Query};
use tracing::info;

use crate::config::HubConfig;
use crate::db::PgConn;
use crate::error::{HubError, HubResult};

use super::access::get_user_data;
use super::context::RequestContext;
use super::session::{create_session, Session};
use super::tables::{UserKrbPrincipals, Users};
use super::types::{AuthType, SessionInfo, UserStatus, UserType};

/// Verify that the account may authenticate: it must exist and be in normal
/// status. Blocked (or otherwise non-normal) users are turned away with the
/// same error whether logging in or already holding a session.
pub async fn check_login_allowed(conn: &mut PgConn, user_id: i32) -> HubResult<()> {
    let user = get_user_data(conn, user_id)
        .await?
        .ok_or_else(|| HubError::auth(format!("invalid user_id: {}", user_id)))?;
    if user.status != UserStatus::Normal {
        return Err(HubError::auth(format!("logins by {} are not allowed", user.name)));
    }
    Ok(())
}

/// Username/password login. The password is matched verbatim against the
/// stored column; hashing policy belongs to whoever maintains the `users`
/// table.
pub async fn password_login(
    ctx: &RequestContext,
    conn: &mut PgConn,
    current: Option<&Session>,
    user: &str,
    password: &str,
) -> HubResult<SessionInfo> {
    // reject empty passwords before touching the store
    if password.is_empty() {
        return Err(HubError::auth("invalid username or password"));
    }
    if current.is_some() {
        return Err(HubError::generic("already logged in"));
    }

    let stmt = Query::select()
        .column(Users::Id)
        .from(Users::Table)
        .and_where(Expr::col(Users::Name).eq(user))
        .and_where(Expr::col(Users::Password).eq(password))
        .build(PostgresQueryBuilder);
    let user_id: i32 = match conn.query_opt(&stmt).await? {
        Some(row) => row.try_get(0)?,
        None => return Err(HubError::auth("invalid username or password")),
    };

    check_login_allowed(conn, user_id).await?;

    let hostip = ctx.remote_ip();
    let sinfo = create_session(conn, user_id, &hostip, AuthType::Password, None).await?;
    info!("password login for {} from {}", user, hostip);
    Ok(sinfo)
}

/// Certificate / GSSAPI login. A Kerberos principal supplied by the
/// transport wins over the client certificate; otherwise the certificate
/// must have verified and the username comes from the configured subject
/// component. `proxyuser` switches the session to that user when the
/// caller's own identity is on the proxy allow-list.
pub async fn ssl_login(
    ctx: &RequestContext,
    conn: &mut PgConn,
    current: Option<&Session>,
    proxyuser: Option<&str>,
) -> HubResult<SessionInfo> {
    if current.is_some() {
        return Err(HubError::generic("already logged in"));
    }

    let (username, client_id, authtype) = match &ctx.identity.principal {
        Some(principal) => (principal.clone(), principal.clone(), AuthType::Gssapi),
        None => {
            if ctx.identity.ssl_verify.as_deref() != Some("SUCCESS") {
                return Err(HubError::auth(format!(
                    "could not verify client: {}",
                    ctx.identity.ssl_verify.as_deref().unwrap_or("(not attempted)")
                )));
            }
            let component = &ctx.config.dn_username_component;
            let username = ctx
                .identity
                .dn_component(component)
                .ok_or_else(|| {
                    HubError::auth(format!(
                        "unable to get user information ({}) from client certificate",
                        component
                    ))
                })?
                .to_string();
            let client_dn = ctx.identity.ssl_client_dn.clone().unwrap_or_default();
            (username, client_dn, AuthType::Ssl)
        }
    };

    let username = match proxyuser {
        Some(proxyuser) => {
            let allowed = proxy_allow_list(&ctx.config, authtype);
            if !allowed.iter().any(|entry| entry == &client_id) {
                return Err(HubError::auth(format!(
                    "{} is not authorized to login other users",
                    client_id
                )));
            }
            proxyuser.to_string()
        }
        None => username,
    };

    let is_principal = authtype == AuthType::Gssapi && username.contains('@');
    let user_id = if is_principal {
        check_krb_principal(&ctx.config, &username)?;
        get_user_id_from_kerberos(conn, &username).await?
    } else {
        get_user_id(conn, &username).await?
    };
    let user_id = match user_id {
        Some(id) => id,
        None if ctx.config.login_creates_user => {
            if is_principal {
                create_user_from_kerberos(conn, &username).await?
            } else {
                create_user(conn, &username, None).await?
            }
        }
        None => return Err(HubError::auth(format!("unknown user: {}", username))),
    };

    check_login_allowed(conn, user_id).await?;

    let hostip = ctx.remote_ip();
    let sinfo = create_session(conn, user_id, &hostip, authtype, None).await?;
    info!("{:?} login for {} from {}", authtype, username, hostip);
    Ok(sinfo)
}

/// Identities allowed to log in on behalf of another user. Principals are
/// comma-separated; DNs are pipe-separated, since DNs contain commas. For
/// GSSAPI the DN list is also honored as a legacy fallback unless disabled.
fn proxy_allow_list(config: &HubConfig, authtype: AuthType) -> Vec<String> {
    let mut allowed = if authtype == AuthType::Gssapi {
        split_list(&config.proxy_principals, ',')
    } else {
        split_list(&config.proxy_dns, '|')
    };
    if authtype == AuthType::Gssapi && !config.disable_gssapi_proxy_dn_fallback {
        allowed.extend(split_list(&config.proxy_dns, '|'));
    }
    allowed
}

fn split_list(raw: &str, delimiter: char) -> Vec<String> {
    raw.split(delimiter)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Realm policy. A principal must always carry a non-empty realm; the
/// wildcard policy only skips the membership check.
fn check_krb_principal(config: &HubConfig, principal: &str) -> HubResult<()> {
    let realm = match principal.split_once('@') {
        Some((_, realm)) if !realm.is_empty() => realm,
        _ => return Err(HubError::auth(format!("invalid Kerberos principal: {}", principal))),
    };
    let allowed = config.allowed_krb_realms.trim();
    if allowed == "*" {
        return Ok(());
    }
    if !allowed.split(',').map(str::trim).any(|r| r == realm) {
        return Err(HubError::auth(format!(
            "Kerberos principal's realm: {} is not allowed",
            realm
        )));
    }
    Ok(())
}

async fn get_user_id(conn: &mut PgConn, username: &str) -> HubResult<Option<i32>> {
    let stmt = Query::select()
        .column(Users::Id)
        .from(Users::Table)
        .and_where(Expr::col(Users::Name).eq(username))
        .build(PostgresQueryBuilder);
    match conn.query_opt(&stmt).await? {
        Some(row) => Ok(Some(row.try_get(0)?)),
        None => Ok(None),
    }
}

async fn get_user_id_from_kerberos(conn: &mut PgConn, principal: &str) -> HubResult<Option<i32>> {
    let stmt = Query::select()
        .column((Users::Table, Users::Id))
        .from(Users::Table)
        .inner_join(
            UserKrbPrincipals::Table,
            Expr::col((Users::Table, Users::Id))
                .equals((UserKrbPrincipals::Table, UserKrbPrincipals::UserId)),
        )
        .and_where(Expr::col(UserKrbPrincipals::KrbPrincipal).eq(principal))
        .build(PostgresQueryBuilder);
    match conn.query_opt(&stmt).await? {
        Some(row) => Ok(Some(row.try_get(0)?)),
        None => Ok(None),
    }
}

/// Provision a user account, optionally attaching a Kerberos principal.
async fn create_user(
    conn: &mut PgConn,
    name: &str,
    krb_principal: Option<&str>,
) -> HubResult<i32> {
    if name.is_empty() {
        return Err(HubError::generic("a user must have a non-empty name"));
    }
    let user_id = conn.nextval("users_id_seq").await? as i32;
    let stmt = Query::insert()
        .into_table(Users::Table)
        .columns([Users::Id, Users::Name, Users::Usertype, Users::Status])
        .values_panic([
            user_id.into(),
            name.into(),
            UserType::Normal.code().into(),
            UserStatus::Normal.code().into(),
        ])
        .build(PostgresQueryBuilder);
    conn.execute(&stmt).await?;
    if let Some(principal) = krb_principal {
        insert_krb_principal(conn, user_id, principal).await?;
    }
    conn.commit().await?;
    info!("auto-provisioned user {} ({})", name, user_id);
    Ok(user_id)
}

async fn insert_krb_principal(
    conn: &mut PgConn,
    user_id: i32,
    krb_principal: &str,
) -> HubResult<()> {
    let stmt = Query::insert()
        .into_table(UserKrbPrincipals::Table)
        .columns([UserKrbPrincipals::UserId, UserKrbPrincipals::KrbPrincipal])
        .values_panic([user_id.into(), krb_principal.into()])
        .build(PostgresQueryBuilder);
    conn.execute(&stmt).await?;
    Ok(())
}

/// Attach a principal to an existing account, by name.
async fn set_krb_principal(
    conn: &mut PgConn,
    name: &str,
    krb_principal: &str,
) -> HubResult<i32> {
    let user_id = get_user_id(conn, name)
        .await?
        .ok_or_else(|| HubError::auth(format!("no such user: {}", name)))?;
    insert_krb_principal(conn, user_id, krb_principal).await?;
    conn.commit().await?;
    Ok(user_id)
}

/// First Kerberos login for an unknown principal: the username is everything
/// before the `@`. An existing account of that name is reused by attaching
/// the principal to it rather than failing on the name collision.
async fn create_user_from_kerberos(conn: &mut PgConn, krb_principal: &str) -> HubResult<i32> {
    let Some((user_name, _)) = krb_principal.split_once('@') else {
        return Err(HubError::auth(format!("invalid Kerberos principal: {}", krb_principal)));
    };

    let stmt = Query::select()
        .column((Users::Table, Users::Id))
        .column((UserKrbPrincipals::Table, UserKrbPrincipals::KrbPrincipal))
        .from(Users::Table)
        .left_join(
            UserKrbPrincipals::Table,
            Expr::col((Users::Table, Users::Id))
                .equals((UserKrbPrincipals::Table, UserKrbPrincipals::UserId)),
        )
        .and_where(Expr::col((Users::Table, Users::Name)).eq(user_name))
        .build(PostgresQueryBuilder);
    let rows = conn.query(&stmt).await?;
    if rows.is_empty() {
        return create_user(conn, user_name, Some(krb_principal)).await;
    }
    for row in &rows {
        let existing: Option<String> = row.try_get(1)?;
        if existing.as_deref() == Some(krb_principal) {
            // principal already attached
            return Ok(row.try_get(0)?);
        }
    }
    set_krb_principal(conn, user_name, krb_principal).await
}
