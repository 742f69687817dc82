//! Session resolution and lifecycle.
//!
//! A `Session` value exists only for an authenticated caller; the resolver
//! builds one per inbound call from the presented credentials. All shared
//! state lives in the `sessions` / `users` tables (there is no in-process
//! session cache) and the only serialization primitives are the row locks
//! taken here.
//!
//! Dispatcher contract (at-most-once calls): `resolve` commits its
//! `update_time` bump and then executes `UPDATE sessions SET callnum = $C`
//! on the caller's connection *without committing*. The dispatcher must
//! commit that connection exactly when the invoked method's own work
//! commits, so a recorded call number implies the call completed. On any
//! error the dispatcher rolls the connection back, which also releases the
//! row locks taken here.

use std::collections::{HashMap, HashSet};

use base64::Engine;
use sea_query::{Cond, Expr, LockType, PostgresQueryBuilder, Query};
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::db::PgConn;
use crate::error::{HubError, HubResult};

use super::access::get_user_data;
use super::context::RequestContext;
use super::creds::SessionCreds;
use super::tables::{Sessions, Users};
use super::types::{AuthType, SessionInfo, SessionRow, UserRow, UserStatus};

/// An authenticated session, resolved from inbound credentials.
#[derive(Debug)]
pub struct Session {
    pub id: i32,
    pub key: String,
    pub hostip: String,
    pub user_id: i32,
    pub authtype: AuthType,
    /// Set for subsessions; the referenced session is the master.
    pub master: Option<i32>,
    /// Call number presented with this call, if any.
    pub callnum: Option<i32>,
    /// Whether this session holds (or shares via its master) the user's
    /// exclusive slot.
    pub exclusive: bool,
    /// Soft exclusivity conflict, surfaced only by [`Session::validate`].
    pub(crate) lockerror: Option<String>,
    pub data: SessionRow,
    pub user: UserRow,
    // authorization data, computed on first access (see access.rs)
    pub(crate) perms: Option<HashSet<String>>,
    pub(crate) groups: Option<HashMap<i32, String>>,
    pub(crate) host_id: Option<Option<i32>>,
}

impl Session {
    /// Resolve inbound credentials to an authenticated session.
    ///
    /// Loads the session row under `FOR UPDATE` (concurrent calls for the
    /// same session serialize here, so the call-number check cannot race),
    /// then validates expiry, call ordering, and the user's status, and
    /// determines exclusivity. See the module docs for what is and is not
    /// committed when this returns.
    pub async fn resolve(
        ctx: &RequestContext,
        conn: &mut PgConn,
        creds: &SessionCreds,
    ) -> HubResult<Session> {
        let hostip = ctx.remote_ip();

        let stmt = Query::select()
            .columns([
                Sessions::Authtype,
                Sessions::Callnum,
                Sessions::Exclusive,
                Sessions::Expired,
                Sessions::Master,
                Sessions::StartTime,
                Sessions::UpdateTime,
                Sessions::UserId,
            ])
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::Id).eq(creds.id))
            .and_where(Expr::col(Sessions::Key).eq(creds.key.as_str()))
            .and_where(Expr::col(Sessions::Hostip).eq(hostip.as_str()))
            .lock(LockType::Update)
            .build(PostgresQueryBuilder);
        let row = match conn.query_opt(&stmt).await? {
            Some(row) => row,
            None => {
                diagnose_lookup_miss(conn, creds, &hostip).await?;
                return Err(HubError::auth("invalid session or bad credentials"));
            }
        };
        let data = SessionRow::from_row(creds.id, &row)?;

        if data.expired {
            return Err(HubError::expired(format!("session \"{}\" has expired", data.id)));
        }

        check_callnum(data.callnum, creds.callnum, &ctx.method, &ctx.config, data.id)?;

        let user = get_user_data(conn, data.user_id)
            .await?
            .ok_or_else(|| HubError::auth(format!("invalid user_id: {}", data.user_id)))?;
        if user.status != UserStatus::Normal {
            return Err(HubError::auth(format!("logins by {} are not allowed", user.name)));
        }

        let (exclusive, lockerror) = match data.exclusive {
            Some(true) => (true, None),
            _ => {
                let other = exclusive_session_for(conn, data.user_id).await?;
                determine_exclusivity(other, data.master)
            }
        };

        // bump the activity timestamp and commit it on its own, so it
        // survives even when the dispatched call rolls back
        let stmt = Query::update()
            .table(Sessions::Table)
            .value(Sessions::UpdateTime, Expr::cust("NOW()"))
            .and_where(Expr::col(Sessions::Id).eq(data.id))
            .build(PostgresQueryBuilder);
        conn.execute(&stmt).await?;
        conn.commit().await?;

        // stage the call number after the commit; the dispatcher's final
        // commit makes it durable iff the call itself succeeded
        if let Some(callnum) = creds.callnum {
            let stmt = Query::update()
                .table(Sessions::Table)
                .value(Sessions::Callnum, callnum)
                .and_where(Expr::col(Sessions::Id).eq(data.id))
                .build(PostgresQueryBuilder);
            conn.execute(&stmt).await?;
        }

        Ok(Session {
            id: data.id,
            key: creds.key.clone(),
            hostip,
            user_id: data.user_id,
            authtype: data.authtype,
            master: data.master,
            callnum: creds.callnum,
            exclusive,
            lockerror,
            user,
            data,
            perms: None,
            groups: None,
            host_id: None,
        })
    }

    /// Surface a soft exclusivity conflict. Callers that require exclusive
    /// access invoke this explicitly; everyone else is unaffected by another
    /// session holding the lock.
    pub fn validate(&self) -> HubResult<()> {
        if let Some(msg) = &self.lockerror {
            return Err(HubError::lock(msg.clone()));
        }
        Ok(())
    }

    /// Create a parallel session sharing this login. Chains flatten: a
    /// subsession of a subsession hangs off the original master.
    pub async fn subsession(&self, conn: &mut PgConn) -> HubResult<SessionInfo> {
        let master = self.master.unwrap_or(self.id);
        create_session(conn, self.user_id, &self.hostip, self.authtype, Some(master)).await
    }

    /// Expire this session and every subsession under it, in one update.
    /// Expiry is terminal; nothing in this crate ever clears it.
    pub async fn logout(self, conn: &mut PgConn) -> HubResult<()> {
        let stmt = Query::update()
            .table(Sessions::Table)
            .value(Sessions::Expired, true)
            .value(Sessions::Exclusive, Option::<bool>::None)
            .cond_where(
                Cond::any()
                    .add(Expr::col(Sessions::Id).eq(self.id))
                    .add(Expr::col(Sessions::Master).eq(self.id)),
            )
            .build(PostgresQueryBuilder);
        conn.execute(&stmt).await?;
        conn.commit().await?;
        info!("session {} logged out (user {})", self.id, self.user_id);
        Ok(())
    }

    /// Expire one subsession. The `master` guard in the predicate keeps a
    /// session from expiring a subsession it does not own; a non-matching id
    /// is a no-op.
    pub async fn logout_child(&self, conn: &mut PgConn, session_id: i32) -> HubResult<()> {
        let stmt = Query::update()
            .table(Sessions::Table)
            .value(Sessions::Expired, true)
            .value(Sessions::Exclusive, Option::<bool>::None)
            .and_where(Expr::col(Sessions::Id).eq(session_id))
            .and_where(Expr::col(Sessions::Master).eq(self.id))
            .build(PostgresQueryBuilder);
        conn.execute(&stmt).await?;
        conn.commit().await?;
        Ok(())
    }

    /// Claim the user's exclusive slot. The row lock on the user record
    /// serializes concurrent claimants; with `force` the incumbent exclusive
    /// session is expired under that same lock, so racing force-claims
    /// cannot both win.
    pub async fn make_exclusive(&mut self, conn: &mut PgConn, force: bool) -> HubResult<()> {
        if self.master.is_some() {
            return Err(HubError::generic("subsessions cannot become exclusive"));
        }
        if self.exclusive {
            return Err(HubError::generic("session is already exclusive"));
        }

        let stmt = Query::select()
            .column(Users::Id)
            .from(Users::Table)
            .and_where(Expr::col(Users::Id).eq(self.user_id))
            .lock(LockType::Update)
            .build(PostgresQueryBuilder);
        conn.query(&stmt).await?;

        let stmt = Query::select()
            .column(Sessions::Id)
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::UserId).eq(self.user_id))
            .and_where(Expr::col(Sessions::Expired).eq(false))
            .and_where(Expr::col(Sessions::Exclusive).eq(true))
            .lock(LockType::Update)
            .build(PostgresQueryBuilder);
        if let Some(row) = conn.query_opt(&stmt).await? {
            let excl_id: i32 = row.try_get(0)?;
            if force {
                warn!(
                    "user {}: expiring exclusive session {} in favor of {}",
                    self.user_id, excl_id, self.id
                );
                let stmt = Query::update()
                    .table(Sessions::Table)
                    .value(Sessions::Expired, true)
                    .value(Sessions::Exclusive, Option::<bool>::None)
                    .and_where(Expr::col(Sessions::Id).eq(excl_id))
                    .build(PostgresQueryBuilder);
                conn.execute(&stmt).await?;
            } else {
                return Err(HubError::lock("cannot get exclusive session"));
            }
        }

        let stmt = Query::update()
            .table(Sessions::Table)
            .value(Sessions::Exclusive, true)
            .and_where(Expr::col(Sessions::Id).eq(self.id))
            .build(PostgresQueryBuilder);
        conn.execute(&stmt).await?;
        conn.commit().await?;
        self.exclusive = true;
        self.lockerror = None;
        Ok(())
    }

    /// Drop out of exclusive mode. Only the owning session can clear its own
    /// flag, so there is nothing to contend with.
    pub async fn make_shared(&mut self, conn: &mut PgConn) -> HubResult<()> {
        let stmt = Query::update()
            .table(Sessions::Table)
            .value(Sessions::Exclusive, Option::<bool>::None)
            .and_where(Expr::col(Sessions::Id).eq(self.id))
            .build(PostgresQueryBuilder);
        conn.execute(&stmt).await?;
        conn.commit().await?;
        self.exclusive = false;
        Ok(())
    }
}

/// Insert a new session row for the user and hand back its credentials.
/// With `master` set the new session is a subsession of it.
pub async fn create_session(
    conn: &mut PgConn,
    user_id: i32,
    hostip: &str,
    authtype: AuthType,
    master: Option<i32>,
) -> HubResult<SessionInfo> {
    let key = generate_session_key(user_id);
    let session_id = conn.nextval("sessions_id_seq").await? as i32;
    let stmt = Query::insert()
        .into_table(Sessions::Table)
        .columns([
            Sessions::Id,
            Sessions::UserId,
            Sessions::Key,
            Sessions::Hostip,
            Sessions::Authtype,
            Sessions::Master,
        ])
        .values_panic([
            session_id.into(),
            user_id.into(),
            key.as_str().into(),
            hostip.into(),
            authtype.code().into(),
            master.into(),
        ])
        .build(PostgresQueryBuilder);
    conn.execute(&stmt).await?;
    conn.commit().await?;
    info!("session {} issued for user {} ({:?})", session_id, user_id, authtype);
    Ok(SessionInfo { session_id, session_key: key })
}

/// Opaque session key: the user id plus a 128-bit random suffix,
/// base64url without padding.
fn generate_session_key(user_id: i32) -> String {
    let mut buf = [0u8; 16];
    let _ = getrandom::getrandom(&mut buf);
    format!("{}-{}", user_id, base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// At-most-once ordering check against the stored call number.
/// A regressed number is never allowed; an equal number means a prior
/// attempt already committed, so only whitelisted methods may re-run.
fn check_callnum(
    lastcall: Option<i32>,
    callnum: Option<i32>,
    method: &str,
    config: &HubConfig,
    session_id: i32,
) -> HubResult<()> {
    let (Some(lastcall), Some(callnum)) = (lastcall, callnum) else {
        return Ok(());
    };
    if lastcall > callnum {
        return Err(HubError::sequence(format!(
            "{} > {} (session {})",
            lastcall, callnum, session_id
        )));
    }
    if lastcall == callnum && !config.retry_allowed(method) {
        return Err(HubError::retry(format!(
            "unable to retry call {} (method {}) for session {}",
            callnum, method, session_id
        )));
    }
    Ok(())
}

/// Exclusivity status given another session's active exclusive row (if any)
/// and our own master link. Conflicts are recorded, not raised; the
/// dispatcher decides whether exclusivity matters for this call.
fn determine_exclusivity(
    exclusive_id: Option<i32>,
    master: Option<i32>,
) -> (bool, Option<String>) {
    match exclusive_id {
        None => (false, None),
        // our master session holds the lock
        Some(id) if Some(id) == master => (true, None),
        Some(_) => (false, Some("User locked by another session".to_string())),
    }
}

async fn exclusive_session_for(conn: &mut PgConn, user_id: i32) -> HubResult<Option<i32>> {
    let stmt = Query::select()
        .column(Sessions::Id)
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::UserId).eq(user_id))
        .and_where(Expr::col(Sessions::Exclusive).eq(true))
        .and_where(Expr::col(Sessions::Expired).eq(false))
        .build(PostgresQueryBuilder);
    match conn.query_opt(&stmt).await? {
        Some(row) => Ok(Some(row.try_get(0)?)),
        None => Ok(None),
    }
}

/// Credential lookups fail without saying why; log which part mismatched so
/// operators can tell a stale key from a roaming client.
async fn diagnose_lookup_miss(
    conn: &mut PgConn,
    creds: &SessionCreds,
    hostip: &str,
) -> HubResult<()> {
    let stmt = Query::select()
        .columns([Sessions::Key, Sessions::Hostip])
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(creds.id))
        .build(PostgresQueryBuilder);
    if let Some(row) = conn.query_opt(&stmt).await? {
        let key: Option<String> = row.try_get("key")?;
        let row_hostip: Option<String> = row.try_get("hostip")?;
        if key.as_deref() != Some(creds.key.as_str()) {
            warn!("session {} is not related to the presented session key", creds.id);
        } else if row_hostip.as_deref() != Some(hostip) {
            warn!("session {} is not related to host ip {}", creds.id, hostip);
        }
    }
    Ok(())
}
