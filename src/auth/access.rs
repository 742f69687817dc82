//! Authorization data for a resolved session.
//! Permissions, group membership and the builder-host id are fetched on
//! first access and then fixed for the lifetime of the `Session` value:
//! one call sees one consistent view, never a mid-call refresh.

use std::collections::{HashMap, HashSet};

use sea_query::{Expr, PostgresQueryBuilder, Query};

use crate::db::PgConn;
use crate::error::{HubError, HubResult};

use super::session::Session;
use super::tables::{Host, Permissions, UserGroups, UserPerms, Users};
use super::types::{UserRow, UserType};

/// Names of the permissions granted to the user (read-only collaborator
/// query against the permission-grant tables).
pub async fn get_user_perms(conn: &mut PgConn, user_id: i32) -> HubResult<HashSet<String>> {
    let stmt = Query::select()
        .column((Permissions::Table, Permissions::Name))
        .from(UserPerms::Table)
        .inner_join(
            Permissions::Table,
            Expr::col((UserPerms::Table, UserPerms::PermId))
                .equals((Permissions::Table, Permissions::Id)),
        )
        .and_where(Expr::col((UserPerms::Table, UserPerms::Active)).eq(true))
        .and_where(Expr::col((UserPerms::Table, UserPerms::UserId)).eq(user_id))
        .build(PostgresQueryBuilder);
    let rows = conn.query(&stmt).await?;
    let mut perms = HashSet::with_capacity(rows.len());
    for row in &rows {
        perms.insert(row.try_get(0)?);
    }
    Ok(perms)
}

/// Group id → group name for the user's active memberships. Groups are user
/// rows of type group.
pub async fn get_user_groups(conn: &mut PgConn, user_id: i32) -> HubResult<HashMap<i32, String>> {
    let stmt = Query::select()
        .column((UserGroups::Table, UserGroups::GroupId))
        .column((Users::Table, Users::Name))
        .from(UserGroups::Table)
        .inner_join(
            Users::Table,
            Expr::col((UserGroups::Table, UserGroups::GroupId)).equals((Users::Table, Users::Id)),
        )
        .and_where(Expr::col((UserGroups::Table, UserGroups::Active)).eq(true))
        .and_where(Expr::col((Users::Table, Users::Usertype)).eq(UserType::Group.code()))
        .and_where(Expr::col((UserGroups::Table, UserGroups::UserId)).eq(user_id))
        .build(PostgresQueryBuilder);
    let rows = conn.query(&stmt).await?;
    let mut groups = HashMap::with_capacity(rows.len());
    for row in &rows {
        groups.insert(row.try_get(0)?, row.try_get(1)?);
    }
    Ok(groups)
}

pub async fn get_user_data(conn: &mut PgConn, user_id: i32) -> HubResult<Option<UserRow>> {
    let stmt = Query::select()
        .columns([Users::Name, Users::Status, Users::Usertype])
        .from(Users::Table)
        .and_where(Expr::col(Users::Id).eq(user_id))
        .build(PostgresQueryBuilder);
    match conn.query_opt(&stmt).await? {
        Some(row) => Ok(Some(UserRow::from_row(user_id, &row)?)),
        None => Ok(None),
    }
}

async fn get_host_id(conn: &mut PgConn, user_id: i32) -> HubResult<Option<i32>> {
    let stmt = Query::select()
        .column(Host::Id)
        .from(Host::Table)
        .and_where(Expr::col(Host::UserId).eq(user_id))
        .build(PostgresQueryBuilder);
    match conn.query_opt(&stmt).await? {
        Some(row) => Ok(Some(row.try_get(0)?)),
        None => Ok(None),
    }
}

/// Dispatcher-side gate for operations that require any authenticated
/// session at all.
pub fn assert_logged_in(session: Option<&Session>) -> HubResult<&Session> {
    session.ok_or_else(|| HubError::not_allowed("you must be logged in for this operation"))
}

impl Session {
    /// Permission names, computed on first access.
    pub async fn perms(&mut self, conn: &mut PgConn) -> HubResult<&HashSet<String>> {
        let cached = match self.perms.take() {
            Some(perms) => perms,
            None => get_user_perms(conn, self.user_id).await?,
        };
        Ok(self.perms.get_or_insert(cached))
    }

    /// Group memberships, computed on first access.
    pub async fn groups(&mut self, conn: &mut PgConn) -> HubResult<&HashMap<i32, String>> {
        let cached = match self.groups.take() {
            Some(groups) => groups,
            None => get_user_groups(conn, self.user_id).await?,
        };
        Ok(self.groups.get_or_insert(cached))
    }

    /// Builder-host id associated with this user, if any. The outer memo
    /// layer distinguishes "not fetched yet" from "no host".
    pub async fn host_id(&mut self, conn: &mut PgConn) -> HubResult<Option<i32>> {
        let cached = match self.host_id.take() {
            Some(host_id) => host_id,
            None => get_host_id(conn, self.user_id).await?,
        };
        self.host_id = Some(cached);
        Ok(cached)
    }

    pub async fn has_perm(&mut self, conn: &mut PgConn, name: &str) -> HubResult<bool> {
        Ok(self.perms(conn).await?.contains(name))
    }

    /// Require a permission; `admin` overrides. Fails rather than returning
    /// a boolean so call sites must handle the refusal.
    pub async fn assert_perm(&mut self, conn: &mut PgConn, name: &str) -> HubResult<()> {
        if self.has_perm(conn, name).await? || self.has_perm(conn, "admin").await? {
            return Ok(());
        }
        Err(HubError::not_allowed(format!(
            "{} permission required (logged in as {})",
            name, self.user.name
        )))
    }

    pub async fn has_group(&mut self, conn: &mut PgConn, group_id: i32) -> HubResult<bool> {
        Ok(self.groups(conn).await?.contains_key(&group_id))
    }

    /// The caller "is" a user when it is that user or belongs to that group.
    pub async fn is_user(&mut self, conn: &mut PgConn, user_id: i32) -> HubResult<bool> {
        Ok(self.user_id == user_id || self.has_group(conn, user_id).await?)
    }

    pub async fn assert_user(&mut self, conn: &mut PgConn, user_id: i32) -> HubResult<()> {
        if self.is_user(conn, user_id).await? || self.has_perm(conn, "admin").await? {
            return Ok(());
        }
        Err(HubError::not_allowed("not owner"))
    }
}
