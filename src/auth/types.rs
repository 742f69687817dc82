//! Typed records for the session core.
//! Rows come back from the store as named, typed fields; the integer codes
//! stored in the `authtype`/`status`/`usertype` columns are wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

use crate::error::{HubError, HubResult};

/// How a session was authenticated. Stored in `sessions.authtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    Password,
    Kerberos,
    Ssl,
    Gssapi,
}

impl AuthType {
    pub fn code(self) -> i32 {
        match self {
            AuthType::Password => 0,
            AuthType::Kerberos => 1,
            AuthType::Ssl => 2,
            AuthType::Gssapi => 3,
        }
    }

    pub fn from_code(code: i32) -> HubResult<Self> {
        match code {
            0 => Ok(AuthType::Password),
            1 => Ok(AuthType::Kerberos),
            2 => Ok(AuthType::Ssl),
            3 => Ok(AuthType::Gssapi),
            other => Err(HubError::generic(format!("unknown authtype code: {}", other))),
        }
    }
}

/// Account state. Only `Normal` users may authenticate or stay authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserStatus {
    Normal,
    Blocked,
}

impl UserStatus {
    pub fn code(self) -> i32 {
        match self {
            UserStatus::Normal => 0,
            UserStatus::Blocked => 1,
        }
    }

    pub fn from_code(code: i32) -> HubResult<Self> {
        match code {
            0 => Ok(UserStatus::Normal),
            1 => Ok(UserStatus::Blocked),
            other => Err(HubError::generic(format!("unknown user status code: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Normal,
    Host,
    Group,
}

impl UserType {
    pub fn code(self) -> i32 {
        match self {
            UserType::Normal => 0,
            UserType::Host => 1,
            UserType::Group => 2,
        }
    }

    pub fn from_code(code: i32) -> HubResult<Self> {
        match code {
            0 => Ok(UserType::Normal),
            1 => Ok(UserType::Host),
            2 => Ok(UserType::Group),
            other => Err(HubError::generic(format!("unknown usertype code: {}", other))),
        }
    }
}

/// One row of the `sessions` table as the resolver loads it.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i32,
    pub user_id: i32,
    pub authtype: AuthType,
    /// Non-null marks this row as a subsession of the referenced session.
    pub master: Option<i32>,
    /// Tri-state: NULL (unset) or TRUE. Never FALSE in the store.
    pub exclusive: Option<bool>,
    pub expired: bool,
    /// Last call number durably recorded as completed.
    pub callnum: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl SessionRow {
    /// Build from a row selected with the resolver's column list. The id is
    /// passed in because the lookup is keyed by it rather than selecting it.
    pub fn from_row(id: i32, row: &Row) -> HubResult<Self> {
        Ok(Self {
            id,
            user_id: row.try_get("user_id")?,
            authtype: AuthType::from_code(row.try_get("authtype")?)?,
            master: row.try_get("master")?,
            exclusive: row.try_get("exclusive")?,
            expired: row.try_get("expired")?,
            callnum: row.try_get("callnum")?,
            start_time: row.try_get("start_time")?,
            update_time: row.try_get("update_time")?,
        })
    }
}

/// The slice of the `users` table the session core reads.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i32,
    pub name: String,
    pub status: UserStatus,
    pub usertype: UserType,
}

impl UserRow {
    pub fn from_row(id: i32, row: &Row) -> HubResult<Self> {
        Ok(Self {
            id,
            name: row.try_get("name")?,
            status: UserStatus::from_code(row.try_get("status")?)?,
            usertype: UserType::from_code(row.try_get("usertype")?)?,
        })
    }
}

/// Login reply payload handed back to the client, with the wire field names
/// the clients already speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "session-id")]
    pub session_id: i32,
    #[serde(rename = "session-key")]
    pub session_key: String,
}
