//! Unified error model for the session core.
//! Every failure surfaces immediately as one of these kinds; there is no
//! local recovery or retry in this crate. Mapping helpers translate the
//! kinds to RPC protocol faults and to HTTP statuses for the front ends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Credential or session-validity failure.
    #[error("{0}")]
    Auth(String),
    /// The presented session exists but has been expired.
    #[error("{0}")]
    AuthExpired(String),
    /// Another session holds the user's exclusive slot.
    #[error("{0}")]
    AuthLock(String),
    /// The caller's call number regressed.
    #[error("{0}")]
    Sequence(String),
    /// Replay of an already-committed, non-idempotent call.
    #[error("{0}")]
    Retry(String),
    /// The session lacks permission for the attempted action.
    #[error("{0}")]
    NotAllowed(String),
    /// Catch-all misuse (double login, subsession exclusivity, ...).
    #[error("{0}")]
    Generic(String),
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
}

pub type HubResult<T> = Result<T, HubError>;

/// Serializable protocol form of an error, as carried in RPC fault replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub string: String,
}

impl HubError {
    pub fn auth<S: Into<String>>(msg: S) -> Self { HubError::Auth(msg.into()) }
    pub fn expired<S: Into<String>>(msg: S) -> Self { HubError::AuthExpired(msg.into()) }
    pub fn lock<S: Into<String>>(msg: S) -> Self { HubError::AuthLock(msg.into()) }
    pub fn sequence<S: Into<String>>(msg: S) -> Self { HubError::Sequence(msg.into()) }
    pub fn retry<S: Into<String>>(msg: S) -> Self { HubError::Retry(msg.into()) }
    pub fn not_allowed<S: Into<String>>(msg: S) -> Self { HubError::NotAllowed(msg.into()) }
    pub fn generic<S: Into<String>>(msg: S) -> Self { HubError::Generic(msg.into()) }

    /// Protocol fault code. The numbering is part of the wire contract and
    /// must not change between releases.
    pub fn fault_code(&self) -> i32 {
        match self {
            HubError::Generic(_) | HubError::Db(_) => 1000,
            HubError::Auth(_) => 1002,
            HubError::NotAllowed(_) => 1004,
            HubError::AuthLock(_) => 1006,
            HubError::AuthExpired(_) => 1007,
            HubError::Sequence(_) => 1008,
            HubError::Retry(_) => 1009,
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault { code: self.fault_code(), string: self.to_string() }
    }

    /// Map to HTTP status code for the REST-ish front ends.
    pub fn http_status(&self) -> u16 {
        match self {
            HubError::Auth(_) | HubError::AuthExpired(_) => 401,
            HubError::NotAllowed(_) => 403,
            HubError::AuthLock(_) | HubError::Sequence(_) | HubError::Retry(_) => 409,
            HubError::Generic(_) => 400,
            HubError::Db(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_mapping() {
        assert_eq!(HubError::generic("misuse").fault_code(), 1000);
        assert_eq!(HubError::auth("bad credentials").fault_code(), 1002);
        assert_eq!(HubError::not_allowed("not owner").fault_code(), 1004);
        assert_eq!(HubError::lock("locked").fault_code(), 1006);
        assert_eq!(HubError::expired("expired").fault_code(), 1007);
        assert_eq!(HubError::sequence("346 > 345").fault_code(), 1008);
        assert_eq!(HubError::retry("unable to retry").fault_code(), 1009);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(HubError::auth("no").http_status(), 401);
        assert_eq!(HubError::expired("old").http_status(), 401);
        assert_eq!(HubError::not_allowed("no").http_status(), 403);
        assert_eq!(HubError::lock("held").http_status(), 409);
        assert_eq!(HubError::generic("misuse").http_status(), 400);
    }

    #[test]
    fn fault_carries_message() {
        let f = HubError::sequence("346 > 345 (session 7)").to_fault();
        assert_eq!(f.code, 1008);
        assert_eq!(f.string, "346 > 345 (session 7)");
    }
}
