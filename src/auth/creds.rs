//! Inbound session credential extraction.
//! Clients present `session-id` / `session-key` / `callnum` either as
//! request headers (preferred) or in the query string. Absent credentials
//! mean an unauthenticated call; present-but-incomplete credentials are an
//! authentication error.

use std::collections::HashMap;

use crate::error::{HubError, HubResult};

pub const SESSION_ID_HEADER: &str = "hub-session-id";
pub const SESSION_KEY_HEADER: &str = "hub-session-key";
pub const SESSION_CALLNUM_HEADER: &str = "hub-session-callnum";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreds {
    pub id: i32,
    pub key: String,
    /// Client-assigned call number, monotonically increasing per session.
    pub callnum: Option<i32>,
}

impl SessionCreds {
    /// Pull credentials from a request. Header-based credentials win over
    /// the query string; neither present means unauthenticated.
    pub fn extract(
        headers: &HashMap<String, String>,
        query: Option<&str>,
    ) -> HubResult<Option<Self>> {
        if headers.contains_key(SESSION_ID_HEADER) {
            return Self::from_headers(headers).map(Some);
        }
        match query {
            Some(q) if !q.is_empty() => Self::from_query(q).map(Some),
            _ => Ok(None),
        }
    }

    /// Header names are expected lower-cased, as HTTP stacks normalize them.
    pub fn from_headers(headers: &HashMap<String, String>) -> HubResult<Self> {
        let id = headers
            .get(SESSION_ID_HEADER)
            .ok_or_else(|| HubError::auth(format!("{} not specified in session headers", SESSION_ID_HEADER)))?;
        let key = headers
            .get(SESSION_KEY_HEADER)
            .ok_or_else(|| HubError::auth(format!("{} not specified in session headers", SESSION_KEY_HEADER)))?;
        let id = parse_session_id(id)?;
        let callnum = headers.get(SESSION_CALLNUM_HEADER).map(String::as_str);
        let callnum = parse_callnum(callnum)?;
        Ok(Self { id, key: key.clone(), callnum })
    }

    pub fn from_query(query: &str) -> HubResult<Self> {
        let args = parse_query(query)?;
        let id = args
            .get("session-id")
            .ok_or_else(|| HubError::auth("'session-id' not specified in session args"))?;
        let key = args
            .get("session-key")
            .ok_or_else(|| HubError::auth("'session-key' not specified in session args"))?;
        let id = parse_session_id(id)?;
        let callnum = parse_callnum(args.get("callnum").map(String::as_str))?;
        Ok(Self { id, key: key.clone(), callnum })
    }
}

fn parse_session_id(raw: &str) -> HubResult<i32> {
    raw.parse::<i32>()
        .map_err(|_| HubError::auth(format!("invalid session-id: {:?}", raw)))
}

fn parse_callnum(raw: Option<&str>) -> HubResult<Option<i32>> {
    match raw {
        None => Ok(None),
        Some(v) => v
            .parse::<i32>()
            .map(Some)
            .map_err(|_| HubError::auth(format!("invalid callnum: {:?}", v))),
    }
}

/// Strict-ish query parsing: every segment must be `name=value`. The first
/// occurrence of a name wins.
fn parse_query(query: &str) -> HubResult<HashMap<String, String>> {
    let mut args = HashMap::new();
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment
            .split_once('=')
            .ok_or_else(|| HubError::auth(format!("malformed session args: {:?}", segment)))?;
        let name = decode_component(name)?;
        let value = decode_component(value)?;
        args.entry(name).or_insert(value);
    }
    Ok(args)
}

fn decode_component(raw: &str) -> HubResult<String> {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|v| v.into_owned())
        .map_err(|_| HubError::auth(format!("malformed session args: {:?}", raw)))
}
