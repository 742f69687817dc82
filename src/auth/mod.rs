//! Central identity and session management for the hub.
//! Keep the public surface thin and split implementation across sub-modules.

mod access;
mod context;
mod creds;
mod login;
mod session;
pub mod tables;
mod types;

pub use access::{assert_logged_in, get_user_data, get_user_groups, get_user_perms};
pub use context::{ClientIdentity, RequestContext};
pub use creds::{
    SessionCreds, SESSION_CALLNUM_HEADER, SESSION_ID_HEADER, SESSION_KEY_HEADER,
};
pub use login::{check_login_allowed, password_login, ssl_login};
pub use session::{create_session, Session};
pub use types::{AuthType, SessionInfo, SessionRow, UserRow, UserStatus, UserType};
