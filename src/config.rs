//! Hub configuration snapshot.
//! Options are read once from `FORGEHUB_*` environment variables and then
//! passed around by value inside the request context, so a call never
//! observes a mid-flight configuration change.

/// Methods that are safe to re-execute when a client retries a call whose
/// reply was lost after the call already committed. Everything else fails
/// with a retry error in that situation.
pub const DEFAULT_RETRY_WHITELIST: &[&str] = &[
    "host.taskWait",
    "host.taskUnwait",
    "host.taskSetWait",
    "host.updateHost",
    "host.setBuildRootState",
    "repoExpire",
    "repoDelete",
    "repoProblem",
];

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connection string for the shared PostgreSQL store.
    pub database_url: String,
    /// Bind sessions to the client IP. When off, every session carries the
    /// sentinel host IP `-` and the binding check is effectively disabled.
    pub check_client_ip: bool,
    /// Certificate subject component that yields the username for SSL logins.
    pub dn_username_component: String,
    /// `|`-separated DNs allowed to log in other users over SSL.
    pub proxy_dns: String,
    /// `,`-separated Kerberos principals allowed to log in other users.
    pub proxy_principals: String,
    /// Turn off the legacy behavior of also honoring `proxy_dns` entries for
    /// GSSAPI-authenticated proxy logins.
    pub disable_gssapi_proxy_dn_fallback: bool,
    /// `*` or a comma-separated list of Kerberos realms accepted at login.
    pub allowed_krb_realms: String,
    /// Auto-provision unknown users on first certificate/Kerberos login.
    pub login_creates_user: bool,
    /// Methods exempt from the at-most-once replay rejection.
    pub retry_whitelist: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_url: "host=localhost user=forgehub dbname=forgehub".to_string(),
            check_client_ip: true,
            dn_username_component: "CN".to_string(),
            proxy_dns: String::new(),
            proxy_principals: String::new(),
            disable_gssapi_proxy_dn_fallback: false,
            allowed_krb_realms: "*".to_string(),
            login_creates_user: false,
            retry_whitelist: DEFAULT_RETRY_WHITELIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => default,
    }
}

impl HubConfig {
    /// Load a snapshot from `FORGEHUB_*` environment variables, falling back
    /// to the defaults above for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_whitelist = match std::env::var("FORGEHUB_RETRY_WHITELIST") {
            Ok(v) => v.split(',').map(|m| m.trim().to_string()).filter(|m| !m.is_empty()).collect(),
            Err(_) => defaults.retry_whitelist,
        };
        Self {
            database_url: env_str("FORGEHUB_DATABASE_URL", &defaults.database_url),
            check_client_ip: env_bool("FORGEHUB_CHECK_CLIENT_IP", defaults.check_client_ip),
            dn_username_component: env_str("FORGEHUB_DN_USERNAME_COMPONENT", &defaults.dn_username_component),
            proxy_dns: env_str("FORGEHUB_PROXY_DNS", ""),
            proxy_principals: env_str("FORGEHUB_PROXY_PRINCIPALS", ""),
            disable_gssapi_proxy_dn_fallback: env_bool(
                "FORGEHUB_DISABLE_GSSAPI_PROXY_DN_FALLBACK",
                defaults.disable_gssapi_proxy_dn_fallback,
            ),
            allowed_krb_realms: env_str("FORGEHUB_ALLOWED_KRB_REALMS", &defaults.allowed_krb_realms),
            login_creates_user: env_bool("FORGEHUB_LOGIN_CREATES_USER", defaults.login_creates_user),
            retry_whitelist,
        }
    }

    pub fn retry_allowed(&self, method: &str) -> bool {
        self.retry_whitelist.iter().any(|m| m == method)
    }
}
