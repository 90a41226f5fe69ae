//! Constants shared between the server and its clients.

/// The default location of the server configuration.
pub const DEFAULT_SERVER_CONFIG_PATH: &str = "/etc/gatehouse/server.toml";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8443";

/// Submission field carrying the username or email during identification.
pub const FIELD_IDENTIFIER: &str = "identifier";
/// Submission field carrying the password.
pub const FIELD_PASSWORD: &str = "password";
/// Submission field carrying the token produced by the captcha widget.
pub const FIELD_CAPTCHA_TOKEN: &str = "captcha_token";

/// Query parameter that names the flow session when starting a source login.
pub const QUERY_SESSION: &str = "session";
/// The oauth style state parameter. The session id is its prefix.
pub const QUERY_STATE: &str = "state";
pub const QUERY_CODE: &str = "code";
pub const QUERY_ERROR: &str = "error";

pub const CONTENT_TYPE_JSON: &str = "application/json";
