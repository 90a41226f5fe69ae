// Default values applied when a flow or the server configuration does not
// say otherwise. All durations are in seconds.

/// How long a flow session may remain in progress before it expires.
pub const DEFAULT_SESSION_TTL: u64 = 300;
/// How many failed submissions a single stage tolerates before the flow fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Upper bound on any single call to a source or captcha verifier.
pub const DEFAULT_COLLABORATOR_TIMEOUT: u64 = 10;
/// How long an expired or finished session is retained before deletion.
pub const DEFAULT_SESSION_RETENTION: u64 = 3600;

// How often the sweeper runs.
#[cfg(test)]
pub const PURGE_FREQUENCY: u64 = 2;
#[cfg(not(test))]
pub const PURGE_FREQUENCY: u64 = 60;

pub const DEFAULT_CAPTCHA_SCORE_MIN: f64 = 0.5;
pub const DEFAULT_CAPTCHA_SCORE_MAX: f64 = 1.0;

/// Length of the random component of an oauth state value.
pub const SOURCE_NONCE_LEN: usize = 32;

// Well known flow context keys. Stages communicate only through these.
pub const CTX_PENDING_USER: &str = "pending_user";
pub const CTX_PENDING_USER_UNKNOWN: &str = "pending_user_unknown";
pub const CTX_AUTHENTICATED_USER: &str = "authenticated_user";
pub const CTX_PASSWORD_VERIFIED: &str = "password_verified";
pub const CTX_CAPTCHA_PASSED: &str = "captcha_passed";
pub const CTX_CAPTCHA_SCORE: &str = "captcha_score";
pub const CTX_SOURCE: &str = "source";
pub const CTX_SOURCE_CLAIMS: &str = "source_claims";
pub const CTX_SOURCE_AUTHENTICATED: &str = "source_authenticated";
pub const CTX_RISK: &str = "risk";
/// Stages that ran because a policy demanded them.
pub const CTX_REQUIRED_STAGES_PASSED: &str = "required_stages_passed";

pub const BAD_IDENTIFIER_MSG: &str = "failed to identify the user";
pub const BAD_PASSWORD_MSG: &str = "incorrect password";
pub const BAD_CAPTCHA_MSG: &str = "captcha verification failed";
pub const BAD_SOURCE_MSG: &str = "the external login did not complete";
pub const BAD_INPUT_MSG: &str = "the submission does not match the current stage";
pub const RETRIES_EXHAUSTED_MSG: &str = "too many failed attempts";
pub const FLOW_FAILED_MSG: &str = "this login has failed, start a new one";
