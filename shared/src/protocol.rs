/// Seconds a registration survives without a heartbeat
pub const MISSED_HEARTBEAT_TTL_SECS: u64 = 5;

/// How often registrants are expected to heartbeat
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default root under which all discovery keys live
pub const DEFAULT_KEY_PREFIX: &str = "/discover";

/// Stored in place of the attribute map when a service registers without attributes
pub const NO_ATTRS_SENTINEL: &str = "null";

/// API paths
pub const API_PREFIX: &str = "/v1";
pub const PATH_HEALTH: &str = "/v1/health";
pub const PATH_REGISTER: &str = "/v1/register";
pub const PATH_UNREGISTER: &str = "/v1/unregister";
pub const PATH_HEARTBEAT: &str = "/v1/heartbeat";

/// Subscribe endpoint for a single service name
pub fn subscribe_path(name: &str) -> String {
    format!("{}/services/{}/subscribe", API_PREFIX, name)
}

/// Error codes carried in `ErrorResponse::code`
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_INVALID_ARGUMENT: &str = "invalid_argument";
pub const ERR_INTERNAL: &str = "internal";
