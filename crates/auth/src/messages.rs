//! The stable 401/403 message strings. Clients and SDK retries match on these
//! verbatim; changing one is a breaking API change.

pub const MISSING_AUTH_HEADER: &str = "Missing Authorization header";
pub const MALFORMED_AUTH_HEADER: &str = "Malformed Authorization header";
pub const EMPTY_BEARER: &str = "Empty bearer token";
pub const TOKEN_EXPIRED: &str = "Token expired";
pub const TOKEN_FROM_FUTURE: &str = "Token issued in the future";
pub const INVALID_SIGNATURE: &str = "Invalid signature";
pub const UNKNOWN_KID: &str = "Unknown key ID";
pub const REVOKED_KID: &str = "Key has been revoked";
pub const TOKEN_REPLAYED: &str = "Token has already been used";
pub const INVALID_AUDIENCE: &str = "Invalid audience";
pub const INVALID_ISSUER: &str = "Invalid issuer";
pub const ISSUER_APP_MISMATCH: &str = "Issuer does not match appId";
pub const APPID_KEY_MISMATCH: &str = "appId does not match key";
pub const UNSUPPORTED_ALG: &str = "Unsupported algorithm";
pub const ROUTE_APP_MISMATCH: &str = "JWT appId does not match route appId";
pub const MISSING_ADMIN_KEY: &str = "Missing admin API key";
pub const INVALID_ADMIN_KEY: &str = "Invalid admin API key";
