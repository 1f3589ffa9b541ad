// Route module decomposition: meeting endpoints, recording endpoints and
// the monitoring surface in their own files. Shared request machinery
// (raw-query guard, checksum authentication, catchers) lives here.

mod meetings;
mod monitoring;
mod recordings;

pub use meetings::{
    api_index, create, end, get_meeting_info, get_meetings, get_statistics, is_meeting_running,
    join, move_meeting, rejoin,
};
pub use monitoring::get_servers;
pub use recordings::{delete_recordings, get_recordings, publish_recordings, update_recordings};

use crate::checksum;
use crate::response::{self, ApiResponse};
use indexmap::IndexMap;
use rocket::request::{FromRequest, Outcome, Request};

/// The raw query string, byte-exact. Checksums are computed over the
/// original bytes, so the decoded parameter map is not enough.
pub struct RawQuery(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RawQuery {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let raw = req
            .uri()
            .query()
            .map(|q| q.as_str().to_string())
            .unwrap_or_default();
        Outcome::Success(RawQuery(raw))
    }
}

/// The `Authorization` header, if any (monitoring endpoint).
pub struct AuthHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(AuthHeader(
            req.headers().get_one("Authorization").map(String::from),
        ))
    }
}

/// Checksum-validate an incoming request and hand back its parameters,
/// decoded, in query-string order, without the checksum pair.
pub fn authenticate(
    endpoint: &str,
    raw_query: &str,
    secret: &str,
) -> Result<IndexMap<String, String>, ApiResponse> {
    let mut params = checksum::parse_query(raw_query);
    let provided = params.shift_remove("checksum").unwrap_or_default();
    if !checksum::verify_api_checksum(endpoint, raw_query, &provided, secret) {
        return Err(response::checksum_error());
    }
    Ok(params)
}

// --- Catchers ---

#[rocket::catch(404)]
pub fn unknown_endpoint() -> ApiResponse {
    response::failed("notFound", "This endpoint does not exist")
}

#[rocket::catch(500)]
pub fn server_error() -> ApiResponse {
    response::internal_error("An unexpected error occurred")
}
