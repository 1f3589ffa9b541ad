use crate::checksum;
use crate::config::Config;
use crate::db::Db;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};

use super::{AuthHeader, RawQuery};

/// Server counts by state, authenticated with a time-bound checksum in the
/// `Authorization` header (salt `getServers`).
#[get("/getServers")]
pub fn get_servers(
    db: &State<Db>,
    config: &State<Config>,
    auth: AuthHeader,
    query: RawQuery,
) -> (Status, Json<serde_json::Value>) {
    let Some(provided) = auth.0 else {
        return (
            Status::Unauthorized,
            Json(serde_json::json!({"success": false, "info": "Authentication failed"})),
        );
    };

    let params = checksum::parse_query(&query.0);
    if !checksum::validate_rcp_checksum(
        &params,
        provided.trim(),
        &config.monitoring.secret,
        "getServers",
        config.monitoring.time_delta,
    ) {
        return (
            Status::Forbidden,
            Json(serde_json::json!({"success": false, "info": "Authorization failed"})),
        );
    }

    let (enabled, disabled, panic, total) = db.count_servers_by_state();
    (
        Status::Ok,
        Json(serde_json::json!({
            "success": true,
            "info": "Ok",
            "servers": {
                "disabled": disabled,
                "enabled": enabled,
                "panic": panic,
                "total": total,
            }
        })),
    )
}
