use crate::HttpClient;
use crate::bbb::{self, BbbApi};
use crate::checksum;
use crate::config::Config;
use crate::db::Db;
use crate::models::{ServerState, TEMP_INTERNAL_ID};
use crate::response::{self, ApiResponse};
use crate::xml::XmlValue;
use indexmap::IndexMap;
use rocket::{State, get};
use std::collections::HashMap;

use super::{RawQuery, authenticate};

/// POST `{recordings, checksum}` to the player service. `Ok(None)` means the
/// player answered with a non-2xx status.
async fn call_player(
    client: &reqwest::Client,
    config: &Config,
    endpoint: &str,
    recordings: &[String],
) -> Result<Option<String>, ApiResponse> {
    let mut checksum_params = IndexMap::new();
    checksum_params.insert("recordings".to_string(), recordings.join(","));
    let request_checksum =
        checksum::rcp_checksum(&checksum_params, &config.player.rcp_secret, endpoint);
    let body = serde_json::json!({
        "recordings": recordings,
        "checksum": request_checksum,
    });

    let url = format!("{}{endpoint}", config.player.api_url);
    match client.post(&url).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(text) => Ok(Some(text)),
            Err(_) => Err(response::no_response()),
        },
        Ok(_) => Ok(None),
        Err(_) => Err(response::no_response()),
    }
}

/// Drop an `<?xml …?>` declaration so a full document can be inlined into
/// our envelope.
fn strip_xml_decl(body: &str) -> &str {
    let trimmed = body.trim();
    if let Some(rest) = trimmed.strip_prefix("<?xml") {
        if let Some(end) = rest.find("?>") {
            return rest[end + 2..].trim_start();
        }
    }
    trimmed
}

fn no_recordings() -> ApiResponse {
    response::success_with_key(
        "noRecordings",
        "There are no recordings for the meeting(s).",
        [("recordings", XmlValue::text(""))],
    )
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[get("/getRecordings")]
pub async fn get_recordings(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("getRecordings", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };

    // A recordID list resolves directly; meetingIDs translate to the
    // internal ids of every meeting row that carried them
    let record_ids: Vec<String> = if let Some(raw) = params.get("recordID") {
        split_ids(raw)
    } else if let Some(raw) = params.get("meetingID") {
        raw.split(',')
            .map(str::trim)
            .flat_map(|meeting_id| db.list_meetings_by_meeting_id(meeting_id))
            .map(|meeting| meeting.internal_id)
            .filter(|id| !id.is_empty() && id != TEMP_INTERNAL_ID)
            .collect()
    } else {
        Vec::new()
    };

    if record_ids.is_empty() {
        return no_recordings();
    }

    match call_player(&http.0, config, "getRecordings", &record_ids).await {
        Ok(Some(body)) if !body.trim().is_empty() => {
            let inline = strip_xml_decl(&body).to_string();
            response::success([("recordings", XmlValue::Raw(inline))])
        }
        Ok(_) => no_recordings(),
        Err(resp) => resp,
    }
}

#[get("/publishRecordings")]
pub async fn publish_recordings(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("publishRecordings", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(record_id) = params.get("recordID") else {
        return response::failed("missingParamRecordID", "You must specify a recordID.");
    };
    let Some(publish) = params.get("publish").cloned() else {
        return response::failed("missingParamPublish", "You must specify a publish value true or false.");
    };

    let mut any_success = false;
    for (server, ids) in group_by_server(db, record_id) {
        let mut upstream_params = IndexMap::new();
        upstream_params.insert("recordID".to_string(), ids.join(","));
        upstream_params.insert("publish".to_string(), publish.clone());
        if let Ok(upstream) = BbbApi::for_server(&server)
            .send(&http.0, "publishRecordings", &upstream_params)
            .await
        {
            if bbb::is_success(&upstream) {
                any_success = true;
            }
        }
    }

    if any_success {
        response::success([("published", XmlValue::text(publish))])
    } else {
        response::failed("notFound", "We could not find recordings")
    }
}

#[get("/updateRecordings")]
pub async fn update_recordings(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("updateRecordings", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(record_id) = params.get("recordID") else {
        return response::failed("missingParamRecordID", "You must specify a recordID.");
    };

    // Everything except the record list is forwarded untouched
    let mut forwarded = params.clone();
    forwarded.shift_remove("recordID");

    let mut any_success = false;
    for (server, ids) in group_by_server(db, record_id) {
        let mut upstream_params = IndexMap::new();
        upstream_params.insert("recordID".to_string(), ids.join(","));
        upstream_params.extend(forwarded.clone());
        if let Ok(upstream) = BbbApi::for_server(&server)
            .send(&http.0, "updateRecordings", &upstream_params)
            .await
        {
            if bbb::is_success(&upstream) {
                any_success = true;
            }
        }
    }

    if any_success {
        response::success([("updated", XmlValue::text("true"))])
    } else {
        response::failed("notFound", "We could not find recordings")
    }
}

#[get("/deleteRecordings")]
pub async fn delete_recordings(
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("deleteRecordings", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(record_id) = params.get("recordID") else {
        return response::failed("missingParamRecordID", "You must specify a recordID.");
    };

    match call_player(&http.0, config, "deleteRecordings", &split_ids(record_id)).await {
        Ok(Some(_)) => response::success([("deleted", XmlValue::text("true"))]),
        Ok(None) => response::failed("notFound", "We could not find recordings"),
        Err(resp) => resp,
    }
}

/// Split a comma-joined record list and group the ids by the ENABLED server
/// owning each recording (matched via the meeting's internal id).
fn group_by_server(db: &Db, record_id: &str) -> Vec<(crate::models::Server, Vec<String>)> {
    let mut by_server: HashMap<i64, Vec<String>> = HashMap::new();
    for id in split_ids(record_id) {
        if let Some(meeting) = db.get_meeting_by_internal(&id) {
            by_server.entry(meeting.server_id).or_default().push(id);
        }
    }

    let mut groups = Vec::new();
    for (server_row_id, ids) in by_server {
        if let Some(server) = db.get_server_by_row_id(server_row_id) {
            if server.state == ServerState::Enabled {
                groups.push((server, ids));
            }
        }
    }
    groups
}
