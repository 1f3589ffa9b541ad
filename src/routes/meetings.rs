use crate::HttpClient;
use crate::bbb::{self, BbbApi};
use crate::checksum;
use crate::config::Config;
use crate::db::Db;
use crate::models::ServerState;
use crate::placement;
use crate::response::{self, ApiResponse};
use crate::xml::XmlValue;
use indexmap::IndexMap;
use rocket::http::{Cookie, CookieJar, SameSite};
use rocket::response::Redirect;
use rocket::{State, get};
use std::collections::HashSet;

use super::{RawQuery, authenticate};

/// The unauthenticated API-root handshake: BBB frontends probe this to
/// discover the protocol version.
#[get("/")]
pub fn api_index() -> ApiResponse {
    response::success([("version", XmlValue::text("2.0"))])
}

#[get("/create")]
pub async fn create(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("create", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID").cloned() else {
        return response::missing_meeting_id();
    };

    // Reuse the running meeting's server, or pick the least loaded one
    let server = match db.get_running_meeting(&meeting_id) {
        Some(meeting) => match db.get_server_by_row_id(meeting.server_id) {
            Some(server) => server,
            None => return response::internal_error("The meeting's server no longer exists"),
        },
        None => match placement::get_next_server(db, None) {
            Ok(server) => server,
            Err(_) => {
                return response::internal_error("No server available to create the meeting on");
            }
        },
    };

    match placement::create_meeting_on(db, &http.0, config, &server, &meeting_id, &params).await {
        Ok((_, upstream)) => response::wrap_upstream(upstream),
        Err(e) => response::from_bbb_error(e),
    }
}

#[get("/join")]
pub fn join(
    db: &State<Db>,
    config: &State<Config>,
    jar: &CookieJar<'_>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("join", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };
    let Some(meeting) = db.get_running_meeting(meeting_id) else {
        return response::meeting_not_found();
    };
    let Some(server) = db.get_server_by_row_id(meeting.server_id) else {
        return response::internal_error("The meeting's server no longer exists");
    };

    // Remember the join parameters so rejoin can replay them after a move.
    // The checksum binds the payload to our secret; no time component, the
    // cookie's own expiry bounds its lifetime.
    let mut payload = params.clone();
    let cookie_checksum = checksum::rcp_checksum(&payload, &config.secret, "rejoin");
    payload.insert("checksum".to_string(), cookie_checksum);
    let json = serde_json::to_string(&payload).unwrap_or_default();
    let cookie = Cookie::build(("bbb_join", urlencoding::encode(&json).into_owned()))
        .domain(config.hostname.clone())
        .max_age(rocket::time::Duration::days(7))
        .secure(true)
        .http_only(true)
        .same_site(SameSite::Strict);
    jar.add(cookie);

    let url = BbbApi::for_server(&server).build_api_url("join", &params);
    ApiResponse::Redirect(Redirect::found(url))
}

#[get("/isMeetingRunning")]
pub fn is_meeting_running(db: &State<Db>, config: &State<Config>, query: RawQuery) -> ApiResponse {
    let params = match authenticate("isMeetingRunning", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };

    let running = db.get_running_meeting(meeting_id).is_some();
    response::success([(
        "running",
        XmlValue::text(if running { "true" } else { "false" }),
    )])
}

#[get("/end")]
pub async fn end(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("end", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };
    let Some(meeting) = db.get_running_meeting(meeting_id) else {
        return response::meeting_not_found();
    };
    let Some(server) = db.get_server_by_row_id(meeting.server_id) else {
        return response::internal_error("The meeting's server no longer exists");
    };

    match BbbApi::for_server(&server).send(&http.0, "end", &params).await {
        Ok(upstream) => {
            if bbb::is_success(&upstream) {
                db.set_meeting_ended(meeting.id);
            }
            response::wrap_upstream(upstream)
        }
        Err(e) => response::from_bbb_error(e),
    }
}

#[get("/getMeetingInfo")]
pub async fn get_meeting_info(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("getMeetingInfo", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };
    let Some(meeting) = db.get_running_meeting(meeting_id) else {
        return response::meeting_not_found();
    };
    let Some(server) = db.get_server_by_row_id(meeting.server_id) else {
        return response::internal_error("The meeting's server no longer exists");
    };

    match BbbApi::for_server(&server)
        .send(&http.0, "getMeetingInfo", &params)
        .await
    {
        Ok(upstream) => response::wrap_upstream(upstream),
        Err(e) => response::from_bbb_error(e),
    }
}

#[get("/getMeetings")]
pub async fn get_meetings(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    if let Err(resp) = authenticate("getMeetings", &query.0, &config.secret) {
        return resp;
    }

    let mut all = Vec::new();
    for server in db
        .list_servers()
        .into_iter()
        .filter(|s| s.state == ServerState::Enabled)
    {
        // A server that cannot answer contributes nothing to the aggregate
        let upstream = match BbbApi::for_server(&server)
            .send(&http.0, "getMeetings", &IndexMap::new())
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                eprintln!("⚠️ getMeetings on #{} failed: {e}", server.server_id);
                continue;
            }
        };
        // <meetings> holds one <meeting> or many; normalize either shape
        if let Some(meeting) = upstream.get("meetings").and_then(|m| m.get("meeting")) {
            all.extend(meeting.items().into_iter().cloned());
        }
    }

    if all.is_empty() {
        response::success_with_key(
            "noMeetings",
            "no meetings were found on this server",
            [("meetings", XmlValue::text(""))],
        )
    } else {
        response::success([(
            "meetings",
            XmlValue::node([("meeting", XmlValue::List(all))]),
        )])
    }
}

#[get("/getStatistics")]
pub async fn get_statistics(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    if let Err(resp) = authenticate("getStatistics", &query.0, &config.secret) {
        return resp;
    }

    let mut all = Vec::new();
    for server in db
        .list_servers()
        .into_iter()
        .filter(|s| s.state == ServerState::Enabled)
    {
        // A server that cannot answer contributes nothing to the aggregate
        let upstream = match BbbApi::for_server(&server)
            .send(&http.0, "getMeetings", &IndexMap::new())
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                eprintln!("⚠️ getStatistics on #{} failed: {e}", server.server_id);
                continue;
            }
        };
        let Some(meeting) = upstream.get("meetings").and_then(|m| m.get("meeting")) else {
            continue;
        };
        for item in meeting.items() {
            let mut projected = IndexMap::new();
            projected.insert(
                "meetingID".to_string(),
                XmlValue::text(item.str_of("meetingID").unwrap_or("")),
            );
            for field in [
                "participantCount",
                "listenerCount",
                "voiceParticipantCount",
                "videoCount",
            ] {
                projected.insert(
                    field.to_string(),
                    XmlValue::text(item.str_of(field).unwrap_or("0")),
                );
            }
            all.push(XmlValue::Node(projected));
        }
    }

    if all.is_empty() {
        response::success_with_key(
            "noMeetings",
            "no meetings were found on this server",
            [("statistics", XmlValue::text(""))],
        )
    } else {
        response::success([(
            "statistics",
            XmlValue::node([("meeting", XmlValue::List(all))]),
        )])
    }
}

#[get("/move")]
pub async fn move_meeting(
    db: &State<Db>,
    config: &State<Config>,
    http: &State<HttpClient>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("move", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(meeting_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };
    let Some(meeting) = db.get_running_meeting(meeting_id) else {
        return response::meeting_not_found();
    };

    let destination = match params.get("serverID") {
        Some(raw) => match raw.parse::<i64>().ok().and_then(|id| db.get_server(id)) {
            Some(server) => server,
            None => {
                return response::failed(
                    "notFound",
                    "We could not find a server with that server ID",
                );
            }
        },
        None => match placement::get_next_server(db, Some(meeting.server_id)) {
            Ok(server) => server,
            Err(_) => {
                return response::failed(
                    "sameServer",
                    "There is no other server to move the meeting to",
                );
            }
        },
    };
    if destination.id == meeting.server_id {
        return response::failed("sameServer", "The meeting is already running on this server");
    }

    // End on the old server, best effort; migration proceeds regardless
    if let Some(server) = db.get_server_by_row_id(meeting.server_id) {
        let mut end_params = IndexMap::new();
        end_params.insert("meetingID".to_string(), meeting.meeting_id.clone());
        if let Some(password) = meeting.create_query.get("moderatorPW") {
            end_params.insert("password".to_string(), password.clone());
        }
        let _ = BbbApi::for_server(&server)
            .send(&http.0, "end", &end_params)
            .await;
    }
    db.set_meeting_ended(meeting.id);

    match placement::create_meeting_on(
        db,
        &http.0,
        config,
        &destination,
        &meeting.meeting_id,
        &meeting.create_query,
    )
    .await
    {
        Ok((new_id, upstream)) => {
            if bbb::is_success(&upstream) {
                db.set_meeting_moved_to(meeting.id, new_id);
            }
            response::wrap_upstream(upstream)
        }
        Err(e) => response::from_bbb_error(e),
    }
}

#[get("/rejoin")]
pub fn rejoin(
    db: &State<Db>,
    config: &State<Config>,
    jar: &CookieJar<'_>,
    query: RawQuery,
) -> ApiResponse {
    let params = match authenticate("rejoin", &query.0, &config.secret) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let Some(raw_id) = params.get("meetingID") else {
        return response::missing_meeting_id();
    };
    let Some(origin) = raw_id.parse::<i64>().ok().and_then(|id| db.get_meeting_by_id(id)) else {
        return response::meeting_not_found();
    };

    // Walk the moved_to chain to the terminal meeting. The chain is a
    // forest by invariant, but a visited set keeps a corrupted row from
    // spinning us forever.
    let mut meeting = origin.clone();
    let mut seen = HashSet::new();
    seen.insert(meeting.id);
    while let Some(next_id) = meeting.moved_to {
        if !seen.insert(next_id) {
            break;
        }
        match db.get_meeting_by_id(next_id) {
            Some(next) => meeting = next,
            None => break,
        }
    }

    if meeting.id == origin.id {
        // Never moved: this is a plain logout, send the user where the
        // original create wanted them
        let target = origin
            .create_query
            .get("logoutURL")
            .cloned()
            .unwrap_or_else(|| config.logout_url.clone());
        return ApiResponse::Redirect(Redirect::found(target));
    }

    let Some(cookie) = jar.get("bbb_join") else {
        return response::failed("noJoinCookie", "Your browser did not send a join cookie");
    };
    let decoded = checksum::decode_component(cookie.value());
    let Ok(mut cookie_params) = serde_json::from_str::<IndexMap<String, String>>(&decoded) else {
        return response::failed("noJoinCookie", "Your join cookie could not be read");
    };
    let provided = cookie_params.shift_remove("checksum").unwrap_or_default();
    if checksum::rcp_checksum(&cookie_params, &config.secret, "rejoin") != provided {
        return response::checksum_error();
    }

    let Some(server) = db.get_server_by_row_id(meeting.server_id) else {
        return response::meeting_not_found();
    };
    cookie_params.insert("meetingID".to_string(), meeting.meeting_id.clone());
    let url = BbbApi::for_server(&server).build_api_url("join", &cookie_params);
    ApiResponse::Redirect(Redirect::found(url))
}
