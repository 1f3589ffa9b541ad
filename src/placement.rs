use crate::bbb::{self, BbbApi, BbbError};
use crate::config::Config;
use crate::db::Db;
use crate::models::{Server, TEMP_INTERNAL_ID};
use crate::xml::XmlValue;
use indexmap::IndexMap;
use rand::seq::SliceRandom;

/// No ENABLED, reachable server left to place on. Callers surface this as
/// `internalError` (or `sameServer` from move).
#[derive(Debug)]
pub struct NoServerAvailable;

/// Pick the next server to create a meeting on: among ENABLED servers with
/// a positive reachable counter, keep those with the smallest summed load
/// and choose one uniformly at random.
pub fn get_next_server(db: &Db, exclude: Option<i64>) -> Result<Server, NoServerAvailable> {
    let mut servers = db.list_servers_with_load();
    if let Some(excluded) = exclude {
        servers.retain(|(server, _)| server.id != excluded);
    }

    let smallest = servers
        .iter()
        .map(|(_, load)| *load)
        .min()
        .ok_or(NoServerAvailable)?;
    let ties: Vec<&Server> = servers
        .iter()
        .filter(|(_, load)| *load == smallest)
        .map(|(server, _)| server)
        .collect();

    ties.choose(&mut rand::thread_rng())
        .map(|server| (*server).clone())
        .ok_or(NoServerAvailable)
}

/// Create (or re-create) a meeting on a chosen server.
///
/// A TEMP row reserves the meeting id before the upstream call so concurrent
/// creates collapse onto one registration; the row is promoted with BBB's
/// `internalMeetingID` on SUCCESS and deleted on every failure path.
/// Returns the meeting's surrogate id and the upstream response.
pub async fn create_meeting_on(
    db: &Db,
    client: &reqwest::Client,
    config: &Config,
    server: &Server,
    meeting_id: &str,
    parameters: &IndexMap<String, String>,
) -> Result<(i64, XmlValue), BbbError> {
    let (row_id, was_temp) = match db.get_running_meeting(meeting_id) {
        Some(existing) => (existing.id, existing.is_temp()),
        None => {
            let load = parameters
                .get("load")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            match db.create_meeting(meeting_id, TEMP_INTERNAL_ID, server.id, load, parameters) {
                Ok(id) => (id, true),
                // Lost the insert race; the winner's running row is ours to reuse
                Err(_) => match db.get_running_meeting(meeting_id) {
                    Some(existing) => (existing.id, existing.is_temp()),
                    None => {
                        return Err(BbbError::NoResponse(
                            "could not register the meeting".to_string(),
                        ));
                    }
                },
            }
        }
    };

    // Direct logoutURL to us, carrying the surrogate id for rejoin
    let mut parameters = parameters.clone();
    let mut rejoin_params = IndexMap::new();
    rejoin_params.insert("meetingID".to_string(), row_id.to_string());
    parameters.insert(
        "logoutURL".to_string(),
        BbbApi::for_gateway(config).build_api_url("rejoin", &rejoin_params),
    );

    let api = BbbApi::for_server(server);
    let response = match api.send(client, "create", &parameters).await {
        Ok(response) => response,
        Err(e) => {
            if was_temp {
                db.delete_meeting(row_id);
            }
            return Err(e);
        }
    };

    if was_temp {
        if bbb::is_success(&response) {
            let internal = response.str_of("internalMeetingID").unwrap_or_default();
            db.set_meeting_internal_id(row_id, internal);
        } else {
            db.delete_meeting(row_id);
        }
    }

    Ok((row_id, response))
}
