use crate::bbb::{self, BbbApi};
use crate::config::Config;
use crate::db::Db;
use crate::models::{Server, ServerState};
use crate::placement;
use indexmap::IndexMap;

/// Change a server's state. Entering PANIC also evacuates every running
/// meeting: best-effort upstream end, mark ended, reopen elsewhere from the
/// stored create parameters.
///
/// Re-entrant: both the poller and the CLI call this, so a server already in
/// the requested state is a no-op and evacuation skips meetings another run
/// has ended.
pub async fn set_server_state(
    db: &Db,
    client: &reqwest::Client,
    config: &Config,
    server: &Server,
    state: ServerState,
) {
    if server.state == state {
        return;
    }
    db.set_server_state(server.id, state);

    if state != ServerState::Panic {
        return;
    }

    let api = BbbApi::for_server(server);
    for meeting in db.list_running_meetings_on(server.id) {
        match db.get_meeting_by_id(meeting.id) {
            Some(current) if !current.ended => {}
            _ => continue,
        }

        // Try sending the end call, hoping it can still reach the server
        let mut end_params = IndexMap::new();
        end_params.insert("meetingID".to_string(), meeting.meeting_id.clone());
        if let Some(password) = meeting.create_query.get("moderatorPW") {
            end_params.insert("password".to_string(), password.clone());
        }
        let _ = api.send(client, "end", &end_params).await;
        db.set_meeting_ended(meeting.id);

        // Reopen the meeting on a new server
        let new_server = match placement::get_next_server(db, None) {
            Ok(server) => server,
            Err(_) => {
                eprintln!(
                    "Couldn't reopen '{}': no server available",
                    meeting.meeting_id
                );
                continue;
            }
        };
        match placement::create_meeting_on(
            db,
            client,
            config,
            &new_server,
            &meeting.meeting_id,
            &meeting.create_query,
        )
        .await
        {
            Ok((new_id, response)) if bbb::is_success(&response) => {
                db.set_meeting_moved_to(meeting.id, new_id);
                println!(
                    "Reopened '{}' on #{}",
                    meeting.meeting_id, new_server.server_id
                );
            }
            Ok((_, response)) => {
                eprintln!(
                    "Couldn't reopen '{}': {}",
                    meeting.meeting_id,
                    response.str_of("message").unwrap_or("unknown error")
                );
            }
            Err(e) => {
                eprintln!("Couldn't reopen '{}': {e}", meeting.meeting_id);
            }
        }
    }
}
