use crate::bbb::{self, BbbApi};
use crate::config::Config;
use crate::db::{Db, ReachabilityAction};
use crate::models::{Meeting, Server, ServerState};
use crate::panic;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;

/// Host processes probed over ssh each cycle.
const PROCESS_CHECKS: [&str; 5] = ["nginx", "freeswitch", "redis-server", "mongod", "etherpad"];
/// Systemd units probed over ssh each cycle.
const SYSTEMD_CHECKS: [&str; 4] = [
    "bbb-html5-backend@1",
    "bbb-html5-backend@2",
    "bbb-html5-frontend@1",
    "bbb-html5-frontend@2",
];
const CHECK_ATTEMPTS: u32 = 3;

struct CheckOutcome {
    ok: bool,
    message: String,
}

enum Check {
    /// `<script> <host> <ssh_user> <unit>`; exit code 0 means healthy.
    Script { file: String, unit: String },
    /// GET `<server>/bigbluebutton/api` expecting 200.
    Api,
}

/// Spawns the background poller: every `poll_interval` seconds it re-reads
/// the fleet, fans out one check bundle per server and one liveness probe
/// per pollable meeting, and applies the reachability hysteresis.
///
/// Opens its own database connection; a check failure never kills the loop.
pub fn spawn_poller(db_path: String, config: Config) {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        let db = Arc::new(Db::open(&db_path));
        let config = Arc::new(config);
        let interval = Duration::from_secs(config.poll_interval);

        loop {
            let servers = db.list_servers();
            let meetings = db.list_candidate_meetings_for_poll();

            for server in servers {
                tokio::spawn(run_check_bundle(
                    db.clone(),
                    client.clone(),
                    config.clone(),
                    server,
                ));
            }
            for meeting in meetings {
                tokio::spawn(probe_meeting(db.clone(), client.clone(), meeting));
            }

            tokio::time::sleep(interval).await;
        }
    });
}

/// Run one server's checks in sequence. A check gets 3 attempts with 1 s
/// pauses; once one fails for good the rest of the bundle is skipped and the
/// server counts as offline for this cycle.
async fn run_check_bundle(
    db: Arc<Db>,
    client: reqwest::Client,
    config: Arc<Config>,
    server: Server,
) {
    let host = host_of(&server.url);
    let mut checks: Vec<(String, Check)> = Vec::new();

    let process_file = format!("{}/check_running_processes.sh", config.plugin_path);
    for process in PROCESS_CHECKS {
        checks.push((
            format!("FILE: check_running_processes.sh {process}"),
            Check::Script {
                file: process_file.clone(),
                unit: process.to_string(),
            },
        ));
    }
    let systemd_file = format!("{}/check_systemd.sh", config.plugin_path);
    for unit in SYSTEMD_CHECKS {
        checks.push((
            format!("FILE: check_systemd.sh {unit}"),
            Check::Script {
                file: systemd_file.clone(),
                unit: unit.to_string(),
            },
        ));
    }
    checks.push(("API Reachability".to_string(), Check::Api));

    let mut online = true;
    'bundle: for (name, check) in checks {
        for attempt in 1..=CHECK_ATTEMPTS {
            let result = match &check {
                Check::Script { file, unit } => {
                    run_script(file, &host, &config.ssh_user, unit).await
                }
                Check::Api => check_api(&client, &server.url).await,
            };
            if result.ok {
                continue 'bundle;
            }
            eprintln!(
                "{name}: #{}: Try {attempt}/{CHECK_ATTEMPTS}: Check was not successful: {}",
                server.server_id, result.message
            );
            if attempt < CHECK_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        online = false;
        eprintln!(
            "{name}: #{}: failed, skipping all remaining checks",
            server.server_id
        );
        break;
    }

    match db.set_server_reachability(server.server_id, online) {
        ReachabilityAction::None => {}
        ReachabilityAction::TriggerPanic => {
            let db = db.clone();
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                // Re-read: the state must be current for the re-entrancy check
                if let Some(current) = db.get_server(server.server_id) {
                    panic::set_server_state(&db, &client, &config, &current, ServerState::Panic)
                        .await;
                }
            });
        }
    }
}

async fn run_script(file: &str, host: &str, ssh_user: &str, unit: &str) -> CheckOutcome {
    match tokio::process::Command::new("/bin/bash")
        .arg(file)
        .arg(host)
        .arg(ssh_user)
        .arg(unit)
        .output()
        .await
    {
        Ok(output) => CheckOutcome {
            ok: output.status.success(),
            message: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        },
        Err(e) => CheckOutcome {
            ok: false,
            message: format!("could not run {file}: {e}"),
        },
    }
}

async fn check_api(client: &reqwest::Client, url: &str) -> CheckOutcome {
    let normalized = bbb::normalize_url(url);
    let endpoint = normalized.trim_end_matches('/');
    match client.get(endpoint).send().await {
        Ok(response) if response.status().as_u16() == 200 => CheckOutcome {
            ok: true,
            message: "API is reachable".to_string(),
        },
        Ok(response) => CheckOutcome {
            ok: false,
            message: format!("Status code: {}", response.status().as_u16()),
        },
        Err(e) => CheckOutcome {
            ok: false,
            message: format!("Exception during request: {e}"),
        },
    }
}

/// Upstream `getMeetingInfo` as a liveness probe. A FAILED response means
/// BBB no longer knows the meeting; transport errors count as still alive.
async fn probe_meeting(db: Arc<Db>, client: reqwest::Client, meeting: Meeting) {
    let Some(server) = db.get_server_by_row_id(meeting.server_id) else {
        return;
    };
    let api = BbbApi::for_server(&server);
    let mut params = IndexMap::new();
    params.insert("meetingID".to_string(), meeting.meeting_id.clone());

    match api.send(&client, "getMeetingInfo", &params).await {
        Ok(response) if !bbb::is_success(&response) => {
            println!(
                "Meeting {} ended on server #{}",
                meeting.meeting_id, server.server_id
            );
            db.set_meeting_ended(meeting.id);
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!(
                "⚠️ Could not check meeting {}: {e}",
                meeting.meeting_id
            );
        }
    }
}

fn host_of(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest).to_string()
}
