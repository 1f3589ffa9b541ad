use bbb_loadbalancer::checksum;
use bbb_loadbalancer::config::Config;
use bbb_loadbalancer::db::Db;
use bbb_loadbalancer::models::TEMP_INTERNAL_ID;
use indexmap::IndexMap;
use rocket::http::{ContentType, Cookie, Header, Status};
use rocket::local::blocking::Client;

const SECRET: &str = "SECRET";
const MONITORING_SECRET: &str = "MONSECRET";

/// Wrapper around Client that auto-deletes the temp DB on drop.
struct TestClient {
    client: Option<Client>,
    db_path: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        // Drop the client first to release the SQLite connection (WAL mode)
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl TestClient {
    /// A second connection onto the same file, for seeding fixtures.
    fn db(&self) -> Db {
        Db::open(&self.db_path)
    }
}

fn test_client() -> TestClient {
    let db_path = format!(
        "/tmp/lb_gateway_test_{}_{:?}.db",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    let mut config = Config::default();
    config.database.path = db_path.clone();
    config.secret = SECRET.to_string();
    config.monitoring.secret = MONITORING_SECRET.to_string();
    config.hostname = "localhost".to_string();
    config.logout_url = "/bye-default".to_string();
    config.poll_interval = 0;

    let rocket = bbb_loadbalancer::rocket(config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
    }
}

/// Sign a query string the way a BBB frontend would (SHA-1).
fn signed(endpoint: &str, query: &str) -> String {
    let sum = checksum::sha1_hex(&format!("{endpoint}{query}{SECRET}"));
    format!("/bigbluebutton/api/{endpoint}?{query}&checksum={sum}")
}

fn no_params() -> IndexMap<String, String> {
    IndexMap::new()
}

fn add_reachable_server(db: &Db, server_id: i64, url: &str) -> i64 {
    let row = db.create_server(server_id, url, "upstream-secret").unwrap();
    db.set_server_reachability(server_id, true);
    row
}

// --- Checksum validation ---

#[test]
fn test_invalid_checksum_yields_failed_envelope() {
    let client = test_client();
    let res = client
        .get("/bigbluebutton/api/create?meetingID=x&checksum=deadbeef")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(res.content_type(), Some(ContentType::XML));
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>FAILED</returncode>"));
    assert!(body.contains("<messageKey>checksumError</messageKey>"));
}

#[test]
fn test_checksum_as_first_parameter_fails_validation() {
    let client = test_client();
    // Correctly computed over "meetingID=x", but placed first: the strip
    // pattern needs a leading '&', so validation sees the pair and fails
    let sum = checksum::sha1_hex(&format!("isMeetingRunningmeetingID=x{SECRET}"));
    let res = client
        .get(format!(
            "/bigbluebutton/api/isMeetingRunning?checksum={sum}&meetingID=x"
        ))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("checksumError"));
}

#[test]
fn test_sha256_checksum_accepted() {
    let client = test_client();
    let query = "meetingID=ghost";
    let sum = checksum::sha256_hex(&format!("isMeetingRunning{query}{SECRET}"));
    let res = client
        .get(format!(
            "/bigbluebutton/api/isMeetingRunning?{query}&checksum={sum}"
        ))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<running>false</running>"));
}

// --- Version handshake ---

#[test]
fn test_api_root_reports_version() {
    let client = test_client();
    let res = client.get("/bigbluebutton/api").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<version>2.0</version>"));
}

#[test]
fn test_unknown_endpoint_yields_not_found_envelope() {
    let client = test_client();
    let res = client.get("/bigbluebutton/api/bogusCall?a=1").dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>notFound</messageKey>"));
}

// --- isMeetingRunning ---

#[test]
fn test_is_meeting_running_reflects_registry() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    db.create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    let res = client.get(signed("isMeetingRunning", "meetingID=room1")).dispatch();
    assert!(res.into_string().unwrap().contains("<running>true</running>"));

    let res = client.get(signed("isMeetingRunning", "meetingID=ghost")).dispatch();
    assert!(res.into_string().unwrap().contains("<running>false</running>"));
}

// --- create ---

#[test]
fn test_create_requires_meeting_id() {
    let client = test_client();
    let res = client.get(signed("create", "name=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>missingParamMeetingID</messageKey>"));
}

#[test]
fn test_create_with_empty_fleet_is_internal_error() {
    let client = test_client();
    let res = client.get(signed("create", "meetingID=room1")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>FAILED</returncode>"));
    assert!(body.contains("<messageKey>internalError</messageKey>"));
}

// --- join ---

#[test]
fn test_join_unknown_meeting_is_not_found() {
    let client = test_client();
    let res = client
        .get(signed("join", "fullName=Alice&meetingID=ghost&password=pw"))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>notFound</messageKey>"));
}

#[test]
fn test_join_redirects_upstream_and_sets_cookie() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    db.create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    let res = client
        .get(signed("join", "fullName=Alice&meetingID=room1&password=pw"))
        .dispatch();
    assert_eq!(res.status(), Status::Found);

    let location = res.headers().get_one("Location").unwrap();
    assert!(location.starts_with("https://bbb1.example.com/bigbluebutton/api/join?"));
    assert!(location.contains("fullName=Alice"));
    assert!(location.contains("checksum="));

    assert!(res.cookies().get("bbb_join").is_some());
}

// --- end ---

#[test]
fn test_end_unknown_meeting_is_not_found() {
    let client = test_client();
    let res = client
        .get(signed("end", "meetingID=ghost&password=pw"))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>notFound</messageKey>"));
}

// --- Aggregation ---

#[test]
fn test_get_meetings_with_empty_fleet_reports_no_meetings() {
    let client = test_client();
    let res = client.get(signed("getMeetings", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<messageKey>noMeetings</messageKey>"));
}

#[test]
fn test_get_statistics_with_empty_fleet_reports_no_meetings() {
    let client = test_client();
    let res = client.get(signed("getStatistics", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>noMeetings</messageKey>"));
}

const STUB_MEETINGS_BODY: &str = "<response><returncode>SUCCESS</returncode><meetings>\
    <meeting><meetingID>stub-room</meetingID><participantCount>3</participantCount>\
    <listenerCount>1</listenerCount></meeting></meetings></response>";

/// Minimal upstream stub on a loopback port: answers every request with the
/// given body. The thread lives until the test process exits.
fn spawn_stub_bbb(body: &'static str) -> String {
    use std::io::{Read, Write};
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://127.0.0.1:{port}")
}

#[test]
fn test_get_meetings_skips_failing_servers() {
    let client = test_client();
    let db = client.db();
    // ENABLED but unreachable: must not abort the whole aggregate
    add_reachable_server(&db, 1, "bbb-dead.invalid");
    let stub = spawn_stub_bbb(STUB_MEETINGS_BODY);
    add_reachable_server(&db, 2, &stub);

    let res = client.get(signed("getMeetings", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<meetingID>stub-room</meetingID>"));
    assert!(!body.contains("noMeetings"));
}

#[test]
fn test_get_meetings_with_only_failing_servers_reports_no_meetings() {
    let client = test_client();
    let db = client.db();
    add_reachable_server(&db, 1, "bbb-dead.invalid");

    let res = client.get(signed("getMeetings", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<messageKey>noMeetings</messageKey>"));
    assert!(!body.contains("noResponse"));
}

#[test]
fn test_get_statistics_skips_failing_servers_and_projects() {
    let client = test_client();
    let db = client.db();
    add_reachable_server(&db, 1, "bbb-dead.invalid");
    let stub = spawn_stub_bbb(STUB_MEETINGS_BODY);
    add_reachable_server(&db, 2, &stub);

    let res = client.get(signed("getStatistics", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<meetingID>stub-room</meetingID>"));
    assert!(body.contains("<participantCount>3</participantCount>"));
    // Fields the upstream omitted are projected as zero
    assert!(body.contains("<videoCount>0</videoCount>"));
}

// --- move ---

#[test]
fn test_move_unknown_meeting_is_not_found() {
    let client = test_client();
    let res = client.get(signed("move", "meetingID=ghost")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>notFound</messageKey>"));
}

#[test]
fn test_move_to_current_server_is_same_server() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 7, "bbb7.example.com");
    db.create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    let res = client
        .get(signed("move", "meetingID=room1&serverID=7"))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>sameServer</messageKey>"));
}

#[test]
fn test_move_with_no_alternative_is_same_server() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    db.create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    let res = client.get(signed("move", "meetingID=room1")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>sameServer</messageKey>"));
}

// --- rejoin ---

#[test]
fn test_rejoin_requires_meeting_id() {
    let client = test_client();
    let res = client.get(signed("rejoin", "random=x")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>missingParamMeetingID</messageKey>"));
}

#[test]
fn test_rejoin_unknown_meeting_is_not_found() {
    let client = test_client();
    let res = client.get(signed("rejoin", "meetingID=999")).dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>notFound</messageKey>"));
}

#[test]
fn test_rejoin_unmoved_meeting_redirects_to_original_logout() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    let mut query = IndexMap::new();
    query.insert("meetingID".to_string(), "room1".to_string());
    query.insert("logoutURL".to_string(), "https://example.com/bye".to_string());
    let id = db
        .create_meeting("room1", "internal-1", server, 1, &query)
        .unwrap();

    let res = client
        .get(signed("rejoin", &format!("meetingID={id}")))
        .dispatch();
    assert_eq!(res.status(), Status::Found);
    assert_eq!(
        res.headers().get_one("Location"),
        Some("https://example.com/bye")
    );
}

#[test]
fn test_rejoin_unmoved_meeting_falls_back_to_configured_logout() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    let id = db
        .create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    let res = client
        .get(signed("rejoin", &format!("meetingID={id}")))
        .dispatch();
    assert_eq!(res.status(), Status::Found);
    assert_eq!(res.headers().get_one("Location"), Some("/bye-default"));
}

/// Seed an ended meeting whose `moved_to` points at a running replacement
/// on a second server; returns the old row's id.
fn seed_moved_meeting(db: &Db) -> i64 {
    let a = add_reachable_server(db, 1, "bbb1.example.com");
    let b = add_reachable_server(db, 2, "bbb2.example.com");
    let old = db.create_meeting("room1", "i1", a, 1, &no_params()).unwrap();
    db.set_meeting_ended(old);
    let new = db.create_meeting("room1", "i2", b, 1, &no_params()).unwrap();
    db.set_meeting_moved_to(old, new);
    old
}

#[test]
fn test_rejoin_moved_meeting_requires_cookie() {
    let client = test_client();
    let old = seed_moved_meeting(&client.db());

    let res = client
        .get(signed("rejoin", &format!("meetingID={old}")))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>noJoinCookie</messageKey>"));
}

fn join_cookie(pairs: &[(&str, &str)], checksum_value: &str) -> Cookie<'static> {
    let mut payload: IndexMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    payload.insert("checksum".to_string(), checksum_value.to_string());
    let json = serde_json::to_string(&payload).unwrap();
    Cookie::new("bbb_join", urlencoding::encode(&json).into_owned())
}

#[test]
fn test_rejoin_moved_meeting_rejects_forged_cookie() {
    let client = test_client();
    let old = seed_moved_meeting(&client.db());

    let cookie = join_cookie(
        &[("fullName", "Alice"), ("meetingID", "room1"), ("password", "pw")],
        "deadbeef",
    );
    let res = client
        .get(signed("rejoin", &format!("meetingID={old}")))
        .cookie(cookie)
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>checksumError</messageKey>"));
}

#[test]
fn test_rejoin_moved_meeting_redirects_to_new_server() {
    let client = test_client();
    let old = seed_moved_meeting(&client.db());

    let params: IndexMap<String, String> =
        [("fullName", "Alice"), ("meetingID", "room1"), ("password", "pw")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    let sum = checksum::rcp_checksum(&params, SECRET, "rejoin");
    let cookie = join_cookie(
        &[("fullName", "Alice"), ("meetingID", "room1"), ("password", "pw")],
        &sum,
    );

    let res = client
        .get(signed("rejoin", &format!("meetingID={old}")))
        .cookie(cookie)
        .dispatch();
    assert_eq!(res.status(), Status::Found);
    let location = res.headers().get_one("Location").unwrap();
    assert!(location.starts_with("https://bbb2.example.com/bigbluebutton/api/join?"));
    assert!(location.contains("fullName=Alice"));
}

#[test]
fn test_rejoin_survives_a_moved_to_cycle() {
    let client = test_client();
    let db = client.db();
    let a = add_reachable_server(&db, 1, "bbb1.example.com");
    let old = db.create_meeting("room1", "i1", a, 1, &no_params()).unwrap();
    db.set_meeting_ended(old);
    let new = db.create_meeting("room1", "i2", a, 1, &no_params()).unwrap();
    db.set_meeting_moved_to(old, new);
    // Corrupt the forest into a cycle; traversal must still terminate
    db.set_meeting_moved_to(new, old);

    let res = client
        .get(signed("rejoin", &format!("meetingID={old}")))
        .dispatch();
    let body = res.into_string().unwrap();
    assert!(body.contains("<messageKey>noJoinCookie</messageKey>"));
}

// --- create invariant (S2's registry side) ---

#[test]
fn test_second_create_reuses_running_row() {
    let client = test_client();
    let db = client.db();
    let server = add_reachable_server(&db, 1, "bbb1.example.com");
    db.create_meeting("room1", "internal-1", server, 1, &no_params())
        .unwrap();

    // The gateway will try to proxy to the (unreachable) upstream; the
    // registry must still hold exactly one running row afterwards
    let _ = client.get(signed("create", "meetingID=room1")).dispatch();

    let meeting = db.get_running_meeting("room1").unwrap();
    assert_eq!(meeting.internal_id, "internal-1");
    assert_ne!(meeting.internal_id, TEMP_INTERNAL_ID);
}

// --- Monitoring ---

#[test]
fn test_monitoring_requires_authorization_header() {
    let client = test_client();
    let res = client.get("/monitoring/getServers").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_monitoring_rejects_bad_checksum() {
    let client = test_client();
    let res = client
        .get("/monitoring/getServers")
        .header(Header::new("Authorization", "deadbeef"))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_monitoring_counts_servers_by_state() {
    let client = test_client();
    let db = client.db();
    add_reachable_server(&db, 1, "bbb1.example.com");
    add_reachable_server(&db, 2, "bbb2.example.com");

    let now = chrono::Utc::now().timestamp();
    let sum = checksum::rcp_checksum_at(&no_params(), MONITORING_SECRET, "getServers", now);
    let res = client
        .get("/monitoring/getServers")
        .header(Header::new("Authorization", sum))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["servers"]["enabled"], 2);
    assert_eq!(body["servers"]["total"], 2);
}
