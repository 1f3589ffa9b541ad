pub mod bbb;
pub mod checksum;
pub mod config;
pub mod db;
pub mod models;
pub mod panic;
pub mod placement;
pub mod poller;
pub mod response;
pub mod routes;
pub mod xml;

use config::Config;
use db::Db;
use std::time::Duration;

/// Shared connection-pooled client for upstream BBB and player calls.
pub struct HttpClient(pub reqwest::Client);

/// Build the gateway. The poller is attached as a liftoff fairing and
/// disabled when `poll_interval` is 0 (tests, CLI-only deployments).
pub fn rocket(config: Config) -> rocket::Rocket<rocket::Build> {
    let db = Db::open(&config.database.path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create HTTP client");

    let db_path = config.database.path.clone();
    let poller_config = config.clone();

    rocket::build()
        .manage(db)
        .manage(HttpClient(client))
        .manage(config)
        .register(
            "/",
            rocket::catchers![routes::unknown_endpoint, routes::server_error],
        )
        .mount(
            "/bigbluebutton/api",
            rocket::routes![
                routes::api_index,
                routes::create,
                routes::join,
                routes::is_meeting_running,
                routes::end,
                routes::get_meeting_info,
                routes::get_meetings,
                routes::get_recordings,
                routes::publish_recordings,
                routes::update_recordings,
                routes::delete_recordings,
                routes::move_meeting,
                routes::get_statistics,
                routes::rejoin,
            ],
        )
        .mount("/monitoring", rocket::routes![routes::get_servers])
        .attach(rocket::fairing::AdHoc::on_liftoff("Health Poller", move |_rocket| {
            Box::pin(async move {
                if poller_config.poll_interval == 0 {
                    println!("🩺 Health poller disabled (poll_interval = 0)");
                    return;
                }
                poller::spawn_poller(db_path, poller_config);
                println!("🩺 Health poller started");
            })
        }))
}
