use bbb_loadbalancer::config::Config;
use bbb_loadbalancer::db::Db;
use bbb_loadbalancer::models::ServerState;
use bbb_loadbalancer::panic;
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bbb-loadbalancer", about = "Load-balancing reverse proxy for BigBlueButton clusters")]
struct Cli {
    /// Path to the config file (default: LB_CONFIG or ./config.json)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway and the health poller
    Serve,
    /// Add a server
    Add {
        /// A unique id to identify the server in requests
        #[arg(long)]
        server_id: i64,
        /// The bigbluebutton server's url
        #[arg(long)]
        url: String,
        /// The bigbluebutton server's shared secret
        #[arg(long)]
        secret: String,
    },
    /// Remove a server
    Remove {
        /// The server's id
        #[arg(long)]
        server: i64,
    },
    /// Edit a server
    Edit {
        /// The server's id
        server: i64,
        /// The server's state: ENABLED, DISABLED or PANIC
        /// (only the first character is looked at; lower case works too)
        #[arg(long)]
        state: Option<String>,
        /// The new secret for the server
        #[arg(long)]
        secret: Option<String>,
        /// The new url for the server
        #[arg(long)]
        url: Option<String>,
    },
    /// List all servers
    List,
    /// Set a server to panic. No new meetings can be created on it and all
    /// its running meetings are moved to other servers.
    Panic {
        /// The server's id
        #[arg(long)]
        server: i64,
    },
    /// Disable a server, so no new meetings will be created on it
    Disable {
        /// The server's id
        #[arg(long)]
        server: i64,
    },
    /// Enable a server, so new meetings can be created on it
    Enable {
        /// The server's id
        #[arg(long)]
        server: i64,
    },
}

#[rocket::main]
async fn main() {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            if let Err(e) = bbb_loadbalancer::rocket(config).launch().await {
                eprintln!("Failed to launch: {e}");
                std::process::exit(1);
            }
        }
        command => run_command(command, config).await,
    }
}

async fn run_command(command: Command, config: Config) {
    let db = Db::open(&config.database.path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create HTTP client");

    match command {
        Command::Serve => unreachable!(),

        Command::Add {
            server_id,
            url,
            secret,
        } => {
            if db.get_server(server_id).is_some() {
                eprintln!("A server with this id exists already");
                std::process::exit(1);
            }
            if !valid_bbb_url(&url) {
                eprintln!("Please use the url as given by 'bbb-conf --secret'!");
                std::process::exit(1);
            }
            match db.create_server(server_id, &url, &secret) {
                Ok(_) => {
                    println!("Added #{server_id}: {url}");
                    println!(
                        "Make sure the poller's ssh key is installed for the user '{}' on the server",
                        config.ssh_user
                    );
                }
                Err(e) => {
                    eprintln!("Could not add the server: {e}");
                    std::process::exit(1);
                }
            }
        }

        Command::Remove { server } => {
            let Some(server) = db.get_server(server) else {
                eprintln!("Unknown server");
                std::process::exit(1);
            };
            db.delete_server(server.id);
            println!("Removed #{}: {}", server.server_id, server.url);
        }

        Command::Edit {
            server,
            state,
            secret,
            url,
        } => {
            let Some(row) = db.get_server(server) else {
                eprintln!("Unknown server");
                std::process::exit(1);
            };
            if let Some(state) = state {
                let Some(state) = parse_state(&state) else {
                    eprintln!("Invalid state argument");
                    std::process::exit(1);
                };
                panic::set_server_state(&db, &client, &config, &row, state).await;
            }
            db.update_server(row.id, url.as_deref(), secret.as_deref());
        }

        Command::List => {
            for server in db.list_servers() {
                println!("#{}: {}", server.server_id, server.url);
                println!("\tsecret: {}", server.secret);
                println!("\tstate: {}", server.state);
                println!(
                    "\t{}",
                    if server.reachable > 0 {
                        "REACHABLE"
                    } else {
                        "NOT REACHABLE"
                    }
                );
            }
        }

        Command::Panic { server } => set_state(&db, &client, &config, server, ServerState::Panic).await,
        Command::Disable { server } => {
            set_state(&db, &client, &config, server, ServerState::Disabled).await
        }
        Command::Enable { server } => {
            set_state(&db, &client, &config, server, ServerState::Enabled).await
        }
    }
}

async fn set_state(
    db: &Db,
    client: &reqwest::Client,
    config: &Config,
    server_id: i64,
    state: ServerState,
) {
    let Some(server) = db.get_server(server_id) else {
        eprintln!("Unknown server");
        std::process::exit(1);
    };
    panic::set_server_state(db, client, config, &server, state).await;
    println!("#{} is now {}", server.server_id, state);
}

/// Only the first character is looked at, like the original CLI.
fn parse_state(raw: &str) -> Option<ServerState> {
    match raw.chars().next()?.to_ascii_lowercase() {
        'e' => Some(ServerState::Enabled),
        'd' => Some(ServerState::Disabled),
        'p' => Some(ServerState::Panic),
        _ => None,
    }
}

/// The url as printed by `bbb-conf --secret`: scheme + host + /bigbluebutton.
fn valid_bbb_url(url: &str) -> bool {
    let rest = if let Some(rest) = url.strip_prefix("https://") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else {
        return false;
    };
    rest.contains("/bigbluebutton") && !rest.starts_with('/')
}
