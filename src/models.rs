use indexmap::IndexMap;

/// Sentinel written into `internal_id` while a create call is in flight.
pub const TEMP_INTERNAL_ID: &str = "**TEMP**";

/// Counter ceiling for consecutive successful polls (PANIC → ENABLED).
pub const REACHABLE_MAX: i64 = 20;
/// Counter ceiling for consecutive failed polls (ENABLED → PANIC).
pub const UNREACHABLE_MAX: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Enabled,
    Disabled,
    Panic,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Enabled => "ENABLED",
            ServerState::Disabled => "DISABLED",
            ServerState::Panic => "PANIC",
        }
    }

    pub fn parse(s: &str) -> Option<ServerState> {
        match s {
            "ENABLED" => Some(ServerState::Enabled),
            "DISABLED" => Some(ServerState::Disabled),
            "PANIC" => Some(ServerState::Panic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One BBB backend in the fleet.
#[derive(Debug, Clone)]
pub struct Server {
    /// Surrogate row id (meetings reference this).
    pub id: i64,
    /// Operator-assigned external id, unique across the fleet.
    pub server_id: i64,
    /// Raw url as entered; normalized at client-construction time.
    pub url: String,
    pub secret: String,
    pub state: ServerState,
    /// Consecutive successful polls, clamped to 0..=20.
    pub reachable: i64,
    /// Consecutive failed polls, clamped to 0..=2.
    pub unreachable: i64,
}

/// One meeting placed on a server. At most one row per `meeting_id` is
/// running (`ended = false`) at any instant.
#[derive(Debug, Clone)]
pub struct Meeting {
    /// Surrogate row id, exposed only in rejoin URLs.
    pub id: i64,
    /// The externally visible meeting id supplied by clients.
    pub meeting_id: String,
    /// BBB's own id, or `**TEMP**` while the create call is in flight.
    pub internal_id: String,
    /// Row id of the owning server.
    pub server_id: i64,
    pub ended: bool,
    /// Weight contributed to the server's total load while running.
    pub load: i64,
    /// Original create parameters in request order, kept for replays.
    pub create_query: IndexMap<String, String>,
    /// RFC 3339 UTC creation time.
    pub created: String,
    /// Forward pointer set by move/panic migration.
    pub moved_to: Option<i64>,
}

impl Meeting {
    pub fn is_temp(&self) -> bool {
        self.internal_id == TEMP_INTERNAL_ID
    }
}
