use crate::models::{Meeting, REACHABLE_MAX, Server, ServerState, TEMP_INTERNAL_ID, UNREACHABLE_MAX};
use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::{Mutex, MutexGuard};

/// The registry: servers and meetings in a single SQLite file. All mutations
/// are single-row updates; the mutex guard is never held across an await.
pub struct Db {
    conn: Mutex<Connection>,
}

/// What the poller should do after a reachability write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityAction {
    None,
    /// The server crossed the unreachable threshold while ENABLED;
    /// panic migration must be started (asynchronously, outside the lock).
    TriggerPanic,
}

impl Db {
    pub fn open(path: &str) -> Db {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL UNIQUE,
                url TEXT NOT NULL DEFAULT '',
                secret TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'ENABLED',
                reachable INTEGER NOT NULL DEFAULT 0,
                unreachable INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS meetings (
                id INTEGER PRIMARY KEY,
                meeting_id TEXT NOT NULL DEFAULT '',
                internal_id TEXT NOT NULL DEFAULT '',
                server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                ended INTEGER NOT NULL DEFAULT 0,
                load INTEGER NOT NULL DEFAULT 1,
                create_query TEXT NOT NULL DEFAULT '{}',
                created TEXT NOT NULL,
                moved_to INTEGER REFERENCES meetings(id)
            );

            CREATE INDEX IF NOT EXISTS idx_meetings_lookup ON meetings(meeting_id, ended);
            CREATE INDEX IF NOT EXISTS idx_meetings_internal ON meetings(internal_id);
            CREATE INDEX IF NOT EXISTS idx_meetings_server ON meetings(server_id);

            -- One running row per public meeting id: concurrent creates race
            -- on this index and exactly one TEMP insert wins
            CREATE UNIQUE INDEX IF NOT EXISTS idx_meetings_running
                ON meetings(meeting_id) WHERE ended = 0;",
        )
        .expect("Failed to run migrations");
    }

    // --- Servers ---

    pub fn create_server(&self, server_id: i64, url: &str, secret: &str) -> rusqlite::Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO servers (server_id, url, secret) VALUES (?1, ?2, ?3)",
            params![server_id, url, secret],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lookup by the operator-assigned external id.
    pub fn get_server(&self, server_id: i64) -> Option<Server> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVER_COLS} FROM servers WHERE server_id = ?1"),
                params![server_id],
                map_server,
            )
            .optional()
            .unwrap_or(None)
    }

    pub fn get_server_by_row_id(&self, id: i64) -> Option<Server> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVER_COLS} FROM servers WHERE id = ?1"),
                params![id],
                map_server,
            )
            .optional()
            .unwrap_or(None)
    }

    pub fn list_servers(&self) -> Vec<Server> {
        let conn = self.conn();
        let mut stmt = match conn.prepare(&format!(
            "SELECT {SERVER_COLS} FROM servers ORDER BY server_id"
        )) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        match stmt.query_map([], map_server) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn set_server_state(&self, id: i64, state: ServerState) {
        self.conn()
            .execute(
                "UPDATE servers SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id],
            )
            .ok();
    }

    pub fn update_server(&self, id: i64, url: Option<&str>, secret: Option<&str>) {
        let conn = self.conn();
        if let Some(url) = url {
            conn.execute("UPDATE servers SET url = ?1 WHERE id = ?2", params![url, id])
                .ok();
        }
        if let Some(secret) = secret {
            conn.execute(
                "UPDATE servers SET secret = ?1 WHERE id = ?2",
                params![secret, id],
            )
            .ok();
        }
    }

    /// Removes the server and, via cascade, every meeting placed on it.
    pub fn delete_server(&self, id: i64) {
        self.conn()
            .execute("DELETE FROM servers WHERE id = ?1", params![id])
            .ok();
    }

    /// (enabled, disabled, panic, total)
    pub fn count_servers_by_state(&self) -> (i64, i64, i64, i64) {
        let conn = self.conn();
        let count = |state: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM servers WHERE state = ?1",
                params![state],
                |r| r.get(0),
            )
            .unwrap_or(0)
        };
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM servers", [], |r| r.get(0))
            .unwrap_or(0);
        (count("ENABLED"), count("DISABLED"), count("PANIC"), total)
    }

    /// Every ENABLED server with `reachable > 0`, paired with the summed
    /// load of its running meetings (no meetings → 0).
    pub fn list_servers_with_load(&self) -> Vec<(Server, i64)> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SERVER_COLS},
                    COALESCE((SELECT SUM(m.load) FROM meetings m
                              WHERE m.server_id = s.id AND m.ended = 0), 0) AS load
             FROM servers s
             WHERE s.state = 'ENABLED' AND s.reachable > 0
             ORDER BY load",
            SERVER_COLS = SERVER_COLS_QUALIFIED
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        match stmt.query_map([], |row| Ok((map_server(row)?, row.get::<_, i64>(7)?))) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Apply the reachability hysteresis for one poll result in a single
    /// read-modify-write. State changes trigger on exact threshold equality
    /// so repeated failures stay idempotent.
    pub fn set_server_reachability(&self, server_id: i64, online: bool) -> ReachabilityAction {
        let conn = self.conn();
        let server = conn
            .query_row(
                &format!("SELECT {SERVER_COLS} FROM servers WHERE server_id = ?1"),
                params![server_id],
                map_server,
            )
            .optional()
            .unwrap_or(None);
        let Some(mut server) = server else {
            return ReachabilityAction::None;
        };

        let mut action = ReachabilityAction::None;
        if !online {
            server.reachable = 0;
            if server.unreachable < UNREACHABLE_MAX {
                server.unreachable += 1;
            }
            if server.state == ServerState::Enabled && server.unreachable == UNREACHABLE_MAX {
                // Panicking needs upstream calls; the caller runs it outside the lock
                action = ReachabilityAction::TriggerPanic;
            }
        } else {
            server.unreachable = 0;
            if server.reachable < REACHABLE_MAX {
                server.reachable += 1;
            }
            if server.state == ServerState::Panic && server.reachable == REACHABLE_MAX {
                server.state = ServerState::Enabled;
            }
        }

        conn.execute(
            "UPDATE servers SET state = ?1, reachable = ?2, unreachable = ?3 WHERE id = ?4",
            params![
                server.state.as_str(),
                server.reachable,
                server.unreachable,
                server.id
            ],
        )
        .ok();
        action
    }

    // --- Meetings ---

    /// Insert a meeting row and return its surrogate id. Fails with a UNIQUE
    /// violation when a running row with this `meeting_id` already exists.
    pub fn create_meeting(
        &self,
        meeting_id: &str,
        internal_id: &str,
        server_row_id: i64,
        load: i64,
        create_query: &IndexMap<String, String>,
    ) -> rusqlite::Result<i64> {
        let conn = self.conn();
        let created = chrono::Utc::now().to_rfc3339();
        let query_json = serde_json::to_string(create_query).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO meetings (meeting_id, internal_id, server_id, ended, load, create_query, created)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
            params![meeting_id, internal_id, server_row_id, load, query_json, created],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The at-most-one running row for a public meeting id.
    pub fn get_running_meeting(&self, meeting_id: &str) -> Option<Meeting> {
        self.conn()
            .query_row(
                &format!("SELECT {MEETING_COLS} FROM meetings WHERE meeting_id = ?1 AND ended = 0"),
                params![meeting_id],
                map_meeting,
            )
            .optional()
            .unwrap_or(None)
    }

    pub fn get_meeting_by_id(&self, id: i64) -> Option<Meeting> {
        self.conn()
            .query_row(
                &format!("SELECT {MEETING_COLS} FROM meetings WHERE id = ?1"),
                params![id],
                map_meeting,
            )
            .optional()
            .unwrap_or(None)
    }

    /// Newest meeting carrying this BBB-internal id (recordings outlive the
    /// meeting rows, so ended rows count too).
    pub fn get_meeting_by_internal(&self, internal_id: &str) -> Option<Meeting> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MEETING_COLS} FROM meetings WHERE internal_id = ?1
                     ORDER BY id DESC LIMIT 1"
                ),
                params![internal_id],
                map_meeting,
            )
            .optional()
            .unwrap_or(None)
    }

    /// Every meeting row (running or ended) for a public meeting id.
    pub fn list_meetings_by_meeting_id(&self, meeting_id: &str) -> Vec<Meeting> {
        let conn = self.conn();
        let mut stmt = match conn.prepare(&format!(
            "SELECT {MEETING_COLS} FROM meetings WHERE meeting_id = ?1 ORDER BY id"
        )) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        match stmt.query_map(params![meeting_id], map_meeting) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn list_running_meetings_on(&self, server_row_id: i64) -> Vec<Meeting> {
        let conn = self.conn();
        let mut stmt = match conn.prepare(&format!(
            "SELECT {MEETING_COLS} FROM meetings WHERE server_id = ?1 AND ended = 0 ORDER BY id"
        )) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        match stmt.query_map(params![server_row_id], map_meeting) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Meetings the poller should probe: running, past the create grace
    /// period, and not a TEMP placeholder.
    pub fn list_candidate_meetings_for_poll(&self) -> Vec<Meeting> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
        let conn = self.conn();
        let mut stmt = match conn.prepare(&format!(
            "SELECT {MEETING_COLS} FROM meetings
             WHERE ended = 0 AND internal_id != ?1 AND created <= ?2
             ORDER BY id"
        )) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        match stmt.query_map(params![TEMP_INTERNAL_ID, cutoff], map_meeting) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn set_meeting_ended(&self, id: i64) {
        self.conn()
            .execute("UPDATE meetings SET ended = 1 WHERE id = ?1", params![id])
            .ok();
    }

    pub fn set_meeting_internal_id(&self, id: i64, internal_id: &str) {
        self.conn()
            .execute(
                "UPDATE meetings SET internal_id = ?1 WHERE id = ?2",
                params![internal_id, id],
            )
            .ok();
    }

    pub fn set_meeting_moved_to(&self, id: i64, target: i64) {
        self.conn()
            .execute(
                "UPDATE meetings SET moved_to = ?1 WHERE id = ?2",
                params![target, id],
            )
            .ok();
    }

    /// Rollback of a failed create, before `internal_id` is known. The only
    /// meeting deletion in the system.
    pub fn delete_meeting(&self, id: i64) {
        self.conn()
            .execute("DELETE FROM meetings WHERE id = ?1", params![id])
            .ok();
    }
}

const SERVER_COLS: &str = "id, server_id, url, secret, state, reachable, unreachable";
const SERVER_COLS_QUALIFIED: &str =
    "s.id, s.server_id, s.url, s.secret, s.state, s.reachable, s.unreachable";
const MEETING_COLS: &str =
    "id, meeting_id, internal_id, server_id, ended, load, create_query, created, moved_to";

fn map_server(row: &Row) -> rusqlite::Result<Server> {
    let state: String = row.get(4)?;
    Ok(Server {
        id: row.get(0)?,
        server_id: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        state: ServerState::parse(&state).unwrap_or(ServerState::Disabled),
        reachable: row.get(5)?,
        unreachable: row.get(6)?,
    })
}

fn map_meeting(row: &Row) -> rusqlite::Result<Meeting> {
    let ended: i64 = row.get(4)?;
    let query_json: String = row.get(6)?;
    Ok(Meeting {
        id: row.get(0)?,
        meeting_id: row.get(1)?,
        internal_id: row.get(2)?,
        server_id: row.get(3)?,
        ended: ended != 0,
        load: row.get(5)?,
        create_query: serde_json::from_str(&query_json).unwrap_or_default(),
        created: row.get(7)?,
        moved_to: row.get(8)?,
    })
}
