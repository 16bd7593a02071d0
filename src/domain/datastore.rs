use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::config::{INITIAL_CLASSROOMS, INITIAL_LABS};
use crate::error::{Error, Result};

/// The closed set of metric kinds the analysis tooling filters by.
pub mod metric_kind {
    pub const SOL_PROP: &str = "sol->prop";
    pub const PROP_RES: &str = "prop->res";
    pub const SOL_PROP_ROUNDTRIP: &str = "sol_prop_roundtrip";
    pub const ACK_RES_ROUNDTRIP: &str = "ack_res_roundtrip";
    pub const FACULTY_PROCESSING_TOTAL_MS: &str = "faculty_processing_total_ms";
    pub const PROGRAM_RESPONSE_TOTAL_MS: &str = "response_time_program_faculty_total_ms";
    pub const REQUEST_OUTCOME: &str = "request_outcome";
}

/// `request_outcome` metric values, as the analysis pipeline expects them.
pub const OUTCOME_SUCCESS: f64 = 1.0;
pub const OUTCOME_FAILURE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    Class,
    Lab,
}

impl RoomType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            RoomType::Class => "CLASS",
            RoomType::Lab => "LAB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Free,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Failed,
}

impl ReservationStatus {
    fn from_sql(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "FAILED" => Some(ReservationStatus::Failed),
            _ => None,
        }
    }
}

/// One room row, as the read-side helpers report it.
#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: i64,
    pub room_type: RoomType,
    pub adapted: bool,
    pub status: RoomStatus,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS room (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    type     TEXT    NOT NULL CHECK (type IN ('CLASS','LAB')),
    adapted  INTEGER NOT NULL DEFAULT 0,
    status   TEXT    NOT NULL DEFAULT 'FREE' CHECK (status IN ('FREE','BUSY')),
    semester TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS faculty (
    id       INTEGER PRIMARY KEY,
    name     TEXT    NOT NULL,
    semester TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS program (
    id         INTEGER PRIMARY KEY,
    faculty_id INTEGER NOT NULL REFERENCES faculty(id),
    name       TEXT    NOT NULL,
    semester   TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS reservation (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    faculty_id INTEGER NOT NULL REFERENCES faculty(id),
    program_id INTEGER NOT NULL REFERENCES program(id),
    ts_req     INTEGER NOT NULL,
    ts_ack     INTEGER,
    status     TEXT    NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING','CONFIRMED','FAILED'))
);
CREATE TABLE IF NOT EXISTS reservation_room (
    reservation_id INTEGER NOT NULL REFERENCES reservation(id),
    room_id        INTEGER NOT NULL REFERENCES room(id),
    PRIMARY KEY (reservation_id, room_id)
);
CREATE TABLE IF NOT EXISTS server (
    host    TEXT PRIMARY KEY,
    role    TEXT    NOT NULL,
    last_hb INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS metric (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    kind  TEXT    NOT NULL,
    value REAL    NOT NULL,
    ts    INTEGER NOT NULL,
    src   TEXT    NOT NULL,
    dst   TEXT    NOT NULL
);
";

/// Single-writer SQLite store shared by the broker replicas and the
/// faculty gateways. One connection per process behind one lock; every
/// multi-statement mutation runs as an IMMEDIATE transaction under it.
#[derive(Clone)]
pub struct Datastore {
    conn: Arc<Mutex<Connection>>,
    semester: String,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Datastore {
    /// Opens (creating if needed) the store at `path` and bootstraps the
    /// schema. The store may live on a shared mount, so the journal stays
    /// in DELETE mode; WAL is unsafe there.
    pub fn open(path: impl AsRef<Path>, semester: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=DELETE", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Gateways write metrics into the same file the broker owns;
        // wait out their short transactions instead of failing BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), semester: semester.to_string() })
    }

    pub fn semester(&self) -> &str {
        &self.semester
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("Datastore lock poisoned")
    }

    /// Inserts the initial inventory only if the room table is empty.
    pub fn seed_inventory(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM room", [], |row| row.get(0))?;
        if existing == 0 {
            let mut stmt = tx.prepare("INSERT INTO room(type, adapted, status, semester) VALUES(?1, 0, 'FREE', ?2)")?;
            for _ in 0..INITIAL_CLASSROOMS {
                stmt.execute(params![RoomType::Class.as_sql(), self.semester])?;
            }
            for _ in 0..INITIAL_LABS {
                stmt.execute(params![RoomType::Lab.as_sql(), self.semester])?;
            }
            drop(stmt);
        }

        tx.commit()?;
        Ok(())
    }

    /// Current FREE room counts.
    ///
    /// # Returns
    /// Returns (classrooms free, labs free).
    pub fn free_counts(&self) -> Result<(u32, u32)> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM room WHERE status='FREE' GROUP BY type")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;

        let (mut cls, mut lab) = (0, 0);
        for row in rows {
            let (room_type, count) = row?;
            match room_type.as_str() {
                "CLASS" => cls = count,
                "LAB" => lab = count,
                _ => {}
            }
        }
        Ok((cls, lab))
    }

    /// Atomically reserves `n_class` classrooms and `n_lab` labs for the
    /// given program, creating a PENDING reservation.
    ///
    /// If fewer than `n_lab` labs are free, the shortfall is covered by
    /// further free classrooms marked `adapted=1` (mobile labs). Fails
    /// with `ShortageClass`/`ShortageLab` when the plan cannot be
    /// satisfied; the transaction rolls back and no row changes.
    ///
    /// # Returns
    /// Returns the new reservation id.
    pub fn allocate_rooms(&self, n_class: u32, n_lab: u32, faculty_id: i64, program_id: i64) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // 1. Classrooms.
        let class_rows = pick_free_classrooms(&tx, n_class, 0)?;
        if (class_rows.len() as u32) < n_class {
            return Err(Error::ShortageClass);
        }

        // 2. Labs, or classrooms adapted as mobile labs.
        let mut lab_rows: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM room WHERE type='LAB' AND status='FREE' ORDER BY id LIMIT ?1")?;
            let rows = stmt.query_map(params![n_lab], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let deficit = n_lab - lab_rows.len() as u32;
        if deficit > 0 {
            // The OFFSET skips the rows step 1 already claimed; both
            // queries order by id inside the same transaction.
            let adapt_rows = pick_free_classrooms(&tx, deficit, n_class)?;
            if (adapt_rows.len() as u32) < deficit {
                return Err(Error::ShortageLab);
            }
            let mut stmt = tx.prepare("UPDATE room SET adapted=1 WHERE id=?1")?;
            for room_id in &adapt_rows {
                stmt.execute(params![room_id])?;
            }
            drop(stmt);
            lab_rows.extend(adapt_rows);
        }

        // 3. The reservation itself.
        tx.execute(
            "INSERT INTO reservation(faculty_id, program_id, ts_req, status) VALUES(?1, ?2, ?3, 'PENDING')",
            params![faculty_id, program_id, now_epoch()],
        )?;
        let reservation_id = tx.last_insert_rowid();

        // 4. Link the rooms and take them.
        {
            let mut link = tx.prepare("INSERT INTO reservation_room(reservation_id, room_id) VALUES(?1, ?2)")?;
            let mut busy = tx.prepare("UPDATE room SET status='BUSY' WHERE id=?1")?;
            for room_id in class_rows.iter().chain(lab_rows.iter()) {
                link.execute(params![reservation_id, room_id])?;
                busy.execute(params![room_id])?;
            }
        }

        tx.commit()?;
        Ok(reservation_id)
    }

    pub fn confirm_reservation(&self, reservation_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("UPDATE reservation SET status='CONFIRMED', ts_ack=?1 WHERE id=?2", params![now_epoch(), reservation_id])?;
        Ok(())
    }

    /// Releases every room of the reservation and marks it FAILED. A room
    /// that was adapted as a mobile lab reverts to a plain classroom.
    pub fn fail_reservation(&self, reservation_id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let room_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT room_id FROM reservation_room WHERE reservation_id=?1")?;
            let rows = stmt.query_map(params![reservation_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        {
            let mut stmt = tx.prepare("UPDATE room SET status='FREE', adapted=0 WHERE id=?1")?;
            for room_id in &room_ids {
                stmt.execute(params![room_id])?;
            }
        }
        tx.execute("UPDATE reservation SET status='FAILED', ts_ack=?1 WHERE id=?2", params![now_epoch(), reservation_id])?;

        tx.commit()?;
        Ok(())
    }

    pub fn ensure_faculty(&self, faculty_id: i64, name: &str, semester: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO faculty(id, name, semester) VALUES(?1, ?2, ?3) ON CONFLICT(id) DO NOTHING",
            params![faculty_id, name, semester],
        )?;
        Ok(())
    }

    pub fn ensure_program(&self, program_id: i64, faculty_id: i64, name: &str, semester: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO program(id, faculty_id, name, semester) VALUES(?1, ?2, ?3, ?4) ON CONFLICT(id) DO NOTHING",
            params![program_id, faculty_id, name, semester],
        )?;
        Ok(())
    }

    pub fn record_metric(&self, kind: &str, value: f64, src: &str, dst: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO metric(kind, value, ts, src, dst) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![kind, value, now_epoch(), src, dst],
        )?;
        Ok(())
    }

    /// Records the milliseconds elapsed since `started` under `kind`.
    pub fn record_elapsed(&self, kind: &str, started: Instant, src: &str, dst: &str) -> Result<()> {
        self.record_metric(kind, started.elapsed().as_secs_f64() * 1e3, src, dst)
    }

    /// Upserts this replica's row in the server registry.
    pub fn register_server_role(&self, host: &str, role: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO server(host, role, last_hb) VALUES(?1, ?2, ?3)
             ON CONFLICT(host) DO UPDATE SET role=excluded.role, last_hb=excluded.last_hb",
            params![host, role, now_epoch()],
        )?;
        Ok(())
    }

    // ------------------------
    // --- Read-side helpers ---
    // ------------------------

    pub fn reservation_status(&self, reservation_id: i64) -> Result<Option<ReservationStatus>> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row("SELECT status FROM reservation WHERE id=?1", params![reservation_id], |row| row.get(0))
            .optional()?;
        Ok(status.as_deref().and_then(ReservationStatus::from_sql))
    }

    /// Rooms linked to a reservation, in link order.
    pub fn rooms_of(&self, reservation_id: i64) -> Result<Vec<RoomRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.type, r.adapted, r.status FROM room r
             JOIN reservation_room rr ON rr.room_id = r.id
             WHERE rr.reservation_id=?1 ORDER BY r.id",
        )?;
        let rows = stmt.query_map(params![reservation_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?, row.get::<_, String>(3)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, room_type, adapted, status) = row?;
            out.push(RoomRow {
                id,
                room_type: if room_type == "LAB" { RoomType::Lab } else { RoomType::Class },
                adapted: adapted != 0,
                status: if status == "BUSY" { RoomStatus::Busy } else { RoomStatus::Free },
            });
        }
        Ok(out)
    }

    pub fn busy_room_count(&self) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM room WHERE status='BUSY'", [], |row| row.get(0))?)
    }

    pub fn adapted_room_count(&self) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM room WHERE adapted=1", [], |row| row.get(0))?)
    }

    /// Rooms linked to live (PENDING or CONFIRMED) reservations. Matches
    /// `busy_room_count` whenever the store is consistent.
    pub fn live_linked_room_count(&self) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM reservation_room rr
             JOIN reservation r ON r.id = rr.reservation_id
             WHERE r.status IN ('PENDING','CONFIRMED')",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn faculty_count(&self) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM faculty", [], |row| row.get(0))?)
    }

    pub fn metric_count(&self, kind: &str) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM metric WHERE kind=?1", params![kind], |row| row.get(0))?)
    }

    /// Streams every metric row as CSV for the external analysis
    /// pipeline.
    ///
    /// # Returns
    /// Returns the number of exported rows.
    pub fn export_metrics_csv<W: io::Write>(&self, out: W) -> Result<u64> {
        let conn = self.lock();
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(["kind", "value", "ts", "src", "dst"])?;

        let mut stmt = conn.prepare("SELECT kind, value, ts, src, dst FROM metric ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut exported = 0;
        for row in rows {
            let (kind, value, ts, src, dst) = row?;
            let value = value.to_string();
            let ts = ts.to_string();
            writer.write_record([kind.as_str(), value.as_str(), ts.as_str(), src.as_str(), dst.as_str()])?;
            exported += 1;
        }
        writer.flush()?;
        Ok(exported)
    }
}

/// Free, unadapted classrooms ordered by id. The offset lets one
/// transaction take disjoint batches without re-reading its own picks.
fn pick_free_classrooms(tx: &Transaction<'_>, limit: u32, offset: u32) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare("SELECT id FROM room WHERE type='CLASS' AND status='FREE' AND adapted=0 ORDER BY id LIMIT ?1 OFFSET ?2")?;
    let rows = stmt.query_map(params![limit, offset], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}
