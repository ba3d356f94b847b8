//! SQLite-backed StrandStore.
//!
//! Lease acquisition is a single conditional UPDATE; commits run in one
//! transaction and re-check the fencing token inside it, so concurrent
//! processes sharing the database file stay mutually exclusive.

#![cfg(feature = "sqlite-persistence")]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::kernel::error::KernelError;
use crate::kernel::frame::Frame;
use crate::kernel::identity::StrandId;
use crate::kernel::store::{
    apply_parent_update, apply_update, check_fence, clear_lease, wake_for_signal, StrandCommit,
    StrandStore,
};
use crate::kernel::strand::{LeaseToken, NewStrand, Strand};

const STRAND_COLUMNS: &str = "id, parent_id, prog, label, stack_json, schedule_ms, lease_ms, \
     lease_owner, lease_version, signal_version, exitval_json, fault, try_count, created_at_ms";

#[derive(Clone)]
pub struct SqliteStrandStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStrandStore {
    pub fn open(db_path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(db_path)
            .map_err(|e| KernelError::Store(format!("open sqlite strand store: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, KernelError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| KernelError::Store(format!("open in-memory sqlite: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::Store("sqlite strand store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), KernelError> {
        let conn = self.lock()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| KernelError::Store(format!("set sqlite busy timeout: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS strands (
              id TEXT PRIMARY KEY,
              parent_id TEXT NULL,
              prog TEXT NOT NULL,
              label TEXT NOT NULL,
              stack_json TEXT NOT NULL,
              schedule_ms INTEGER NOT NULL,
              lease_ms INTEGER NULL,
              lease_owner TEXT NULL,
              lease_version INTEGER NOT NULL DEFAULT 0,
              signal_version INTEGER NOT NULL DEFAULT 0,
              exitval_json TEXT NULL,
              fault TEXT NULL,
              try_count INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS semaphores (
              strand_id TEXT NOT NULL,
              name TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (strand_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_strands_schedule ON strands(schedule_ms);
            CREATE INDEX IF NOT EXISTS idx_strands_parent ON strands(parent_id);
            "#,
        )
        .map_err(|e| KernelError::Store(format!("init sqlite strand schema: {}", e)))?;
        Ok(())
    }
}

impl StrandStore for SqliteStrandStore {
    fn create(&self, strand: NewStrand, now: DateTime<Utc>) -> Result<Strand, KernelError> {
        let conn = self.lock()?;
        if read_strand(&conn, strand.id)?.is_some() {
            return Err(KernelError::StrandExists(strand.id));
        }
        let strand = Strand::from_new(strand, now);
        insert_strand(&conn, &strand)?;
        Ok(strand)
    }

    fn load(&self, id: StrandId) -> Result<Option<Strand>, KernelError> {
        let conn = self.lock()?;
        read_strand(&conn, id)
    }

    fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &HashSet<StrandId>,
    ) -> Result<Vec<Strand>, KernelError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {STRAND_COLUMNS} FROM strands
             WHERE exitval_json IS NULL AND fault IS NULL AND schedule_ms <= ?1
               AND (lease_ms IS NULL OR lease_ms <= ?1)
             ORDER BY schedule_ms ASC, created_at_ms ASC
             LIMIT ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KernelError::Store(format!("prepare list runnable: {}", e)))?;
        let rows = stmt
            .query_map(
                params![dt_to_ms(now), (limit + skip.len()) as i64],
                StrandRow::from_row,
            )
            .map_err(|e| KernelError::Store(format!("query list runnable: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let strand = row.map_err(map_rusqlite_err)?.into_strand()?;
            if !skip.contains(&strand.id) {
                out.push(strand);
            }
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    fn try_lease(
        &self,
        id: StrandId,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseToken>, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Store(format!("begin lease tx: {}", e)))?;
        let changed = tx
            .execute(
                "UPDATE strands
                 SET lease_ms = ?1, lease_owner = ?2, lease_version = lease_version + 1
                 WHERE id = ?3 AND exitval_json IS NULL AND fault IS NULL
                   AND schedule_ms <= ?4 AND (lease_ms IS NULL OR lease_ms <= ?4)",
                params![dt_to_ms(expires_at), owner, id.to_string(), dt_to_ms(now)],
            )
            .map_err(|e| KernelError::Store(format!("acquire lease: {}", e)))?;
        if changed == 0 {
            return Ok(None);
        }
        let (version, signal_version): (i64, i64) = tx
            .query_row(
                "SELECT lease_version, signal_version FROM strands WHERE id = ?1",
                params![id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(map_rusqlite_err)?;
        tx.commit()
            .map_err(|e| KernelError::Store(format!("commit lease tx: {}", e)))?;
        Ok(Some(LeaseToken {
            strand_id: id,
            owner: owner.to_string(),
            version: version as u64,
            expires_at,
            signal_version: signal_version as u64,
        }))
    }

    fn commit(
        &self,
        lease: &LeaseToken,
        commit: &StrandCommit,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Store(format!("begin step commit tx: {}", e)))?;
        let mut strand =
            read_strand(&tx, lease.strand_id)?.ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(&strand, lease)?;

        for name in &commit.semaphores_consumed {
            tx.execute(
                "DELETE FROM semaphores WHERE strand_id = ?1 AND name = ?2",
                params![lease.strand_id.to_string(), name],
            )
            .map_err(|e| KernelError::Store(format!("consume semaphore: {}", e)))?;
        }
        if apply_update(&mut strand, lease, commit, now) {
            update_strand(&tx, &strand)?;
            if strand.is_terminated() {
                delete_semaphores(&tx, strand.id)?;
            }
        } else {
            delete_strand(&tx, strand.id)?;
        }
        for new in &commit.created {
            if read_strand(&tx, new.id)?.is_some() {
                return Err(KernelError::StrandExists(new.id));
            }
            insert_strand(&tx, &Strand::from_new(new.clone(), now))?;
        }
        if let Some(update) = &commit.parent_update {
            if let Some(mut parent) = read_strand(&tx, update.parent_id)? {
                apply_parent_update(&mut parent, update, now)?;
                update_strand(&tx, &parent)?;
            }
        }
        for (target, name) in &commit.semaphores_set {
            set_semaphore_in(&tx, *target, name, now)?;
        }
        tx.commit()
            .map_err(|e| KernelError::Store(format!("commit step tx: {}", e)))?;
        Ok(())
    }

    fn release(
        &self,
        lease: &LeaseToken,
        try_count: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Store(format!("begin release tx: {}", e)))?;
        let mut strand =
            read_strand(&tx, lease.strand_id)?.ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(&strand, lease)?;
        clear_lease(&mut strand);
        strand.try_count = try_count;
        strand.schedule = retry_at;
        update_strand(&tx, &strand)?;
        tx.commit()
            .map_err(|e| KernelError::Store(format!("commit release tx: {}", e)))?;
        Ok(())
    }

    fn mark_failed(&self, lease: &LeaseToken, fault: &str) -> Result<(), KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Store(format!("begin mark failed tx: {}", e)))?;
        let mut strand =
            read_strand(&tx, lease.strand_id)?.ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(&strand, lease)?;
        clear_lease(&mut strand);
        strand.fault = Some(fault.to_string());
        update_strand(&tx, &strand)?;
        tx.commit()
            .map_err(|e| KernelError::Store(format!("commit mark failed tx: {}", e)))?;
        Ok(())
    }

    fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM strands WHERE parent_id = ?1 ORDER BY created_at_ms ASC")
            .map_err(|e| KernelError::Store(format!("prepare children: {}", e)))?;
        let rows = stmt
            .query_map(params![id.to_string()], |r| r.get::<_, String>(0))
            .map_err(|e| KernelError::Store(format!("query children: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(parse_id(&row.map_err(map_rusqlite_err)?)?);
        }
        Ok(out)
    }

    fn set_semaphore(
        &self,
        id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Store(format!("begin semaphore tx: {}", e)))?;
        if !set_semaphore_in(&tx, id, name, now)? {
            return Err(KernelError::StrandNotFound(id));
        }
        tx.commit()
            .map_err(|e| KernelError::Store(format!("commit semaphore tx: {}", e)))?;
        Ok(())
    }

    fn semaphores(&self, id: StrandId) -> Result<Vec<String>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT name FROM semaphores WHERE strand_id = ?1 ORDER BY name ASC")
            .map_err(|e| KernelError::Store(format!("prepare semaphores: {}", e)))?;
        let rows = stmt
            .query_map(params![id.to_string()], |r| r.get::<_, String>(0))
            .map_err(|e| KernelError::Store(format!("query semaphores: {}", e)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_rusqlite_err)
    }

    fn consume_semaphore(&self, id: StrandId, name: &str) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM semaphores WHERE strand_id = ?1 AND name = ?2",
                params![id.to_string(), name],
            )
            .map_err(|e| KernelError::Store(format!("consume semaphore: {}", e)))?;
        Ok(deleted == 1)
    }
}

struct StrandRow {
    id: String,
    parent_id: Option<String>,
    prog: String,
    label: String,
    stack_json: String,
    schedule_ms: i64,
    lease_ms: Option<i64>,
    lease_owner: Option<String>,
    lease_version: i64,
    signal_version: i64,
    exitval_json: Option<String>,
    fault: Option<String>,
    try_count: i64,
    created_at_ms: i64,
}

impl StrandRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            prog: row.get(2)?,
            label: row.get(3)?,
            stack_json: row.get(4)?,
            schedule_ms: row.get(5)?,
            lease_ms: row.get(6)?,
            lease_owner: row.get(7)?,
            lease_version: row.get(8)?,
            signal_version: row.get(9)?,
            exitval_json: row.get(10)?,
            fault: row.get(11)?,
            try_count: row.get(12)?,
            created_at_ms: row.get(13)?,
        })
    }

    fn into_strand(self) -> Result<Strand, KernelError> {
        let stack: Vec<Frame> = serde_json::from_str(&self.stack_json)
            .map_err(|e| KernelError::Store(format!("decode stack of {}: {}", self.id, e)))?;
        let exitval = self
            .exitval_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| KernelError::Store(format!("decode exitval of {}: {}", self.id, e)))?;
        Ok(Strand {
            id: parse_id(&self.id)?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            prog: self.prog,
            label: self.label,
            stack,
            schedule: ms_to_dt(self.schedule_ms)?,
            lease: self.lease_ms.map(ms_to_dt).transpose()?,
            lease_owner: self.lease_owner,
            lease_version: self.lease_version as u64,
            signal_version: self.signal_version as u64,
            exitval,
            fault: self.fault,
            try_count: self.try_count as u32,
            created_at: ms_to_dt(self.created_at_ms)?,
        })
    }
}

fn read_strand(conn: &Connection, id: StrandId) -> Result<Option<Strand>, KernelError> {
    let sql = format!("SELECT {STRAND_COLUMNS} FROM strands WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], StrandRow::from_row)
        .optional()
        .map_err(map_rusqlite_err)?
        .map(StrandRow::into_strand)
        .transpose()
}

fn encode_stack(strand: &Strand) -> Result<String, KernelError> {
    serde_json::to_string(&strand.stack)
        .map_err(|e| KernelError::Store(format!("encode stack of {}: {}", strand.id, e)))
}

fn encode_exitval(strand: &Strand) -> Result<Option<String>, KernelError> {
    strand
        .exitval
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| KernelError::Store(format!("encode exitval of {}: {}", strand.id, e)))
}

fn insert_strand(conn: &Connection, strand: &Strand) -> Result<(), KernelError> {
    let sql = format!(
        "INSERT INTO strands ({STRAND_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    );
    conn.execute(
        &sql,
        params![
            strand.id.to_string(),
            strand.parent_id.map(|p| p.to_string()),
            strand.prog,
            strand.label,
            encode_stack(strand)?,
            dt_to_ms(strand.schedule),
            strand.lease.map(dt_to_ms),
            strand.lease_owner,
            strand.lease_version as i64,
            strand.signal_version as i64,
            encode_exitval(strand)?,
            strand.fault,
            strand.try_count as i64,
            dt_to_ms(strand.created_at),
        ],
    )
    .map_err(|e| KernelError::Store(format!("insert strand {}: {}", strand.id, e)))?;
    Ok(())
}

fn update_strand(conn: &Connection, strand: &Strand) -> Result<(), KernelError> {
    conn.execute(
        "UPDATE strands SET prog = ?2, label = ?3, stack_json = ?4, schedule_ms = ?5,
           lease_ms = ?6, lease_owner = ?7, lease_version = ?8, signal_version = ?9,
           exitval_json = ?10, fault = ?11, try_count = ?12
         WHERE id = ?1",
        params![
            strand.id.to_string(),
            strand.prog,
            strand.label,
            encode_stack(strand)?,
            dt_to_ms(strand.schedule),
            strand.lease.map(dt_to_ms),
            strand.lease_owner,
            strand.lease_version as i64,
            strand.signal_version as i64,
            encode_exitval(strand)?,
            strand.fault,
            strand.try_count as i64,
        ],
    )
    .map_err(|e| KernelError::Store(format!("update strand {}: {}", strand.id, e)))?;
    Ok(())
}

fn delete_semaphores(conn: &Connection, id: StrandId) -> Result<(), KernelError> {
    conn.execute(
        "DELETE FROM semaphores WHERE strand_id = ?1",
        params![id.to_string()],
    )
    .map_err(|e| KernelError::Store(format!("delete semaphores of {}: {}", id, e)))?;
    Ok(())
}

fn delete_strand(conn: &Connection, id: StrandId) -> Result<(), KernelError> {
    conn.execute("DELETE FROM strands WHERE id = ?1", params![id.to_string()])
        .map_err(|e| KernelError::Store(format!("delete strand {}: {}", id, e)))?;
    delete_semaphores(conn, id)
}

/// Returns false when the target strand does not exist.
fn set_semaphore_in(
    conn: &Connection,
    id: StrandId,
    name: &str,
    now: DateTime<Utc>,
) -> Result<bool, KernelError> {
    let Some(mut strand) = read_strand(conn, id)? else {
        return Ok(false);
    };
    wake_for_signal(&mut strand, now);
    update_strand(conn, &strand)?;
    conn.execute(
        "INSERT OR IGNORE INTO semaphores (strand_id, name, created_at_ms) VALUES (?1, ?2, ?3)",
        params![id.to_string(), name, dt_to_ms(now)],
    )
    .map_err(|e| KernelError::Store(format!("set semaphore {} on {}: {}", name, id, e)))?;
    Ok(true)
}

fn parse_id(raw: &str) -> Result<StrandId, KernelError> {
    Uuid::parse_str(raw).map_err(|e| KernelError::Store(format!("bad strand id {}: {}", raw, e)))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// A timestamp chrono cannot represent means a corrupt row.
fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, KernelError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| KernelError::Store(format!("timestamp out of range: {ms}ms")))
}

fn map_rusqlite_err(err: rusqlite::Error) -> KernelError {
    KernelError::Store(format!("sqlite strand store: {}", err))
}
