//! SQLite-backed VnetStore.
//!
//! Lives next to the strand tables, usually in the same database file, so a
//! restarted process finds the rotation locks, phases and pending keys its
//! strands point at. [VnetStore::lock_nics], [VnetStore::finish_rekey] and
//! [VnetStore::delete_nic] each run in one transaction.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::VnetError;
use crate::model::{
    IpsecTunnel, KeyMaterial, Nic, NicId, NicState, NicTunnels, PrivateSubnet, RekeyPhase,
    SubnetId, SubnetState, VmPlacement,
};
use crate::store::VnetStore;

const SUBNET_COLUMNS: &str = "id, name, provider, state, last_rekey_at_ms";

const NIC_COLUMNS: &str = "id, subnet_id, name, private_ipv4, private_ipv6, vm_json, state, \
     active_key_json, pending_key_json, rekey_coordinator_id, rekey_phase";

#[derive(Clone)]
pub struct SqliteVnetStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVnetStore {
    pub fn open(db_path: &str) -> Result<Self, VnetError> {
        let conn = Connection::open(db_path)
            .map_err(|e| VnetError::Store(format!("open sqlite vnet store: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, VnetError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VnetError::Store(format!("open in-memory sqlite: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, VnetError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, VnetError> {
        self.conn
            .lock()
            .map_err(|_| VnetError::Store("sqlite vnet store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), VnetError> {
        let conn = self.lock()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| VnetError::Store(format!("set sqlite busy timeout: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vnet_subnets (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              provider TEXT NOT NULL,
              state TEXT NOT NULL,
              last_rekey_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vnet_edges (
              a TEXT NOT NULL,
              b TEXT NOT NULL,
              PRIMARY KEY (a, b)
            );
            CREATE TABLE IF NOT EXISTS vnet_nics (
              id TEXT PRIMARY KEY,
              subnet_id TEXT NOT NULL,
              name TEXT NOT NULL,
              private_ipv4 TEXT NOT NULL,
              private_ipv6 TEXT NOT NULL,
              vm_json TEXT NULL,
              state TEXT NOT NULL,
              active_key_json TEXT NULL,
              pending_key_json TEXT NULL,
              rekey_coordinator_id TEXT NULL,
              rekey_phase TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vnet_tunnels (
              src_nic_id TEXT NOT NULL,
              dst_nic_id TEXT NOT NULL,
              PRIMARY KEY (src_nic_id, dst_nic_id)
            );
            CREATE INDEX IF NOT EXISTS idx_vnet_nics_subnet ON vnet_nics(subnet_id);
            CREATE INDEX IF NOT EXISTS idx_vnet_nics_coordinator ON vnet_nics(rekey_coordinator_id);
            CREATE INDEX IF NOT EXISTS idx_vnet_tunnels_dst ON vnet_tunnels(dst_nic_id);
            "#,
        )
        .map_err(|e| VnetError::Store(format!("init sqlite vnet schema: {}", e)))?;
        Ok(())
    }

    /// Every NIC, ordered by id.
    pub fn all_nics(&self) -> Result<Vec<Nic>, VnetError> {
        let conn = self.lock()?;
        query_nics(&conn, "1 = 1 ORDER BY id ASC", params![])
    }

    pub fn tunnels(&self) -> Result<Vec<IpsecTunnel>, VnetError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT src_nic_id, dst_nic_id FROM vnet_tunnels ORDER BY src_nic_id, dst_nic_id")
            .map_err(|e| VnetError::Store(format!("prepare tunnels: {}", e)))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(|e| VnetError::Store(format!("query tunnels: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let (src, dst) = row.map_err(map_rusqlite_err)?;
            out.push(IpsecTunnel {
                src_nic_id: parse_id(&src)?,
                dst_nic_id: parse_id(&dst)?,
            });
        }
        Ok(out)
    }
}

impl VnetStore for SqliteVnetStore {
    fn create_subnet(&self, subnet: &PrivateSubnet) -> Result<(), VnetError> {
        let conn = self.lock()?;
        if read_subnet(&conn, subnet.id)?.is_some() {
            return Err(VnetError::Store(format!(
                "private subnet {} already exists",
                subnet.id
            )));
        }
        let sql = format!("INSERT INTO vnet_subnets ({SUBNET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)");
        conn.execute(
            &sql,
            params![
                subnet.id.to_string(),
                subnet.name,
                subnet.provider,
                encode_enum(&subnet.state)?,
                dt_to_ms(subnet.last_rekey_at),
            ],
        )
        .map_err(|e| VnetError::Store(format!("insert subnet {}: {}", subnet.id, e)))?;
        Ok(())
    }

    fn subnet(&self, id: SubnetId) -> Result<Option<PrivateSubnet>, VnetError> {
        let conn = self.lock()?;
        read_subnet(&conn, id)
    }

    fn set_subnet_state(&self, id: SubnetId, state: SubnetState) -> Result<(), VnetError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE vnet_subnets SET state = ?2 WHERE id = ?1",
                params![id.to_string(), encode_enum(&state)?],
            )
            .map_err(|e| VnetError::Store(format!("update subnet {}: {}", id, e)))?;
        if changed == 0 {
            return Err(VnetError::SubnetNotFound(id));
        }
        Ok(())
    }

    fn delete_subnet(&self, id: SubnetId) -> Result<(), VnetError> {
        let mut conn = self.lock()?;
        let tx = begin(&mut conn, "delete subnet")?;
        let nics: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM vnet_nics WHERE subnet_id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .map_err(map_rusqlite_err)?;
        if nics > 0 {
            return Err(VnetError::Store(format!(
                "private subnet {id} still has nics"
            )));
        }
        tx.execute("DELETE FROM vnet_subnets WHERE id = ?1", params![id.to_string()])
            .map_err(|e| VnetError::Store(format!("delete subnet {}: {}", id, e)))?;
        tx.execute(
            "DELETE FROM vnet_edges WHERE a = ?1 OR b = ?1",
            params![id.to_string()],
        )
        .map_err(|e| VnetError::Store(format!("delete edges of {}: {}", id, e)))?;
        commit(tx, "delete subnet")
    }

    fn connect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        let conn = self.lock()?;
        for id in [a, b] {
            if read_subnet(&conn, id)?.is_none() {
                return Err(VnetError::SubnetNotFound(id));
            }
        }
        if a == b {
            return Ok(());
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        conn.execute(
            "INSERT OR IGNORE INTO vnet_edges (a, b) VALUES (?1, ?2)",
            params![lo.to_string(), hi.to_string()],
        )
        .map_err(|e| VnetError::Store(format!("connect {} and {}: {}", a, b, e)))?;
        Ok(())
    }

    fn disconnect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM vnet_edges WHERE (a = ?1 AND b = ?2) OR (a = ?2 AND b = ?1)",
            params![a.to_string(), b.to_string()],
        )
        .map_err(|e| VnetError::Store(format!("disconnect {} and {}: {}", a, b, e)))?;
        Ok(())
    }

    fn connected(&self, id: SubnetId) -> Result<Vec<SubnetId>, VnetError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT b FROM vnet_edges WHERE a = ?1
                 UNION
                 SELECT a FROM vnet_edges WHERE b = ?1
                 ORDER BY 1 ASC",
            )
            .map_err(|e| VnetError::Store(format!("prepare connected: {}", e)))?;
        let rows = stmt
            .query_map(params![id.to_string()], |r| r.get::<_, String>(0))
            .map_err(|e| VnetError::Store(format!("query connected: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(parse_id(&row.map_err(map_rusqlite_err)?)?);
        }
        Ok(out)
    }

    fn create_nic(&self, nic: &Nic) -> Result<(), VnetError> {
        let conn = self.lock()?;
        if read_subnet(&conn, nic.subnet_id)?.is_none() {
            return Err(VnetError::SubnetNotFound(nic.subnet_id));
        }
        if read_nic(&conn, nic.id)?.is_some() {
            return Err(VnetError::Store(format!("nic {} already exists", nic.id)));
        }
        let sql = format!(
            "INSERT INTO vnet_nics ({NIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        );
        conn.execute(
            &sql,
            params![
                nic.id.to_string(),
                nic.subnet_id.to_string(),
                nic.name,
                nic.private_ipv4,
                nic.private_ipv6,
                encode_json(nic.vm.as_ref())?,
                encode_enum(&nic.state)?,
                encode_json(nic.active_key.as_ref())?,
                encode_json(nic.pending_key.as_ref())?,
                nic.rekey_coordinator_id.map(|id| id.to_string()),
                nic.rekey_phase.as_str(),
            ],
        )
        .map_err(|e| VnetError::Store(format!("insert nic {}: {}", nic.id, e)))?;
        Ok(())
    }

    fn nic(&self, id: NicId) -> Result<Option<Nic>, VnetError> {
        let conn = self.lock()?;
        read_nic(&conn, id)
    }

    fn nics_in(&self, subnet_id: SubnetId) -> Result<Vec<Nic>, VnetError> {
        let conn = self.lock()?;
        query_nics(
            &conn,
            "subnet_id = ?1 ORDER BY id ASC",
            params![subnet_id.to_string()],
        )
    }

    fn set_nic_state(&self, id: NicId, state: NicState) -> Result<(), VnetError> {
        update_nic_column(&*self.lock()?, id, "state", Some(encode_enum(&state)?))
    }

    fn attach_vm(&self, id: NicId, vm: VmPlacement) -> Result<(), VnetError> {
        update_nic_column(&*self.lock()?, id, "vm_json", encode_json(Some(&vm))?)
    }

    fn detach_vm(&self, id: NicId) -> Result<(), VnetError> {
        update_nic_column(&*self.lock()?, id, "vm_json", None)
    }

    fn delete_nic(&self, id: NicId) -> Result<Option<Nic>, VnetError> {
        let mut conn = self.lock()?;
        let tx = begin(&mut conn, "delete nic")?;
        let removed = read_nic(&tx, id)?;
        tx.execute("DELETE FROM vnet_nics WHERE id = ?1", params![id.to_string()])
            .map_err(|e| VnetError::Store(format!("delete nic {}: {}", id, e)))?;
        tx.execute(
            "DELETE FROM vnet_tunnels WHERE src_nic_id = ?1 OR dst_nic_id = ?1",
            params![id.to_string()],
        )
        .map_err(|e| VnetError::Store(format!("delete tunnels of {}: {}", id, e)))?;
        commit(tx, "delete nic")?;
        Ok(removed)
    }

    fn lock_nics(&self, ids: &[NicId], coordinator: SubnetId) -> Result<bool, VnetError> {
        let mut conn = self.lock()?;
        let tx = begin(&mut conn, "lock nics")?;
        for id in ids {
            let free = tx
                .query_row(
                    "SELECT rekey_coordinator_id IS NULL FROM vnet_nics WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get::<_, bool>(0),
                )
                .optional()
                .map_err(map_rusqlite_err)?;
            if free != Some(true) {
                return Ok(false);
            }
        }
        for id in ids {
            tx.execute(
                "UPDATE vnet_nics SET rekey_coordinator_id = ?2 WHERE id = ?1",
                params![id.to_string(), coordinator.to_string()],
            )
            .map_err(|e| VnetError::Store(format!("lock nic {}: {}", id, e)))?;
        }
        commit(tx, "lock nics")?;
        Ok(true)
    }

    fn nics_locked_by(&self, coordinator: SubnetId) -> Result<Vec<Nic>, VnetError> {
        let conn = self.lock()?;
        query_nics(
            &conn,
            "rekey_coordinator_id = ?1 ORDER BY id ASC",
            params![coordinator.to_string()],
        )
    }

    fn set_pending_key(&self, id: NicId, key: KeyMaterial) -> Result<(), VnetError> {
        update_nic_column(&*self.lock()?, id, "pending_key_json", encode_json(Some(&key))?)
    }

    fn set_rekey_phase(&self, id: NicId, phase: RekeyPhase) -> Result<(), VnetError> {
        update_nic_column(&*self.lock()?, id, "rekey_phase", Some(phase.as_str().to_string()))
    }

    fn finish_rekey(
        &self,
        coordinator: SubnetId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NicId>, VnetError> {
        let mut conn = self.lock()?;
        let tx = begin(&mut conn, "finish rekey")?;
        let locked = query_nics(
            &tx,
            "rekey_coordinator_id = ?1 ORDER BY id ASC",
            params![coordinator.to_string()],
        )?;
        tx.execute(
            "UPDATE vnet_nics
             SET active_key_json = COALESCE(pending_key_json, active_key_json),
                 pending_key_json = NULL, rekey_phase = ?2, rekey_coordinator_id = NULL
             WHERE rekey_coordinator_id = ?1",
            params![coordinator.to_string(), RekeyPhase::Idle.as_str()],
        )
        .map_err(|e| VnetError::Store(format!("release nics of {}: {}", coordinator, e)))?;

        let mut involved: Vec<SubnetId> = locked.iter().map(|nic| nic.subnet_id).collect();
        involved.push(coordinator);
        involved.sort();
        involved.dedup();
        for id in involved {
            tx.execute(
                "UPDATE vnet_subnets SET last_rekey_at_ms = ?2 WHERE id = ?1",
                params![id.to_string(), dt_to_ms(now)],
            )
            .map_err(|e| VnetError::Store(format!("stamp rekey of {}: {}", id, e)))?;
        }
        tx.execute(
            "UPDATE vnet_subnets SET state = ?2 WHERE id = ?1",
            params![coordinator.to_string(), encode_enum(&SubnetState::Waiting)?],
        )
        .map_err(|e| VnetError::Store(format!("reset subnet {}: {}", coordinator, e)))?;
        commit(tx, "finish rekey")?;
        Ok(locked.into_iter().map(|nic| nic.id).collect())
    }

    fn create_tunnels(&self, ids: &[NicId]) -> Result<usize, VnetError> {
        let mut conn = self.lock()?;
        let tx = begin(&mut conn, "create tunnels")?;
        let mut existing = Vec::new();
        for id in ids {
            if read_nic(&tx, *id)?.is_some() {
                existing.push(*id);
            }
        }
        let mut created = 0;
        for src in &existing {
            for dst in &existing {
                if src == dst {
                    continue;
                }
                created += tx
                    .execute(
                        "INSERT OR IGNORE INTO vnet_tunnels (src_nic_id, dst_nic_id) VALUES (?1, ?2)",
                        params![src.to_string(), dst.to_string()],
                    )
                    .map_err(|e| {
                        VnetError::Store(format!("create tunnel {} -> {}: {}", src, dst, e))
                    })?;
            }
        }
        commit(tx, "create tunnels")?;
        Ok(created)
    }

    fn nic_tunnels(&self, id: NicId) -> Result<NicTunnels, VnetError> {
        let conn = self.lock()?;
        let nic = read_nic(&conn, id)?.ok_or(VnetError::NicNotFound(id))?;
        let inbound = query_nics(
            &conn,
            "id IN (SELECT src_nic_id FROM vnet_tunnels WHERE dst_nic_id = ?1) ORDER BY id ASC",
            params![id.to_string()],
        )?;
        let outbound = query_nics(
            &conn,
            "id IN (SELECT dst_nic_id FROM vnet_tunnels WHERE src_nic_id = ?1) ORDER BY id ASC",
            params![id.to_string()],
        )?;
        Ok(NicTunnels {
            nic,
            inbound,
            outbound,
        })
    }
}

struct NicRow {
    id: String,
    subnet_id: String,
    name: String,
    private_ipv4: String,
    private_ipv6: String,
    vm_json: Option<String>,
    state: String,
    active_key_json: Option<String>,
    pending_key_json: Option<String>,
    rekey_coordinator_id: Option<String>,
    rekey_phase: String,
}

impl NicRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subnet_id: row.get(1)?,
            name: row.get(2)?,
            private_ipv4: row.get(3)?,
            private_ipv6: row.get(4)?,
            vm_json: row.get(5)?,
            state: row.get(6)?,
            active_key_json: row.get(7)?,
            pending_key_json: row.get(8)?,
            rekey_coordinator_id: row.get(9)?,
            rekey_phase: row.get(10)?,
        })
    }

    fn into_nic(self) -> Result<Nic, VnetError> {
        Ok(Nic {
            id: parse_id(&self.id)?,
            subnet_id: parse_id(&self.subnet_id)?,
            name: self.name,
            private_ipv4: self.private_ipv4,
            private_ipv6: self.private_ipv6,
            vm: decode_json(self.vm_json.as_deref())?,
            state: decode_enum(&self.state)?,
            active_key: decode_json(self.active_key_json.as_deref())?,
            pending_key: decode_json(self.pending_key_json.as_deref())?,
            rekey_coordinator_id: self.rekey_coordinator_id.as_deref().map(parse_id).transpose()?,
            rekey_phase: decode_enum(&self.rekey_phase)?,
        })
    }
}

fn read_subnet(conn: &Connection, id: SubnetId) -> Result<Option<PrivateSubnet>, VnetError> {
    let sql = format!("SELECT {SUBNET_COLUMNS} FROM vnet_subnets WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .optional()
        .map_err(map_rusqlite_err)?;
    row.map(|(id, name, provider, state, last_rekey_at_ms)| {
        Ok(PrivateSubnet {
            id: parse_id(&id)?,
            name,
            provider,
            state: decode_enum(&state)?,
            last_rekey_at: ms_to_dt(last_rekey_at_ms)?,
        })
    })
    .transpose()
}

fn read_nic(conn: &Connection, id: NicId) -> Result<Option<Nic>, VnetError> {
    let sql = format!("SELECT {NIC_COLUMNS} FROM vnet_nics WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], NicRow::from_row)
        .optional()
        .map_err(map_rusqlite_err)?
        .map(NicRow::into_nic)
        .transpose()
}

fn query_nics(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Nic>, VnetError> {
    let sql = format!("SELECT {NIC_COLUMNS} FROM vnet_nics WHERE {filter}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| VnetError::Store(format!("prepare nic query: {}", e)))?;
    let rows = stmt
        .query_map(args, NicRow::from_row)
        .map_err(|e| VnetError::Store(format!("query nics: {}", e)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(map_rusqlite_err)?.into_nic()?);
    }
    Ok(out)
}

/// `column` is one of the fixed names above, never caller input.
fn update_nic_column(
    conn: &Connection,
    id: NicId,
    column: &str,
    value: Option<String>,
) -> Result<(), VnetError> {
    let changed = conn
        .execute(
            &format!("UPDATE vnet_nics SET {column} = ?2 WHERE id = ?1"),
            params![id.to_string(), value],
        )
        .map_err(|e| VnetError::Store(format!("update {} of nic {}: {}", column, id, e)))?;
    if changed == 0 {
        return Err(VnetError::NicNotFound(id));
    }
    Ok(())
}

fn begin<'c>(conn: &'c mut Connection, what: &str) -> Result<Transaction<'c>, VnetError> {
    conn.transaction()
        .map_err(|e| VnetError::Store(format!("begin {} tx: {}", what, e)))
}

fn commit(tx: Transaction<'_>, what: &str) -> Result<(), VnetError> {
    tx.commit()
        .map_err(|e| VnetError::Store(format!("commit {} tx: {}", what, e)))
}

/// Unit enums are stored by their serde name, e.g. `refreshing_keys`.
fn encode_enum<T: Serialize>(value: &T) -> Result<String, VnetError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Ok(name),
        Ok(other) => Err(VnetError::Store(format!("not a unit enum: {other}"))),
        Err(e) => Err(VnetError::Store(format!("encode enum: {}", e))),
    }
}

fn decode_enum<T: DeserializeOwned>(name: &str) -> Result<T, VnetError> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|e| VnetError::Store(format!("decode '{}': {}", name, e)))
}

fn encode_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>, VnetError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| VnetError::Store(format!("encode column: {}", e)))
}

fn decode_json<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>, VnetError> {
    raw.map(serde_json::from_str)
        .transpose()
        .map_err(|e| VnetError::Store(format!("decode column: {}", e)))
}

fn parse_id(raw: &str) -> Result<Uuid, VnetError> {
    Uuid::parse_str(raw).map_err(|e| VnetError::Store(format!("bad id {}: {}", raw, e)))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, VnetError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| VnetError::Store(format!("timestamp out of range: {ms}ms")))
}

fn map_rusqlite_err(err: rusqlite::Error) -> VnetError {
    VnetError::Store(format!("sqlite vnet store: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> String {
        std::env::temp_dir()
            .join(format!("strand-vnet-{}.db", Uuid::new_v4()))
            .to_str()
            .expect("utf8 temp path")
            .to_string()
    }

    fn now_ms() -> DateTime<Utc> {
        ms_to_dt(dt_to_ms(Utc::now())).unwrap()
    }

    fn key(reqid: u32) -> KeyMaterial {
        KeyMaterial {
            encryption_key: format!("0x{reqid:072x}"),
            spi4: "0x00000001".into(),
            spi6: "0x00000002".into(),
            reqid,
        }
    }

    fn subnet_with_nics(store: &SqliteVnetStore, count: usize) -> (SubnetId, Vec<NicId>) {
        let subnet = PrivateSubnet::new("ps", now_ms());
        store.create_subnet(&subnet).unwrap();
        let nics = (0..count)
            .map(|i| {
                let nic = Nic::new(
                    subnet.id,
                    format!("nic-{i}"),
                    format!("10.0.0.{}", i + 2),
                    format!("fd00::{}", i + 2),
                );
                store.create_nic(&nic).unwrap();
                nic.id
            })
            .collect();
        (subnet.id, nics)
    }

    #[test]
    fn nic_round_trips_through_rows() {
        let store = SqliteVnetStore::open_in_memory().unwrap();
        let (subnet, nics) = subnet_with_nics(&store, 1);
        let vm = VmPlacement {
            vm_id: Uuid::new_v4(),
            host: "10.9.0.2".into(),
            inhost_name: "vm0".into(),
            ephemeral_net6: "2a01:4f8:10a:128b:814c::/79".into(),
        };
        store.attach_vm(nics[0], vm.clone()).unwrap();
        store.set_nic_state(nics[0], NicState::Active).unwrap();
        store.set_pending_key(nics[0], key(3)).unwrap();
        store.set_rekey_phase(nics[0], RekeyPhase::OldDrop).unwrap();

        let nic = store.get_nic(nics[0]).unwrap();
        assert_eq!(nic.subnet_id, subnet);
        assert_eq!(nic.vm, Some(vm));
        assert_eq!(nic.state, NicState::Active);
        assert_eq!(nic.pending_key, Some(key(3)));
        assert_eq!(nic.rekey_phase, RekeyPhase::OldDrop);

        store.detach_vm(nics[0]).unwrap();
        assert_eq!(store.get_nic(nics[0]).unwrap().vm, None);
        assert!(matches!(
            store.set_nic_state(Uuid::new_v4(), NicState::Active),
            Err(VnetError::NicNotFound(_))
        ));
    }

    #[test]
    fn lock_nics_is_all_or_nothing() {
        let store = SqliteVnetStore::open_in_memory().unwrap();
        let (subnet, nics) = subnet_with_nics(&store, 3);
        let other = PrivateSubnet::new("other", now_ms());
        store.create_subnet(&other).unwrap();

        assert!(store.lock_nics(&nics[..1], other.id).unwrap());
        assert!(!store.lock_nics(&nics, subnet).unwrap());
        assert!(store.nics_locked_by(subnet).unwrap().is_empty());
        assert_eq!(store.nics_locked_by(other.id).unwrap().len(), 1);
        assert!(!store.lock_nics(&[Uuid::new_v4()], subnet).unwrap());

        store.delete_nic(nics[0]).unwrap();
        assert!(store.lock_nics(&nics[1..], subnet).unwrap());
        assert_eq!(store.nics_locked_by(subnet).unwrap().len(), 2);
    }

    #[test]
    fn finish_rekey_promotes_keys_and_releases_locks() {
        let store = SqliteVnetStore::open_in_memory().unwrap();
        let (subnet, nics) = subnet_with_nics(&store, 2);
        store.lock_nics(&nics, subnet).unwrap();
        store.set_pending_key(nics[0], key(7)).unwrap();
        store.set_rekey_phase(nics[0], RekeyPhase::OldDrop).unwrap();
        store
            .set_subnet_state(subnet, SubnetState::RefreshingKeys)
            .unwrap();

        let later = now_ms() + chrono::Duration::hours(1);
        let released = store.finish_rekey(subnet, later).unwrap();
        assert_eq!(released.len(), 2);

        let nic = store.get_nic(nics[0]).unwrap();
        assert_eq!(nic.active_key, Some(key(7)));
        assert_eq!(nic.pending_key, None);
        assert_eq!(nic.rekey_phase, RekeyPhase::Idle);
        assert!(!nic.is_locked());
        assert_eq!(store.get_nic(nics[1]).unwrap().active_key, None);
        let subnet = store.get_subnet(subnet).unwrap();
        assert_eq!(subnet.state, SubnetState::Waiting);
        assert_eq!(subnet.last_rekey_at, later);
    }

    #[test]
    fn edges_are_symmetric_and_tunnels_mesh_once() {
        let store = SqliteVnetStore::open_in_memory().unwrap();
        let (a, nics) = subnet_with_nics(&store, 3);
        let (b, _) = subnet_with_nics(&store, 0);
        store.connect(b, a).unwrap();
        store.connect(a, b).unwrap();
        assert_eq!(store.connected(a).unwrap(), vec![b]);
        assert_eq!(store.connected(b).unwrap(), vec![a]);
        assert!(matches!(
            store.connect(a, Uuid::new_v4()),
            Err(VnetError::SubnetNotFound(_))
        ));

        assert_eq!(store.create_tunnels(&nics).unwrap(), 6);
        assert_eq!(store.create_tunnels(&nics).unwrap(), 0);
        let tunnels = store.nic_tunnels(nics[0]).unwrap();
        assert_eq!(tunnels.inbound.len(), 2);
        assert_eq!(tunnels.outbound.len(), 2);

        store.delete_nic(nics[1]).unwrap();
        assert_eq!(store.tunnels().unwrap().len(), 2);

        store.disconnect(a, b).unwrap();
        assert!(store.connected(a).unwrap().is_empty());
        assert!(store.delete_subnet(a).is_err());
        store.delete_subnet(b).unwrap();
        assert!(store.subnet(b).unwrap().is_none());
    }

    #[test]
    fn rotation_state_survives_reopening_the_database() {
        let path = temp_path();
        let (subnet, nics) = {
            let store = SqliteVnetStore::open(&path).unwrap();
            let (subnet, nics) = subnet_with_nics(&store, 2);
            store
                .set_subnet_state(subnet, SubnetState::RefreshingKeys)
                .unwrap();
            assert!(store.lock_nics(&nics, subnet).unwrap());
            store.set_pending_key(nics[0], key(11)).unwrap();
            store.set_rekey_phase(nics[0], RekeyPhase::Outbound).unwrap();
            (subnet, nics)
        };

        let reopened = SqliteVnetStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_subnet(subnet).unwrap().state,
            SubnetState::RefreshingKeys
        );
        let locked: Vec<NicId> = reopened
            .nics_locked_by(subnet)
            .unwrap()
            .into_iter()
            .map(|nic| nic.id)
            .collect();
        let mut expected = nics.clone();
        expected.sort();
        assert_eq!(locked, expected);
        let nic = reopened.get_nic(nics[0]).unwrap();
        assert_eq!(nic.pending_key, Some(key(11)));
        assert_eq!(nic.rekey_phase, RekeyPhase::Outbound);
        assert!(!reopened.lock_nics(&nics, Uuid::new_v4()).unwrap());

        reopened.finish_rekey(subnet, now_ms()).unwrap();
        assert_eq!(
            reopened.get_nic(nics[0]).unwrap().active_key,
            Some(key(11))
        );
    }
}
