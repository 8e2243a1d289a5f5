//! Embedded time-series store.
//!
//! One SQLite database file holds the instance registry, the per-disk state
//! and the time-series snapshot tables. All snapshot tables cluster on a
//! time-leading primary key so range queries and retention deletes stay
//! index scans. Writes are row-at-a-time upserts; the store is safe for
//! concurrent callers (one connection behind a mutex, WAL journal for
//! concurrent readers).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

use pmon_api_types::{
    Backup, DatastoreStatus, Disk, Guest, Node, Notification, Severity, SmartAttribute,
    UsageCounters,
};

use crate::config::RetentionConfig;

mod prune;

pub use prune::run_pruner;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pve_instances (
    name TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    cluster_id TEXT
);
CREATE TABLE IF NOT EXISTS pbs_instances (
    name TEXT PRIMARY KEY,
    host TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS disks (
    identity TEXT PRIMARY KEY,
    instance TEXT NOT NULL,
    node TEXT NOT NULL,
    devpath TEXT NOT NULL,
    model TEXT NOT NULL,
    serial TEXT NOT NULL,
    wwn TEXT NOT NULL,
    disk_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    health TEXT NOT NULL,
    status INTEGER NOT NULL,
    temperature INTEGER,
    power_on_hours INTEGER,
    wearout REAL,
    last_seen INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS node_snapshots (
    ts INTEGER NOT NULL,
    instance TEXT NOT NULL,
    node TEXT NOT NULL,
    status TEXT NOT NULL,
    cpu REAL NOT NULL,
    mem_used INTEGER NOT NULL,
    mem_total INTEGER NOT NULL,
    swap_used INTEGER NOT NULL,
    swap_total INTEGER NOT NULL,
    load1 REAL NOT NULL,
    load5 REAL NOT NULL,
    load15 REAL NOT NULL,
    uptime INTEGER NOT NULL,
    wait REAL NOT NULL,
    temperature REAL,
    PRIMARY KEY (ts, instance, node)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS guest_snapshots (
    ts INTEGER NOT NULL,
    instance TEXT NOT NULL,
    vmid INTEGER NOT NULL,
    node TEXT NOT NULL,
    status TEXT NOT NULL,
    cpu REAL NOT NULL,
    mem INTEGER NOT NULL,
    maxmem INTEGER NOT NULL,
    PRIMARY KEY (ts, instance, vmid)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS smart_snapshots (
    ts INTEGER NOT NULL,
    identity TEXT NOT NULL,
    health TEXT NOT NULL,
    status INTEGER NOT NULL,
    temperature INTEGER,
    power_on_hours INTEGER,
    wearout REAL,
    attributes TEXT NOT NULL,
    PRIMARY KEY (ts, identity)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS backup_snapshots (
    ts INTEGER NOT NULL,
    pbs_instance TEXT NOT NULL,
    backup_id TEXT NOT NULL,
    backup_time INTEGER NOT NULL,
    datastore TEXT NOT NULL,
    backup_type TEXT NOT NULL,
    size INTEGER,
    verified INTEGER,
    PRIMARY KEY (ts, pbs_instance, backup_id, backup_time)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS datastore_snapshots (
    ts INTEGER NOT NULL,
    pbs_instance TEXT NOT NULL,
    store_name TEXT NOT NULL,
    total INTEGER,
    used INTEGER,
    avail INTEGER,
    dedup_factor REAL,
    error TEXT,
    PRIMARY KEY (ts, pbs_instance, store_name)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS alert_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    instance TEXT NOT NULL,
    subject TEXT NOT NULL,
    resolved INTEGER,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS alert_log_ts ON alert_log (ts);
"#;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and run the idempotent schema
    /// migration.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|err| format_err!("unable to open database {:?} - {}", path, err))?;
        Self::setup(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> Result<Self, Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL allows concurrent readers while the writer holds the lock;
        // the pragma returns the resulting mode as a row
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_pve_instance(
        &self,
        name: &str,
        host: &str,
        cluster_id: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pve_instances (name, host, cluster_id) VALUES (?1, ?2, ?3)",
            params![name, host, cluster_id],
        )?;
        Ok(())
    }

    pub fn upsert_pbs_instance(&self, name: &str, host: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pbs_instances (name, host) VALUES (?1, ?2)",
            params![name, host],
        )?;
        Ok(())
    }

    pub fn upsert_disk(&self, disk: &Disk, now: i64) -> Result<(), Error> {
        let disk_type = serde_json::to_value(disk.disk_type)?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO disks \
             (identity, instance, node, devpath, model, serial, wwn, disk_type, size, \
              health, status, temperature, power_on_hours, wearout, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                disk.identity,
                disk.instance,
                disk.node,
                disk.devpath,
                disk.model,
                disk.serial,
                disk.wwn,
                disk_type,
                disk.size,
                disk.health,
                disk.status.bits(),
                disk.temperature,
                disk.power_on_hours,
                disk.wearout,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn insert_node_snapshot(&self, ts: i64, node: &Node) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO node_snapshots \
             (ts, instance, node, status, cpu, mem_used, mem_total, swap_used, swap_total, \
              load1, load5, load15, uptime, wait, temperature) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                ts,
                node.instance,
                node.name,
                node.status,
                node.cpu,
                node.memory.used,
                node.memory.total,
                node.swap.used,
                node.swap.total,
                node.loadavg[0],
                node.loadavg[1],
                node.loadavg[2],
                node.uptime,
                node.wait,
                node.temperature,
            ],
        )?;
        Ok(())
    }

    /// Read back one node snapshot row. Fields not persisted (cpu model,
    /// rootfs) come back defaulted.
    pub fn node_snapshot(
        &self,
        ts: i64,
        instance: &str,
        node: &str,
    ) -> Result<Option<Node>, Error> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT status, cpu, mem_used, mem_total, swap_used, swap_total, \
                        load1, load5, load15, uptime, wait, temperature \
                 FROM node_snapshots WHERE ts = ?1 AND instance = ?2 AND node = ?3",
                params![ts, instance, node],
                |row| {
                    Ok(Node {
                        instance: instance.to_string(),
                        name: node.to_string(),
                        status: row.get(0)?,
                        cpu: row.get(1)?,
                        memory: UsageCounters {
                            used: row.get(2)?,
                            total: row.get(3)?,
                        },
                        swap: UsageCounters {
                            used: row.get(4)?,
                            total: row.get(5)?,
                        },
                        loadavg: [row.get(6)?, row.get(7)?, row.get(8)?],
                        uptime: row.get(9)?,
                        wait: row.get(10)?,
                        temperature: row.get(11)?,
                        ..Default::default()
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_guest_snapshot(&self, ts: i64, guest: &Guest) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO guest_snapshots \
             (ts, instance, vmid, node, status, cpu, mem, maxmem) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ts,
                guest.instance,
                guest.vmid,
                guest.node,
                guest.status,
                guest.cpu,
                guest.mem,
                guest.maxmem,
            ],
        )?;
        Ok(())
    }

    pub fn insert_smart_snapshot(
        &self,
        ts: i64,
        disk: &Disk,
    ) -> Result<(), Error> {
        let attributes = serde_json::to_string(&disk.attributes)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO smart_snapshots \
             (ts, identity, health, status, temperature, power_on_hours, wearout, attributes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ts,
                disk.identity,
                disk.health,
                disk.status.bits(),
                disk.temperature,
                disk.power_on_hours,
                disk.wearout,
                attributes,
            ],
        )?;
        Ok(())
    }

    /// Read back the attribute list of one SMART snapshot.
    pub fn smart_snapshot_attributes(
        &self,
        ts: i64,
        identity: &str,
    ) -> Result<Option<Vec<SmartAttribute>>, Error> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT attributes FROM smart_snapshots WHERE ts = ?1 AND identity = ?2",
                params![ts, identity],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn insert_backup_snapshot(&self, ts: i64, backup: &Backup) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO backup_snapshots \
             (ts, pbs_instance, backup_id, backup_time, datastore, backup_type, size, verified) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ts,
                backup.pbs_instance,
                backup.backup_id,
                backup.backup_time,
                backup.datastore,
                backup.backup_type.to_string(),
                backup.size,
                backup.verified,
            ],
        )?;
        Ok(())
    }

    pub fn insert_datastore_snapshot(
        &self,
        ts: i64,
        datastore: &DatastoreStatus,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO datastore_snapshots \
             (ts, pbs_instance, store_name, total, used, avail, dedup_factor, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ts,
                datastore.pbs_instance,
                datastore.name,
                datastore.total,
                datastore.used,
                datastore.avail,
                datastore.deduplication_factor,
                datastore.error,
            ],
        )?;
        Ok(())
    }

    pub fn insert_alert(&self, notification: &Notification) -> Result<(), Error> {
        let metadata = serde_json::to_string(&notification.metadata)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_log \
             (ts, alert_type, severity, title, message, instance, subject, resolved, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                notification.timestamp,
                notification.alert_type,
                notification.severity.to_string(),
                notification.title,
                notification.message,
                notification.instance,
                notification.subject,
                notification.resolved,
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Latest alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<Notification>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT ts, alert_type, severity, title, message, instance, subject, resolved, metadata \
             FROM alert_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<bool>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            let (ts, alert_type, severity, title, message, instance, subject, resolved, metadata) =
                row?;
            let severity = match severity.as_str() {
                "critical" => Severity::Critical,
                "info" => Severity::Info,
                _ => Severity::Warning,
            };
            let metadata: HashMap<String, String> =
                serde_json::from_str(&metadata).unwrap_or_default();
            alerts.push(Notification {
                alert_type,
                severity,
                title,
                message,
                instance,
                subject,
                timestamp: ts,
                resolved,
                metadata,
            });
        }
        Ok(alerts)
    }

    /// Time series for the node dashboard sparklines. The column selection
    /// is fixed by the metric; anything but `cpu` or `memory` is an error.
    pub fn query_node_sparkline(
        &self,
        instance: &str,
        node: &str,
        metric: &str,
        since: i64,
    ) -> Result<Vec<(i64, f64)>, Error> {
        let query = match metric {
            "cpu" => {
                "SELECT ts, cpu * 100.0 FROM node_snapshots \
                 WHERE instance = ?1 AND node = ?2 AND ts >= ?3 ORDER BY ts"
            }
            "memory" => {
                "SELECT ts, CASE WHEN mem_total > 0 \
                        THEN mem_used * 100.0 / mem_total ELSE 0.0 END \
                 FROM node_snapshots \
                 WHERE instance = ?1 AND node = ?2 AND ts >= ?3 ORDER BY ts"
            }
            other => bail!("unknown sparkline metric '{}'", other),
        };

        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(query)?;
        let rows = statement.query_map(params![instance, node, since], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// CPU percentage series of one guest.
    pub fn query_guest_sparkline(
        &self,
        instance: &str,
        vmid: u64,
        since: i64,
    ) -> Result<Vec<(i64, f64)>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT ts, cpu * 100.0 FROM guest_snapshots \
             WHERE instance = ?1 AND vmid = ?2 AND ts >= ?3 ORDER BY ts",
        )?;
        let rows = statement.query_map(params![instance, vmid, since], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete rows beyond their table's retention. Individual table
    /// failures are logged and do not abort the pass.
    pub fn prune(&self, now: i64, retention: &RetentionConfig) {
        let tables: &[(&str, i64)] = &[
            ("node_snapshots", retention.node_snapshots),
            ("guest_snapshots", retention.guest_snapshots),
            ("smart_snapshots", retention.smart_snapshots),
            ("backup_snapshots", retention.backup_snapshots),
            ("datastore_snapshots", retention.datastore_snapshots),
            ("alert_log", retention.alert_log),
        ];

        let conn = self.conn.lock().unwrap();
        for (table, retention) in tables {
            let query = format!("DELETE FROM {} WHERE ts < ?1", table);
            match conn.execute(&query, params![now - retention]) {
                Ok(deleted) if deleted > 0 => {
                    log::debug!("pruned {} rows from {}", deleted, table);
                }
                Ok(_) => (),
                Err(err) => log::error!("pruning {} failed - {}", table, err),
            }
        }
    }

    /// Number of rows in a snapshot table, used by tests and diagnostics.
    pub fn count_rows(&self, table: &str) -> Result<i64, Error> {
        let allowed = [
            "pve_instances",
            "pbs_instances",
            "disks",
            "node_snapshots",
            "guest_snapshots",
            "smart_snapshots",
            "backup_snapshots",
            "datastore_snapshots",
            "alert_log",
        ];
        if !allowed.contains(&table) {
            bail!("unknown table '{}'", table);
        }
        let conn = self.conn.lock().unwrap();
        let count =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    /// Oldest timestamp in a snapshot table.
    pub fn oldest_ts(&self, table: &str) -> Result<Option<i64>, Error> {
        self.count_rows(table)?; // validates the table name
        let conn = self.conn.lock().unwrap();
        let ts = conn
            .query_row(&format!("SELECT MIN(ts) FROM {}", table), [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pmon_api_types::{BackupType, DiskStatus};

    #[test]
    fn test_unknown_metric_is_error() -> Result<(), Error> {
        let store = Store::open_in_memory()?;
        assert!(store
            .query_node_sparkline("pve", "node1", "iops", 0)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_disk_upsert_replaces() -> Result<(), Error> {
        let store = Store::open_in_memory()?;

        let mut disk = Disk {
            identity: "SER-1".to_string(),
            instance: "test-pve".to_string(),
            node: "pve1".to_string(),
            devpath: "/dev/sda".to_string(),
            health: "PASSED".to_string(),
            ..Default::default()
        };
        store.upsert_disk(&disk, 1000)?;

        disk.health = "FAILED".to_string();
        disk.status = DiskStatus::FAILED_SMART;
        store.upsert_disk(&disk, 2000)?;

        assert_eq!(store.count_rows("disks")?, 1);
        Ok(())
    }

    #[test]
    fn test_backup_type_round_trip() -> Result<(), Error> {
        let store = Store::open_in_memory()?;
        let backup = Backup {
            pbs_instance: "test-pbs".to_string(),
            datastore: "tank".to_string(),
            backup_type: BackupType::Ct,
            backup_id: "101".to_string(),
            backup_time: 1_700_000_000,
            size: Some(1 << 30),
            verified: Some(true),
        };
        store.insert_backup_snapshot(1_700_000_100, &backup)?;
        assert_eq!(store.count_rows("backup_snapshots")?, 1);
        Ok(())
    }
}
