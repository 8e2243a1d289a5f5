//! Proxmox Backup Server collector.
//!
//! One cycle gathers datastore capacity, the latest backup per group and
//! the recent task list. Missing permissions (403) degrade gracefully: the
//! datastore gets a placeholder record, the task section is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pmon_api_types::{Backup, BackupType, DatastoreStatus, PbsTask};

use crate::cache::{backup_key, Cache};
use crate::client::{split_host_port, ApiClient, ApiError};
use crate::config::PbsInstanceConfig;
use crate::pool::WorkerPool;
use crate::store::Store;

const PBS_DEFAULT_PORT: u16 = 8007;

/// Task window: one week back, at most 200 entries.
const TASK_WINDOW: i64 = 7 * 24 * 3600;
const TASK_LIMIT: u64 = 200;

pub struct PbsCollector {
    config: PbsInstanceConfig,
    name: String,
    client: Arc<ApiClient>,
    pool: WorkerPool,
    cache: Arc<Cache>,
    store: Arc<Store>,
}

impl PbsCollector {
    pub fn new(
        config: PbsInstanceConfig,
        pool: WorkerPool,
        cache: Arc<Cache>,
        store: Arc<Store>,
    ) -> Result<Self, Error> {
        let (server, port) = split_host_port(&config.host, PBS_DEFAULT_PORT);
        let auth = crate::client::pbs_token_header(&config.token_id, &config.token_secret);
        let client = ApiClient::new(&server, port, auth, !config.insecure_tls)?;

        Ok(Self {
            name: format!("pbs:{}", config.name),
            client: Arc::new(client),
            pool,
            cache,
            store,
            config,
        })
    }

    async fn collect_datastores(&self) -> HashMap<String, DatastoreStatus> {
        let instance = &self.config.name;
        let mut datastores = HashMap::new();

        match &self.config.datastores {
            Some(names) if !names.is_empty() => {
                for name in names {
                    let path = format!(
                        "/api2/json/admin/datastore/{}/status",
                        utf8_percent_encode(name, NON_ALPHANUMERIC)
                    );
                    match self.client.get(&path).await {
                        Ok(data) => {
                            datastores
                                .insert(name.clone(), parse_datastore_status(instance, name, &data));
                        }
                        Err(err) => match err.downcast_ref::<ApiError>() {
                            // a read-only token without Datastore.Audit on
                            // this store still sees it in listings, record
                            // it with unknown capacity
                            Some(api_err) if api_err.status == 403 => {
                                log::warn!(
                                    "pbs {}: no permission for datastore {} status, \
                                     recording placeholder",
                                    instance,
                                    name
                                );
                                datastores
                                    .insert(name.clone(), placeholder_datastore(instance, name));
                            }
                            _ => {
                                log::error!(
                                    "pbs {}: status of datastore {} failed - {}",
                                    instance,
                                    name,
                                    err
                                );
                            }
                        },
                    }
                }
            }
            _ => match self.client.get("/api2/json/status/datastore-usage").await {
                Ok(data) => {
                    datastores = parse_datastore_usage(instance, &data);
                }
                Err(err) => {
                    log::error!("pbs {}: datastore usage failed - {}", instance, err);
                }
            },
        }

        datastores
    }

    async fn collect_tasks(&self, now: i64) -> Option<Vec<PbsTask>> {
        let instance = &self.config.name;
        let path = format!(
            "/api2/json/nodes/localhost/tasks?since={}&limit={}",
            now - TASK_WINDOW,
            TASK_LIMIT
        );
        match self.client.get(&path).await {
            Ok(data) => Some(parse_tasks(&data)),
            Err(err) => {
                match err.downcast_ref::<ApiError>() {
                    Some(api_err) if api_err.status == 403 => {
                        log::warn!("pbs {}: no permission for task list, skipped", instance);
                    }
                    _ => log::error!("pbs {}: task list failed - {}", instance, err),
                }
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl super::Collector for PbsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval.max(10))
    }

    async fn collect(&mut self, token: &CancellationToken) -> Result<(), Error> {
        let now = proxmox_time::epoch_i64();
        let instance = self.config.name.clone();

        let datastores = self.collect_datastores().await;

        // snapshot listing per datastore through the worker pool; the
        // backup dedup key (datastore, backup id) spans the whole instance
        let mut handles = Vec::with_capacity(datastores.len());
        for name in datastores.keys() {
            let client = Arc::clone(&self.client);
            let instance = instance.clone();
            let name = name.clone();
            let handle = self
                .pool
                .submit(token, async move {
                    let path = format!(
                        "/api2/json/admin/datastore/{}/snapshots",
                        utf8_percent_encode(&name, NON_ALPHANUMERIC)
                    );
                    match client.get(&path).await {
                        Ok(data) => parse_snapshots(&instance, &name, &data),
                        Err(err) => {
                            log::warn!(
                                "pbs {}: snapshots of datastore {} failed - {}",
                                instance,
                                name,
                                err
                            );
                            Vec::new()
                        }
                    }
                })
                .await?;
            handles.push(handle);
        }

        let mut backups: HashMap<String, Backup> = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok(groups) => {
                    for backup in groups {
                        merge_backup(&mut backups, backup);
                    }
                }
                Err(err) => log::error!("pbs {}: snapshot worker failed - {}", instance, err),
            }
        }

        let tasks = self.collect_tasks(now).await;

        self.cache.update_datastores(&instance, datastores.clone());
        self.cache.update_backups(&instance, backups.clone());
        self.cache.update_tasks(&instance, tasks);

        if let Err(err) = self.store.upsert_pbs_instance(&instance, &self.config.host) {
            log::error!("pbs {}: persisting instance failed - {}", instance, err);
        }
        for datastore in datastores.values() {
            if let Err(err) = self.store.insert_datastore_snapshot(now, datastore) {
                log::error!(
                    "pbs {}: persisting datastore {} failed - {}",
                    instance,
                    datastore.name,
                    err
                );
            }
        }
        for backup in backups.values() {
            if let Err(err) = self.store.insert_backup_snapshot(now, backup) {
                log::error!(
                    "pbs {}: persisting backup {}/{} failed - {}",
                    instance,
                    backup.datastore,
                    backup.backup_id,
                    err
                );
            }
        }

        self.cache.set_last_poll(&self.name, now);
        Ok(())
    }
}

/// Placeholder for a datastore we may not audit: known by name, capacity
/// unknown. Downstream reporting still proceeds.
pub fn placeholder_datastore(instance: &str, name: &str) -> DatastoreStatus {
    DatastoreStatus {
        pbs_instance: instance.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

/// One `/admin/datastore/{name}/status` payload.
pub fn parse_datastore_status(instance: &str, name: &str, data: &Value) -> DatastoreStatus {
    DatastoreStatus {
        pbs_instance: instance.to_string(),
        name: name.to_string(),
        total: data["total"].as_u64(),
        used: data["used"].as_u64(),
        avail: data["avail"].as_u64(),
        deduplication_factor: data["gc-status"]["deduplication-factor"]
            .as_f64()
            .or_else(|| data["deduplication-factor"].as_f64()),
        error: data["error"].as_str().map(str::to_string),
    }
}

/// The `/status/datastore-usage` payload listing every visible datastore.
pub fn parse_datastore_usage(instance: &str, data: &Value) -> HashMap<String, DatastoreStatus> {
    let mut datastores = HashMap::new();
    for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
        let name = match entry["store"].as_str() {
            Some(name) => name,
            None => continue,
        };
        datastores.insert(name.to_string(), parse_datastore_status(instance, name, entry));
    }
    datastores
}

/// Parse a snapshot listing into per-group backups (newest first wins
/// happens in [`merge_backup`]).
pub fn parse_snapshots(instance: &str, datastore: &str, data: &Value) -> Vec<Backup> {
    let mut backups = Vec::new();
    for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
        let backup_type = match entry["backup-type"].as_str() {
            Some("ct") => BackupType::Ct,
            Some("vm") => BackupType::Vm,
            Some("host") => BackupType::Host,
            _ => continue,
        };
        let backup_id = match entry["backup-id"].as_str() {
            Some(id) => id.to_string(),
            None => continue,
        };
        let backup_time = match entry["backup-time"].as_i64() {
            Some(time) => time,
            None => continue,
        };

        // state "ok" means verified, any other state means a failed or
        // outdated verification, absence means never verified
        let verified = entry["verification"]["state"]
            .as_str()
            .map(|state| state == "ok");

        backups.push(Backup {
            pbs_instance: instance.to_string(),
            datastore: datastore.to_string(),
            backup_type,
            backup_id,
            backup_time,
            size: entry["size"].as_u64(),
            verified,
        });
    }
    backups
}

/// Keep the latest backup per `(datastore, backup_id)` group.
pub fn merge_backup(backups: &mut HashMap<String, Backup>, backup: Backup) {
    let key = backup_key(&backup.datastore, &backup.backup_id);
    match backups.get(&key) {
        Some(existing) if existing.backup_time >= backup.backup_time => (),
        _ => {
            backups.insert(key, backup);
        }
    }
}

/// Map PBS worker types to their short names.
pub fn normalize_worker_type(worker_type: &str) -> &str {
    match worker_type {
        "verificationjob" => "verify",
        "garbage_collection" => "gc",
        other => other,
    }
}

/// One `/nodes/localhost/tasks` payload.
pub fn parse_tasks(data: &Value) -> Vec<PbsTask> {
    let mut tasks = Vec::new();
    for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
        let upid = match entry["upid"].as_str() {
            Some(upid) => upid.to_string(),
            None => continue,
        };
        let worker_type = normalize_worker_type(entry["worker_type"].as_str().unwrap_or(""));
        tasks.push(PbsTask {
            upid,
            worker_type: worker_type.to_string(),
            worker_id: entry["worker_id"].as_str().map(str::to_string),
            starttime: entry["starttime"].as_i64().unwrap_or(0),
            endtime: entry["endtime"].as_i64(),
            status: entry["status"].as_str().map(str::to_string),
            user: entry["user"].as_str().unwrap_or("").to_string(),
        });
    }
    tasks
}
