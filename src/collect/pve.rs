//! Proxmox VE collector.
//!
//! One cycle discovers the online nodes, fans the per-node work out through
//! the shared worker pool and aggregates the results into the cache and the
//! store. SMART probing runs on its own (much larger) interval since it is
//! expensive on the target hosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pmon_api_types::{
    disk_identity, normalize_sentinel, number_or_string_f64, CpuInfo, Disk, DiskProtocol,
    DiskStatus, DiskType, Guest, GuestKind, Node, UsageCounters,
};

use crate::cache::Cache;
use crate::client::{split_host_port, ApiClient, ApiError};
use crate::config::PveInstanceConfig;
use crate::pool::WorkerPool;
use crate::smart;
use crate::store::Store;

const PVE_DEFAULT_PORT: u16 = 8006;

pub struct PveCollector {
    config: PveInstanceConfig,
    name: String,
    client: Arc<ApiClient>,
    pool: WorkerPool,
    cache: Arc<Cache>,
    store: Arc<Store>,
    /// Resolved on the first cycle; the instance name for standalone hosts.
    cluster_id: Option<String>,
    last_disk_poll: i64,
}

/// Result of one node's worker task.
struct NodeWork {
    node: Node,
    guests: Vec<Guest>,
    disks: Vec<Disk>,
}

impl PveCollector {
    pub fn new(
        config: PveInstanceConfig,
        pool: WorkerPool,
        cache: Arc<Cache>,
        store: Arc<Store>,
    ) -> Result<Self, Error> {
        let (server, port) = split_host_port(&config.host, PVE_DEFAULT_PORT);
        let auth = crate::client::pve_token_header(&config.token_id, &config.token_secret);
        let client = ApiClient::new(&server, port, auth, !config.insecure_tls)?;

        Ok(Self {
            name: format!("pve:{}", config.name),
            client: Arc::new(client),
            pool,
            cache,
            store,
            cluster_id: None,
            last_disk_poll: 0,
            config,
        })
    }

    /// Resolve the guest grouping key. Clustered instances ask the cluster
    /// status endpoint once; everything falls back to the instance name.
    async fn resolve_cluster_id(&mut self) -> String {
        if let Some(cluster_id) = &self.cluster_id {
            return cluster_id.clone();
        }

        let cluster_id = if self.config.cluster {
            match self.client.get("/api2/json/cluster/status").await {
                Ok(data) => match parse_cluster_name(&data) {
                    Some(name) => name,
                    None => {
                        log::warn!(
                            "pve {}: no cluster entry in cluster status, using instance name",
                            self.config.name
                        );
                        self.config.name.clone()
                    }
                },
                Err(err) => {
                    log::warn!(
                        "pve {}: cluster status failed, using instance name - {}",
                        self.config.name,
                        err
                    );
                    self.config.name.clone()
                }
            }
        } else {
            self.config.name.clone()
        };

        self.cluster_id = Some(cluster_id.clone());
        cluster_id
    }
}

#[async_trait::async_trait]
impl super::Collector for PveCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval.max(10))
    }

    async fn collect(&mut self, token: &CancellationToken) -> Result<(), Error> {
        let now = proxmox_time::epoch_i64();
        let instance = self.config.name.clone();

        // node discovery failing fails the whole cycle
        let data = self.client.get("/api2/json/nodes").await?;
        let node_names = discover_nodes(&data);

        let cluster_id = self.resolve_cluster_id().await;

        let poll_disks = now - self.last_disk_poll >= self.config.disk_poll_interval as i64;

        let mut handles = Vec::with_capacity(node_names.len());
        for node_name in node_names {
            let client = Arc::clone(&self.client);
            let instance = instance.clone();
            let cluster_id = cluster_id.clone();
            let handle = self
                .pool
                .submit(token, async move {
                    collect_node(client, instance, cluster_id, node_name, poll_disks).await
                })
                .await?;
            handles.push(handle);
        }

        let mut nodes = HashMap::new();
        let mut guests = HashMap::new();
        let mut disks = HashMap::new();

        for handle in handles {
            match handle.await {
                Ok(work) => {
                    for guest in work.guests {
                        guests.insert(guest.vmid, guest);
                    }
                    for disk in work.disks {
                        disks.insert(disk.identity.clone(), disk);
                    }
                    nodes.insert(work.node.name.clone(), work.node);
                }
                Err(err) => {
                    log::error!("pve {}: node worker failed - {}", instance, err);
                }
            }
        }

        self.cache.update_nodes(&instance, nodes.clone());
        self.cache.update_guests(&cluster_id, guests.clone());
        self.cache.update_disks(disks.clone());
        if poll_disks {
            self.last_disk_poll = now;
        }

        if let Err(err) =
            self.store
                .upsert_pve_instance(&instance, &self.config.host, Some(&cluster_id))
        {
            log::error!("pve {}: persisting instance failed - {}", instance, err);
        }
        for node in nodes.values() {
            if let Err(err) = self.store.insert_node_snapshot(now, node) {
                log::error!("pve {}: persisting node {} failed - {}", instance, node.name, err);
            }
        }
        for guest in guests.values() {
            if let Err(err) = self.store.insert_guest_snapshot(now, guest) {
                log::error!("pve {}: persisting guest {} failed - {}", instance, guest.vmid, err);
            }
        }
        for disk in disks.values() {
            if let Err(err) = self.store.upsert_disk(disk, now) {
                log::error!("pve {}: persisting disk {} failed - {}", instance, disk.identity, err);
            } else if let Err(err) = self.store.insert_smart_snapshot(now, disk) {
                log::error!(
                    "pve {}: persisting SMART snapshot for {} failed - {}",
                    instance,
                    disk.identity,
                    err
                );
            }
        }

        self.cache.set_last_poll(&self.name, now);
        Ok(())
    }
}

/// All per-node API calls of one cycle, run as one worker-pool task.
/// Failures below node level are logged and leave that section empty.
async fn collect_node(
    client: Arc<ApiClient>,
    instance: String,
    cluster_id: String,
    node_name: String,
    poll_disks: bool,
) -> NodeWork {
    let mut node = Node {
        instance: instance.clone(),
        name: node_name.clone(),
        status: "online".to_string(),
        ..Default::default()
    };

    match client
        .get(&format!("/api2/json/nodes/{}/status", node_name))
        .await
    {
        Ok(data) => apply_node_status(&mut node, &data),
        Err(err) => {
            log::warn!("pve {}: status of node {} failed - {}", instance, node_name, err);
        }
    }

    let mut guests = Vec::new();
    for kind in [GuestKind::Lxc, GuestKind::Qemu] {
        match client
            .get(&format!("/api2/json/nodes/{}/{}", node_name, kind))
            .await
        {
            Ok(data) => {
                for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
                    match parse_guest_entry(&instance, &cluster_id, &node_name, kind, entry) {
                        Some(guest) => guests.push(guest),
                        None => log::warn!(
                            "pve {}: unparsable {} entry on {} skipped",
                            instance,
                            kind,
                            node_name
                        ),
                    }
                }
            }
            Err(err) => {
                log::warn!(
                    "pve {}: {} list of node {} failed - {}",
                    instance,
                    kind,
                    node_name,
                    err
                );
            }
        }
    }

    let mut disks = Vec::new();
    if poll_disks {
        match client
            .get(&format!(
                "/api2/json/nodes/{}/disks/list?skipsmart=1",
                node_name
            ))
            .await
        {
            Ok(data) => {
                for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
                    let mut disk = match parse_disk_entry(&instance, &node_name, entry) {
                        Some(disk) => disk,
                        None => continue,
                    };
                    if let Err(err) = fetch_smart(&client, &node_name, &mut disk).await {
                        log::error!(
                            "pve {}: SMART for {} on {} failed - {}",
                            instance,
                            disk.devpath,
                            node_name,
                            err
                        );
                        disk.status |= DiskStatus::INTERNAL_ERROR;
                    }
                    disks.push(disk);
                }
            }
            Err(err) => {
                log::warn!(
                    "pve {}: disk list of node {} failed - {}",
                    instance,
                    node_name,
                    err
                );
            }
        }
    }

    NodeWork {
        node,
        guests,
        disks,
    }
}

/// Online nodes of a `/nodes` payload, input order preserved.
pub fn discover_nodes(data: &Value) -> Vec<String> {
    let mut nodes = Vec::new();
    if let Some(entries) = data.as_array() {
        for entry in entries {
            if entry["status"].as_str() != Some("online") {
                continue;
            }
            if let Some(name) = entry["node"].as_str() {
                nodes.push(name.to_string());
            }
        }
    }
    nodes
}

/// The cluster name from a `/cluster/status` payload.
pub fn parse_cluster_name(data: &Value) -> Option<String> {
    data.as_array()?
        .iter()
        .find(|entry| entry["type"].as_str() == Some("cluster"))
        .and_then(|entry| entry["name"].as_str())
        .map(str::to_string)
}

fn parse_counters(value: &Value) -> UsageCounters {
    UsageCounters {
        used: value["used"].as_u64().unwrap_or(0),
        total: value["total"].as_u64().unwrap_or(0),
    }
}

/// Fill a node entity from its `/status` payload. `loadavg` may arrive as
/// an array of strings or of floats.
pub fn apply_node_status(node: &mut Node, data: &Value) {
    node.cpu = data["cpu"].as_f64().unwrap_or(0.0);

    if let Some(info) = data["cpuinfo"].as_object() {
        node.cpu_info = CpuInfo {
            model: info
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            cores: info.get("cores").and_then(Value::as_u64).unwrap_or(0) as u32,
            threads: info.get("cpus").and_then(Value::as_u64).unwrap_or(0) as u32,
            sockets: info.get("sockets").and_then(Value::as_u64).unwrap_or(0) as u32,
        };
    }

    node.memory = parse_counters(&data["memory"]);
    node.swap = parse_counters(&data["swap"]);
    node.rootfs = parse_counters(&data["rootfs"]);

    if let Some(values) = data["loadavg"].as_array() {
        for (index, value) in values.iter().take(3).enumerate() {
            node.loadavg[index] = number_or_string_f64(value).unwrap_or(0.0);
        }
    }

    node.uptime = data["uptime"].as_u64().unwrap_or(0);
    node.wait = data["wait"].as_f64().unwrap_or(0.0);
}

/// One entry of an `/lxc` or `/qemu` listing. `vmid` arrives as a number
/// for qemu and (on some versions) as a string for lxc.
pub fn parse_guest_entry(
    instance: &str,
    cluster_id: &str,
    node: &str,
    kind: GuestKind,
    entry: &Value,
) -> Option<Guest> {
    let vmid = match &entry["vmid"] {
        Value::Number(number) => number.as_u64()?,
        Value::String(text) => text.trim().parse::<u64>().ok()?,
        _ => return None,
    };

    Some(Guest {
        instance: instance.to_string(),
        node: node.to_string(),
        cluster_id: cluster_id.to_string(),
        kind,
        vmid,
        name: entry["name"].as_str().unwrap_or("").to_string(),
        status: entry["status"].as_str().unwrap_or("unknown").to_string(),
        cpu: entry["cpu"].as_f64().unwrap_or(0.0),
        cpus: entry["cpus"].as_u64().unwrap_or(0),
        mem: entry["mem"].as_u64().unwrap_or(0),
        maxmem: entry["maxmem"].as_u64().unwrap_or(0),
        disk: entry["disk"].as_u64().unwrap_or(0),
        maxdisk: entry["maxdisk"].as_u64().unwrap_or(0),
        netin: entry["netin"].as_u64().unwrap_or(0),
        netout: entry["netout"].as_u64().unwrap_or(0),
        uptime: entry["uptime"].as_u64().unwrap_or(0),
    })
}

/// One entry of a `/disks/list` payload. Disks without any usable identity
/// are skipped with a warning.
pub fn parse_disk_entry(instance: &str, node: &str, entry: &Value) -> Option<Disk> {
    let devpath = normalize_sentinel(entry["devpath"].as_str().unwrap_or("")).to_string();
    let wwn = normalize_sentinel(entry["wwn"].as_str().unwrap_or("")).to_string();
    let serial = normalize_sentinel(entry["serial"].as_str().unwrap_or("")).to_string();

    let identity = disk_identity(&wwn, &serial, &devpath);
    if identity.is_empty() {
        log::warn!("pve {}: disk on {} without usable identity skipped", instance, node);
        return None;
    }

    let disk_type = match normalize_sentinel(entry["type"].as_str().unwrap_or("")) {
        "hdd" => DiskType::Hdd,
        "ssd" => DiskType::Ssd,
        "nvme" => DiskType::Nvme,
        _ => DiskType::Unknown,
    };
    let protocol = if disk_type == DiskType::Nvme {
        DiskProtocol::Nvme
    } else {
        DiskProtocol::Ata
    };

    Some(Disk {
        identity,
        instance: instance.to_string(),
        node: node.to_string(),
        devpath,
        model: normalize_sentinel(entry["model"].as_str().unwrap_or("")).to_string(),
        serial,
        wwn,
        disk_type,
        protocol,
        size: entry["size"].as_u64().unwrap_or(0),
        health: entry["health"].as_str().unwrap_or("").to_string(),
        wearout: number_or_string_f64(&entry["wearout"]),
        ..Default::default()
    })
}

/// Fetch and evaluate SMART data for one disk.
///
/// ATA disks escalate through the protocol chain: the default request,
/// then `type=sat`, then `type=scsi`. A 400 response or an empty result
/// moves to the next protocol; running out of protocols leaves the disk
/// without attributes. NVMe disks go straight to the NVMe text parser.
async fn fetch_smart(client: &ApiClient, node: &str, disk: &mut Disk) -> Result<(), Error> {
    let base = format!(
        "/api2/json/nodes/{}/disks/smart?disk={}",
        node,
        utf8_percent_encode(&disk.devpath, NON_ALPHANUMERIC)
    );

    match disk.protocol {
        DiskProtocol::Nvme => {
            let data = client.get(&base).await?;
            apply_health(disk, &data);
            let text = data["text"].as_str().unwrap_or("");
            disk.attributes = smart::parse_nvme_text(text)?;
        }
        _ => {
            let mut parsed = false;
            for query in ["", "&type=sat", "&type=scsi"] {
                let data = match client.get(&format!("{}{}", base, query)).await {
                    Ok(data) => data,
                    Err(err) => {
                        // 400 means the protocol guess was wrong, escalate
                        match err.downcast_ref::<ApiError>() {
                            Some(api_err) if api_err.status == 400 => continue,
                            _ => return Err(err),
                        }
                    }
                };

                apply_health(disk, &data);

                if let Some(entries) = data["attributes"].as_array() {
                    if !entries.is_empty() {
                        disk.attributes = smart::parse_ata_attributes(entries)?;
                        parsed = true;
                        break;
                    }
                }
                if let Some(text) = data["text"].as_str() {
                    if !text.trim().is_empty() {
                        disk.attributes = smart::parse_scsi_text(text)?;
                        disk.protocol = DiskProtocol::Scsi;
                        parsed = true;
                        break;
                    }
                }
                // OK but neither attributes nor text: escalate as well
            }
            if !parsed {
                log::warn!(
                    "no SMART attributes for {} on {} after protocol fallback",
                    disk.devpath,
                    node
                );
            }
        }
    }

    smart::evaluate_disk(disk);
    Ok(())
}

fn apply_health(disk: &mut Disk, data: &Value) {
    if let Some(health) = data["health"].as_str() {
        disk.health = health.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_discover_nodes_filters_offline() {
        let data = json!([
            {"node": "pve", "status": "online"},
            {"node": "pve2", "status": "offline"},
            {"node": "pve3", "status": "online"},
            {"node": "pve4", "status": "unknown"},
        ]);
        assert_eq!(discover_nodes(&data), vec!["pve", "pve3"]);
        assert_eq!(discover_nodes(&json!([])), Vec::<String>::new());
    }

    #[test]
    fn test_cluster_name() {
        let data = json!([
            {"type": "node", "name": "pve1"},
            {"type": "cluster", "name": "homelab-cluster", "quorate": 1},
        ]);
        assert_eq!(
            parse_cluster_name(&data).as_deref(),
            Some("homelab-cluster")
        );
        assert_eq!(parse_cluster_name(&json!([{"type": "node"}])), None);
    }

    #[test]
    fn test_node_status_loadavg_shapes() {
        let mut node = Node::default();
        apply_node_status(
            &mut node,
            &json!({
                "cpu": 0.0423,
                "loadavg": ["0.52", "0.61", "0.70"],
                "memory": {"used": 2048, "total": 8192},
                "swap": {"used": 0, "total": 1024},
                "rootfs": {"used": 100, "total": 200},
                "uptime": 86400,
                "wait": 0.01,
                "cpuinfo": {"model": "AMD Ryzen 7", "cores": 8, "cpus": 16, "sockets": 1}
            }),
        );
        assert!((node.cpu - 0.0423).abs() < 1e-9);
        assert_eq!(node.loadavg, [0.52, 0.61, 0.70]);
        assert_eq!(node.memory.used, 2048);
        assert_eq!(node.cpu_info.threads, 16);

        let mut node = Node::default();
        apply_node_status(&mut node, &json!({"loadavg": [0.1, 0.2, 0.3]}));
        assert_eq!(node.loadavg, [0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_guest_vmid_shapes() {
        let entry = json!({
            "vmid": "101",
            "name": "ct101",
            "status": "running",
            "cpu": 0.02,
            "cpus": 2,
            "mem": 512,
            "maxmem": 2048,
        });
        let guest =
            parse_guest_entry("test-pve", "homelab", "pve1", GuestKind::Lxc, &entry).unwrap();
        assert_eq!(guest.vmid, 101);
        assert_eq!(guest.cluster_id, "homelab");

        let entry = json!({"vmid": 100, "name": "vm100", "status": "stopped"});
        let guest =
            parse_guest_entry("test-pve", "homelab", "pve1", GuestKind::Qemu, &entry).unwrap();
        assert_eq!(guest.vmid, 100);
        assert_eq!(guest.kind, GuestKind::Qemu);

        let entry = json!({"name": "broken"});
        assert!(parse_guest_entry("test-pve", "homelab", "pve1", GuestKind::Qemu, &entry).is_none());
    }

    #[test]
    fn test_disk_identity_fallback() {
        let entry = json!({
            "devpath": "/dev/sdb",
            "wwn": "unknown",
            "serial": "",
            "model": "WDC WD40EFRX",
            "type": "hdd",
            "size": 4000787030016u64,
            "health": "PASSED",
        });
        let disk = parse_disk_entry("test-pve", "pve1", &entry).unwrap();
        assert_eq!(disk.identity, "/dev/sdb");
        assert_eq!(disk.disk_type, DiskType::Hdd);
        assert_eq!(disk.protocol, DiskProtocol::Ata);

        // all identity sources are sentinels
        let entry = json!({"devpath": "-", "wwn": "none", "serial": "unknown"});
        assert!(parse_disk_entry("test-pve", "pve1", &entry).is_none());

        // nvme disks probe via the nvme protocol
        let entry = json!({
            "devpath": "/dev/nvme0n1",
            "wwn": "eui.0025385971b08d2c",
            "serial": "S4EWNX0N", "type": "nvme",
        });
        let disk = parse_disk_entry("test-pve", "pve1", &entry).unwrap();
        assert_eq!(disk.identity, "eui.0025385971b08d2c");
        assert_eq!(disk.protocol, DiskProtocol::Nvme);
    }

    #[test]
    fn test_disk_wearout_shapes() {
        let entry = json!({"devpath": "/dev/sda", "serial": "X", "wearout": 96});
        let disk = parse_disk_entry("test-pve", "pve1", &entry).unwrap();
        assert_eq!(disk.wearout, Some(96.0));

        let entry = json!({"devpath": "/dev/sda", "serial": "X", "wearout": "N/A"});
        let disk = parse_disk_entry("test-pve", "pve1", &entry).unwrap();
        assert_eq!(disk.wearout, None);
    }
}
