//! End-to-end scenarios over the parse and aggregation layers, with the
//! HTTP transport substituted by canned payloads.

use std::collections::HashMap;

use anyhow::Error;
use serde_json::json;

use pmon_api_types::Node;

use proxmox_monitor::cache::{backup_key, Cache};
use proxmox_monitor::collect::pbs::{merge_backup, parse_snapshots, placeholder_datastore};
use proxmox_monitor::collect::pve::{apply_node_status, discover_nodes, parse_cluster_name};

#[test]
fn test_standalone_pve_cycle() -> Result<(), Error> {
    // one online and one offline node as reported by /nodes
    let nodes_payload = json!([
        {"node": "pve", "status": "online"},
        {"node": "pve2", "status": "offline"},
    ]);
    let discovered = discover_nodes(&nodes_payload);
    assert_eq!(discovered, vec!["pve"]);

    let status_payload = json!({
        "cpu": 0.0423,
        "loadavg": ["0.52", "0.61", "0.70"],
        "memory": {"used": 2048, "total": 8192},
        "uptime": 86400,
    });

    let cache = Cache::new();
    let mut nodes = HashMap::new();
    for name in discovered {
        let mut node = Node {
            instance: "test-pve".to_string(),
            name: name.clone(),
            status: "online".to_string(),
            ..Default::default()
        };
        apply_node_status(&mut node, &status_payload);
        nodes.insert(name, node);
    }
    cache.update_nodes("test-pve", nodes);
    cache.set_last_poll("pve:test-pve", 1_700_000_000);

    let snapshot = cache.snapshot();
    let instance_nodes = &snapshot.nodes["test-pve"];
    assert_eq!(instance_nodes.len(), 1);
    assert!((instance_nodes["pve"].cpu - 0.0423).abs() < 1e-9);
    assert!(!instance_nodes.contains_key("pve2"));
    assert_eq!(snapshot.last_poll["pve:test-pve"], 1_700_000_000);
    Ok(())
}

#[test]
fn test_cluster_mode_guest_grouping() -> Result<(), Error> {
    let cluster_payload = json!([
        {"type": "node", "name": "pve1", "online": 1},
        {"type": "cluster", "name": "homelab-cluster", "quorate": 1, "nodes": 2},
    ]);
    let cluster_id = parse_cluster_name(&cluster_payload).expect("cluster entry");
    assert_eq!(cluster_id, "homelab-cluster");

    // guests land under the resolved cluster id, not the instance name
    let cache = Cache::new();
    cache.update_guests(&cluster_id, HashMap::new());
    let snapshot = cache.snapshot();
    assert!(snapshot.guests.contains_key("homelab-cluster"));
    assert!(!snapshot.guests.contains_key("test-pve"));
    Ok(())
}

#[test]
fn test_pbs_403_placeholder_keeps_snapshots_going() -> Result<(), Error> {
    // the datastore status call answered 403, but the snapshot listing of
    // the same datastore still works
    let cache = Cache::new();

    let placeholder = placeholder_datastore("test-pbs", "ds1");
    assert_eq!(placeholder.name, "ds1");
    assert!(placeholder.total.is_none());
    assert!(placeholder.used.is_none());
    assert!(placeholder.avail.is_none());

    cache.update_datastores(
        "test-pbs",
        HashMap::from([("ds1".to_string(), placeholder)]),
    );

    let snapshots_payload = json!([
        {"backup-type": "ct", "backup-id": "101", "backup-time": 1_700_000_000i64},
    ]);
    let mut backups = HashMap::new();
    for backup in parse_snapshots("test-pbs", "ds1", &snapshots_payload) {
        merge_backup(&mut backups, backup);
    }
    cache.update_backups("test-pbs", backups);

    let snapshot = cache.snapshot();
    assert!(snapshot.datastores["test-pbs"].contains_key("ds1"));
    assert_eq!(snapshot.backups["test-pbs"].len(), 1);
    Ok(())
}

#[test]
fn test_backup_dedup_latest_wins() -> Result<(), Error> {
    let snapshots_payload = json!([
        {"backup-type": "ct", "backup-id": "101", "backup-time": 1_700_000_000i64},
        {"backup-type": "ct", "backup-id": "101", "backup-time": 1_699_900_000i64},
    ]);

    let mut backups = HashMap::new();
    for backup in parse_snapshots("test-pbs", "tank", &snapshots_payload) {
        merge_backup(&mut backups, backup);
    }

    let cache = Cache::new();
    cache.update_backups("test-pbs", backups);

    let snapshot = cache.snapshot();
    let backups = &snapshot.backups["test-pbs"];
    assert_eq!(backups.len(), 1);
    assert_eq!(
        backups[&backup_key("tank", "101")].backup_time,
        1_700_000_000
    );
    Ok(())
}
