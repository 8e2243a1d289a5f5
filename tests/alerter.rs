use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use pmon_api_types::{
    Backup, BackupType, DatastoreStatus, Disk, DiskStatus, Guest, GuestKind, Node, Notification,
    Severity, UsageCounters,
};

use proxmox_monitor::alerts::Alerter;
use proxmox_monitor::cache::{backup_key, Cache};
use proxmox_monitor::config::AlertsConfig;
use proxmox_monitor::notify::NotificationProvider;
use proxmox_monitor::store::Store;

struct CapturingProvider {
    sent: Arc<Mutex<Vec<Notification>>>,
}

#[async_trait::async_trait]
impl NotificationProvider for CapturingProvider {
    fn name(&self) -> &str {
        "capture"
    }

    async fn send(&self, notification: &Notification) -> Result<(), Error> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn setup(config: AlertsConfig) -> (Arc<Cache>, Arc<Store>, Alerter, Arc<Mutex<Vec<Notification>>>) {
    let cache = Arc::new(Cache::new());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let provider = CapturingProvider {
        sent: Arc::clone(&sent),
    };
    let alerter = Alerter::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        vec![Box::new(provider)],
        config,
    );
    (cache, store, alerter, sent)
}

fn busy_node(cpu: f64) -> HashMap<String, Node> {
    let node = Node {
        instance: "test-pve".to_string(),
        name: "pve1".to_string(),
        status: "online".to_string(),
        cpu,
        memory: UsageCounters {
            used: 1024,
            total: 8192,
        },
        ..Default::default()
    };
    HashMap::from([("pve1".to_string(), node)])
}

#[tokio::test]
async fn test_sustained_cpu_fire() -> Result<(), Error> {
    let mut config = AlertsConfig::default();
    config.node_cpu_high.threshold = 90.0;
    config.node_cpu_high.duration = 0;
    config.node_cpu_high.cooldown = 3600;

    let (cache, store, mut alerter, sent) = setup(config);
    cache.update_nodes("test-pve", busy_node(0.95));

    // the first pass only seeds the sustained tracker
    alerter.evaluate_tick(1_700_000_000).await;
    assert!(sent.lock().unwrap().is_empty());

    // the second pass fires exactly once
    alerter.evaluate_tick(1_700_000_030).await;
    {
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].alert_type, "node_cpu_high");
        assert_eq!(sent[0].severity, Severity::Warning);
        assert_eq!(sent[0].subject, "pve1");
        assert!(sent[0].metadata.contains_key("cpu_percent"));
    }

    // dispatched alerts are logged to the store
    assert_eq!(store.count_rows("alert_log")?, 1);
    Ok(())
}

#[tokio::test]
async fn test_sustained_duration_gate() -> Result<(), Error> {
    let mut config = AlertsConfig::default();
    config.node_cpu_high.threshold = 90.0;
    config.node_cpu_high.duration = 60;
    config.node_cpu_high.cooldown = 3600;

    let (cache, _store, mut alerter, sent) = setup(config);
    cache.update_nodes("test-pve", busy_node(0.95));

    let t0 = 1_700_000_000;
    alerter.evaluate_tick(t0).await; // seeds
    alerter.evaluate_tick(t0 + 30).await; // 30 < 60, still waiting
    assert!(sent.lock().unwrap().is_empty());

    alerter.evaluate_tick(t0 + 70).await; // 70 >= 60
    assert_eq!(sent.lock().unwrap().len(), 1);

    // the condition clearing resets the tracker
    cache.update_nodes("test-pve", busy_node(0.05));
    alerter.evaluate_tick(t0 + 100).await;
    cache.update_nodes("test-pve", busy_node(0.95));
    alerter.evaluate_tick(t0 + 7200).await; // reseeds after the cooldown is over
    alerter.evaluate_tick(t0 + 7230).await; // 30 < 60 again
    assert_eq!(sent.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cooldown_gate() -> Result<(), Error> {
    let mut config = AlertsConfig::default();
    config.disk_smart_failed.cooldown = 600;

    let (cache, _store, mut alerter, sent) = setup(config);

    let disk = Disk {
        identity: "SER-1".to_string(),
        instance: "test-pve".to_string(),
        node: "pve1".to_string(),
        devpath: "/dev/sda".to_string(),
        health: "FAILED".to_string(),
        ..Default::default()
    };
    cache.update_disks(HashMap::from([("SER-1".to_string(), disk)]));

    let t0 = 1_700_000_000;
    alerter.evaluate_tick(t0).await;
    assert_eq!(sent.lock().unwrap().len(), 1);

    // within the cooldown: suppressed
    alerter.evaluate_tick(t0 + 300).await;
    assert_eq!(sent.lock().unwrap().len(), 1);

    // past the cooldown: fires again
    alerter.evaluate_tick(t0 + 700).await;
    assert_eq!(sent.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_disk_rules_can_both_fire() -> Result<(), Error> {
    let (cache, _store, mut alerter, sent) = setup(AlertsConfig::default());

    let disk = Disk {
        identity: "SER-1".to_string(),
        instance: "test-pve".to_string(),
        node: "pve1".to_string(),
        devpath: "/dev/sda".to_string(),
        health: "PASSED".to_string(),
        status: DiskStatus::FAILED_SMART | DiskStatus::WARN_SCRUTINY,
        ..Default::default()
    };
    cache.update_disks(HashMap::from([("SER-1".to_string(), disk)]));

    alerter.evaluate_tick(1_700_000_000).await;

    let sent = sent.lock().unwrap();
    let mut types: Vec<&str> = sent.iter().map(|n| n.alert_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, vec!["disk_scrutiny_warning", "disk_smart_failed"]);
    Ok(())
}

#[tokio::test]
async fn test_guest_down_grace() -> Result<(), Error> {
    let mut config = AlertsConfig::default();
    config.guest_down.grace_period = 120;

    let (cache, _store, mut alerter, sent) = setup(config);

    let guest = Guest {
        instance: "test-pve".to_string(),
        node: "pve1".to_string(),
        cluster_id: "homelab-cluster".to_string(),
        kind: GuestKind::Qemu,
        vmid: 101,
        name: "vm101".to_string(),
        status: "stopped".to_string(),
        cpu: 0.0,
        cpus: 2,
        mem: 0,
        maxmem: 4096,
        disk: 0,
        maxdisk: 0,
        netin: 0,
        netout: 0,
        uptime: 0,
    };
    cache.update_guests("homelab-cluster", HashMap::from([(101, guest)]));

    let t0 = 1_700_000_000;
    alerter.evaluate_tick(t0).await;
    alerter.evaluate_tick(t0 + 60).await;
    assert!(sent.lock().unwrap().is_empty());

    alerter.evaluate_tick(t0 + 130).await;
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].alert_type, "guest_down");
    assert_eq!(sent[0].severity, Severity::Critical);
    Ok(())
}

#[tokio::test]
async fn test_backup_stale() -> Result<(), Error> {
    let mut config = AlertsConfig::default();
    config.backup_stale.max_age = 24 * 3600;

    let (cache, _store, mut alerter, sent) = setup(config);

    let now = 1_700_000_000;
    let fresh = Backup {
        pbs_instance: "test-pbs".to_string(),
        datastore: "tank".to_string(),
        backup_type: BackupType::Vm,
        backup_id: "100".to_string(),
        backup_time: now - 3600,
        size: None,
        verified: Some(true),
    };
    let stale = Backup {
        backup_id: "101".to_string(),
        backup_type: BackupType::Ct,
        backup_time: now - 3 * 24 * 3600,
        ..fresh.clone()
    };
    cache.update_backups(
        "test-pbs",
        HashMap::from([
            (backup_key("tank", "100"), fresh),
            (backup_key("tank", "101"), stale),
        ]),
    );

    alerter.evaluate_tick(now).await;
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].alert_type, "backup_stale");
    assert_eq!(sent[0].subject, "101");
    Ok(())
}

#[tokio::test]
async fn test_datastore_rules() -> Result<(), Error> {
    let (cache, _store, mut alerter, sent) = setup(AlertsConfig::default());

    let full = DatastoreStatus {
        pbs_instance: "test-pbs".to_string(),
        name: "tank".to_string(),
        total: Some(1000),
        used: Some(950),
        avail: Some(50),
        ..Default::default()
    };
    let broken = DatastoreStatus {
        pbs_instance: "test-pbs".to_string(),
        name: "scratch".to_string(),
        error: Some("unable to access chunk store".to_string()),
        ..Default::default()
    };
    // a 403 placeholder has no capacity data and must stay silent
    let placeholder = DatastoreStatus {
        pbs_instance: "test-pbs".to_string(),
        name: "ds1".to_string(),
        ..Default::default()
    };

    cache.update_datastores(
        "test-pbs",
        HashMap::from([
            ("tank".to_string(), full),
            ("scratch".to_string(), broken),
            ("ds1".to_string(), placeholder),
        ]),
    );

    alerter.evaluate_tick(1_700_000_000).await;

    let sent = sent.lock().unwrap();
    let mut types: Vec<&str> = sent.iter().map(|n| n.alert_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, vec!["datastore_full", "datastore_offline"]);
    Ok(())
}
