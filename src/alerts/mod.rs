//! Alert rule evaluation.
//!
//! The alerter periodically takes a cache snapshot, evaluates the enabled
//! rules against it and dispatches notifications. Two bookkeeping maps
//! implement sustained conditions and per-key cooldowns:
//!
//! * `sustained[key]` - when the condition was first observed; cleared as
//!   soon as it no longer holds.
//! * `last_fired[key]` - when a notification for the key last went out.

use std::collections::HashMap;
use std::sync::Arc;

use proxmox_human_byte::HumanByte;
use tokio_util::sync::CancellationToken;

use pmon_api_types::{DiskStatus, Notification, Severity};

use crate::cache::{Cache, CacheSnapshot};
use crate::config::AlertsConfig;
use crate::notify::NotificationProvider;
use crate::store::Store;

/// Bookkeeping entries older than this are expired on every tick.
const BOOKKEEPING_MAX_AGE: i64 = 6 * 3600;

pub struct Alerter {
    cache: Arc<Cache>,
    store: Arc<Store>,
    providers: Vec<Box<dyn NotificationProvider>>,
    config: AlertsConfig,
    sustained: HashMap<String, i64>,
    last_fired: HashMap<String, i64>,
}

impl Alerter {
    pub fn new(
        cache: Arc<Cache>,
        store: Arc<Store>,
        providers: Vec<Box<dyn NotificationProvider>>,
        config: AlertsConfig,
    ) -> Self {
        Self {
            cache,
            store,
            providers,
            config,
            sustained: HashMap::new(),
            last_fired: HashMap::new(),
        }
    }

    /// Evaluation loop, one pass per configured interval until cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.evaluation_interval.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_tick(proxmox_time::epoch_i64()).await;
                }
                _ = token.cancelled() => {
                    log::debug!("alerter shutting down");
                    return;
                }
            }
        }
    }

    /// One full evaluation pass against the current cache state.
    pub async fn evaluate_tick(&mut self, now: i64) {
        let snapshot = self.cache.snapshot();
        self.expire_bookkeeping(now);

        let mut fired = Vec::new();
        self.check_nodes(&snapshot, now, &mut fired);
        self.check_guests(&snapshot, now, &mut fired);
        self.check_backups(&snapshot, now, &mut fired);
        self.check_disks(&snapshot, now, &mut fired);
        self.check_datastores(&snapshot, now, &mut fired);

        for notification in fired {
            self.dispatch(notification).await;
        }
    }

    fn expire_bookkeeping(&mut self, now: i64) {
        self.sustained
            .retain(|_, first| now - *first <= BOOKKEEPING_MAX_AGE);
        self.last_fired
            .retain(|_, last| now - *last <= BOOKKEEPING_MAX_AGE);
    }

    /// Cooldown gate: returns whether a notification for `key` may go out
    /// now, and records the dispatch time if so.
    fn fire(&mut self, key: &str, now: i64, cooldown: i64) -> bool {
        if let Some(last) = self.last_fired.get(key) {
            if now - last < cooldown {
                return false;
            }
        }
        self.last_fired.insert(key.to_string(), now);
        true
    }

    /// Sustained-condition tracking. The tick that first observes the
    /// condition only seeds the tracker; a later tick fires once the
    /// condition has held for `duration`.
    fn sustained_held(&mut self, key: &str, active: bool, now: i64, duration: i64) -> bool {
        if !active {
            self.sustained.remove(key);
            return false;
        }
        match self.sustained.get(key) {
            None => {
                self.sustained.insert(key.to_string(), now);
                false
            }
            Some(first) => now - first >= duration,
        }
    }

    fn check_nodes(&mut self, snapshot: &CacheSnapshot, now: i64, fired: &mut Vec<Notification>) {
        let cpu_rule = self.config.node_cpu_high;
        let mem_rule = self.config.node_mem_high;

        for (instance, nodes) in &snapshot.nodes {
            for (name, node) in nodes {
                if cpu_rule.enabled {
                    let cpu_percent = node.cpu * 100.0;
                    let key = format!("node_cpu:{}/{}", instance, name);
                    let held = self.sustained_held(
                        &key,
                        cpu_percent >= cpu_rule.threshold,
                        now,
                        cpu_rule.duration,
                    );
                    if held && self.fire(&key, now, cpu_rule.cooldown) {
                        fired.push(Notification {
                            alert_type: "node_cpu_high".to_string(),
                            severity: Severity::Warning,
                            title: format!("High CPU on {}", name),
                            message: format!(
                                "CPU usage on node {} is at {:.1}% (threshold {:.0}%)",
                                name, cpu_percent, cpu_rule.threshold
                            ),
                            instance: instance.clone(),
                            subject: name.clone(),
                            timestamp: now,
                            resolved: None,
                            metadata: HashMap::from([(
                                "cpu_percent".to_string(),
                                format!("{:.1}", cpu_percent),
                            )]),
                        });
                    }
                }

                if mem_rule.enabled && node.memory.total > 0 {
                    let mem_percent =
                        node.memory.used as f64 * 100.0 / node.memory.total as f64;
                    let key = format!("node_mem:{}/{}", instance, name);
                    let held = self.sustained_held(
                        &key,
                        mem_percent >= mem_rule.threshold,
                        now,
                        mem_rule.duration,
                    );
                    if held && self.fire(&key, now, mem_rule.cooldown) {
                        fired.push(Notification {
                            alert_type: "node_mem_high".to_string(),
                            severity: Severity::Warning,
                            title: format!("High memory on {}", name),
                            message: format!(
                                "Memory usage on node {} is at {:.1}% ({} of {})",
                                name,
                                mem_percent,
                                HumanByte::from(node.memory.used),
                                HumanByte::from(node.memory.total),
                            ),
                            instance: instance.clone(),
                            subject: name.clone(),
                            timestamp: now,
                            resolved: None,
                            metadata: HashMap::from([(
                                "mem_percent".to_string(),
                                format!("{:.1}", mem_percent),
                            )]),
                        });
                    }
                }
            }
        }
    }

    fn check_guests(&mut self, snapshot: &CacheSnapshot, now: i64, fired: &mut Vec<Notification>) {
        let rule = self.config.guest_down;
        if !rule.enabled {
            return;
        }

        for (cluster_id, guests) in &snapshot.guests {
            for (vmid, guest) in guests {
                let key = format!("guest_down:{}/{}", cluster_id, vmid);
                let held =
                    self.sustained_held(&key, guest.status != "running", now, rule.grace_period);
                if held && self.fire(&key, now, rule.cooldown) {
                    fired.push(Notification {
                        alert_type: "guest_down".to_string(),
                        severity: Severity::Critical,
                        title: format!("Guest {} down", vmid),
                        message: format!(
                            "{} {} ({}) on node {} is {}",
                            guest.kind, vmid, guest.name, guest.node, guest.status
                        ),
                        instance: guest.instance.clone(),
                        subject: vmid.to_string(),
                        timestamp: now,
                        resolved: None,
                        metadata: HashMap::from([(
                            "status".to_string(),
                            guest.status.clone(),
                        )]),
                    });
                }
            }
        }
    }

    fn check_backups(&mut self, snapshot: &CacheSnapshot, now: i64, fired: &mut Vec<Notification>) {
        let rule = self.config.backup_stale;
        if !rule.enabled {
            return;
        }

        for (pbs_instance, backups) in &snapshot.backups {
            for backup in backups.values() {
                let age = now - backup.backup_time;
                if age <= rule.max_age {
                    continue;
                }
                let key = format!("backup_stale:{}/{}", pbs_instance, backup.backup_id);
                if self.fire(&key, now, rule.cooldown) {
                    fired.push(Notification {
                        alert_type: "backup_stale".to_string(),
                        severity: Severity::Warning,
                        title: format!("Stale backup {}/{}", backup.datastore, backup.backup_id),
                        message: format!(
                            "Last backup of {} {} in datastore {} is {} hours old",
                            backup.backup_type,
                            backup.backup_id,
                            backup.datastore,
                            age / 3600
                        ),
                        instance: pbs_instance.clone(),
                        subject: backup.backup_id.clone(),
                        timestamp: now,
                        resolved: None,
                        metadata: HashMap::from([(
                            "age_hours".to_string(),
                            (age / 3600).to_string(),
                        )]),
                    });
                }
            }
        }
    }

    fn check_disks(&mut self, snapshot: &CacheSnapshot, now: i64, fired: &mut Vec<Notification>) {
        let rule = self.config.disk_smart_failed;
        if !rule.enabled {
            return;
        }

        for disk in snapshot.disks.values() {
            // manufacturer health and the evaluated bitfield are both
            // triggers; the per-disk key dedups them
            let smart_failed = disk.health.eq_ignore_ascii_case("failed")
                || disk
                    .status
                    .intersects(DiskStatus::FAILED_SMART | DiskStatus::FAILED_SCRUTINY);
            if smart_failed {
                let key = format!("disk_smart:{}", disk.identity);
                if self.fire(&key, now, rule.cooldown) {
                    fired.push(Notification {
                        alert_type: "disk_smart_failed".to_string(),
                        severity: Severity::Critical,
                        title: format!("Disk failing on {}", disk.node),
                        message: format!(
                            "Disk {} ({}) on node {} reports health '{}' (status {})",
                            disk.devpath,
                            disk.model,
                            disk.node,
                            disk.health,
                            disk.status.bits()
                        ),
                        instance: disk.instance.clone(),
                        subject: disk.identity.clone(),
                        timestamp: now,
                        resolved: None,
                        metadata: HashMap::from([
                            ("health".to_string(), disk.health.clone()),
                            ("status".to_string(), disk.status.bits().to_string()),
                        ]),
                    });
                }
            }

            // separate key, same configured cooldown
            if disk.status.contains(DiskStatus::WARN_SCRUTINY) {
                let key = format!("disk_scrutiny:{}", disk.identity);
                if self.fire(&key, now, rule.cooldown) {
                    let failure_rate = disk
                        .attributes
                        .iter()
                        .filter_map(|attribute| attribute.failure_rate)
                        .fold(0.0f64, f64::max);
                    fired.push(Notification {
                        alert_type: "disk_scrutiny_warning".to_string(),
                        severity: Severity::Warning,
                        title: format!("Disk at risk on {}", disk.node),
                        message: format!(
                            "Disk {} ({}) on node {} shows elevated failure risk \
                             ({:.1}% annual failure rate)",
                            disk.devpath,
                            disk.model,
                            disk.node,
                            failure_rate * 100.0
                        ),
                        instance: disk.instance.clone(),
                        subject: disk.identity.clone(),
                        timestamp: now,
                        resolved: None,
                        metadata: HashMap::from([(
                            "failure_rate".to_string(),
                            format!("{:.3}", failure_rate),
                        )]),
                    });
                }
            }
        }
    }

    fn check_datastores(
        &mut self,
        snapshot: &CacheSnapshot,
        now: i64,
        fired: &mut Vec<Notification>,
    ) {
        let full_rule = self.config.datastore_full;
        let offline_rule = self.config.datastore_offline;

        for (pbs_instance, datastores) in &snapshot.datastores {
            for datastore in datastores.values() {
                if full_rule.enabled {
                    if let (Some(used), Some(total)) = (datastore.used, datastore.total) {
                        if total > 0 {
                            let used_percent = used as f64 * 100.0 / total as f64;
                            if used_percent >= full_rule.threshold {
                                let key =
                                    format!("datastore_full:{}/{}", pbs_instance, datastore.name);
                                if self.fire(&key, now, full_rule.cooldown) {
                                    fired.push(Notification {
                                        alert_type: "datastore_full".to_string(),
                                        severity: Severity::Warning,
                                        title: format!("Datastore {} almost full", datastore.name),
                                        message: format!(
                                            "Datastore {} is at {:.1}% ({} of {})",
                                            datastore.name,
                                            used_percent,
                                            HumanByte::from(used),
                                            HumanByte::from(total),
                                        ),
                                        instance: pbs_instance.clone(),
                                        subject: datastore.name.clone(),
                                        timestamp: now,
                                        resolved: None,
                                        metadata: HashMap::from([(
                                            "used_percent".to_string(),
                                            format!("{:.1}", used_percent),
                                        )]),
                                    });
                                }
                            }
                        }
                    }
                }

                if offline_rule.enabled {
                    if let Some(error) = &datastore.error {
                        let key = format!("datastore_offline:{}/{}", pbs_instance, datastore.name);
                        if self.fire(&key, now, offline_rule.cooldown) {
                            fired.push(Notification {
                                alert_type: "datastore_offline".to_string(),
                                severity: Severity::Critical,
                                title: format!("Datastore {} unavailable", datastore.name),
                                message: format!(
                                    "Datastore {} reports an error: {}",
                                    datastore.name, error
                                ),
                                instance: pbs_instance.clone(),
                                subject: datastore.name.clone(),
                                timestamp: now,
                                resolved: None,
                                metadata: HashMap::from([(
                                    "error".to_string(),
                                    error.clone(),
                                )]),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Log the alert and hand it to every provider. A provider failure
    /// never keeps the remaining providers from being tried.
    async fn dispatch(&self, notification: Notification) {
        log::info!(
            "alert {} [{}] {}: {}",
            notification.alert_type,
            notification.severity,
            notification.subject,
            notification.message
        );

        if let Err(err) = self.store.insert_alert(&notification) {
            log::error!("logging alert {} failed - {}", notification.alert_type, err);
        }

        for provider in &self.providers {
            if let Err(err) = provider.send(&notification).await {
                log::error!(
                    "provider {} failed to send {} - {}",
                    provider.name(),
                    notification.alert_type,
                    err
                );
            }
        }
    }
}
