//! Proxmox Monitor - a lightweight monitoring aggregator for a PVE/PBS
//! fleet.
//!
//! Collectors poll the configured Proxmox VE and Proxmox Backup Server
//! instances over HTTPS, evaluate disk S.M.A.R.T. health, keep the latest
//! state in a process-wide cache, persist time-series snapshots to an
//! embedded store and feed an alerter which dispatches notifications.

pub mod alerts;
pub mod api;
pub mod cache;
pub mod client;
pub mod collect;
pub mod config;
pub mod notify;
pub mod pool;
pub mod smart;
pub mod store;
