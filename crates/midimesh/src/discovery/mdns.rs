// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mDNS / DNS-SD discovery backend.
//!
//! Advertises `_midi-network._tcp.local.` with the node's identity in TXT
//! records and browses the same type, resolving events into
//! [`PeerRecord`]s. Liveness comes from the mDNS daemon itself
//! (`ServiceRemoved` events); there is no lease scan here.
//!
//! A failure to reach the mDNS stack surfaces as
//! `DiscoveryBackendUnavailable` and leaves the fallback mechanism free to
//! carry discovery alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;

use crate::config::{DiscoveryConfig, MDNS_SERVICE_TYPE, PROTOCOL_VERSION};
use crate::core::{MeshError, NodeId};
use crate::transport::iface;

use super::{DiscoveredFn, Discovery, PeerRecord, RemovedFn};

/// Registered browse callbacks; held while invoking so events serialize.
type Callbacks = Mutex<Option<(DiscoveredFn, RemovedFn)>>;

/// mDNS backend.
pub struct MdnsDiscovery {
    config: DiscoveryConfig,
    node_id: NodeId,
    device_count: Arc<AtomicU16>,
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<Option<String>>,
    callbacks: Arc<Callbacks>,
    /// Resolved instances by fullname, for mapping removal events back to
    /// node ids.
    known: Arc<Mutex<HashMap<String, NodeId>>>,
    browsing: Arc<AtomicBool>,
    browse_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsDiscovery {
    /// Backend for the given local node.
    #[must_use]
    pub fn new(node_id: NodeId, config: DiscoveryConfig) -> Self {
        Self {
            config,
            node_id,
            device_count: Arc::new(AtomicU16::new(0)),
            daemon: Mutex::new(None),
            registered: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(None)),
            known: Arc::new(Mutex::new(HashMap::new())),
            browsing: Arc::new(AtomicBool::new(false)),
            browse_handle: Mutex::new(None),
        }
    }

    /// Get or create the shared daemon handle.
    fn daemon(&self) -> Result<ServiceDaemon, MeshError> {
        let mut guard = self.daemon.lock();
        if let Some(daemon) = guard.as_ref() {
            return Ok(daemon.clone());
        }
        let daemon = ServiceDaemon::new()
            .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?;
        *guard = Some(daemon.clone());
        Ok(daemon)
    }

    /// Service registration reflecting the current device count.
    fn service_info(&self) -> Result<ServiceInfo, MeshError> {
        let uuid = self.node_id.to_string();
        let hostname = iface::local_hostname();
        let host = format!("{}.local.", hostname.trim_end_matches(".local."));
        let devices = self.device_count.load(Ordering::Relaxed).to_string();
        let http_port = self.config.http_port.to_string();
        let udp_port = self.config.udp_port.to_string();
        let version = PROTOCOL_VERSION.to_string();

        let properties = [
            ("uuid", uuid.as_str()),
            ("http_port", http_port.as_str()),
            ("udp_port", udp_port.as_str()),
            ("hostname", hostname.as_str()),
            ("version", version.as_str()),
            ("devices", devices.as_str()),
        ];

        ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            &self.config.node_name,
            &host,
            "",
            self.config.udp_port,
            &properties[..],
        )
        .map(|info| info.enable_addr_auto())
        .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))
    }

    fn browse_loop(
        receiver: &mdns_sd::Receiver<ServiceEvent>,
        local_uuid: String,
        known: &Mutex<HashMap<String, NodeId>>,
        callbacks: &Callbacks,
        browsing: &AtomicBool,
    ) {
        loop {
            // stop_browse() closes the event stream with a SearchStopped,
            // so a blocking recv stays shutdown-responsive.
            let event = match receiver.recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            if !browsing.load(Ordering::Relaxed) {
                break;
            }

            match event {
                ServiceEvent::SearchStopped(_) => break,
                ServiceEvent::ServiceResolved(info) => {
                    let Some(peer) = peer_from_service(&info) else {
                        continue;
                    };
                    if peer.node_id.to_string() == local_uuid {
                        continue; // self-discovery
                    }

                    let fullname = info.get_fullname().to_string();
                    let is_new = known.lock().insert(fullname, peer.node_id).is_none();
                    if is_new {
                        log::debug!(
                            "[MDNS] resolved instance={} node={} addr={}",
                            info.get_fullname(),
                            peer.node_id,
                            peer.ip
                        );
                        let guard = callbacks.lock();
                        if let Some((on_discovered, _)) = guard.as_ref() {
                            on_discovered(peer);
                        }
                    }
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    let removed = known.lock().remove(&fullname);
                    if let Some(node_id) = removed {
                        log::debug!("[MDNS] removed instance={} node={}", fullname, node_id);
                        let guard = callbacks.lock();
                        if let Some((_, on_removed)) = guard.as_ref() {
                            on_removed(node_id);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl Discovery for MdnsDiscovery {
    fn start_advertising(&self) -> Result<(), MeshError> {
        let daemon = self.daemon()?;
        let info = self.service_info()?;
        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?;
        *self.registered.lock() = Some(fullname.clone());
        log::debug!("[MDNS] advertising {}", fullname);
        Ok(())
    }

    fn stop_advertising(&self) {
        let fullname = self.registered.lock().take();
        if let (Some(fullname), Some(daemon)) = (fullname, self.daemon.lock().as_ref()) {
            if let Err(e) = daemon.unregister(&fullname) {
                log::debug!("[MDNS] unregister {} failed: {}", fullname, e);
            }
        }
    }

    fn start_browsing(
        &self,
        on_discovered: DiscoveredFn,
        on_removed: RemovedFn,
    ) -> Result<(), MeshError> {
        if self.browsing.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        *self.callbacks.lock() = Some((on_discovered, on_removed));

        let daemon = match self.daemon() {
            Ok(daemon) => daemon,
            Err(e) => {
                self.browsing.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        let receiver = match daemon.browse(MDNS_SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                self.browsing.store(false, Ordering::Relaxed);
                return Err(MeshError::DiscoveryBackendUnavailable(e.to_string()));
            }
        };

        let handle = {
            let local_uuid = self.node_id.to_string();
            let known = Arc::clone(&self.known);
            let callbacks = Arc::clone(&self.callbacks);
            let browsing = Arc::clone(&self.browsing);
            std::thread::Builder::new()
                .name("midimesh-browse".to_string())
                .spawn(move || {
                    Self::browse_loop(&receiver, local_uuid, &known, &callbacks, &browsing);
                })
                .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?
        };
        *self.browse_handle.lock() = Some(handle);
        log::debug!("[MDNS] browsing {}", MDNS_SERVICE_TYPE);
        Ok(())
    }

    fn stop_browsing(&self) {
        self.browsing.store(false, Ordering::Relaxed);
        if let Some(daemon) = self.daemon.lock().as_ref() {
            let _ = daemon.stop_browse(MDNS_SERVICE_TYPE);
        }
        if let Some(handle) = self.browse_handle.lock().take() {
            let _ = handle.join();
        }
        *self.callbacks.lock() = None;
        self.known.lock().clear();
    }

    fn update_device_count(&self, devices: u16) {
        self.device_count.store(devices, Ordering::Relaxed);

        // Refresh the TXT record by re-registering; a brief service blip
        // is the documented cost.
        if self.registered.lock().is_some() {
            match (self.daemon.lock().as_ref(), self.service_info()) {
                (Some(daemon), Ok(info)) => {
                    if let Err(e) = daemon.register(info) {
                        log::debug!("[MDNS] TXT refresh failed: {}", e);
                    }
                }
                (_, Err(e)) => log::debug!("[MDNS] TXT refresh failed: {}", e),
                (None, Ok(_)) => {}
            }
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_browsing();
        if let Some(daemon) = self.daemon.lock().take() {
            let _ = daemon.shutdown();
        }
    }
}

/// Turn a resolved service into a peer record.
///
/// TXT values are UTF-8 decimal text; a missing or unparsable `uuid` makes
/// the whole record unusable, everything else degrades to defaults.
fn peer_from_service(info: &ServiceInfo) -> Option<PeerRecord> {
    let properties = info.get_properties();
    let node_id: NodeId = properties.get_property_val_str("uuid")?.parse().ok()?;

    let ip = info.get_addresses().iter().next().copied()?;
    let name = info
        .get_fullname()
        .strip_suffix(MDNS_SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(info.get_fullname())
        .to_string();

    let parse_port = |key: &str| {
        properties
            .get_property_val_str(key)
            .and_then(|v| v.parse::<u16>().ok())
    };

    Some(PeerRecord {
        node_id,
        name,
        hostname: properties
            .get_property_val_str("hostname")
            .unwrap_or(info.get_hostname())
            .to_string(),
        ip,
        http_port: parse_port("http_port").unwrap_or(0),
        udp_port: parse_port("udp_port").unwrap_or_else(|| info.get_port()),
        protocol_version: properties
            .get_property_val_str("version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(PROTOCOL_VERSION),
        device_count: parse_port("devices").unwrap_or(0),
        last_seen: std::time::Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_info(uuid: &str) -> ServiceInfo {
        let properties = [
            ("uuid", uuid),
            ("http_port", "8080"),
            ("udp_port", "5004"),
            ("hostname", "studio-a"),
            ("version", "1"),
            ("devices", "3"),
        ];
        ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            "studio-a",
            "studio-a.local.",
            "192.168.1.5",
            5004,
            &properties[..],
        )
        .expect("service info should build")
    }

    #[test]
    fn test_service_type_constant() {
        assert!(MDNS_SERVICE_TYPE.starts_with("_midi-network._tcp"));
        assert!(MDNS_SERVICE_TYPE.ends_with(".local."));
    }

    #[test]
    fn test_peer_from_service() {
        let id = NodeId::generate();
        let info = resolved_info(&id.to_string());
        let peer = peer_from_service(&info).expect("record should build");

        assert_eq!(peer.node_id, id);
        assert_eq!(peer.name, "studio-a");
        assert_eq!(peer.hostname, "studio-a");
        assert_eq!(peer.http_port, 8080);
        assert_eq!(peer.udp_port, 5004);
        assert_eq!(peer.protocol_version, 1);
        assert_eq!(peer.device_count, 3);
        assert_eq!(peer.ip.to_string(), "192.168.1.5");
    }

    #[test]
    fn test_peer_from_service_rejects_bad_uuid() {
        let info = resolved_info("not-a-uuid");
        assert!(peer_from_service(&info).is_none());
    }

    #[test]
    fn test_local_service_info_txt() {
        let node = NodeId::generate();
        let config = DiscoveryConfig::new("unit-node", 8080, 5004);
        let disc = MdnsDiscovery::new(node, config);
        disc.update_device_count(2);

        let info = disc.service_info().expect("service info should build");
        let properties = info.get_properties();
        assert_eq!(
            properties.get_property_val_str("uuid"),
            Some(node.to_string().as_str())
        );
        assert_eq!(properties.get_property_val_str("udp_port"), Some("5004"));
        assert_eq!(properties.get_property_val_str("devices"), Some("2"));
        assert!(info.get_fullname().contains("unit-node"));
    }
}
