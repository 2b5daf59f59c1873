// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared test fixtures.

use std::collections::HashMap;
use std::sync::Mutex;

use midimesh::{DeviceId, NodeId, PeerRouter};

/// Fixed routing table standing in for the external router collaborator.
pub struct StaticRouter {
    routes: Mutex<HashMap<NodeId, (String, u16)>>,
}

// Not every test crate uses every helper.
#[allow(dead_code)]
impl StaticRouter {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, node: NodeId, host: &str, port: u16) {
        self.routes
            .lock()
            .expect("router lock")
            .insert(node, (host.to_string(), port));
    }
}

impl PeerRouter for StaticRouter {
    fn route(&self, dest_node: NodeId, _device_id: DeviceId) -> Option<(String, u16)> {
        self.routes
            .lock()
            .expect("router lock")
            .get(&dest_node)
            .cloned()
    }
}
