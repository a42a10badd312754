// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Static route matching: message domain → cluster name.

use std::sync::Arc;

use sip_msg::MessageMetadata;
use smol_str::SmolStr;

use crate::config::RouteConfig;

/// Immutable route entry selected by the matcher.
#[derive(Debug)]
pub struct RouteEntry {
    domain: SmolStr,
    cluster: SmolStr,
    metadata_match: Vec<(SmolStr, SmolStr)>,
}

impl RouteEntry {
    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }

    pub fn metadata_match(&self) -> &[(SmolStr, SmolStr)] {
        &self.metadata_match
    }

    fn matches(&self, meta: &MessageMetadata) -> bool {
        if self.domain == "*" {
            return true;
        }
        meta.domain() == Some(self.domain.as_str())
    }
}

/// First-match route table built once from configuration.
#[derive(Debug, Default)]
pub struct RouteMatcher {
    routes: Vec<Arc<RouteEntry>>,
}

impl RouteMatcher {
    pub fn new(config: &RouteConfig) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|route| {
                Arc::new(RouteEntry {
                    domain: SmolStr::new(&route.domain),
                    cluster: SmolStr::new(&route.cluster),
                    metadata_match: route
                        .metadata_match
                        .iter()
                        .map(|(k, v)| (SmolStr::new(k), SmolStr::new(v)))
                        .collect(),
                })
            })
            .collect();
        Self { routes }
    }

    /// Returns the first route whose domain matches the message.
    pub fn route(&self, meta: &MessageMetadata) -> Option<Arc<RouteEntry>> {
        self.routes
            .iter()
            .find(|route| route.matches(meta))
            .cloned()
    }
}
