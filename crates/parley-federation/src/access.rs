//! Access control: which remote servers may federate with us at all.
//!
//! Consulted before any dialback work is done, in both directions.

use std::collections::HashSet;

use parley_common::{
    config::{FederationPolicyConfig, PermissionPolicy},
    domain,
};

/// Gate deciding whether `hostname` may attempt server-to-server traffic.
pub trait AccessPolicy: Send + Sync {
    fn is_allowed(&self, hostname: &str) -> bool;
}

/// Permits every remote server.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_allowed(&self, _hostname: &str) -> bool {
        true
    }
}

/// Blacklist / whitelist policy from configuration. Entries match exactly,
/// after normalization.
#[derive(Debug, Clone)]
pub struct ListAccessPolicy {
    policy: PermissionPolicy,
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
}

impl ListAccessPolicy {
    pub fn new(
        policy: PermissionPolicy,
        blacklist: impl IntoIterator<Item = String>,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            policy,
            blacklist: blacklist.into_iter().map(|h| domain::normalize(&h)).collect(),
            whitelist: whitelist.into_iter().map(|h| domain::normalize(&h)).collect(),
        }
    }

    pub fn from_config(cfg: &FederationPolicyConfig) -> Self {
        Self::new(cfg.permission_policy, cfg.blacklist.clone(), cfg.whitelist.clone())
    }
}

impl AccessPolicy for ListAccessPolicy {
    fn is_allowed(&self, hostname: &str) -> bool {
        let hostname = domain::normalize(hostname);
        if self.blacklist.contains(&hostname) {
            return false;
        }
        match self.policy {
            PermissionPolicy::Blacklist => true,
            PermissionPolicy::Whitelist => self.whitelist.contains(&hostname),
        }
    }
}
