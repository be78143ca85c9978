//! Sandbox policy and access checks
//!
//! A [`SandboxPolicy`] is the full declaration of what one plugin's sandbox
//! may do: its isolation level, capability strings, resource limits, and
//! the network and filesystem allow-lists. The checks here are pure so the
//! host and the worker process evaluate them identically.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// How strongly plugin code is separated from the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// In-process, unrestricted import surface
    None,
    /// Separate `sandbox-worker` process with a cleared environment
    Process,
    /// In-process WebAssembly with only the declared imports
    #[default]
    Vm,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Process => "process",
            Self::Vm => "vm",
        })
    }
}

/// Declared limits and capabilities of a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Isolation level
    pub isolation_level: IsolationLevel,
    /// Granted capability strings
    pub permissions: BTreeSet<String>,
    /// Maximum guest linear memory (bytes)
    pub memory_limit: u64,
    /// CPU share of one core (percent), reported against in stats
    pub cpu_limit: f32,
    /// Wall-clock limit per execution or hook
    #[serde(with = "duration_ms")]
    pub time_limit: Duration,
    /// Whether any network access may be granted
    pub allow_network: bool,
    /// Host allow-list; `*.domain` matches sub-domains of `domain`
    pub allowed_hosts: Vec<String>,
    /// Port allow-list; empty means any port
    pub allowed_ports: Vec<u16>,
    /// Whether any filesystem access may be granted
    pub allow_file_system: bool,
    /// Path allow-list; entries ending in `/*` match by prefix
    pub allowed_paths: Vec<String>,
    /// Deny all writes
    pub read_only: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            permissions: BTreeSet::new(),
            memory_limit: 64 * 1024 * 1024, // 64MB
            cpu_limit: 100.0,
            time_limit: Duration::from_secs(5),
            allow_network: false,
            allowed_hosts: Vec::new(),
            allowed_ports: Vec::new(),
            allow_file_system: false,
            allowed_paths: Vec::new(),
            read_only: true,
        }
    }
}

impl SandboxPolicy {
    /// Policy with every access check granted, used for isolation level `none`
    pub fn unrestricted(time_limit: Duration) -> Self {
        Self {
            isolation_level: IsolationLevel::None,
            memory_limit: u64::MAX,
            time_limit,
            allow_network: true,
            allowed_hosts: vec!["*".to_string()],
            allow_file_system: true,
            allowed_paths: vec!["/*".to_string()],
            read_only: false,
            ..Self::default()
        }
    }

    pub fn check_permission(&self, name: &str) -> bool {
        self.permissions.contains(name)
    }

    pub fn validate_network_access(&self, host: &str, port: u16) -> bool {
        if !self.allow_network {
            return false;
        }
        let host_allowed = self
            .allowed_hosts
            .iter()
            .any(|entry| host_matches(entry, host));
        let port_allowed = self.allowed_ports.is_empty() || self.allowed_ports.contains(&port);
        host_allowed && port_allowed
    }

    pub fn validate_file_system_access(&self, path: &str, write: bool) -> bool {
        if !self.allow_file_system || (self.read_only && write) {
            return false;
        }
        if Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return false;
        }
        self.allowed_paths
            .iter()
            .any(|entry| path_matches(entry, path))
    }
}

fn host_matches(entry: &str, host: &str) -> bool {
    if entry == "*" {
        return true;
    }
    match entry.strip_prefix('*') {
        // "*.example.com" keeps the leading dot, so the bare domain is excluded
        Some(suffix) if suffix.starts_with('.') => {
            host.len() > suffix.len()
                && host
                    .to_ascii_lowercase()
                    .ends_with(&suffix.to_ascii_lowercase())
        }
        _ => entry.eq_ignore_ascii_case(host),
    }
}

fn path_matches(entry: &str, path: &str) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => path.starts_with(prefix),
        _ => entry == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_policy() -> SandboxPolicy {
        SandboxPolicy {
            allow_network: true,
            allowed_hosts: vec!["api.example.com".into(), "*.internal.net".into()],
            allowed_ports: vec![443],
            ..SandboxPolicy::default()
        }
    }

    #[test]
    fn network_denied_when_disabled() {
        let policy = SandboxPolicy {
            allow_network: false,
            ..network_policy()
        };
        assert!(!policy.validate_network_access("api.example.com", 443));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let policy = network_policy();
        assert!(policy.validate_network_access("db.internal.net", 443));
        assert!(policy.validate_network_access("a.b.internal.net", 443));
        assert!(!policy.validate_network_access("internal.net", 443));
        assert!(!policy.validate_network_access("evilinternal.net", 443));
        assert!(policy.validate_network_access("API.example.com", 443));
    }

    #[test]
    fn port_list_restricts_when_present() {
        let policy = network_policy();
        assert!(!policy.validate_network_access("api.example.com", 80));

        let any_port = SandboxPolicy {
            allowed_ports: Vec::new(),
            ..network_policy()
        };
        assert!(any_port.validate_network_access("api.example.com", 8080));
    }

    #[test]
    fn filesystem_rules() {
        let policy = SandboxPolicy {
            allow_file_system: true,
            allowed_paths: vec!["/data/*".into(), "/etc/app.conf".into()],
            read_only: true,
            ..SandboxPolicy::default()
        };
        assert!(policy.validate_file_system_access("/data/reports/q1.csv", false));
        assert!(policy.validate_file_system_access("/etc/app.conf", false));
        assert!(!policy.validate_file_system_access("/etc/app.conf.bak", false));
        assert!(!policy.validate_file_system_access("/data/../etc/shadow", false));
        assert!(!policy.validate_file_system_access("/data/out.csv", true), "read-only denies writes");

        let writable = SandboxPolicy {
            read_only: false,
            ..policy
        };
        assert!(writable.validate_file_system_access("/data/out.csv", true));
    }

    #[test]
    fn unrestricted_grants_everything_but_permissions() {
        let policy = SandboxPolicy::unrestricted(Duration::from_secs(1));
        assert!(policy.validate_network_access("anything.org", 22));
        assert!(policy.validate_file_system_access("/var/tmp/x", true));
        assert!(!policy.check_permission("db.read"));
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: SandboxPolicy =
            serde_json::from_str(r#"{"isolation_level":"process","time_limit":250}"#)
                .expect("valid policy");
        assert_eq!(policy.isolation_level, IsolationLevel::Process);
        assert_eq!(policy.time_limit, Duration::from_millis(250));
        assert_eq!(policy.memory_limit, 64 * 1024 * 1024);
    }
}
