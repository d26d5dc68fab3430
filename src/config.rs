use crate::cli::CliArgs;
use crate::model::{Capabilities, ServerTarget};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    servers: Vec<ServerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerSpec {
    name: String,
    address: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_true")]
    status: bool,
    #[serde(default = "default_true", alias = "replicationInfo")]
    replication_info: bool,
    #[serde(default = "default_true", alias = "replicaSet")]
    replica_set: bool,
    #[serde(default = "default_true")]
    operations: bool,
    #[serde(default = "default_true", alias = "replicationOperations")]
    replication_operations: bool,
}

fn default_true() -> bool {
    true
}

impl ServerSpec {
    fn into_target(self) -> ServerTarget {
        let mut target = ServerTarget::new(self.name, self.address);
        target.username = self.username;
        target.password = self.password;
        target.capabilities = Capabilities {
            status: self.status,
            replication_info: self.replication_info,
            replica_set: self.replica_set,
            operations: self.operations,
            replication_operations: self.replication_operations,
        };
        target
    }
}

pub fn load_config(explicit: Option<&PathBuf>) -> Result<ConfigFile> {
    let path = match explicit {
        Some(path) => Some(path.clone()),
        None => discover_config_path(),
    };
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let parsed: ConfigFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(parsed)
}

/// Turns the CLI host list and the config file into the set of servers to
/// poll. A positional host that matches a configured server by name or
/// address takes that server's credentials and capability flags; anything
/// else is polled ad hoc with the CLI credentials. With no hosts and no
/// config the default is a local server.
pub fn resolve_targets(args: &CliArgs, config: ConfigFile) -> Vec<ServerTarget> {
    let configured: Vec<ServerTarget> = config
        .servers
        .into_iter()
        .map(ServerSpec::into_target)
        .collect();

    if args.hosts.is_empty() {
        if !configured.is_empty() {
            return configured;
        }
        let mut target = ServerTarget::new("localhost", "localhost:27017");
        target.username = args.username.clone();
        target.password = args.password.clone();
        return vec![target];
    }

    args.hosts
        .iter()
        .map(|host| {
            configured
                .iter()
                .find(|target| target.name == *host || target.address == *host)
                .cloned()
                .unwrap_or_else(|| {
                    let mut target = ServerTarget::new(host.clone(), host.clone());
                    target.username = args.username.clone();
                    target.password = args.password.clone();
                    target
                })
        })
        .collect()
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MONTOP_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("montop.yaml"),
        PathBuf::from("montop.yml"),
        PathBuf::from(".montop.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/montop/config.yaml"),
            PathBuf::from(&home).join(".config/montop/config.yml"),
            PathBuf::from(&home).join(".montop.yaml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_hosts(hosts: &[&str]) -> CliArgs {
        CliArgs {
            hosts: hosts.iter().map(|host| host.to_string()).collect(),
            refresh_ms: 1000,
            config: None,
            username: None,
            password: None,
            auto_kill: None,
            log_filter: "info".to_string(),
            shell_bin: "mongosh".to_string(),
        }
    }

    fn sample_config() -> ConfigFile {
        serde_yaml::from_str(
            r#"
servers:
  - name: primary
    address: db1.internal:27017
    username: monitor
    password: hunter2
    replicationOperations: false
  - name: arbiter
    address: db2.internal:27017
    operations: false
    status: false
"#,
        )
        .unwrap()
    }

    #[test]
    fn capability_flags_default_to_enabled() {
        let config = sample_config();
        let targets = resolve_targets(&args_with_hosts(&[]), config);
        assert_eq!(targets.len(), 2);
        assert!(targets[0].capabilities.operations);
        assert!(!targets[0].capabilities.replication_operations);
        assert!(!targets[1].capabilities.operations);
        assert!(targets[1].capabilities.replica_set);
    }

    #[test]
    fn positional_host_matches_configured_server_by_name() {
        let targets = resolve_targets(&args_with_hosts(&["primary"]), sample_config());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address, "db1.internal:27017");
        assert_eq!(targets[0].username.as_deref(), Some("monitor"));
    }

    #[test]
    fn positional_host_matches_configured_server_by_address() {
        let targets = resolve_targets(&args_with_hosts(&["db2.internal:27017"]), sample_config());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "arbiter");
    }

    #[test]
    fn unmatched_host_becomes_ad_hoc_target_with_cli_credentials() {
        let mut args = args_with_hosts(&["db9.internal:27017"]);
        args.username = Some("ops".to_string());
        let targets = resolve_targets(&args, sample_config());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "db9.internal:27017");
        assert_eq!(targets[0].username.as_deref(), Some("ops"));
        assert!(targets[0].capabilities.operations);
    }

    #[test]
    fn no_hosts_and_no_config_falls_back_to_localhost() {
        let targets = resolve_targets(&args_with_hosts(&[]), ConfigFile::default());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address, "localhost:27017");
    }
}
