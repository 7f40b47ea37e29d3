//! Inventory loading: hosts, groups, and their variables.
//!
//! An inventory argument is either a TOML file (`[vars]`, `[groups.*]`,
//! `[hosts.*]`) or an ad-hoc SSH destination such as `root@example.org` —
//! the latter becomes a single host whose id is the argument itself.
//! Several inventory arguments merge into one inventory; later files win
//! for global variables, duplicate host or group ids are rejected.
//!
//! Variable precedence, lowest to highest: inventory globals, groups in the
//! order the host lists them, host variables. The merged map is what the
//! template engine sees.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Variable maps are JSON objects; TOML input converts losslessly for the
/// types operators actually use.
pub type VarMap = serde_json::Map<String, serde_json::Value>;

/// Marker value exposed to every template as `managed`.
pub const MANAGED_BANNER: &str = "This file is managed by bosun.";

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("cannot read inventory '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse inventory '{path}': {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },
    #[error("invalid transport url '{url}': {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[error("duplicate host id '{0}'")]
    DuplicateHost(String),
    #[error("duplicate group id '{0}'")]
    DuplicateGroup(String),
    #[error("host '{host}' references unknown group '{group}'")]
    UnknownGroup { host: String, group: String },
    #[error("unknown host '{0}'")]
    UnknownHost(String),
}

/// One target machine.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: String,
    pub url: Url,
    pub ssh_opts: Vec<String>,
    pub groups: Vec<String>,
    pub vars: VarMap,
}

/// A named set of hosts sharing variables.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub vars: VarMap,
}

/// The operator's declaration of hosts, groups, and variables.
#[derive(Debug, Default)]
pub struct Inventory {
    pub vars: VarMap,
    pub groups: BTreeMap<String, Group>,
    pub hosts: BTreeMap<String, Host>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInventory {
    #[serde(default)]
    vars: VarMap,
    #[serde(default)]
    groups: BTreeMap<String, RawGroup>,
    #[serde(default)]
    hosts: BTreeMap<String, RawHost>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    #[serde(default)]
    vars: VarMap,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHost {
    url: String,
    #[serde(default)]
    ssh_opts: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    vars: VarMap,
}

fn parse_url(spec: &str) -> Result<Url, InventoryError> {
    let text = if spec.contains("://") {
        spec.to_owned()
    } else {
        format!("ssh://{spec}")
    };
    Url::parse(&text).map_err(|source| InventoryError::Url {
        url: spec.to_owned(),
        source,
    })
}

impl Inventory {
    /// Load and merge all inventory arguments.
    ///
    /// # Errors
    /// Returns an error on unreadable or malformed files, bad urls,
    /// duplicate ids, or dangling group references.
    pub fn load(args: &[String]) -> Result<Self, InventoryError> {
        let mut inventory = Self::default();
        inventory
            .vars
            .insert("managed".to_owned(), MANAGED_BANNER.into());
        for arg in args {
            if Path::new(arg).is_file() {
                inventory.merge_file(arg)?;
            } else {
                inventory.add_adhoc(arg)?;
            }
        }
        inventory.validate()?;
        Ok(inventory)
    }

    fn merge_file(&mut self, path: &str) -> Result<(), InventoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawInventory = toml::from_str(&text).map_err(|source| InventoryError::Parse {
            path: path.to_owned(),
            source: Box::new(source),
        })?;

        self.vars.extend(raw.vars);
        for (id, group) in raw.groups {
            if self.groups.contains_key(&id) {
                return Err(InventoryError::DuplicateGroup(id));
            }
            self.groups.insert(
                id.clone(),
                Group {
                    id,
                    vars: group.vars,
                },
            );
        }
        for (id, host) in raw.hosts {
            if self.hosts.contains_key(&id) {
                return Err(InventoryError::DuplicateHost(id));
            }
            let url = parse_url(&host.url)?;
            self.hosts.insert(
                id.clone(),
                Host {
                    id,
                    url,
                    ssh_opts: host.ssh_opts,
                    groups: host.groups,
                    vars: host.vars,
                },
            );
        }
        Ok(())
    }

    fn add_adhoc(&mut self, spec: &str) -> Result<(), InventoryError> {
        if self.hosts.contains_key(spec) {
            return Err(InventoryError::DuplicateHost(spec.to_owned()));
        }
        let url = parse_url(spec)?;
        self.hosts.insert(
            spec.to_owned(),
            Host {
                id: spec.to_owned(),
                url,
                ssh_opts: Vec::new(),
                groups: Vec::new(),
                vars: VarMap::new(),
            },
        );
        Ok(())
    }

    fn validate(&self) -> Result<(), InventoryError> {
        for host in self.hosts.values() {
            for group in &host.groups {
                if !self.groups.contains_key(group) {
                    return Err(InventoryError::UnknownGroup {
                        host: host.id.clone(),
                        group: group.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve `-H a,b,c` (or everything when absent) to sorted host ids.
    ///
    /// # Errors
    /// Returns an error naming the first unknown host.
    pub fn select_hosts(&self, csv: Option<&str>) -> Result<Vec<String>, InventoryError> {
        let Some(csv) = csv else {
            return Ok(self.hosts.keys().cloned().collect());
        };
        let mut selected: Vec<String> = Vec::new();
        for id in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !self.hosts.contains_key(id) {
                return Err(InventoryError::UnknownHost(id.to_owned()));
            }
            if !selected.iter().any(|s| s == id) {
                selected.push(id.to_owned());
            }
        }
        selected.sort();
        Ok(selected)
    }

    /// The variable map a host's templates and operations see.
    #[must_use]
    pub fn effective_vars(&self, host: &Host) -> VarMap {
        let mut vars = self.vars.clone();
        for id in &host.groups {
            if let Some(group) = self.groups.get(id) {
                vars.extend(group.vars.clone());
            }
        }
        vars.extend(host.vars.clone());
        vars.insert("host_id".to_owned(), host.id.clone().into());
        vars.insert(
            "host_groups".to_owned(),
            host.groups
                .iter()
                .cloned()
                .map(serde_json::Value::from)
                .collect::<Vec<_>>()
                .into(),
        );
        vars
    }
}
