//! App and instance tables loaded from JSON files at startup.

use log::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

/// Key of the instance entry that allows any instance.
pub const WILDCARD_INSTANCE: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AppEntry {
    pub secret: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEntry {
    /// Address the upstream socket is opened against instead of the public instance URL.
    #[serde(default)]
    pub replace_url: Option<String>,
}

/// Client apps allowed to register, keyed by app id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppTable {
    apps: HashMap<String, AppEntry>,
}

impl AppTable {
    pub fn new(apps: HashMap<String, AppEntry>) -> Self {
        Self { apps }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let table = Self::from_json(&read(path)?).map_err(|e| LoadError::parse(path, e))?;
        info!("Loaded {} app(s) from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn get(&self, app_id: &str) -> Option<&AppEntry> {
        self.apps.get(app_id)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// Upstream instances that may be connected to, keyed by lowercased instance URL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceTable {
    instances: HashMap<String, InstanceEntry>,
}

impl InstanceTable {
    pub fn new(instances: HashMap<String, InstanceEntry>) -> Self {
        Self {
            instances: instances
                .into_iter()
                .map(|(url, entry)| (url.to_lowercase(), entry))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let table = Self::from_json(&read(path)?).map_err(|e| LoadError::parse(path, e))?;
        info!(
            "Loaded {} instance entr{} from {}{}",
            table.len(),
            if table.len() == 1 { "y" } else { "ies" },
            path.display(),
            if table.allows_any() {
                " (wildcard enabled)"
            } else {
                ""
            }
        );
        Ok(table)
    }

    /// Exact entry for `instance_url`, ignoring case. The wildcard is not consulted.
    pub fn get(&self, instance_url: &str) -> Option<&InstanceEntry> {
        self.instances.get(&instance_url.to_lowercase())
    }

    pub fn allows_any(&self) -> bool {
        self.instances.contains_key(WILDCARD_INSTANCE)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|e| LoadError {
        path: path.to_path_buf(),
        source: Box::new(e),
    })
}

/// Failure to read or parse one of the table files.
#[derive(Debug)]
pub struct LoadError {
    pub path: PathBuf,
    pub source: Box<dyn StdError + Send + Sync>,
}

impl LoadError {
    fn parse(path: &Path, err: serde_json::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source: Box::new(err),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Failed to load table {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl StdError for LoadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}
