// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::ScriptError;

pub const ENUMERATE: &str = "enumlog";
pub const PUSH: &str = "pushlog";
pub const REMOVE: &str = "removelog";

/// Placeholder in the enumeration script replaced with the logset document.
pub const LOGSETS_PLACEHOLDER: &str = "%%LOGSETS%%";

const REQUIRED: [&str; 3] = [ENUMERATE, PUSH, REMOVE];

/// The scripts run on fleet hosts, keyed by file stem.
#[derive(Debug, Clone)]
pub struct Scripts {
    scripts: HashMap<String, Arc<str>>,
}

impl Scripts {
    pub fn load(dir: &Path) -> Result<Self, ScriptError> {
        let io_err = |source| ScriptError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut scripts = HashMap::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let stem = stem.to_string();
            let text = std::fs::read_to_string(&path).map_err(|source| ScriptError::Io {
                path: path.clone(),
                source,
            })?;
            debug!(script = %stem, path = %path.display(), "loaded script");
            if scripts.insert(stem.clone(), text).is_some() {
                return Err(ScriptError::Duplicate(stem));
            }
        }
        Self::from_map(scripts)
    }

    pub fn from_map(scripts: HashMap<String, String>) -> Result<Self, ScriptError> {
        if let Some(missing) = REQUIRED
            .into_iter()
            .find(|name| !scripts.contains_key(*name))
        {
            return Err(ScriptError::Missing(missing));
        }
        Ok(Scripts {
            scripts: scripts
                .into_iter()
                .map(|(name, text)| (name, Arc::from(text)))
                .collect(),
        })
    }

    fn get(&self, name: &str) -> Arc<str> {
        self.scripts.get(name).cloned().unwrap_or_else(|| Arc::from(""))
    }

    /// Enumeration script with the logset document substituted in.
    pub fn enumerate(&self, logsets: &str) -> Arc<str> {
        Arc::from(self.get(ENUMERATE).replace(LOGSETS_PLACEHOLDER, logsets))
    }

    pub fn push(&self) -> Arc<str> {
        self.get(PUSH)
    }

    pub fn remove(&self) -> Arc<str> {
        self.get(REMOVE)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
