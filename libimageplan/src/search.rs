//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Client side search index over the installed packages.

use crate::filter::Filter;
use crate::fmri::Fmri;
use crate::manifest::{Manifest, ManifestError};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("search index not found at {0}")]
    #[diagnostic(
        code(ips::index_error::missing),
        help("The index is rebuilt automatically on the next package operation")
    )]
    Missing(PathBuf),

    #[error("search index is out of date: {} not indexed, {} stale", missing.len(), extra.len())]
    #[diagnostic(code(ips::index_error::inconsistent))]
    Inconsistent {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("I/O error on search index {path}: {source}")]
    #[diagnostic(
        code(ips::index_error::io),
        help("Check that the image metadata directory is writable")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("search index JSON error: {0}")]
    #[diagnostic(code(ips::index_error::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One package transition to fold into the index.
#[derive(Debug, Clone, Default)]
pub struct IndexUpdate {
    pub dest_fmri: Option<Fmri>,
    pub dest_path: Option<PathBuf>,
    pub origin_fmri: Option<Fmri>,
    pub origin_path: Option<PathBuf>,
}

/// Operations the image plan needs from a search index.
pub trait SearchIndex {
    /// Fail if the index does not describe exactly the `installed` set.
    /// With `force_rebuild` the index is rebuilt instead of checked.
    fn check_index(&self, installed: &[(Fmri, PathBuf)], force_rebuild: bool) -> Result<()>;

    /// Apply package transitions incrementally.
    fn client_update_index(&self, filters: &[Filter], updates: &[IndexUpdate]) -> Result<()>;

    /// Throw the index away and index every installed manifest again.
    fn rebuild_search_index(&self, filters: &[Filter], installed: &[(Fmri, PathBuf)]) -> Result<()>;
}

/// On-disk index data
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
struct IndexData {
    /// Maps search terms to package FMRIs
    terms: BTreeMap<String, BTreeSet<String>>,
    /// Maps package FMRIs to package names
    packages: BTreeMap<String, String>,
    /// Last updated timestamp
    updated: u64,
}

impl IndexData {
    fn add_term(&mut self, term: &str, fmri: &str) {
        // Convert term to lowercase for case-insensitive search
        self.terms
            .entry(term.to_lowercase())
            .or_default()
            .insert(fmri.to_string());
    }

    fn add_package(&mut self, fmri: &Fmri, manifest: &Manifest, filters: &[Filter]) {
        let key = fmri.to_string();
        self.packages.insert(key.clone(), fmri.stem().to_string());
        self.add_term(fmri.stem(), &key);
        for action in manifest.gen_actions(filters) {
            for entry in action.generate_indices() {
                self.add_term(&entry.token, &key);
            }
        }
    }

    fn remove_package(&mut self, fmri: &Fmri) {
        let key = fmri.to_string();
        self.packages.remove(&key);
        self.terms.retain(|_, set| {
            set.remove(&key);
            !set.is_empty()
        });
    }

    fn touch(&mut self) {
        self.updated = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }

    /// Packages matching every whitespace separated term of `query`.
    fn search(&self, query: &str, limit: Option<usize>) -> Vec<String> {
        let query = query.to_lowercase();
        let mut result: Option<BTreeSet<String>> = None;
        for term in query.split_whitespace() {
            let packages = match self.terms.get(term) {
                Some(p) => p,
                None => return Vec::new(),
            };
            result = Some(match result {
                None => packages.clone(),
                Some(rs) => rs.intersection(packages).cloned().collect(),
            });
        }
        let mut results: Vec<String> = result.unwrap_or_default().into_iter().collect();
        if let Some(max_results) = limit {
            results.truncate(max_results);
        }
        results
    }
}

/// JSON token index stored in a directory of the image metadata.
#[derive(Debug, Clone)]
pub struct LocalIndex {
    dir: PathBuf,
}

impl LocalIndex {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        LocalIndex { dir: dir.into() }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("search.json")
    }

    fn load(&self) -> Result<IndexData> {
        let path = self.index_path();
        if !path.exists() {
            return Err(IndexError::Missing(path));
        }
        let json = fs::read_to_string(&path).map_err(|source| IndexError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, data: &IndexData) -> Result<()> {
        let path = self.index_path();
        fs::create_dir_all(&self.dir).map_err(|source| IndexError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let json = serde_json::to_string(data)?;
        fs::write(&path, json).map_err(|source| IndexError::Io { path, source })
    }

    /// Package FMRIs whose indexed content matches all terms of `query`.
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<String>> {
        Ok(self.load()?.search(query, limit))
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    Ok(Manifest::parse_file(path)?)
}

impl SearchIndex for LocalIndex {
    fn check_index(&self, installed: &[(Fmri, PathBuf)], force_rebuild: bool) -> Result<()> {
        if force_rebuild {
            return self.rebuild_search_index(&[], installed);
        }
        let data = self.load()?;
        let wanted: BTreeSet<String> = installed.iter().map(|(f, _)| f.to_string()).collect();
        let missing: Vec<String> = wanted
            .iter()
            .filter(|f| !data.packages.contains_key(*f))
            .cloned()
            .collect();
        let extra: Vec<String> = data
            .packages
            .keys()
            .filter(|f| !wanted.contains(*f))
            .cloned()
            .collect();
        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }
        Err(IndexError::Inconsistent { missing, extra })
    }

    fn client_update_index(&self, filters: &[Filter], updates: &[IndexUpdate]) -> Result<()> {
        let mut data = self.load()?;
        for update in updates {
            if let Some(origin) = &update.origin_fmri {
                data.remove_package(origin);
            }
            if let (Some(fmri), Some(path)) = (&update.dest_fmri, &update.dest_path) {
                let manifest = load_manifest(path)?;
                data.add_package(fmri, &manifest, filters);
            }
        }
        data.touch();
        debug!(updates = updates.len(), "search index updated");
        self.save(&data)
    }

    fn rebuild_search_index(&self, filters: &[Filter], installed: &[(Fmri, PathBuf)]) -> Result<()> {
        info!(packages = installed.len(), dir = ?self.dir, "rebuilding search index");
        let mut data = IndexData::default();
        for (fmri, path) in installed {
            let manifest = load_manifest(path)?;
            data.add_package(fmri, &manifest, filters);
        }
        data.touch();
        self.save(&data)
    }
}
