//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{Catalog, ManifestSource, RepositoryError, Result, Transport};
use crate::digest::{Digest, DigestAlgorithm, DigestSource};
use crate::fmri::Fmri;
use crate::manifest::Manifest;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A repository held entirely in memory.
///
/// Packages are keyed by stem and version; the publisher of a requested
/// FMRI is only checked when both sides carry one.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    packages: BTreeMap<String, Vec<Arc<Manifest>>>,
    payloads: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository::default()
    }

    /// Publish a manifest. It must name its package.
    pub fn add_manifest(&mut self, manifest: Manifest) -> Result<Fmri> {
        let fmri = manifest
            .fmri
            .clone()
            .ok_or_else(|| RepositoryError::NotFound("manifest without pkg.fmri".to_string()))?;
        let versions = self.packages.entry(fmri.stem().to_string()).or_default();
        versions.retain(|m| m.fmri.as_ref().map(|f| f.version != fmri.version).unwrap_or(true));
        versions.push(Arc::new(manifest));
        versions.sort_by(|a, b| {
            let va = a.fmri.as_ref().and_then(|f| f.version.clone());
            let vb = b.fmri.as_ref().and_then(|f| f.version.clone());
            va.cmp(&vb)
        });
        Ok(fmri)
    }

    /// Publish a manifest given in text form.
    pub fn publish(&mut self, text: &str) -> Result<Fmri> {
        let manifest = Manifest::parse_string(text)?;
        self.add_manifest(manifest)
    }

    /// Store content and return its primary hash.
    pub fn add_payload(&mut self, content: &[u8]) -> String {
        let digest = Digest::from_bytes(content, DigestAlgorithm::SHA1, DigestSource::PrimaryPayloadHash);
        self.payloads.insert(digest.hash.clone(), content.to_vec());
        digest.hash
    }

    /// Store content under an arbitrary hash, e.g. to simulate corruption.
    pub fn add_raw_payload(&mut self, hash: &str, content: &[u8]) {
        self.payloads.insert(hash.to_string(), content.to_vec());
    }

    /// Number of payloads fetched so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

fn publisher_matches(wanted: &Fmri, have: &Fmri) -> bool {
    match (&wanted.publisher, &have.publisher) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl ManifestSource for MemoryRepository {
    fn get_manifest(&self, fmri: &Fmri) -> Result<Arc<Manifest>> {
        let versions = self
            .packages
            .get(fmri.stem())
            .ok_or_else(|| RepositoryError::NotFound(fmri.to_string()))?;
        let found = versions.iter().rev().find(|m| match &m.fmri {
            Some(have) => {
                publisher_matches(fmri, have)
                    && (fmri.version.is_none() || have.version == fmri.version)
            }
            None => false,
        });
        found
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(fmri.to_string()))
    }
}

impl Catalog for MemoryRepository {
    fn fmris(&self) -> Vec<Fmri> {
        self.packages
            .values()
            .flatten()
            .filter_map(|m| m.fmri.clone())
            .collect()
    }
}

impl Transport for MemoryRepository {
    fn fetch_payload(&self, fmri: &Fmri, digest: &str, dest: &Path) -> Result<()> {
        let hash = match digest.parse::<Digest>() {
            Ok(d) => d.hash,
            Err(_) => digest.to_string(),
        };
        let body = self
            .payloads
            .get(&hash)
            .or_else(|| self.payloads.get(digest))
            .ok_or_else(|| RepositoryError::PayloadNotFound {
                fmri: fmri.to_string(),
                digest: digest.to_string(),
            })?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(%fmri, digest, ?dest, "fetching payload");

        let write_err = |source| RepositoryError::FileWriteError {
            path: dest.to_path_buf(),
            source,
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        // Write atomically
        let tmp = dest.with_extension("tmp");
        let mut f = File::create(&tmp).map_err(write_err)?;
        f.write_all(body).map_err(write_err)?;
        drop(f);
        fs::rename(&tmp, dest).map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn newest_version_wins_for_unversioned_lookup() {
        let mut repo = MemoryRepository::new();
        repo.publish("set name=pkg.fmri value=pkg://test/foo@1.0\n").unwrap();
        repo.publish("set name=pkg.fmri value=pkg://test/foo@1.10\n").unwrap();
        repo.publish("set name=pkg.fmri value=pkg://test/foo@1.2\n").unwrap();

        let m = repo.get_manifest(&Fmri::parse("foo").unwrap()).unwrap();
        assert_eq!(m.fmri.as_ref().unwrap().version(), "1.10");
        let m = repo.get_manifest(&Fmri::parse("pkg:/foo@1.2").unwrap()).unwrap();
        assert_eq!(m.fmri.as_ref().unwrap().version(), "1.2");
        assert!(!repo.has_manifest(&Fmri::parse("pkg:/foo@3").unwrap()));
        assert!(!repo.has_manifest(&Fmri::parse("pkg://other/foo@1.2").unwrap()));
        assert_eq!(repo.fmris().len(), 3);
    }

    #[test]
    fn payloads_are_written_to_dest() {
        let mut repo = MemoryRepository::new();
        let hash = repo.add_payload(b"abc");
        assert_eq!(hash, "a9993e364706816aba3e25717850c26c9cd0d89d");
        let dir = tempdir().unwrap();
        let dest = dir.path().join("cache").join(&hash);
        let fmri = Fmri::parse("pkg:/foo@1.0").unwrap();
        repo.fetch_payload(&fmri, &hash, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
        assert_eq!(repo.fetch_count(), 1);
        assert!(matches!(
            repo.fetch_payload(&fmri, "ffff", &dest),
            Err(RepositoryError::PayloadNotFound { .. })
        ));
    }
}
