//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
#[cfg(test)]
mod tests;

use crate::actions::DependType;
use crate::filter::Filter;
use crate::fmri::{Constraint, Fmri, FmriError};
use crate::manifest::{Manifest, ManifestError};
use crate::repository::Catalog;
use config::ImageConfig;
use miette::Diagnostic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Diagnostic)]
pub enum ImageError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(ips::image_error::io),
        help("Check system resources and permissions")
    )]
    IO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    #[diagnostic(
        code(ips::image_error::json),
        help("Check the JSON format and try again")
    )]
    Json(#[from] serde_json::Error),

    #[error("Invalid image path: {0}")]
    #[diagnostic(
        code(ips::image_error::invalid_path),
        help("Provide a valid path for the image")
    )]
    InvalidPath(String),

    #[error("no packages match {}", .0.join(", "))]
    #[diagnostic(
        code(ips::image_error::no_match),
        help("Check the package names; use all_known to search packages that are not installed")
    )]
    NoMatchingPackages(Vec<String>),

    #[error("invalid package pattern {0:?}")]
    #[diagnostic(code(ips::image_error::invalid_pattern))]
    InvalidPattern(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fmri(#[from] FmriError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),
}

pub type Result<T> = std::result::Result<T, ImageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ImageError + '_ {
    move |source| ImageError::IO {
        source,
        path: path.to_path_buf(),
    }
}

/// Type of image, either Full (base path of "/") or Partial (attached to a full image)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum ImageType {
    /// Full image with base path of "/"
    Full,
    /// Partial image attached to a full image
    Partial,
}

/// State of a package as reported by [`Image::inventory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkgState {
    Installed,
    Known,
}

/// Represents an IPS image, which can be either a Full image or a Partial image
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Image {
    /// Path to the image
    path: PathBuf,
    /// Type of image (Full or Partial)
    image_type: ImageType,
    /// Image version
    version: i32,
    config: ImageConfig,
    /// Installed packages by stem
    installed: BTreeMap<String, Fmri>,
}

impl Image {
    /// Creates a new Full image at the specified path
    pub fn new_full<P: Into<PathBuf>>(path: P) -> Image {
        Image {
            path: path.into(),
            image_type: ImageType::Full,
            version: 5,
            config: ImageConfig::default(),
            installed: BTreeMap::new(),
        }
    }

    /// Creates a new Partial image at the specified path
    pub fn new_partial<P: Into<PathBuf>>(path: P) -> Image {
        Image {
            image_type: ImageType::Partial,
            ..Image::new_full(path)
        }
    }

    /// Creates a Full image on disk and saves its configuration
    pub fn create<P: Into<PathBuf>>(path: P, config: ImageConfig) -> Result<Image> {
        let mut image = Image::new_full(path);
        image.config = config;
        image.save()?;
        Ok(image)
    }

    /// Returns the path to the image
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the type of the image
    pub fn image_type(&self) -> &ImageType {
        &self.image_type
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ImageConfig {
        &mut self.config
    }

    /// Returns the path to the metadata directory for this image
    pub fn metadata_dir(&self) -> PathBuf {
        match self.image_type {
            ImageType::Full => self.path.join("var/pkg"),
            ImageType::Partial => self.path.join(".pkg"),
        }
    }

    /// Returns the path to the image JSON file
    pub fn image_json_path(&self) -> PathBuf {
        self.metadata_dir().join("pkg6.image.json")
    }

    /// Content fetched ahead of execution, named by hash
    pub fn download_dir(&self) -> PathBuf {
        self.metadata_dir().join("download")
    }

    /// Files set aside while they move between packages
    pub fn stash_dir(&self) -> PathBuf {
        self.metadata_dir().join("saved")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.metadata_dir().join("index")
    }

    /// Where the manifest of an installed package is kept.
    pub fn manifest_path(&self, fmri: &Fmri) -> PathBuf {
        self.metadata_dir()
            .join("pkg")
            .join(quote(fmri.stem()))
            .join(quote(&fmri.version()))
            .join("manifest.json")
    }

    /// Creates the metadata directory if it doesn't exist
    pub fn create_metadata_dir(&self) -> Result<()> {
        let metadata_dir = self.metadata_dir();
        fs::create_dir_all(&metadata_dir).map_err(io_err(&metadata_dir))
    }

    /// Saves the image data to the metadata directory
    pub fn save(&self) -> Result<()> {
        self.create_metadata_dir()?;
        let json_path = self.image_json_path();
        let file = File::create(&json_path).map_err(io_err(&json_path))?;
        serde_json::to_writer_pretty(file, self).map_err(ImageError::Json)
    }

    /// Loads an image from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Check for both full and partial image JSON files
        let full_json_path = Image::new_full(path).image_json_path();
        let partial_json_path = Image::new_partial(path).image_json_path();

        let json_path = if full_json_path.exists() {
            full_json_path
        } else if partial_json_path.exists() {
            partial_json_path
        } else {
            return Err(ImageError::InvalidPath(format!(
                "Image JSON file not found at either {:?} or {:?}",
                full_json_path, partial_json_path
            )));
        };

        let file = File::open(&json_path).map_err(io_err(&json_path))?;
        let mut image: Image = serde_json::from_reader(file)?;
        image.path = path.to_path_buf();
        Ok(image)
    }

    /// Variant and facet filters configured for this image.
    pub fn filters(&self) -> Vec<Filter> {
        vec![
            Filter::Variants(self.config.variants.clone()),
            Filter::Facets(self.config.facets.clone()),
        ]
    }

    pub fn installed_fmri(&self, stem: &str) -> Option<&Fmri> {
        self.installed.get(stem)
    }

    pub fn installed_fmris(&self) -> impl Iterator<Item = &Fmri> {
        self.installed.values()
    }

    pub fn is_installed(&self, fmri: &Fmri) -> bool {
        match self.installed.get(fmri.stem()) {
            Some(have) => fmri.version.is_none() || have.version == fmri.version,
            None => false,
        }
    }

    /// The installed version of the package is `fmri` or newer.
    pub fn has_version_installed(&self, fmri: &Fmri) -> bool {
        self.installed
            .get(fmri.stem())
            .map(|have| have.is_successor(fmri))
            .unwrap_or(false)
    }

    /// The installed version of the package, if it is older than `fmri`.
    pub fn older_version_installed(&self, fmri: &Fmri) -> Option<&Fmri> {
        self.installed
            .get(fmri.stem())
            .filter(|have| have.version < fmri.version)
    }

    pub fn fmri_is_successor(&self, a: &Fmri, b: &Fmri) -> bool {
        a.is_successor(b)
    }

    pub fn fmri_is_same_pkg(&self, a: &Fmri, b: &Fmri) -> bool {
        a.is_same_pkg(b)
    }

    pub fn save_manifest(&self, manifest: &Manifest, fmri: &Fmri) -> Result<()> {
        let path = self.manifest_path(fmri);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let file = File::create(&path).map_err(io_err(&path))?;
        serde_json::to_writer(file, manifest).map_err(ImageError::Json)
    }

    pub fn load_manifest(&self, fmri: &Fmri) -> Result<Manifest> {
        Ok(Manifest::parse_file(self.manifest_path(fmri))?)
    }

    /// Record `fmri` as installed, replacing any other version, and keep
    /// its manifest for later diffs and dependency lookups.
    pub fn record_installed(&mut self, fmri: &Fmri, manifest: &Manifest) -> Result<()> {
        self.save_manifest(manifest, fmri)?;
        if let Some(old) = self.installed.insert(fmri.stem().to_string(), fmri.clone()) {
            if old.version != fmri.version {
                self.forget_manifest(&old);
            }
        }
        debug!(%fmri, "recorded as installed");
        self.save()
    }

    pub fn record_removed(&mut self, fmri: &Fmri) -> Result<()> {
        if let Some(old) = self.installed.remove(fmri.stem()) {
            self.forget_manifest(&old);
            debug!(fmri = %old, "recorded as removed");
        }
        self.save()
    }

    fn forget_manifest(&self, fmri: &Fmri) {
        let path = self.manifest_path(fmri);
        if let Err(e) = fs::remove_file(&path) {
            debug!(?path, error = %e, "could not remove stored manifest");
        }
    }

    /// Installed packages whose manifest requires `fmri`'s package.
    pub fn get_dependents(&self, fmri: &Fmri) -> Result<Vec<Fmri>> {
        let mut out = Vec::new();
        for have in self.installed.values() {
            if have.is_same_pkg(fmri) {
                continue;
            }
            let manifest = self.load_manifest(have)?;
            let requires = manifest.actions.iter().filter_map(|a| a.as_dependency()).any(|d| {
                d.dep_type == DependType::Require && d.fmri.is_same_pkg(fmri)
            });
            if requires {
                out.push(have.clone());
            }
        }
        Ok(out)
    }

    /// Packages matching `patterns`, newest first within each pattern and
    /// ordered by publisher preference.
    ///
    /// A pattern is a package name or FMRI; `*` and `?` glob within the
    /// name, and a version such as `@1.2` restricts matches to versions
    /// it is a prefix of. Without `all_known` only installed packages are
    /// searched. `first_only` keeps the best match per pattern. Patterns
    /// that match nothing are reported together.
    pub fn inventory(
        &self,
        catalog: &dyn Catalog,
        patterns: &[String],
        all_known: bool,
        preferred: Option<&str>,
        first_only: bool,
    ) -> Result<Vec<(Fmri, PkgState)>> {
        let known: Vec<Fmri> = if all_known {
            let mut v = catalog.fmris();
            for f in self.installed.values() {
                if !v.iter().any(|k| k.stem() == f.stem() && k.version == f.version) {
                    v.push(f.clone());
                }
            }
            v
        } else {
            self.installed.values().cloned().collect()
        };

        let everything = [String::new()];
        let patterns = if patterns.is_empty() {
            &everything[..]
        } else {
            patterns
        };
        let mut matchers = Vec::new();
        for p in patterns {
            matchers.push((p, PackagePattern::parse(p)?));
        }

        let rank = |f: &Fmri| match (preferred, f.publisher.as_deref()) {
            (Some(p), Some(have)) if p == have => 0,
            _ => self.config.publisher_rank(f.publisher.as_deref()) + 1,
        };

        let mut out: Vec<(Fmri, PkgState)> = Vec::new();
        let mut unmatched = Vec::new();
        for (text, pattern) in matchers {
            let mut found: Vec<&Fmri> = known.iter().filter(|f| pattern.matches(f)).collect();
            if found.is_empty() {
                unmatched.push(text.clone());
                continue;
            }
            found.sort_by(|a, b| {
                a.stem()
                    .cmp(b.stem())
                    .then_with(|| rank(a).cmp(&rank(b)))
                    .then_with(|| b.version.cmp(&a.version))
            });
            if first_only {
                found.dedup_by(|b, a| a.stem() == b.stem());
            }
            for f in found {
                let state = if self.is_installed(f) {
                    PkgState::Installed
                } else {
                    PkgState::Known
                };
                if !out.iter().any(|(o, _)| o == f) {
                    out.push((f.clone(), state));
                }
            }
        }

        if !unmatched.is_empty() {
            return Err(ImageError::NoMatchingPackages(unmatched));
        }
        Ok(out)
    }
}

/// Stem glob plus optional minimum version.
struct PackagePattern {
    stem: Regex,
    publisher: Option<String>,
    version: Option<crate::fmri::Version>,
}

impl PackagePattern {
    fn parse(text: &str) -> Result<PackagePattern> {
        if text.is_empty() {
            return Ok(PackagePattern {
                stem: Regex::new(".*").map_err(|_| ImageError::InvalidPattern(text.to_string()))?,
                publisher: None,
                version: None,
            });
        }
        let fmri = Fmri::parse(text)?;
        let mut re = String::from("^(.*/)?");
        for c in fmri.stem().chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');
        // A leading slash or scheme anchors the name at the root.
        if text.starts_with('/') || text.contains(":/") {
            re = re.replacen("^(.*/)?", "^", 1);
        }
        let stem = Regex::new(&re).map_err(|_| ImageError::InvalidPattern(text.to_string()))?;
        Ok(PackagePattern {
            stem,
            publisher: fmri.publisher,
            version: fmri.version,
        })
    }

    fn matches(&self, fmri: &Fmri) -> bool {
        if !self.stem.is_match(fmri.stem()) {
            return false;
        }
        if let (Some(want), Some(have)) = (&self.publisher, &fmri.publisher) {
            if want != have {
                return false;
            }
        }
        match (&self.version, &fmri.version) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(want), Some(have)) => have.is_successor(want, Constraint::Auto),
        }
    }
}

/// Make an FMRI component usable as a single path segment.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}
