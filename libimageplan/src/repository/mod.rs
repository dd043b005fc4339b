//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Where packages come from. The planner only needs three things from a
//! repository: the list of known packages, their manifests and the content
//! referenced by file actions.

mod memory;

use crate::fmri::Fmri;
use crate::manifest::{Manifest, ManifestError};
use miette::Diagnostic;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryRepository;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    #[error("package {0} not found")]
    #[diagnostic(
        code(ips::repository_error::not_found),
        help("Check that the package name and version are correct and that the publisher is configured")
    )]
    NotFound(String),

    #[error("payload {digest} of {fmri} not found")]
    #[diagnostic(
        code(ips::repository_error::payload_not_found),
        help("The repository may be incomplete; try another publisher or republish the package")
    )]
    PayloadNotFound { fmri: String, digest: String },

    #[error("failed to write file {path}: {source}")]
    #[diagnostic(
        code(ips::repository_error::file_write),
        help("Check that the directory is writable")
    )]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),
}

/// Source of package manifests.
pub trait ManifestSource {
    /// The manifest of exactly `fmri`; an unversioned FMRI means the
    /// newest version known.
    fn get_manifest(&self, fmri: &Fmri) -> Result<Arc<Manifest>>;

    fn has_manifest(&self, fmri: &Fmri) -> bool {
        self.get_manifest(fmri).is_ok()
    }
}

/// The set of packages a repository offers.
pub trait Catalog {
    fn fmris(&self) -> Vec<Fmri>;
}

/// Byte transfer of file content, addressed by content hash.
pub trait Transport {
    fn fetch_payload(&self, fmri: &Fmri, digest: &str, dest: &Path) -> Result<()>;
}

/// Everything a plan needs from the outside world.
pub trait Repository: ManifestSource + Catalog + Transport {}

impl<T: ManifestSource + Catalog + Transport> Repository for T {}
