//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{PlanError, Result};
use crate::actions::executors::{cache_name, Executor};
use crate::actions::{Action, ActionName};
use crate::digest::Digest;
use crate::filter::Filter;
use crate::fmri::Fmri;
use crate::image::Image;
use crate::manifest::{Manifest, ManifestDifference};
use crate::progress::ProgressTracker;
use crate::repository::Transport;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Acceptance state of one license delivered by a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseStatus {
    pub src: Option<Action>,
    pub dest: Action,
    pub accepted: bool,
    pub displayed: bool,
}

/// The transition of one package from `origin` to `destination`.
///
/// Either side may be absent, but not both: no origin is a fresh install,
/// no destination a removal.
#[derive(Debug, Clone, Default)]
pub struct PkgPlan {
    origin_fmri: Option<Fmri>,
    destination_fmri: Option<Fmri>,
    origin: Option<Arc<Manifest>>,
    destination: Option<Arc<Manifest>>,
    actions: ManifestDifference,
    licenses: BTreeMap<String, LicenseStatus>,
    evaluated: bool,
}

impl PkgPlan {
    pub fn new() -> PkgPlan {
        PkgPlan::default()
    }

    /// Install `fmri`. Fails if the package already has a destination or
    /// that exact version is installed in `image`.
    pub fn propose_destination(&mut self, image: &Image, fmri: Fmri, manifest: Arc<Manifest>) -> Result<()> {
        if let Some(dest) = &self.destination_fmri {
            return Err(PlanError::DestinationAlreadySet(dest.to_string()));
        }
        if fmri.version.is_some() && image.is_installed(&fmri) {
            return Err(PlanError::AlreadyInstalled(fmri.to_string()));
        }
        self.destination_fmri = Some(fmri);
        self.destination = Some(manifest);
        Ok(())
    }

    /// Remove the installed package `fmri`.
    pub fn propose_removal(&mut self, fmri: Fmri, manifest: Arc<Manifest>) -> Result<()> {
        if let Some(dest) = &self.destination_fmri {
            return Err(PlanError::DestinationAlreadySet(dest.to_string()));
        }
        self.origin_fmri = Some(fmri);
        self.origin = Some(manifest);
        Ok(())
    }

    /// Set both sides at once, as for an update.
    pub fn propose(
        &mut self,
        origin: Option<(Fmri, Arc<Manifest>)>,
        destination: Option<(Fmri, Arc<Manifest>)>,
    ) {
        let (origin_fmri, origin) = origin.unzip();
        let (destination_fmri, destination) = destination.unzip();
        self.origin_fmri = origin_fmri;
        self.origin = origin;
        self.destination_fmri = destination_fmri;
        self.destination = destination;
    }

    pub fn origin_fmri(&self) -> Option<&Fmri> {
        self.origin_fmri.as_ref()
    }

    pub fn destination_fmri(&self) -> Option<&Fmri> {
        self.destination_fmri.as_ref()
    }

    pub fn destination_manifest(&self) -> Option<&Manifest> {
        self.destination.as_deref()
    }

    pub fn origin_manifest(&self) -> Option<&Manifest> {
        self.origin.as_deref()
    }

    /// Stem of whichever side is present.
    pub fn stem(&self) -> &str {
        self.destination_fmri
            .as_ref()
            .or(self.origin_fmri.as_ref())
            .map(Fmri::stem)
            .unwrap_or_default()
    }

    /// Compute the action diff for this package.
    ///
    /// Directories the origin needed, explicitly or as parents of its
    /// content, and the destination no longer needs are removed as well.
    pub fn evaluate(&mut self, origin_filters: &[Filter], dest_filters: &[Filter]) -> Result<()> {
        if self.origin.is_none() && self.destination.is_none() {
            return Err(PlanError::InvariantViolation(
                "package plan without origin or destination".to_string(),
            ));
        }

        let empty = Manifest::new();
        let dest = self.destination.as_deref().unwrap_or(&empty);
        let dups = dest.duplicates(dest_filters);
        if !dups.is_empty() {
            let keys = dups
                .iter()
                .map(|(name, key, _)| format!("{} {}", name, key))
                .collect();
            return Err(PlanError::DuplicateActions {
                fmri: self.stem().to_string(),
                keys,
            });
        }

        let mut diff = Manifest::difference(self.origin.as_deref(), dest, origin_filters, dest_filters);

        if let Some(origin) = self.origin.as_deref() {
            let old_dirs = origin.get_directories(origin_filters);
            let new_dirs = dest.get_directories(dest_filters);
            let explicit: BTreeSet<String> = diff
                .removed
                .iter()
                .filter(|a| a.name() == ActionName::Dir)
                .filter_map(Action::key_value)
                .collect();
            for dir in old_dirs.difference(&new_dirs) {
                if !explicit.contains(dir) {
                    diff.removed.push(Action::dir(dir));
                }
            }
        }

        self.licenses.clear();
        let installs = diff.added.iter().map(|dst| (None, dst));
        let updates = diff.changed.iter().map(|(src, dst)| (Some(src), dst));
        for (src, dst) in installs.chain(updates) {
            if let Some(lic) = dst.as_license() {
                self.licenses.insert(
                    lic.license.clone(),
                    LicenseStatus {
                        src: src.cloned(),
                        dest: dst.clone(),
                        accepted: false,
                        displayed: false,
                    },
                );
            }
        }

        debug!(
            pkg = self.stem(),
            install = diff.added.len(),
            update = diff.changed.len(),
            remove = diff.removed.len(),
            "package plan evaluated"
        );
        self.actions = diff;
        self.evaluated = true;
        Ok(())
    }

    pub fn gen_install_actions(&self) -> &[Action] {
        &self.actions.added
    }

    pub fn gen_update_actions(&self) -> &[(Action, Action)] {
        &self.actions.changed
    }

    pub fn gen_removal_actions(&self) -> &[Action] {
        &self.actions.removed
    }

    /// Turn installs at `moved` positions into updates from the paired
    /// source action, which another package gives up. Unchanged moves
    /// disappear entirely.
    pub(crate) fn absorb_moves(&mut self, moved: Vec<(usize, Action)>) {
        let drop: BTreeSet<usize> = moved.iter().map(|(i, _)| *i).collect();
        for (i, src) in moved {
            if let Some(dst) = self.actions.added.get(i) {
                if src.different(dst) {
                    self.actions.changed.push((src, dst.clone()));
                }
            }
        }
        let added = std::mem::take(&mut self.actions.added);
        self.actions.added = added
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !drop.contains(i))
            .map(|(_, a)| a)
            .collect();
    }

    /// Whether this package has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.origin_fmri == self.destination_fmri
    }

    /// Summary line of the destination, or of the origin for removals.
    pub fn pkg_summary(&self) -> String {
        let m = match self.destination.as_deref().or(self.origin.as_deref()) {
            Some(m) => m,
            None => return "none provided".to_string(),
        };
        m.get("pkg.summary")
            .or_else(|| m.get("description"))
            .unwrap_or("none provided")
            .to_string()
    }

    pub fn licenses(&self) -> impl Iterator<Item = (&String, &LicenseStatus)> {
        self.licenses.iter()
    }

    /// Record that `license` has been accepted and/or displayed.
    pub fn set_license_status(&mut self, license: &str, accepted: Option<bool>, displayed: Option<bool>) -> bool {
        match self.licenses.get_mut(license) {
            Some(entry) => {
                if let Some(a) = accepted {
                    entry.accepted = a;
                }
                if let Some(d) = displayed {
                    entry.displayed = d;
                }
                true
            }
            None => false,
        }
    }

    fn transfers<'a>(&'a self) -> impl Iterator<Item = (Option<&'a Action>, &'a Action)> + 'a {
        self.actions
            .added
            .iter()
            .map(|dst| (None, dst))
            .chain(self.actions.changed.iter().map(|(src, dst)| (Some(src), dst)))
    }

    /// Files and bytes that must be fetched before execution.
    pub fn xfer_stats(&self, image_root: &Path) -> (u64, u64) {
        self.transfers()
            .filter(|(src, dst)| dst.needs_data(*src, image_root))
            .fold((0, 0), |(files, bytes), (_, dst)| (files + 1, bytes + dst.transfer_size()))
    }

    /// Check that every license needing acceptance or display got it.
    pub fn preexecute(&self) -> Vec<PlanError> {
        let mut errors = Vec::new();
        for (name, status) in &self.licenses {
            let lic = match status.dest.as_license() {
                Some(l) => l,
                None => continue,
            };
            let requirement = if lic.must_accept && !status.accepted {
                "accepted"
            } else if lic.must_display && !status.displayed {
                "displayed"
            } else {
                continue;
            };
            errors.push(PlanError::LicenseNotAccepted {
                fmri: self.stem().to_string(),
                license: name.clone(),
                requirement: requirement.to_string(),
            });
        }
        errors
    }

    /// Fetch all content this package needs into the image download cache.
    /// Content already cached with a matching digest is not fetched again.
    pub fn download(&self, transport: &dyn Transport, image: &Image, tracker: &dyn ProgressTracker) -> Result<()> {
        let fmri = match &self.destination_fmri {
            Some(f) => f,
            None => return Ok(()),
        };
        let download_dir = image.download_dir();
        for (src, dst) in self.transfers() {
            if !dst.needs_data(src, image.path()) {
                continue;
            }
            let hash = match &dst.hash {
                Some(h) => h,
                None => continue,
            };
            if tracker.check_cancel() {
                return Err(PlanError::Cancelled);
            }

            let path = download_dir.join(cache_name(hash));
            let digest = Digest::from_str(hash).map_err(|source| PlanError::Corrupt {
                fmri: fmri.to_string(),
                path: path.clone(),
                source,
            })?;
            let cached = fs::read(&path)
                .map(|bytes| digest.verify(&bytes).is_ok())
                .unwrap_or(false);
            if !cached {
                transport
                    .fetch_payload(fmri, hash, &path)
                    .map_err(|source| PlanError::Download {
                        fmri: fmri.to_string(),
                        source,
                    })?;
                let bytes = fs::read(&path).map_err(|source| PlanError::Io {
                    path: path.clone(),
                    source,
                })?;
                if let Err(source) = digest.verify(&bytes) {
                    if let Err(e) = fs::remove_file(&path) {
                        debug!(?path, error = %e, "could not drop corrupt download");
                    }
                    return Err(PlanError::Corrupt {
                        fmri: fmri.to_string(),
                        path,
                        source,
                    });
                }
            }
            tracker.download_add_progress(1, dst.transfer_size());
        }
        Ok(())
    }

    fn failed(&self, action: &Action, source: crate::actions::executors::InstallerError) -> PlanError {
        let key = action.key_value().unwrap_or_else(|| action.canonical());
        error!(action = %action.name(), key = %key, pkg = self.stem(), error = %source, "action failed");
        PlanError::ActionFailed {
            action: format!("{} {}", action.name(), key),
            fmri: self.stem().to_string(),
            source,
        }
    }

    pub fn execute_install(&self, exec: &mut Executor, dst: &Action) -> Result<()> {
        exec.install(None, dst).map_err(|e| self.failed(dst, e))
    }

    pub fn execute_update(&self, exec: &mut Executor, src: &Action, dst: &Action) -> Result<()> {
        exec.install(Some(src), dst).map_err(|e| self.failed(dst, e))
    }

    pub fn execute_removal(&self, exec: &mut Executor, src: &Action) -> Result<()> {
        exec.remove(src).map_err(|e| self.failed(src, e))
    }

    /// Record the new package state in the image.
    pub fn postexecute(&self, image: &mut Image) -> Result<()> {
        match (&self.destination_fmri, self.destination.as_deref()) {
            (Some(fmri), Some(manifest)) => {
                image.record_installed(fmri, manifest)?;
                info!(%fmri, "installed");
            }
            _ => {
                if let Some(fmri) = &self.origin_fmri {
                    image.record_removed(fmri)?;
                    info!(%fmri, "removed");
                }
            }
        }
        Ok(())
    }
}
