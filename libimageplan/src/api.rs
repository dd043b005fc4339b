//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry points for package operations on an image.
//!
//! These wrap [`ImagePlan`] for the common install, uninstall and update
//! flows: propose, evaluate, preexecute and execute in one call.
//!
//! Quickstart (ignore):
//! ```ignore
//! use libimageplan::api::{self, PlanOptions};
//! use libimageplan::image::Image;
//! use libimageplan::progress::{tracker_for, CancelFlag};
//!
//! let mut image = Image::load("/")?;
//! let tracker = tracker_for(image.config().policy.progress, CancelFlag::new());
//! let summary = api::install(&mut image, &repo, tracker.as_ref(), &["web/server/nginx".into()], &PlanOptions::default())?;
//! for op in &summary.ops {
//!     println!("{}", op);
//! }
//! # Ok::<(), libimageplan::api::IpsError>(())
//! ```

use miette::Diagnostic;
use thiserror::Error;
use tracing::info;

use crate::actions::executors::{ApplyOptions, InstallerError};
use crate::actions::ActionError;
use crate::digest::DigestError;
pub use crate::filter::Filter;
use crate::filter::FilterError;
pub use crate::fmri::Fmri;
use crate::fmri::FmriError;
use crate::image::{Image, ImageError};
use crate::manifest::ManifestError;
pub use crate::plan::{Actuators, ImagePlan, PlannedOp};
use crate::plan::PlanError;
use crate::progress::ProgressTracker;
use crate::repository::{Repository, RepositoryError};
use crate::search::IndexError;

/// Unified error type for API-level operations
#[derive(Debug, Error, Diagnostic)]
pub enum IpsError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fmri(#[from] FmriError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Installer(#[from] InstallerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, IpsError>;

/// Knobs for the one-call operations.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Evaluate and download, but leave the image untouched.
    pub dry_run: bool,
    /// Remove dependents of removed packages too. `None` uses the image policy.
    pub recursive_removal: Option<bool>,
    /// Accept and mark displayed every license of the packages installed.
    pub accept_licenses: bool,
    /// Filters applied on top of the image variants and facets.
    pub filters: Vec<Filter>,
}

/// What an operation did, or would have done for a dry run.
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub ops: Vec<PlannedOp>,
    pub actuators: Actuators,
    pub reboot_needed: bool,
    /// Search index trouble that was worked around.
    pub index_warning: Option<String>,
}

fn run<R, F>(
    image: &mut Image,
    repo: &R,
    tracker: &dyn ProgressTracker,
    opts: &PlanOptions,
    propose: F,
) -> Result<PlanSummary>
where
    R: Repository,
    F: FnOnce(&mut ImagePlan<'_, R>) -> std::result::Result<(), PlanError>,
{
    let mut plan = ImagePlan::new(image, repo, tracker)
        .with_filters(opts.filters.clone())
        .with_apply_options(ApplyOptions { dry_run: opts.dry_run });
    if let Some(recursive) = opts.recursive_removal {
        plan = plan.with_recursive_removal(recursive);
    }

    propose(&mut plan)?;
    plan.evaluate()?;

    if opts.accept_licenses {
        let licenses: Vec<(String, String)> = plan
            .pkg_plans()
            .iter()
            .flat_map(|pp| {
                let stem = pp.stem().to_string();
                pp.licenses().map(move |(l, _)| (stem.clone(), l.clone()))
            })
            .collect();
        for (stem, license) in licenses {
            plan.set_license_status(&stem, &license, Some(true), Some(true));
        }
    }

    let summary = PlanSummary {
        ops: plan.planned_ops(),
        ..Default::default()
    };
    if plan.nothing_to_do() {
        info!("no changes required");
        return Ok(summary);
    }

    plan.preexecute()?;
    plan.execute()?;
    Ok(PlanSummary {
        actuators: plan.actuators().clone(),
        reboot_needed: plan.reboot_needed(),
        index_warning: plan.index_error().map(|e| e.to_string()),
        ..summary
    })
}

/// Install the best match of each pattern along with its dependencies.
pub fn install<R: Repository>(
    image: &mut Image,
    repo: &R,
    tracker: &dyn ProgressTracker,
    patterns: &[String],
    opts: &PlanOptions,
) -> Result<PlanSummary> {
    run(image, repo, tracker, opts, |plan| plan.plan_install(patterns).map(|_| ()))
}

/// Remove the installed packages matching `patterns`.
pub fn uninstall<R: Repository>(
    image: &mut Image,
    repo: &R,
    tracker: &dyn ProgressTracker,
    patterns: &[String],
    opts: &PlanOptions,
) -> Result<PlanSummary> {
    run(image, repo, tracker, opts, |plan| plan.plan_uninstall(patterns))
}

/// Move every installed package to the newest version offered.
pub fn update<R: Repository>(
    image: &mut Image,
    repo: &R,
    tracker: &dyn ProgressTracker,
    opts: &PlanOptions,
) -> Result<PlanSummary> {
    run(image, repo, tracker, opts, |plan| plan.plan_update().map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::ImageConfig;
    use crate::progress::NoopProgressTracker;
    use crate::repository::MemoryRepository;
    use tempfile::tempdir;

    #[test]
    fn install_update_uninstall() {
        let tmp = tempdir().unwrap();
        let mut image = Image::create(tmp.path().join("root"), ImageConfig::default()).unwrap();
        let mut repo = MemoryRepository::new();
        repo.publish("set name=pkg.fmri value=pkg://test/hello@1.0\ndir path=opt/hello mode=0755 owner=root group=bin\n")
            .unwrap();
        let tracker = NoopProgressTracker::default();
        let opts = PlanOptions::default();

        let summary = install(&mut image, &repo, &tracker, &["hello".to_string()], &opts).unwrap();
        assert_eq!(summary.ops.len(), 1);
        assert!(image.path().join("opt/hello").is_dir());

        repo.publish("set name=pkg.fmri value=pkg://test/hello@1.1\ndir path=opt/hello2 mode=0755 owner=root group=bin\n")
            .unwrap();
        let summary = update(&mut image, &repo, &tracker, &opts).unwrap();
        assert!(matches!(summary.ops[0], PlannedOp::Update { .. }));
        assert!(!image.path().join("opt/hello").exists());
        assert!(image.path().join("opt/hello2").is_dir());

        // nothing newer left
        assert!(update(&mut image, &repo, &tracker, &opts).unwrap().ops.is_empty());

        uninstall(&mut image, &repo, &tracker, &["hello".to_string()], &opts).unwrap();
        assert!(image.installed_fmri("hello").is_none());
        assert!(!image.path().join("opt/hello2").exists());

        let err = uninstall(&mut image, &repo, &tracker, &["hello".to_string()], &opts).unwrap_err();
        assert!(matches!(err, IpsError::Plan(PlanError::Image(ImageError::NoMatchingPackages(_)))));
    }
}
