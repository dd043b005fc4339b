//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Transactional image plans.
//!
//! A plan is built in three steps. Dependency closure turns the proposed
//! installs and removals into a consistent set of package transitions. Each
//! transition gets a [`PkgPlan`] holding the action diff for that package.
//! Finally all per-package diffs are merged into one globally ordered list
//! per phase, which [`ImagePlan::execute`] runs as removals, installs and
//! updates.

mod actuator;
mod imageplan;
mod pkgplan;

pub use actuator::Actuators;
pub use imageplan::{ImagePlan, PlanStep, PlannedOp};
pub use pkgplan::{LicenseStatus, PkgPlan};

use crate::actions::executors::InstallerError;
use crate::digest::DigestError;
use crate::image::ImageError;
use crate::manifest::ManifestError;
use crate::repository::RepositoryError;
use miette::Diagnostic;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Where an [`ImagePlan`] is in its lifecycle.
///
/// States only move forward; the error states are terminal and a failed
/// plan has to be rebuilt from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlanState {
    Unevaluated,
    EvaluatedPkgs,
    EvaluatedOk,
    PreexecutedOk,
    PreexecutedError,
    ExecutedOk,
    ExecutedError,
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanState::Unevaluated => "unevaluated",
            PlanState::EvaluatedPkgs => "packages evaluated",
            PlanState::EvaluatedOk => "evaluated",
            PlanState::PreexecutedOk => "preexecuted",
            PlanState::PreexecutedError => "preexecute failed",
            PlanState::ExecutedOk => "executed",
            PlanState::ExecutedError => "execute failed",
        };
        write!(f, "{}", s)
    }
}

/// A dependency no candidate could be found for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    pub fmri: String,
    pub required_by: String,
}

impl fmt::Display for UnresolvedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (required by {})", self.fmri, self.required_by)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("dependencies could not be satisfied: {}", join(unresolved))]
    #[diagnostic(
        code(ips::plan_error::unresolved_dependencies),
        help("Check that the repository offers the missing packages at a suitable version")
    )]
    UnresolvedDependencies { unresolved: Vec<UnresolvedDependency> },

    #[error("{fmri} cannot be removed, it is required by {}", dependents.join(", "))]
    #[diagnostic(
        code(ips::plan_error::non_leaf_package),
        help("Remove the dependent packages as well or request a recursive removal")
    )]
    NonLeafPackage { fmri: String, dependents: Vec<String> },

    #[error("{fmri} is excluded by {excluded_by}")]
    #[diagnostic(code(ips::plan_error::excluded_dependency))]
    ExcludedDependency { fmri: String, excluded_by: String },

    #[error("conflicting proposals for {fmri}: {other}")]
    #[diagnostic(
        code(ips::plan_error::conflicting_proposal),
        help("Request only one version of each package per operation")
    )]
    ConflictingProposal { fmri: String, other: String },

    #[error("{0} is not installed")]
    #[diagnostic(code(ips::plan_error::not_installed))]
    NotInstalled(String),

    #[error("{0} is already installed")]
    #[diagnostic(code(ips::plan_error::already_installed))]
    AlreadyInstalled(String),

    #[error("a destination is already set for {0}")]
    #[diagnostic(code(ips::plan_error::destination_set))]
    DestinationAlreadySet(String),

    #[error("{fmri} delivers conflicting actions for {}", keys.join(", "))]
    #[diagnostic(
        code(ips::plan_error::duplicate_actions),
        help("The package is broken; every path may only be delivered once")
    )]
    DuplicateActions { fmri: String, keys: Vec<String> },

    #[error("license {license} of {fmri} must be {requirement}")]
    #[diagnostic(
        code(ips::plan_error::license),
        help("Mark the license as accepted or displayed with set_license_status")
    )]
    LicenseNotAccepted {
        fmri: String,
        license: String,
        requirement: String,
    },

    #[error("cannot {operation} a plan that is {state}")]
    #[diagnostic(
        code(ips::plan_error::state),
        help("A plan runs evaluate, preexecute and execute exactly once, in that order")
    )]
    StatePrecondition { operation: String, state: PlanState },

    #[error("internal plan inconsistency: {0}")]
    #[diagnostic(code(ips::plan_error::invariant))]
    InvariantViolation(String),

    #[error("operation cancelled")]
    #[diagnostic(code(ips::plan_error::cancelled))]
    Cancelled,

    #[error("failed to download content for {fmri}")]
    #[diagnostic(code(ips::plan_error::download))]
    Download {
        fmri: String,
        #[source]
        source: RepositoryError,
    },

    #[error("downloaded content for {fmri} at {path} is corrupt")]
    #[diagnostic(
        code(ips::plan_error::corrupt),
        help("The file was discarded; retry the operation")
    )]
    Corrupt {
        fmri: String,
        path: PathBuf,
        #[source]
        source: DigestError,
    },

    #[error("I/O error on {path}")]
    #[diagnostic(code(ips::plan_error::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to apply {action} of {fmri}")]
    #[diagnostic(
        code(ips::plan_error::action_failed),
        help("The image may be partially updated; inspect it and retry the operation")
    )]
    ActionFailed {
        action: String,
        fmri: String,
        #[source]
        source: InstallerError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{} problems prevent this plan", errors.len())]
    #[diagnostic(code(ips::plan_error::multiple))]
    Multiple {
        #[related]
        errors: Vec<PlanError>,
    },
}

impl PlanError {
    /// Fold collected errors into one.
    pub(crate) fn collect(mut errors: Vec<PlanError>) -> Option<PlanError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(PlanError::Multiple { errors }),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;
