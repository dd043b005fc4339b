//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::actuator::Actuators;
use super::pkgplan::PkgPlan;
use super::{PlanError, PlanState, Result, UnresolvedDependency};
use crate::actions::executors::{ApplyOptions, Executor};
use crate::actions::{Action, ActionKind, ActionName, DependType, Dependency};
use crate::filter::Filter;
use crate::fmri::{Constraint, Fmri};
use crate::image::Image;
use crate::manifest::Manifest;
use crate::progress::ProgressTracker;
use crate::repository::{Repository, RepositoryError};
use crate::search::{IndexError, IndexUpdate, LocalIndex, SearchIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Directories every image keeps regardless of package content.
const IMAGE_DIRS: [&str; 2] = ["var", "var/pkg"];

/// One entry of a global phase list. `pkg` indexes the plan's package
/// plans; removals carry only `src`, installs only `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub pkg: usize,
    pub src: Option<Action>,
    pub dst: Option<Action>,
}

impl PlanStep {
    /// The action this step leaves behind, or removes.
    pub fn action(&self) -> Option<&Action> {
        self.dst.as_ref().or(self.src.as_ref())
    }
}

/// The three merged lists, alive from evaluation until execution.
#[derive(Debug, Default)]
struct PhaseLists {
    removal: Vec<PlanStep>,
    install: Vec<PlanStep>,
    update: Vec<PlanStep>,
}

/// A package level change contained in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    Install(Fmri),
    Update { from: Fmri, to: Fmri },
    Remove(Fmri),
}

impl fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedOp::Install(to) => write!(f, "None -> {}", to),
            PlannedOp::Update { from, to } => write!(f, "{} -> {}", from, to),
            PlannedOp::Remove(from) => write!(f, "{} -> None", from),
        }
    }
}

/// What the image looks like once the plan has run.
#[derive(Default)]
struct FinalImage {
    dirs: BTreeSet<String>,
    links: BTreeSet<String>,
    hardlinks: BTreeSet<String>,
    /// hardlink target path -> link path -> action
    link_targets: BTreeMap<String, BTreeMap<String, Action>>,
}

impl FinalImage {
    fn add(&mut self, manifest: &Manifest, filters: &[Filter]) {
        self.dirs.extend(manifest.get_directories(filters));
        for a in manifest.gen_actions(filters) {
            match &a.kind {
                ActionKind::Link(l) => {
                    self.links.insert(l.path.clone());
                }
                ActionKind::Hardlink(l) => {
                    self.hardlinks.insert(l.path.clone());
                    if let Some(target) = a.hardlink_target() {
                        self.link_targets
                            .entry(target)
                            .or_default()
                            .insert(l.path.clone(), a.clone());
                    }
                }
                _ => {}
            }
        }
    }

    /// Whether removing `src` would take away something the image keeps.
    fn retains(&self, src: &Action) -> bool {
        match &src.kind {
            ActionKind::Dir(d) => self.dirs.contains(&d.path),
            ActionKind::Link(l) => self.links.contains(&l.path),
            ActionKind::Hardlink(l) => self.hardlinks.contains(&l.path),
            _ => false,
        }
    }
}

fn track_account(
    users: &mut BTreeMap<String, Fmri>,
    groups: &mut BTreeMap<String, Fmri>,
    a: &Action,
    fmri: Option<&Fmri>,
) {
    let fmri = match fmri {
        Some(f) => f.clone(),
        None => return,
    };
    match &a.kind {
        ActionKind::User(u) => {
            users.insert(u.username.clone(), fmri);
        }
        ActionKind::Group(g) => {
            groups.insert(g.groupname.clone(), fmri);
        }
        _ => {}
    }
}

fn incorporates(candidate: &Fmri, incorporation: &Fmri) -> bool {
    match (&candidate.version, &incorporation.version) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(c), Some(i)) => c.is_successor(i, Constraint::Auto),
    }
}

/// A whole transaction against one image.
///
/// Proposals are collected first, then [`evaluate`](ImagePlan::evaluate)
/// resolves dependencies and merges every package's actions,
/// [`preexecute`](ImagePlan::preexecute) fetches content and
/// [`execute`](ImagePlan::execute) changes the image. Each step runs once.
pub struct ImagePlan<'a, R: Repository> {
    image: &'a mut Image,
    repo: &'a R,
    tracker: &'a dyn ProgressTracker,
    state: PlanState,
    evaluate_attempted: bool,

    require_optional: bool,
    recursive_removal: bool,
    index_enabled: bool,
    apply: ApplyOptions,
    old_filters: Vec<Filter>,
    new_filters: Vec<Filter>,

    target_fmris: Vec<Fmri>,
    explicit: BTreeSet<String>,
    target_rem_fmris: Vec<Fmri>,
    pkg_plans: Vec<PkgPlan>,
    phases: Option<PhaseLists>,

    actuators: Actuators,
    added_users: BTreeMap<String, Fmri>,
    removed_users: BTreeMap<String, Fmri>,
    added_groups: BTreeMap<String, Fmri>,
    removed_groups: BTreeMap<String, Fmri>,
    index_error: Option<IndexError>,
}

impl<'a, R: Repository> ImagePlan<'a, R> {
    /// Start a plan using the image's filters and policy.
    pub fn new(image: &'a mut Image, repo: &'a R, tracker: &'a dyn ProgressTracker) -> Self {
        let policy = image.config().policy.clone();
        let filters = image.filters();
        ImagePlan {
            image,
            repo,
            tracker,
            state: PlanState::Unevaluated,
            evaluate_attempted: false,
            require_optional: policy.require_optional,
            recursive_removal: policy.recursive_removal,
            index_enabled: policy.index_enabled,
            apply: ApplyOptions::default(),
            old_filters: filters.clone(),
            new_filters: filters,
            target_fmris: Vec::new(),
            explicit: BTreeSet::new(),
            target_rem_fmris: Vec::new(),
            pkg_plans: Vec::new(),
            phases: None,
            actuators: Actuators::default(),
            added_users: BTreeMap::new(),
            removed_users: BTreeMap::new(),
            added_groups: BTreeMap::new(),
            removed_groups: BTreeMap::new(),
            index_error: None,
        }
    }

    /// Add caller supplied filters on top of the image's.
    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.old_filters.extend(filters.iter().cloned());
        self.new_filters.extend(filters);
        self
    }

    pub fn with_recursive_removal(mut self, recursive: bool) -> Self {
        self.recursive_removal = recursive;
        self
    }

    pub fn with_apply_options(mut self, opts: ApplyOptions) -> Self {
        self.apply = opts;
        self
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    fn expect_state(&self, operation: &str, wanted: PlanState) -> Result<()> {
        if self.state != wanted {
            return Err(PlanError::StatePrecondition {
                operation: operation.to_string(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn expect_proposing(&self, operation: &str) -> Result<()> {
        if self.evaluate_attempted {
            return Err(PlanError::StatePrecondition {
                operation: operation.to_string(),
                state: self.state,
            });
        }
        self.expect_state(operation, PlanState::Unevaluated)
    }

    /// Newest offered version of `wanted`'s package that is at least
    /// `wanted` and inside `incorporation`, preferred publishers first.
    fn best_candidate(&self, wanted: &Fmri, incorporation: Option<&Fmri>) -> Option<Fmri> {
        let config = self.image.config();
        let mut candidates: Vec<Fmri> = self
            .repo
            .fmris()
            .into_iter()
            .filter(|c| c.is_same_pkg(wanted) && c.is_successor(wanted))
            .filter(|c| match (&wanted.publisher, &c.publisher) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .filter(|c| incorporation.map(|i| incorporates(c, i)).unwrap_or(true))
            .collect();
        candidates.sort_by(|a, b| {
            config
                .publisher_rank(a.publisher.as_deref())
                .cmp(&config.publisher_rank(b.publisher.as_deref()))
                .then_with(|| b.version.cmp(&a.version))
        });
        candidates.into_iter().next()
    }

    /// Propose installing `fmri`. An unversioned FMRI means the newest
    /// version offered. Returns false if that version is already
    /// installed and nothing was proposed.
    pub fn propose_fmri(&mut self, fmri: Fmri) -> Result<bool> {
        self.expect_proposing("propose")?;
        let fmri = if fmri.version.is_none() {
            self.best_candidate(&fmri, None)
                .ok_or_else(|| RepositoryError::NotFound(fmri.to_string()))?
        } else {
            fmri
        };

        if self.image.is_installed(&fmri) {
            info!(%fmri, "already installed, skipping");
            return Ok(false);
        }
        if let Some(rem) = self.target_rem_fmris.iter().find(|r| r.is_same_pkg(&fmri)) {
            return Err(PlanError::ConflictingProposal {
                fmri: fmri.to_string(),
                other: rem.to_string(),
            });
        }
        if let Some(existing) = self.target_fmris.iter().find(|t| t.is_same_pkg(&fmri)) {
            if existing.version == fmri.version {
                return Ok(true);
            }
            return Err(PlanError::ConflictingProposal {
                fmri: fmri.to_string(),
                other: existing.to_string(),
            });
        }
        debug!(%fmri, "proposed for installation");
        self.explicit.insert(fmri.stem().to_string());
        self.target_fmris.push(fmri);
        Ok(true)
    }

    /// Propose removing the installed package named by `fmri`.
    pub fn propose_fmri_removal(&mut self, fmri: Fmri) -> Result<()> {
        self.expect_proposing("propose removal")?;
        let installed = match self.image.installed_fmri(fmri.stem()) {
            Some(i) if fmri.version.is_none() || i.version == fmri.version => i.clone(),
            _ => return Err(PlanError::NotInstalled(fmri.to_string())),
        };
        if let Some(t) = self.target_fmris.iter().find(|t| t.is_same_pkg(&fmri)) {
            return Err(PlanError::ConflictingProposal {
                fmri: fmri.to_string(),
                other: t.to_string(),
            });
        }
        if !self.target_rem_fmris.contains(&installed) {
            debug!(fmri = %installed, "proposed for removal");
            self.target_rem_fmris.push(installed);
        }
        Ok(())
    }

    /// Propose the best match of every pattern for installation.
    pub fn plan_install(&mut self, patterns: &[String]) -> Result<usize> {
        let preferred = self.image.config().preferred_publisher.clone();
        let matches = self
            .image
            .inventory(self.repo, patterns, true, preferred.as_deref(), true)?;
        let mut proposed = 0;
        for (fmri, _) in matches {
            if self.propose_fmri(fmri)? {
                proposed += 1;
            }
        }
        Ok(proposed)
    }

    /// Propose removal of the installed packages matching `patterns`.
    pub fn plan_uninstall(&mut self, patterns: &[String]) -> Result<()> {
        let matches = self.image.inventory(self.repo, patterns, false, None, false)?;
        for (fmri, _) in matches {
            self.propose_fmri_removal(fmri)?;
        }
        Ok(())
    }

    /// Propose the newest version of every installed package.
    pub fn plan_update(&mut self) -> Result<usize> {
        let installed: Vec<Fmri> = self.image.installed_fmris().cloned().collect();
        let mut proposed = 0;
        for fmri in installed {
            let wanted = Fmri::new(fmri.stem());
            match self.best_candidate(&wanted, None) {
                Some(newest) if newest.version > fmri.version => {
                    if self.propose_fmri(newest)? {
                        proposed += 1;
                    }
                }
                _ => debug!(%fmri, "no newer version"),
            }
        }
        Ok(proposed)
    }

    /// Resolve dependencies, build the package plans and merge them into
    /// the global phase lists.
    pub fn evaluate(&mut self) -> Result<()> {
        self.expect_proposing("evaluate")?;
        self.evaluate_attempted = true;
        self.tracker.evaluate_start();

        self.evaluate_fmris()?;
        self.evaluate_removals()?;
        self.state = PlanState::EvaluatedPkgs;

        self.build_pkg_plans()?;
        self.merge()?;
        self.state = PlanState::EvaluatedOk;
        self.tracker.evaluate_done();
        info!(packages = self.pkg_plans.len(), "plan evaluated");
        Ok(())
    }

    fn proposed(&self, stem: &str) -> Option<&Fmri> {
        self.target_fmris.iter().find(|t| t.stem() == stem)
    }

    fn is_satisfied(&self, dep: &Fmri) -> bool {
        self.image.has_version_installed(dep) || self.target_fmris.iter().any(|t| t.is_successor(dep))
    }

    /// Add a dependency pulled in during closure. A newer version replaces
    /// an older one pulled in before; explicit proposals are never
    /// replaced.
    fn add_target(&mut self, candidate: Fmri) -> Result<bool> {
        if let Some(rem) = self.target_rem_fmris.iter().find(|r| r.is_same_pkg(&candidate)) {
            return Err(PlanError::ConflictingProposal {
                fmri: candidate.to_string(),
                other: rem.to_string(),
            });
        }
        let pos = match self.target_fmris.iter().position(|t| t.is_same_pkg(&candidate)) {
            Some(pos) => pos,
            None => {
                debug!(fmri = %candidate, "pulled in as dependency");
                self.target_fmris.push(candidate);
                return Ok(true);
            }
        };
        if self.target_fmris[pos].is_successor(&candidate) {
            return Ok(false);
        }
        if self.explicit.contains(candidate.stem()) {
            return Err(PlanError::ConflictingProposal {
                fmri: candidate.to_string(),
                other: self.target_fmris[pos].to_string(),
            });
        }
        debug!(from = %self.target_fmris[pos], to = %candidate, "replacing with successor");
        self.target_fmris[pos] = candidate;
        Ok(true)
    }

    /// Walk the dependencies of every target. Each distinct FMRI is
    /// expanded once, which also breaks dependency cycles.
    fn evaluate_fmris(&mut self) -> Result<()> {
        let mut errors: Vec<PlanError> = Vec::new();
        let mut unresolved: Vec<UnresolvedDependency> = Vec::new();
        let mut incorporations: HashMap<String, Fmri> = HashMap::new();
        let mut excludes: Vec<(Fmri, Fmri)> = Vec::new();
        let mut visited: HashSet<Fmri> = HashSet::new();
        let mut queue: VecDeque<Fmri> = self.target_fmris.iter().cloned().collect();

        while !queue.is_empty() {
            while let Some(fmri) = queue.pop_front() {
                if self.tracker.check_cancel() {
                    return Err(PlanError::Cancelled);
                }
                if !self.target_fmris.contains(&fmri) || !visited.insert(fmri.clone()) {
                    continue;
                }
                self.tracker.evaluate_progress(&fmri);
                let manifest = match self.repo.get_manifest(&fmri) {
                    Ok(m) => m,
                    Err(e) => {
                        errors.push(e.into());
                        continue;
                    }
                };
                let deps: Vec<Dependency> = manifest
                    .gen_actions_by_type(ActionName::Depend, &self.new_filters)
                    .filter_map(Action::as_dependency)
                    .cloned()
                    .collect();

                for dep in deps {
                    let wanted = &dep.fmri;
                    let pull = match &dep.dep_type {
                        DependType::Require => !self.is_satisfied(wanted),
                        DependType::Optional => {
                            (self.require_optional || self.image.older_version_installed(wanted).is_some())
                                && !self.is_satisfied(wanted)
                        }
                        DependType::Transfer => {
                            self.image.older_version_installed(wanted).is_some() && !self.is_satisfied(wanted)
                        }
                        DependType::Incorporate => {
                            if let Err(e) = record_incorporation(&mut incorporations, wanted, &fmri) {
                                errors.push(e);
                                continue;
                            }
                            let proposed_older = self
                                .proposed(wanted.stem())
                                .map(|p| p.version < wanted.version)
                                .unwrap_or(false);
                            self.image.older_version_installed(wanted).is_some() || proposed_older
                        }
                        DependType::Exclude => {
                            excludes.push((wanted.clone(), fmri.clone()));
                            false
                        }
                        DependType::Other(t) => {
                            debug!(dep_type = %t, fmri = %wanted, "ignoring dependency type");
                            false
                        }
                    };
                    if !pull {
                        continue;
                    }

                    match self.best_candidate(wanted, incorporations.get(wanted.stem())) {
                        Some(candidate) => match self.add_target(candidate.clone()) {
                            Ok(true) => queue.push_back(candidate),
                            Ok(false) => {}
                            Err(e) => errors.push(e),
                        },
                        None => unresolved.push(UnresolvedDependency {
                            fmri: wanted.to_string(),
                            required_by: fmri.to_string(),
                        }),
                    }
                }
            }

            // Targets chosen before an incorporation on them was seen.
            for (stem, incorporation) in &incorporations {
                let current = match self.proposed(stem) {
                    Some(c) if !incorporates(c, incorporation) => c.clone(),
                    _ => continue,
                };
                if self.explicit.contains(stem) {
                    errors.push(PlanError::ConflictingProposal {
                        fmri: current.to_string(),
                        other: incorporation.to_string(),
                    });
                    continue;
                }
                match self.best_candidate(&Fmri::new(stem), Some(incorporation)) {
                    Some(candidate) => {
                        debug!(from = %current, to = %candidate, "constrained by incorporation");
                        if let Some(slot) = self.target_fmris.iter_mut().find(|t| t.stem() == stem) {
                            *slot = candidate.clone();
                        }
                        queue.push_back(candidate);
                    }
                    None => unresolved.push(UnresolvedDependency {
                        fmri: incorporation.to_string(),
                        required_by: current.to_string(),
                    }),
                }
            }
            if !errors.is_empty() || !unresolved.is_empty() {
                break;
            }
        }

        for (excluded, by) in &excludes {
            if !self.target_fmris.iter().any(|t| t.is_same_pkg(by)) {
                continue;
            }
            let removed = |f: &Fmri| self.target_rem_fmris.iter().any(|r| r.is_same_pkg(f));
            let present = self
                .target_fmris
                .iter()
                .chain(
                    self.image
                        .installed_fmris()
                        .filter(|f| self.proposed(f.stem()).is_none() && !removed(*f)),
                )
                .find(|f| f.is_successor(excluded));
            if let Some(present) = present {
                errors.push(PlanError::ExcludedDependency {
                    fmri: present.to_string(),
                    excluded_by: by.to_string(),
                });
            }
        }

        if !unresolved.is_empty() {
            errors.push(PlanError::UnresolvedDependencies { unresolved });
        }
        match PlanError::collect(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Expand removals to their dependents, dependents first.
    fn evaluate_removals(&mut self) -> Result<()> {
        let explicit: HashSet<String> = self
            .target_rem_fmris
            .iter()
            .map(|f| f.stem().to_string())
            .collect();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut errors = Vec::new();
        for fmri in &self.target_rem_fmris {
            if let Err(e) = self.collect_removal(fmri, &explicit, &mut seen, &mut order) {
                errors.push(e);
            }
        }
        if let Some(e) = PlanError::collect(errors) {
            return Err(e);
        }
        self.target_rem_fmris = order;
        Ok(())
    }

    fn collect_removal(
        &self,
        fmri: &Fmri,
        explicit: &HashSet<String>,
        seen: &mut HashSet<String>,
        out: &mut Vec<Fmri>,
    ) -> Result<()> {
        if !seen.insert(fmri.stem().to_string()) {
            return Ok(());
        }
        let dependents = self.image.get_dependents(fmri)?;
        if !self.recursive_removal {
            let blocking: Vec<String> = dependents
                .iter()
                .filter(|d| !explicit.contains(d.stem()))
                .map(|d| d.to_string())
                .collect();
            if !blocking.is_empty() {
                return Err(PlanError::NonLeafPackage {
                    fmri: fmri.to_string(),
                    dependents: blocking,
                });
            }
        } else {
            for d in &dependents {
                self.collect_removal(d, explicit, seen, out)?;
            }
        }
        out.push(fmri.clone());
        Ok(())
    }

    fn build_pkg_plans(&mut self) -> Result<()> {
        for target in self.target_fmris.clone() {
            let origin = self.image.installed_fmri(target.stem()).cloned();
            if let Some(o) = &origin {
                if o.version == target.version {
                    info!(fmri = %target, "already installed, skipping");
                    continue;
                }
            }
            self.tracker.evaluate_progress(&target);
            let dest = self.repo.get_manifest(&target)?;
            let mut pp = PkgPlan::new();
            match origin {
                Some(o) => {
                    let om = Arc::new(self.image.load_manifest(&o)?);
                    pp.propose(Some((o, om)), Some((target, dest)));
                }
                None => pp.propose_destination(&*self.image, target, dest)?,
            }
            pp.evaluate(&self.old_filters, &self.new_filters)?;
            self.pkg_plans.push(pp);
        }
        for rem in self.target_rem_fmris.clone() {
            self.tracker.evaluate_progress(&rem);
            let om = Arc::new(self.image.load_manifest(&rem)?);
            let mut pp = PkgPlan::new();
            pp.propose_removal(rem, om)?;
            pp.evaluate(&self.old_filters, &self.new_filters)?;
            self.pkg_plans.push(pp);
        }
        Ok(())
    }

    fn final_image(&self) -> Result<FinalImage> {
        let touched: HashSet<&str> = self.pkg_plans.iter().map(PkgPlan::stem).collect();
        let mut fin = FinalImage::default();
        for fmri in self.image.installed_fmris() {
            if !touched.contains(fmri.stem()) {
                fin.add(&self.image.load_manifest(fmri)?, &self.new_filters);
            }
        }
        for pp in &self.pkg_plans {
            if let Some(m) = pp.destination_manifest() {
                fin.add(m, &self.new_filters);
            }
        }
        fin.dirs.extend(IMAGE_DIRS.iter().map(|d| d.to_string()));
        Ok(fin)
    }

    /// Combine every package's actions into one removal, install and
    /// update list ordered across packages.
    fn merge(&mut self) -> Result<()> {
        let mut removal = Vec::new();
        let mut update = Vec::new();
        let mut install = Vec::new();
        // (package, position in its install list) for every install step
        let mut install_pos = Vec::new();

        for (p, pp) in self.pkg_plans.iter().enumerate() {
            for src in pp.gen_removal_actions() {
                track_account(&mut self.removed_users, &mut self.removed_groups, src, pp.origin_fmri());
                removal.push(PlanStep {
                    pkg: p,
                    src: Some(src.clone()),
                    dst: None,
                });
            }
            for (src, dst) in pp.gen_update_actions() {
                track_account(&mut self.added_users, &mut self.added_groups, dst, pp.destination_fmri());
                update.push(PlanStep {
                    pkg: p,
                    src: Some(src.clone()),
                    dst: Some(dst.clone()),
                });
            }
            for (i, dst) in pp.gen_install_actions().iter().enumerate() {
                track_account(&mut self.added_users, &mut self.added_groups, dst, pp.destination_fmri());
                install.push(PlanStep {
                    pkg: p,
                    src: None,
                    dst: Some(dst.clone()),
                });
                install_pos.push((p, i));
            }
        }
        self.removed_users.retain(|u, _| !self.added_users.contains_key(u));
        self.removed_groups.retain(|g, _| !self.added_groups.contains_key(g));

        let fin = self.final_image()?;
        let mut removal: Vec<PlanStep> = removal
            .into_iter()
            .filter(|step| match &step.src {
                Some(src) if fin.retains(src) => {
                    debug!(action = %src.name(), key = ?src.key_value(), "still in the final image, not removing");
                    false
                }
                _ => true,
            })
            .collect();

        // Removals a later install may take over: by type and key, and for
        // files also by original name.
        let mut cons_generic: HashMap<(ActionName, String), usize> = HashMap::new();
        let mut cons_named: HashMap<String, usize> = HashMap::new();
        for (i, step) in removal.iter().enumerate() {
            let src = match &step.src {
                Some(s) => s,
                None => continue,
            };
            self.actuators.scan_removal(src);
            if !src.globally_unique() {
                continue;
            }
            if let Some(key) = src.key_value() {
                cons_generic.insert((src.name(), key), i);
            }
            if let Some(f) = src.as_file() {
                let name = match &f.original_name {
                    Some(n) => n.clone(),
                    None => format!("{}:{}", self.pkg_plans[step.pkg].stem(), f.path),
                };
                cons_named.insert(name, i);
            }
        }

        let mut moves: Vec<(usize, usize)> = Vec::new();
        let mut dropped_removals: HashSet<usize> = HashSet::new();
        let mut dropped_installs: HashSet<usize> = HashSet::new();
        for k in 0..install.len() {
            let (name, key, unique, original, path) = match &install[k].dst {
                Some(dst) => {
                    self.actuators.scan_install(dst);
                    (
                        dst.name(),
                        dst.key_value(),
                        dst.globally_unique(),
                        dst.as_file().and_then(|f| f.original_name.clone()),
                        dst.path().map(str::to_string),
                    )
                }
                None => continue,
            };

            if let Some(cache) = original {
                if let Some(&idx) = cons_named.get(&cache) {
                    if !dropped_removals.contains(&idx) {
                        let old_path = removal[idx].src.as_ref().and_then(Action::path).map(str::to_string);
                        if old_path == path {
                            moves.push((idx, k));
                            dropped_removals.insert(idx);
                            dropped_installs.insert(k);
                            if let Some(p) = &path {
                                cons_generic.remove(&(ActionName::File, p.clone()));
                            }
                        } else {
                            info!(from = ?old_path, to = ?path, name = %cache, "carrying over editable file");
                            if let Some(ra) = removal[idx].src.as_mut() {
                                ra.set_attr("save_file", &cache);
                            }
                            if let Some(dst) = install[k].dst.as_mut() {
                                dst.set_attr("save_file", &cache);
                            }
                        }
                    }
                }
            }

            if dropped_installs.contains(&k) || !unique {
                continue;
            }
            if let Some(idx) = key.and_then(|key| cons_generic.get(&(name, key)).copied()) {
                if !dropped_removals.contains(&idx) {
                    moves.push((idx, k));
                    dropped_removals.insert(idx);
                    dropped_installs.insert(k);
                }
            }
        }

        let mut per_pkg: BTreeMap<usize, Vec<(usize, Action)>> = BTreeMap::new();
        for (idx, k) in moves {
            let (src, dst) = match (&removal[idx].src, &install[k].dst) {
                (Some(s), Some(d)) => (s.clone(), d.clone()),
                _ => {
                    return Err(PlanError::InvariantViolation(
                        "consolidated step lost its action".to_string(),
                    ))
                }
            };
            debug!(action = %dst.name(), key = ?dst.key_value(), "moving between packages");
            let (p, pos) = install_pos[k];
            if src.different(&dst) {
                update.push(PlanStep {
                    pkg: p,
                    src: Some(src.clone()),
                    dst: Some(dst),
                });
            }
            per_pkg.entry(p).or_default().push((pos, src));
        }
        for (p, moved) in per_pkg {
            self.pkg_plans[p].absorb_moves(moved);
        }

        let mut removal: Vec<PlanStep> = removal
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !dropped_removals.contains(i))
            .map(|(_, s)| s)
            .collect();
        let mut install: Vec<PlanStep> = install
            .into_iter()
            .enumerate()
            .filter(|(k, _)| !dropped_installs.contains(k))
            .map(|(_, s)| s)
            .collect();

        // Rewriting a file breaks every hardlink to it.
        let handled: HashSet<String> = update
            .iter()
            .chain(install.iter())
            .filter_map(|s| s.dst.as_ref())
            .filter(|a| a.name() == ActionName::Hardlink)
            .filter_map(|a| a.path().map(str::to_string))
            .collect();
        let mut refresh = Vec::new();
        for step in &update {
            if let Some(src) = &step.src {
                self.actuators.scan_update(src);
            }
            let dst = match &step.dst {
                Some(d) => d,
                None => continue,
            };
            self.actuators.scan_update(dst);
            let links = match dst.as_file().and_then(|f| fin.link_targets.get(&f.path)) {
                Some(links) => links,
                None => continue,
            };
            for (path, link) in links {
                if handled.contains(path) {
                    continue;
                }
                refresh.push(PlanStep {
                    pkg: step.pkg,
                    src: Some(link.clone()),
                    dst: Some(link.clone()),
                });
            }
        }
        update.extend(refresh);

        removal.sort_by(|a, b| b.src.cmp(&a.src));
        install.sort_by(|a, b| a.dst.cmp(&b.dst));
        update.sort_by(|a, b| a.dst.cmp(&b.dst));

        debug!(
            removals = removal.len(),
            installs = install.len(),
            updates = update.len(),
            "actions merged"
        );
        self.phases = Some(PhaseLists {
            removal,
            install,
            update,
        });
        Ok(())
    }

    /// True if running the plan would not change anything.
    pub fn nothing_to_do(&self) -> bool {
        match self.state {
            PlanState::Unevaluated | PlanState::EvaluatedPkgs => {
                self.target_fmris.is_empty() && self.target_rem_fmris.is_empty()
            }
            _ => self.pkg_plans.iter().all(PkgPlan::is_empty),
        }
    }

    pub fn pkg_plans(&self) -> &[PkgPlan] {
        &self.pkg_plans
    }

    pub fn planned_ops(&self) -> Vec<PlannedOp> {
        self.pkg_plans
            .iter()
            .filter_map(|pp| match (pp.origin_fmri(), pp.destination_fmri()) {
                (Some(from), Some(to)) => Some(PlannedOp::Update {
                    from: from.clone(),
                    to: to.clone(),
                }),
                (None, Some(to)) => Some(PlannedOp::Install(to.clone())),
                (Some(from), None) => Some(PlannedOp::Remove(from.clone())),
                (None, None) => None,
            })
            .collect()
    }

    pub fn removal_actions(&self) -> &[PlanStep] {
        self.phases.as_ref().map(|p| p.removal.as_slice()).unwrap_or_default()
    }

    pub fn install_actions(&self) -> &[PlanStep] {
        self.phases.as_ref().map(|p| p.install.as_slice()).unwrap_or_default()
    }

    pub fn update_actions(&self) -> &[PlanStep] {
        self.phases.as_ref().map(|p| p.update.as_slice()).unwrap_or_default()
    }

    /// Human readable rendering of the package changes and, once
    /// evaluated, of every phase.
    pub fn get_plan(&self) -> String {
        let mut out = String::new();
        for op in self.planned_ops() {
            out.push_str(&format!("{}\n", op));
        }
        let phases = [
            ("remove", self.removal_actions()),
            ("install", self.install_actions()),
            ("update", self.update_actions()),
        ];
        for (label, steps) in phases {
            for step in steps {
                if let Some(a) = step.action() {
                    let key = a.key_value().unwrap_or_else(|| a.canonical());
                    out.push_str(&format!("  {} {} {}\n", label, a.name(), key));
                }
            }
        }
        out
    }

    pub fn actuators(&self) -> &Actuators {
        &self.actuators
    }

    pub fn reboot_needed(&self) -> bool {
        self.actuators.reboot_needed()
    }

    pub fn added_users(&self) -> &BTreeMap<String, Fmri> {
        &self.added_users
    }

    pub fn removed_users(&self) -> &BTreeMap<String, Fmri> {
        &self.removed_users
    }

    pub fn added_groups(&self) -> &BTreeMap<String, Fmri> {
        &self.added_groups
    }

    pub fn removed_groups(&self) -> &BTreeMap<String, Fmri> {
        &self.removed_groups
    }

    /// Accept or display a license of the package `stem` is going to.
    pub fn set_license_status(
        &mut self,
        stem: &str,
        license: &str,
        accepted: Option<bool>,
        displayed: Option<bool>,
    ) -> bool {
        self.pkg_plans
            .iter_mut()
            .filter(|pp| pp.destination_fmri().map(|f| f.stem() == stem).unwrap_or(false))
            .any(|pp| pp.set_license_status(license, accepted, displayed))
    }

    /// The last search index problem, if one was worked around.
    pub fn index_error(&self) -> Option<&IndexError> {
        self.index_error.as_ref()
    }

    fn installed_manifests(&self) -> Vec<(Fmri, PathBuf)> {
        self.image
            .installed_fmris()
            .map(|f| (f.clone(), self.image.manifest_path(f)))
            .collect()
    }

    fn rebuild_index(&mut self, index: &LocalIndex, cause: IndexError) {
        let installed = self.installed_manifests();
        match index.rebuild_search_index(&self.new_filters, &installed) {
            Ok(()) => self.index_error = Some(cause),
            Err(e) => {
                warn!(error = %e, "search index rebuild failed");
                self.index_error = Some(e);
            }
        }
    }

    /// Make sure the index covers exactly the installed packages so the
    /// incremental update after execution applies cleanly.
    fn prepare_index(&mut self) {
        let index = LocalIndex::new(self.image.index_dir());
        match index.check_index(&self.installed_manifests(), false) {
            Ok(()) => {}
            Err(IndexError::Missing(path)) => {
                info!(?path, "no search index yet, building one");
                let installed = self.installed_manifests();
                if let Err(e) = index.rebuild_search_index(&self.old_filters, &installed) {
                    warn!(error = %e, "search index build failed");
                    self.index_error = Some(e);
                }
            }
            Err(e) => {
                warn!(error = %e, "search index is inconsistent, rebuilding");
                self.rebuild_index(&index, e);
            }
        }
    }

    fn fetch_content(&self) -> Result<()> {
        let errors: Vec<PlanError> = self.pkg_plans.iter().flat_map(PkgPlan::preexecute).collect();
        if let Some(e) = PlanError::collect(errors) {
            return Err(e);
        }

        let (files, bytes) = self
            .pkg_plans
            .iter()
            .map(|pp| pp.xfer_stats(self.image.path()))
            .fold((0, 0), |(f, b), (pf, pb)| (f + pf, b + pb));
        self.tracker.download_set_goal(self.pkg_plans.len(), files, bytes);
        for pp in &self.pkg_plans {
            if self.tracker.check_cancel() {
                return Err(PlanError::Cancelled);
            }
            pp.download(self.repo, &*self.image, self.tracker)?;
        }
        self.tracker.download_done();
        Ok(())
    }

    /// Check licenses and fetch all content. Nothing in the image changes
    /// here, so this is the last point at which cancelling is safe.
    pub fn preexecute(&mut self) -> Result<()> {
        self.expect_state("preexecute", PlanState::EvaluatedOk)?;
        if self.nothing_to_do() {
            self.state = PlanState::PreexecutedOk;
            return Ok(());
        }
        if self.index_enabled {
            self.prepare_index();
        }
        match self.fetch_content() {
            Ok(()) => {
                self.state = PlanState::PreexecutedOk;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "preexecute failed");
                self.state = PlanState::PreexecutedError;
                Err(e)
            }
        }
    }

    fn run_phase<F>(&self, label: &str, steps: Vec<PlanStep>, mut apply: F) -> Result<()>
    where
        F: FnMut(&PkgPlan, PlanStep) -> Result<()>,
    {
        info!(phase = label, actions = steps.len(), "starting phase");
        self.tracker.actions_set_goal(label, steps.len());
        for step in steps {
            let pp = self.pkg_plans.get(step.pkg).ok_or_else(|| {
                PlanError::InvariantViolation(format!("step refers to missing package plan {}", step.pkg))
            })?;
            apply(pp, step)?;
            self.tracker.actions_add_progress();
        }
        self.tracker.actions_done();
        Ok(())
    }

    fn run_phases(&mut self, phases: PhaseLists) -> Result<Vec<IndexUpdate>> {
        let mut exec = Executor::new(
            self.image.path(),
            &self.image.download_dir(),
            &self.image.stash_dir(),
            self.apply.clone(),
        );
        let PhaseLists {
            removal,
            install,
            update,
        } = phases;

        self.run_phase("Removal Phase", removal, |pp, step| match &step.src {
            Some(src) => pp.execute_removal(&mut exec, src),
            None => Ok(()),
        })?;
        self.run_phase("Install Phase", install, |pp, step| match &step.dst {
            Some(dst) => pp.execute_install(&mut exec, dst),
            None => Ok(()),
        })?;
        self.run_phase("Update Phase", update, |pp, step| match (&step.src, &step.dst) {
            (Some(src), Some(dst)) => pp.execute_update(&mut exec, src, dst),
            (None, Some(dst)) => pp.execute_install(&mut exec, dst),
            _ => Ok(()),
        })?;

        if self.apply.dry_run {
            return Ok(Vec::new());
        }
        let mut executed = Vec::new();
        for pp in std::mem::take(&mut self.pkg_plans) {
            pp.postexecute(self.image)?;
            let dest_fmri = pp.destination_fmri().cloned();
            executed.push(IndexUpdate {
                dest_path: dest_fmri.as_ref().map(|f| self.image.manifest_path(f)),
                dest_fmri,
                origin_fmri: pp.origin_fmri().cloned(),
                origin_path: None,
            });
        }
        Ok(executed)
    }

    fn update_index(&mut self, updates: &[IndexUpdate]) {
        let index = LocalIndex::new(self.image.index_dir());
        self.tracker.index_set_goal("Index Phase", updates.len());
        match index.client_update_index(&self.new_filters, updates) {
            Ok(()) => updates.iter().for_each(|_| self.tracker.index_add_progress()),
            Err(e) => {
                warn!(error = %e, "incremental search index update failed, rebuilding");
                self.rebuild_index(&index, e);
            }
        }
        self.tracker.index_done();
    }

    /// Run the removal, install and update phases, then record the new
    /// package state and update the search index.
    ///
    /// A failure while a phase runs is not rolled back; the image may be
    /// left partially updated.
    pub fn execute(&mut self) -> Result<()> {
        self.expect_state("execute", PlanState::PreexecutedOk)?;
        if self.nothing_to_do() {
            self.state = PlanState::ExecutedOk;
            return Ok(());
        }
        let phases = self.phases.take().unwrap_or_default();
        let executed = match self.run_phases(phases) {
            Ok(executed) => executed,
            Err(e) => {
                error!(error = %e, "execution failed, the image may be inconsistent");
                self.state = PlanState::ExecutedError;
                return Err(e);
            }
        };
        self.state = PlanState::ExecutedOk;
        self.target_fmris.clear();
        self.target_rem_fmris.clear();

        for svc in self.actuators.restart_fmris() {
            info!(service = %svc, "service needs a restart");
        }
        for svc in self.actuators.refresh_fmris() {
            info!(service = %svc, "service needs a refresh");
        }
        if self.actuators.reboot_needed() {
            warn!("changes take effect after a reboot");
        }

        if self.index_enabled && !executed.is_empty() {
            self.update_index(&executed);
        }
        Ok(())
    }
}

/// Keep the most specific of the incorporations seen for one package.
fn record_incorporation(
    incorporations: &mut HashMap<String, Fmri>,
    wanted: &Fmri,
    by: &Fmri,
) -> Result<()> {
    match incorporations.get(wanted.stem()) {
        None => {}
        Some(existing) if incorporates(wanted, existing) => {}
        Some(existing) if incorporates(existing, wanted) => return Ok(()),
        Some(existing) => {
            return Err(PlanError::ConflictingProposal {
                fmri: format!("{} (incorporated by {})", wanted, by),
                other: existing.to_string(),
            })
        }
    }
    incorporations.insert(wanted.stem().to_string(), wanted.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::ImageConfig;
    use crate::progress::NoopProgressTracker;
    use crate::repository::MemoryRepository;
    use tempfile::tempdir;

    fn fmri(s: &str) -> Fmri {
        Fmri::parse(s).unwrap()
    }

    #[test]
    fn incorporations_narrow() {
        let by = fmri("pkg:/entire@1.0");
        let mut incs = HashMap::new();
        record_incorporation(&mut incs, &fmri("pkg:/zlib@1.2"), &by).unwrap();
        record_incorporation(&mut incs, &fmri("pkg:/zlib@1.2.13"), &by).unwrap();
        assert_eq!(incs["zlib"], fmri("pkg:/zlib@1.2.13"));
        // a looser constraint keeps the narrower one
        record_incorporation(&mut incs, &fmri("pkg:/zlib@1"), &by).unwrap();
        assert_eq!(incs["zlib"], fmri("pkg:/zlib@1.2.13"));
        assert!(matches!(
            record_incorporation(&mut incs, &fmri("pkg:/zlib@1.3"), &by),
            Err(PlanError::ConflictingProposal { .. })
        ));

        assert!(incorporates(&fmri("pkg:/zlib@1.2.13.1"), &fmri("pkg:/zlib@1.2.13")));
        assert!(!incorporates(&fmri("pkg:/zlib@1.2.14"), &fmri("pkg:/zlib@1.2.13")));
    }

    #[test]
    fn planned_op_display() {
        let a = fmri("pkg:/foo@1.0");
        let b = fmri("pkg:/foo@1.1");
        assert_eq!(PlannedOp::Install(b.clone()).to_string(), format!("None -> {}", b));
        assert_eq!(
            PlannedOp::Update { from: a.clone(), to: b.clone() }.to_string(),
            format!("{} -> {}", a, b)
        );
        assert_eq!(PlannedOp::Remove(a.clone()).to_string(), format!("{} -> None", a));
    }

    #[test]
    fn steps_run_in_order_only() {
        let tmp = tempdir().unwrap();
        let mut image = Image::create(tmp.path(), ImageConfig::default()).unwrap();
        let repo = MemoryRepository::new();
        let tracker = NoopProgressTracker::default();
        let mut plan = ImagePlan::new(&mut image, &repo, &tracker);

        assert!(plan.nothing_to_do());
        assert!(matches!(
            plan.execute(),
            Err(PlanError::StatePrecondition { state: PlanState::Unevaluated, .. })
        ));
        plan.evaluate().unwrap();
        assert_eq!(plan.state(), PlanState::EvaluatedOk);
        assert!(plan.evaluate().is_err());
        assert!(plan.propose_fmri(fmri("pkg:/foo@1.0")).is_err());
        plan.preexecute().unwrap();
        plan.execute().unwrap();
        assert_eq!(plan.state(), PlanState::ExecutedOk);
        assert!(plan.get_plan().is_empty());
    }
}
