//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::actions::{parse_actions, Action, ActionError, ActionKind, ActionName};
use crate::filter::{apply_filters, Filter};
use crate::fmri::{Fmri, FmriError};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fmri(#[from] FmriError),

    #[error("failed to read manifest {path}")]
    #[diagnostic(code(ips::manifest_error::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest JSON error: {0}")]
    #[diagnostic(
        code(ips::manifest_error::json),
        help("Check the JSON format and try again")
    )]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ManifestError>;

/// All actions delivered by one version of one package.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub fmri: Option<Fmri>,
    pub actions: Vec<Action>,
}

/// What it takes to go from one manifest to another.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestDifference {
    pub added: Vec<Action>,
    /// (origin, destination) pairs
    pub changed: Vec<(Action, Action)>,
    pub removed: Vec<Action>,
}

impl ManifestDifference {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Actions carrying the same (type, key) are candidates for being the same
/// object in two manifests. Unkeyed actions are identified by their full
/// canonical form.
fn diff_key(a: &Action) -> (usize, ActionName, String) {
    (
        a.order(),
        a.name(),
        a.key_value().unwrap_or_else(|| a.canonical()),
    )
}

fn keyed<'a>(actions: impl Iterator<Item = &'a Action>) -> Vec<Keyed<'a>> {
    let mut v: Vec<_> = actions.map(|a| (diff_key(a), a.canonical(), a)).collect();
    v.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    v
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest::default()
    }

    pub fn with_fmri(fmri: Fmri) -> Manifest {
        Manifest {
            fmri: Some(fmri),
            actions: Vec::new(),
        }
    }

    pub fn add_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Parse the text form. `pkg.fmri` in a set action names the package.
    pub fn parse_string(content: &str) -> Result<Manifest> {
        let actions = parse_actions(content)?;
        let mut m = Manifest {
            fmri: None,
            actions,
        };
        if let Some(f) = m.get("pkg.fmri") {
            m.fmri = Some(Fmri::parse(f)?);
        }
        Ok(m)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            return Ok(serde_json::from_str(&content)?);
        }
        Manifest::parse_string(&content)
    }

    /// Actions admitted by every filter.
    pub fn gen_actions<'a>(&'a self, filters: &'a [Filter]) -> impl Iterator<Item = &'a Action> + 'a {
        self.actions.iter().filter(move |a| apply_filters(a, filters))
    }

    pub fn gen_actions_by_type<'a>(
        &'a self,
        name: ActionName,
        filters: &'a [Filter],
    ) -> impl Iterator<Item = &'a Action> + 'a {
        self.gen_actions(filters).filter(move |a| a.name() == name)
    }

    /// First value of the set action `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.actions.iter().find_map(|a| match &a.kind {
            ActionKind::Set(attr) if attr.name == key => attr.values.first().map(String::as_str),
            _ => None,
        })
    }

    /// Every directory the package needs: explicit dir actions plus the
    /// parents of everything it delivers, with all ancestors.
    pub fn get_directories(&self, filters: &[Filter]) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for a in self.gen_actions(filters) {
            if let ActionKind::Dir(d) = &a.kind {
                dirs.insert(d.path.clone());
            }
            dirs.extend(a.directory_references());
        }
        expand_dirs(dirs)
    }

    /// Groups of actions claiming the same (type, key) with conflicting
    /// content. Identical repeats, as for shared directories, are fine.
    pub fn duplicates<'a>(
        &'a self,
        filters: &'a [Filter],
    ) -> Vec<(ActionName, String, Vec<&'a Action>)> {
        let sorted = keyed(self.gen_actions(filters).filter(|a| a.key_value().is_some()));
        let mut out = Vec::new();
        let mut start = 0;
        while start < sorted.len() {
            let key = &sorted[start].0;
            let end = start + sorted[start..].iter().take_while(|x| &x.0 == key).count();
            let group = &sorted[start..end];
            if group.windows(2).any(|w| w[0].2.different(w[1].2)) {
                let (_, name, key) = &group[0].0;
                out.push((*name, key.clone(), group.iter().map(|g| g.2).collect()));
            }
            start = end;
        }
        out
    }

    /// Sort-merge the two filtered action sets on (type, key). Keys on one
    /// side only are additions or removals; keys on both sides become
    /// changes when the actions differ. Licenses present on both sides are
    /// always reported as changed so their acceptance is tracked.
    pub fn difference(
        origin: Option<&Manifest>,
        destination: &Manifest,
        origin_filters: &[Filter],
        destination_filters: &[Filter],
    ) -> ManifestDifference {
        let old = match origin {
            Some(o) => keyed(o.gen_actions(origin_filters)),
            None => Vec::new(),
        };
        let new = keyed(destination.gen_actions(destination_filters));

        let mut diff = ManifestDifference::default();
        let (mut i, mut j) = (0, 0);
        while i < old.len() || j < new.len() {
            let ord = match (old.get(i), new.get(j)) {
                (Some(o), Some(n)) => o.0.cmp(&n.0),
                (Some(_), None) => Ordering::Less,
                (None, _) => Ordering::Greater,
            };
            match ord {
                Ordering::Less => {
                    diff.removed.push(old[i].2.clone());
                    i += 1;
                }
                Ordering::Greater => {
                    diff.added.push(new[j].2.clone());
                    j += 1;
                }
                Ordering::Equal => {
                    let key = &old[i].0;
                    let oi = i + old[i..].iter().take_while(|x| &x.0 == key).count();
                    let nj = j + new[j..].iter().take_while(|x| &x.0 == key).count();
                    pair_group(&old[i..oi], &new[j..nj], &mut diff);
                    i = oi;
                    j = nj;
                }
            }
        }
        diff
    }

    /// Pure set partition on the canonical form:
    /// (only in `old`, only in `new`, in both).
    pub fn diff<'a>(
        old: &'a Manifest,
        new: &'a Manifest,
    ) -> (Vec<&'a Action>, Vec<&'a Action>, Vec<&'a Action>) {
        let mut a: Vec<(String, &Action)> = old.actions.iter().map(|x| (x.canonical(), x)).collect();
        let mut b: Vec<(String, &Action)> = new.actions.iter().map(|x| (x.canonical(), x)).collect();
        a.sort_by(|x, y| x.0.cmp(&y.0));
        b.sort_by(|x, y| x.0.cmp(&y.0));

        let (mut only_old, mut only_new, mut common) = (Vec::new(), Vec::new(), Vec::new());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].0.cmp(&b[j].0) {
                Ordering::Less => {
                    only_old.push(a[i].1);
                    i += 1;
                }
                Ordering::Greater => {
                    only_new.push(b[j].1);
                    j += 1;
                }
                Ordering::Equal => {
                    common.push(a[i].1);
                    i += 1;
                    j += 1;
                }
            }
        }
        only_old.extend(a[i..].iter().map(|x| x.1));
        only_new.extend(b[j..].iter().map(|x| x.1));
        (only_old, only_new, common)
    }
}

type Keyed<'a> = ((usize, ActionName, String), String, &'a Action);

/// Match up actions sharing one key. Identical actions cancel out, the
/// rest pair up in canonical order.
fn pair_group(old: &[Keyed<'_>], new: &[Keyed<'_>], diff: &mut ManifestDifference) {
    if let ([o], [n]) = (old, new) {
        if o.2.name() == ActionName::License || o.2.different(n.2) {
            diff.changed.push((o.2.clone(), n.2.clone()));
        }
        return;
    }

    let mut rest_old = Vec::new();
    let mut rest_new = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].1.cmp(&new[j].1) {
            Ordering::Less => {
                rest_old.push(old[i].2);
                i += 1;
            }
            Ordering::Greater => {
                rest_new.push(new[j].2);
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    rest_old.extend(old[i..].iter().map(|x| x.2));
    rest_new.extend(new[j..].iter().map(|x| x.2));

    let paired = rest_old.len().min(rest_new.len());
    for (o, n) in rest_old.iter().zip(rest_new.iter()) {
        diff.changed.push(((*o).clone(), (*n).clone()));
    }
    diff.removed.extend(rest_old[paired..].iter().map(|a| (*a).clone()));
    diff.added.extend(rest_new[paired..].iter().map(|a| (*a).clone()));
}

/// Add every ancestor of every directory in `dirs`.
pub fn expand_dirs<I: IntoIterator<Item = String>>(dirs: I) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for d in dirs {
        let mut cur = d.trim_matches('/').to_string();
        while !cur.is_empty() {
            if !out.insert(cur.clone()) {
                break;
            }
            cur = match cur.rsplit_once('/') {
                Some((parent, _)) => parent.to_string(),
                None => String::new(),
            };
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::compile_filter;

    const FOO_11: &str = "set name=pkg.fmri value=pkg://test/foo@1.1,5.11-0.1:20240101T000000Z
set name=pkg.summary value=\"foo library\"
dir path=lib mode=0755 owner=root group=bin
file 1111 path=lib/libc.so.1 mode=0555 owner=root group=bin
file 2222 path=lib/amd64/libc.so.1 mode=0555 variant.arch=i386 pkg.size=10
depend fmri=pkg:/bar@1.0 type=require
";

    fn m(text: &str) -> Manifest {
        Manifest::parse_string(text).unwrap()
    }

    #[test]
    fn parse_names_package() {
        let man = m(FOO_11);
        assert_eq!(man.fmri.as_ref().unwrap().stem(), "foo");
        assert_eq!(man.get("pkg.summary"), Some("foo library"));
        assert_eq!(man.actions.len(), 6);
        assert_eq!(man.gen_actions_by_type(ActionName::File, &[]).count(), 2);
    }

    #[test]
    fn filtered_generation() {
        let man = m(FOO_11);
        let filters = vec![compile_filter("variant.arch=sparc").unwrap()];
        assert_eq!(man.gen_actions_by_type(ActionName::File, &filters).count(), 1);
    }

    #[test]
    fn directories_are_expanded() {
        let man = m("file 1 path=usr/share/lib/a\nlink path=opt/x/y target=z\n");
        let dirs: Vec<String> = man.get_directories(&[]).into_iter().collect();
        assert_eq!(dirs, vec!["opt", "opt/x", "usr", "usr/share", "usr/share/lib"]);
    }

    #[test]
    fn identical_diff_is_empty() {
        let a = m(FOO_11);
        let diff = Manifest::difference(Some(&a), &a.clone(), &[], &[]);
        assert!(diff.is_empty());
        let (only_old, only_new, common) = Manifest::diff(&a, &a);
        assert!(only_old.is_empty() && only_new.is_empty());
        assert_eq!(common.len(), a.actions.len());
    }

    #[test]
    fn difference_classifies() {
        let old = m("dir path=lib\nfile 1 path=lib/a\nfile 2 path=lib/b\n");
        let new = m("dir path=lib\nfile 1 path=lib/a mode=0444\nfile 3 path=lib/c\n");
        let diff = Manifest::difference(Some(&old), &new, &[], &[]);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].path(), Some("lib/b"));
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].path(), Some("lib/c"));
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].1.path(), Some("lib/a"));

        let fresh = Manifest::difference(None, &new, &[], &[]);
        assert_eq!(fresh.added.len(), 3);
    }

    #[test]
    fn licenses_always_change() {
        let a = m("license 1 license=cddl\n");
        let diff = Manifest::difference(Some(&a), &a, &[], &[]);
        assert_eq!(diff.changed.len(), 1);
    }

    #[test]
    fn repeated_keys_pair_up() {
        let old = m("depend fmri=pkg:/a@1 type=require\ndepend fmri=pkg:/a@1 type=incorporate\n");
        let new = m("depend fmri=pkg:/a@1 type=incorporate\ndepend fmri=pkg:/a@1 type=optional\n");
        let diff = Manifest::difference(Some(&old), &new, &[], &[]);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
    }

    #[test]
    fn duplicates_detected() {
        let man = m("dir path=a mode=0755\ndir path=a mode=0755\nfile 1 path=b\nfile 2 path=b\n");
        let dups = man.duplicates(&[]);
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].0, ActionName::File);
        assert_eq!(dups[0].1, "b");
    }

    #[test]
    fn json_roundtrip() {
        let man = m(FOO_11);
        let text = serde_json::to_string(&man).unwrap();
        let back: Manifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, man);
    }
}
