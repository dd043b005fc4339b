//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

// Source https://docs.oracle.com/cd/E23824_01/html/E21796/pkg-5.html

//! Actions are the unit of package content: one file, one directory, one
//! dependency declaration. Each action kind carries a typed attribute record;
//! attributes without a fixed meaning (facets, variants, actuators, plan
//! markers) live in a side map.

pub mod executors;

use crate::fmri::{Fmri, FmriError};
use miette::Diagnostic;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::result::Result as StdResult;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

type Result<T> = StdResult<T, ActionError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("value {0} is not a boolean")]
    #[diagnostic(
        code(ips::action_error::invalid_boolean),
        help("Boolean values must be 'true', 'false', 't', or 'f'.")
    )]
    NotBooleanValue(String),

    #[error("unknown action {0:?}")]
    #[diagnostic(
        code(ips::action_error::unknown_action),
        help("Check the action name and make sure it's one of the supported action types.")
    )]
    UnknownAction(String),

    #[error("{action} action is missing required attribute {attr:?}")]
    #[diagnostic(code(ips::action_error::missing_attribute))]
    MissingAttribute { action: ActionName, attr: &'static str },

    #[error("attribute {attr:?} of {action} action must have a single value")]
    #[diagnostic(code(ips::action_error::multiple_values))]
    MultipleValues { action: ActionName, attr: &'static str },

    #[error("invalid preserve value {0:?}")]
    #[diagnostic(
        code(ips::action_error::invalid_preserve),
        help("preserve must be one of: true, false, renamenew, renameold")
    )]
    InvalidPreserve(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fmri(#[from] FmriError),

    #[error(transparent)]
    #[diagnostic(code(ips::action_error::parser))]
    ParserError(#[from] pest::error::Error<Rule>),
}

/// The action type tags that may appear at the start of a manifest line.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActionName {
    Set,
    Depend,
    Group,
    User,
    Dir,
    File,
    Hardlink,
    Link,
    Driver,
    Unknown,
    Legacy,
    Signature,
    License,
}

/// Sort order between action types. Directories come before everything
/// they may contain, users and groups before the files they own, hardlinks
/// after the files they alias.
const ACTION_ORDER: [ActionName; 12] = [
    ActionName::Set,
    ActionName::Depend,
    ActionName::Group,
    ActionName::User,
    ActionName::Dir,
    ActionName::File,
    ActionName::Hardlink,
    ActionName::Link,
    ActionName::Driver,
    ActionName::Unknown,
    ActionName::Legacy,
    ActionName::Signature,
];

/// Position of `name` in the action ordering table. Types not listed share
/// the slot of `unknown`.
pub fn type_order(name: ActionName) -> usize {
    ACTION_ORDER
        .iter()
        .position(|n| *n == name)
        .unwrap_or(UNKNOWN_ORDER)
}

const UNKNOWN_ORDER: usize = 9;

/// An attribute value: scalar, or an ordered list when the key repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Single(String),
    List(Vec<String>),
}

impl AttrValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttrValue::Single(v) => vec![v.as_str()],
            AttrValue::List(l) => l.iter().map(String::as_str).collect(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        match self {
            AttrValue::Single(v) => Some(v.as_str()),
            AttrValue::List(l) => l.first().map(String::as_str),
        }
    }

    fn push(self, value: String) -> AttrValue {
        match self {
            AttrValue::Single(v) => AttrValue::List(vec![v, value]),
            AttrValue::List(mut l) => {
                l.push(value);
                AttrValue::List(l)
            }
        }
    }

    fn sorted(&self) -> AttrValue {
        match self {
            AttrValue::Single(v) => AttrValue::Single(v.clone()),
            AttrValue::List(l) => {
                let mut l = l.clone();
                l.sort();
                AttrValue::List(l)
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Single(value.to_string())
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Attr {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DependType {
    Require,
    Optional,
    Incorporate,
    Exclude,
    Transfer,
    #[strum(default)]
    Other(String),
}

impl fmt::Display for DependType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependType::Require => "require",
            DependType::Optional => "optional",
            DependType::Incorporate => "incorporate",
            DependType::Exclude => "exclude",
            DependType::Transfer => "transfer",
            DependType::Other(other) => other.as_str(),
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Dependency {
    pub fmri: Fmri,
    pub dep_type: DependType,
    pub predicate: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Group {
    pub groupname: String,
    pub gid: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct User {
    pub username: String,
    pub uid: Option<String>,
    pub group: Option<String>,
    pub home_dir: Option<String>,
    pub login_shell: Option<String>,
    pub gcos_field: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Dir {
    pub path: String,
    pub owner: String,
    pub group: String,
    pub mode: String,
}

/// How an installed file that was edited locally is treated on update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Preserve {
    #[default]
    No,
    /// Keep the local file, drop the delivered content.
    Yes,
    /// Keep the local file, deliver the new content next to it as `.new`.
    RenameNew,
    /// Move the local file aside as `.old`, install the new content.
    RenameOld,
}

impl FromStr for Preserve {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "renamenew" => Ok(Preserve::RenameNew),
            "renameold" => Ok(Preserve::RenameOld),
            _ => match string_to_bool(s) {
                Ok(true) => Ok(Preserve::Yes),
                Ok(false) => Ok(Preserve::No),
                Err(_) => Err(ActionError::InvalidPreserve(s.to_string())),
            },
        }
    }
}

impl Preserve {
    fn as_attr(&self) -> Option<&'static str> {
        match self {
            Preserve::No => None,
            Preserve::Yes => Some("true"),
            Preserve::RenameNew => Some("renamenew"),
            Preserve::RenameOld => Some("renameold"),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct File {
    pub path: String,
    pub owner: String,
    pub group: String,
    pub mode: String,
    pub preserve: Preserve,
    pub original_name: Option<String>,
}

/// Shared record for `link` and `hardlink` actions.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Link {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Driver {
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Legacy {
    pub pkg: String,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Signature {
    pub value: String,
    pub algorithm: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct License {
    pub license: String,
    pub must_accept: bool,
    pub must_display: bool,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Unknown {
    pub path: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Set(Attr),
    Depend(Dependency),
    Group(Group),
    User(User),
    Dir(Dir),
    File(File),
    Hardlink(Link),
    Link(Link),
    Driver(Driver),
    Legacy(Legacy),
    Signature(Signature),
    License(License),
    Unknown(Unknown),
}

/// One searchable entry produced by [`Action::generate_indices`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub action_name: String,
    pub key: String,
    pub token: String,
    pub display: Option<String>,
}

impl IndexEntry {
    fn new(action_name: &str, key: &str, token: &str, display: Option<&str>) -> Self {
        IndexEntry {
            action_name: action_name.to_string(),
            key: key.to_string(),
            token: token.to_string(),
            display: display.map(str::to_string),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Content hash of the payload, for actions that deliver data.
    pub hash: Option<String>,
    /// Attributes outside the typed record: facets, variants, actuators,
    /// `pkg.size`, `elfhash` and plan markers such as `save_file`.
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Action {
        Action {
            kind,
            hash: None,
            attrs: BTreeMap::new(),
        }
    }

    /// A bare directory action, as synthesized for implicit directories.
    pub fn dir(path: &str) -> Action {
        Action::new(ActionKind::Dir(Dir {
            path: normalize_path(path),
            ..Dir::default()
        }))
    }

    pub fn name(&self) -> ActionName {
        match &self.kind {
            ActionKind::Set(_) => ActionName::Set,
            ActionKind::Depend(_) => ActionName::Depend,
            ActionKind::Group(_) => ActionName::Group,
            ActionKind::User(_) => ActionName::User,
            ActionKind::Dir(_) => ActionName::Dir,
            ActionKind::File(_) => ActionName::File,
            ActionKind::Hardlink(_) => ActionName::Hardlink,
            ActionKind::Link(_) => ActionName::Link,
            ActionKind::Driver(_) => ActionName::Driver,
            ActionKind::Legacy(_) => ActionName::Legacy,
            ActionKind::Signature(_) => ActionName::Signature,
            ActionKind::License(_) => ActionName::License,
            ActionKind::Unknown(_) => ActionName::Unknown,
        }
    }

    pub fn order(&self) -> usize {
        type_order(self.name())
    }

    /// Attribute whose value must be unique among actions of this type.
    /// `None` means every attribute is distinguishing.
    pub fn key_attr(&self) -> Option<&'static str> {
        match self.name() {
            ActionName::Set | ActionName::Driver => Some("name"),
            ActionName::Depend => Some("fmri"),
            ActionName::Group => Some("groupname"),
            ActionName::User => Some("username"),
            ActionName::Dir | ActionName::File | ActionName::Hardlink | ActionName::Link => {
                Some("path")
            }
            ActionName::Legacy => Some("pkg"),
            ActionName::Signature => Some("value"),
            ActionName::License => Some("license"),
            ActionName::Unknown => None,
        }
    }

    pub fn key_value(&self) -> Option<String> {
        match &self.kind {
            ActionKind::Set(a) => Some(a.name.clone()),
            ActionKind::Depend(d) => Some(d.fmri.to_string()),
            ActionKind::Group(g) => Some(g.groupname.clone()),
            ActionKind::User(u) => Some(u.username.clone()),
            ActionKind::Dir(d) => Some(d.path.clone()),
            ActionKind::File(f) => Some(f.path.clone()),
            ActionKind::Hardlink(l) | ActionKind::Link(l) => Some(l.path.clone()),
            ActionKind::Driver(d) => Some(d.name.clone()),
            ActionKind::Legacy(l) => Some(l.pkg.clone()),
            ActionKind::Signature(s) => Some(s.value.clone()),
            ActionKind::License(l) => Some(l.license.clone()),
            ActionKind::Unknown(_) => None,
        }
    }

    /// True when the key must be unique across the whole image rather than
    /// within one package.
    pub fn globally_unique(&self) -> bool {
        matches!(
            self.name(),
            ActionName::Dir
                | ActionName::File
                | ActionName::Hardlink
                | ActionName::Link
                | ActionName::User
                | ActionName::Group
                | ActionName::Driver
                | ActionName::Legacy
        )
    }

    /// Filesystem path the action manages, if any.
    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Dir(d) => Some(&d.path),
            ActionKind::File(f) => Some(&f.path),
            ActionKind::Hardlink(l) | ActionKind::Link(l) => Some(&l.path),
            ActionKind::Unknown(u) => u.path.as_deref(),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match &self.kind {
            ActionKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_dependency(&self) -> Option<&Dependency> {
        match &self.kind {
            ActionKind::Depend(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_license(&self) -> Option<&License> {
        match &self.kind {
            ActionKind::License(l) => Some(l),
            _ => None,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::first)
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        self.attrs.insert(key.to_string(), AttrValue::from(value));
    }

    /// All attributes, typed record and side map alike, keyed by their
    /// manifest names.
    pub fn attributes(&self) -> BTreeMap<String, AttrValue> {
        let mut out = self.attrs.clone();
        let o = &mut out;
        match &self.kind {
            ActionKind::Set(a) => {
                put(o, "name", &a.name);
                put_list(o, "value", &a.values);
            }
            ActionKind::Depend(d) => {
                put(o, "fmri", &d.fmri.to_string());
                put(o, "type", &d.dep_type.to_string());
                put(o, "predicate", d.predicate.as_deref().unwrap_or_default());
            }
            ActionKind::Group(g) => {
                put(o, "groupname", &g.groupname);
                put(o, "gid", g.gid.as_deref().unwrap_or_default());
            }
            ActionKind::User(u) => {
                put(o, "username", &u.username);
                put(o, "uid", u.uid.as_deref().unwrap_or_default());
                put(o, "group", u.group.as_deref().unwrap_or_default());
                put(o, "home-dir", u.home_dir.as_deref().unwrap_or_default());
                put(o, "login-shell", u.login_shell.as_deref().unwrap_or_default());
                put(o, "gcos-field", u.gcos_field.as_deref().unwrap_or_default());
            }
            ActionKind::Dir(d) => {
                put(o, "path", &d.path);
                put(o, "owner", &d.owner);
                put(o, "group", &d.group);
                put(o, "mode", &d.mode);
            }
            ActionKind::File(f) => {
                put(o, "path", &f.path);
                put(o, "owner", &f.owner);
                put(o, "group", &f.group);
                put(o, "mode", &f.mode);
                put(o, "preserve", f.preserve.as_attr().unwrap_or_default());
                put(o, "original_name", f.original_name.as_deref().unwrap_or_default());
            }
            ActionKind::Hardlink(l) | ActionKind::Link(l) => {
                put(o, "path", &l.path);
                put(o, "target", &l.target);
            }
            ActionKind::Driver(d) => {
                put(o, "name", &d.name);
                put_list(o, "alias", &d.aliases);
            }
            ActionKind::Legacy(l) => put(o, "pkg", &l.pkg),
            ActionKind::Signature(s) => {
                put(o, "value", &s.value);
                put(o, "algorithm", s.algorithm.as_deref().unwrap_or_default());
            }
            ActionKind::License(l) => {
                put(o, "license", &l.license);
                if l.must_accept {
                    put(o, "must-accept", "true");
                }
                if l.must_display {
                    put(o, "must-display", "true");
                }
            }
            ActionKind::Unknown(u) => put(o, "path", u.path.as_deref().unwrap_or_default()),
        }
        out
    }

    /// True if `other` represents a non-ignorable change from `self`: the
    /// attribute sets differ (list values compared as sets) or the content
    /// hash differs. Files carrying an `elfhash` on both sides are compared
    /// on attributes alone since the ELF hash already covers the content.
    pub fn different(&self, other: &Action) -> bool {
        if self.name() != other.name() {
            return true;
        }
        let mine = self.attributes();
        let theirs = other.attributes();
        if mine.len() != theirs.len() {
            return true;
        }
        for (k, v) in &mine {
            match theirs.get(k) {
                Some(o) if o.sorted() == v.sorted() => {}
                _ => return true,
            }
        }

        let both_elf = self.name() == ActionName::File
            && mine.contains_key("elfhash")
            && theirs.contains_key("elfhash");
        !both_elf && self.hash != other.hash
    }

    /// Canonical single-line form: attributes sorted by key, list values
    /// sorted. Two actions with equal canonical forms are interchangeable.
    pub fn canonical(&self) -> String {
        self.render(true)
    }

    fn render(&self, sort_lists: bool) -> String {
        let mut line = self.name().to_string();
        if let Some(hash) = &self.hash {
            line.push(' ');
            line.push_str(hash);
        }
        for (k, v) in self.attributes() {
            let v = if sort_lists { v.sorted() } else { v };
            for value in v.values() {
                line.push(' ');
                line.push_str(&k);
                line.push('=');
                line.push_str(&quote_value(value));
            }
        }
        line
    }

    /// Order actions for a plan: by type, then by key value (directories thus
    /// sort parents before children), then by canonical form.
    pub fn cmp_order(&self, other: &Action) -> Ordering {
        self.order()
            .cmp(&other.order())
            .then_with(|| self.key_value().cmp(&other.key_value()))
            .then_with(|| self.canonical().cmp(&other.canonical()))
    }

    /// Parent directories referenced by this action's path.
    pub fn directory_references(&self) -> Vec<String> {
        match self.path() {
            Some(p) => {
                let normalized = normalize_path(p);
                match Path::new(&normalized).parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => {
                        vec![parent.to_string_lossy().into_owned()]
                    }
                    _ => vec![],
                }
            }
            None => vec![],
        }
    }

    /// Searchable `(action, key, token, display)` tuples for this action.
    pub fn generate_indices(&self) -> Vec<IndexEntry> {
        let name = self.name().to_string();
        match &self.kind {
            ActionKind::File(f) => {
                let mut out = Vec::new();
                if let Some(hash) = &self.hash {
                    out.push(IndexEntry::new(&name, "content", hash, Some(hash)));
                }
                out.push(IndexEntry::new(&name, "basename", basename(&f.path), None));
                out.push(IndexEntry::new(&name, "path", &format!("/{}", f.path), None));
                out
            }
            ActionKind::Dir(d) => vec![
                IndexEntry::new(&name, "basename", basename(&d.path), None),
                IndexEntry::new(&name, "path", &format!("/{}", d.path), None),
            ],
            ActionKind::Depend(d) => {
                let dep_type = d.dep_type.to_string();
                let full = match &d.fmri.version {
                    Some(v) => format!("{}@{}", d.fmri.stem(), v),
                    None => d.fmri.stem().to_string(),
                };
                let mut out = vec![IndexEntry::new(&name, &dep_type, &full, None)];
                if d.fmri.version.is_some() {
                    out.push(IndexEntry::new(&name, &dep_type, d.fmri.stem(), None));
                }
                out
            }
            ActionKind::Set(a) => {
                let mut out = Vec::new();
                for v in &a.values {
                    if v.contains(char::is_whitespace) {
                        for w in v.split_whitespace() {
                            out.push(IndexEntry::new(&name, &a.name, w, Some(v)));
                        }
                    } else {
                        out.push(IndexEntry::new(&name, &a.name, v, None));
                    }
                }
                out
            }
            ActionKind::User(u) => vec![IndexEntry::new(&name, "name", &u.username, None)],
            ActionKind::Group(g) => vec![IndexEntry::new(&name, "name", &g.groupname, None)],
            _ => match &self.hash {
                Some(hash) => vec![IndexEntry::new(&name, "content", hash, Some(hash))],
                None => vec![],
            },
        }
    }

    /// Whether installing `self` over `src` requires fetching content.
    pub fn needs_data(&self, src: Option<&Action>, image_root: &Path) -> bool {
        let file = match &self.kind {
            ActionKind::File(f) => f,
            _ => return false,
        };
        if self.hash.is_none() {
            return false;
        }
        let src = match src {
            Some(src) => src,
            None => return true,
        };
        let both_elf = match (self.attr_str("elfhash"), src.attr_str("elfhash")) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        };
        let content_changed = match both_elf {
            Some(same_elf) => !same_elf,
            None => self.hash != src.hash,
        };
        if content_changed {
            return true;
        }
        // Unchanged content, but the file may have gone missing on disk.
        match executors::safe_join(image_root, &file.path) {
            Ok(full) => !full.is_file(),
            Err(_) => true,
        }
    }

    /// Image-relative path a hardlink points at. Relative targets resolve
    /// against the directory holding the link.
    pub fn hardlink_target(&self) -> Option<String> {
        match &self.kind {
            ActionKind::Hardlink(l) => {
                if l.target.starts_with('/') {
                    Some(resolve_path("", &l.target))
                } else {
                    let base = Path::new(&l.path)
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Some(resolve_path(&base, &l.target))
                }
            }
            _ => None,
        }
    }

    /// Size on the wire, taken from `pkg.csize` or `pkg.size`.
    pub fn transfer_size(&self) -> u64 {
        self.attr_str("pkg.csize")
            .or_else(|| self.attr_str("pkg.size"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Build an action from its type tag, optional positional payload and
    /// attribute map. Well-known attributes move into the typed record.
    pub fn from_parts(
        name: &str,
        payload: Option<String>,
        mut attrs: BTreeMap<String, AttrValue>,
    ) -> Result<Action> {
        let action = ActionName::from_str(name)
            .map_err(|_| ActionError::UnknownAction(name.to_string()))?;
        let a = &mut attrs;
        let hash = match payload {
            Some(p) => Some(p),
            None => take_opt(a, action, "hash")?,
        };

        let kind = match action {
            ActionName::Set => ActionKind::Set(Attr {
                name: take_required(a, action, "name")?,
                values: take_list(a, "value"),
            }),
            ActionName::Depend => {
                let fmri = Fmri::parse(&take_required(a, action, "fmri")?)?;
                let dep_type = take_required(a, action, "type")?;
                let dep_type =
                    DependType::from_str(&dep_type).unwrap_or(DependType::Other(dep_type));
                ActionKind::Depend(Dependency {
                    fmri,
                    dep_type,
                    predicate: take_opt(a, action, "predicate")?,
                })
            }
            ActionName::Group => ActionKind::Group(Group {
                groupname: take_required(a, action, "groupname")?,
                gid: take_opt(a, action, "gid")?,
            }),
            ActionName::User => ActionKind::User(User {
                username: take_required(a, action, "username")?,
                uid: take_opt(a, action, "uid")?,
                group: take_opt(a, action, "group")?,
                home_dir: take_opt(a, action, "home-dir")?,
                login_shell: take_opt(a, action, "login-shell")?,
                gcos_field: take_opt(a, action, "gcos-field")?,
            }),
            ActionName::Dir => ActionKind::Dir(Dir {
                path: normalize_path(&take_required(a, action, "path")?),
                owner: take_opt(a, action, "owner")?.unwrap_or_default(),
                group: take_opt(a, action, "group")?.unwrap_or_default(),
                mode: take_opt(a, action, "mode")?.unwrap_or_default(),
            }),
            ActionName::File => {
                let preserve = match take_opt(a, action, "preserve")? {
                    Some(p) => Preserve::from_str(&p)?,
                    None => Preserve::No,
                };
                ActionKind::File(File {
                    path: normalize_path(&take_required(a, action, "path")?),
                    owner: take_opt(a, action, "owner")?.unwrap_or_default(),
                    group: take_opt(a, action, "group")?.unwrap_or_default(),
                    mode: take_opt(a, action, "mode")?.unwrap_or_default(),
                    preserve,
                    original_name: take_opt(a, action, "original_name")?,
                })
            }
            ActionName::Hardlink | ActionName::Link => {
                let link = Link {
                    path: normalize_path(&take_required(a, action, "path")?),
                    target: take_required(a, action, "target")?,
                };
                if action == ActionName::Hardlink {
                    ActionKind::Hardlink(link)
                } else {
                    ActionKind::Link(link)
                }
            }
            ActionName::Driver => ActionKind::Driver(Driver {
                name: take_required(a, action, "name")?,
                aliases: take_list(a, "alias"),
            }),
            ActionName::Legacy => ActionKind::Legacy(Legacy {
                pkg: take_required(a, action, "pkg")?,
            }),
            ActionName::Signature => ActionKind::Signature(Signature {
                value: take_opt(a, action, "value")?.unwrap_or_default(),
                algorithm: take_opt(a, action, "algorithm")?,
            }),
            ActionName::License => ActionKind::License(License {
                license: take_required(a, action, "license")?,
                must_accept: take_bool(a, action, "must-accept")?,
                must_display: take_bool(a, action, "must-display")?,
            }),
            ActionName::Unknown => ActionKind::Unknown(Unknown {
                path: take_opt(a, action, "path")?.map(|p| normalize_path(&p)),
            }),
        };

        Ok(Action { kind, hash, attrs })
    }

    fn from_pair(pair: Pair<'_, Rule>) -> Result<Action> {
        let mut name = String::new();
        let mut payload = None;
        let mut attrs: BTreeMap<String, AttrValue> = BTreeMap::new();

        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::action_name => name = part.as_str().to_string(),
                Rule::payload => payload = Some(part.as_str().to_string()),
                Rule::property => {
                    let mut key = String::new();
                    let mut value = String::new();
                    for prop in part.into_inner() {
                        match prop.as_rule() {
                            Rule::property_name => key = prop.as_str().to_string(),
                            Rule::property_value => value = unquote(prop),
                            _ => {}
                        }
                    }
                    let merged = match attrs.remove(&key) {
                        Some(existing) => existing.push(value),
                        None => AttrValue::Single(value),
                    };
                    attrs.insert(key, merged);
                }
                _ => {}
            }
        }

        Action::from_parts(&name, payload, attrs)
    }
}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_order(other)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(false))
    }
}

impl FromStr for Action {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self> {
        let line = ActionParser::parse(Rule::action_line, s)?;
        for pair in line.flatten() {
            if pair.as_rule() == Rule::action {
                return Action::from_pair(pair);
            }
        }
        Err(ActionError::UnknownAction(s.to_string()))
    }
}

/// Parse every action of a manifest in text form.
pub fn parse_actions(content: &str) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    let pairs = ActionParser::parse(Rule::manifest, content)?;
    for manifest in pairs {
        for pair in manifest.into_inner() {
            if pair.as_rule() == Rule::action {
                actions.push(Action::from_pair(pair)?);
            }
        }
    }
    Ok(actions)
}

#[derive(Parser)]
#[grammar = "actions/action.pest"]
struct ActionParser;

fn unquote(value: Pair<'_, Rule>) -> String {
    for inner in value.clone().into_inner().flatten() {
        match inner.as_rule() {
            Rule::inner_double => return inner.as_str().replace("\\\"", "\"").replace("\\\\", "\\"),
            Rule::inner_single => return inner.as_str().replace("\\'", "'").replace("\\\\", "\\"),
            _ => {}
        }
    }
    value.as_str().to_string()
}

fn quote_value(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn put(attrs: &mut BTreeMap<String, AttrValue>, key: &str, value: &str) {
    if !value.is_empty() {
        attrs.insert(key.to_string(), AttrValue::from(value));
    }
}

fn put_list(attrs: &mut BTreeMap<String, AttrValue>, key: &str, values: &[String]) {
    match values {
        [] => {}
        [single] => put(attrs, key, single),
        many => {
            attrs.insert(key.to_string(), AttrValue::List(many.to_vec()));
        }
    }
}

fn take_opt(
    attrs: &mut BTreeMap<String, AttrValue>,
    action: ActionName,
    attr: &'static str,
) -> Result<Option<String>> {
    match attrs.remove(attr) {
        None => Ok(None),
        Some(AttrValue::Single(v)) => Ok(Some(v)),
        Some(AttrValue::List(_)) => Err(ActionError::MultipleValues { action, attr }),
    }
}

fn take_required(
    attrs: &mut BTreeMap<String, AttrValue>,
    action: ActionName,
    attr: &'static str,
) -> Result<String> {
    take_opt(attrs, action, attr)?.ok_or(ActionError::MissingAttribute { action, attr })
}

fn take_list(attrs: &mut BTreeMap<String, AttrValue>, attr: &str) -> Vec<String> {
    match attrs.remove(attr) {
        None => vec![],
        Some(AttrValue::Single(v)) => vec![v],
        Some(AttrValue::List(l)) => l,
    }
}

fn take_bool(
    attrs: &mut BTreeMap<String, AttrValue>,
    action: ActionName,
    attr: &'static str,
) -> Result<bool> {
    match take_opt(attrs, action, attr)? {
        Some(v) => string_to_bool(&v),
        None => Ok(false),
    }
}

/// Strip leading slashes and `.` components so paths compare textually.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for c in Path::new(path).components() {
        match c {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::ParentDir => parts.push("..".to_string()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

/// Join `rel` onto `base` and fold `..` components. Leading `..` that would
/// climb above the image root are dropped.
fn resolve_path(base: &str, rel: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for c in Path::new(base).join(rel.trim_start_matches('/')).components() {
        match c {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn string_to_bool(orig: &str) -> Result<bool> {
    match &orig.trim().to_lowercase()[..] {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        _ => Err(ActionError::NotBooleanValue(orig.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(s: &str) -> Action {
        s.parse().unwrap()
    }

    #[test]
    fn parse_file_action() {
        let a = act("file 9a0364b9e99bb480dd25e1f0284c8555 path=/usr/bin/ls owner=root group=bin mode=0555 preserve=renamenew variant.arch=i386 pkg.size=1024");
        assert_eq!(a.name(), ActionName::File);
        assert_eq!(a.hash.as_deref(), Some("9a0364b9e99bb480dd25e1f0284c8555"));
        let f = a.as_file().unwrap();
        assert_eq!(f.path, "usr/bin/ls");
        assert_eq!(f.mode, "0555");
        assert_eq!(f.preserve, Preserve::RenameNew);
        assert_eq!(a.attr_str("variant.arch"), Some("i386"));
        assert_eq!(a.transfer_size(), 1024);
        assert_eq!(a.key_value().as_deref(), Some("usr/bin/ls"));
    }

    #[test]
    fn parse_quoted_and_repeated_values() {
        let a = act(r#"set name=pkg.summary value="Nginx \"Webserver\"" value=extra"#);
        match &a.kind {
            ActionKind::Set(attr) => {
                assert_eq!(attr.name, "pkg.summary");
                assert_eq!(attr.values, vec!["Nginx \"Webserver\"", "extra"]);
            }
            other => panic!("expected set action, got {:?}", other),
        }
        // and back again
        let again: Action = a.to_string().parse().unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "bogus path=a".parse::<Action>(),
            Err(ActionError::UnknownAction(_))
        ));
        assert!(matches!(
            "dir owner=root".parse::<Action>(),
            Err(ActionError::MissingAttribute { attr: "path", .. })
        ));
        assert!(matches!(
            "file path=a path=b".parse::<Action>(),
            Err(ActionError::MultipleValues { attr: "path", .. })
        ));
        assert!(matches!(
            "depend fmri=pkg:/a@01 type=require".parse::<Action>(),
            Err(ActionError::Fmri(_))
        ));
    }

    #[test]
    fn depend_types() {
        let a = act("depend fmri=pkg:/library/zlib@1.2.11 type=incorporate");
        assert_eq!(a.as_dependency().unwrap().dep_type, DependType::Incorporate);
        let a = act("depend fmri=pkg:/library/zlib type=require-any");
        assert_eq!(
            a.as_dependency().unwrap().dep_type,
            DependType::Other("require-any".to_string())
        );
    }

    #[test]
    fn type_order_table() {
        assert!(type_order(ActionName::Dir) < type_order(ActionName::File));
        assert!(type_order(ActionName::User) < type_order(ActionName::File));
        assert!(type_order(ActionName::Group) < type_order(ActionName::User));
        assert!(type_order(ActionName::File) < type_order(ActionName::Hardlink));
        assert_eq!(type_order(ActionName::License), type_order(ActionName::Unknown));
        assert_eq!(type_order(ActionName::Signature), 11);
    }

    #[test]
    fn cmp_order_sorts_dirs_by_path() {
        let mut v = vec![
            act("file path=lib/libc.so.1"),
            act("dir path=lib/amd64"),
            act("dir path=lib"),
            act("user username=daemon"),
        ];
        v.sort_by(|a, b| a.cmp_order(b));
        let names: Vec<String> = v.iter().map(|a| a.key_value().unwrap()).collect();
        assert_eq!(names, vec!["daemon", "lib", "lib/amd64", "lib/libc.so.1"]);
    }

    #[test]
    fn different_ignores_list_order() {
        let a = act("driver name=e1000g alias=pci8086,1000 alias=pci8086,1001");
        let b = act("driver name=e1000g alias=pci8086,1001 alias=pci8086,1000");
        assert!(!a.different(&b));
        let c = act("driver name=e1000g alias=pci8086,1001");
        assert!(a.different(&c));
    }

    #[test]
    fn different_checks_hash_and_elfhash() {
        let a = act("file aaaa path=bin/ls mode=0555");
        let b = act("file bbbb path=bin/ls mode=0555");
        assert!(a.different(&b));
        assert!(!a.different(&a.clone()));

        let a = act("file aaaa path=bin/ls elfhash=1234");
        let b = act("file bbbb path=bin/ls elfhash=1234");
        assert!(!a.different(&b));
        let c = act("file bbbb path=bin/ls elfhash=5678");
        assert!(a.different(&c));
    }

    #[test]
    fn directory_references_are_parents() {
        assert_eq!(act("file path=/usr/bin/ls").directory_references(), vec!["usr/bin"]);
        assert_eq!(act("dir path=usr/").directory_references(), Vec::<String>::new());
        assert_eq!(act("link path=./usr/lib/x target=y").directory_references(), vec!["usr/lib"]);
        assert!(act("set name=a value=b").directory_references().is_empty());
    }

    #[test]
    fn indices_per_type() {
        let file = act("file abcd path=usr/bin/ls");
        let idx = file.generate_indices();
        assert!(idx.contains(&IndexEntry::new("file", "basename", "ls", None)));
        assert!(idx.contains(&IndexEntry::new("file", "path", "/usr/bin/ls", None)));
        assert!(idx.contains(&IndexEntry::new("file", "content", "abcd", Some("abcd"))));

        let dep = act("depend fmri=pkg:/library/zlib@1.2 type=require");
        let idx = dep.generate_indices();
        assert_eq!(idx[0].token, "library/zlib@1.2");
        assert_eq!(idx[1].token, "library/zlib");

        let set = act("set name=pkg.summary value=\"fast web server\"");
        assert_eq!(set.generate_indices().len(), 3);

        assert!(act("link path=a target=b").generate_indices().is_empty());
    }

    #[test]
    fn needs_data_for_new_or_changed_content() {
        let root = Path::new("/nonexistent-image-root");
        let new = act("file bbbb path=etc/motd");
        let old = act("file aaaa path=etc/motd");
        assert!(new.needs_data(None, root));
        assert!(new.needs_data(Some(&old), root));
        // same content, but missing from disk
        assert!(new.needs_data(Some(&new), root));
        assert!(!act("dir path=etc").needs_data(None, root));
    }

    #[test]
    fn hardlink_targets_resolve_against_link_dir() {
        assert_eq!(
            act("hardlink path=usr/bin/view target=vi").hardlink_target().as_deref(),
            Some("usr/bin/vi")
        );
        assert_eq!(
            act("hardlink path=usr/bin/ex target=../lib/vi").hardlink_target().as_deref(),
            Some("usr/lib/vi")
        );
        assert_eq!(
            act("hardlink path=usr/bin/ex target=/usr/has/bin/vi").hardlink_target().as_deref(),
            Some("usr/has/bin/vi")
        );
        assert_eq!(act("link path=a target=b").hardlink_target(), None);
    }

    #[test]
    fn parse_manifest_text() {
        let text = "# comment\nset name=pkg.fmri value=pkg:/foo@1.1\n\ndir path=lib mode=0755 \\\n  owner=root\nfile abcd path=lib/libc.so.1\n";
        let actions = parse_actions(text).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[1].name(), ActionName::Dir);
        assert_eq!(actions[1].attributes().get("owner"), Some(&AttrValue::from("root")));
    }
}
