//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Applies single actions to the filesystem of an image.
//!
//! The executor knows nothing about ordering; the image plan hands it
//! removals, installs and updates in the order they must happen.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionKind, Dir as DirAction, File as FileAction, Link as LinkAction, Preserve};
use crate::digest::{Digest, DigestError};

#[derive(Error, Debug, Diagnostic)]
pub enum InstallerError {
    #[error("I/O error while operating on {path}")]
    #[diagnostic(code(ips::installer_error::io))]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Absolute paths are forbidden in actions: {path}")]
    #[diagnostic(
        code(ips::installer_error::absolute_path_forbidden),
        help("Provide paths relative to the image root")
    )]
    AbsolutePathForbidden { path: String },

    #[error("Path escapes image root via traversal: {rel}")]
    #[diagnostic(
        code(ips::installer_error::path_outside_image),
        help("Remove '..' components that escape the image root")
    )]
    PathTraversalOutsideImage { rel: String },

    #[error("Content {hash} for {path} has not been downloaded")]
    #[diagnostic(
        code(ips::installer_error::missing_content),
        help("Run preexecute so every payload is fetched before execution")
    )]
    MissingContent { hash: String, path: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Digest(#[from] DigestError),
}

type Result<T> = std::result::Result<T, InstallerError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InstallerError + '_ {
    move |source| InstallerError::Io {
        source,
        path: path.to_path_buf(),
    }
}

fn parse_mode(mode: &str, default: u32) -> u32 {
    if mode.is_empty() || mode.eq("0") {
        return default;
    }
    // Accept strings like "0755" or "755"
    let trimmed = mode.trim_start_matches('0');
    u32::from_str_radix(if trimmed.is_empty() { "0" } else { trimmed }, 8).unwrap_or(default)
}

/// Join a manifest-provided path (must be relative) under image_root.
/// - Rejects absolute paths
/// - Rejects traversal that would escape the image root
pub fn safe_join(image_root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Ok(image_root.to_path_buf());
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(InstallerError::AbsolutePathForbidden {
            path: rel.to_string(),
        });
    }

    let mut stack: Vec<PathBuf> = Vec::new();
    for c in rel_path.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => stack.push(PathBuf::from(seg)),
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(InstallerError::PathTraversalOutsideImage {
                        rel: rel.to_string(),
                    });
                }
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(InstallerError::AbsolutePathForbidden {
                    path: rel.to_string(),
                })
            }
        }
    }

    let mut out = PathBuf::from(image_root);
    for seg in stack {
        out.push(seg);
    }
    Ok(out)
}

/// Name under which downloaded content for `hash` is cached.
pub fn cache_name(hash: &str) -> String {
    match Digest::from_str(hash) {
        Ok(d) => d.hash,
        Err(_) => hash.replace(['/', ':'], "_"),
    }
}

#[derive(Debug, Default, Clone)]
pub struct ApplyOptions {
    pub dry_run: bool,
}

/// Performs install, update and removal of actions below one image root.
///
/// Files removed with a `save_file` marker are moved into the stash
/// directory and handed back to the install carrying the same marker,
/// together with the removed action so the install can tell whether the
/// saved bytes were edited.
pub struct Executor {
    root: PathBuf,
    download_dir: PathBuf,
    stash_dir: PathBuf,
    saved: HashMap<String, (Action, PathBuf)>,
    opts: ApplyOptions,
}

impl Executor {
    pub fn new(root: &Path, download_dir: &Path, stash_dir: &Path, opts: ApplyOptions) -> Executor {
        Executor {
            root: root.to_path_buf(),
            download_dir: download_dir.to_path_buf(),
            stash_dir: stash_dir.to_path_buf(),
            saved: HashMap::new(),
            opts,
        }
    }

    /// Number of files currently held in the stash.
    pub fn saved_files(&self) -> usize {
        self.saved.len()
    }

    /// Install `dst`, replacing `src` when this is an update.
    pub fn install(&mut self, src: Option<&Action>, dst: &Action) -> Result<()> {
        match &dst.kind {
            ActionKind::Dir(d) => self.install_dir(d),
            ActionKind::File(f) => self.install_file(src, dst, f),
            ActionKind::Link(l) => self.install_link(l),
            ActionKind::Hardlink(_) => self.install_hardlink(dst),
            _ => {
                debug!(action = %dst.name(), key = ?dst.key_value(), "no filesystem change");
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, src: &Action) -> Result<()> {
        match &src.kind {
            ActionKind::Dir(d) => self.remove_dir(d),
            ActionKind::File(f) => match src.attr_str("save_file") {
                Some(key) => self.stash_file(key, src, &f.path),
                None => self.remove_path(&f.path),
            },
            ActionKind::Link(l) | ActionKind::Hardlink(l) => self.remove_path(&l.path),
            _ => {
                debug!(action = %src.name(), key = ?src.key_value(), "no filesystem change");
                Ok(())
            }
        }
    }

    fn install_dir(&self, d: &DirAction) -> Result<()> {
        let full = safe_join(&self.root, &d.path)?;
        info!(?full, "creating directory");
        if self.opts.dry_run {
            return Ok(());
        }

        fs::create_dir_all(&full).map_err(io_err(&full))?;
        let mode = parse_mode(&d.mode, 0o755);
        fs::set_permissions(&full, fs::Permissions::from_mode(mode)).map_err(io_err(&full))?;
        Ok(())
    }

    fn ensure_parent(&self, full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            if self.opts.dry_run {
                return Ok(());
            }
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        Ok(())
    }

    fn install_file(&mut self, src: Option<&Action>, dst: &Action, f: &FileAction) -> Result<()> {
        let full = safe_join(&self.root, &f.path)?;
        self.ensure_parent(&full)?;
        info!(?full, "installing file");
        if self.opts.dry_run {
            return Ok(());
        }
        let mode = fs::Permissions::from_mode(parse_mode(&f.mode, 0o644));

        // Content carried over from a removal in the same plan. The removed
        // action becomes the origin for the preserve check below.
        let mut restored = None;
        if let Some(key) = dst.attr_str("save_file") {
            if let Some((origin, saved)) = self.saved.remove(key) {
                if f.preserve != Preserve::No {
                    debug!(?full, "restoring saved file");
                    fs::rename(&saved, &full).map_err(io_err(&full))?;
                    fs::set_permissions(&full, mode.clone()).map_err(io_err(&full))?;
                    restored = Some(origin);
                } else if let Err(e) = fs::remove_file(&saved) {
                    debug!(?saved, error = %e, "could not drop saved file");
                }
            }
        }
        let src = restored.as_ref().or(src);

        let mut target = full.clone();
        if f.preserve != Preserve::No && full.is_file() && self.locally_modified(src, &full)? {
            match f.preserve {
                Preserve::Yes => {
                    info!(?full, "preserving locally modified file");
                    return Ok(());
                }
                Preserve::RenameNew => {
                    target = with_suffix(&full, "new");
                    info!(?target, "delivering new content beside locally modified file");
                }
                Preserve::RenameOld => {
                    let old = with_suffix(&full, "old");
                    info!(?old, "moving locally modified file aside");
                    fs::rename(&full, &old).map_err(io_err(&full))?;
                }
                Preserve::No => {}
            }
        }

        match &dst.hash {
            Some(hash) => {
                let cached = self.download_dir.join(cache_name(hash));
                if !cached.is_file() {
                    // Updates that only change metadata keep the existing bytes.
                    let unchanged = src.map(|s| s.hash == dst.hash).unwrap_or(false);
                    if !(unchanged && target.is_file()) {
                        return Err(InstallerError::MissingContent {
                            hash: hash.clone(),
                            path: f.path.clone(),
                        });
                    }
                } else {
                    if target.is_file() {
                        // Never write through an existing hardlink.
                        fs::remove_file(&target).map_err(io_err(&target))?;
                    }
                    fs::copy(&cached, &target).map_err(io_err(&target))?;
                }
            }
            None => {
                if !target.exists() {
                    fs::File::create(&target).map_err(io_err(&target))?;
                }
            }
        }
        fs::set_permissions(&target, mode).map_err(io_err(&target))?;
        Ok(())
    }

    fn locally_modified(&self, src: Option<&Action>, full: &Path) -> Result<bool> {
        let hash = match src.and_then(|s| s.hash.as_deref()) {
            Some(hash) => hash,
            // An unpackaged file already in place counts as a local edit.
            None => return Ok(true),
        };
        let expected = Digest::from_str(hash)?;
        let content = fs::read(full).map_err(io_err(full))?;
        Ok(expected.verify(&content).is_err())
    }

    fn install_link(&self, l: &LinkAction) -> Result<()> {
        let link_path = safe_join(&self.root, &l.path)?;
        if Path::new(&l.target).is_absolute() {
            return Err(InstallerError::AbsolutePathForbidden {
                path: l.target.clone(),
            });
        }
        self.ensure_parent(&link_path)?;
        info!(?link_path, target = %l.target, "creating symlink");
        if self.opts.dry_run {
            return Ok(());
        }
        replace_existing(&link_path)?;
        unix_fs::symlink(&l.target, &link_path).map_err(io_err(&link_path))?;
        Ok(())
    }

    fn install_hardlink(&self, action: &Action) -> Result<()> {
        let (path, target) = match (&action.kind, action.hardlink_target()) {
            (ActionKind::Hardlink(l), Some(target)) => (&l.path, target),
            _ => return Ok(()),
        };
        let link_path = safe_join(&self.root, path)?;
        let target_full = safe_join(&self.root, &target)?;
        self.ensure_parent(&link_path)?;
        info!(?link_path, ?target_full, "creating hardlink");
        if self.opts.dry_run {
            return Ok(());
        }
        replace_existing(&link_path)?;
        fs::hard_link(&target_full, &link_path).map_err(io_err(&link_path))?;
        Ok(())
    }

    fn remove_dir(&self, d: &DirAction) -> Result<()> {
        let full = safe_join(&self.root, &d.path)?;
        info!(?full, "removing directory");
        if self.opts.dry_run {
            return Ok(());
        }
        match fs::read_dir(&full) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    warn!(?full, "directory not empty, leaving it in place");
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&full)(e)),
        }
        fs::remove_dir(&full).map_err(io_err(&full))
    }

    fn remove_path(&self, rel: &str) -> Result<()> {
        let full = safe_join(&self.root, rel)?;
        info!(?full, "removing");
        if self.opts.dry_run {
            return Ok(());
        }
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&full)(e)),
        }
    }

    fn stash_file(&mut self, key: &str, src: &Action, rel: &str) -> Result<()> {
        let full = safe_join(&self.root, rel)?;
        if self.opts.dry_run || !full.is_file() {
            return self.remove_path(rel);
        }
        fs::create_dir_all(&self.stash_dir).map_err(io_err(&self.stash_dir))?;
        let stashed = self.stash_dir.join(format!("saved-{}", self.saved.len()));
        debug!(?full, ?stashed, key, "saving file for reuse");
        fs::rename(&full, &stashed).map_err(io_err(&full))?;
        self.saved.insert(key.to_string(), (src.clone(), stashed));
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn replace_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(InstallerError::Io {
            source: io::Error::new(io::ErrorKind::AlreadyExists, "a directory is in the way"),
            path: path.to_path_buf(),
        }),
        Ok(_) => fs::remove_file(path).map_err(io_err(path)),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{DigestAlgorithm, DigestSource};
    use tempfile::tempdir;

    fn act(s: &str) -> Action {
        s.parse().unwrap()
    }

    fn sha1(content: &[u8]) -> String {
        Digest::from_bytes(content, DigestAlgorithm::SHA1, DigestSource::PrimaryPayloadHash).hash
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        downloads: PathBuf,
        exec: Executor,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("root");
        let downloads = tmp.path().join("download");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&downloads).unwrap();
        let exec = Executor::new(&root, &downloads, &tmp.path().join("stash"), ApplyOptions::default());
        Fixture {
            _tmp: tmp,
            root,
            downloads,
            exec,
        }
    }

    impl Fixture {
        fn cache(&self, content: &[u8]) -> String {
            let hash = sha1(content);
            fs::write(self.downloads.join(&hash), content).unwrap();
            hash
        }
    }

    #[test]
    fn safe_join_rejects_absolute() {
        let root = Path::new("/tmp/image");
        let err = safe_join(root, "/etc/passwd").unwrap_err();
        match err {
            InstallerError::AbsolutePathForbidden { .. } => {}
            _ => panic!("expected AbsolutePathForbidden"),
        }
    }

    #[test]
    fn safe_join_rejects_escape() {
        let root = Path::new("/tmp/image");
        let err = safe_join(root, "../../etc").unwrap_err();
        match err {
            InstallerError::PathTraversalOutsideImage { .. } => {}
            _ => panic!("expected PathTraversalOutsideImage"),
        }
    }

    #[test]
    fn install_and_remove_file_in_dir() {
        let mut fx = fixture();
        let hash = fx.cache(b"libc");
        let dir = act("dir path=lib mode=0755");
        let file = act(&format!("file {} path=lib/libc.so.1 mode=0555", hash));

        fx.exec.install(None, &dir).unwrap();
        fx.exec.install(None, &file).unwrap();
        let full = fx.root.join("lib/libc.so.1");
        assert_eq!(fs::read(&full).unwrap(), b"libc");
        assert_eq!(fs::metadata(&full).unwrap().permissions().mode() & 0o777, 0o555);

        // a non-empty directory survives its removal
        fx.exec.remove(&dir).unwrap();
        assert!(fx.root.join("lib").is_dir());

        fx.exec.remove(&file).unwrap();
        fx.exec.remove(&dir).unwrap();
        assert!(!fx.root.join("lib").exists());
    }

    #[test]
    fn missing_content_is_an_error() {
        let mut fx = fixture();
        let file = act("file 0123abcd path=etc/motd");
        assert!(matches!(
            fx.exec.install(None, &file),
            Err(InstallerError::MissingContent { .. })
        ));
    }

    #[test]
    fn preserve_policies_keep_local_edits() {
        let mut fx = fixture();
        let v1 = fx.cache(b"one");
        let v2 = fx.cache(b"two");
        let old = act(&format!("file {} path=etc/conf preserve=true", v1));
        fx.exec.install(None, &old).unwrap();
        let full = fx.root.join("etc/conf");
        fs::write(&full, b"edited").unwrap();

        let keep = act(&format!("file {} path=etc/conf preserve=true", v2));
        fx.exec.install(Some(&old), &keep).unwrap();
        assert_eq!(fs::read(&full).unwrap(), b"edited");

        let renamenew = act(&format!("file {} path=etc/conf preserve=renamenew", v2));
        fx.exec.install(Some(&old), &renamenew).unwrap();
        assert_eq!(fs::read(&full).unwrap(), b"edited");
        assert_eq!(fs::read(fx.root.join("etc/conf.new")).unwrap(), b"two");

        let renameold = act(&format!("file {} path=etc/conf preserve=renameold", v2));
        fx.exec.install(Some(&old), &renameold).unwrap();
        assert_eq!(fs::read(&full).unwrap(), b"two");
        assert_eq!(fs::read(fx.root.join("etc/conf.old")).unwrap(), b"edited");
    }

    #[test]
    fn unmodified_preserved_file_is_updated() {
        let mut fx = fixture();
        let v1 = fx.cache(b"one");
        let v2 = fx.cache(b"two");
        let old = act(&format!("file {} path=etc/conf preserve=true", v1));
        let new = act(&format!("file {} path=etc/conf preserve=true", v2));
        fx.exec.install(None, &old).unwrap();
        fx.exec.install(Some(&old), &new).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/conf")).unwrap(), b"two");
    }

    #[test]
    fn saved_file_moves_to_new_path() {
        let mut fx = fixture();
        let v1 = fx.cache(b"one");
        let mut old = act(&format!("file {} path=etc/foo preserve=true", v1));
        fx.exec.install(None, &old).unwrap();
        fs::write(fx.root.join("etc/foo"), b"edited").unwrap();

        let mut new = act(&format!(
            "file {} path=etc/bar preserve=true original_name=A:etc/foo",
            v1
        ));
        old.set_attr("save_file", "A:etc/foo");
        new.set_attr("save_file", "A:etc/foo");

        fx.exec.remove(&old).unwrap();
        assert!(!fx.root.join("etc/foo").exists());
        assert_eq!(fx.exec.saved_files(), 1);
        fx.exec.install(None, &new).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/bar")).unwrap(), b"edited");
        assert_eq!(fx.exec.saved_files(), 0);
    }

    #[test]
    fn unedited_saved_file_gets_new_content() {
        let mut fx = fixture();
        let v1 = fx.cache(b"one");
        let v2 = fx.cache(b"two");
        let mut old = act(&format!("file {} path=etc/foo preserve=true", v1));
        fx.exec.install(None, &old).unwrap();

        let mut new = act(&format!(
            "file {} path=etc/bar preserve=true original_name=A:etc/foo",
            v2
        ));
        old.set_attr("save_file", "A:etc/foo");
        new.set_attr("save_file", "A:etc/foo");

        fx.exec.remove(&old).unwrap();
        fx.exec.install(None, &new).unwrap();
        assert!(!fx.root.join("etc/foo").exists());
        assert_eq!(fs::read(fx.root.join("etc/bar")).unwrap(), b"two");
        assert_eq!(fx.exec.saved_files(), 0);
    }

    #[test]
    fn edited_saved_file_honours_renamenew() {
        let mut fx = fixture();
        let v1 = fx.cache(b"one");
        let v2 = fx.cache(b"two");
        let mut old = act(&format!("file {} path=etc/foo preserve=true", v1));
        fx.exec.install(None, &old).unwrap();
        fs::write(fx.root.join("etc/foo"), b"edited").unwrap();

        let mut new = act(&format!(
            "file {} path=etc/bar preserve=renamenew original_name=A:etc/foo",
            v2
        ));
        old.set_attr("save_file", "A:etc/foo");
        new.set_attr("save_file", "A:etc/foo");

        fx.exec.remove(&old).unwrap();
        fx.exec.install(None, &new).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/bar")).unwrap(), b"edited");
        assert_eq!(fs::read(fx.root.join("etc/bar.new")).unwrap(), b"two");
    }

    #[test]
    fn links_and_hardlinks() {
        let mut fx = fixture();
        let hash = fx.cache(b"vi");
        fx.exec.install(None, &act(&format!("file {} path=usr/bin/vi", hash))).unwrap();
        fx.exec.install(None, &act("hardlink path=usr/bin/view target=vi")).unwrap();
        fx.exec.install(None, &act("link path=usr/bin/ex target=vi")).unwrap();
        assert_eq!(fs::read(fx.root.join("usr/bin/view")).unwrap(), b"vi");
        assert_eq!(
            fs::read_link(fx.root.join("usr/bin/ex")).unwrap(),
            PathBuf::from("vi")
        );

        // relinking replaces the existing entry
        fx.exec.install(None, &act("link path=usr/bin/ex target=view")).unwrap();
        assert_eq!(
            fs::read_link(fx.root.join("usr/bin/ex")).unwrap(),
            PathBuf::from("view")
        );

        assert!(matches!(
            fx.exec.install(None, &act("link path=usr/bin/x target=/etc/passwd")),
            Err(InstallerError::AbsolutePathForbidden { .. })
        ));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let tmp = tempdir().unwrap();
        let mut exec = Executor::new(
            tmp.path(),
            tmp.path(),
            tmp.path(),
            ApplyOptions { dry_run: true },
        );
        exec.install(None, &act("dir path=opt/x")).unwrap();
        assert!(!tmp.path().join("opt").exists());
    }
}
