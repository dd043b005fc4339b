//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::repository::MemoryRepository;
use tempfile::tempdir;

fn fmri(s: &str) -> Fmri {
    Fmri::parse(s).unwrap()
}

fn manifest(text: &str) -> Manifest {
    Manifest::parse_string(text).unwrap()
}

fn repo() -> MemoryRepository {
    let mut repo = MemoryRepository::new();
    for text in [
        "set name=pkg.fmri value=pkg://test/library/zlib@1.2.11\n",
        "set name=pkg.fmri value=pkg://test/library/zlib@1.2.13\n",
        "set name=pkg.fmri value=pkg://other/library/zlib@1.3\n",
        "set name=pkg.fmri value=pkg://test/web/server/nginx@1.24\n",
    ] {
        repo.publish(text).unwrap();
    }
    repo
}

#[test]
fn save_and_load_roundtrip() {
    let temp_dir = tempdir().unwrap();
    let mut config = ImageConfig::default();
    config.set_variant("arch", "i386");
    let image = Image::create(temp_dir.path(), config).unwrap();
    assert!(image.image_json_path().exists());

    let loaded = Image::load(temp_dir.path()).unwrap();
    assert_eq!(loaded.image_type(), &ImageType::Full);
    assert_eq!(loaded.config(), image.config());
    assert_eq!(loaded.filters().len(), 2);

    let missing = tempdir().unwrap();
    assert!(matches!(
        Image::load(missing.path()),
        Err(ImageError::InvalidPath(_))
    ));
}

#[test]
fn installed_state_queries() {
    let temp_dir = tempdir().unwrap();
    let mut image = Image::create(temp_dir.path(), ImageConfig::default()).unwrap();
    let zlib = fmri("pkg://test/library/zlib@1.2.11");
    image
        .record_installed(&zlib, &manifest("set name=pkg.fmri value=pkg://test/library/zlib@1.2.11\n"))
        .unwrap();

    assert!(image.is_installed(&fmri("library/zlib")));
    assert!(image.has_version_installed(&fmri("library/zlib@1.2")));
    assert!(!image.has_version_installed(&fmri("library/zlib@1.3")));
    assert_eq!(
        image.older_version_installed(&fmri("library/zlib@1.3")),
        Some(&zlib)
    );
    assert_eq!(image.older_version_installed(&fmri("library/zlib@1.2.11")), None);
    assert!(image.load_manifest(&zlib).is_ok());

    // upgrading replaces the stored manifest
    let newer = fmri("pkg://test/library/zlib@1.2.13");
    image
        .record_installed(&newer, &manifest("set name=pkg.fmri value=pkg://test/library/zlib@1.2.13\n"))
        .unwrap();
    assert!(!image.manifest_path(&zlib).exists());
    assert_eq!(image.installed_fmris().count(), 1);

    image.record_removed(&newer).unwrap();
    assert!(image.installed_fmri("library/zlib").is_none());
    assert!(!image.manifest_path(&newer).exists());
}

#[test]
fn dependents_follow_require() {
    let temp_dir = tempdir().unwrap();
    let mut image = Image::create(temp_dir.path(), ImageConfig::default()).unwrap();
    let a = fmri("pkg:/a@1.0");
    let b = fmri("pkg:/b@1.0");
    let c = fmri("pkg:/c@1.0");
    image.record_installed(&a, &manifest("set name=pkg.fmri value=pkg:/a@1.0\n")).unwrap();
    image
        .record_installed(
            &b,
            &manifest("set name=pkg.fmri value=pkg:/b@1.0\ndepend fmri=pkg:/a@1.0 type=require\n"),
        )
        .unwrap();
    image
        .record_installed(
            &c,
            &manifest("set name=pkg.fmri value=pkg:/c@1.0\ndepend fmri=pkg:/a@1.0 type=optional\n"),
        )
        .unwrap();

    assert_eq!(image.get_dependents(&a).unwrap(), vec![b.clone()]);
    assert!(image.get_dependents(&b).unwrap().is_empty());
}

#[test]
fn inventory_orders_and_filters() {
    let temp_dir = tempdir().unwrap();
    let image = Image::create(temp_dir.path(), ImageConfig::default()).unwrap();
    let repo = repo();

    let found = image
        .inventory(&repo, &["zlib".to_string()], true, Some("test"), false)
        .unwrap();
    let names: Vec<String> = found.iter().map(|(f, _)| f.to_string()).collect();
    assert_eq!(
        names,
        vec![
            "pkg://test/library/zlib@1.2.13",
            "pkg://test/library/zlib@1.2.11",
            "pkg://other/library/zlib@1.3",
        ]
    );
    assert!(found.iter().all(|(_, s)| *s == PkgState::Known));

    let best = image
        .inventory(&repo, &["zlib".to_string()], true, None, true)
        .unwrap();
    assert_eq!(best.len(), 1);
    assert_eq!(best[0].0.version(), "1.3");

    let versioned = image
        .inventory(&repo, &["pkg:/library/zlib@1.2".to_string()], true, None, false)
        .unwrap();
    assert_eq!(versioned.len(), 2);

    let globbed = image
        .inventory(&repo, &["web/*".to_string()], true, None, false)
        .unwrap();
    assert_eq!(globbed[0].0.stem(), "web/server/nginx");
}

#[test]
fn inventory_reports_every_unmatched_pattern() {
    let temp_dir = tempdir().unwrap();
    let image = Image::create(temp_dir.path(), ImageConfig::default()).unwrap();
    let repo = repo();
    match image.inventory(
        &repo,
        &["nope".to_string(), "zlib".to_string(), "neither".to_string()],
        true,
        None,
        false,
    ) {
        Err(ImageError::NoMatchingPackages(p)) => assert_eq!(p, vec!["nope", "neither"]),
        other => panic!("expected NoMatchingPackages, got {:?}", other),
    }

    // nothing is installed yet
    assert!(image
        .inventory(&repo, &["zlib".to_string()], false, None, false)
        .is_err());
}
