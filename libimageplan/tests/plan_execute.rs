//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use common::{fmri, Fixture, RecordingTracker};
use libimageplan::actions::executors::ApplyOptions;
use libimageplan::plan::{ImagePlan, PlanError, PlanState};
use libimageplan::progress::{CancelFlag, NoopProgressTracker, ProgressTracker};
use libimageplan::repository::MemoryRepository;
use libimageplan::search::LocalIndex;
use std::fs;
use std::os::unix::fs::MetadataExt;

const HELLO_V1: &[u8] = b"#!/bin/sh\necho hello\n";
const HELLO_V2: &[u8] = b"#!/bin/sh\necho hello, world\n";

fn run(plan: &mut ImagePlan<'_, MemoryRepository>) {
    plan.evaluate().unwrap();
    plan.preexecute().unwrap();
    plan.execute().unwrap();
    assert_eq!(plan.state(), PlanState::ExecutedOk);
}

fn install(fx: &mut Fixture, name: &str, tracker: &dyn ProgressTracker) {
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, tracker);
    plan.propose_fmri(fmri(name)).unwrap();
    run(&mut plan);
}

fn update(fx: &mut Fixture, tracker: &dyn ProgressTracker) {
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, tracker);
    plan.plan_update().unwrap();
    run(&mut plan);
}

#[test]
fn install_update_and_remove_a_package() {
    let mut fx = Fixture::new();
    let v1 = fx.repo.add_payload(HELLO_V1);
    let v2 = fx.repo.add_payload(HELLO_V2);
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/hello@1.0\n\
         dir path=usr/bin mode=0755\n\
         file {} path=usr/bin/hello mode=0555 pkg.size={}\n\
         link path=usr/bin/hi target=hello\n",
        v1,
        HELLO_V1.len()
    ));

    let tracker = RecordingTracker::default();
    install(&mut fx, "hello", &tracker);
    assert_eq!(fs::read(fx.root_path("usr/bin/hello")).unwrap(), HELLO_V1);
    assert_eq!(
        fs::read_link(fx.root_path("usr/bin/hi")).unwrap().to_str(),
        Some("hello")
    );
    assert_eq!(
        tracker.phases(),
        vec!["Removal Phase", "Install Phase", "Update Phase", "Index Phase"]
    );
    assert!(tracker.contains(&format!("download goal 1 1 {}", HELLO_V1.len())));
    assert!(tracker.contains("evaluate hello"));
    assert!(tracker.contains("Install Phase actions 4"));
    assert!(fx.image.is_installed(&fmri("pkg://test/hello@1.0")));

    let index = LocalIndex::new(fx.image.index_dir());
    assert_eq!(index.search("hello", None).unwrap(), vec!["pkg://test/hello@1.0"]);

    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/hello@1.1\n\
         dir path=usr/bin mode=0755\n\
         file {} path=usr/bin/hello mode=0555 pkg.size={}\n",
        v2,
        HELLO_V2.len()
    ));
    update(&mut fx, &NoopProgressTracker::default());
    assert_eq!(fs::read(fx.root_path("usr/bin/hello")).unwrap(), HELLO_V2);
    assert!(fs::symlink_metadata(fx.root_path("usr/bin/hi")).is_err());
    assert_eq!(fx.image.installed_fmri("hello").unwrap().version(), "1.1");
    assert_eq!(index.search("hello", None).unwrap(), vec!["pkg://test/hello@1.1"]);

    let tracker = NoopProgressTracker::default();
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.plan_uninstall(&["hello".to_string()]).unwrap();
    run(&mut plan);
    assert!(!fx.root_path("usr").exists());
    assert!(fx.image.installed_fmri("hello").is_none());
    assert!(index.search("hello", None).unwrap().is_empty());
}

#[test]
fn edited_file_follows_a_rename() {
    let mut fx = Fixture::new();
    let conf = fx.repo.add_payload(b"listen 80\n");
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/web@1\nfile {} path=etc/web.conf preserve=true\n",
        conf
    ));
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/web@2\n\
         file {} path=etc/web/web.conf original_name=web:etc/web.conf preserve=true\n",
        conf
    ));

    let tracker = NoopProgressTracker::default();
    install(&mut fx, "pkg://test/web@1", &tracker);
    fs::write(fx.root_path("etc/web.conf"), b"listen 8080\n").unwrap();

    update(&mut fx, &tracker);
    assert!(!fx.root_path("etc/web.conf").exists());
    assert_eq!(
        fs::read(fx.root_path("etc/web/web.conf")).unwrap(),
        b"listen 8080\n"
    );
}

#[test]
fn unedited_file_gets_new_content_after_a_rename() {
    let mut fx = Fixture::new();
    let v1 = fx.repo.add_payload(b"listen 80\n");
    let v2 = fx.repo.add_payload(b"listen 443\n");
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/web@1\nfile {} path=etc/web.conf preserve=true\n",
        v1
    ));
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/web@2\n\
         file {} path=etc/web/web.conf original_name=web:etc/web.conf preserve=true\n",
        v2
    ));

    let tracker = NoopProgressTracker::default();
    install(&mut fx, "pkg://test/web@1", &tracker);
    update(&mut fx, &tracker);
    assert!(!fx.root_path("etc/web.conf").exists());
    assert_eq!(
        fs::read(fx.root_path("etc/web/web.conf")).unwrap(),
        b"listen 443\n"
    );
}

#[test]
fn hardlinks_follow_a_rewritten_file() {
    let mut fx = Fixture::new();
    let v1 = fx.repo.add_payload(b"libfoo 1\n");
    let v2 = fx.repo.add_payload(b"libfoo 2\n");
    for (version, hash) in [("1.0", &v1), ("1.1", &v2)] {
        fx.publish(&format!(
            "set name=pkg.fmri value=pkg://test/libfoo@{}\n\
             file {} path=usr/lib/libfoo.so.1\n\
             hardlink path=usr/lib/libfoo.so target=libfoo.so.1\n",
            version, hash
        ));
    }

    let tracker = NoopProgressTracker::default();
    install(&mut fx, "pkg://test/libfoo@1.0", &tracker);
    update(&mut fx, &tracker);

    let file = fs::metadata(fx.root_path("usr/lib/libfoo.so.1")).unwrap();
    let link = fs::metadata(fx.root_path("usr/lib/libfoo.so")).unwrap();
    assert_eq!(file.ino(), link.ino());
    assert_eq!(fs::read(fx.root_path("usr/lib/libfoo.so")).unwrap(), b"libfoo 2\n");
}

#[test]
fn corrupt_content_stops_before_any_change() {
    let mut fx = Fixture::new();
    let bad = "0000000000000000000000000000000000000000";
    fx.repo.add_raw_payload(bad, b"not what the hash says");
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/bad@1.0\ndir path=opt/bad\nfile {} path=opt/bad/data\n",
        bad
    ));

    let tracker = NoopProgressTracker::default();
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.propose_fmri(fmri("bad")).unwrap();
    plan.evaluate().unwrap();
    assert!(matches!(plan.preexecute(), Err(PlanError::Corrupt { .. })));
    assert_eq!(plan.state(), PlanState::PreexecutedError);
    assert!(matches!(
        plan.execute(),
        Err(PlanError::StatePrecondition { .. })
    ));
    assert!(!fx.root_path("opt").exists());
    assert!(!fx.image.download_dir().join(bad).exists());
    assert!(fx.image.installed_fmri("bad").is_none());
}

#[test]
fn cancelling_during_download() {
    let mut fx = Fixture::new();
    let hash = fx.repo.add_payload(b"data");
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/big@1.0\nfile {} path=opt/big/data\n",
        hash
    ));
    let cancel = CancelFlag::new();
    let tracker = NoopProgressTracker::new(cancel.clone());
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.propose_fmri(fmri("big")).unwrap();
    plan.evaluate().unwrap();

    cancel.cancel();
    assert!(matches!(plan.preexecute(), Err(PlanError::Cancelled)));
    assert_eq!(plan.state(), PlanState::PreexecutedError);
    assert_eq!(fx.repo.fetch_count(), 0);
    assert!(!fx.root_path("opt").exists());
}

#[test]
fn licenses_must_be_accepted() {
    let mut fx = Fixture::new();
    fx.publish(
        "set name=pkg.fmri value=pkg://test/licensed@1.0\n\
         dir path=opt/licensed\n\
         license 1234 license=CDDL must-accept=true\n",
    );
    let tracker = NoopProgressTracker::default();

    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.propose_fmri(fmri("licensed")).unwrap();
    plan.evaluate().unwrap();
    match plan.preexecute() {
        Err(PlanError::LicenseNotAccepted {
            license,
            requirement,
            ..
        }) => {
            assert_eq!(license, "CDDL");
            assert_eq!(requirement, "accepted");
        }
        other => panic!("expected license failure, got {:?}", other),
    }

    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.propose_fmri(fmri("licensed")).unwrap();
    plan.evaluate().unwrap();
    assert!(plan.set_license_status("licensed", "CDDL", Some(true), None));
    plan.preexecute().unwrap();
    plan.execute().unwrap();
    assert!(fx.root_path("opt/licensed").is_dir());
}

#[test]
fn dry_run_leaves_the_image_alone() {
    let mut fx = Fixture::new();
    let hash = fx.repo.add_payload(b"data");
    fx.publish(&format!(
        "set name=pkg.fmri value=pkg://test/tool@1.0\ndir path=opt/tool\nfile {} path=opt/tool/data\n",
        hash
    ));
    let tracker = NoopProgressTracker::default();
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker)
        .with_apply_options(ApplyOptions { dry_run: true });
    plan.propose_fmri(fmri("tool")).unwrap();
    run(&mut plan);
    assert!(!fx.root_path("opt").exists());
    assert!(fx.image.installed_fmri("tool").is_none());
}

#[test]
fn broken_index_is_rebuilt() {
    let mut fx = Fixture::new();
    fx.publish("set name=pkg.fmri value=pkg://test/one@1.0\ndir path=opt/one\n");
    fx.publish("set name=pkg.fmri value=pkg://test/two@1.0\ndir path=opt/two\n");
    let tracker = NoopProgressTracker::default();
    install(&mut fx, "one", &tracker);

    fs::write(fx.image.index_dir().join("search.json"), b"{ not json").unwrap();
    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker);
    plan.propose_fmri(fmri("two")).unwrap();
    run(&mut plan);
    assert!(plan.index_error().is_some());

    let index = LocalIndex::new(fx.image.index_dir());
    assert_eq!(index.search("one", None).unwrap(), vec!["pkg://test/one@1.0"]);
    assert_eq!(index.search("two", None).unwrap(), vec!["pkg://test/two@1.0"]);
}

#[test]
fn recursive_removal_executes_dependents_first() {
    let mut fx = Fixture::new();
    fx.publish("set name=pkg.fmri value=pkg://test/base@1.0\ndir path=opt/base\n");
    fx.publish(
        "set name=pkg.fmri value=pkg://test/addon@1.0\n\
         depend fmri=pkg:/base@1.0 type=require\n\
         dir path=opt/base/addon\n",
    );
    let tracker = NoopProgressTracker::default();
    install(&mut fx, "addon", &tracker);
    assert!(fx.root_path("opt/base/addon").is_dir());

    let mut plan = ImagePlan::new(&mut fx.image, &fx.repo, &tracker).with_recursive_removal(true);
    plan.propose_fmri_removal(fmri("base")).unwrap();
    run(&mut plan);
    assert!(!fx.root_path("opt").exists());
    assert_eq!(fx.image.installed_fmris().count(), 0);
}
