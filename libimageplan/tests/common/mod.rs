//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use libimageplan::actions::{Action, ActionName};
use libimageplan::fmri::Fmri;
use libimageplan::image::config::ImageConfig;
use libimageplan::image::Image;
use libimageplan::manifest::Manifest;
use libimageplan::plan::PlanStep;
use libimageplan::progress::ProgressTracker;
use libimageplan::repository::MemoryRepository;
use std::cell::RefCell;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fmri(s: &str) -> Fmri {
    Fmri::parse(s).unwrap()
}

pub fn manifest(text: &str) -> Manifest {
    Manifest::parse_string(text).unwrap()
}

pub struct Fixture {
    _tmp: TempDir,
    pub image: Image,
    pub repo: MemoryRepository,
}

impl Fixture {
    pub fn new() -> Fixture {
        init_tracing();
        let tmp = tempfile::tempdir().unwrap();
        let image = Image::create(tmp.path().join("root"), ImageConfig::default()).unwrap();
        Fixture {
            _tmp: tmp,
            image,
            repo: MemoryRepository::new(),
        }
    }

    pub fn publish(&mut self, text: &str) -> Fmri {
        self.repo.publish(text).unwrap()
    }

    /// Mark a package installed without touching the image root.
    pub fn preinstall(&mut self, text: &str) -> Fmri {
        let m = manifest(text);
        let f = m.fmri.clone().unwrap();
        self.image.record_installed(&f, &m).unwrap();
        f
    }

    pub fn root_path(&self, rel: &str) -> PathBuf {
        self.image.path().join(rel)
    }
}

/// (action name, key) of every step, in list order.
pub fn keys(steps: &[PlanStep], only: &[ActionName]) -> Vec<(String, String)> {
    steps
        .iter()
        .filter_map(PlanStep::action)
        .filter(|a| only.contains(&a.name()))
        .map(|a: &Action| (a.name().to_string(), a.key_value().unwrap_or_default()))
        .collect()
}

pub fn pair(name: &str, key: &str) -> (String, String) {
    (name.to_string(), key.to_string())
}

/// Remembers every progress call in order.
#[derive(Default)]
pub struct RecordingTracker {
    pub events: RefCell<Vec<String>>,
}

impl RecordingTracker {
    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    pub fn phases(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| e.strip_prefix("goal "))
            .map(str::to_string)
            .collect()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.borrow().iter().any(|e| e == event)
    }
}

impl ProgressTracker for RecordingTracker {
    fn evaluate_start(&self) {
        self.push("evaluate start".into());
    }
    fn evaluate_progress(&self, fmri: &Fmri) {
        self.push(format!("evaluate {}", fmri.stem()));
    }
    fn evaluate_done(&self) {
        self.push("evaluate done".into());
    }
    fn download_set_goal(&self, packages: usize, files: u64, bytes: u64) {
        self.push(format!("download goal {} {} {}", packages, files, bytes));
    }
    fn download_add_progress(&self, files: u64, bytes: u64) {
        self.push(format!("download {} {}", files, bytes));
    }
    fn download_done(&self) {
        self.push("download done".into());
    }
    fn actions_set_goal(&self, phase: &str, total: usize) {
        self.push(format!("goal {}", phase));
        self.push(format!("{} actions {}", phase, total));
    }
    fn actions_add_progress(&self) {
        self.push("action".into());
    }
    fn actions_done(&self) {
        self.push("actions done".into());
    }
    fn index_set_goal(&self, phase: &str, total: usize) {
        self.push(format!("goal {}", phase));
        self.push(format!("{} packages {}", phase, total));
    }
    fn index_add_progress(&self) {
        self.push("indexed".into());
    }
    fn index_done(&self) {
        self.push("index done".into());
    }
}
