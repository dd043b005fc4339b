//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::actions::Action;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Action attributes that ask for a side effect on the live system.
const ACTUATOR_ATTRS: [&str; 5] = [
    "reboot-needed",
    "refresh_fmri",
    "restart_fmri",
    "suspend_fmri",
    "disable_fmri",
];

type ActuatorMap = BTreeMap<String, BTreeSet<String>>;

/// Actuator values collected from the actions a plan installs, updates
/// and removes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Actuators {
    install: ActuatorMap,
    removal: ActuatorMap,
    update: ActuatorMap,
}

fn scan(map: &mut ActuatorMap, action: &Action) {
    for name in ACTUATOR_ATTRS {
        if let Some(value) = action.attr(name) {
            map.entry(name.to_string())
                .or_default()
                .extend(value.values().into_iter().map(str::to_string));
        }
    }
}

impl Actuators {
    pub fn scan_install(&mut self, action: &Action) {
        scan(&mut self.install, action);
    }

    pub fn scan_removal(&mut self, action: &Action) {
        scan(&mut self.removal, action);
    }

    pub fn scan_update(&mut self, action: &Action) {
        scan(&mut self.update, action);
    }

    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.removal.is_empty() && self.update.is_empty()
    }

    /// Updating or removing a tagged action needs a new boot environment.
    pub fn reboot_needed(&self) -> bool {
        [&self.update, &self.removal]
            .iter()
            .any(|m| m.get("reboot-needed").map(|v| v.contains("true")).unwrap_or(false))
    }

    /// Fresh installs of tagged actions only advise a reboot.
    pub fn reboot_advised(&self) -> bool {
        self.install
            .get("reboot-needed")
            .map(|v| v.contains("true"))
            .unwrap_or(false)
    }

    fn merged(&self, name: &str) -> BTreeSet<String> {
        [&self.removal, &self.update, &self.install]
            .iter()
            .filter_map(|m| m.get(name))
            .flatten()
            .cloned()
            .collect()
    }

    /// Services to restart once the plan has executed.
    pub fn restart_fmris(&self) -> BTreeSet<String> {
        self.merged("restart_fmri")
    }

    /// Services to refresh once the plan has executed.
    pub fn refresh_fmris(&self) -> BTreeSet<String> {
        self.merged("refresh_fmri")
    }

    /// Services suspended while their content is updated.
    pub fn suspend_fmris(&self) -> BTreeSet<String> {
        self.update.get("suspend_fmri").cloned().unwrap_or_default()
    }

    /// Services disabled before their content is removed.
    pub fn disable_fmris(&self) -> BTreeSet<String> {
        self.removal.get("disable_fmri").cloned().unwrap_or_default()
    }

    /// Every (actuator, value) pair, with `reboot-needed` reduced to the
    /// overall answer.
    pub fn get_list(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for name in ACTUATOR_ATTRS.iter().skip(1) {
            let values = match *name {
                "suspend_fmri" => self.suspend_fmris(),
                "disable_fmri" => self.disable_fmris(),
                _ => self.merged(name),
            };
            out.extend(values.into_iter().map(|v| (name.to_string(), v)));
        }
        out.push(("reboot-needed".to_string(), self.reboot_needed().to_string()));
        out
    }
}

impl fmt::Display for Actuators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.get_list() {
            writeln!(f, "  {:>16}: {}", name, value)?;
        }
        Ok(())
    }
}
