//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::filter::{Facets, Variants};
use serde::{Deserialize, Serialize};

/// How plan progress is reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    #[default]
    None,
    /// Report through tracing events
    Log,
}

/// Knobs that change how plans are built and run.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlanPolicy {
    /// Pull in `optional` dependencies as if they were `require`.
    pub require_optional: bool,
    /// Remove dependents along with the packages they depend on.
    pub recursive_removal: bool,
    pub progress: ProgressKind,
    /// Keep the local search index up to date.
    pub index_enabled: bool,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        PlanPolicy {
            require_optional: false,
            recursive_removal: false,
            progress: ProgressKind::None,
            index_enabled: true,
        }
    }
}

/// Persistent per-image settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageConfig {
    pub variants: Variants,
    pub facets: Facets,
    /// Publisher whose packages win when several offer the same stem
    pub preferred_publisher: Option<String>,
    /// Search order for the remaining publishers
    pub publishers: Vec<String>,
    pub policy: PlanPolicy,
}

impl ImageConfig {
    pub fn set_variant(&mut self, name: &str, value: &str) {
        let key = if name.starts_with("variant.") {
            name.to_string()
        } else {
            format!("variant.{}", name)
        };
        self.variants.0.insert(key, value.to_string());
    }

    pub fn set_facet(&mut self, name: &str, enabled: bool) {
        let key = if name.starts_with("facet.") {
            name.to_string()
        } else {
            format!("facet.{}", name)
        };
        self.facets.0.insert(key, enabled);
    }

    /// Rank of a publisher in the search order; the preferred publisher
    /// ranks first and unlisted publishers last.
    pub fn publisher_rank(&self, publisher: Option<&str>) -> usize {
        let publisher = match publisher {
            Some(p) => p,
            None => return self.publishers.len() + 1,
        };
        if self.preferred_publisher.as_deref() == Some(publisher) {
            return 0;
        }
        self.publishers
            .iter()
            .position(|p| p == publisher)
            .map(|i| i + 1)
            .unwrap_or(self.publishers.len() + 1)
    }
}
