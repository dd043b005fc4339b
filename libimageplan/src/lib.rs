//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Client side planning and execution of IPS package operations.
//!
//! An [`plan::ImagePlan`] takes proposed installs, updates and removals for
//! an [`image::Image`], resolves them against a [`repository::Repository`]
//! and applies the resulting action changes to the image root in three
//! phases. [`api`] wraps the common flows into single calls.

#[allow(clippy::result_large_err)]
pub mod actions;
pub mod api;
pub mod digest;
pub mod filter;
pub mod fmri;
pub mod image;
pub mod manifest;
pub mod plan;
pub mod progress;
pub mod repository;
pub mod search;
