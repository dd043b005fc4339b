//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::fmri::Fmri;
use crate::image::config::ProgressKind;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Trait for reporting progress while a plan is evaluated and executed.
///
/// The plan only pushes information into the tracker; nothing it returns
/// changes planning, except [`ProgressTracker::check_cancel`] which is
/// consulted at points where stopping is still safe.
///
/// # Examples
///
/// ```
/// use libimageplan::fmri::Fmri;
/// use libimageplan::progress::ProgressTracker;
///
/// struct PhasePrinter;
///
/// impl ProgressTracker for PhasePrinter {
///     fn evaluate_start(&self) {}
///     fn evaluate_progress(&self, _fmri: &Fmri) {}
///     fn evaluate_done(&self) {}
///     fn download_set_goal(&self, _packages: usize, _files: u64, _bytes: u64) {}
///     fn download_add_progress(&self, _files: u64, _bytes: u64) {}
///     fn download_done(&self) {}
///     fn actions_set_goal(&self, phase: &str, total: usize) {
///         println!("{}: {} actions", phase, total);
///     }
///     fn actions_add_progress(&self) {}
///     fn actions_done(&self) {}
///     fn index_set_goal(&self, _phase: &str, _total: usize) {}
///     fn index_add_progress(&self) {}
///     fn index_done(&self) {}
/// }
/// ```
pub trait ProgressTracker {
    fn evaluate_start(&self);
    /// One package has been looked at during dependency closure.
    fn evaluate_progress(&self, fmri: &Fmri);
    fn evaluate_done(&self);

    fn download_set_goal(&self, packages: usize, files: u64, bytes: u64);
    fn download_add_progress(&self, files: u64, bytes: u64);
    fn download_done(&self);

    /// Called once per execution phase with its label and action count.
    fn actions_set_goal(&self, phase: &str, total: usize);
    fn actions_add_progress(&self);
    fn actions_done(&self);

    fn index_set_goal(&self, phase: &str, total: usize);
    fn index_add_progress(&self);
    fn index_done(&self);

    /// True once the user asked to stop.
    fn check_cancel(&self) -> bool {
        false
    }
}

/// Shared cancellation request, cheap to clone into a signal handler.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Information about a progress-reporting operation.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// The name of the operation being performed
    pub operation: String,

    /// The current progress value (e.g., bytes downloaded, files processed)
    pub current: Option<u64>,

    /// The total expected value (e.g., total bytes, total files)
    pub total: Option<u64>,

    /// Additional context about the operation (e.g., current package)
    pub context: Option<String>,
}

impl ProgressInfo {
    pub fn new(operation: impl Into<String>) -> Self {
        ProgressInfo {
            operation: operation.into(),
            current: None,
            total: None,
            context: None,
        }
    }

    pub fn with_current(mut self, current: u64) -> Self {
        self.current = Some(current);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;

        match (self.current, self.total) {
            (Some(current), Some(total)) if total > 0 => {
                let percentage = (current as f64 / total as f64) * 100.0;
                write!(f, " {:.1}% ({}/{})", percentage, current, total)?;
            }
            (Some(current), _) => write!(f, " {}", current)?,
            _ => {}
        }

        if let Some(context) = &self.context {
            write!(f, " - {}", context)?;
        }

        Ok(())
    }
}

/// A tracker that reports nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopProgressTracker {
    cancel: CancelFlag,
}

impl NoopProgressTracker {
    pub fn new(cancel: CancelFlag) -> Self {
        NoopProgressTracker { cancel }
    }
}

impl ProgressTracker for NoopProgressTracker {
    fn evaluate_start(&self) {}
    fn evaluate_progress(&self, _fmri: &Fmri) {}
    fn evaluate_done(&self) {}
    fn download_set_goal(&self, _packages: usize, _files: u64, _bytes: u64) {}
    fn download_add_progress(&self, _files: u64, _bytes: u64) {}
    fn download_done(&self) {}
    fn actions_set_goal(&self, _phase: &str, _total: usize) {}
    fn actions_add_progress(&self) {}
    fn actions_done(&self) {}
    fn index_set_goal(&self, _phase: &str, _total: usize) {}
    fn index_add_progress(&self) {}
    fn index_done(&self) {}

    fn check_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Reports progress as tracing events.
///
/// Goals and completions are logged at `info`; per-item progress is only
/// logged each time another tenth of the goal is reached.
#[derive(Debug, Default)]
pub struct LoggingProgressTracker {
    cancel: CancelFlag,
    state: Mutex<Option<ProgressInfo>>,
    bytes: Mutex<(u64, u64)>,
}

impl LoggingProgressTracker {
    pub fn new(cancel: CancelFlag) -> Self {
        LoggingProgressTracker {
            cancel,
            ..Default::default()
        }
    }

    fn start(&self, info: ProgressInfo) {
        info!(progress = %info, "starting");
        if let Ok(mut state) = self.state.lock() {
            *state = Some(info);
        }
    }

    fn step(&self, context: Option<String>) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if let Some(info) = state.as_mut() {
            let current = info.current.unwrap_or(0) + 1;
            info.current = Some(current);
            info.context = context;
            let total = info.total.unwrap_or(0);
            let tenth = (total / 10).max(1);
            if current % tenth == 0 || current == total {
                info!(progress = %info, "progress");
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(info) = state.take() {
                info!(progress = %info, "done");
            }
        }
    }
}

impl ProgressTracker for LoggingProgressTracker {
    fn evaluate_start(&self) {
        self.start(ProgressInfo::new("Creating plan"));
    }

    fn evaluate_progress(&self, fmri: &Fmri) {
        self.step(Some(fmri.to_string()));
    }

    fn evaluate_done(&self) {
        self.finish();
    }

    fn download_set_goal(&self, packages: usize, files: u64, bytes: u64) {
        if let Ok(mut b) = self.bytes.lock() {
            *b = (0, bytes);
        }
        self.start(
            ProgressInfo::new("Downloading")
                .with_total(files)
                .with_context(format!("{} packages, {} bytes", packages, bytes)),
        );
    }

    fn download_add_progress(&self, files: u64, bytes: u64) {
        let done = match self.bytes.lock() {
            Ok(mut b) => {
                b.0 += bytes;
                format!("{}/{} bytes", b.0, b.1)
            }
            Err(_) => String::new(),
        };
        for _ in 0..files {
            self.step(Some(done.clone()));
        }
    }

    fn download_done(&self) {
        self.finish();
    }

    fn actions_set_goal(&self, phase: &str, total: usize) {
        self.start(ProgressInfo::new(phase).with_total(total as u64));
    }

    fn actions_add_progress(&self) {
        self.step(None);
    }

    fn actions_done(&self) {
        self.finish();
    }

    fn index_set_goal(&self, phase: &str, total: usize) {
        self.start(ProgressInfo::new(phase).with_total(total as u64));
    }

    fn index_add_progress(&self) {
        self.step(None);
    }

    fn index_done(&self) {
        self.finish();
    }

    fn check_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Build the tracker selected in the image policy.
pub fn tracker_for(kind: ProgressKind, cancel: CancelFlag) -> Box<dyn ProgressTracker> {
    match kind {
        ProgressKind::None => Box::new(NoopProgressTracker::new(cancel)),
        ProgressKind::Log => Box::new(LoggingProgressTracker::new(cancel)),
    }
}
