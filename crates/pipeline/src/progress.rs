//! Stage-weighted overall progress
//!
//! Each stage owns a slice of `[0, 1]` that depends on the task's plan. Byte
//! counts reported by the transport are mapped into that slice:
//!
//! `overall = start + (done / total) × (end − start)`
//!
//! A high-water mark keeps the emitted value from going backwards when a retry
//! restarts the upload.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use transport::ProgressFn;
use uuid::Uuid;

use crate::events::{PipelineEvent, Stage};
use crate::task::TransformPlan;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRange {
    pub start: f64,
    pub end: f64,
}

/// Slice used while a sequential plan re-uploads the resized image, between
/// the end of resize and the start of convert.
pub const REUPLOAD_RANGE: StageRange = StageRange {
    start: 0.60,
    end: 0.65,
};

const fn range(start: f64, end: f64) -> Option<StageRange> {
    Some(StageRange { start, end })
}

/// Slice of overall progress owned by `stage` under `plan`, or `None` when the
/// plan does not run that stage.
pub fn stage_range(plan: &TransformPlan, stage: Stage) -> Option<StageRange> {
    match (plan, stage) {
        (_, Stage::Upload) => range(0.05, 0.35),
        (_, Stage::Finalize) => range(1.0, 1.0),
        (TransformPlan::None, Stage::Download) => range(0.60, 0.90),
        (TransformPlan::Resize(_) | TransformPlan::Combined(..), Stage::Resize) => {
            range(0.50, 0.85)
        }
        (TransformPlan::Convert(_), Stage::Convert) => range(0.50, 0.85),
        (TransformPlan::Sequential(..), Stage::Resize) => range(0.40, 0.60),
        (TransformPlan::Sequential(..), Stage::Convert) => range(0.65, 0.90),
        _ => None,
    }
}

/// Map a byte count into a stage range. Unknown or zero totals yield `start`.
pub fn overall(range: StageRange, done: u64, total: Option<u64>) -> f64 {
    let fraction = match total {
        Some(total) if total > 0 => (done as f64 / total as f64).clamp(0.0, 1.0),
        _ => 0.0,
    };
    (range.start + fraction * (range.end - range.start)).clamp(0.0, 1.0)
}

/// Publishes `Progress` events for one task.
pub struct ProgressEmitter {
    task_id: Uuid,
    plan: TransformPlan,
    events: broadcast::Sender<PipelineEvent>,
    /// f64 bits; non-negative floats order the same as their bit patterns.
    high_water: AtomicU64,
}

impl ProgressEmitter {
    pub fn new(
        task_id: Uuid,
        plan: TransformPlan,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            task_id,
            plan,
            events,
            high_water: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Highest overall progress emitted so far.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.high_water.load(Ordering::Acquire))
    }

    /// Report a byte count for `stage`. Ignored for stages outside the plan.
    pub fn report(&self, stage: Stage, done: u64, total: Option<u64>) {
        if let Some(range) = stage_range(&self.plan, stage) {
            self.report_in(stage, range, done, total);
        }
    }

    /// Report a byte count against an explicit range instead of the plan's.
    pub fn report_in(&self, stage: Stage, range: StageRange, done: u64, total: Option<u64>) {
        let value = overall(range, done, total);
        self.emit(stage, value, stage_message(stage, done, total));
    }

    /// Emit an explicit overall value, e.g. a stage boundary.
    pub fn mark(&self, stage: Stage, value: f64, message: impl Into<String>) {
        self.emit(stage, value.clamp(0.0, 1.0), message.into());
    }

    /// Jump to the end of `stage`'s range.
    pub fn complete(&self, stage: Stage, message: impl Into<String>) {
        if let Some(range) = stage_range(&self.plan, stage) {
            self.mark(stage, range.end, message);
        }
    }

    /// Transport callback bound to `stage`.
    pub fn callback(self: &Arc<Self>, stage: Stage) -> ProgressFn {
        let emitter = Arc::clone(self);
        Arc::new(move |done, total| emitter.report(stage, done, total))
    }

    /// Transport callback mapped into `range`.
    pub fn callback_in(self: &Arc<Self>, stage: Stage, range: StageRange) -> ProgressFn {
        let emitter = Arc::clone(self);
        Arc::new(move |done, total| emitter.report_in(stage, range, done, total))
    }

    fn emit(&self, stage: Stage, value: f64, message: String) {
        let previous = f64::from_bits(self.high_water.fetch_max(value.to_bits(), Ordering::AcqRel));
        let progress = previous.max(value);
        let _ = self.events.send(PipelineEvent::Progress {
            task_id: self.task_id,
            stage,
            progress,
            message,
        });
    }
}

fn stage_message(stage: Stage, done: u64, total: Option<u64>) -> String {
    let verb = match stage {
        Stage::Upload => "Uploading",
        Stage::Resize => "Resizing",
        Stage::Convert => "Converting",
        Stage::Download => "Downloading",
        Stage::Finalize => "Finishing",
    };
    match total {
        Some(total) => format!("{verb} {} of {}", human_bytes(done), human_bytes(total)),
        None => format!("{verb} {}", human_bytes(done)),
    }
}

/// `1536` → `"1.5 KiB"`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
