//! Lifecycle events published by the orchestrator
//!
//! Delivered over a `tokio::sync::broadcast` channel. Slow subscribers lag
//! and lose events; the pipeline never waits for them.

use key_pool::ErrorKind;
use serde::Serialize;
use uuid::Uuid;

use crate::task::SourceKind;

/// Progress-bearing stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Resize,
    Convert,
    Download,
    Finalize,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Resize => "resize",
            Stage::Convert => "convert",
            Stage::Download => "download",
            Stage::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Start {
        task_id: Uuid,
        source: SourceKind,
        description: String,
        original_size: Option<u64>,
        plan: &'static str,
    },
    Selecting {
        task_id: Uuid,
        attempt: u32,
        max_attempts: u32,
    },
    Progress {
        task_id: Uuid,
        stage: Stage,
        /// Overall progress in `[0, 1]`; never decreases within a task.
        progress: f64,
        message: String,
    },
    QuotaUpdate {
        task_id: Uuid,
        index: usize,
        used: u64,
        remaining: u64,
        limit: u64,
    },
    /// A credential was disabled.
    KeyError {
        task_id: Uuid,
        index: usize,
        kind: ErrorKind,
        message: String,
    },
    Success {
        task_id: Uuid,
        original_size: Option<u64>,
        compressed_size: u64,
        saved_bytes: u64,
        saved_percent: f64,
        credential_index: usize,
        attempts: u32,
    },
    Error {
        task_id: Uuid,
        kind: Option<ErrorKind>,
        index: Option<usize>,
        message: String,
        status: Option<u16>,
    },
}

impl PipelineEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            PipelineEvent::Start { task_id, .. }
            | PipelineEvent::Selecting { task_id, .. }
            | PipelineEvent::Progress { task_id, .. }
            | PipelineEvent::QuotaUpdate { task_id, .. }
            | PipelineEvent::KeyError { task_id, .. }
            | PipelineEvent::Success { task_id, .. }
            | PipelineEvent::Error { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Success { .. } | PipelineEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let id = Uuid::nil();
        let ev = PipelineEvent::QuotaUpdate {
            task_id: id,
            index: 1,
            used: 120,
            remaining: 380,
            limit: 500,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "quota_update");
        assert_eq!(json["remaining"], 380);
        assert_eq!(ev.task_id(), id);
        assert!(!ev.is_terminal());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let ev = PipelineEvent::KeyError {
            task_id: Uuid::nil(),
            index: 0,
            kind: ErrorKind::AuthExpired,
            message: "API key rejected".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "auth_expired");
    }
}
