//! Pipeline stages in their fixed execution order.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// One named step of the video processing pipeline.
///
/// Variants are declared in pipeline order, so the derived `Ord` matches
/// execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    SplitChunks,
    StoreChunks,
    QueueAnalysis,
    AiAnalysis,
    AssembleTimeline,
    RenderVideo,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::Upload,
        Stage::SplitChunks,
        Stage::StoreChunks,
        Stage::QueueAnalysis,
        Stage::AiAnalysis,
        Stage::AssembleTimeline,
        Stage::RenderVideo,
    ];

    /// The stage every new job starts in.
    pub fn first() -> Self {
        Stage::Upload
    }

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage that follows this one, or `None` for the terminal stage.
    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Whether completing this stage completes the job.
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Job progress once this stage has completed.
    pub fn progress_after(self) -> u8 {
        let done = (self.index() + 1) * 100 / Self::ALL.len();
        done as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::SplitChunks => "split_chunks",
            Stage::StoreChunks => "store_chunks",
            Stage::QueueAnalysis => "queue_analysis",
            Stage::AiAnalysis => "ai_analysis",
            Stage::AssembleTimeline => "assemble_timeline",
            Stage::RenderVideo => "render_video",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseError::new("stage", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_next() {
        assert_eq!(Stage::first(), Stage::Upload);
        assert_eq!(Stage::Upload.next(), Some(Stage::SplitChunks));
        assert_eq!(Stage::AssembleTimeline.next(), Some(Stage::RenderVideo));
        assert_eq!(Stage::RenderVideo.next(), None);
        assert!(Stage::RenderVideo.is_terminal());
        assert!(!Stage::AiAnalysis.is_terminal());
        assert!(Stage::Upload < Stage::RenderVideo);
    }

    #[test]
    fn test_progress_after() {
        assert_eq!(Stage::Upload.progress_after(), 14);
        assert_eq!(Stage::QueueAnalysis.progress_after(), 57);
        assert_eq!(Stage::RenderVideo.progress_after(), 100);
    }

    #[test]
    fn test_stage_string_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        assert!("transcode".parse::<Stage>().is_err());
        assert_eq!(
            serde_json::to_value(Stage::AiAnalysis).ok(),
            Some(serde_json::json!("ai_analysis"))
        );
    }
}
