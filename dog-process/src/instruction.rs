use dog_upload::MetaData;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upload metadata key holding the JSON array of instruction strings
pub const PROCESSING_KEY: &str = "processing";

/// A single post-processing step requested through upload metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `resize:<W>x<H>`
    Resize { width: u32, height: u32 },
    /// `thumbnail`
    Thumbnail,
    /// `extract_text`
    ExtractText,
    /// `transcribe_audio`
    TranscribeAudio,
}

impl Instruction {
    /// Parse an instruction string; unknown or malformed strings yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "thumbnail" => Some(Self::Thumbnail),
            "extract_text" => Some(Self::ExtractText),
            "transcribe_audio" => Some(Self::TranscribeAudio),
            other => {
                let dims = other.strip_prefix("resize:")?;
                let (w, h) = dims.split_once(['x', 'X'])?;
                let width: u32 = w.trim().parse().ok()?;
                let height: u32 = h.trim().parse().ok()?;
                if width == 0 || height == 0 {
                    return None;
                }
                Some(Self::Resize { width, height })
            }
        }
    }

    /// Name used for derived artifact keys and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resize { .. } => "resize",
            Self::Thumbnail => "thumbnail",
            Self::ExtractText => "extract_text",
            Self::TranscribeAudio => "transcribe_audio",
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resize { width, height } => write!(f, "resize:{}x{}", width, height),
            other => f.write_str(other.kind()),
        }
    }
}

/// Instruction strings listed under the `processing` metadata key.
/// A missing key means no processing; malformed JSON is logged and ignored.
pub fn parse_instructions(metadata: &MetaData) -> Vec<String> {
    let Some(raw) = metadata.get(PROCESSING_KEY) else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, value = %raw, "Ignoring malformed processing metadata");
            Vec::new()
        }
    }
}

/// What happened to one instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstructionOutcome {
    Succeeded { instruction: String },
    Skipped { instruction: String, reason: String },
    Failed { instruction: String, error: String },
}

impl InstructionOutcome {
    pub fn succeeded<S: Into<String>>(instruction: S) -> Self {
        Self::Succeeded {
            instruction: instruction.into(),
        }
    }

    pub fn skipped<S: Into<String>, R: Into<String>>(instruction: S, reason: R) -> Self {
        Self::Skipped {
            instruction: instruction.into(),
            reason: reason.into(),
        }
    }

    pub fn failed<S: Into<String>, E: std::fmt::Display>(instruction: S, error: E) -> Self {
        Self::Failed {
            instruction: instruction.into(),
            error: error.to_string(),
        }
    }

    pub fn instruction(&self) -> &str {
        match self {
            Self::Succeeded { instruction }
            | Self::Skipped { instruction, .. }
            | Self::Failed { instruction, .. } => instruction,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
