use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Metadata = Map<String, Value>;

/// Which pipeline definition a task runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionKind {
    /// extract the audio track of a video
    Mp4ToMp3,
    /// transcribe an audio file
    Mp3ToTxt,
    /// extract audio, then transcribe it
    Mp4ToTxt,
}

impl ConversionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4ToMp3 => "mp4_to_mp3",
            Self::Mp3ToTxt => "mp3_to_txt",
            Self::Mp4ToTxt => "mp4_to_txt",
        }
    }

    /// Media type the input file must have.
    pub fn input_media(&self) -> MediaType {
        match self {
            Self::Mp4ToMp3 | Self::Mp4ToTxt => MediaType::Video,
            Self::Mp3ToTxt => MediaType::Audio,
        }
    }

    pub fn needs_engine(&self) -> bool {
        !matches!(self, Self::Mp4ToMp3)
    }

    pub fn output_extension(&self) -> &'static str {
        match self {
            Self::Mp4ToMp3 => "mp3",
            Self::Mp3ToTxt | Self::Mp4ToTxt => "txt",
        }
    }
}

impl Display for ConversionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mp4_to_mp3" => Ok(Self::Mp4ToMp3),
            "mp3_to_txt" => Ok(Self::Mp3ToTxt),
            "mp4_to_txt" => Ok(Self::Mp4ToTxt),
            other => Err(format!("Unsupported conversion type: {}", other)),
        }
    }
}

/// Interchangeable speech-recognition engines.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// local whisper.cpp model
    Whisper,
    /// HTTP transcription service
    Remote,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whisper => "whisper",
            Self::Remote => "remote",
        }
    }
}

impl Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "whisper" => Ok(Self::Whisper),
            "remote" => Ok(Self::Remote),
            other => Err(format!("Unsupported conversion engine: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
    Unknown,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "flac", "ogg", "m4a"];

impl MediaType {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Audio
        } else {
            Self::Unknown
        }
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("task {task_id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A request to run one conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub input_path: PathBuf,
    /// name the file was uploaded under
    pub filename: String,
    pub kind: ConversionKind,
    pub engine: Option<Engine>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub filename: String,
    pub input_path: PathBuf,
    pub kind: ConversionKind,
    pub engine: Option<Engine>,
    pub language: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Read-only copy handed out by the registry.
pub type TaskSnapshot = Task;

impl Task {
    pub fn new(id: String, spec: TaskSpec) -> Self {
        let engine = if spec.kind.needs_engine() { spec.engine } else { None };
        Self {
            id,
            filename: spec.filename,
            input_path: spec.input_path,
            kind: spec.kind,
            engine,
            language: spec.language,
            status: TaskStatus::Pending,
            progress: 0,
            message: "Waiting for a worker".to_string(),
            output_path: None,
            error: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.message = "Starting conversion".to_string();
        Ok(())
    }

    /// Applies a progress report. Lower percentages than the current one
    /// are raised to it; reports outside `Running` are ignored.
    pub fn record_progress(&mut self, percent: u8, message: &str) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.progress = percent.min(100).max(self.progress);
        self.message = message.to_string();
        true
    }

    pub fn complete(
        &mut self,
        output_path: PathBuf,
        message: String,
        metadata: Metadata,
    ) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 100;
        self.message = message;
        self.output_path = Some(output_path);
        self.error = None;
        self.metadata = metadata;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: String, metadata: Metadata) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed)?;
        self.message = error.clone();
        self.output_path = None;
        self.error = Some(error);
        self.metadata = metadata;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn output_file_name(&self) -> Option<String> {
        self.output_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Immutable record of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub input_file: String,
    pub output_file: Option<String>,
    #[serde(rename = "type")]
    pub kind: ConversionKind,
    pub success: bool,
    pub message: String,
}

impl HistoryEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            timestamp: task.ended_at.unwrap_or_else(Utc::now),
            input_file: task.filename.clone(),
            output_file: task.output_file_name(),
            kind: task.kind,
            success: task.status == TaskStatus::Completed,
            message: task.message.clone(),
        }
    }
}
