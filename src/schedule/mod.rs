pub mod broadcast;
pub mod history;
pub mod pipeline;
pub mod retention;
pub mod scheduler;
pub mod stage;
pub mod types;
#[cfg(test)]
mod tests;

// re-export the main types
pub use types::{
    ConversionKind, Engine, HistoryEntry, MediaType, Task, TaskSnapshot, TaskSpec, TaskStatus,
};

pub use broadcast::{ListChange, ProgressBroadcaster, TaskEvent};
pub use pipeline::{PipelineComposer, StageCatalog};
pub use scheduler::{Dispatcher, DispatcherOptions, SubmitError, TaskRegistry};
pub use stage::{Stage, StageOutcome, StageRunner};
