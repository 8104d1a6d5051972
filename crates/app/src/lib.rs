pub mod analysis;
pub mod dump;
pub mod events;
pub mod supervisor;

mod worker;

pub use events::{EventSink, PipelineEvent};
pub use supervisor::{
    CommandOutcome, PipelineSupervisor, ShutdownReport, StartOutcome, StopOutcome,
    SupervisorCommand,
};
