mod job;
mod task;

pub use job::{
    AckState, ImpactLevel, ImpactedInstance, JobStatus, JobStep, MaintenanceJob, Snapshot,
    StepPhase,
};
pub use task::{
    ExecutorData, RepairTask, RepairTaskState, Sequencer, TransitionError, WaveMarker, WavePhase,
};
