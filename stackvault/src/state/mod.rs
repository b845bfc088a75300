pub mod recorder;

pub use recorder::{ContainerRecord, HealthKind, ProjectRecord, StateRecorder};
