// Relay pipeline: handoff queue, workers, geometry and wire format

pub mod deadline;
pub mod geometry;
pub mod ingest;
pub mod orchestrator;
pub mod queue;
pub mod result_worker;
pub mod sender;
pub mod types;
pub mod watchdog;
pub mod wire;
