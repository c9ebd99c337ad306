pub mod config;
pub mod lines;
pub mod orchestrator;
pub mod pipeline;
pub mod session;
pub mod surface;
pub mod telemetry;
