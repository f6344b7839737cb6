pub mod constants;
pub mod orchestrator;
pub mod profile;
pub mod quantity;
pub mod telemetry;
