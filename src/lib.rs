pub mod config;
pub mod context;
pub mod cursor;
pub mod errors;
pub mod host;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod step;
