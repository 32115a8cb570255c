pub mod config;
pub mod model;
pub mod relay;
pub mod sink;
