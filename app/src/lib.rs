mod app;

pub mod balancer;
pub mod error;
pub mod experiment;
pub mod instance;
pub mod metrics;
pub mod monitoring;
pub mod monkey;
pub mod rng;
pub mod runner;
pub mod service;
pub mod spec;
pub mod system;

mod util;

// for main.rs
pub use app::run;
