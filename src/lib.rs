pub mod camera;
pub mod clock;
pub mod config;
pub mod error;
pub mod forecast;
pub mod freshness;
pub mod geo;
pub mod pipeline;
pub mod record;
pub mod repository;
pub mod state;
