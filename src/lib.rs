pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod quota;
pub mod settings;
pub mod updater;
pub mod worker;
pub mod youtube;
