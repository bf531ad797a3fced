pub mod build_info;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod health;
pub mod logging;
pub mod server;
pub mod state;
pub mod sync_service;
pub mod upstream;
