pub mod auth;
pub mod bootstrap;
pub mod cli;
pub mod comments;
pub mod config;
pub mod database;
pub mod error;
pub mod feed;
pub mod media;
pub mod models;
pub mod node;
pub mod ranking;
mod retry;
pub mod social;
pub mod store;
pub mod submission;
pub mod telemetry;
pub mod users;
pub mod utils;
