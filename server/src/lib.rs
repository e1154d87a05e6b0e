//! Group federation server library
//!
//! Exposes modules for testing and reuse

pub mod config;
pub mod db;
pub mod error;
pub mod federation;
pub mod handlers;
pub mod models;
pub mod permissions;
pub mod state;
pub mod validation;
