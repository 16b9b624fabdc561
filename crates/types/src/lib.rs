//! Configuration types shared by the logstore crates.

pub mod config;
