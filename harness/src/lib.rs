//! TaskHub: a single-host asynchronous task execution platform.
//!
//! This crate provides the binary's component implementations (API,
//! Worker, Scheduler, Reaper) built on top of `taskhub-core`'s contracts
//! and `taskhub-store-sqlite`'s `Store` implementation.

pub mod api;
pub mod config;
pub mod reaper;
pub mod scheduler;
pub mod supervisor;
pub mod tasks;
pub mod worker;
