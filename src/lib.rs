//! # jobq-rs
//!
//! Durable background job queue backed by Postgres.
//!
//! Clients submit JSON payloads through [`engine::Queue`]; any number of
//! [`worker::Worker`]s claim them atomically (`FOR UPDATE SKIP LOCKED`),
//! execute them through a [`worker::JobHandler`], and record a terminal
//! status. An in-process [`store::memory::MemoryStore`] offers the same
//! contract for tests and local development.

pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod worker;
