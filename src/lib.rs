//! # taskrun-rs
//!
//! A run controller: turns declarative work requests into exactly one
//! execution unit each, no matter how often or how concurrently a request
//! is reconciled.
//!
//! The pieces, from the store inward: a [`storage`] contract (in-memory or
//! Postgres via [`db`]), a [`cache`] fed by the change stream, a
//! deduplicating [`queue`], and the [`engine`] that drains it.

pub mod agent;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod wait;
