//! Mirror the metadata store into a search index.
//!
//! A run counts what changed since a cutoff, splits it into per-page
//! [`model::WorkItem`]s and hands them to a [`sync::WorkDistributor`]: either the
//! in-process [`worker::WorkerPool`] or the [`broker::SqlBroker`] job table.

pub mod broker;
pub mod config;
pub mod db;
pub mod elastic;
pub mod model;
pub mod planner;
pub mod queue;
pub mod render;
pub mod sync;
pub mod worker;
