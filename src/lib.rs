//! # dagq
//!
//! Durable DAG workflow engine on a relational store.
//!
//! Provides durable queues with lease-based claiming (pgmq), a notification
//! bus layered on the same transport (LISTEN/NOTIFY), a validated workflow
//! definition model, persisted run and step-task state machines, and a task
//! executor that propagates completions through the dependency graph.

pub mod config;
pub mod dag;
pub mod db;
pub mod definition;
pub mod engine;
pub mod error;
pub mod local;
pub mod model;
pub mod notify;
pub mod queue;
pub mod store;
pub mod telemetry;
