//! # Billable Time
//!
//! Time tracking and billable-work aggregation for project tasks.
//!
//! ## Overview
//!
//! Per task a timer runs at most one interval at a time. Closed intervals are
//! summed into task and project aggregates, which are cached briefly and
//! invalidated whenever a timer starts or stops. Completed tasks are turned
//! into invoices exactly once: each invoiced task carries a stamp naming the
//! invoice it was billed in.
//!
//! - Timer start/stop with force-close of stale running intervals
//! - Read-through aggregate cache with explicit invalidation
//! - Invoice generation, status transitions, overdue sweep, and repair of
//!   partially stamped invoices
//! - SQLite persistence with WAL and conditional writes
//!
//! ## Features
//!
//! - `colors` (default): Enables terminal color output via owo-colors

/// Aggregation of interval rows into task and project totals
pub mod aggregate;

/// Caller-scoped facade over the timer, aggregates, and billing
pub mod api;

/// Invoice generation and lifecycle
pub mod billing;

/// Aggregate cache trait and in-memory implementation
pub mod cache;

/// Command-line argument parsing and configuration
pub mod cli;

/// Injectable time source
pub mod clock;

/// SQLite persistence
pub mod db;

/// Display formatting for text and JSON output
pub mod display;

/// Error types
pub mod error;

/// Persistence gateway trait and in-memory implementation
pub mod gateway;

/// Data models for projects, tasks, intervals, and invoices
pub mod models;

/// Timer state machine
pub mod timer;

/// Utility functions for formatting, logging, and environment
pub mod utils;
