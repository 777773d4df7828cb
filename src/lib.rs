//! Fujical — Diamond & Pearl Fuji event precomputation engine.
//!
//! For a curated set of ground observation points around Mt. Fuji, the
//! pipeline precomputes every future instant at which the Sun or Moon
//! appears to sit on the summit, and materializes each event in a
//! relational store keyed for calendar lookup. The astronomy kernel and
//! alignment finder are pure; the queue, worker pool, and scheduler
//! move the work; the calendar facade serves the read side.

pub mod astro;
pub mod calendar;
pub mod config;
pub mod error;
pub mod finder;
pub mod jst;
pub mod ops;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod worker;

pub use error::{CoreError, Result};
