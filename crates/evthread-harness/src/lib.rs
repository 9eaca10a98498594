//! Stress and conformance scenarios for evthread.
//!
//! Each scenario drives the core primitives from real execution threads and
//! produces a [`ScenarioReport`] that serializes to one JSON line.

#![forbid(unsafe_code)]

pub mod report;
pub mod scenarios;

pub use report::{HarnessError, Outcome, ScenarioReport};
pub use scenarios::{Scenario, ScenarioConfig};
