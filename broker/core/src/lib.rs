// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Proxcast Broker Core
//!
//! Proximity fan-out for multi-agent simulations. Agents write position
//! envelopes to a shared ingest channel; the broker forwards each message,
//! byte for byte, to every other active agent inside the sender's range.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Agent registry, ingest loop, fan-out worker, FIFO transport
//!   and companion process supervision

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{AgentRegistry, Broker, FanOutOutcome, FanOutWorker, IngestLoop};
pub use domain::*;
