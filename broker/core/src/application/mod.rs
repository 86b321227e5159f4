// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_factory;
pub mod broker;
pub mod fan_out;
pub mod ingest;
pub mod registry;

pub use broker::Broker;
pub use fan_out::{FanOutOutcome, FanOutWorker};
pub use ingest::{IngestLoop, IngestSettings};
pub use registry::{AgentRegistry, AgentRequest, ReadyCallback, RegistryError};
