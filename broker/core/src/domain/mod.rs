// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Broker Domain Layer
//!
//! Pure types and ports. No named pipes, no processes.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`agent`] | `Agent`, `AgentId`, `Position`, `AgentSnapshot` |
//! | [`envelope`] | `Envelope`, `EnvelopeError` |
//! | [`channel`] | `OutboundChannel`, `AgentTransport`, `ChannelEndpoint` |
//! | [`companion`] | `CompanionRuntime`, `CompanionHandle`, `CompanionSpec` |
//! | [`events`] | `BrokerEvent` |
//! | [`broker_config`] | `BrokerConfigManifest` |

pub mod agent;
pub mod broker_config;
pub mod channel;
pub mod companion;
pub mod envelope;
pub mod events;
