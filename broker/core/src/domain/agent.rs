// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Aggregate
//!
//! An [`Agent`] is one live participant of the simulation as seen by the
//! broker: an identifier, a 2D pose with its previous value, a broadcast
//! range, an active flag, the outbound channel the broker writes to, and the
//! companion process that plays the agent's behavior.
//!
//! Mutable fields live behind a single per-agent [`RwLock`] so a fan-out scan
//! never observes a half-applied update (position moved but range stale).
//! Outbound writes are serialized by the [`OutboundChannel`] implementation,
//! independently of that lock and of the registry lock.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::channel::{ChannelEndpoint, OutboundChannel};
use crate::domain::companion::CompanionHandle;

/// Broadcast radius given to agents that were not configured otherwise.
pub const DEFAULT_RANGE: f64 = 10.0;

/// Numeric identifier carried in the `sender_id` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl AgentId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for AgentId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the simulation plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance between two points.
    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Consistent copy of an agent's mutable fields, taken under one lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSnapshot {
    pub position: Position,
    /// Value of `position` immediately before the latest update.
    pub last_position: Position,
    pub range: f64,
    pub active: bool,
}

impl Default for AgentSnapshot {
    fn default() -> Self {
        Self {
            position: Position::ORIGIN,
            last_position: Position::ORIGIN,
            range: DEFAULT_RANGE,
            active: true,
        }
    }
}

/// Opaque value an external collaborator (e.g. a map view) can hang on an
/// agent. The broker stores it and hands it back, nothing more.
pub type Attachment = Arc<dyn Any + Send + Sync>;

pub struct Agent {
    id: AgentId,
    endpoint: ChannelEndpoint,
    state: RwLock<AgentSnapshot>,
    outbound: Arc<dyn OutboundChannel>,
    companion: Mutex<Option<CompanionHandle>>,
    attachment: RwLock<Option<Attachment>>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        endpoint: ChannelEndpoint,
        outbound: Arc<dyn OutboundChannel>,
        companion: Option<CompanionHandle>,
    ) -> Self {
        Self {
            id,
            endpoint,
            state: RwLock::new(AgentSnapshot::default()),
            outbound,
            companion: Mutex::new(companion),
            attachment: RwLock::new(None),
        }
    }

    pub fn with_range(self, range: f64) -> Self {
        self.set_range(range);
        self
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        *self.state.read()
    }

    pub fn position(&self) -> Position {
        self.state.read().position
    }

    pub fn last_position(&self) -> Position {
        self.state.read().last_position
    }

    /// Moves the agent, shifting the current position into `last_position`.
    pub fn set_position(&self, position: Position) {
        let mut state = self.state.write();
        state.last_position = state.position;
        state.position = position;
    }

    /// Applies a position update only if the agent is active.
    ///
    /// Returns the post-update snapshot, or `None` when the agent is
    /// inactive and nothing changed. Check and update happen under the same
    /// write lock so a concurrent deactivation cannot slip in between.
    pub fn move_if_active(&self, position: Position) -> Option<AgentSnapshot> {
        let mut state = self.state.write();
        if !state.active {
            return None;
        }
        state.last_position = state.position;
        state.position = position;
        Some(*state)
    }

    pub fn range(&self) -> f64 {
        self.state.read().range
    }

    pub fn set_range(&self, range: f64) {
        self.state.write().range = range;
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn set_active(&self, active: bool) {
        self.state.write().active = active;
    }

    /// Flips the active flag and returns the new value.
    pub fn toggle_active(&self) -> bool {
        let mut state = self.state.write();
        state.active = !state.active;
        state.active
    }

    pub fn attach(&self, attachment: Attachment) {
        *self.attachment.write() = Some(attachment);
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.read().clone()
    }

    pub fn take_attachment(&self) -> Option<Attachment> {
        self.attachment.write().take()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_connected()
    }

    pub fn has_companion(&self) -> bool {
        self.companion
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Forwards a raw message to this agent's channel.
    ///
    /// The message and its `\n` terminator go out in a single `send`, so
    /// concurrent deliveries to the same agent never interleave. Failures are
    /// logged and reported as `false`; they never propagate.
    pub async fn deliver(&self, message: &str) -> bool {
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');

        match self.outbound.send(&frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    agent_id = %self.id,
                    channel = %self.endpoint.name(),
                    error = %e,
                    "Dropping delivery to agent"
                );
                false
            }
        }
    }

    /// Closes the outbound channel and joins the companion process.
    pub async fn close(&self) {
        self.outbound.close().await;
        let companion = self.companion.lock().take();
        if let Some(handle) = companion {
            handle.shutdown().await;
        }
        debug!(agent_id = %self.id, "Agent closed");
    }

    /// Lets the companion run on without this agent waiting for it.
    pub fn detach_companion(&self) {
        if let Some(handle) = self.companion.lock().take() {
            handle.detach();
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state.read())
            .field("connected", &self.outbound.is_connected())
            .finish_non_exhaustive()
    }
}
