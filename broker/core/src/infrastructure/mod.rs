// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod companion;
pub mod event_bus;
#[cfg(unix)]
pub mod fifo;
pub mod in_memory;
