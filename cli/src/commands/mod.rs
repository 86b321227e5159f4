// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Proxcast CLI

pub mod config;
pub mod inject;
pub mod run;

pub use self::config::ConfigCommand;
pub use self::inject::InjectArgs;
pub use self::run::RunArgs;
