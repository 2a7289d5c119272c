// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Elevated side of privfs.
//!
//! The helper runs as the target user (normally root), connects back to the
//! proxy that launched it and executes one filesystem syscall per request.

pub mod error;
pub mod handshake;
pub mod ops;
pub mod server;

pub use error::{HelperError, HelperResult};
pub use handshake::{announce, connect, ControllingTerminal};
pub use server::HelperServer;
