// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command execution engine shared by every shell server variant.
//!
//! A line of input is lexed into [`parser::Stage`]s, whole-line builtins are
//! dispatched first, and everything else is wired up with pipes (ordinary,
//! numbered, inter-session) and run through fork/exec by [`executor`]. The
//! engine talks to its surroundings exclusively through the [`world::World`]
//! trait, so the same code drives the plain remote shell, the single-process
//! chat server and the multi-process chat server.

#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod builtin;
pub mod engine;
pub mod executor;
pub mod parser;
pub mod pipes;
pub mod session;
pub mod world;

pub use engine::{run_line, LineResult, PROMPT};
pub use session::{Session, SessionId};
