// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process plumbing for the fork-per-connection chat server: a shared
//! memory roster of clients with per-slot message inboxes, filesystem FIFOs
//! carrying inter-session pipes, and the SIGUSR1/SIGUSR2 delivery that ties
//! the two together.

#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod fifo;
pub mod shm;
pub mod signals;

pub use fifo::UserPipeDir;
pub use shm::{ClientTable, SlotInfo};
