// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SOCKS4/4A proxy: request reader, per-request firewall, CONNECT and BIND
//! mode handlers, and a byte-verbatim bidirectional relay.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod firewall;
pub mod relay;
pub mod request;
pub mod server;

pub use firewall::{Firewall, Verb};
pub use request::{SocksRequest, REPLY_GRANTED, REPLY_REJECTED};
