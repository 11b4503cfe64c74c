// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server frontends over the shell engine: the plain fork-per-connection
//! remote shell, the single-process multiplexed chat server, and the
//! fork-per-connection chat server over shared memory and FIFOs.

#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod mp_world;
pub mod session_loop;

pub const WELCOME: &str = "****************************************\n\
                           ** Welcome to the information server. **\n\
                           ****************************************\n";

pub const TOO_MANY_USERS: &str = "Too many users. Connection refused.\n";

pub fn login_message(name: &str, ip: &str, port: u16) -> String {
    format!("*** User '{name}' entered from {ip}:{port}. ***\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_banner_shape() {
        let lines: Vec<&str> = WELCOME.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.len() == 40));
        assert_eq!(lines[1], "** Welcome to the information server. **");
    }

    #[test]
    fn test_login_message_format() {
        assert_eq!(
            login_message("(no name)", "140.113.1.1", 4577),
            "*** User '(no name)' entered from 140.113.1.1:4577. ***\n"
        );
    }
}
