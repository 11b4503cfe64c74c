// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::builtin::{self, BuiltinResult};
use crate::executor;
use crate::parser;
use crate::session::Session;
use crate::world::World;
use std::io;

/// Two bytes, no newline, after every executed line and on session start.
pub const PROMPT: &str = "% ";

#[derive(Debug, PartialEq, Eq)]
pub enum LineResult {
    Continue,
    /// The session asked to leave; the caller releases its resources.
    Exit,
}

/// Executes one raw input line: builtins first, then the staged pipeline.
///
/// Exactly one prompt is sent per line to a session that stays connected;
/// the numbered-pipe table advances once per non-empty line, builtins
/// included. Errors returned here are fatal to the session only, never to
/// the server.
pub fn run_line(
    session: &mut Session,
    world: &mut dyn World,
    raw_line: &str,
) -> io::Result<LineResult> {
    let line = raw_line.trim_end_matches(['\r', '\n']);

    if line.split_ascii_whitespace().next().is_none() {
        world.deliver(session.id, PROMPT);
        return Ok(LineResult::Continue);
    }

    match builtin::dispatch(session, world, line) {
        BuiltinResult::Exit => return Ok(LineResult::Exit),
        BuiltinResult::Handled => {
            session.pipes.tick();
            world.deliver(session.id, PROMPT);
            return Ok(LineResult::Continue);
        }
        BuiltinResult::NotBuiltin => {}
    }

    let stages = parser::parse_line(line);
    executor::run_stages(session, world, &stages, line)?;
    session.pipes.tick();
    world.deliver(session.id, PROMPT);
    Ok(LineResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{PeerInfo, UserPipeError, UserPipeTx};
    use crate::SessionId;
    use std::os::fd::OwnedFd;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<String>,
    }

    impl World for Recorder {
        fn deliver(&mut self, _id: SessionId, msg: &str) {
            self.sent.push(msg.to_string());
        }
        fn broadcast(&mut self, msg: &str) {
            self.sent.push(msg.to_string());
        }
        fn peer(&self, _id: SessionId) -> Option<PeerInfo> {
            None
        }
        fn peers(&self) -> Vec<PeerInfo> {
            Vec::new()
        }
        fn rename(&mut self, _id: SessionId, _new_name: &str) -> bool {
            false
        }
        fn user_pipe_send(
            &mut self,
            _src: SessionId,
            dst: SessionId,
            _line: &str,
        ) -> Result<UserPipeTx, UserPipeError> {
            Err(UserPipeError::NoSuchUser(dst))
        }
        fn user_pipe_recv(
            &mut self,
            src: SessionId,
            _dst: SessionId,
            _line: &str,
        ) -> Result<OwnedFd, UserPipeError> {
            Err(UserPipeError::NoSuchUser(src))
        }
        fn remove(&mut self, _id: SessionId) {}
    }

    #[test]
    fn test_empty_line_prompts_without_tick() {
        let mut session = Session::new(1);
        session.pipes.ensure(1).unwrap();
        let mut world = Recorder::default();

        let result = run_line(&mut session, &mut world, "  \r\n").unwrap();
        assert_eq!(result, LineResult::Continue);
        assert_eq!(world.sent, vec![PROMPT.to_string()]);
        // No line was executed, so the delayed pipe did not advance.
        assert!(session.pipes.contains(1));
    }

    #[test]
    fn test_builtin_line_ticks_pipes() {
        let mut session = Session::new(1);
        session.pipes.ensure(1).unwrap();
        let mut world = Recorder::default();

        run_line(&mut session, &mut world, "setenv FOO bar").unwrap();
        assert!(session.pipes.contains(0));
        assert_eq!(world.sent.last().map(String::as_str), Some(PROMPT));
    }

    #[test]
    fn test_exit_sends_no_prompt() {
        let mut session = Session::new(1);
        let mut world = Recorder::default();
        let result = run_line(&mut session, &mut world, "exit").unwrap();
        assert_eq!(result, LineResult::Exit);
        assert!(world.sent.is_empty());
    }
}
