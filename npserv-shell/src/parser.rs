// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::session::SessionId;

/// What the stage's stdout feeds, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeOut {
    #[default]
    None,
    /// `|`: pipe into the next stage on the same line (table key 0).
    Ordinary,
    /// `|N`: pipe into the first stage executed N lines later.
    Numbered(u32),
}

/// One executable unit on a command line, with its I/O decorations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stage {
    pub argv: Vec<String>,
    pub pipe_out: PipeOut,
    /// `!`/`!N`: stderr joins stdout in the pipe.
    pub merge_stderr: bool,
    /// `> path`: stdout goes to the file (created, truncated, 0644).
    pub file_redirect: Option<String>,
    /// `>N`: stdout goes to session N.
    pub user_pipe_out: Option<SessionId>,
    /// `<N`: stdin comes from session N.
    pub user_pipe_in: Option<SessionId>,
}

fn digits(token: &str) -> Option<i32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Splits a line (already stripped of the trailing CR/LF) into stages.
///
/// Tokens are separated by ASCII whitespace; there is no quoting. A pipe
/// token closes the current stage even if its argv is still empty; a
/// trailing stage is kept only when it accumulated argv words. Malformed
/// input is not rejected here; an empty argv flows to exec and fails with
/// the unknown-command diagnostic there.
pub fn parse_line(line: &str) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut current = Stage::default();
    let mut tokens = line.split_ascii_whitespace();

    while let Some(token) = tokens.next() {
        if let Some(rest) = token.strip_prefix('|').or_else(|| token.strip_prefix('!')) {
            // A non-numeric delay degrades to an ordinary pipe.
            let delay = digits(rest).unwrap_or(0).max(0) as u32;
            current.pipe_out = if delay == 0 {
                PipeOut::Ordinary
            } else {
                PipeOut::Numbered(delay)
            };
            current.merge_stderr = token.starts_with('!');
            stages.push(std::mem::take(&mut current));
        } else if token == ">" {
            if let Some(path) = tokens.next() {
                current.file_redirect = Some(path.to_string());
            }
        } else if let Some(id) = token.strip_prefix('>').and_then(digits) {
            current.user_pipe_out = Some(id);
        } else if let Some(id) = token.strip_prefix('<').and_then(digits) {
            current.user_pipe_in = Some(id);
        } else {
            current.argv.push(token.to_string());
        }
    }
    if !current.argv.is_empty() {
        stages.push(current);
    }
    stages
}
