// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use npserv_common::config::Config;
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static RULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*permit\s+([cb])\s+([0-9*]+)\.([0-9*]+)\.([0-9*]+)\.([0-9*]+)\s*$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Connect,
    Bind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Octet {
    Any,
    Value(u8),
}

impl Octet {
    fn parse(token: &str) -> Option<Octet> {
        if token == "*" {
            Some(Octet::Any)
        } else {
            token.parse().ok().map(Octet::Value)
        }
    }

    fn matches(self, value: u8) -> bool {
        match self {
            Octet::Any => true,
            Octet::Value(v) => v == value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    verb: Verb,
    pattern: [Octet; 4],
}

impl Rule {
    pub fn matches(&self, verb: Verb, ip: Ipv4Addr) -> bool {
        self.verb == verb
            && self
                .pattern
                .iter()
                .zip(ip.octets())
                .all(|(octet, value)| octet.matches(value))
    }
}

/// Parses `permit (c|b) OCTET.OCTET.OCTET.OCTET` lines; anything else,
/// malformed octets included, is ignored.
pub fn parse_rules(text: &str) -> Vec<Rule> {
    text.lines()
        .filter_map(|line| {
            let caps = RULE_RE.captures(line)?;
            let verb = match &caps[1] {
                "c" => Verb::Connect,
                _ => Verb::Bind,
            };
            let pattern = [
                Octet::parse(&caps[2])?,
                Octet::parse(&caps[3])?,
                Octet::parse(&caps[4])?,
                Octet::parse(&caps[5])?,
            ];
            Some(Rule { verb, pattern })
        })
        .collect()
}

/// The rule file is re-read on every request, so edits take effect at
/// runtime. No rule matching the request means deny.
#[derive(Debug, Clone)]
pub struct Firewall {
    path: PathBuf,
}

impl Firewall {
    pub fn new(path: PathBuf) -> Self {
        Firewall { path }
    }

    pub fn from_config() -> Self {
        Self::new(Config::get().socks_conf.clone())
    }

    pub fn load(&self) -> Vec<Rule> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_rules(&text),
            Err(_) => Vec::new(),
        }
    }

    pub fn permits(&self, verb: Verb, ip: Ipv4Addr) -> bool {
        self.load().iter().any(|rule| rule.matches(verb, ip))
    }
}
