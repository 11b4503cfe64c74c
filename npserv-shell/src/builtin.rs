// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::session::{Session, SessionId};
use crate::world::World;

#[derive(Debug, PartialEq, Eq)]
pub enum BuiltinResult {
    NotBuiltin,
    Handled,
    /// `exit`: the caller tears the session down; no prompt follows.
    Exit,
}

/// Whole-line builtins. Recognition looks only at the first token; a
/// recognized verb consumes the entire line, so pipe or redirect decorations
/// after it are just more words to the verb. Chat verbs dispatch only in
/// worlds that actually have peers; elsewhere they fall through to exec.
pub fn dispatch(session: &mut Session, world: &mut dyn World, line: &str) -> BuiltinResult {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    let Some(&verb) = tokens.first() else {
        return BuiltinResult::NotBuiltin;
    };

    match verb {
        "exit" => BuiltinResult::Exit,
        "setenv" => {
            if tokens.len() < 3 {
                world.deliver(session.id, "Usage: setenv [var] [value]\n");
            } else {
                session
                    .env
                    .insert(tokens[1].to_string(), tokens[2].to_string());
            }
            BuiltinResult::Handled
        }
        "printenv" => {
            if tokens.len() < 2 {
                world.deliver(session.id, "Usage: printenv [var]\n");
            } else if let Some(value) = session.env.get(tokens[1]) {
                let reply = format!("{value}\n");
                world.deliver(session.id, &reply);
            }
            BuiltinResult::Handled
        }
        "who" if world.has_peers() => {
            who(session.id, world);
            BuiltinResult::Handled
        }
        "tell" if world.has_peers() => {
            tell(session.id, world, &tokens);
            BuiltinResult::Handled
        }
        "yell" if world.has_peers() => {
            yell(session.id, world, &tokens);
            BuiltinResult::Handled
        }
        "name" if world.has_peers() => {
            rename(session.id, world, &tokens);
            BuiltinResult::Handled
        }
        _ => BuiltinResult::NotBuiltin,
    }
}

fn caller_name(id: SessionId, world: &dyn World) -> String {
    world.peer(id).map(|p| p.name).unwrap_or_default()
}

/// Words joined with a trailing space after each, the way the chat servers
/// have always rendered relayed messages.
fn join_words(words: &[&str]) -> String {
    words.iter().map(|w| format!("{w} ")).collect()
}

fn who(caller: SessionId, world: &mut dyn World) {
    let mut peers = world.peers();
    peers.sort_by_key(|p| p.id);

    let mut out = String::from("<ID>\t<nickname>\t<IP:port>\t<indicate me>\n");
    for peer in peers {
        out.push_str(&format!(
            "{}\t{}\t{}:{}",
            peer.id, peer.name, peer.ip, peer.port
        ));
        if peer.id == caller {
            out.push_str("\t<-me");
        }
        out.push('\n');
    }
    world.deliver(caller, &out);
}

fn tell(caller: SessionId, world: &mut dyn World, tokens: &[&str]) {
    if tokens.len() < 3 {
        return;
    }
    let Ok(target) = tokens[1].parse::<SessionId>() else {
        return;
    };
    if world.peer(target).is_none() {
        let err = format!("*** Error: user #{target} does not exist yet. ***\n");
        world.deliver(caller, &err);
        return;
    }
    let msg = format!(
        "*** {} told you ***: {}\n",
        caller_name(caller, world),
        join_words(&tokens[2..])
    );
    world.deliver(target, &msg);
}

fn yell(caller: SessionId, world: &mut dyn World, tokens: &[&str]) {
    let msg = format!(
        "*** {} yelled ***: {}\n",
        caller_name(caller, world),
        join_words(&tokens[1..])
    );
    world.broadcast(&msg);
}

fn rename(caller: SessionId, world: &mut dyn World, tokens: &[&str]) {
    let Some(&new_name) = tokens.get(1) else {
        return;
    };
    let Some(me) = world.peer(caller) else {
        return;
    };
    if world.rename(caller, new_name) {
        let msg = format!(
            "*** User from {}:{} is named '{new_name}'. ***\n",
            me.ip, me.port
        );
        world.broadcast(&msg);
    } else {
        let err = format!("*** User '{new_name}' already exists. ***\n");
        world.deliver(caller, &err);
    }
}
