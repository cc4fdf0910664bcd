//! `:`-prefixed commands typed into the input box.
//!
//! Resolution happens before submission: a line either resolves to exactly one command or is
//! sent to the model unchanged.

pub const COMMAND_PREFIX: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// New session, optionally titled.
    New { topic: Option<String> },
    /// New session from a configured mask preset.
    NewFromMask { mask: String },
    Prev,
    Next,
    Clear,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Argument {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    argument: Argument,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "new",
        description: "start a new chat",
        argument: Argument::Optional,
    },
    CommandSpec {
        name: "newm",
        description: "start a new chat from a mask",
        argument: Argument::Required,
    },
    CommandSpec {
        name: "prev",
        description: "switch to the previous chat",
        argument: Argument::None,
    },
    CommandSpec {
        name: "next",
        description: "switch to the next chat",
        argument: Argument::None,
    },
    CommandSpec {
        name: "clear",
        description: "clear context",
        argument: Argument::None,
    },
    CommandSpec {
        name: "del",
        description: "delete the current chat",
        argument: Argument::None,
    },
];

pub fn commands() -> &'static [CommandSpec] {
    COMMANDS
}

fn split_command(input: &str) -> Option<(&str, &str)> {
    let body = input.trim().strip_prefix(COMMAND_PREFIX)?;
    let (name, argument) = match body.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (body, ""),
    };
    Some((name, argument))
}

/// Exact name first, otherwise the single command the name is a prefix of.
fn resolve(name: &str) -> Option<&'static CommandSpec> {
    if name.is_empty() {
        return None;
    }
    if let Some(exact) = COMMANDS.iter().find(|spec| spec.name == name) {
        return Some(exact);
    }

    let mut candidates = COMMANDS.iter().filter(|spec| spec.name.starts_with(name));
    match (candidates.next(), candidates.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Resolves a full input line. `None` means the line should be sent as chat text.
pub fn match_command(input: &str) -> Option<ChatCommand> {
    let (name, argument) = split_command(input)?;
    let spec = resolve(name)?;

    let argument = match (spec.argument, argument.is_empty()) {
        (Argument::None, false) | (Argument::Required, true) => return None,
        (_, true) => None,
        (_, false) => Some(argument.to_string()),
    };

    let command = match spec.name {
        "new" => ChatCommand::New { topic: argument },
        "newm" => ChatCommand::NewFromMask {
            mask: argument.unwrap_or_default(),
        },
        "prev" => ChatCommand::Prev,
        "next" => ChatCommand::Next,
        "clear" => ChatCommand::Clear,
        "del" => ChatCommand::Delete,
        _ => return None,
    };
    Some(command)
}

/// Ranked completions for a partially typed command.
pub fn search_commands(input: &str) -> Vec<CommandSpec> {
    let Some((name, _)) = split_command(input) else {
        return Vec::new();
    };

    let mut matches = COMMANDS
        .iter()
        .filter(|spec| spec.name.starts_with(name))
        .copied()
        .collect::<Vec<_>>();
    matches.sort_by(|left, right| {
        (left.name != name)
            .cmp(&(right.name != name))
            .then(left.name.len().cmp(&right.name.len()))
            .then(left.name.cmp(right.name))
    });
    matches
}
