//! Slash commands understood by the interactive product-image session.

#[derive(Clone, Copy, Debug)]
struct CommandSpec {
    command: &'static str,
    usage: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "add",
        usage: "/add <path>...",
    },
    CommandSpec {
        command: "crop",
        usage: "/crop <slot> <x%> <y%> <w%> <h%>",
    },
    CommandSpec {
        command: "edit",
        usage: "/edit <slot> <operation> [reference...]",
    },
    CommandSpec {
        command: "history",
        usage: "/history <slot>",
    },
    CommandSpec {
        command: "discard",
        usage: "/discard <slot>",
    },
    CommandSpec {
        command: "remove",
        usage: "/remove <slot>",
    },
    CommandSpec {
        command: "list",
        usage: "/list",
    },
    CommandSpec {
        command: "ops",
        usage: "/ops",
    },
    CommandSpec {
        command: "submit",
        usage: "/submit",
    },
    CommandSpec {
        command: "help",
        usage: "/help",
    },
    CommandSpec {
        command: "quit",
        usage: "/quit",
    },
];

pub fn help_lines() -> Vec<&'static str> {
    COMMANDS.iter().map(|spec| spec.usage).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Noop,
    Help,
    Quit,
    List,
    Operations,
    Submit,
    Add {
        paths: Vec<String>,
    },
    Crop {
        slot: usize,
        rect: [f64; 4],
    },
    Edit {
        slot: usize,
        operation: String,
        references: Vec<String>,
    },
    History {
        slot: usize,
    },
    Discard {
        slot: usize,
    },
    Remove {
        slot: usize,
    },
    Invalid {
        usage: &'static str,
        reason: String,
    },
    Unknown {
        raw: String,
    },
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

fn usage_for(command: &str) -> &'static str {
    COMMANDS
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.usage)
        .unwrap_or("/help")
}

fn invalid(command: &str, reason: impl Into<String>) -> SessionCommand {
    SessionCommand::Invalid {
        usage: usage_for(command),
        reason: reason.into(),
    }
}

fn parse_slot(command: &str, raw: Option<&String>) -> Result<usize, SessionCommand> {
    let Some(raw) = raw else {
        return Err(invalid(command, "missing slot number"));
    };
    raw.parse::<usize>()
        .map_err(|_| invalid(command, format!("'{raw}' is not a slot number")))
}

pub fn parse_command(text: &str) -> SessionCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return SessionCommand::Noop;
    }
    let Some(tail) = trimmed.strip_prefix('/') else {
        return SessionCommand::Unknown {
            raw: trimmed.to_string(),
        };
    };
    let command_len = tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return SessionCommand::Unknown {
            raw: trimmed.to_string(),
        };
    }
    let command = tail[..command_len].to_ascii_lowercase();
    let args = split_args(&tail[command_len..]);

    match command.as_str() {
        "help" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        "list" => SessionCommand::List,
        "ops" => SessionCommand::Operations,
        "submit" => SessionCommand::Submit,
        "add" => {
            if args.is_empty() {
                return invalid("add", "no files given");
            }
            SessionCommand::Add { paths: args }
        }
        "crop" => {
            let slot = match parse_slot("crop", args.first()) {
                Ok(slot) => slot,
                Err(err) => return err,
            };
            let numbers: Vec<f64> = args
                .iter()
                .skip(1)
                .filter_map(|value| value.trim_end_matches('%').parse::<f64>().ok())
                .collect();
            if args.len() != 5 || numbers.len() != 4 {
                return invalid("crop", "expected four percentages");
            }
            SessionCommand::Crop {
                slot,
                rect: [numbers[0], numbers[1], numbers[2], numbers[3]],
            }
        }
        "edit" => {
            let slot = match parse_slot("edit", args.first()) {
                Ok(slot) => slot,
                Err(err) => return err,
            };
            let Some(operation) = args.get(1) else {
                return invalid("edit", "missing operation");
            };
            SessionCommand::Edit {
                slot,
                operation: operation.to_ascii_lowercase(),
                references: args.iter().skip(2).cloned().collect(),
            }
        }
        "history" | "discard" | "remove" => {
            let slot = match parse_slot(&command, args.first()) {
                Ok(slot) => slot,
                Err(err) => return err,
            };
            match command.as_str() {
                "history" => SessionCommand::History { slot },
                "discard" => SessionCommand::Discard { slot },
                _ => SessionCommand::Remove { slot },
            }
        }
        _ => SessionCommand::Unknown {
            raw: trimmed.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_is_noop() {
        assert_eq!(parse_command("   "), SessionCommand::Noop);
    }

    #[test]
    fn add_keeps_quoted_paths() {
        assert_eq!(
            parse_command("/add \"front view.png\" back.jpg"),
            SessionCommand::Add {
                paths: vec!["front view.png".to_string(), "back.jpg".to_string()],
            }
        );
    }

    #[test]
    fn crop_accepts_percent_suffix() {
        assert_eq!(
            parse_command("/crop 1 10% 5 80 90%"),
            SessionCommand::Crop {
                slot: 1,
                rect: [10.0, 5.0, 80.0, 90.0],
            }
        );
    }

    #[test]
    fn crop_with_missing_numbers_is_invalid() {
        match parse_command("/crop 0 10 10") {
            SessionCommand::Invalid { usage, .. } => {
                assert_eq!(usage, "/crop <slot> <x%> <y%> <w%> <h%>")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn edit_collects_references() {
        assert_eq!(
            parse_command("/edit 2 Replace_BG_Custom beach.jpg"),
            SessionCommand::Edit {
                slot: 2,
                operation: "replace_bg_custom".to_string(),
                references: vec!["beach.jpg".to_string()],
            }
        );
    }

    #[test]
    fn bad_slot_number_is_reported() {
        match parse_command("/history first") {
            SessionCommand::Invalid { reason, .. } => {
                assert_eq!(reason, "'first' is not a slot number")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_commands_are_passed_through() {
        assert_eq!(
            parse_command("/dance now"),
            SessionCommand::Unknown {
                raw: "/dance now".to_string()
            }
        );
        assert_eq!(help_lines().len(), 11);
    }
}
