/// A command as advertised to the platform's command menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommandSpec {
    pub command: String,
    pub description: String,
}

impl BotCommandSpec {
    pub fn new(command: &str, description: &str) -> Self {
        Self {
            command: command.to_string(),
            description: description.to_string(),
        }
    }
}

/// A parsed `/command args` addressed to this bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: String,
    pub args: String,
}

/// Parse `/cmd`, `/cmd args` or `/cmd@bot args`.
///
/// Commands explicitly addressed to a different bot return `None`, as does
/// anything that doesn't start with a slash. The command name is lowercased.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<CommandInvocation> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };

    let command = match head.split_once('@') {
        Some((cmd, target)) => {
            let ours = bot_username.is_some_and(|me| me.eq_ignore_ascii_case(target));
            if !ours {
                return None;
            }
            cmd
        }
        None => head,
    };

    if command.is_empty() {
        return None;
    }

    Some(CommandInvocation {
        command: command.to_lowercase(),
        args: args.to_string(),
    })
}

/// Commands the bridge handles itself
pub fn bridge_commands() -> Vec<BotCommandSpec> {
    vec![
        BotCommandSpec::new("link", "Link this chat to a Discord channel ID"),
        BotCommandSpec::new("unlink", "Remove this chat's Discord link"),
        BotCommandSpec::new("nick", "Set the name Discord sees for you in this chat"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_command() {
        let cmd = parse_command("/link 12345", None).unwrap();
        assert_eq!(cmd.command, "link");
        assert_eq!(cmd.args, "12345");
    }

    #[test]
    fn test_command_without_args() {
        let cmd = parse_command("/unlink", Some("bridge_bot")).unwrap();
        assert_eq!(cmd.command, "unlink");
        assert_eq!(cmd.args, "");
    }

    #[test]
    fn test_command_addressed_to_us() {
        let cmd = parse_command("/Nick@Bridge_Bot  Bobby Tables ", Some("bridge_bot")).unwrap();
        assert_eq!(cmd.command, "nick");
        assert_eq!(cmd.args, "Bobby Tables");
    }

    #[test]
    fn test_command_addressed_to_other_bot() {
        assert!(parse_command("/nick@other_bot Bob", Some("bridge_bot")).is_none());
        assert!(parse_command("/nick@other_bot Bob", None).is_none());
    }

    #[test]
    fn test_non_commands() {
        assert!(parse_command("hello /link", None).is_none());
        assert!(parse_command("/", None).is_none());
        assert!(parse_command("", None).is_none());
    }

    #[test]
    fn test_bridge_commands_are_lowercase() {
        for cmd in bridge_commands() {
            assert_eq!(cmd.command, cmd.command.to_lowercase());
        }
    }
}
