/// Line commands the host sends to a running agent, and their parsing

use offsync::notify::Notification;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "activate",
    aliases: &["skip-waiting"],
    description: "Cut over to the waiting cache generation now",
  },
  Command {
    name: "enqueue",
    aliases: &["e", "write"],
    description: "Queue a JSON payload for delivery",
  },
  Command {
    name: "sync",
    aliases: &["s", "drain"],
    description: "Request a background sync pass",
  },
  Command {
    name: "refresh",
    aliases: &["r"],
    description: "Refresh every entry of the active generation",
  },
  Command {
    name: "push",
    aliases: &["p"],
    description: "Render a push payload as a notification",
  },
  Command {
    name: "click",
    aliases: &["open"],
    description: "Open a shown notification (JSON as emitted)",
  },
  Command {
    name: "dismiss",
    aliases: &["close"],
    description: "Dismiss a shown notification (JSON as emitted)",
  },
  Command {
    name: "online",
    aliases: &[],
    description: "Platform reports the network is back",
  },
  Command {
    name: "offline",
    aliases: &[],
    description: "Platform reports the network is gone",
  },
  Command {
    name: "status",
    aliases: &["st"],
    description: "Print agent status",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Stop the agent",
  },
];

/// A parsed host command
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
  Activate,
  Enqueue(Value),
  Sync,
  Refresh,
  Push(Vec<u8>),
  Click(Notification),
  Dismiss(Notification),
  Online(bool),
  Status,
  Quit,
}

/// Find a command by exact name or alias (case-insensitive)
pub fn resolve(input: &str) -> Option<&'static Command> {
  let input_lower = input.to_lowercase();

  COMMANDS
    .iter()
    .find(|cmd| cmd.name == input_lower || cmd.aliases.contains(&input_lower.as_str()))
}

/// Parse one line: a command name, optionally followed by a JSON argument
pub fn parse_line(line: &str) -> Result<HostCommand, String> {
  let line = line.trim();
  let (word, rest) = match line.split_once(char::is_whitespace) {
    Some((word, rest)) => (word, rest.trim()),
    None => (line, ""),
  };

  let cmd = resolve(word).ok_or_else(|| format!("unknown command: {}", word))?;

  let json_arg = || -> Result<Value, String> {
    if rest.is_empty() {
      return Err(format!("{} needs a JSON argument", cmd.name));
    }
    serde_json::from_str(rest).map_err(|e| format!("invalid JSON for {}: {}", cmd.name, e))
  };
  let notification_arg = || -> Result<Notification, String> {
    serde_json::from_value(json_arg()?)
      .map_err(|e| format!("invalid notification for {}: {}", cmd.name, e))
  };

  match cmd.name {
    "activate" => Ok(HostCommand::Activate),
    "enqueue" => Ok(HostCommand::Enqueue(json_arg()?)),
    "sync" => Ok(HostCommand::Sync),
    "refresh" => Ok(HostCommand::Refresh),
    // Raw bytes: malformed payloads are handled downstream with defaults
    "push" => Ok(HostCommand::Push(rest.as_bytes().to_vec())),
    "click" => Ok(HostCommand::Click(notification_arg()?)),
    "dismiss" => Ok(HostCommand::Dismiss(notification_arg()?)),
    "online" => Ok(HostCommand::Online(true)),
    "offline" => Ok(HostCommand::Online(false)),
    "status" => Ok(HostCommand::Status),
    "quit" => Ok(HostCommand::Quit),
    other => Err(format!("unhandled command: {}", other)),
  }
}
