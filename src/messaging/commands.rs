/// Operator commands
///
/// Commands represent requests to perform actions (imperative).
/// They are executed by one automation controller.
use std::path::PathBuf;

/// Operator commands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start automation, optionally switching to a named profile first
    Start { profile: Option<String> },

    /// Stop automation
    Stop,

    /// Pause a running automation
    Pause,

    /// Resume a paused automation
    Resume,

    /// Pause when running, resume when paused
    TogglePause,

    /// Change the confidence threshold
    SetConfidence(f32),

    /// Restore the default confidence threshold
    ResetDefaults,

    /// Replace the active templates with a stored profile
    SetProfile(String),

    /// Append a click template
    AddTemplate(PathBuf),

    /// Remove a click template by position
    RemoveTemplate(usize),

    /// Append a loot template
    AddLoot(PathBuf),

    /// Remove a loot template by position
    RemoveLoot(usize),

    /// Report status, elapsed time and loot counts
    Status,

    /// Quit the application
    Quit,
}

/// Result of command execution
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Command executed successfully
    Success,

    /// Command executed with a specific result
    SuccessWithValue(String),

    /// Command failed with an error
    Error(String),
}

impl Command {
    /// Parse one console line such as `confidence 0.85` or `loot add chest.png`
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let needs_arg = |what: &str| -> Result<&str, String> {
            if rest.is_empty() {
                Err(format!("'{}' needs {}", word, what))
            } else {
                Ok(rest)
            }
        };
        let index = |arg: &str| -> Result<usize, String> {
            arg.parse::<usize>()
                .map_err(|_| format!("Not a template index: {}", arg))
        };

        match word.to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start {
                profile: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "stop" => Ok(Command::Stop),
            "pause" => Ok(Command::Pause),
            "resume" => Ok(Command::Resume),
            "toggle" | "p" => Ok(Command::TogglePause),
            "confidence" | "conf" => {
                let arg = needs_arg("a value between 0.5 and 1.0")?;
                arg.parse::<f32>()
                    .map(Command::SetConfidence)
                    .map_err(|_| format!("Not a number: {}", arg))
            }
            "reset" => Ok(Command::ResetDefaults),
            "profile" => Ok(Command::SetProfile(needs_arg("a profile name")?.to_string())),
            "add" => Ok(Command::AddTemplate(PathBuf::from(needs_arg("an image path")?))),
            "remove" | "rm" => Ok(Command::RemoveTemplate(index(needs_arg("an index")?)?)),
            "loot" => {
                let (sub, arg) = match rest.split_once(char::is_whitespace) {
                    Some((sub, arg)) => (sub, arg.trim()),
                    None => (rest, ""),
                };
                match (sub, arg.is_empty()) {
                    ("add", false) => Ok(Command::AddLoot(PathBuf::from(arg))),
                    ("remove" | "rm", false) => Ok(Command::RemoveLoot(index(arg)?)),
                    _ => Err("Usage: loot add <path> | loot remove <index>".to_string()),
                }
            }
            "status" | "s" => Ok(Command::Status),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            "" => Err("Empty command".to_string()),
            other => Err(format!("Unknown command: {}", other)),
        }
    }

    /// Get a human-readable description of the command
    pub fn description(&self) -> String {
        match self {
            Command::Start { profile: Some(name) } => format!("Start automation: {}", name),
            Command::Start { profile: None } => "Start automation".to_string(),
            Command::Stop => "Stop automation".to_string(),
            Command::Pause => "Pause automation".to_string(),
            Command::Resume => "Resume automation".to_string(),
            Command::TogglePause => "Toggle pause".to_string(),
            Command::SetConfidence(value) => format!("Set confidence: {:.2}", value),
            Command::ResetDefaults => "Reset to defaults".to_string(),
            Command::SetProfile(name) => format!("Select profile: {}", name),
            Command::AddTemplate(path) => format!("Add template: {}", path.display()),
            Command::RemoveTemplate(index) => format!("Remove template #{}", index),
            Command::AddLoot(path) => format!("Add loot template: {}", path.display()),
            Command::RemoveLoot(index) => format!("Remove loot template #{}", index),
            Command::Status => "Show status".to_string(),
            Command::Quit => "Quit application".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_description() {
        assert_eq!(Command::Stop.description(), "Stop automation");
        assert_eq!(
            Command::SetConfidence(0.8).description(),
            "Set confidence: 0.80"
        );
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("start daily"),
            Ok(Command::Start {
                profile: Some("daily".into())
            })
        );
        assert_eq!(Command::parse("  start "), Ok(Command::Start { profile: None }));
        assert_eq!(Command::parse("CONFIDENCE 0.9"), Ok(Command::SetConfidence(0.9)));
        assert_eq!(Command::parse("remove 2"), Ok(Command::RemoveTemplate(2)));
        assert_eq!(
            Command::parse("loot add chest.png"),
            Ok(Command::AddLoot(PathBuf::from("chest.png")))
        );
        assert_eq!(Command::parse("loot rm 0"), Ok(Command::RemoveLoot(0)));
        assert_eq!(Command::parse("q"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("confidence").is_err());
        assert!(Command::parse("confidence high").is_err());
        assert!(Command::parse("remove first").is_err());
        assert!(Command::parse("loot").is_err());
        assert!(Command::parse("dance").is_err());
    }
}
