/// A worker's verdict on the pool size, sent upward to the supervisor.
///
/// In fork mode the worker is a child process and the channel is its
/// stdout, one word per line; the supervisor parses the lines back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleCommand {
    Increase,
    Decrease,
}

impl ScaleCommand {
    pub fn as_line(&self) -> &'static str {
        match self {
            ScaleCommand::Increase => "increase",
            ScaleCommand::Decrease => "decrease",
        }
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        match line.trim() {
            "increase" => Some(ScaleCommand::Increase),
            "decrease" => Some(ScaleCommand::Decrease),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_round_trip() {
        for command in [ScaleCommand::Increase, ScaleCommand::Decrease] {
            assert_eq!(ScaleCommand::parse_line(command.as_line()), Some(command));
        }
        assert_eq!(ScaleCommand::parse_line("warble"), None);
    }
}
