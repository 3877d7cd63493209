use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, trace};

use crate::errors::Result;
use crate::feedback::Feedback;

use super::{DebuggerUI, Status};

/// One line of input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub status: Status,
}

/// Reads one JSON [`Input`] per line of stdin and answers with one `{"feedback": ...}` line
pub struct JsonUI {
    first: bool,
}

impl JsonUI {
    pub fn build() -> Result<Self> {
        Ok(JsonUI { first: true })
    }

    pub fn format_feedback(feedback: &Feedback) -> Value {
        json!({ "feedback": feedback })
    }

    fn parse(line: &str) -> Result<Status> {
        let input: Input = serde_json::from_str(line)?;
        Ok(input.status)
    }
}

impl DebuggerUI for JsonUI {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        // the first call only asks for the first command
        if !self.first {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", Self::format_feedback(&feedback))?;
            stdout.flush()?;
        }
        self.first = false;

        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                trace!("stdin closed");
                return Ok(Status::DebuggerQuit);
            }
            if line.trim().is_empty() {
                continue;
            }
            match Self::parse(line.trim()) {
                Ok(status) => return Ok(status),
                Err(e) => {
                    error!("could not parse input: {e}");
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{}", Self::format_feedback(&e.into()))?;
                    stdout.flush()?;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            JsonUI::parse(r#"{"status":"ListEvents"}"#).unwrap(),
            Status::ListEvents
        );
        let status = JsonUI::parse(
            r#"{"status":{"RegisterEvent":{"event_type":"CpuidInstructionExecution","actions":[{"kind":"LogState"}]}}}"#,
        )
        .unwrap();
        match status {
            Status::RegisterEvent(request) => {
                assert_eq!(request.event_type, EventType::CpuidInstructionExecution);
                assert!(request.enabled);
                assert_eq!(request.actions.len(), 1);
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(JsonUI::parse(r#"{"status":"Nonsense"}"#).is_err());
    }

    #[test]
    fn test_format_feedback() {
        let value = JsonUI::format_feedback(&Feedback::HypercallStatus(0));
        assert_eq!(value["feedback"]["HypercallStatus"], 0);
        let value = JsonUI::format_feedback(&Feedback::Ok);
        assert_eq!(value.to_string(), r#"{"feedback":"Ok"}"#);
    }
}
