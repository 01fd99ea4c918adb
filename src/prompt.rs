use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::error::OpenNeuroError;

/// Source of the API key entered during `login`.
pub trait CredentialProvider {
    fn api_key(&self, prompt: &str) -> Result<String, OpenNeuroError>;
}

/// Reads the key from the terminal without echoing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl CredentialProvider for TerminalPrompt {
    fn api_key(&self, prompt: &str) -> Result<String, OpenNeuroError> {
        let mut stderr = io::stderr();
        write!(stderr, "{prompt}").map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;
        stderr
            .flush()
            .map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;

        enable_raw_mode().map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;
        let result = read_hidden_line();
        disable_raw_mode().map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;
        let input = result?;
        end_prompt_line(&mut stderr)?;

        non_empty(input)
    }
}

/// Moves past the prompt line left open by hidden input.
fn end_prompt_line(out: &mut impl Write) -> Result<(), OpenNeuroError> {
    writeln!(out)
        .and_then(|()| out.flush())
        .map_err(|err| OpenNeuroError::Terminal(err.to_string()))
}

fn read_hidden_line() -> Result<String, OpenNeuroError> {
    let mut input = String::new();
    loop {
        let event = event::read().map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;
        let Event::Key(key) = event else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('c') | KeyCode::Char('d')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return Err(OpenNeuroError::PromptAborted);
            }
            KeyCode::Esc => return Err(OpenNeuroError::PromptAborted),
            KeyCode::Enter => return Ok(input),
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(ch) => input.push(ch),
            _ => {}
        }
    }
}

/// Reads one line from stdin; used when the key is piped in.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinCredential;

impl CredentialProvider for StdinCredential {
    fn api_key(&self, _prompt: &str) -> Result<String, OpenNeuroError> {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|err| OpenNeuroError::Terminal(err.to_string()))?;
        non_empty(line)
    }
}

#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl CredentialProvider for StaticCredential {
    fn api_key(&self, _prompt: &str) -> Result<String, OpenNeuroError> {
        non_empty(self.0.clone())
    }
}

fn non_empty(value: String) -> Result<String, OpenNeuroError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OpenNeuroError::EmptyApiKey);
    }
    Ok(trimmed.to_string())
}
