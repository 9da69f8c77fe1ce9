//! Operator confirmation prompts.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};

use crate::error::{AppResult, SweepError};

/// Blocks the run until the person at the bench is ready.
#[async_trait]
pub trait Operator: Send {
    /// Show `message` and wait for confirmation.
    async fn confirm(&mut self, message: &str) -> AppResult<()>;
}

/// Prompt on the terminal and wait for Enter.
pub struct ConsolePrompt {
    input: BufReader<Stdin>,
}

impl ConsolePrompt {
    /// Prompt on the process's stdin/stdout.
    pub fn new() -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ConsolePrompt {
    async fn confirm(&mut self, message: &str) -> AppResult<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(message.as_bytes()).await?;
        stdout.flush().await?;

        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Err(SweepError::PromptClosed);
        }
        Ok(())
    }
}

/// Confirms immediately and remembers what it was asked.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    /// Every prompt shown so far.
    pub prompts: Vec<String>,
}

#[async_trait]
impl Operator for AutoConfirm {
    async fn confirm(&mut self, message: &str) -> AppResult<()> {
        tracing::info!("{}", message.trim_end());
        self.prompts.push(message.to_string());
        Ok(())
    }
}
