// file: src/platform/confirm.rs
// version: 1.0.0
// guid: 5e0f2d1c-8b4a-4a63-bb1e-2c7d9a4e6f10

//! Operator confirmation before destructive work

use crate::Result;
use async_trait::async_trait;
use colored::Colorize;
use std::io::{BufRead, IsTerminal, Write};

/// Asks the operator to approve a destructive step
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin.
///
/// Without a terminal on stdin the answer is always "no".
#[derive(Debug, Default, Clone)]
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        if !std::io::stdin().is_terminal() {
            tracing::warn!("stdin is not a terminal; refusing without --yes");
            return Ok(false);
        }

        let prompt = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            write!(stderr, "{} {} ", prompt.yellow().bold(), "[y/N]".dimmed())?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        Ok(parse_answer(&answer))
    }
}

/// Fixed answer, for `--yes` and tests
#[derive(Debug, Clone, Copy)]
pub struct AlwaysConfirm(pub bool);

#[async_trait]
impl Confirmer for AlwaysConfirm {
    async fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::debug!("auto-answering {:?} with {}", prompt, self.0);
        Ok(self.0)
    }
}

pub(crate) fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
