/// Shell commands suggested by the model, and the local side of running them.
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;
use tokio::time::{Duration, timeout};

use crate::session::{Message, Role};

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:\w+)?\s*\n(.*?)\n```").expect("code block pattern is valid")
});

/// Body of the first fenced code block in `reply`, trimmed. `None` when there
/// is no block or the first one is blank.
pub fn suggested_command(reply: &str) -> Option<String> {
    let block = CODE_BLOCK.captures(reply)?.get(1)?.as_str().trim();
    (!block.is_empty()).then(|| block.to_string())
}

/// Suggestion carried by the latest assistant reply in a transcript.
pub fn latest_suggestion(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| suggested_command(&m.content))
}

/// Prompt for single-shot mode: the question, an instruction to answer with
/// one command, and a listing of `dir` for context.
pub async fn single_shot_prompt(question: &str, dir: &Path) -> String {
    let context = match Command::new("ls").arg("-la").arg(dir).output().await {
        Ok(out) if out.status.success() => format!(
            "Current directory: {}\n\nDirectory listing:\n{}",
            dir.display(),
            String::from_utf8_lossy(&out.stdout)
        ),
        Ok(out) => format!(
            "Error getting directory listing: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => format!("Error getting directory listing: {e}"),
    };
    format!(
        "{question}\n\nRequirements: Responds to my request as well as possible with just one \
         and the same bash command with all the actions. Context: {context}"
    )
}

/// Run `command` through `sh -c` in the current directory and return stdout.
/// Stderr is appended when the command fails.
pub async fn run_local(command: &str, limit: Duration) -> Result<String> {
    let fut = Command::new("sh").arg("-c").arg(command).kill_on_drop(true).output();
    let output = timeout(limit, fut)
        .await
        .with_context(|| format!("'{command}' did not finish within {}s", limit.as_secs()))?
        .with_context(|| format!("failed to run '{command}'"))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        text.push_str(&format!("[exit code: {code}]\n"));
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(text)
}
