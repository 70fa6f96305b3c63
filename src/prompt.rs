//! Interactive prompts

use anyhow::Result;
use dialoguer::{Confirm, Select};
use releasekit::context::ConfirmCallback;

/// Confirmation callback backed by a terminal prompt.
///
/// With `assume_yes` every question is answered yes without asking. A
/// prompt that cannot be shown (no terminal) counts as a no.
pub struct PromptConfirm {
    assume_yes: bool,
}

impl PromptConfirm {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> releasekit::Result<bool> {
        if self.assume_yes {
            log::info!("auto-confirmed: {prompt}");
            return Ok(true);
        }
        match Confirm::new().with_prompt(prompt).default(false).interact() {
            Ok(answer) => Ok(answer),
            Err(e) => {
                log::warn!("could not prompt ({e}); treating as no");
                Ok(false)
            }
        }
    }
}

/// Ask a yes/no question, default no.
pub fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

/// Pick one item from a list.
pub fn select(prompt: &str, items: &[String]) -> Result<usize> {
    Ok(Select::new()
        .with_prompt(prompt)
        .items(items)
        .default(0)
        .interact()?)
}
