//! The operator's side of the workflow, asked and told on the terminal.

use std::time::Duration;

use async_trait::async_trait;
use dialoguer::{Confirm, Password};
use eid_updater::pin::PinPrompt;
use eid_updater::ui::Ui;
use tracing::{debug, warn};

const ACKNOWLEDGEMENT: &str = "I have read and understood the text above";

/// Prompts on the controlling terminal. Blocking prompts run off the runtime thread.
#[derive(Debug, Default)]
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(prompt: F) -> Option<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(prompt).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Terminal prompt failed: {}", e);
            None
        }
        Err(e) => {
            warn!("Terminal prompt was interrupted: {}", e);
            None
        }
    }
}

/// Shows the text and asks for the acknowledgement before offering yes.
fn decide(text: &str, question: &str) -> std::io::Result<bool> {
    println!("\n{}\n", text);

    let acknowledged = Confirm::new()
        .with_prompt(ACKNOWLEDGEMENT)
        .default(false)
        .interact()?;

    if !acknowledged {
        return Ok(false);
    }

    Confirm::new().with_prompt(question).default(false).interact()
}

#[async_trait]
impl Ui for Terminal {
    async fn request_pin(&self, prompt: &PinPrompt) -> Option<String> {
        let prompt = prompt.clone();

        blocking(move || {
            println!("\n{}", prompt.title);
            println!("{}", prompt.requirement());
            if let Some(warning) = prompt.warning() {
                println!("{}", warning);
            }

            loop {
                let pin = Password::new()
                    .with_prompt(format!("{} (empty to cancel)", prompt.kind.name()))
                    .allow_empty_password(true)
                    .interact()?;

                if pin.is_empty() {
                    return Ok(None);
                }

                if prompt.accepts(&pin) {
                    return Ok(Some(pin));
                }

                let digits = prompt.kind.digits();
                println!(
                    "{} must be {} to {} digits",
                    prompt.kind.name(),
                    digits.start(),
                    digits.end()
                );
            }
        })
        .await
        .flatten()
    }

    fn pinpad_started(&self, prompt: &PinPrompt, timeout: Duration) {
        println!("\n{}", prompt.title);
        println!("{}", prompt.requirement());
        if let Some(warning) = prompt.warning() {
            println!("{}", warning);
        }

        println!("Waiting {} seconds for the reader", timeout.as_secs());
    }

    fn pinpad_tick(&self, remaining: Duration) {
        debug!("Pinpad countdown: {}s", remaining.as_secs());
        print!("\r{:>3}s ", remaining.as_secs());

        let _ = std::io::Write::flush(&mut std::io::stdout());
    }

    fn pin_finished(&self) {
        println!();
    }

    async fn confirm(&self, text: &str) -> bool {
        let text = text.to_string();

        blocking(move || decide(&text, "Accept?"))
            .await
            .unwrap_or(false)
    }

    async fn confirm_envelope(&self, label: &str, envelope: &str) -> bool {
        let text = format!("{}\n\n{}", label, envelope);

        blocking(move || decide(&text, "Continue?"))
            .await
            .unwrap_or(false)
    }

    fn set_status(&self, text: &str) {
        println!("{}", text);
    }

    fn stop_progress(&self, text: Option<&str>) {
        if let Some(text) = text {
            println!("{}", text);
        }
    }

    fn notify_failure(&self, text: &str) {
        eprintln!("{}", text);
    }
}
