//! The presentation port: everything the workflow needs from whoever shows it to the operator.

use std::time::Duration;

use async_trait::async_trait;

use crate::pin::PinPrompt;

/// Operator facing collaborator of the workflow.
///
/// Methods returning futures are suspension points; the workflow does not continue until they
/// resolve. The others only update what is shown and must return promptly.
#[async_trait]
pub trait Ui: Send + Sync {
    /// Asks for the PIN described by the prompt.
    /// Implementations only return input accepted by [`PinPrompt::accepts`]; `None` cancels.
    async fn request_pin(&self, prompt: &PinPrompt) -> Option<String>;

    /// The reader started waiting for the PIN on its keypad, for at most `timeout`.
    fn pinpad_started(&self, prompt: &PinPrompt, timeout: Duration);

    /// Remaining time of the pinpad countdown.
    fn pinpad_tick(&self, remaining: Duration);

    /// The PIN sequence reached a terminal result; hide the PIN view.
    fn pin_finished(&self);

    /// Shows a yes/no decision. Yes is only selectable after the operator ticked the
    /// acknowledgement.
    async fn confirm(&self, text: &str) -> bool;

    /// Shows the decrypted envelope rendered as an image with a continue/cancel decision,
    /// gated on the same acknowledgement as [`Ui::confirm`].
    async fn confirm_envelope(&self, label: &str, envelope: &str) -> bool;

    /// Replaces the status line.
    fn set_status(&self, text: &str);

    /// The server finished; stop the progress indication.
    fn stop_progress(&self, text: Option<&str>);

    /// Shows a terminal failure.
    fn notify_failure(&self, text: &str);
}
