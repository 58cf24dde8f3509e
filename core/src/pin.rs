//! PIN verification driven to a terminal result, either typed on the host or entered on a pinpad.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use apdu::{command, Command};

use crate::card::Card;
use crate::link::code;
use crate::response::{ApduResult, StatusWord};
use crate::ui::Ui;

/// How long the pinpad waits for the operator, mirrored by the countdown.
pub const PINPAD_TIMEOUT: Duration = Duration::from_secs(30);

const TICK: Duration = Duration::from_secs(1);

const INS_VERIFY: u8 = 0x20;

/// Which key the PIN unlocks, selected by the key reference in P2 of `VERIFY`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinKind {
    /// PIN1, unlocking the authentication key.
    Authentication,

    /// PIN2, unlocking the signing key.
    Signing,
}

impl PinKind {
    pub fn from_reference(reference: u8) -> Self {
        match reference {
            2 => Self::Signing,
            _ => Self::Authentication,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication => "PIN1",
            Self::Signing => "PIN2",
        }
    }

    /// Number of digits the card accepts for this PIN.
    pub fn digits(&self) -> RangeInclusive<usize> {
        match self {
            Self::Authentication => 4..=12,
            Self::Signing => 5..=12,
        }
    }
}

/// Warning shown with the next prompt, derived from the last status word only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PinAttemptState {
    #[default]
    Normal,
    FinalTryWarning,
    LowCountWarning,
}

/// Everything the operator needs to see to enter a PIN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinPrompt {
    pub title: String,
    pub kind: PinKind,
    pub pinpad: bool,
    pub attempt: PinAttemptState,
}

impl PinPrompt {
    /// Determines whether the input satisfies the digit policy of the PIN.
    pub fn accepts(&self, pin: &str) -> bool {
        self.kind.digits().contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn requirement(&self) -> &'static str {
        match (self.kind, self.pinpad) {
            (PinKind::Authentication, false) => {
                "Selected action requires authentication certificate. For using authentication certificate enter PIN1"
            }
            (PinKind::Authentication, true) => {
                "Selected action requires authentication certificate. For using authentication certificate enter PIN1 at the reader"
            }
            (PinKind::Signing, false) => {
                "Selected action requires sign certificate. For using sign certificate enter PIN2"
            }
            (PinKind::Signing, true) => {
                "Selected action requires sign certificate. For using sign certificate enter PIN2 at the reader"
            }
        }
    }

    pub fn warning(&self) -> Option<&'static str> {
        match self.attempt {
            PinAttemptState::Normal => None,
            PinAttemptState::FinalTryWarning => Some("PIN will be locked next failed attempt"),
            PinAttemptState::LowCountWarning => Some("PIN has been entered incorrectly one time"),
        }
    }
}

/// Meaning of the status word answering a `VERIFY`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinStatus {
    Verified,
    /// `63 Cx` with tries left.
    Retry(u8),
    /// `63 C0` or `69 83`.
    Blocked,
    /// `64 00`, the pinpad timed out.
    Timeout,
    /// `64 01`, cancelled on the pinpad.
    Cancelled,
    /// `64 02`, the two pinpad entries differ.
    Mismatch,
    /// `64 03`, wrong PIN length on the pinpad.
    LengthError,
    /// Any other status word, or none at all.
    Unrecognized,
}

impl PinStatus {
    pub fn from_status_word(sw: Option<StatusWord>) -> Self {
        match sw.map(|sw| sw.0) {
            Some(0x9000) => Self::Verified,
            Some(0x63C0) | Some(0x6983) => Self::Blocked,
            Some(sw @ 0x63C1..=0x63C3) => Self::Retry((sw & 0x0F) as u8),
            Some(0x6400) => Self::Timeout,
            Some(0x6401) => Self::Cancelled,
            Some(0x6402) => Self::Mismatch,
            Some(0x6403) => Self::LengthError,
            _ => Self::Unrecognized,
        }
    }

    /// Attempt state of the next prompt, `None` when the sequence is over.
    pub fn next_attempt(&self) -> Option<PinAttemptState> {
        match self {
            Self::Retry(1) => Some(PinAttemptState::FinalTryWarning),
            Self::Retry(2) => Some(PinAttemptState::LowCountWarning),
            Self::Retry(_) => Some(PinAttemptState::Normal),
            _ => None,
        }
    }
}

/// Drives one verification request to a terminal result.
pub struct PinVerifier<'a, U>
where
    U: Ui + ?Sized,
{
    card: &'a Card,
    ui: &'a U,
    title: String,
    reference: u8,
}

impl<'a, U> PinVerifier<'a, U>
where
    U: Ui + ?Sized,
{
    pub fn new(card: &'a Card, ui: &'a U, title: impl Into<String>, reference: u8) -> Self {
        Self {
            card,
            ui,
            title: title.into(),
            reference,
        }
    }

    /// Prompts and verifies until the card answers with a terminal status word or the operator
    /// cancels. The returned result is successful iff the card answered `90 00`.
    pub async fn verify(&self) -> ApduResult {
        let pinpad = self.card.lock().is_pinpad();
        let mut prompt = PinPrompt {
            title: self.title.clone(),
            kind: PinKind::from_reference(self.reference),
            pinpad,
            attempt: PinAttemptState::Normal,
        };

        loop {
            let result = match pinpad {
                true => self.verify_pinpad(&prompt).await,
                _ => match self.verify_input(&prompt).await {
                    Some(result) => result,
                    None => {
                        info!("PIN entry cancelled");
                        self.ui.pin_finished();

                        return ApduResult::failure(code::CANCELLED);
                    }
                },
            };

            let status = PinStatus::from_status_word(result.sw);
            debug!("{} verification: {:?}", prompt.kind.name(), status);

            match status.next_attempt() {
                Some(attempt) if result.error.is_none() => prompt.attempt = attempt,
                _ => {
                    self.ui.pin_finished();

                    return result;
                }
            }
        }
    }

    async fn verify_input(&self, prompt: &PinPrompt) -> Option<ApduResult> {
        let pin = loop {
            let pin = self.ui.request_pin(prompt).await?;
            if prompt.accepts(&pin) {
                break pin;
            }
        };

        let command = command::verify(self.reference, pin.as_bytes());

        Some(self.card.lock().send(command.into()))
    }

    async fn verify_pinpad(&self, prompt: &PinPrompt) -> ApduResult {
        self.ui.pinpad_started(prompt, PINPAD_TIMEOUT);

        let card = self.card.clone();
        // Lc stays zero; the reader inserts the PIN it collected.
        let apdu = Vec::from(Command::new_with_le(0x00, INS_VERIFY, 0x00, self.reference, 0));
        let mut transfer =
            tokio::task::spawn_blocking(move || card.lock().transfer_pinpad(&apdu, true));

        let started = Instant::now();
        let mut ticks = interval(TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                joined = &mut transfer => {
                    return joined.unwrap_or_else(|_| ApduResult::failure(code::INTERNAL_ERROR));
                }
                _ = ticks.tick() => {
                    self.ui.pinpad_tick(PINPAD_TIMEOUT.saturating_sub(started.elapsed()));
                }
            }
        }
    }
}
