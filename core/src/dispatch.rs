//! Executes the commands of the update server against the card and the operator.

use tokio::sync::mpsc::UnboundedSender;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::card::Card;
use crate::link::{code, Disposition, Protocol, ShareMode};
use crate::pin::PinVerifier;
use crate::protocol::{Command, Response};
use crate::response::{decode_hex, ApduResult};
use crate::ui::Ui;

/// A message for the control loop, drained in the order it was queued.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Post the response and process the server's answer.
    Send(Response),

    /// Post the response, then end the run because the operator declined.
    SendAndClose(Response),
}

/// Whether the control loop keeps waiting for events after a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finish,
}

/// Performs one server command at a time, queueing exactly one answer per command except
/// `STOP`.
pub struct Dispatcher<'a, U>
where
    U: Ui + ?Sized,
{
    card: Card,
    ui: &'a U,
    events: UnboundedSender<Event>,
}

impl<'a, U> Dispatcher<'a, U>
where
    U: Ui + ?Sized,
{
    pub fn new(card: Card, ui: &'a U, events: UnboundedSender<Event>) -> Self {
        Self { card, ui, events }
    }

    pub async fn dispatch(&self, command: Command) -> Flow {
        debug!("Dispatching {:?}", command);

        match command {
            Command::Connect { protocol } => self.send(self.connect(protocol.as_deref())),
            Command::Disconnect { action } => self.send(self.disconnect(action.as_deref())),
            Command::Apdu { bytes } => self.transmit(&bytes),
            Command::Message { text } => {
                self.ui.set_status(&text);
                self.send(Response::result("MESSAGE", true));
            }
            Command::Dialog { text } => {
                let agreed = self.ui.confirm(&text).await;
                let response = Response::result("DIALOG", true).with("button", button(agreed));

                self.queue(match agreed {
                    true => Event::Send(response),
                    _ => Event::SendAndClose(response),
                });
            }
            Command::Verify { text, p2 } => {
                let result = PinVerifier::new(&self.card, self.ui, text, p2).verify().await;

                self.send(
                    Response::result("VERIFY", result.is_ok()).with("bytes", result.to_hex()),
                );
            }
            Command::Decrypt { bytes, text } => {
                let response = self.decrypt(&bytes, &text).await;
                self.send(response);
            }
            Command::Stop { text } => {
                self.ui.stop_progress(text.as_deref());

                return Flow::Finish;
            }
            Command::Unknown => self.send(Response::unknown()),
        }

        Flow::Continue
    }

    fn connect(&self, protocol: Option<&str>) -> Response {
        let protocol = Protocol::from_name(protocol);
        let mut link = self.card.lock();

        if link.is_connected() {
            link.end_transaction();
            link.disconnect(Disposition::Leave);
        }

        let mut error = link.connect(ShareMode::Exclusive, protocol);
        if error != 0 {
            debug!("Exclusive connect failed with {:x}, sharing the reader", error);
            error = link.connect(ShareMode::Shared, protocol);
        }

        if error == 0 && !link.begin_transaction() {
            warn!("Failed to begin a transaction on {}", link.reader_name());
        }

        let mut response = Response::result("CONNECT", link.is_connected())
            .with("reader", link.reader_name())
            .with("atr", hex::encode_upper(link.atr()))
            .with(
                "protocol",
                match link.protocol() {
                    Some(Protocol::T1) => "T=1",
                    _ => "T=0",
                },
            )
            .with("pinpad", link.is_pinpad());

        if error != 0 {
            response = response.with("ERROR", format!("{:x}", error));
        }

        response
    }

    fn disconnect(&self, action: Option<&str>) -> Response {
        let mut link = self.card.lock();
        link.end_transaction();
        link.disconnect(Disposition::from_action(action));

        Response::result("DISCONNECT", true)
    }

    /// Runs the APDU on a blocking worker that queues the answer itself.
    fn transmit(&self, bytes: &str) {
        let apdu = match decode_hex(bytes) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!("Malformed APDU {:?}: {}", bytes, e);

                return self.send(transmitted(
                    "APDU",
                    &ApduResult::failure(code::INVALID_PARAMETER),
                ));
            }
        };

        let card = self.card.clone();
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            let result = card.lock().transfer(&apdu);
            let _ = events.send(Event::Send(transmitted("APDU", &result)));
        });
    }

    async fn decrypt(&self, bytes: &str, label: &str) -> Response {
        let result = match decode_hex(bytes) {
            Ok(apdu) => self.card.lock().transfer(&apdu),
            Err(_) => ApduResult::failure(code::INVALID_PARAMETER),
        };

        if !result.is_ok() {
            return transmitted("DECRYPT", &result);
        }

        let envelope = String::from_utf8_lossy(trim_envelope(&result.data)).to_string();
        let agreed = self.ui.confirm_envelope(label, &envelope).await;
        info!("Envelope {}", if agreed { "accepted" } else { "declined" });

        Response::result("DECRYPT", true).with("button", button(agreed))
    }

    fn send(&self, response: Response) {
        self.queue(Event::Send(response))
    }

    fn queue(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Control loop is gone, dropping the answer");
        }
    }
}

fn button(agreed: bool) -> &'static str {
    match agreed {
        true => "green",
        _ => "red",
    }
}

/// Answer of a command that transmitted an APDU: successful unless the transport failed.
fn transmitted(name: &str, result: &ApduResult) -> Response {
    let ok = match name {
        "DECRYPT" => result.is_ok(),
        _ => result.error.is_none(),
    };

    let response = Response::result(name, ok).with("bytes", result.to_hex());
    match result.error_hex() {
        Some(error) => response.with("ERROR", error),
        None => response,
    }
}

/// Cuts the decrypted envelope two bytes before its last `#`. Kept whole when there is no
/// marker or the cut would start before the data.
pub fn trim_envelope(data: &[u8]) -> &[u8] {
    match data.iter().rposition(|&b| b == b'#') {
        Some(pos) if pos >= 2 => &data[..pos - 2],
        _ => data,
    }
}
