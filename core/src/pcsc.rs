//! PC/SC backend of [`CardLink`].
//! Can be enabled by turning `pcsc` feature on.
//!
//! ## Supported platform
//! Linux, Windows and macOS are supported by pcsc-rust, backend of this implementation.
//! Linux needs the pcsc-lite shared library installed.
//! Refer the documentation of pcsc-rust for details:
//! <https://github.com/bluetech/pcsc-rust>
//!
//! ## Usage
//! ```rust,no_run
//! use eid_updater::Card;
//! use eid_updater::pcsc::PcscLink;
//!
//! let link = PcscLink::open(None).unwrap();
//! let card = Card::new(Box::new(link));
//! let certificate = card.read_certificate();
//! ```

use std::ffi::CString;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use pcsc::{Context, Protocols, Scope, Transaction, MAX_BUFFER_SIZE};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::link::{code, CardLink, Disposition, Protocol, SessionState, ShareMode};
use crate::pin::{PinKind, PINPAD_TIMEOUT};
use crate::response::ApduResult;

/// `CM_IOCTL_GET_FEATURE_REQUEST` of PC/SC part 10.
const GET_FEATURE_REQUEST: u32 = 3400;
const FEATURE_VERIFY_PIN_DIRECT: u8 = 0x06;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error occurred while communicating with PC/SC: {0}")]
    PcscError(#[from] pcsc::Error),

    #[error("Reader not found on PC/SC service")]
    ReaderNotFound,

    #[error("Failed to start the reader worker: {0}")]
    Worker(#[from] std::io::Error),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// What the worker learnt about a freshly connected card.
struct Connection {
    atr: Vec<u8>,
    protocol: Protocol,
    verify_pin_direct: Option<u32>,
}

enum Request {
    Connect {
        share: ShareMode,
        protocol: Protocol,
        reply: Sender<std::result::Result<Connection, u32>>,
    },
    Disconnect {
        disposition: Disposition,
        reply: Sender<()>,
    },
    Begin {
        reply: Sender<bool>,
    },
    End {
        reply: Sender<()>,
    },
    Transmit {
        apdu: Vec<u8>,
        reply: Sender<ApduResult>,
    },
    Control {
        code: u32,
        data: Vec<u8>,
        reply: Sender<ApduResult>,
    },
}

/// A link to the card in one PC/SC reader.
///
/// The PC/SC handle lives on a worker thread of its own, so a transaction can stay open across
/// calls from different threads.
pub struct PcscLink {
    reader: String,
    requests: Sender<Request>,
    state: SessionState,
    atr: Vec<u8>,
    protocol: Option<Protocol>,
    verify_pin_direct: Option<u32>,
}

impl PcscLink {
    /// Names of the readers attached to the PC/SC service.
    pub fn readers() -> Result<Vec<String>> {
        let ctx = Context::establish(Scope::User)?;

        Ok(ctx
            .list_readers_owned()?
            .into_iter()
            .map(|reader| reader.to_string_lossy().into_owned())
            .collect())
    }

    /// Opens the reader with the name, or the first one attached.
    pub fn open(name: Option<&str>) -> Result<Self> {
        let ctx = Context::establish(Scope::User)?;
        let reader = ctx
            .list_readers_owned()?
            .into_iter()
            .find(|reader| name.map_or(true, |name| reader.to_str() == Ok(name)))
            .ok_or(Error::ReaderNotFound)?;

        let reader_name = reader.to_string_lossy().into_owned();
        debug!("Using device: {}", reader_name);

        let (requests, rx) = channel();
        thread::Builder::new()
            .name("pcsc".to_string())
            .spawn(move || serve(ctx, reader, rx))?;

        Ok(Self {
            reader: reader_name,
            requests,
            state: SessionState::Disconnected,
            atr: vec![],
            protocol: None,
            verify_pin_direct: None,
        })
    }

    fn request<T>(&self, request: impl FnOnce(Sender<T>) -> Request) -> Option<T> {
        let (reply, rx) = channel();
        self.requests.send(request(reply)).ok()?;

        rx.recv().ok()
    }

    fn forget_card(&mut self) {
        self.state = SessionState::Disconnected;
        self.atr.clear();
        self.protocol = None;
        self.verify_pin_direct = None;
    }
}

impl CardLink for PcscLink {
    fn reader_name(&self) -> &str {
        &self.reader
    }

    fn connect(&mut self, share: ShareMode, protocol: Protocol) -> u32 {
        let result = self.request(|reply| Request::Connect {
            share,
            protocol,
            reply,
        });

        self.forget_card();
        match result {
            Some(Ok(connection)) => {
                info!("Connected to the card in {}", self.reader);

                self.state = SessionState::Connected;
                self.atr = connection.atr;
                self.protocol = Some(connection.protocol);
                self.verify_pin_direct = connection.verify_pin_direct;

                code::SUCCESS
            }
            Some(Err(code)) => code,
            None => code::NO_SERVICE,
        }
    }

    fn disconnect(&mut self, disposition: Disposition) {
        self.request(|reply| Request::Disconnect { disposition, reply });
        self.forget_card();
    }

    fn begin_transaction(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }

        let begun = self.request(|reply| Request::Begin { reply }) == Some(true);
        if begun {
            self.state = SessionState::InTransaction;
        }

        begun
    }

    fn end_transaction(&mut self) {
        if self.state == SessionState::InTransaction {
            self.request(|reply| Request::End { reply });
            self.state = SessionState::Connected;
        }
    }

    fn transfer(&mut self, apdu: &[u8]) -> ApduResult {
        if !self.is_connected() {
            return ApduResult::failure(code::INVALID_HANDLE);
        }

        debug!("TX: {}", hex::encode(apdu));

        let apdu = apdu.to_vec();
        let result = self
            .request(|reply| Request::Transmit { apdu, reply })
            .unwrap_or_else(|| ApduResult::failure(code::NO_SERVICE));

        debug!("RX: {} {:?}", result.to_hex(), result.error_hex());

        result
    }

    fn transfer_pinpad(&mut self, apdu: &[u8], display: bool) -> ApduResult {
        let Some(code) = self.verify_pin_direct else {
            return ApduResult::failure(code::UNSUPPORTED_FEATURE);
        };

        if !self.is_connected() {
            return ApduResult::failure(code::INVALID_HANDLE);
        }

        let kind = PinKind::from_reference(apdu.get(3).copied().unwrap_or_default());
        let data = pin_verify_structure(apdu, kind, display);

        debug!("TX (pinpad): {}", hex::encode(apdu));

        let result = self
            .request(|reply| Request::Control { code, data, reply })
            .unwrap_or_else(|| ApduResult::failure(code::NO_SERVICE));

        debug!("RX (pinpad): {} {:?}", result.to_hex(), result.error_hex());

        result
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn is_pinpad(&self) -> bool {
        self.verify_pin_direct.is_some()
    }

    fn atr(&self) -> Vec<u8> {
        self.atr.clone()
    }

    fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }
}

/// Worker owning the PC/SC handles until the link is dropped.
fn serve(ctx: Context, reader: CString, requests: Receiver<Request>) {
    let mut card: Option<pcsc::Card> = None;
    let mut pending: Option<Request> = None;

    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        match request {
            Request::Connect {
                share,
                protocol,
                reply,
            } => {
                card = None;

                let result = ctx
                    .connect(&reader, share_mode(share), protocols(protocol))
                    .map_err(|e| e as u32)
                    .and_then(|connected| {
                        let connection = inspect(&connected)?;
                        card = Some(connected);

                        Ok(connection)
                    });

                let _ = reply.send(result);
            }
            Request::Disconnect { disposition, reply } => {
                if let Some(connected) = card.take() {
                    if let Err((_, e)) = connected.disconnect(pcsc_disposition(disposition)) {
                        warn!("Failed to disconnect: {}", e);
                    }
                }

                let _ = reply.send(());
            }
            Request::Begin { reply } => {
                let Some(connected) = card.as_mut() else {
                    let _ = reply.send(false);
                    continue;
                };

                match connected.transaction() {
                    Ok(transaction) => {
                        let _ = reply.send(true);
                        pending = serve_transaction(transaction, &requests);
                    }
                    Err(e) => {
                        warn!("Failed to begin a transaction: {}", e);
                        let _ = reply.send(false);
                    }
                }
            }
            Request::End { reply } => {
                let _ = reply.send(());
            }
            Request::Transmit { apdu, reply } => {
                let _ = reply.send(match &card {
                    Some(connected) => transmit(connected, &apdu),
                    None => ApduResult::failure(code::INVALID_HANDLE),
                });
            }
            Request::Control { code, data, reply } => {
                let _ = reply.send(match &card {
                    Some(connected) => control(connected, code, &data),
                    None => ApduResult::failure(code::INVALID_HANDLE),
                });
            }
        }
    }
}

/// Serves requests while a transaction is open. Returns a request that needs the transaction
/// ended first, to be handled by the outer loop.
fn serve_transaction(transaction: Transaction<'_>, requests: &Receiver<Request>) -> Option<Request> {
    loop {
        let Ok(request) = requests.recv() else {
            return None;
        };

        match request {
            Request::End { reply } => {
                if let Err((_, e)) = transaction.end(pcsc::Disposition::LeaveCard) {
                    warn!("Failed to end the transaction: {}", e);
                }

                let _ = reply.send(());
                return None;
            }
            Request::Begin { reply } => {
                let _ = reply.send(false);
            }
            Request::Transmit { apdu, reply } => {
                let _ = reply.send(transmit(&transaction, &apdu));
            }
            Request::Control { code, data, reply } => {
                let _ = reply.send(control(&transaction, code, &data));
            }
            request @ (Request::Connect { .. } | Request::Disconnect { .. }) => {
                drop(transaction);
                return Some(request);
            }
        }
    }
}

fn inspect(card: &pcsc::Card) -> std::result::Result<Connection, u32> {
    let status = card.status2_owned().map_err(|e| e as u32)?;
    let protocol = match status.protocol2() {
        Some(pcsc::Protocol::T0) => Protocol::T0,
        Some(pcsc::Protocol::T1) => Protocol::T1,
        _ => Protocol::Any,
    };

    let mut buf = [0u8; MAX_BUFFER_SIZE];
    let verify_pin_direct = card
        .control(pcsc::ctl_code(GET_FEATURE_REQUEST.into()), &[], &mut buf)
        .ok()
        .and_then(|features| find_feature(features, FEATURE_VERIFY_PIN_DIRECT));

    Ok(Connection {
        atr: status.atr().to_vec(),
        protocol,
        verify_pin_direct,
    })
}

fn transmit(card: &pcsc::Card, apdu: &[u8]) -> ApduResult {
    let mut rx = [0u8; MAX_BUFFER_SIZE];

    match card.transmit(apdu, &mut rx) {
        Ok(rx) => ApduResult::from_bytes(rx.to_vec()),
        Err(e) => ApduResult::failure(e as u32),
    }
}

fn control(card: &pcsc::Card, code: u32, data: &[u8]) -> ApduResult {
    let mut rx = [0u8; MAX_BUFFER_SIZE];

    match card.control(code.into(), data, &mut rx) {
        Ok(rx) => ApduResult::from_bytes(rx.to_vec()),
        Err(e) => ApduResult::failure(e as u32),
    }
}

fn share_mode(share: ShareMode) -> pcsc::ShareMode {
    match share {
        ShareMode::Exclusive => pcsc::ShareMode::Exclusive,
        ShareMode::Shared => pcsc::ShareMode::Shared,
    }
}

fn protocols(protocol: Protocol) -> Protocols {
    match protocol {
        Protocol::T0 => Protocols::T0,
        Protocol::T1 => Protocols::T1,
        Protocol::Any => Protocols::ANY,
    }
}

fn pcsc_disposition(disposition: Disposition) -> pcsc::Disposition {
    match disposition {
        Disposition::Leave => pcsc::Disposition::LeaveCard,
        Disposition::Eject => pcsc::Disposition::EjectCard,
        Disposition::Reset => pcsc::Disposition::ResetCard,
    }
}

/// Finds the control code of the feature in the TLV list answered to the feature request.
fn find_feature(features: &[u8], tag: u8) -> Option<u32> {
    features.chunks_exact(6).find_map(|tlv| match tlv {
        [t, 4, value @ ..] if *t == tag => {
            Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        _ => None,
    })
}

/// Builds `PIN_VERIFY_STRUCTURE` wrapping the `VERIFY` command for the reader.
fn pin_verify_structure(apdu: &[u8], kind: PinKind, display: bool) -> Vec<u8> {
    let timeout = PINPAD_TIMEOUT.as_secs() as u8;
    let digits = kind.digits();
    let extra_digits = u16::from_be_bytes([*digits.start() as u8, *digits.end() as u8]);

    let mut data = vec![
        timeout,                            // bTimerOut
        timeout,                            // bTimerOut2
        0x02,                               // bmFormatString: ASCII
        0x00,                               // bmPINBlockString
        0x00,                               // bmPINLengthFormat
    ];
    data.extend_from_slice(&extra_digits.to_le_bytes()); // wPINMaxExtraDigit
    data.push(0x02); // bEntryValidationCondition: OK key
    data.push(if display { 0xFF } else { 0x00 }); // bNumberMessage
    data.extend_from_slice(&0x0409u16.to_le_bytes()); // wLangId
    data.push(0x00); // bMsgIndex
    data.extend_from_slice(&[0x00; 3]); // bTeoPrologue
    data.extend_from_slice(&(apdu.len() as u32).to_le_bytes());
    data.extend_from_slice(apdu);

    data
}
