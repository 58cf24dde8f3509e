//! Communicating with the card through a reader connection.

use apdu::Command;

use crate::response::ApduResult;

/// PC/SC return codes reported through [`ApduResult::error`] and [`CardLink::connect`].
pub mod code {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const INTERNAL_ERROR: u32 = 0x8010_0001;
    pub const CANCELLED: u32 = 0x8010_0002;
    pub const INVALID_HANDLE: u32 = 0x8010_0003;
    pub const INVALID_PARAMETER: u32 = 0x8010_0004;
    pub const SHARING_VIOLATION: u32 = 0x8010_000B;
    pub const NO_SMARTCARD: u32 = 0x8010_000C;
    pub const NOT_TRANSACTED: u32 = 0x8010_0016;
    pub const READER_UNAVAILABLE: u32 = 0x8010_0017;
    pub const NO_SERVICE: u32 = 0x8010_001D;
    pub const UNSUPPORTED_FEATURE: u32 = 0x8010_0022;
}

/// How the reader is shared with other applications while connected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShareMode {
    Exclusive,
    Shared,
}

/// Transmission protocol requested on connect or negotiated with the card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    T0,
    T1,
    Any,
}

impl Protocol {
    /// Parses the protocol name used by the update server, `Any` when absent or unknown.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("T=0") => Self::T0,
            Some("T=1") => Self::T1,
            _ => Self::Any,
        }
    }
}

/// What happens to the card when the connection is released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Leave,
    Eject,
    Reset,
}

impl Disposition {
    /// Parses the action sent with `DISCONNECT`; everything but `leave` and `eject` resets.
    pub fn from_action(action: Option<&str>) -> Self {
        match action {
            Some("leave") => Self::Leave,
            Some("eject") => Self::Eject,
            _ => Self::Reset,
        }
    }
}

/// State of the reader session owned by a link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    InTransaction,
}

/// A delegate to communicate with the card inserted in one reader.
///
/// Implementations must never panic on transport failures: `connect` returns the PC/SC code
/// and transfers encode the failure into the returned [`ApduResult`].
pub trait CardLink: Send {
    /// Name of the reader this link talks to.
    fn reader_name(&self) -> &str;

    /// Connects to the card, returning `0` on success or the PC/SC error code.
    fn connect(&mut self, share: ShareMode, protocol: Protocol) -> u32;

    /// Releases the card. Ends an open transaction first.
    fn disconnect(&mut self, disposition: Disposition);

    /// Acquires the card level lock. Nested calls are not supported.
    fn begin_transaction(&mut self) -> bool;

    /// Releases the card level lock taken by [`CardLink::begin_transaction`].
    fn end_transaction(&mut self);

    /// Transmits a raw command to the card, then receives a response from them.
    fn transfer(&mut self, apdu: &[u8]) -> ApduResult;

    /// Transmits a `VERIFY` command whose PIN is entered on the reader's own keypad.
    /// Blocks until the operator finishes or the reader times out.
    fn transfer_pinpad(&mut self, apdu: &[u8], display: bool) -> ApduResult;

    fn state(&self) -> SessionState;

    fn is_pinpad(&self) -> bool;

    /// Answer To Reset of the connected card, empty when disconnected.
    fn atr(&self) -> Vec<u8>;

    /// Negotiated protocol, `None` when disconnected.
    fn protocol(&self) -> Option<Protocol>;

    fn is_connected(&self) -> bool {
        self.state() != SessionState::Disconnected
    }

    fn in_transaction(&self) -> bool {
        self.state() == SessionState::InTransaction
    }

    /// Transmits a structured command.
    fn send(&mut self, command: Command) -> ApduResult {
        self.transfer(&Vec::from(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLink;

    #[test]
    fn test_send_encodes_command() {
        let (mut link, handle) = MockLink::new().connected().build();

        link.send(Command::new_with_payload(0x00, 0x22, 0x41, 0xB8, &[0x83, 0x00]));
        link.send(apdu::command::read_binary(0x01, 0x02, 0).into());
        link.send(apdu::command::select_file(0x02, 0x00, &[0xAA, 0xCE]).into());

        assert_eq!(
            handle.sent(),
            vec![
                vec![0x00, 0x22, 0x41, 0xB8, 0x02, 0x83, 0x00],
                vec![0x00, 0xB0, 0x01, 0x02, 0x00],
                vec![0x00, 0xA4, 0x02, 0x00, 0x02, 0xAA, 0xCE],
            ],
        );
    }

    #[test]
    fn test_protocol_from_name() {
        assert_eq!(Protocol::from_name(Some("T=0")), Protocol::T0);
        assert_eq!(Protocol::from_name(Some("T=1")), Protocol::T1);
        assert_eq!(Protocol::from_name(Some("T=CL")), Protocol::Any);
        assert_eq!(Protocol::from_name(None), Protocol::Any);
    }

    #[test]
    fn test_disposition_from_action() {
        assert_eq!(Disposition::from_action(Some("leave")), Disposition::Leave);
        assert_eq!(Disposition::from_action(Some("eject")), Disposition::Eject);
        assert_eq!(Disposition::from_action(Some("unpower")), Disposition::Reset);
        assert_eq!(Disposition::from_action(None), Disposition::Reset);
    }
}
