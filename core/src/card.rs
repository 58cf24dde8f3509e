use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use apdu::{command, Command};

use crate::der::entire_size_from_partial;
use crate::link::{CardLink, Disposition, Protocol, ShareMode};
use crate::response::ApduResult;

const CLA_DEFAULT: u8 = 0x00;
const INS_SELECT_FILE: u8 = 0xA4;

const SELECT_P1_MF: u8 = 0x00;
const SELECT_P1_DF: u8 = 0x01;
const SELECT_P1_EF: u8 = 0x02;
const SELECT_P1_AID: u8 = 0x04;
const SELECT_P2: u8 = 0x00;

const AID_UPDATER: [u8; 10] = [0xD2, 0x33, 0x00, 0x00, 0x00, 0x55, 0x50, 0x44, 0x31, 0x01];
const DF_CERTIFICATES: [u8; 2] = [0xEE, 0xEE];
const EF_AUTH_CERT: [u8; 2] = [0xAA, 0xCE];

/// Size of the certificate file; the certificate itself is zero padded up to this.
pub const CERT_FILE_SIZE: usize = 0x0600;

/// A cloneable handle to the single reader connection, shared by every component that talks to
/// the card.
///
/// Ownership is exclusive per lock scope: callers hold the guard for the whole
/// begin/end transaction bracket they issue transfers in.
#[derive(Clone)]
pub struct Card {
    link: Arc<Mutex<Box<dyn CardLink>>>,
}

impl Card {
    /// Initiates a handle with the delegate.
    pub fn new(link: Box<dyn CardLink>) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
        }
    }

    /// Locks the link, waiting for a worker that holds it.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn CardLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the link if nobody else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Box<dyn CardLink>>> {
        match self.link.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Reads the authentication certificate, falling back to the updater applet when the master
    /// file cannot be selected directly.
    ///
    /// Returns the DER bytes with the file padding removed, or the failing result.
    pub fn read_certificate(&self) -> Result<Vec<u8>, ApduResult> {
        let mut link = self.lock();

        let code = link.connect(ShareMode::Shared, Protocol::Any);
        if code != 0 {
            warn!("Failed to connect to {}: {:x}", link.reader_name(), code);
        }

        link.begin_transaction();
        let result = read_certificate_file(&mut **link);
        link.end_transaction();
        link.disconnect(Disposition::Leave);

        result.map(|mut buf| {
            let size = entire_size_from_partial(&buf).unwrap_or(buf.len());
            buf.truncate(size);
            buf
        })
    }

    /// Ends any open transaction and disconnects, leaving the card as is.
    pub fn release(&self) {
        let mut link = self.lock();
        if link.in_transaction() {
            link.end_transaction();
        }

        if link.is_connected() {
            link.disconnect(Disposition::Leave);
        }
    }
}

impl Debug for Card {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card").finish_non_exhaustive()
    }
}

fn read_certificate_file(link: &mut dyn CardLink) -> Result<Vec<u8>, ApduResult> {
    let select_master_file =
        || Command::new_with_le(CLA_DEFAULT, INS_SELECT_FILE, SELECT_P1_MF, SELECT_P2, 0);

    if !link.send(select_master_file()).is_ok() {
        debug!("Master file selection failed, trying the updater applet");

        link.send(command::select_file(SELECT_P1_AID, SELECT_P2, &AID_UPDATER).into());
        link.send(select_master_file());
    }

    link.send(select_master_file());
    link.send(command::select_file(SELECT_P1_DF, SELECT_P2, &DF_CERTIFICATES).into());
    link.send(command::select_file(SELECT_P1_EF, SELECT_P2, &EF_AUTH_CERT).into());

    read(link, CERT_FILE_SIZE)
}

/// Reads binary from the selected file until `len` octets are accumulated.
fn read(link: &mut dyn CardLink, len: usize) -> Result<Vec<u8>, ApduResult> {
    let mut buf: Vec<u8> = Vec::new();

    while buf.len() < len {
        let [p1, p2] = (buf.len() as u16).to_be_bytes();
        let mut result = link.send(command::read_binary(p1, p2, 0).into());
        if !result.is_ok() || result.data.is_empty() {
            return Err(result);
        }

        buf.append(&mut result.data);
    }

    Ok(buf)
}
