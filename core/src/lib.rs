//! A crate to renew the certificates of an ID card through a card-authenticated update session.
//!
//! The card is reached through a [`CardLink`] delegate. With the `pcsc` feature, [`pcsc::PcscLink`]
//! provides one backed by the platform PC/SC service.

// Stand-ins for the `tracing` macros, in scope of every module below. The arguments are only
// borrowed so values used solely for logging still count as used.
#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($arg: expr),* $(,)?) => {{ $(let _ = &$arg;)* }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($arg: expr),* $(,)?) => {{ $(let _ = &$arg;)* }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($arg: expr),* $(,)?) => {{ $(let _ = &$arg;)* }};
}

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub mod card;
pub mod client;
pub mod config;
pub mod der;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod link;
pub mod log;
pub mod pin;
pub mod protocol;
pub mod response;
pub mod signer;
pub mod tls;
pub mod ui;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use card::Card;
pub use error::{Error, Result};
pub use link::CardLink;
pub use response::{ApduResult, StatusWord};
pub use updater::{Outcome, Updater};
