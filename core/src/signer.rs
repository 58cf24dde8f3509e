//! Card-backed RSA signing, usable as the private key of a TLS client identity.
//!
//! The private key never leaves the card: every signature is an `INTERNAL AUTHENTICATE`
//! computed by the card over the digest handed in by the TLS stack.

use std::sync::Arc;

use der::asn1::{Null, ObjectIdentifier, OctetStringRef};
use der::{Encode, Sequence};
use rustls::sign::{Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use apdu::Command;

use crate::card::Card;
use crate::link::{CardLink, Disposition, Protocol, ShareMode};
use crate::response::ApduResult;

const MSE_CLA: u8 = 0x00;
const MSE_INS: u8 = 0x22;

const SIGN_CLA: u8 = 0x00;
const SIGN_INS: u8 = 0x88;
const SIGN_P1: u8 = 0x00;
const SIGN_P2: u8 = 0x00;

/// Largest signature the card produces (RSA 4096).
pub const MAX_SIGNATURE_SIZE: usize = 512;

const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// Digest algorithm of the value handed to [`SigningEngine::sign`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DigestType {
    /// MD5 and SHA-1 concatenated, as signed in legacy TLS client authentication.
    Md5Sha1,

    /// SHA-256, wrapped into a PKCS#1 `DigestInfo` before signing.
    Sha256,

    Sha1,
    Sha384,
    Sha512,
}

impl DigestType {
    /// Length of the digest this engine accepts for the type, `None` for unsupported types.
    pub fn accepted_len(&self) -> Option<usize> {
        match self {
            Self::Md5Sha1 => Some(36),
            Self::Sha256 => Some(32),
            _ => None,
        }
    }
}

#[derive(Sequence)]
struct AlgorithmIdentifier {
    oid: ObjectIdentifier,
    null: Null,
}

#[derive(Sequence)]
struct DigestInfo<'a> {
    algorithm: AlgorithmIdentifier,
    digest: OctetStringRef<'a>,
}

fn digest_info(oid: ObjectIdentifier, digest: &[u8]) -> Option<Vec<u8>> {
    DigestInfo {
        algorithm: AlgorithmIdentifier { oid, null: Null },
        digest: OctetStringRef::new(digest).ok()?,
    }
    .to_der()
    .ok()
}

/// Signs digests with the private key held by the card.
#[derive(Clone, Debug)]
pub struct SigningEngine {
    card: Card,
}

impl SigningEngine {
    pub fn new(card: Card) -> Self {
        Self { card }
    }

    /// Computes a signature of the digest into `signature`, returning the number of bytes
    /// written, or `0` when no signature was produced.
    ///
    /// Rejects unsupported digest types and lengths without touching the card, and fails
    /// immediately when another component holds the card. Connections and transactions opened
    /// here are closed again on every path.
    pub fn sign(&self, ty: DigestType, digest: &[u8], signature: &mut [u8]) -> usize {
        if ty.accepted_len() != Some(digest.len()) {
            debug!("Refusing to sign a {:?} digest of {} bytes", ty, digest.len());
            return 0;
        }

        let payload = match ty {
            DigestType::Sha256 => match digest_info(OID_SHA256, digest) {
                Some(payload) => payload,
                None => return 0,
            },
            _ => digest.to_vec(),
        };

        let Some(mut link) = self.card.try_lock() else {
            warn!("Card is busy, cannot sign");
            return 0;
        };

        let connected = link.is_connected();
        if !connected && link.connect(ShareMode::Shared, Protocol::Any) != 0 {
            return 0;
        }

        let transacted = link.in_transaction();
        let result = match transacted || link.begin_transaction() {
            true => compute_signature(&mut **link, payload),
            _ => None,
        };

        if !transacted {
            link.end_transaction();
        }

        if !connected {
            link.disconnect(Disposition::Leave);
        }

        match result {
            Some(result) if result.data.len() <= signature.len() => {
                signature[..result.data.len()].copy_from_slice(&result.data);
                result.data.len()
            }
            _ => 0,
        }
    }
}

fn compute_signature(link: &mut dyn CardLink, payload: Vec<u8>) -> Option<ApduResult> {
    // Security environment 1, then the authentication key reference.
    let environment = Command::new_with_le(MSE_CLA, MSE_INS, 0xF3, 0x01, 0);
    let key = Command::new_with_payload(MSE_CLA, MSE_INS, 0x41, 0xB8, &[0x83, 0x00]);

    if !link.send(environment).is_ok() || !link.send(key).is_ok() {
        return None;
    }

    let result = link.send(Command::new_with_payload(SIGN_CLA, SIGN_INS, SIGN_P1, SIGN_P2, &payload));

    result.is_ok().then_some(result)
}

/// The card key as seen by rustls: RSA PKCS#1 v1.5 with SHA-256 only.
#[derive(Debug)]
pub struct CardSigningKey {
    engine: Arc<SigningEngine>,
}

impl CardSigningKey {
    pub fn new(engine: SigningEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

impl SigningKey for CardSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offered
            .contains(&SignatureScheme::RSA_PKCS1_SHA256)
            .then(|| {
                Box::new(CardSigner {
                    engine: Arc::clone(&self.engine),
                }) as Box<dyn Signer>
            })
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }
}

#[derive(Debug)]
struct CardSigner {
    engine: Arc<SigningEngine>,
}

impl Signer for CardSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let digest = ring::digest::digest(&ring::digest::SHA256, message);
        let mut signature = vec![0u8; MAX_SIGNATURE_SIZE];

        match self.engine.sign(DigestType::Sha256, digest.as_ref(), &mut signature) {
            0 => Err(rustls::Error::General(
                "the card did not produce a signature".into(),
            )),
            len => {
                signature.truncate(len);
                Ok(signature)
            }
        }
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::RSA_PKCS1_SHA256
    }
}
