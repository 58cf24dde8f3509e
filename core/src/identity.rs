//! The card holder's identity as presented to the update server.

use std::fmt::{Debug, Formatter};

use rustls::pki_types::CertificateDer;
use x509_certificate::X509Certificate;

use crate::card::Card;
use crate::signer::{CardSigningKey, SigningEngine};

/// The authentication certificate read from the card, bound to the card that holds its key.
#[derive(Clone)]
pub struct CardIdentity {
    certificate: Vec<u8>,
    card: Card,
}

impl CardIdentity {
    pub fn new(certificate: Vec<u8>, card: Card) -> Self {
        Self { certificate, card }
    }

    pub fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate.clone())
    }

    /// Subject common name of the certificate, `None` if it does not parse.
    pub fn common_name(&self) -> Option<String> {
        X509Certificate::from_der(&self.certificate)
            .ok()?
            .subject_common_name()
    }

    /// Title shown over the PIN prompts.
    pub fn title(&self) -> String {
        self.common_name().unwrap_or_default()
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    /// The private key counterpart of the certificate, computed by the card.
    pub fn signing_key(&self) -> CardSigningKey {
        CardSigningKey::new(SigningEngine::new(self.card.clone()))
    }
}

impl Debug for CardIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardIdentity")
            .field("certificate", &hex::encode(&self.certificate))
            .finish_non_exhaustive()
    }
}
