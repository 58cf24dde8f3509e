//! TLS client configuration for the update session: pinned server trust and the card as the
//! client key.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_name, ResolvesClientCert, VerifierBuilderError, WebPkiServerVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::sign::CertifiedKey;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::identity::CardIdentity;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("none of the pinned certificates can be used as a trust anchor: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

/// Verifies the server against the pinned bundle.
///
/// The bundle entries are the only trust anchors. A chain whose issuer is unknown is still
/// accepted when the presented leaf is byte for byte one of the entries.
#[derive(Debug)]
pub struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pinned: Vec<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedVerifier {
    pub fn new(
        pinned: Vec<CertificateDer<'static>>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(pinned.iter().cloned());
        if ignored > 0 {
            warn!("Ignored {} unparsable pinned certificates", ignored);
        }

        debug!("Pinned {} trust anchors", added);

        let algorithms = provider.signature_verification_algorithms;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider).build()?;

        Ok(Self {
            inner,
            pinned,
            algorithms,
        })
    }

    fn is_pinned(&self, certificate: &CertificateDer<'_>) -> bool {
        self.pinned
            .iter()
            .any(|pinned| pinned.as_ref() == certificate.as_ref())
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
                if self.is_pinned(end_entity) =>
            {
                debug!("Server certificate has an unknown issuer but is pinned");

                verify_server_name(&ParsedCertificate::try_from(end_entity)?, server_name)?;
                Ok(ServerCertVerified::assertion())
            }
            result => result,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Always offers the card certificate with the card-backed key.
#[derive(Debug)]
struct CardCertResolver {
    key: Arc<CertifiedKey>,
}

impl ResolvesClientCert for CardCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Builds the immutable client configuration of the update session.
///
/// Only TLS 1.2 is enabled. Without an identity the client does not authenticate itself.
pub fn build_client_config(
    pinned: Vec<CertificateDer<'static>>,
    identity: Option<&CardIdentity>,
) -> Result<ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedVerifier::new(pinned, Arc::clone(&provider))?;

    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    Ok(match identity {
        Some(identity) => {
            let key = CertifiedKey::new(
                vec![identity.certificate()],
                Arc::new(identity.signing_key()),
            );

            builder.with_client_cert_resolver(Arc::new(CardCertResolver { key: Arc::new(key) }))
        }
        None => builder.with_no_client_auth(),
    })
}
