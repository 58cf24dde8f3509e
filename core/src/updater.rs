//! The update workflow from reading the card to the server's `STOP`.

use tokio::sync::mpsc::unbounded_channel;
use x509_certificate::X509Certificate;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::card::Card;
use crate::client::Client;
use crate::config::{AppInfo, Configuration, Settings};
use crate::dispatch::{Dispatcher, Event, Flow};
use crate::error::{Error, Result};
use crate::identity::CardIdentity;
use crate::link::{Protocol, ShareMode};
use crate::log::LogSink;
use crate::pin::PinVerifier;
use crate::protocol::Response;
use crate::tls::build_client_config;
use crate::ui::Ui;

/// PIN1, unlocking the authentication key.
const AUTHENTICATION_REFERENCE: u8 = 1;

/// How a run ended without an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The server stopped the session.
    Completed,

    /// The operator answered no to a server dialog.
    Declined,

    /// The certificate could not be read; the server was not contacted.
    CertificateUnreadable,

    /// The authentication PIN was not verified; the server was not contacted.
    PinRejected,
}

/// Releases the card when the run ends, including when its future is dropped.
struct Release<'a>(&'a Card);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Drives one update session.
pub struct Updater<'a, U>
where
    U: Ui + ?Sized,
{
    card: Card,
    ui: &'a U,
    configuration: Configuration,
    settings: Settings,
    app: AppInfo,
    log: LogSink,
}

impl<'a, U> Updater<'a, U>
where
    U: Ui + ?Sized,
{
    pub fn new(
        card: Card,
        ui: &'a U,
        configuration: Configuration,
        settings: Settings,
        app: AppInfo,
        log: LogSink,
    ) -> Self {
        Self {
            card,
            ui,
            configuration,
            settings,
            app,
            log,
        }
    }

    /// Runs the whole workflow. The card is released on every way out.
    pub async fn run(&self) -> Result<Outcome> {
        let _release = Release(&self.card);

        let Some(identity) = self.read_identity() else {
            self.ui.notify_failure("Failed to read certificate");

            return Ok(Outcome::CertificateUnreadable);
        };

        if !self.authenticate(&identity).await {
            info!("Authentication PIN was not verified");

            return Ok(Outcome::PinRejected);
        }

        let client = match self.connect(&identity) {
            Ok(client) => client,
            Err(e) => return Err(self.fail(e)),
        };

        self.process(client).await
    }

    /// Reads the authentication certificate from the card.
    pub fn read_identity(&self) -> Option<CardIdentity> {
        match self.card.read_certificate() {
            Ok(certificate) => {
                debug!("Read {} bytes of certificate", certificate.len());

                Some(CardIdentity::new(certificate, self.card.clone()))
            }
            Err(result) => {
                warn!(
                    "Failed to read certificate: sw {:?}, error {:?}",
                    result.sw,
                    result.error_hex()
                );

                None
            }
        }
    }

    /// Verifies PIN1 once, inside a transaction of its own.
    pub async fn authenticate(&self, identity: &CardIdentity) -> bool {
        {
            let mut link = self.card.lock();
            if link.connect(ShareMode::Shared, Protocol::Any) != 0 {
                return false;
            }

            link.begin_transaction();
        }

        let result = PinVerifier::new(&self.card, self.ui, identity.title(), AUTHENTICATION_REFERENCE)
            .verify()
            .await;

        self.card.release();
        result.is_ok()
    }

    fn connect(&self, identity: &CardIdentity) -> Result<Client> {
        let endpoint = self.configuration.endpoint()?;
        let pinned = self.configuration.pinned_certificates()?;

        // A certificate that does not parse is not offered to the server.
        let identity = X509Certificate::from_der(identity.certificate().as_ref())
            .is_ok()
            .then_some(identity);

        let tls = build_client_config(pinned, identity)?;
        let proxy = self.settings.proxy()?;

        info!("Connecting to {}", endpoint);
        Ok(Client::new(tls, endpoint, &self.app, proxy.as_ref(), self.log.clone())?)
    }

    /// Exchanges messages with the server, starting with `START`, until it stops the session.
    ///
    /// Each server command is dispatched only after the previous one was answered, so answers
    /// are posted in command order.
    pub async fn process(&self, mut client: Client) -> Result<Outcome> {
        let _release = Release(&self.card);
        let (events, mut queue) = unbounded_channel();
        let dispatcher = Dispatcher::new(self.card.clone(), self.ui, events.clone());

        let start = Response::start(self.settings.language(), &self.app);
        let mut next = Some(Event::Send(start));

        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match queue.recv().await {
                    Some(event) => event,
                    None => return Ok(Outcome::Completed),
                },
            };

            let (response, closing) = match event {
                Event::Send(response) => (response, false),
                Event::SendAndClose(response) => (response, true),
            };

            let result = client.exchange(&response).await;
            if closing {
                debug!("Closing after the declined dialog: {:?}", result.map(|_| ()));

                return Ok(Outcome::Declined);
            }

            let inbound = match result {
                Ok(inbound) => inbound,
                Err(e) => return Err(self.fail(e.into())),
            };

            if dispatcher.dispatch(inbound.command).await == Flow::Finish {
                info!("Server stopped the session");

                return Ok(Outcome::Completed);
            }
        }
    }

    fn fail(&self, e: Error) -> Error {
        warn!("Update failed: {}", e);

        self.card.release();
        self.ui.notify_failure(&e.to_string());

        e
    }
}
