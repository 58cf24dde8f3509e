//! Local configuration: the update endpoint, the pinned certificate bundle and operator settings.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no update endpoint is configured")]
    NoEndpoint,

    #[error("the certificate bundle is empty")]
    EmptyBundle,

    #[error("certificate {index} of the bundle is not valid base64: {source}")]
    Bundle {
        index: usize,
        source: base64::DecodeError,
    },

    #[error("proxy host must be given as host:port, got {0:?}")]
    ProxyHost(String),
}

/// Deployment configuration shipped with the updater.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Configuration {
    #[serde(rename = "EIDUPDATER-URL")]
    pub url: Option<String>,

    #[serde(rename = "EIDUPDATER-URL-34")]
    pub url_34: Option<String>,

    #[serde(rename = "EIDUPDATER-URL-35")]
    pub url_35: Option<String>,

    /// Base64 DER certificates the server chain is checked against.
    #[serde(rename = "CERT-BUNDLE", default)]
    pub cert_bundle: Vec<String>,
}

impl Configuration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(serde_json::from_slice(&read(path.as_ref())?)?)
    }

    /// The update endpoint: the primary key, then the two legacy keys in order.
    pub fn endpoint(&self) -> Result<&str, Error> {
        [&self.url, &self.url_34, &self.url_35]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|url| !url.is_empty())
            .ok_or(Error::NoEndpoint)
    }

    /// Decodes the pinned bundle.
    pub fn pinned_certificates(&self) -> Result<Vec<CertificateDer<'static>>, Error> {
        if self.cert_bundle.is_empty() {
            return Err(Error::EmptyBundle);
        }

        self.cert_bundle
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let compact: String = entry.chars().filter(|c| !c.is_whitespace()).collect();

                STANDARD
                    .decode(compact)
                    .map(CertificateDer::from)
                    .map_err(|source| Error::Bundle { index, source })
            })
            .collect()
    }
}

/// Settings of the operator's installation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    /// `host:port` of an HTTP proxy.
    #[serde(rename = "PROXY-HOST")]
    pub proxy_host: Option<String>,

    #[serde(rename = "PROXY-USER")]
    pub proxy_user: Option<String>,

    #[serde(rename = "PROXY-PASS")]
    pub proxy_pass: Option<String>,

    #[serde(rename = "LANGUAGE")]
    pub language: Option<String>,
}

/// The operator's proxy settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxySettings {
    /// Host and port of the proxy; `None` keeps the one detected from the system.
    pub server: Option<(String, u16)>,
    pub credentials: Option<(String, String)>,
}

impl ProxySettings {
    pub fn url(&self) -> Option<String> {
        self.server
            .as_ref()
            .map(|(host, port)| format!("http://{}:{}", host, port))
    }
}

impl Settings {
    /// Loads the settings, falling back to the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_slice(&read(path)?)?)
    }

    /// The configured proxy, `None` to use the one detected from the system as it is.
    /// Credentials without a host apply to the detected proxy.
    pub fn proxy(&self) -> Result<Option<ProxySettings>, Error> {
        let credentials = match self.proxy_user.as_deref() {
            Some(user) if !user.is_empty() => Some((
                user.to_string(),
                self.proxy_pass.clone().unwrap_or_default(),
            )),
            _ => None,
        };

        let Some(host) = self.proxy_host.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(credentials.map(|credentials| ProxySettings {
                server: None,
                credentials: Some(credentials),
            }));
        };

        let invalid = || Error::ProxyHost(host.to_string());
        let (name, port) = host.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Some(ProxySettings {
            server: Some((name.to_string(), port)),
            credentials,
        }))
    }

    pub fn language(&self) -> &str {
        self.language
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or("en")
    }
}

/// Identification of the running application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub os: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            os: os_name().to_string(),
        }
    }

    pub fn user_agent(&self) -> String {
        format!("{}/{} ({})", self.name, self.version, self.os)
    }
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "OS X",
        "windows" => "Windows",
        os => os,
    }
}

fn read(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}
