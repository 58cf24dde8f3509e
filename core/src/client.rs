//! The JSON over HTTPS exchange with the update server.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use rustls::ClientConfig;
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::config::{AppInfo, ProxySettings};
use crate::log::LogSink;
use crate::protocol::{Inbound, Response, Session};

/// Time a request may take before the exchange is abandoned.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const JSON: &str = "application/json";

/// Failures of one exchange. The messages are the ones shown to the operator.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Request timed out")]
    TimedOut,

    #[error("Invalid content type")]
    InvalidContentType,

    #[error("Updating certificates has failed. Check your internet connection and try again.")]
    Connectivity(#[source] reqwest::Error),

    #[error("SSL handshake failed. Please restart the update process.")]
    Handshake(#[source] reqwest::Error),

    #[error("Updating certificates has failed. The server is overloaded, try again later.")]
    Overloaded(StatusCode),

    #[error("{0}")]
    Http(String),

    #[error("failed to set up the HTTP client: {0}")]
    Setup(#[source] reqwest::Error),
}

impl Error {
    fn classify(e: reqwest::Error) -> Self {
        if is_handshake(&e) {
            Self::Handshake(e)
        } else if e.is_connect() || e.is_timeout() {
            Self::Connectivity(e)
        } else {
            Self::Http(e.to_string())
        }
    }
}

fn is_handshake(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(e);
    while let Some(e) = source {
        if e.is::<rustls::Error>() {
            return true;
        }

        // TLS streams report failures as I/O errors wrapping the rustls one.
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return true;
            }
        }

        source = e.source();
    }

    false
}

/// A client of the update protocol, holding the session assigned by the server.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    session: Session,
    log: LogSink,
    timeout: Duration,
}

impl Client {
    /// Connects with the TLS configuration through the configured proxy, or the one detected
    /// from the environment when there is none.
    pub fn new(
        tls: ClientConfig,
        endpoint: impl Into<String>,
        app: &AppInfo,
        proxy: Option<&ProxySettings>,
        log: LogSink,
    ) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .user_agent(app.user_agent());

        if let Some(settings) = proxy {
            let mut proxy = match settings.url() {
                Some(url) => {
                    info!("Using proxy {}", url);
                    reqwest::Proxy::all(url).map_err(Error::Setup)?
                }
                None => {
                    info!("Using the system proxy with the configured credentials");
                    reqwest::Proxy::custom(|url| system_proxy(url, |name| std::env::var(name).ok()))
                        .no_proxy(reqwest::NoProxy::from_env())
                }
            };

            if let Some((user, pass)) = &settings.credentials {
                proxy = proxy.basic_auth(user, pass);
            }

            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(Error::Setup)?;

        Ok(Self::with_http(http, endpoint, log))
    }

    /// Wraps an already configured HTTP client.
    pub fn with_http(http: reqwest::Client, endpoint: impl Into<String>, log: LogSink) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            session: Session::default(),
            log,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Posts the message and decodes the server's reply, taking the session from it if none is
    /// known yet.
    pub async fn exchange(&mut self, response: &Response) -> Result<Inbound, Error> {
        let body = response.encode(&self.session);
        self.log.line(format!("< {}", body));

        let data = tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| Error::TimedOut)??;

        self.log.line(format!("> {}", String::from_utf8_lossy(&data)));

        let inbound = Inbound::decode(&data);
        self.session.observe(inbound.session.as_deref());

        Ok(inbound)
    }

    async fn post(&self, body: String) -> Result<Vec<u8>, Error> {
        debug!("POST {}", self.endpoint);

        let reply = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, JSON)
            .body(body)
            .send()
            .await
            .map_err(Error::classify)?;

        let status = reply.status();
        if status == StatusCode::SERVICE_UNAVAILABLE || status.as_u16() == 509 {
            return Err(Error::Overloaded(status));
        }

        if !status.is_success() {
            return Err(Error::Http(format!(
                "Error transferring {} - server replied: {}",
                self.endpoint,
                status.canonical_reason().unwrap_or(status.as_str()),
            )));
        }

        let media_type = reply
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::trim);

        if !media_type.is_some_and(|t| t.eq_ignore_ascii_case(JSON)) {
            return Err(Error::InvalidContentType);
        }

        Ok(reply.bytes().await.map_err(Error::classify)?.to_vec())
    }
}

/// The proxy the environment names for the scheme of `url`.
fn system_proxy(url: &Url, var: impl Fn(&str) -> Option<String>) -> Option<Url> {
    let names: &[&str] = match url.scheme() {
        "https" => &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"],
        "http" => &["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"],
        _ => &["ALL_PROXY", "all_proxy"],
    };

    let proxy = names
        .iter()
        .filter_map(|name| var(name))
        .find(|value| !value.is_empty())?;

    if proxy.contains("://") {
        Url::parse(&proxy).ok()
    } else {
        Url::parse(&format!("http://{}", proxy)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::testing::http::{json, reply, serve};
    use tokio::net::TcpListener;

    fn client(endpoint: &str) -> Client {
        Client::with_http(reqwest::Client::new(), endpoint, LogSink::discard())
    }

    #[tokio::test]
    async fn test_session_is_echoed() {
        let server = serve(vec![
            json(r#"{"session":"abc","cmd":"CONNECT"}"#),
            reply(200, "application/json; charset=utf-8", r#"{"session":"xyz","cmd":"MESSAGE","text":"Hi"}"#),
            json(r#"{"cmd":"STOP"}"#),
        ])
        .await;

        let mut client = client(&server.endpoint);

        let inbound = client.exchange(&Response::new().with("cmd", "START")).await.unwrap();
        assert_eq!(inbound.command, Command::Connect { protocol: None });

        let inbound = client.exchange(&Response::result("CONNECT", true)).await.unwrap();
        assert_eq!(
            inbound.command,
            Command::Message {
                text: "Hi".into()
            }
        );

        client.exchange(&Response::result("MESSAGE", true)).await.unwrap();
        assert_eq!(client.session().token(), Some("abc"));

        let bodies = server.bodies();

        assert_eq!(bodies[0], serde_json::json!({"cmd": "START"}));
        assert_eq!(bodies[1], serde_json::json!({"session": "abc", "CONNECT": "OK"}));
        assert_eq!(bodies[2], serde_json::json!({"session": "abc", "MESSAGE": "OK"}));

        for request in server.received() {
            assert_eq!(request.content_type.as_deref(), Some(JSON));
        }
    }

    #[tokio::test]
    async fn test_log_lines() {
        let server = serve(vec![json(r#"{"cmd":"STOP"}"#)]).await;

        let (log, mut lines) = LogSink::channel();
        let mut client = Client::with_http(reqwest::Client::new(), &server.endpoint, log);
        client.exchange(&Response::result("MESSAGE", true)).await.unwrap();

        assert_eq!(lines.try_recv().unwrap(), r#"< {"MESSAGE":"OK"}"#);
        assert_eq!(lines.try_recv().unwrap(), r#"> {"cmd":"STOP"}"#);
    }

    #[tokio::test]
    async fn test_invalid_content_type() {
        let server = serve(vec![reply(200, "text/html", "<html></html>")]).await;

        let result = client(&server.endpoint).exchange(&Response::new()).await;

        assert!(matches!(result, Err(Error::InvalidContentType)));
        assert_eq!(result.unwrap_err().to_string(), "Invalid content type");
    }

    #[tokio::test]
    async fn test_overloaded() {
        for status in [503, 509] {
            let server = serve(vec![reply(status, "text/plain", "busy")]).await;

            let result = client(&server.endpoint).exchange(&Response::new()).await;

            assert!(matches!(result, Err(Error::Overloaded(s)) if s.as_u16() == status));
        }
    }

    #[tokio::test]
    async fn test_other_status_verbatim() {
        let server = serve(vec![reply(500, JSON, "{}")]).await;

        let result = client(&server.endpoint).exchange(&Response::new()).await;

        match result {
            Err(Error::Http(message)) => assert!(message.ends_with("Internal Server Error")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timed_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = client(&endpoint)
            .with_timeout(Duration::from_millis(100))
            .exchange(&Response::new())
            .await;
        server.abort();

        assert!(matches!(result, Err(Error::TimedOut)));
        assert_eq!(result.unwrap_err().to_string(), "Request timed out");
    }

    #[tokio::test]
    async fn test_connectivity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let result = client(&endpoint).exchange(&Response::new()).await;

        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    #[test]
    fn test_handshake_detection() {
        let tls = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(is_handshake(&tls));

        let other = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_handshake(&other));
    }

    #[test]
    fn test_system_proxy() {
        let env = |vars: &'static [(&'static str, &'static str)]| {
            move |name: &str| {
                vars.iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| value.to_string())
            }
        };
        let https = Url::parse("https://updates.example/update").unwrap();
        let http = Url::parse("http://updates.example/update").unwrap();

        let vars = env(&[
            ("HTTPS_PROXY", ""),
            ("https_proxy", "proxy.example:3128"),
            ("ALL_PROXY", "http://fallback.example:8080"),
        ]);
        assert_eq!(
            system_proxy(&https, &vars).unwrap().as_str(),
            "http://proxy.example:3128/"
        );
        assert_eq!(
            system_proxy(&http, &vars).unwrap().as_str(),
            "http://fallback.example:8080/"
        );

        assert_eq!(system_proxy(&https, env(&[])), None);
    }

    #[test]
    fn test_credentials_for_system_proxy() {
        let proxy = ProxySettings {
            server: None,
            credentials: Some(("alice".into(), "secret".into())),
        };
        let pinned = rcgen::generate_simple_self_signed(vec!["updates.example".into()])
            .unwrap()
            .cert
            .der()
            .clone();
        let tls = crate::tls::build_client_config(vec![pinned], None).unwrap();
        let app = AppInfo::new("eid-updater", "1.0.0");

        let client = Client::new(
            tls,
            "https://updates.example/update",
            &app,
            Some(&proxy),
            LogSink::discard(),
        );
        assert!(client.is_ok());
    }
}
