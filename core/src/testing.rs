//! In-memory card link and scripted operator used by the tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::link::{code, CardLink, Disposition, Protocol, SessionState, ShareMode};
use crate::response::ApduResult;
use crate::pin::PinPrompt;
use crate::ui::Ui;

pub(crate) const ATR: [u8; 4] = [0x3B, 0xFE, 0x18, 0x00];

const INS_SELECT_FILE: u8 = 0xA4;
const INS_READ_BINARY: u8 = 0xB0;

#[derive(Default)]
struct State {
    state: Option<SessionState>,
    protocol: Option<Protocol>,
    sent: Vec<Vec<u8>>,
    pinpad_sent: Vec<Vec<u8>>,
    replies: VecDeque<ApduResult>,
    connects: Vec<ShareMode>,
    disconnects: Vec<Disposition>,
    begins: usize,
    ends: usize,
    reject_master_file: bool,
}

/// Builder of a [`MockLink`].
#[derive(Default)]
pub(crate) struct MockLinkBuilder {
    file: Vec<u8>,
    connected: bool,
    refuse_exclusive: bool,
    absent: bool,
    reject_master_file: bool,
    pinpad: Option<Duration>,
    replies: Vec<ApduResult>,
}

impl MockLinkBuilder {
    /// Contents of the file answered to `READ BINARY`.
    pub fn with_file(mut self, file: Vec<u8>) -> Self {
        self.file = file;
        self
    }

    /// Starts connected instead of disconnected.
    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    pub fn refusing_exclusive(mut self) -> Self {
        self.refuse_exclusive = true;
        self
    }

    /// No card in the reader: every connect fails.
    pub fn absent(mut self) -> Self {
        self.absent = true;
        self
    }

    pub fn rejecting_master_file_once(mut self) -> Self {
        self.reject_master_file = true;
        self
    }

    /// Makes the reader a pinpad whose transfers block for `delay`.
    pub fn pinpad(mut self, delay: Duration) -> Self {
        self.pinpad = Some(delay);
        self
    }

    /// Results answered in order to everything but `SELECT FILE` and `READ BINARY`;
    /// `90 00` once exhausted.
    pub fn replying(mut self, replies: Vec<ApduResult>) -> Self {
        self.replies = replies;
        self
    }

    pub fn build(self) -> (MockLink, MockHandle) {
        let state = Arc::new(Mutex::new(State {
            state: Some(match self.connected {
                true => SessionState::Connected,
                _ => SessionState::Disconnected,
            }),
            protocol: self.connected.then_some(Protocol::T1),
            replies: self.replies.into(),
            reject_master_file: self.reject_master_file,
            ..Default::default()
        }));

        let link = MockLink {
            state: Arc::clone(&state),
            file: self.file,
            refuse_exclusive: self.refuse_exclusive,
            absent: self.absent,
            pinpad: self.pinpad,
        };

        (link, MockHandle { state })
    }
}

/// A card link answering from memory.
pub(crate) struct MockLink {
    state: Arc<Mutex<State>>,
    file: Vec<u8>,
    refuse_exclusive: bool,
    absent: bool,
    pinpad: Option<Duration>,
}

impl MockLink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> MockLinkBuilder {
        MockLinkBuilder::default()
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn answer(&self, apdu: &[u8]) -> ApduResult {
        let mut state = self.shared();

        match apdu.get(1).copied() {
            Some(INS_SELECT_FILE) => {
                if apdu.get(2) == Some(&0x00) && state.reject_master_file {
                    state.reject_master_file = false;

                    return ApduResult::from_bytes(vec![0x6A, 0x82]);
                }

                ApduResult::from_bytes(vec![0x90, 0x00])
            }
            Some(INS_READ_BINARY) => {
                let offset = u16::from_be_bytes([apdu[2], apdu[3]]) as usize;
                if offset >= self.file.len() {
                    return ApduResult::from_bytes(vec![0x6B, 0x00]);
                }

                let end = (offset + 0x100).min(self.file.len());
                let mut rx = self.file[offset..end].to_vec();
                rx.extend_from_slice(&[0x90, 0x00]);
                ApduResult::from_bytes(rx)
            }
            _ => state
                .replies
                .pop_front()
                .unwrap_or_else(|| ApduResult::from_bytes(vec![0x90, 0x00])),
        }
    }
}

impl CardLink for MockLink {
    fn reader_name(&self) -> &str {
        "Mock Reader 00 00"
    }

    fn connect(&mut self, share: ShareMode, protocol: Protocol) -> u32 {
        let mut state = self.shared();
        state.connects.push(share);

        if self.absent {
            return code::NO_SMARTCARD;
        }

        if self.refuse_exclusive && share == ShareMode::Exclusive {
            return code::SHARING_VIOLATION;
        }

        state.state = Some(SessionState::Connected);
        state.protocol = Some(match protocol {
            Protocol::T0 => Protocol::T0,
            _ => Protocol::T1,
        });

        code::SUCCESS
    }

    fn disconnect(&mut self, disposition: Disposition) {
        let mut state = self.shared();
        if state.state == Some(SessionState::InTransaction) {
            state.ends += 1;
        }

        state.state = Some(SessionState::Disconnected);
        state.protocol = None;
        state.disconnects.push(disposition);
    }

    fn begin_transaction(&mut self) -> bool {
        let mut state = self.shared();
        if state.state != Some(SessionState::Connected) {
            return false;
        }

        state.begins += 1;
        state.state = Some(SessionState::InTransaction);
        true
    }

    fn end_transaction(&mut self) {
        let mut state = self.shared();
        if state.state == Some(SessionState::InTransaction) {
            state.ends += 1;
            state.state = Some(SessionState::Connected);
        }
    }

    fn transfer(&mut self, apdu: &[u8]) -> ApduResult {
        if !self.is_connected() {
            return ApduResult::failure(code::INVALID_HANDLE);
        }

        self.shared().sent.push(apdu.to_vec());
        self.answer(apdu)
    }

    fn transfer_pinpad(&mut self, apdu: &[u8], _display: bool) -> ApduResult {
        let Some(delay) = self.pinpad else {
            return ApduResult::failure(code::UNSUPPORTED_FEATURE);
        };

        if !self.is_connected() {
            return ApduResult::failure(code::INVALID_HANDLE);
        }

        std::thread::sleep(delay);
        self.shared().pinpad_sent.push(apdu.to_vec());
        self.answer(apdu)
    }

    fn state(&self) -> SessionState {
        self.state
            .lock()
            .unwrap()
            .state
            .unwrap_or(SessionState::Disconnected)
    }

    fn is_pinpad(&self) -> bool {
        self.pinpad.is_some()
    }

    fn atr(&self) -> Vec<u8> {
        match self.is_connected() {
            true => ATR.to_vec(),
            _ => vec![],
        }
    }

    fn protocol(&self) -> Option<Protocol> {
        self.state.lock().unwrap().protocol
    }
}

/// Inspects a [`MockLink`] after it moved into a card.
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<State>>,
}

impl MockHandle {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn pinpad_sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().pinpad_sent.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .unwrap()
            .state
            .unwrap_or(SessionState::Disconnected)
    }

    /// Numbers of transactions begun and ended.
    pub fn transactions(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.begins, state.ends)
    }

    pub fn connects(&self) -> Vec<ShareMode> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<Disposition> {
        self.state.lock().unwrap().disconnects.clone()
    }
}

#[derive(Default)]
struct Recorded {
    pins: VecDeque<String>,
    answers: VecDeque<bool>,
    prompts: Vec<PinPrompt>,
    pinpad_prompts: Vec<PinPrompt>,
    ticks: usize,
    pin_finished: usize,
    confirmations: Vec<String>,
    envelopes: Vec<(String, String)>,
    statuses: Vec<String>,
    stopped: Vec<Option<String>>,
    failures: Vec<String>,
}

/// An operator answering from a script and recording what was shown.
#[derive(Default)]
pub(crate) struct ScriptedUi {
    recorded: Mutex<Recorded>,
}

impl ScriptedUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// PINs typed in order; the prompt after the last one is cancelled.
    pub fn with_pins<const N: usize>(self, pins: [&str; N]) -> Self {
        self.recorded.lock().unwrap().pins = pins.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Answers to confirmations in order; `false` once exhausted.
    pub fn with_answers<const N: usize>(self, answers: [bool; N]) -> Self {
        self.recorded.lock().unwrap().answers = answers.into_iter().collect();
        self
    }

    pub fn prompts(&self) -> Vec<PinPrompt> {
        self.recorded.lock().unwrap().prompts.clone()
    }

    pub fn pinpad_prompts(&self) -> Vec<PinPrompt> {
        self.recorded.lock().unwrap().pinpad_prompts.clone()
    }

    pub fn ticks(&self) -> usize {
        self.recorded.lock().unwrap().ticks
    }

    pub fn pin_finished_count(&self) -> usize {
        self.recorded.lock().unwrap().pin_finished
    }

    pub fn confirmations(&self) -> Vec<String> {
        self.recorded.lock().unwrap().confirmations.clone()
    }

    pub fn envelopes(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().envelopes.clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.recorded.lock().unwrap().statuses.clone()
    }

    pub fn stopped(&self) -> Vec<Option<String>> {
        self.recorded.lock().unwrap().stopped.clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.recorded.lock().unwrap().failures.clone()
    }
}

#[async_trait]
impl Ui for ScriptedUi {
    async fn request_pin(&self, prompt: &PinPrompt) -> Option<String> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.prompts.push(prompt.clone());
        recorded.pins.pop_front()
    }

    fn pinpad_started(&self, prompt: &PinPrompt, _timeout: Duration) {
        self.recorded.lock().unwrap().pinpad_prompts.push(prompt.clone());
    }

    fn pinpad_tick(&self, _remaining: Duration) {
        self.recorded.lock().unwrap().ticks += 1;
    }

    fn pin_finished(&self) {
        self.recorded.lock().unwrap().pin_finished += 1;
    }

    async fn confirm(&self, text: &str) -> bool {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.confirmations.push(text.to_string());
        recorded.answers.pop_front().unwrap_or(false)
    }

    async fn confirm_envelope(&self, label: &str, envelope: &str) -> bool {
        let mut recorded = self.recorded.lock().unwrap();
        recorded
            .envelopes
            .push((label.to_string(), envelope.to_string()));
        recorded.answers.pop_front().unwrap_or(false)
    }

    fn set_status(&self, text: &str) {
        self.recorded.lock().unwrap().statuses.push(text.to_string());
    }

    fn stop_progress(&self, text: Option<&str>) {
        self.recorded
            .lock()
            .unwrap()
            .stopped
            .push(text.map(str::to_string));
    }

    fn notify_failure(&self, text: &str) {
        self.recorded.lock().unwrap().failures.push(text.to_string());
    }
}

/// An update endpoint serving canned replies in order and recording what it was sent.
pub(crate) mod http {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::Router;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    pub const JSON: &str = "application/json";

    #[derive(Clone, Debug)]
    pub struct Reply {
        status: StatusCode,
        content_type: &'static str,
        body: String,
    }

    pub fn reply(status: u16, content_type: &'static str, body: &str) -> Reply {
        Reply {
            status: StatusCode::from_u16(status).unwrap(),
            content_type,
            body: body.to_string(),
        }
    }

    pub fn json(body: &str) -> Reply {
        reply(200, JSON, body)
    }

    /// A request as the endpoint received it.
    #[derive(Clone, Debug)]
    pub struct Received {
        pub content_type: Option<String>,
        pub body: String,
    }

    #[derive(Clone, Default)]
    struct Script {
        replies: Arc<Mutex<VecDeque<Reply>>>,
        received: Arc<Mutex<Vec<Received>>>,
    }

    async fn update(State(script): State<Script>, headers: HeaderMap, body: String) -> Response {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        script
            .received
            .lock()
            .unwrap()
            .push(Received { content_type, body });

        let next = script.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => (
                reply.status,
                [(header::CONTENT_TYPE, reply.content_type)],
                reply.body,
            )
                .into_response(),
            None => StatusCode::GONE.into_response(),
        }
    }

    /// A running endpoint, stopped when dropped.
    pub struct Server {
        pub endpoint: String,
        received: Arc<Mutex<Vec<Received>>>,
        task: JoinHandle<()>,
    }

    impl Server {
        pub fn received(&self) -> Vec<Received> {
            self.received.lock().unwrap().clone()
        }

        /// The JSON bodies of the requests.
        pub fn bodies(&self) -> Vec<Value> {
            self.received()
                .iter()
                .map(|request| serde_json::from_str(&request.body).unwrap())
                .collect()
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    /// Serves the replies in order on `POST /update`; anything past them is answered `410`.
    pub async fn serve(replies: Vec<Reply>) -> Server {
        let script = Script {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Default::default()
        };
        let received = Arc::clone(&script.received);

        let app = Router::new()
            .route("/update", post(update))
            .with_state(script);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/update", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Server {
            endpoint,
            received,
            task,
        }
    }
}
