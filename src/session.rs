//! Session lifecycle: handshake, audio exchange, teardown and reconnection.
//!
//! [`SessionMachine`] is a pure transition table: it takes one
//! [`SessionEvent`] at a time and returns the [`Action`]s to perform. The
//! driver task owns the socket, microphone and playback queue, turns
//! everything that happens to them into events, and executes the resulting
//! actions. Only the driver ever touches the socket.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use strum::Display;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::audio_sink::AudioSink;
use crate::capture::AudioCapture;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lock;
use crate::playback::PlaybackQueue;
use crate::protocol::{AudioFormat, Inbound, ProtocolMessage, SessionConfiguration, Transcript};
use crate::resample::PcmTranscoder;
use crate::transport::{Socket, SocketEvent, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingReady,
    AwaitingAudioConfig,
    Active,
    Stopping,
    Closed,
    Error,
}

impl SessionState {
    /// Between `connect()` and a terminal transition.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AwaitingReady
                | SessionState::AwaitingAudioConfig
                | SessionState::Active
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// Snapshot pushed to the embedding application on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub is_connecting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn connecting() -> Self {
        Self {
            is_connecting: true,
            ..Self::default()
        }
    }

    pub fn connected() -> Self {
        Self {
            is_connected: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connect(SessionConfiguration),
    SocketOpened,
    Message(ProtocolMessage),
    /// A server frame that could not be parsed.
    Malformed(String),
    CaptureFrame(Vec<u8>),
    CaptureFailed(String),
    SocketClosed { code: u16, reason: String },
    TransportFailed(String),
    ConnectTimeout,
    ReconnectDue,
    StopRequested,
    DisconnectRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a new socket and arm the connection timer.
    OpenSocket,
    ScheduleReconnect { attempt: u32 },
    ClearTimers,
    Send(ProtocolMessage),
    StartCapture,
    StopCapture,
    EnqueueAudio(String),
    SetPlaybackFormat(AudioFormat),
    ClearPlayback,
    CloseSocket,
    PublishStatus(ConnectionStatus),
    ForwardTranscript(Transcript),
    ReportError(ClientError),
    ResolveConnect,
    RejectConnect(ClientError),
}

pub struct SessionMachine {
    state: SessionState,
    config: Option<SessionConfiguration>,
    start_sent: bool,
    socket_open: bool,
    intentional_disconnect: bool,
    connect_pending: bool,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
}

impl SessionMachine {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            state: SessionState::Idle,
            config: None,
            start_sent: false,
            socket_open: false,
            intentional_disconnect: false,
            connect_pending: false,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        match event {
            SessionEvent::Connect(config) => self.on_connect(config),
            SessionEvent::SocketOpened => self.on_socket_opened(),
            SessionEvent::Message(message) => self.on_message(message),
            SessionEvent::Malformed(detail) if self.state.is_live() => {
                vec![Action::ReportError(ClientError::Decode(format!(
                    "malformed server message: {}",
                    detail
                )))]
            }
            SessionEvent::Malformed(_) => Vec::new(),
            SessionEvent::CaptureFrame(frame) => self.on_capture_frame(frame),
            SessionEvent::CaptureFailed(reason) => {
                self.fail(ClientError::DeviceUnavailable(reason))
            }
            SessionEvent::SocketClosed { code, reason } => {
                let err = ClientError::from(TransportError::Closed { code, reason });
                self.on_connection_lost(err, false)
            }
            SessionEvent::TransportFailed(reason) => {
                self.on_connection_lost(ClientError::Transport(reason), true)
            }
            SessionEvent::ConnectTimeout if self.state == SessionState::Connecting => {
                self.on_connection_lost(ClientError::ConnectTimeout, true)
            }
            SessionEvent::ConnectTimeout => Vec::new(),
            SessionEvent::ReconnectDue
                if self.state == SessionState::Connecting && !self.socket_open =>
            {
                vec![Action::OpenSocket]
            }
            SessionEvent::ReconnectDue => Vec::new(),
            SessionEvent::StopRequested | SessionEvent::DisconnectRequested => {
                self.on_local_stop()
            }
        }
    }

    fn on_connect(&mut self, config: SessionConfiguration) -> Vec<Action> {
        if self.state != SessionState::Idle {
            log::warn!("Session: connect ignored in state {}", self.state);
            return Vec::new();
        }
        self.config = Some(config);
        self.intentional_disconnect = false;
        self.reconnect_attempts = 0;
        self.connect_pending = true;
        self.state = SessionState::Connecting;
        vec![
            Action::PublishStatus(ConnectionStatus::connecting()),
            Action::OpenSocket,
        ]
    }

    fn on_socket_opened(&mut self) -> Vec<Action> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }
        self.socket_open = true;
        self.start_sent = false;
        self.state = SessionState::AwaitingReady;
        vec![Action::ClearTimers]
    }

    fn on_message(&mut self, message: ProtocolMessage) -> Vec<Action> {
        match message {
            ProtocolMessage::Ready => self.on_ready(),
            ProtocolMessage::AudioConfigStart {
                output_audio_config,
                ..
            } => match self.state {
                SessionState::AwaitingAudioConfig => {
                    self.state = SessionState::Active;
                    self.reconnect_attempts = 0;
                    let mut actions = vec![Action::SetPlaybackFormat(
                        AudioFormat::from_announced(&output_audio_config),
                    )];
                    if self.connect_pending {
                        self.connect_pending = false;
                        actions.push(Action::ResolveConnect);
                    }
                    actions.push(Action::PublishStatus(ConnectionStatus::connected()));
                    actions
                }
                SessionState::AwaitingReady => self.fail(ClientError::ProtocolViolation(
                    "AUDIO_CONFIG_START received before READY".to_string(),
                )),
                SessionState::Active => vec![Action::SetPlaybackFormat(
                    AudioFormat::from_announced(&output_audio_config),
                )],
                _ => Vec::new(),
            },
            ProtocolMessage::Audio { data } => {
                if self.state == SessionState::Active {
                    vec![Action::EnqueueAudio(data)]
                } else {
                    log::debug!("Session: dropping AUDIO received in state {}", self.state);
                    Vec::new()
                }
            }
            ProtocolMessage::Transcript(transcript) => {
                if self.state == SessionState::Active {
                    vec![Action::ForwardTranscript(transcript)]
                } else {
                    log::debug!("Session: dropping TRANSCRIPT in state {}", self.state);
                    Vec::new()
                }
            }
            ProtocolMessage::Stop => self.on_remote_stop(),
            ProtocolMessage::Error { error } => self.on_remote_error(error),
            ProtocolMessage::Start(_) => {
                log::warn!("Session: ignoring START sent by the server");
                Vec::new()
            }
        }
    }

    fn on_ready(&mut self) -> Vec<Action> {
        if self.state != SessionState::AwaitingReady || self.start_sent {
            log::warn!("Session: duplicate READY ignored in state {}", self.state);
            return Vec::new();
        }
        let Some(config) = self.config.clone() else {
            return self.fail(ClientError::ProtocolViolation(
                "READY received without a session configuration".to_string(),
            ));
        };
        self.start_sent = true;
        self.state = SessionState::AwaitingAudioConfig;
        vec![
            Action::Send(ProtocolMessage::Start(config)),
            Action::StartCapture,
        ]
    }

    fn on_capture_frame(&mut self, frame: Vec<u8>) -> Vec<Action> {
        if self.state == SessionState::Active && self.socket_open {
            vec![Action::Send(ProtocolMessage::Audio {
                data: codec::encode_frame(&frame),
            })]
        } else {
            log::debug!("Session: dropping captured frame in state {}", self.state);
            Vec::new()
        }
    }

    fn on_remote_stop(&mut self) -> Vec<Action> {
        if !matches!(
            self.state,
            SessionState::AwaitingReady | SessionState::AwaitingAudioConfig | SessionState::Active
        ) {
            return Vec::new();
        }
        log::info!("Session: server requested stop");
        self.intentional_disconnect = true;
        self.state = SessionState::Stopping;
        let mut actions = self.teardown();
        actions.extend(self.reject(ClientError::StoppedBeforeActive));
        actions.push(Action::PublishStatus(ConnectionStatus::idle()));
        self.state = SessionState::Closed;
        actions
    }

    fn on_remote_error(&mut self, error: String) -> Vec<Action> {
        if !self.state.is_live() {
            return Vec::new();
        }
        log::error!("Session: server reported error: {}", error);
        self.intentional_disconnect = true;
        let err = ClientError::Remote(error.clone());
        let mut actions = vec![
            Action::PublishStatus(ConnectionStatus::failed(error)),
            Action::ReportError(err.clone()),
        ];
        actions.extend(self.teardown());
        actions.extend(self.reject(err));
        self.state = SessionState::Error;
        actions
    }

    fn on_local_stop(&mut self) -> Vec<Action> {
        if !self.state.is_live() {
            log::debug!("Session: stop ignored in state {}", self.state);
            return Vec::new();
        }
        log::info!("Session: stopping conversation");
        self.intentional_disconnect = true;
        self.state = SessionState::Stopping;
        let mut actions = Vec::new();
        if self.socket_open {
            actions.push(Action::Send(ProtocolMessage::Stop));
        }
        actions.extend(self.teardown());
        actions.extend(self.reject(ClientError::StoppedBeforeActive));
        actions.push(Action::PublishStatus(ConnectionStatus::idle()));
        self.state = SessionState::Closed;
        actions
    }

    /// Socket closed, transport failure or handshake timeout.
    fn on_connection_lost(&mut self, err: ClientError, report: bool) -> Vec<Action> {
        if !self.state.is_live() {
            return Vec::new();
        }
        log::warn!("Session: connection lost in state {}: {}", self.state, err);

        let mut actions = vec![Action::PublishStatus(ConnectionStatus::failed(
            err.to_string(),
        ))];
        if report {
            actions.push(Action::ReportError(err.clone()));
        }
        actions.extend(self.teardown());

        if !self.intentional_disconnect && self.reconnect_attempts < self.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            log::info!(
                "Session: attempting to reconnect ({}/{})",
                self.reconnect_attempts,
                self.max_reconnect_attempts
            );
            self.state = SessionState::Connecting;
            actions.push(Action::PublishStatus(ConnectionStatus::connecting()));
            actions.push(Action::ScheduleReconnect {
                attempt: self.reconnect_attempts,
            });
        } else {
            let terminal = ClientError::ReconnectExhausted {
                attempts: self.reconnect_attempts,
                last_error: err.to_string(),
            };
            log::error!("Session: {}", terminal);
            actions.push(Action::PublishStatus(ConnectionStatus::failed(
                terminal.to_string(),
            )));
            actions.push(Action::ReportError(terminal.clone()));
            actions.extend(self.reject(terminal));
            self.state = SessionState::Error;
        }
        actions
    }

    /// Fatal local failure: no reconnection.
    fn fail(&mut self, err: ClientError) -> Vec<Action> {
        if !self.state.is_live() {
            return Vec::new();
        }
        log::error!("Session: {}", err);
        self.intentional_disconnect = true;
        let mut actions = vec![
            Action::PublishStatus(ConnectionStatus::failed(err.to_string())),
            Action::ReportError(err.clone()),
        ];
        if self.socket_open {
            actions.push(Action::Send(ProtocolMessage::Stop));
        }
        actions.extend(self.teardown());
        actions.extend(self.reject(err));
        self.state = SessionState::Error;
        actions
    }

    fn teardown(&mut self) -> Vec<Action> {
        self.socket_open = false;
        self.start_sent = false;
        vec![
            Action::StopCapture,
            Action::ClearPlayback,
            Action::ClearTimers,
            Action::CloseSocket,
        ]
    }

    fn reject(&mut self, err: ClientError) -> Vec<Action> {
        if self.connect_pending {
            self.connect_pending = false;
            vec![Action::RejectConnect(err)]
        } else {
            Vec::new()
        }
    }
}

type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(Transcript) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// One subscriber per channel; registering again replaces the previous one.
#[derive(Default)]
pub(crate) struct SessionCallbacks {
    status: Mutex<Option<StatusCallback>>,
    message: Mutex<Option<MessageCallback>>,
    error: Mutex<Option<ErrorCallback>>,
    last_status: Mutex<ConnectionStatus>,
}

impl SessionCallbacks {
    pub(crate) fn set_status(&self, callback: StatusCallback) {
        *lock(&self.status) = Some(callback);
    }

    pub(crate) fn set_message(&self, callback: MessageCallback) {
        *lock(&self.message) = Some(callback);
    }

    pub(crate) fn set_error(&self, callback: ErrorCallback) {
        *lock(&self.error) = Some(callback);
    }

    pub(crate) fn last_status(&self) -> ConnectionStatus {
        lock(&self.last_status).clone()
    }

    fn publish_status(&self, status: ConnectionStatus) {
        log::debug!("Session: status {:?}", status);
        *lock(&self.last_status) = status.clone();
        // Clone out so a callback may re-register without deadlocking.
        let callback = lock(&self.status).clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn forward_transcript(&self, transcript: Transcript) {
        let callback = lock(&self.message).clone();
        if let Some(callback) = callback {
            callback(transcript);
        }
    }

    fn report_error(&self, err: &ClientError) {
        let callback = lock(&self.error).clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

pub(crate) enum Command {
    Stop,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Handshake,
    Reconnect,
}

/// Everything a session needs, handed over by the client on `connect()`.
pub(crate) struct SessionSetup {
    pub settings: ClientConfig,
    pub url: Url,
    pub transport: Arc<dyn Transport>,
    pub capture: Box<dyn AudioCapture>,
    pub sink: Arc<dyn AudioSink>,
    pub transcoder: Arc<dyn PcmTranscoder>,
    pub callbacks: Arc<SessionCallbacks>,
}

pub(crate) struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn send(&self, command: Command) {
        // The driver is gone once the session has finished.
        let _ = self.commands.send(command);
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

/// Spawn the driver for one session. The receiver completes when the session
/// becomes active or fails before that.
pub(crate) fn spawn_session(
    setup: SessionSetup,
    config: SessionConfiguration,
) -> (SessionHandle, oneshot::Receiver<Result<()>>) {
    let (command_sender, commands) = mpsc::unbounded_channel();
    let (state_sender, state) = watch::channel(SessionState::Idle);
    let (pending, completion) = oneshot::channel();
    let (frame_sender, frames) = mpsc::unbounded_channel();
    let (playback, playback_errors) = PlaybackQueue::new(
        setup.sink,
        setup.transcoder,
        setup.settings.playback_sample_rate,
    );

    let driver = SessionDriver {
        machine: SessionMachine::new(setup.settings.max_reconnect_attempts),
        settings: setup.settings,
        url: setup.url,
        transport: setup.transport,
        capture: Some(setup.capture),
        playback,
        playback_errors,
        callbacks: setup.callbacks,
        commands,
        frames,
        frame_sender,
        socket: None,
        opening: None,
        timer: None,
        pending: Some(pending),
        state: state_sender,
    };
    let task = tokio::spawn(driver.run(config));

    (
        SessionHandle {
            commands: command_sender,
            state,
            task: Some(task),
        },
        completion,
    )
}

struct SessionDriver {
    machine: SessionMachine,
    settings: ClientConfig,
    url: Url,
    transport: Arc<dyn Transport>,
    capture: Option<Box<dyn AudioCapture>>,
    playback: PlaybackQueue,
    playback_errors: mpsc::UnboundedReceiver<ClientError>,
    callbacks: Arc<SessionCallbacks>,
    commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    frame_sender: mpsc::UnboundedSender<Vec<u8>>,
    socket: Option<Box<dyn Socket>>,
    opening: Option<BoxFuture<'static, std::result::Result<Box<dyn Socket>, TransportError>>>,
    timer: Option<(Instant, Timer)>,
    pending: Option<oneshot::Sender<Result<()>>>,
    state: watch::Sender<SessionState>,
}

impl SessionDriver {
    async fn run(mut self, config: SessionConfiguration) {
        log::info!("Session: starting session for {}", self.url);
        self.dispatch(SessionEvent::Connect(config)).await;

        while !self.machine.is_finished() {
            if let Some(event) = self.next_event().await {
                self.dispatch(event).await;
            }
        }

        self.release().await;
        log::info!("Session: finished in state {}", self.machine.state());
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        let deadline = self.timer.map(|(at, _)| at);

        tokio::select! {
            command = self.commands.recv() => Some(match command {
                Some(Command::Stop) => SessionEvent::StopRequested,
                // A dropped client disconnects.
                Some(Command::Disconnect) | None => SessionEvent::DisconnectRequested,
            }),
            opened = Self::poll_opening(&mut self.opening), if self.opening.is_some() => {
                Some(match opened {
                    Ok(socket) => {
                        log::info!("Session: socket open");
                        self.socket = Some(socket);
                        SessionEvent::SocketOpened
                    }
                    Err(e) => SessionEvent::TransportFailed(e.to_string()),
                })
            }
            event = Self::poll_socket(&mut self.socket), if self.socket.is_some() => {
                match event {
                    Some(SocketEvent::Message(text)) => match ProtocolMessage::parse(&text) {
                        Inbound::Message(message) => {
                            log::debug!("Session: received {}", message.kind());
                            Some(SessionEvent::Message(message))
                        }
                        Inbound::Unknown(kind) => {
                            log::debug!("Session: ignoring message type {}", kind);
                            None
                        }
                        Inbound::Malformed(detail) => Some(SessionEvent::Malformed(detail)),
                    },
                    Some(SocketEvent::Closed { code, reason }) => {
                        log::info!("Session: socket closed: {} {}", code, reason);
                        Some(SessionEvent::SocketClosed { code, reason })
                    }
                    Some(SocketEvent::Error(e)) => Some(SessionEvent::TransportFailed(e)),
                    None => Some(SessionEvent::SocketClosed {
                        code: crate::transport::ABNORMAL_CLOSURE,
                        reason: String::new(),
                    }),
                }
            }
            Some(frame) = self.frames.recv() => Some(SessionEvent::CaptureFrame(frame)),
            Some(err) = self.playback_errors.recv() => {
                self.callbacks.report_error(&err);
                None
            }
            _ = Self::sleep_until(deadline), if deadline.is_some() => {
                match self.timer.take() {
                    Some((_, Timer::Handshake)) => {
                        log::warn!("Session: connection timeout");
                        Some(SessionEvent::ConnectTimeout)
                    }
                    Some((_, Timer::Reconnect)) => Some(SessionEvent::ReconnectDue),
                    None => None,
                }
            }
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(action).await {
                    events.push_back(follow_up);
                }
            }
        }
        self.state.send_replace(self.machine.state());
    }

    async fn execute(&mut self, action: Action) -> Option<SessionEvent> {
        match action {
            Action::OpenSocket => {
                self.close_socket().await;
                let transport = Arc::clone(&self.transport);
                let url = self.url.clone();
                self.opening = Some(Box::pin(async move { transport.open(&url).await }));
                self.timer = Some((
                    Instant::now() + self.settings.connect_timeout,
                    Timer::Handshake,
                ));
            }
            Action::ScheduleReconnect { attempt } => {
                let delay = self.settings.reconnect_delay(attempt);
                log::info!("Session: reconnect attempt {} in {:?}", attempt, delay);
                self.timer = Some((Instant::now() + delay, Timer::Reconnect));
            }
            Action::ClearTimers => self.timer = None,
            Action::Send(message) => {
                let Some(socket) = self.socket.as_mut() else {
                    log::warn!("Session: no socket to send {}", message.kind());
                    return None;
                };
                log::debug!("Session: sending {}", message.kind());
                if let Err(e) = socket.send(message.to_json()).await {
                    log::error!("Session: send failed: {}", e);
                    return Some(SessionEvent::TransportFailed(e.to_string()));
                }
            }
            Action::StartCapture => {
                let frames = self.frame_sender.clone();
                let on_frame = Box::new(move |frame: Vec<u8>| {
                    let _ = frames.send(frame);
                });
                match self.with_capture(move |capture| capture.start(on_frame)).await {
                    Some(Ok(())) => log::info!("Session: microphone capture started"),
                    Some(Err(e)) => return Some(SessionEvent::CaptureFailed(e.to_string())),
                    None => {
                        return Some(SessionEvent::CaptureFailed("microphone unavailable".into()))
                    }
                }
            }
            Action::StopCapture => {
                self.with_capture(|capture| capture.stop()).await;
                while self.frames.try_recv().is_ok() {}
            }
            Action::EnqueueAudio(data) => self.playback.enqueue(data),
            Action::SetPlaybackFormat(format) => self.playback.set_source_format(format),
            Action::ClearPlayback => self.playback.clear(),
            Action::CloseSocket => self.close_socket().await,
            Action::PublishStatus(status) => self.callbacks.publish_status(status),
            Action::ForwardTranscript(transcript) => self.callbacks.forward_transcript(transcript),
            Action::ReportError(err) => self.callbacks.report_error(&err),
            Action::ResolveConnect => {
                if let Some(pending) = self.pending.take() {
                    let _ = pending.send(Ok(()));
                }
            }
            Action::RejectConnect(err) => {
                if let Some(pending) = self.pending.take() {
                    let _ = pending.send(Err(err));
                }
            }
        }
        None
    }

    /// Run a call against the microphone on the blocking pool.
    async fn with_capture<R, F>(&mut self, call: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Box<dyn AudioCapture>) -> R + Send + 'static,
    {
        let mut capture = self.capture.take()?;
        let outcome = tokio::task::spawn_blocking(move || {
            let result = call(&mut capture);
            (capture, result)
        })
        .await;
        match outcome {
            Ok((capture, result)) => {
                self.capture = Some(capture);
                Some(result)
            }
            Err(e) => {
                log::error!("Session: microphone task failed: {}", e);
                None
            }
        }
    }

    async fn close_socket(&mut self) {
        self.opening = None;
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    /// Release everything the session owns.
    async fn release(&mut self) {
        self.with_capture(|capture| capture.stop()).await;
        self.close_socket().await;
        self.timer = None;
        self.playback.shutdown().await;
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(Err(ClientError::SessionFinished));
        }
        self.state.send_replace(self.machine.state());
    }

    async fn poll_opening(
        opening: &mut Option<BoxFuture<'static, std::result::Result<Box<dyn Socket>, TransportError>>>,
    ) -> std::result::Result<Box<dyn Socket>, TransportError> {
        match opening.as_mut() {
            Some(future) => {
                let result = future.await;
                *opening = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    async fn poll_socket(socket: &mut Option<Box<dyn Socket>>) -> Option<SocketEvent> {
        match socket.as_mut() {
            Some(socket) => socket.next_event().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_until(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
