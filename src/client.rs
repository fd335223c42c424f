//! Public entry point for one voice conversation.

use std::sync::{Arc, Mutex};

use crate::audio_sink::{AudioSink, CpalSink};
use crate::capture::{AudioCapture, CpalCapture};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lock;
use crate::protocol::{SessionConfiguration, Transcript};
use crate::resample::{PcmTranscoder, RubatoTranscoder};
use crate::session::{self, Command, SessionCallbacks, SessionHandle, SessionSetup};
use crate::transport::{Transport, WsTransport};

pub use crate::session::{ConnectionStatus, SessionState};

/// Swappable collaborators of a client. [`ConversationClient::new`] uses the
/// real WebSocket, microphone and speaker.
pub struct ClientParts {
    pub transport: Arc<dyn Transport>,
    pub capture: Box<dyn AudioCapture>,
    pub sink: Arc<dyn AudioSink>,
    pub transcoder: Arc<dyn PcmTranscoder>,
}

impl ClientParts {
    pub fn system_default(config: &ClientConfig) -> Self {
        Self {
            transport: Arc::new(WsTransport::new()),
            capture: Box::new(CpalCapture::new(config.capture.clone())),
            sink: Arc::new(CpalSink::new()),
            transcoder: Arc::new(RubatoTranscoder::new()),
        }
    }
}

/// Drives a single conversation with a hosted agent.
///
/// A client runs at most one session. Once that session has been
/// disconnected, stopped or has failed, `connect` returns
/// [`ClientError::SessionFinished`] and a new client is needed.
pub struct ConversationClient {
    client_id: String,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn AudioSink>,
    transcoder: Arc<dyn PcmTranscoder>,
    capture: Mutex<Option<Box<dyn AudioCapture>>>,
    callbacks: Arc<SessionCallbacks>,
    session: Mutex<Option<SessionHandle>>,
}

impl ConversationClient {
    pub fn new(client_id: impl Into<String>, config: ClientConfig) -> Self {
        let parts = ClientParts::system_default(&config);
        Self::with_parts(client_id, config, parts)
    }

    pub fn with_parts(client_id: impl Into<String>, config: ClientConfig, parts: ClientParts) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            transport: parts.transport,
            sink: parts.sink,
            transcoder: parts.transcoder,
            capture: Mutex::new(Some(parts.capture)),
            callbacks: Arc::new(SessionCallbacks::default()),
            session: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Receive every status transition. Replaces any earlier subscriber.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.callbacks.set_status(Arc::new(callback));
    }

    /// Receive transcripts while the session is active.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(Transcript) + Send + Sync + 'static,
    {
        self.callbacks.set_message(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.callbacks.set_error(Arc::new(callback));
    }

    /// Open the session and complete the handshake.
    ///
    /// Resolves once the server has announced its audio configuration, and
    /// fails if the session ends before that, including after reconnection
    /// attempts are used up.
    pub async fn connect(&self, session_config: SessionConfiguration) -> Result<()> {
        let completion = {
            let mut slot = lock(&self.session);
            if let Some(handle) = slot.as_ref() {
                return Err(if handle.state().is_terminal() {
                    ClientError::SessionFinished
                } else {
                    ClientError::AlreadyConnected
                });
            }

            let url = self.config.session_url(&self.client_id)?;
            let capture = lock(&self.capture)
                .take()
                .ok_or(ClientError::SessionFinished)?;

            let setup = SessionSetup {
                settings: self.config.clone(),
                url,
                transport: Arc::clone(&self.transport),
                capture,
                sink: Arc::clone(&self.sink),
                transcoder: Arc::clone(&self.transcoder),
                callbacks: Arc::clone(&self.callbacks),
            };
            let (handle, completion) = session::spawn_session(setup, session_config);
            *slot = Some(handle);
            completion
        };

        completion
            .await
            .unwrap_or_else(|_| Err(ClientError::ConnectionClosed("session task ended".into())))
    }

    /// End the conversation: notify the server, release the microphone and
    /// speaker and close the socket. Safe to call at any time, any number of
    /// times.
    pub fn disconnect(&self) {
        if let Some(handle) = lock(&self.session).as_ref() {
            handle.send(Command::Disconnect);
        }
    }

    /// Ask the server to stop and release local audio resources.
    pub fn stop_conversation(&self) {
        if let Some(handle) = lock(&self.session).as_ref() {
            handle.send(Command::Stop);
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session)
            .as_ref()
            .map(|handle| handle.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Most recently published status.
    pub fn status(&self) -> ConnectionStatus {
        self.callbacks.last_status()
    }

    /// Wait until the session has finished and released its resources.
    /// Returns immediately if no session was started.
    pub async fn closed(&self) {
        let (mut state, task) = {
            let mut slot = lock(&self.session);
            match slot.as_mut() {
                Some(handle) => (handle.state_receiver(), handle.take_task()),
                None => return,
            }
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Client: session task failed: {}", e);
            }
        } else if let Err(e) = state.wait_for(|s| s.is_terminal()).await {
            log::debug!("Client: session state channel closed: {}", e);
        }
    }
}

impl Drop for ConversationClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
