//! Per-connection room session.
//!
//! A [`RoomSession`] reads client requests one at a time and drives the
//! room's current [`LangRuntime`]. Responses and stdout events go through a
//! bounded outbound queue that the socket writer drains in order.

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LangConfig;
use crate::error::RuntimeError;
use crate::naming::SeqCounter;
use crate::protocol::{CodeId, ErrorCode, RunEnv, ServiceRequest, ServiceResponse};
use crate::runtime::{LangRuntime, RuntimeListener};
use crate::sandbox::ExecutionBackend;

/// Capacity of the per-session outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Largest ping/pong payload accepted from a client.
pub const MAX_CONTROL_FRAME: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Resetting,
    Ready,
    Destroying,
}

/// Runtime-facing handle onto the session's outbound queue.
struct SessionListener {
    room_key: String,
    backend: Arc<dyn ExecutionBackend>,
    config: Arc<LangConfig>,
    outbound: mpsc::Sender<ServiceResponse>,
}

#[async_trait]
impl RuntimeListener for SessionListener {
    fn room_key(&self) -> &str {
        &self.room_key
    }

    fn backend(&self) -> Arc<dyn ExecutionBackend> {
        Arc::clone(&self.backend)
    }

    fn lang_config(&self) -> Arc<LangConfig> {
        Arc::clone(&self.config)
    }

    async fn write_stdout(&self, id: CodeId, data: String) {
        if self
            .outbound
            .send(ServiceResponse::stdout(id, data))
            .await
            .is_err()
        {
            debug!(room_key = %self.room_key, "Outbound queue closed, stdout dropped");
        }
    }

    async fn run_failed(&self, code: ErrorCode) {
        if self.outbound.send(ServiceResponse::run_err(code)).await.is_err() {
            debug!(room_key = %self.room_key, "Outbound queue closed, run error dropped");
        }
    }
}

enum Inbound {
    Request(ServiceRequest),
    Skip,
    Close,
}

pub struct RoomSession {
    room_key: String,
    backend: Arc<dyn ExecutionBackend>,
    config: Arc<LangConfig>,
    outbound: mpsc::Sender<ServiceResponse>,
    cancel: CancellationToken,
    state: SessionState,
    seq: SeqCounter,
    runtime: Option<Arc<LangRuntime>>,
}

impl RoomSession {
    pub fn new(
        room_key: impl Into<String>,
        backend: Arc<dyn ExecutionBackend>,
        config: Arc<LangConfig>,
        outbound: mpsc::Sender<ServiceResponse>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            room_key: room_key.into(),
            backend,
            config,
            outbound,
            cancel,
            state: SessionState::None,
            seq: SeqCounter::default(),
            runtime: None,
        }
    }

    pub fn room_key(&self) -> &str {
        &self.room_key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn runtime(&self) -> Option<&Arc<LangRuntime>> {
        self.runtime.as_ref()
    }

    pub async fn send(&self, response: ServiceResponse) {
        if self.outbound.send(response).await.is_err() {
            debug!(room_key = %self.room_key, "Outbound queue closed");
        }
    }

    /// Handle one request according to the current state.
    pub async fn on_request(&mut self, request: ServiceRequest) {
        debug!(room_key = %self.room_key, kind = request.kind(), state = ?self.state, "Request");
        match (self.state, request) {
            (SessionState::Destroying, _) => {}
            (SessionState::Resetting, request) => {
                debug!(room_key = %self.room_key, kind = request.kind(), "Dropped during reset");
            }
            (_, ServiceRequest::Reset(run_env)) => self.reset(run_env).await,
            (SessionState::None, request) => {
                warn!(room_key = %self.room_key, kind = request.kind(), "Request before reset");
                self.send(ServiceResponse::reset(Err(ErrorCode::ErrServiceInternal)))
                    .await;
            }
            (SessionState::Ready, ServiceRequest::WinSize(size)) => {
                if let Some(runtime) = &self.runtime {
                    runtime.set_repl_win_size(size).await;
                }
                self.send(ServiceResponse::win_size(size)).await;
            }
            (SessionState::Ready, ServiceRequest::Stdin(data)) => {
                if let Some(runtime) = &self.runtime {
                    runtime.send_repl_stdin(&data).await;
                }
            }
            (SessionState::Ready, ServiceRequest::Run(code)) => {
                let Some(runtime) = &self.runtime else { return };
                if let Err(e) = runtime.run_code(&code).await {
                    warn!(room_key = %self.room_key, code_id = code.id, error = %e, "Run failed");
                    self.send(ServiceResponse::run_err(e.code())).await;
                }
            }
        }
    }

    async fn reset(&mut self, run_env: RunEnv) {
        self.state = SessionState::Resetting;
        let language = run_env.language.clone();
        match self.do_reset(run_env).await {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!(room_key = %self.room_key, language = %language, "Session reset");
                self.send(ServiceResponse::reset(Ok(()))).await;
            }
            Err(e) => {
                self.state = SessionState::None;
                error!(room_key = %self.room_key, language = %language, error = %e, "Reset failed");
                self.send(ServiceResponse::reset(Err(e.code()))).await;
            }
        }
    }

    /// Replace the current runtime with a fresh one for `run_env`.
    pub async fn do_reset(&mut self, run_env: RunEnv) -> Result<(), RuntimeError> {
        if let Some(runtime) = self.runtime.take() {
            runtime.stop().await;
        }

        let listener = Arc::new(SessionListener {
            room_key: self.room_key.clone(),
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
            outbound: self.outbound.clone(),
        });
        let seq_no = self.seq.next_seq_no();
        let runtime = LangRuntime::new(seq_no, run_env, listener, self.cancel.child_token())?;
        self.runtime = Some(Arc::clone(&runtime));

        if let Err(e) = runtime.start().await {
            runtime.stop().await;
            self.runtime = None;
            return Err(e);
        }
        Ok(())
    }

    /// Process inbound frames until the client goes away, sends something
    /// unacceptable, or the session is cancelled.
    pub async fn read_loop<S>(&mut self, mut inbound: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = inbound.next() => frame,
                _ = self.cancel.cancelled() => break,
            };
            match classify(&self.room_key, frame) {
                Inbound::Request(ServiceRequest::Reset(run_env))
                    if self.state != SessionState::Destroying =>
                {
                    if !self.reset_draining(run_env, &mut inbound).await {
                        break;
                    }
                }
                Inbound::Request(request) => self.on_request(request).await,
                Inbound::Skip => {}
                Inbound::Close => break,
            }
        }
        debug!(room_key = %self.room_key, "Read loop finished");
    }

    /// Run a reset while reading and dropping whatever the client sends
    /// meanwhile. Returns false if the connection closed during the reset.
    async fn reset_draining<S>(&mut self, run_env: RunEnv, inbound: &mut S) -> bool
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let room_key = self.room_key.clone();
        let cancel = self.cancel.clone();
        let reset = self.reset(run_env);
        tokio::pin!(reset);

        let mut open = true;
        loop {
            tokio::select! {
                _ = &mut reset => return open,
                frame = inbound.next(), if open => match classify(&room_key, frame) {
                    Inbound::Request(request) => {
                        debug!(room_key = %room_key, kind = request.kind(), "Dropped during reset");
                    }
                    Inbound::Skip => {}
                    Inbound::Close => {
                        open = false;
                        cancel.cancel();
                    }
                },
            }
        }
    }

    /// Stop the runtime and enter the terminal state.
    pub async fn on_destroy(&mut self) {
        if self.state == SessionState::Destroying {
            return;
        }
        self.state = SessionState::Destroying;
        if let Some(runtime) = self.runtime.take() {
            runtime.stop().await;
        }
        self.cancel.cancel();
        info!(room_key = %self.room_key, "Session destroyed");
    }
}

fn classify(room_key: &str, frame: Option<Result<Message, axum::Error>>) -> Inbound {
    match frame {
        None => Inbound::Close,
        Some(Err(e)) => {
            debug!(room_key, error = %e, "Socket read failed");
            Inbound::Close
        }
        Some(Ok(Message::Text(text))) => match ServiceRequest::parse(&text) {
            Ok(request) => Inbound::Request(request),
            Err(e) => {
                warn!(room_key, error = %e, "Malformed request");
                Inbound::Close
            }
        },
        Some(Ok(Message::Binary(_))) => {
            warn!(room_key, "Binary frame not supported");
            Inbound::Close
        }
        Some(Ok(Message::Ping(data) | Message::Pong(data))) => {
            if data.len() > MAX_CONTROL_FRAME {
                warn!(room_key, len = data.len(), "Control frame too large");
                Inbound::Close
            } else {
                Inbound::Skip
            }
        }
        Some(Ok(Message::Close(_))) => Inbound::Close,
    }
}
