//! One language runtime instance of a room.
//!
//! A [`LangRuntime`] owns up to four backend resources (network, service,
//! REPL and code process), streams their output to its [`RuntimeListener`]
//! and destroys all of them on [`LangRuntime::stop`]. The session creates a
//! fresh runtime on every reset.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CommandTemplate, LangConfig, LanguageProfile, ResourceLimits};
use crate::error::RuntimeError;
use crate::naming::{self, RunType, RuntimeNames};
use crate::protocol::{Code, CodeId, ErrorCode, RunEnv, WinSize, SYSTEM_CODE_ID};
use crate::sandbox::{ExecutionBackend, InputSink, OutputStream, ProcessLimits, ProcessSpec};
use crate::terminal::{self, OutputDecoder};

/// Directory inside the sandbox that receives the request file.
pub const REQUEST_DIR: &str = "/home/ye";

const REPL_RESTART_DELAY: Duration = Duration::from_secs(2);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a runtime needs from its owner.
#[async_trait]
pub trait RuntimeListener: Send + Sync {
    fn room_key(&self) -> &str;

    fn backend(&self) -> Arc<dyn ExecutionBackend>;

    fn lang_config(&self) -> Arc<LangConfig>;

    /// Deliver one stdout event to the room client.
    async fn write_stdout(&self, id: CodeId, data: String);

    /// Report a program that could not be launched outside a run request.
    async fn run_failed(&self, code: ErrorCode);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Creating,
    Running,
    Stopping,
}

/// Backend ids currently owned by a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIds {
    pub network: Option<String>,
    pub service: Option<String>,
    pub repl: Option<String>,
    pub code: Option<String>,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    language: &'a str,
    files: Vec<SourceFile<'a>>,
}

#[derive(Serialize)]
struct SourceFile<'a> {
    name: String,
    content: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Exited,
    /// Waiting failed, the process may still be alive.
    Lost,
    TimedOut,
    Cancelled,
}

pub struct LangRuntime {
    seq_no: u32,
    room_key: String,
    language: String,
    names: RuntimeNames,
    profile: LanguageProfile,
    limits: ResourceLimits,
    boot: Option<Code>,
    backend: Arc<dyn ExecutionBackend>,
    listener: RwLock<Option<Arc<dyn RuntimeListener>>>,
    status: watch::Sender<RuntimeStatus>,
    slots: Mutex<ResourceIds>,
    repl_stdin: Mutex<Option<InputSink>>,
    win_size: Mutex<WinSize>,
    cancel: CancellationToken,
}

impl fmt::Debug for LangRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LangRuntime")
            .field("room_key", &self.room_key)
            .field("seq_no", &self.seq_no)
            .field("language", &self.language)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl LangRuntime {
    /// Build a runtime for `run_env.language`. Nothing is created on the
    /// backend until [`start`](Self::start).
    pub fn new(
        seq_no: u32,
        run_env: RunEnv,
        listener: Arc<dyn RuntimeListener>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RuntimeError> {
        let config = listener.lang_config();
        let profile = config
            .profile(&run_env.language)
            .cloned()
            .ok_or_else(|| RuntimeError::LanguageNotFound(run_env.language.clone()))?;
        let room_key = listener.room_key().to_string();
        let names = RuntimeNames::new(&room_key, seq_no);
        let (status, _) = watch::channel(RuntimeStatus::Creating);

        info!(
            room_key = %room_key,
            seq_no,
            language = %run_env.language,
            "Runtime created"
        );

        Ok(Arc::new(Self {
            seq_no,
            language: run_env.language,
            names,
            profile,
            limits: config.limits.clone(),
            boot: run_env.boot,
            backend: listener.backend(),
            listener: RwLock::new(Some(listener)),
            status,
            slots: Mutex::new(ResourceIds::default()),
            repl_stdin: Mutex::new(None),
            win_size: Mutex::new(run_env.win_size),
            cancel,
            room_key,
        }))
    }

    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    pub fn names(&self) -> &RuntimeNames {
        &self.names
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.borrow()
    }

    pub async fn resource_ids(&self) -> ResourceIds {
        self.slots.lock().await.clone()
    }

    pub async fn win_size(&self) -> WinSize {
        *self.win_size.lock().await
    }

    fn is_stopping(&self) -> bool {
        self.status() == RuntimeStatus::Stopping
    }

    /// Bring up service, boot code and REPL. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let started = self.status.send_if_modified(|status| {
            if *status == RuntimeStatus::Creating {
                *status = RuntimeStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(());
        }

        self.write_stdout(SYSTEM_CODE_ID, terminal::welcome_banner(&self.language))
            .await;

        if let Some(template) = self.profile.service.clone() {
            self.start_service(&template).await?;
            self.write_stdout(SYSTEM_CODE_ID, terminal::service_wait_notice())
                .await;
            let grace = Duration::from_millis(self.limits.service_grace_ms);
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = self.cancel.cancelled() => return Err(RuntimeError::Stopped),
            }
        }

        if let Some(boot) = self.boot.clone() {
            info!(room_key = %self.room_key, seq_no = self.seq_no, "Running boot code");
            match self.run_code(&boot).await {
                Ok(()) => {}
                Err(RuntimeError::Stopped) => return Err(RuntimeError::Stopped),
                Err(e) => {
                    error!(room_key = %self.room_key, error = %e, "Boot code failed to launch");
                    self.run_failed(e.code()).await;
                }
            }
        }

        if self.profile.repl.is_some() {
            let repl_id = self.start_repl().await?;
            tokio::spawn(Arc::clone(self).supervise_repl(repl_id));
        }

        info!(room_key = %self.room_key, seq_no = self.seq_no, "Runtime started");
        Ok(())
    }

    /// Destroy every owned resource. Each step runs even if an earlier one
    /// failed; the listener is released last.
    pub async fn stop(&self) {
        let stopping = self.status.send_if_modified(|status| {
            if *status != RuntimeStatus::Stopping {
                *status = RuntimeStatus::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return;
        }
        info!(room_key = %self.room_key, seq_no = self.seq_no, "Stopping runtime");

        self.stop_code().await;
        self.stop_repl().await;
        self.stop_service().await;
        self.remove_network().await;

        self.cancel.cancel();
        *self.listener.write().await = None;
        info!(room_key = %self.room_key, seq_no = self.seq_no, "Runtime stopped");
    }

    pub async fn set_repl_win_size(&self, size: WinSize) {
        *self.win_size.lock().await = size;
        let repl = self.slots.lock().await.repl.clone();
        if let Some(id) = repl {
            self.resize_repl(&id, size).await;
        }
    }

    /// Forward raw input to the REPL; dropped when no REPL is attached.
    pub async fn send_repl_stdin(&self, data: &str) {
        let mut stdin = self.repl_stdin.lock().await;
        let Some(sink) = stdin.as_mut() else {
            debug!(room_key = %self.room_key, "No repl attached, stdin dropped");
            return;
        };
        let written = match sink.write_all(data.as_bytes()).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(room_key = %self.room_key, error = %e, "Failed to write repl stdin");
            *stdin = None;
        }
    }

    /// Execute one program. Output arrives as stdout events with `code.id`,
    /// followed by a finished or timeout banner on the system channel.
    pub async fn run_code(self: &Arc<Self>, code: &Code) -> Result<(), RuntimeError> {
        let template = self
            .profile
            .run
            .clone()
            .ok_or_else(|| RuntimeError::Unsupported(self.language.clone(), "run"))?;

        let request = RunRequest {
            language: &code.language,
            files: vec![SourceFile {
                name: format!("{}{}", code.filename, self.profile.ext),
                content: &code.content,
            }],
        };
        let payload = serde_json::to_vec(&request)?;

        let id = {
            let mut slots = self.slots.lock().await;
            if slots.code.is_some() {
                return Err(RuntimeError::AlreadyRunning);
            }
            if self.is_stopping() {
                return Err(RuntimeError::Stopped);
            }
            // A container left behind under this name would block creation.
            self.discard_stale(&self.names.code).await;

            let network = slots.network.as_ref().map(|_| self.names.network.clone());
            let spec = self.process_spec(RunType::Code, &template, template.tty, false, network);
            let id = self.backend.create_process(&spec).await?;
            slots.code = Some(id.clone());
            id
        };
        info!(
            room_key = %self.room_key,
            seq_no = self.seq_no,
            code_id = code.id,
            id = %id,
            "Code process created"
        );

        match self.launch_code(&id, code.id, &payload, template.tty).await {
            Ok((copier, started)) => {
                tokio::spawn(Arc::clone(self).watch_code(id, copier, started));
                Ok(())
            }
            Err(e) => {
                error!(room_key = %self.room_key, id = %id, error = %e, "Failed to launch code");
                self.release_code(&id).await;
                Err(e)
            }
        }
    }

    async fn launch_code(
        self: &Arc<Self>,
        id: &str,
        code_id: CodeId,
        payload: &[u8],
        tty: bool,
    ) -> Result<(JoinHandle<()>, Instant), RuntimeError> {
        self.backend
            .copy_file(id, REQUEST_DIR, &self.names.request_file, payload)
            .await?;
        let stdio = self.backend.attach_process(id, false).await?;
        let copier = tokio::spawn(Arc::clone(self).copy_output(code_id, stdio.output, !tty));

        self.write_stdout(SYSTEM_CODE_ID, terminal::start_banner()).await;
        let started = Instant::now();
        if let Err(e) = self.backend.start_process(id).await {
            copier.abort();
            return Err(e.into());
        }
        Ok((copier, started))
    }

    async fn watch_code(self: Arc<Self>, id: String, copier: JoinHandle<()>, started: Instant) {
        let deadline = started + Duration::from_millis(self.limits.code_timeout_ms);
        let settled = tokio::select! {
            result = self.backend.wait_process(&id) => match result {
                Ok(()) => Settled::Exited,
                Err(e) => {
                    debug!(id = %id, error = %e, "Wait for code process failed");
                    Settled::Lost
                }
            },
            _ = tokio::time::sleep_until(deadline) => Settled::TimedOut,
            _ = self.cancel.cancelled() => Settled::Cancelled,
        };
        let elapsed = started.elapsed().as_secs_f64();
        debug!(room_key = %self.room_key, id = %id, ?settled, elapsed, "Code process settled");

        if settled != Settled::Exited {
            self.kill(RunType::Code, &id).await;
        }
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, copier).await.is_err() {
            warn!(room_key = %self.room_key, id = %id, "Timed out draining code output");
        }

        let banner = match settled {
            Settled::TimedOut => terminal::timeout_banner(),
            _ => terminal::finished_banner(elapsed),
        };
        self.write_stdout(SYSTEM_CODE_ID, banner).await;
        self.clear_code(&id).await;
    }

    /// Free the code slot if it still holds `id`.
    async fn clear_code(&self, id: &str) {
        let mut slots = self.slots.lock().await;
        if slots.code.as_deref() == Some(id) {
            slots.code = None;
        }
    }

    /// Tear down a code process that never got a waiter.
    async fn release_code(&self, id: &str) {
        self.kill(RunType::Code, id).await;
        self.clear_code(id).await;
    }

    async fn stop_code(&self) {
        let id = self.slots.lock().await.code.take();
        if let Some(id) = id {
            self.kill(RunType::Code, &id).await;
        }
    }

    async fn start_service(&self, template: &CommandTemplate) -> Result<(), RuntimeError> {
        let labels = naming::labels(&self.room_key, self.seq_no, RunType::Network);
        let network_id = self
            .backend
            .create_network(&self.names.network, &labels)
            .await?;
        self.slots.lock().await.network = Some(network_id);

        let spec = self.process_spec(
            RunType::Service,
            template,
            template.tty,
            false,
            Some(self.names.network.clone()),
        );
        let id = self.backend.create_process(&spec).await?;
        self.slots.lock().await.service = Some(id.clone());
        self.backend.start_process(&id).await?;
        info!(room_key = %self.room_key, seq_no = self.seq_no, id = %id, "Service started");
        Ok(())
    }

    async fn stop_service(&self) {
        let id = self.slots.lock().await.service.take();
        if let Some(id) = id {
            self.kill(RunType::Service, &id).await;
        }
    }

    async fn remove_network(&self) {
        let id = self.slots.lock().await.network.take();
        let Some(id) = id else { return };
        match self.backend.remove_network(&id).await {
            Ok(()) => debug!(room_key = %self.room_key, id = %id, "Network removed"),
            Err(e) if e.is_not_found() => debug!(id = %id, "Network already gone"),
            Err(e) => warn!(room_key = %self.room_key, id = %id, error = %e, "Failed to remove network"),
        }
    }

    /// Create, attach and start a fresh REPL, replacing any previous one.
    async fn start_repl(self: &Arc<Self>) -> Result<String, RuntimeError> {
        let template = self
            .profile
            .repl
            .clone()
            .ok_or_else(|| RuntimeError::Unsupported(self.language.clone(), "repl"))?;
        self.stop_repl().await;

        let network = self
            .slots
            .lock()
            .await
            .network
            .as_ref()
            .map(|_| self.names.network.clone());
        let spec = self.process_spec(RunType::Repl, &template, true, true, network);
        let id = self.backend.create_process(&spec).await?;
        {
            let mut slots = self.slots.lock().await;
            if self.is_stopping() {
                drop(slots);
                self.kill(RunType::Repl, &id).await;
                return Err(RuntimeError::Stopped);
            }
            slots.repl = Some(id.clone());
        }

        if let Err(e) = self.launch_repl(&id).await {
            self.stop_repl().await;
            return Err(e);
        }
        info!(room_key = %self.room_key, seq_no = self.seq_no, id = %id, "Repl started");
        Ok(id)
    }

    async fn launch_repl(self: &Arc<Self>, id: &str) -> Result<(), RuntimeError> {
        let stdio = self.backend.attach_process(id, true).await?;
        *self.repl_stdin.lock().await = stdio.input;
        tokio::spawn(Arc::clone(self).copy_output(SYSTEM_CODE_ID, stdio.output, false));

        self.backend.start_process(id).await?;
        let size = *self.win_size.lock().await;
        self.resize_repl(id, size).await;
        Ok(())
    }

    async fn stop_repl(&self) {
        self.repl_stdin.lock().await.take();
        let id = self.slots.lock().await.repl.take();
        if let Some(id) = id {
            self.kill(RunType::Repl, &id).await;
        }
    }

    async fn resize_repl(&self, id: &str, size: WinSize) {
        if let Err(e) = self.backend.resize_process(id, size).await {
            warn!(room_key = %self.room_key, id = %id, error = %e, "Failed to resize repl");
        }
    }

    /// Restart the REPL every time it exits until the runtime stops.
    async fn supervise_repl(self: Arc<Self>, mut repl_id: String) {
        loop {
            tokio::select! {
                result = self.backend.wait_process(&repl_id) => {
                    if let Err(e) = result {
                        debug!(id = %repl_id, error = %e, "Wait for repl failed");
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
            if self.is_stopping() {
                return;
            }

            info!(room_key = %self.room_key, seq_no = self.seq_no, "Repl exited, restarting");
            self.write_stdout(SYSTEM_CODE_ID, terminal::restart_notice())
                .await;
            tokio::select! {
                _ = tokio::time::sleep(REPL_RESTART_DELAY) => {}
                _ = self.cancel.cancelled() => return,
            }
            if self.is_stopping() {
                return;
            }

            match self.start_repl().await {
                Ok(id) => repl_id = id,
                Err(RuntimeError::Stopped) => return,
                Err(e) => {
                    error!(room_key = %self.room_key, error = %e, "Failed to restart repl");
                    return;
                }
            }
        }
    }

    async fn copy_output(self: Arc<Self>, id: CodeId, mut output: OutputStream, translate: bool) {
        let mut decoder = OutputDecoder::new(translate);
        let mut total = 0usize;
        while let Some(frame) = output.next().await {
            match frame {
                Ok(frame) => {
                    let bytes = frame.into_bytes();
                    total += bytes.len();
                    if let Some(text) = decoder.decode(&bytes) {
                        self.write_stdout(id, text).await;
                    }
                }
                Err(e) => {
                    warn!(room_key = %self.room_key, code_id = id, error = %e, "Output stream failed");
                    break;
                }
            }
        }
        if let Some(text) = decoder.flush() {
            self.write_stdout(id, text).await;
        }
        debug!(room_key = %self.room_key, code_id = id, bytes = total, "Output stream closed");
    }

    /// Force-stop a process and wait for the backend to remove it.
    async fn kill(&self, run_type: RunType, id: &str) {
        match self.backend.kill_process(id).await {
            Ok(()) => {
                if tokio::time::timeout(REAP_TIMEOUT, self.backend.wait_process(id))
                    .await
                    .is_err()
                {
                    warn!(id = %id, %run_type, "Process not removed in time");
                }
                debug!(room_key = %self.room_key, id = %id, %run_type, "Process killed");
            }
            Err(e) if e.is_not_found() => debug!(id = %id, %run_type, "Process already gone"),
            Err(e) => warn!(
                room_key = %self.room_key,
                id = %id,
                %run_type,
                error = %e,
                "Failed to kill process"
            ),
        }
    }

    async fn discard_stale(&self, name: &str) {
        match self.backend.kill_process(name).await {
            Ok(()) => {
                warn!(room_key = %self.room_key, process = %name, "Killed stale code process");
                let _ = tokio::time::timeout(REAP_TIMEOUT, self.backend.wait_process(name)).await;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!(process = %name, error = %e, "Stale code check failed"),
        }
    }

    fn process_spec(
        &self,
        run_type: RunType,
        template: &CommandTemplate,
        tty: bool,
        open_stdin: bool,
        network: Option<String>,
    ) -> ProcessSpec {
        let name = match run_type {
            RunType::Network => &self.names.network,
            RunType::Service => &self.names.service,
            RunType::Repl => &self.names.repl,
            RunType::Code => &self.names.code,
        };
        ProcessSpec {
            name: name.clone(),
            image: self.profile.image.clone(),
            cmd: self.names.render(&template.cmd),
            env: self.names.render(&template.env),
            labels: naming::labels(&self.room_key, self.seq_no, run_type),
            tty,
            open_stdin,
            network,
            limits: ProcessLimits {
                memory_bytes: self.limits.memory_bytes(),
                cpu_period_us: self.limits.cpu_period_us(),
                cpu_quota_us: self.limits.cpu_quota_us(),
            },
        }
    }

    async fn write_stdout(&self, id: CodeId, data: String) {
        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            listener.write_stdout(id, data).await;
        }
    }

    async fn run_failed(&self, code: ErrorCode) {
        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            listener.run_failed(code).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{LABEL_ROOM_KEY, LABEL_RUN_TYPE, LABEL_SEQ_NO};
    use crate::sandbox::OutputFrame;
    use crate::testing::{Behavior, FailPoint, FakeBackend};
    use std::future::Future;

    struct TestListener {
        backend: FakeBackend,
        config: Arc<LangConfig>,
        events: Mutex<Vec<(CodeId, String)>>,
        run_failures: Mutex<Vec<ErrorCode>>,
    }

    impl TestListener {
        async fn output(&self, id: CodeId) -> String {
            self.events
                .lock()
                .await
                .iter()
                .filter(|(event_id, _)| *event_id == id)
                .map(|(_, data)| data.as_str())
                .collect()
        }

        async fn events(&self) -> Vec<(CodeId, String)> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl RuntimeListener for TestListener {
        fn room_key(&self) -> &str {
            "room-1"
        }

        fn backend(&self) -> Arc<dyn ExecutionBackend> {
            Arc::new(self.backend.clone())
        }

        fn lang_config(&self) -> Arc<LangConfig> {
            Arc::clone(&self.config)
        }

        async fn write_stdout(&self, id: CodeId, data: String) {
            self.events.lock().await.push((id, data));
        }

        async fn run_failed(&self, code: ErrorCode) {
            self.run_failures.lock().await.push(code);
        }
    }

    fn template(cmd: &[&str], tty: bool) -> Option<CommandTemplate> {
        Some(CommandTemplate {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            env: vec!["LANG=C.UTF-8".to_string()],
            tty,
        })
    }

    fn config() -> LangConfig {
        LangConfig::new(
            vec![
                LanguageProfile {
                    name: "python".into(),
                    ext: ".py".into(),
                    image: "yeditor/python".into(),
                    service: None,
                    repl: template(&["python3", "-i"], true),
                    run: template(&["yscript", "<YE_REQUEST_FILE>"], true),
                },
                LanguageProfile {
                    name: "plain".into(),
                    ext: ".txt".into(),
                    image: "yeditor/plain".into(),
                    service: None,
                    repl: None,
                    run: template(&["cat", "<YE_REQUEST_FILE>"], false),
                },
                LanguageProfile {
                    name: "postgres".into(),
                    ext: ".sql".into(),
                    image: "yeditor/postgres".into(),
                    service: template(&["postgres"], false),
                    repl: template(&["psql", "-h", "<YE_SERVICE_NAME>"], true),
                    run: template(&["psql", "-h", "<YE_SERVICE_NAME>", "-f", "<YE_REQUEST_FILE>"], true),
                },
            ],
            ResourceLimits {
                code_timeout_ms: 1000,
                service_grace_ms: 500,
                ..Default::default()
            },
        )
    }

    fn run_env(language: &str) -> RunEnv {
        RunEnv {
            win_size: WinSize { row: 30, col: 100 },
            language: language.into(),
            boot: None,
        }
    }

    fn code(id: CodeId, language: &str) -> Code {
        Code {
            id,
            language: language.into(),
            filename: "main".into(),
            content: "print(1)".into(),
        }
    }

    async fn setup(env: RunEnv) -> (Arc<LangRuntime>, Arc<TestListener>, FakeBackend) {
        let backend = FakeBackend::new();
        let listener = Arc::new(TestListener {
            backend: backend.clone(),
            config: Arc::new(config()),
            events: Mutex::new(Vec::new()),
            run_failures: Mutex::new(Vec::new()),
        });
        let runtime = LangRuntime::new(1, env, listener.clone(), CancellationToken::new())
            .expect("runtime");
        (runtime, listener, backend)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..1000 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn code_released(runtime: &LangRuntime) {
        eventually(|| async { runtime.resource_ids().await.code.is_none() }).await;
    }

    #[tokio::test]
    async fn unknown_language_is_rejected() {
        let backend = FakeBackend::new();
        let listener = Arc::new(TestListener {
            backend: backend.clone(),
            config: Arc::new(config()),
            events: Mutex::new(Vec::new()),
            run_failures: Mutex::new(Vec::new()),
        });
        let result = LangRuntime::new(1, run_env("cobol"), listener, CancellationToken::new());
        assert!(matches!(result, Err(RuntimeError::LanguageNotFound(lang)) if lang == "cobol"));
        assert!(backend.created().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_launches_labeled_repl_with_terminal_size() {
        let (runtime, listener, backend) = setup(run_env("python")).await;
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();

        assert_eq!(runtime.status(), RuntimeStatus::Running);
        assert!(listener.output(0).await.contains("[ Welcome to python ]"));

        let created = backend.created().await;
        assert_eq!(created.len(), 1);
        let repl = &created[0];
        assert_eq!(repl.name, runtime.names().repl);
        assert_eq!(repl.cmd, vec!["python3", "-i"]);
        assert!(repl.tty);
        assert!(repl.open_stdin);
        assert_eq!(repl.network, None);
        assert_eq!(repl.labels[LABEL_ROOM_KEY], "room-1");
        assert_eq!(repl.labels[LABEL_SEQ_NO], "1");
        assert_eq!(repl.labels[LABEL_RUN_TYPE], "repl");

        let repl_id = runtime.resource_ids().await.repl.unwrap();
        assert_eq!(
            backend.resized().await,
            vec![(repl_id, WinSize { row: 30, col: 100 })]
        );
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn service_language_joins_private_network() {
        let (runtime, listener, backend) = setup(run_env("postgres")).await;
        runtime.start().await.unwrap();

        assert!(listener
            .output(0)
            .await
            .contains("Waiting for service ready..."));
        assert_eq!(backend.live_networks().await.len(), 1);

        let created = backend.created().await;
        assert_eq!(created.len(), 2);
        let service = &created[0];
        assert_eq!(service.labels[LABEL_RUN_TYPE], "service");
        assert_eq!(service.network.as_deref(), Some(runtime.names().network.as_str()));
        assert!(!service.open_stdin);
        let repl = &created[1];
        assert_eq!(repl.network.as_deref(), Some(runtime.names().network.as_str()));
        assert_eq!(repl.cmd, vec!["psql".to_string(), "-h".to_string(), runtime.names().service.clone()]);

        runtime.stop().await;
        assert_eq!(backend.removed_networks().await.len(), 1);
        assert!(backend.live_networks().await.is_empty());
        assert!(backend.live_processes().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_fails_start() {
        let (runtime, _listener, backend) = setup(run_env("postgres")).await;
        backend.fail_next(FailPoint::CreateNetwork).await;

        let result = runtime.start().await;
        assert!(matches!(result, Err(RuntimeError::Backend(_))));
        assert!(backend.created().await.is_empty());

        runtime.stop().await;
        assert_eq!(runtime.resource_ids().await, ResourceIds::default());
    }

    #[tokio::test(start_paused = true)]
    async fn run_streams_output_before_finished_banner() {
        let (runtime, listener, backend) = setup(run_env("python")).await;
        backend
            .set_behavior(
                RunType::Code,
                Behavior::Exit {
                    output: vec![OutputFrame::Console(b"hello\n".to_vec())],
                    after: Duration::from_millis(100),
                },
            )
            .await;
        runtime.start().await.unwrap();
        runtime.run_code(&code(7, "python")).await.unwrap();
        let code_id = runtime.resource_ids().await.code.unwrap();
        code_released(&runtime).await;
        assert!(!backend.killed().await.contains(&code_id));

        let events = listener.events().await;
        let start = events
            .iter()
            .position(|(id, data)| *id == 0 && data.contains("start executing code"))
            .unwrap();
        let output = events
            .iter()
            .position(|(id, data)| *id == 7 && data == "hello\n")
            .unwrap();
        let finished = events
            .iter()
            .position(|(id, data)| *id == 0 && data.contains("execution finished in"))
            .unwrap();
        assert!(start < output && output < finished);

        let copied = backend.copied().await;
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].process_id, code_id);
        assert_eq!(copied[0].dir, REQUEST_DIR);
        assert_eq!(copied[0].file_name, "request.json");
        let payload: serde_json::Value = serde_json::from_slice(&copied[0].content).unwrap();
        assert_eq!(payload["language"], "python");
        assert_eq!(payload["files"][0]["name"], "main.py");
        assert_eq!(payload["files"][0]["content"], "print(1)");

        let code_spec = backend
            .created()
            .await
            .into_iter()
            .find(|spec| spec.labels[LABEL_RUN_TYPE] == "code")
            .unwrap();
        assert_eq!(code_spec.name, runtime.names().code);
        assert_eq!(code_spec.cmd, vec!["yscript", "request.json"]);
        assert!(!code_spec.open_stdin);
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_tty_output_translates_newlines() {
        let (runtime, listener, backend) = setup(run_env("plain")).await;
        backend
            .set_behavior(
                RunType::Code,
                Behavior::Exit {
                    output: vec![OutputFrame::Stdout(b"a\nb\n".to_vec())],
                    after: Duration::from_millis(10),
                },
            )
            .await;
        runtime.start().await.unwrap();
        runtime.run_code(&code(3, "plain")).await.unwrap();
        code_released(&runtime).await;

        assert_eq!(listener.output(3).await, "a\r\nb\r\n");
        assert!(!backend.created().await[0].tty);
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_rejected_while_first_is_live() {
        let (runtime, _listener, backend) = setup(run_env("python")).await;
        runtime.start().await.unwrap();
        runtime.run_code(&code(7, "python")).await.unwrap();
        let live = backend.live_processes().await;
        let code_id = runtime.resource_ids().await.code.unwrap();

        let result = runtime.run_code(&code(8, "python")).await;
        assert!(matches!(result, Err(RuntimeError::AlreadyRunning)));
        assert_eq!(result.unwrap_err().code(), crate::protocol::ErrorCode::ErrCodeAlreadyRunning);
        assert_eq!(backend.live_processes().await, live);
        assert_eq!(runtime.resource_ids().await.code, Some(code_id.clone()));
        assert!(!backend.killed().await.contains(&code_id));
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_kills_code_and_reports() {
        let (runtime, listener, backend) = setup(run_env("python")).await;
        runtime.start().await.unwrap();
        runtime.run_code(&code(7, "python")).await.unwrap();
        let code_id = runtime.resource_ids().await.code.unwrap();
        code_released(&runtime).await;

        let system = listener.output(0).await;
        assert!(system.contains("[ execution timeout ]"));
        assert!(!system.contains("execution finished"));
        assert!(backend.killed().await.contains(&code_id));
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_everything_once() {
        let (runtime, listener, backend) = setup(run_env("postgres")).await;
        runtime.start().await.unwrap();
        runtime.run_code(&code(7, "postgres")).await.unwrap();
        let before = runtime.resource_ids().await;
        assert!(before.network.is_some());
        assert!(before.service.is_some());
        assert!(before.repl.is_some());
        assert!(before.code.is_some());

        runtime.stop().await;
        runtime.stop().await;
        assert_eq!(runtime.status(), RuntimeStatus::Stopping);
        assert_eq!(runtime.resource_ids().await, ResourceIds::default());
        assert!(backend.live_processes().await.is_empty());
        assert!(backend.live_networks().await.is_empty());

        let result = runtime.run_code(&code(8, "postgres")).await;
        assert!(matches!(result, Err(RuntimeError::Stopped)));

        let count = listener.events().await.len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(listener.events().await.len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn repl_is_restarted_after_exit() {
        let (runtime, listener, backend) = setup(run_env("python")).await;
        backend
            .set_behavior(
                RunType::Repl,
                Behavior::Exit {
                    output: Vec::new(),
                    after: Duration::from_millis(50),
                },
            )
            .await;
        runtime.start().await.unwrap();

        eventually(|| async { backend.created().await.len() >= 2 }).await;
        assert!(listener.output(0).await.contains("restarting repl..."));
        assert!(backend
            .created()
            .await
            .iter()
            .all(|spec| spec.labels[LABEL_RUN_TYPE] == "repl"));

        runtime.stop().await;
        let created = backend.created().await.len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.created().await.len(), created);
    }

    #[tokio::test(start_paused = true)]
    async fn stdin_reaches_the_repl() {
        let (runtime, listener, backend) = setup(run_env("python")).await;
        backend.set_behavior(RunType::Repl, Behavior::Echo).await;
        runtime.start().await.unwrap();

        runtime.send_repl_stdin("1+1\r").await;
        eventually(|| async { listener.output(0).await.contains("1+1\r") }).await;
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resize_is_stored_and_forwarded() {
        let (runtime, _listener, backend) = setup(run_env("plain")).await;
        runtime.start().await.unwrap();
        let size = WinSize { row: 50, col: 160 };
        runtime.set_repl_win_size(size).await;
        assert_eq!(runtime.win_size().await, size);
        assert!(backend.resized().await.is_empty());
        runtime.stop().await;

        let (runtime, _listener, backend) = setup(run_env("python")).await;
        runtime.start().await.unwrap();
        runtime.set_repl_win_size(size).await;
        let repl_id = runtime.resource_ids().await.repl.unwrap();
        assert_eq!(backend.resized().await.last(), Some(&(repl_id, size)));
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn boot_code_runs_before_repl() {
        let mut env = run_env("python");
        env.boot = Some(code(1, "python"));
        let (runtime, listener, backend) = setup(env).await;
        backend
            .set_behavior(
                RunType::Code,
                Behavior::Exit {
                    output: vec![OutputFrame::Console(b"booted".to_vec())],
                    after: Duration::from_millis(10),
                },
            )
            .await;
        runtime.start().await.unwrap();

        let created = backend.created().await;
        assert_eq!(created[0].labels[LABEL_RUN_TYPE], "code");
        assert_eq!(created[1].labels[LABEL_RUN_TYPE], "repl");
        code_released(&runtime).await;
        assert_eq!(listener.output(1).await, "booted");
        runtime.stop().await;
    }
    #[tokio::test(start_paused = true)]
    async fn failed_launch_leaves_no_code_process() {
        let (runtime, listener, backend) = setup(run_env("plain")).await;
        backend
            .set_behavior(
                RunType::Code,
                Behavior::Exit {
                    output: vec![OutputFrame::Stdout(b"ok".to_vec())],
                    after: Duration::from_millis(10),
                },
            )
            .await;
        runtime.start().await.unwrap();

        for point in [FailPoint::CopyFile, FailPoint::Attach, FailPoint::Start] {
            backend.fail_next(point).await;
            let result = runtime.run_code(&code(7, "plain")).await;
            assert!(matches!(result, Err(RuntimeError::Backend(_))), "{:?}", point);
            assert_eq!(runtime.resource_ids().await.code, None);
            assert!(backend.live_process_specs().await.is_empty(), "{:?}", point);
        }

        runtime.run_code(&code(8, "plain")).await.unwrap();
        code_released(&runtime).await;
        assert_eq!(listener.output(8).await, "ok");
        assert_eq!(backend.created().await.len(), 4);
        assert!(backend.live_process_specs().await.is_empty());
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn boot_launch_failure_still_starts_repl() {
        let mut env = run_env("python");
        env.boot = Some(code(1, "python"));
        let (runtime, listener, backend) = setup(env).await;
        backend.fail_next(FailPoint::CopyFile).await;

        runtime.start().await.unwrap();
        assert_eq!(runtime.status(), RuntimeStatus::Running);
        assert_eq!(
            *listener.run_failures.lock().await,
            vec![ErrorCode::ErrServiceInternal]
        );

        let ids = runtime.resource_ids().await;
        assert_eq!(ids.code, None);
        assert!(ids.repl.is_some());
        let live: Vec<String> = backend
            .live_process_specs()
            .await
            .into_iter()
            .map(|spec| spec.labels[LABEL_RUN_TYPE].clone())
            .collect();
        assert_eq!(live, vec!["repl".to_string()]);
        runtime.stop().await;
    }
}
