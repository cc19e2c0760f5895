//! Wire protocol between a room client and the runner.
//!
//! Every frame is one JSON object with exactly one populated field, e.g.
//! `{"reset": {...}}` from the client or `{"stdout": {"ok": {...}}}` from the
//! server.

use serde::{Deserialize, Serialize};

pub type CodeId = u32;

/// Output channel used for banners and the REPL.
pub const SYSTEM_CODE_ID: CodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ErrServiceInternal,
    ErrInitRoomExists,
    ErrInvalidRoomKey,
    ErrCodeAlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRequest {
    Reset(RunEnv),
    Run(Code),
    WinSize(WinSize),
    Stdin(String),
}

impl ServiceRequest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceRequest::Reset(_) => "reset",
            ServiceRequest::Run(_) => "run",
            ServiceRequest::WinSize(_) => "win_size",
            ServiceRequest::Stdin(_) => "stdin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceResponse {
    Init(ServiceResult<InitResp>),
    Reset(ServiceResult<ResetResp>),
    Run(ServiceResult<RunResp>),
    WinSize(ServiceResult<WinSize>),
    Stdout(ServiceResult<StdoutResp>),
}

impl ServiceResponse {
    pub fn init(result: Result<(), ErrorCode>) -> Self {
        ServiceResponse::Init(result.map(|()| InitResp {}).into())
    }

    pub fn reset(result: Result<(), ErrorCode>) -> Self {
        ServiceResponse::Reset(result.map(|()| ResetResp {}).into())
    }

    pub fn run_err(code: ErrorCode) -> Self {
        ServiceResponse::Run(ServiceResult::Err(code))
    }

    pub fn win_size(size: WinSize) -> Self {
        ServiceResponse::WinSize(ServiceResult::Ok(size))
    }

    pub fn stdout(id: CodeId, data: impl Into<String>) -> Self {
        ServiceResponse::Stdout(ServiceResult::Ok(StdoutResp {
            id,
            data: data.into(),
        }))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceResult<T> {
    Ok(T),
    Err(ErrorCode),
}

impl<T> From<Result<T, ErrorCode>> for ServiceResult<T> {
    fn from(result: Result<T, ErrorCode>) -> Self {
        match result {
            Ok(value) => ServiceResult::Ok(value),
            Err(code) => ServiceResult::Err(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResp {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResp {}

/// Successful runs are reported through stdout events, so this is only ever
/// the `ok` side of an error-carrying envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResp {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WinSize {
    pub row: u16,
    pub col: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEnv {
    #[serde(default)]
    pub win_size: WinSize,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<Code>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub id: CodeId,
    pub language: String,
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdoutResp {
    pub id: CodeId,
    pub data: String,
}

/// Response of the stats endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub rooms: Vec<String>,
}
