//! Result types for daemon calls.
//!
//! Mutating operations never surface raw HTTP errors: the daemon's status
//! code is folded into a [`ResultCode`] and the verbatim response body is
//! kept in the message so operators see what the daemon actually said.

use serde::{Deserialize, Serialize};

use super::DockerError;

/// Outcome class of a daemon call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    NotFound,
    NotModified,
    Conflict,
    Error,
}

impl ResultCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ResultCode::Ok,
            304 => ResultCode::NotModified,
            404 => ResultCode::NotFound,
            409 => ResultCode::Conflict,
            _ => ResultCode::Error,
        }
    }
}

/// Result of a mutating daemon call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCallResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceCallResult {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: None,
        }
    }

    pub fn with_message(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Fold a daemon HTTP response status and body into a result.
    pub fn from_status(status: u16, body: &str) -> Self {
        let code = ResultCode::from_status(status);
        if code == ResultCode::Ok {
            return Self::ok();
        }
        Self {
            code,
            message: Some(format!(
                "Response from server: {} {}",
                status,
                body.trim()
            )),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

impl From<DockerError> for ServiceCallResult {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::Api { code, message } => Self {
                code,
                message: Some(message),
            },
            other => Self {
                code: ResultCode::Error,
                message: Some(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(ResultCode::from_status(200), ResultCode::Ok);
        assert_eq!(ResultCode::from_status(204), ResultCode::Ok);
        assert_eq!(ResultCode::from_status(304), ResultCode::NotModified);
        assert_eq!(ResultCode::from_status(404), ResultCode::NotFound);
        assert_eq!(ResultCode::from_status(409), ResultCode::Conflict);
        assert_eq!(ResultCode::from_status(500), ResultCode::Error);
    }

    #[test]
    fn test_result_keeps_body() {
        let res = ServiceCallResult::from_status(409, "name already in use\n");
        assert_eq!(res.code, ResultCode::Conflict);
        assert!(res.message.unwrap().contains("name already in use"));
    }
}
