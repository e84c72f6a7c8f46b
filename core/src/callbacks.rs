//! Per-request completion handlers.
//!
//! Each handler is a boxed `FnOnce`; the dispatcher takes it out of its
//! `Option` slot when firing, so a handler can run at most once no matter how
//! many times a request is replayed.

use serde_json::Value;

use crate::error::HttpError;
use crate::request::RequestId;

/// Normalised result handed to `success`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body. `Null` when the body is empty; a JSON string when
    /// the body is not JSON.
    pub data: Value,
}

impl ApiResponse {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::ApiError> {
        serde_json::from_value(self.data.clone()).map_err(crate::ApiError::Deserialization)
    }
}

/// Summary handed to `complete`, which fires exactly once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: RequestId,
    /// Status of the final attempt; 0 when no response was received.
    pub status: u16,
    pub succeeded: bool,
    pub aborted: bool,
}

pub type SuccessFn = Box<dyn FnOnce(&ApiResponse)>;
pub type ErrorFn = Box<dyn FnOnce(&HttpError)>;
pub type CompleteFn = Box<dyn FnOnce(&Completion)>;

/// Optional `success` / `error` / `complete` handlers for one call.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) success: Option<SuccessFn>,
    pub(crate) error: Option<ErrorFn>,
    pub(crate) complete: Option<CompleteFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(&ApiResponse) + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&HttpError) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(&Completion) + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}
