//! Data-read endpoints of each integration, built on the shared token,
//! upstream and cache layers.

pub mod garmin;
pub mod google;
pub mod monzo;
pub mod spotify;

use serde_json::Value;

use crate::error::{AppError, Result};

/// Dashboard widgets poll these endpoints; a missing or dead token is
/// reported in the payload rather than as an error status.
pub(crate) fn unauthenticated_as(fallback: Value, result: Result<Value>) -> Result<Value> {
    match result {
        Err(AppError::Authentication(_)) | Err(AppError::Refresh(_)) => Ok(fallback),
        other => other,
    }
}

pub(crate) fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}
