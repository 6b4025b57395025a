//! Request validation for the flowops API
//!
//! Payload structs derive `validator::Validate`; checks the derive cannot
//! express go through [`ValidationBuilder`].

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use validator::Validate;

use crate::error::{AppError, ApiResult, ValidationBuilder};

/// Run derived validation and map failures to the standard error body
pub fn validate_payload<T: Validate>(payload: &T) -> ApiResult<()> {
    payload.validate().map_err(|errors| {
        let mut details: HashMap<String, Vec<String>> = HashMap::new();
        for (field, field_errors) in errors.field_errors() {
            let messages = field_errors
                .iter()
                .map(|e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{} is invalid ({})", field, e.code),
                })
                .collect();
            details.insert(field.to_string(), messages);
        }
        AppError::ValidationError { details }
    })
}

static REPOSITORY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").ok());

/// `owner/name` as used by the Git hosting API
pub fn is_repository_name(value: &str) -> bool {
    REPOSITORY
        .as_ref()
        .is_some_and(|re| re.is_match(value.trim()))
}

/// Runtime base URLs must be absolute http(s) URLs
pub fn is_http_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}

pub fn finish(builder: ValidationBuilder) -> ApiResult<()> {
    match builder.build() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
