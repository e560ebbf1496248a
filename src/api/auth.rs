// dispatcher - distributed download orchestration cluster
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Optional shared-secret header check.
//!
//! Mirrors the dispatcher's deliberate fail-open behavior: if the
//! operator enables the gate but never configures any keys, requests are
//! still admitted, with a warning logged on every check.

use crate::config::SecurityConfig;
use crate::error::DispatcherError;

const API_KEY_HEADER: &str = "x-api-key";

pub fn verify_api_key(security: &SecurityConfig, headers: &axum::http::HeaderMap) -> Result<(), DispatcherError> {
    if !security.api_key_required {
        return Ok(());
    }

    if security.api_keys.is_empty() {
        let misconfiguration = DispatcherError::OperatorConfig(
            "API key authentication is required but no API keys are configured".into(),
        );
        tracing::warn!(error = %misconfiguration, "allowing all requests until security.api_keys is set");
        return Ok(());
    }

    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if security.api_keys.iter().any(|k| k == key) => Ok(()),
        _ => Err(DispatcherError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn disabled_gate_allows_anything() {
        let security = SecurityConfig::default();
        assert!(verify_api_key(&security, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn enabled_gate_with_no_keys_fails_open() {
        let security = SecurityConfig {
            api_key_required: true,
            api_keys: vec![],
        };
        assert!(verify_api_key(&security, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn enabled_gate_rejects_missing_key() {
        let security = SecurityConfig {
            api_key_required: true,
            api_keys: vec!["secret".into()],
        };
        assert!(verify_api_key(&security, &HeaderMap::new()).is_err());
    }

    #[test]
    fn enabled_gate_accepts_matching_key() {
        let security = SecurityConfig {
            api_key_required: true,
            api_keys: vec!["secret".into()],
        };
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(verify_api_key(&security, &headers).is_ok());
    }
}
