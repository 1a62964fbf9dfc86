// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Kube Tunnel Manager Contributors

// Kube Tunnel Manager - Authentication Module
// Token-based authentication for the daemon API

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// HTTP header carrying the authentication token
pub const AUTH_TOKEN_HEADER: &str = "X-Tunnel-Token";

/// Load the token from file, generating and persisting a fresh one if needed
///
/// Returns (token, was_newly_generated).
pub fn load_or_generate_token(token_path: &Path) -> Result<(String, bool)> {
    if token_path.exists() {
        let token = fs::read_to_string(token_path)
            .context("Failed to read authentication token file")?
            .trim()
            .to_string();

        if token.is_empty() {
            warn!("Token file exists but is empty, regenerating");
        } else {
            info!("Loaded authentication token from: {}", token_path.display());
            return Ok((token, false));
        }
    }

    let token = Uuid::new_v4().to_string();
    save_token(token_path, &token)?;

    info!("Generated new authentication token");
    info!("Clients must send it in the {} header; full token in {}", AUTH_TOKEN_HEADER, token_path.display());

    Ok((token, true))
}

fn save_token(token_path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = token_path.parent() {
        fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    fs::write(token_path, token).context("Failed to write token file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(token_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set token file permissions")?;
    }

    Ok(())
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    token: Zeroizing<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Zeroizing::new(token),
        }
    }
}

/// Reject requests whose token header is missing or wrong
pub async fn auth_middleware(
    axum::extract::State(auth_state): axum::extract::State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided_token = request
        .headers()
        .get(AUTH_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided_token {
        Some(token) if token == auth_state.token.as_str() => Ok(next.run(request).await),
        Some(_) => {
            warn!("Authentication failed: invalid token");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Authentication failed: missing token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_then_reloads_token() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(!token.is_empty());
        assert!(was_new);

        let (loaded, was_new) = load_or_generate_token(&token_path).unwrap();
        assert_eq!(token, loaded);
        assert!(!was_new);
    }

    #[test]
    fn empty_token_file_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        fs::write(&token_path, "  \n").unwrap();

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(!token.is_empty());
        assert!(was_new);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        load_or_generate_token(&token_path).unwrap();

        let mode = fs::metadata(&token_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
