//! Authentication for the local REST API
//!
//! A random token is generated at daemon start and written to a file only
//! the owner can read. Requests present it as a Bearer header, or as a
//! `token` query parameter for SSE clients that cannot set headers.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Token file name inside the state directory
pub const TOKEN_FILE_NAME: &str = "api-token";

/// Authentication state shared across handlers
#[derive(Clone)]
pub struct AuthState {
    /// The valid authentication token
    token: Arc<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn accepts(&self, candidate: &str) -> bool {
        !candidate.is_empty() && candidate == self.token.as_str()
    }
}

/// Generate a cryptographically secure 32-byte token, base64-encoded
pub fn generate_api_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Default token location for a state directory
pub fn default_token_path(state_dir: &Path) -> PathBuf {
    state_dir.join(TOKEN_FILE_NAME)
}

/// Write the token to `path`, readable by the owner only
pub fn write_token_file(token: &str, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("API token written to {:?}", path);
    Ok(())
}

/// Read a token written by [`write_token_file`]
pub fn read_token_file(path: &Path) -> Result<String, std::io::Error> {
    let token = std::fs::read_to_string(path)?;
    Ok(token.trim().to_string())
}

/// Axum middleware for Bearer token authentication
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let authorized = match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) => auth_state.accepts(token),
            None => {
                tracing::warn!("Malformed Authorization header");
                false
            }
        },
        None => query_tokens(request.uri()).iter().any(|t| auth_state.accepts(t)),
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("Rejected unauthenticated request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Candidate values of the `token` query parameter
///
/// The percent-decoded value comes first. The raw text follows for
/// unencoded base64 tokens, whose `+` decodes to a space.
fn query_tokens(uri: &Uri) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Ok(Query(TokenQuery { token: Some(token) })) = Query::<TokenQuery>::try_from_uri(uri) {
        tokens.push(token);
    }

    let raw = uri.query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });
    if let Some(raw) = raw {
        if !tokens.contains(&raw) {
            tokens.push(raw);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_api_token() {
        let token1 = generate_api_token();
        let token2 = generate_api_token();

        assert_ne!(token1, token2);
        // 32 bytes base64-encoded with padding
        assert_eq!(token1.len(), 44);
        assert!(BASE64.decode(&token1).is_ok());
    }

    #[test]
    fn test_token_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = default_token_path(&dir.path().join("state"));
        write_token_file("secret-token", &path).unwrap();
        assert_eq!(read_token_file(&path).unwrap(), "secret-token");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    fn tokens_of(uri: &str) -> Vec<String> {
        query_tokens(&uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn test_query_token() {
        assert_eq!(tokens_of("/x?a=1&token=abc"), vec!["abc"]);
        assert!(tokens_of("/x?tokens=abc").is_empty());
        assert!(tokens_of("/x").is_empty());
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        assert_eq!(tokens_of("/x?token=a%2Bb%3D"), vec!["a+b=", "a%2Bb%3D"]);
        assert_eq!(tokens_of("/x?token=a+b="), vec!["a b=", "a+b="]);
    }

    #[test]
    fn test_empty_token_never_accepted() {
        let auth = AuthState::new(String::new());
        assert!(!auth.accepts(""));
        let auth = AuthState::new("abc".to_string());
        assert!(auth.accepts("abc"));
        assert!(!auth.accepts("abd"));
    }
}
