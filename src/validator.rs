use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Decides whether a `username`/`passkey` pair may connect.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, username: &str, passkey: &str) -> bool;
}

#[derive(Serialize)]
struct ValidationRequest<'a> {
    username: &'a str,
    passkey: &'a str,
}

#[derive(Deserialize)]
struct ValidationResponse {
    #[serde(default)]
    valid: bool,
}

/// Asks an external HTTP service. Only a 200 answer carrying
/// `{"valid": true}` accepts; everything else, transport errors included,
/// rejects.
pub struct HttpValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpValidator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialValidator for HttpValidator {
    async fn validate(&self, username: &str, passkey: &str) -> bool {
        let response = match self
            .client
            .post(&self.url)
            .json(&ValidationRequest { username, passkey })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Passkey validation request for {} failed: {}", username, e);
                return false;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            info!(
                "Passkey validation for {} answered {}",
                username,
                response.status()
            );
            return false;
        }
        match response.json::<ValidationResponse>().await {
            Ok(body) => body.valid,
            Err(e) => {
                warn!("Unreadable passkey validation response: {}", e);
                false
            }
        }
    }
}

/// Used when no validation endpoint is configured.
pub struct DenyAll;

#[async_trait]
impl CredentialValidator for DenyAll {
    async fn validate(&self, _username: &str, _passkey: &str) -> bool {
        false
    }
}

/// Checks presence of both credentials, then asks `validator`.
pub async fn authenticate(
    validator: &dyn CredentialValidator,
    username: Option<&str>,
    passkey: Option<&str>,
) -> Result<String> {
    let username = match username.map(str::trim) {
        Some(u) if !u.is_empty() => u,
        _ => {
            return Err(OrchestratorError::ValidationFailed(
                "username required".to_string(),
            ))
        }
    };
    let passkey = match passkey {
        Some(p) if !p.is_empty() => p,
        _ => {
            return Err(OrchestratorError::ValidationFailed(
                "passkey required".to_string(),
            ))
        }
    };
    if validator.validate(username, passkey).await {
        Ok(username.to_string())
    } else {
        Err(OrchestratorError::ValidationFailed(format!(
            "credentials for {} rejected",
            username
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::{json, Value};
    use warp::http::StatusCode;
    use warp::Filter;

    use super::*;

    struct Fixed(&'static str, &'static str);

    #[async_trait]
    impl CredentialValidator for Fixed {
        async fn validate(&self, username: &str, passkey: &str) -> bool {
            username == self.0 && passkey == self.1
        }
    }

    fn validation_service() -> SocketAddr {
        let route = warp::post()
            .and(warp::path("validate"))
            .and(warp::body::json())
            .map(|body: Value| {
                let reply = match (body["username"].as_str(), body["passkey"].as_str()) {
                    (Some("alice"), Some("secret")) => json!({ "valid": true }),
                    (Some("teapot"), _) => {
                        return warp::reply::with_status(
                            warp::reply::json(&json!({ "valid": true })),
                            StatusCode::IM_A_TEAPOT,
                        )
                    }
                    _ => json!({ "valid": false }),
                };
                warp::reply::with_status(warp::reply::json(&reply), StatusCode::OK)
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_before_validation() {
        let validator = Fixed("alice", "secret");
        for (username, passkey) in [
            (None, Some("secret")),
            (Some("  "), Some("secret")),
            (Some("alice"), None),
            (Some("alice"), Some("")),
        ] {
            assert!(matches!(
                authenticate(&validator, username, passkey).await,
                Err(OrchestratorError::ValidationFailed(_))
            ));
        }
        assert_eq!(
            authenticate(&validator, Some("alice"), Some("secret")).await,
            Ok("alice".to_string())
        );
    }

    #[tokio::test]
    async fn deny_all_rejects_everyone() {
        assert!(authenticate(&DenyAll, Some("alice"), Some("secret"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn http_validator_follows_service_answer() {
        let addr = validation_service();
        let validator =
            HttpValidator::new(format!("http://{}/validate", addr), Duration::from_secs(5));
        assert!(validator.validate("alice", "secret").await);
        assert!(!validator.validate("alice", "wrong").await);
        // Only a 200 counts, whatever the body says.
        assert!(!validator.validate("teapot", "secret").await);
    }

    #[tokio::test]
    async fn unreachable_service_rejects() {
        let validator = HttpValidator::new("http://127.0.0.1:9/validate", Duration::from_secs(1));
        assert!(!validator.validate("alice", "secret").await);
    }
}
