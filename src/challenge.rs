//! Plain HTTP responder for ACME HTTP-01 challenges

use anchor_acme::ChallengeHandler;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

pub fn router(handler: ChallengeHandler) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(respond))
        .with_state(handler)
}

async fn respond(
    State(handler): State<ChallengeHandler>,
    uri: Uri,
) -> Result<String, StatusCode> {
    match handler.handle_challenge(uri.path()) {
        Some(key_authorization) => {
            info!("Answered ACME challenge {}", uri.path());
            Ok(key_authorization)
        }
        None => {
            debug!("Unknown ACME challenge {}", uri.path());
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Serve challenges on `addr` until the process exits
pub async fn serve(addr: &str, handler: ChallengeHandler) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ACME challenge responder on {}", listener.local_addr()?);

    axum::serve(listener, router(handler))
        .await
        .map_err(|e| anyhow::anyhow!("Challenge responder error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_acme::ChallengeTokens;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let tokens: ChallengeTokens = Arc::new(DashMap::new());
        tokens.insert("known-token".to_string(), "known-token.thumbprint".to_string());
        router(ChallengeHandler::new(tokens))
    }

    async fn get(uri: &str) -> (StatusCode, String) {
        let response = app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_known_token_returns_key_authorization() {
        let (status, body) = get("/.well-known/acme-challenge/known-token").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "known-token.thumbprint");
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let (status, _) = get("/.well-known/acme-challenge/other-token").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get("/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
