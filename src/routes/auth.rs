//! Auth routes: session extractor and WS ticket minting.

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::error;

use crate::event::Identity;
use crate::state::AppState;

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the session cookie.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub identity: Identity,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(&app_state.chat.session_cookie)
            .map(Cookie::value)
            .unwrap_or_default();
        if token.is_empty() {
            return Err(StatusCode::UNAUTHORIZED);
        }

        let identity = app_state
            .sessions
            .validate_session(token)
            .await
            .map_err(|e| {
                error!(error = %e, "session validation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { identity })
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/auth/ws-ticket`: create a one-time WS ticket.
pub async fn ws_ticket(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, StatusCode> {
    let ticket = state
        .sessions
        .issue_ticket(auth.identity.user_id)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = auth.identity.user_id, "ws ticket creation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
