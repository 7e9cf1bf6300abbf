//! Group chat HTTP routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::event::{GroupId, Outbound};
use crate::routes::auth::AuthUser;
use crate::routes::ws::rejection_status;
use crate::services::broker::Participant;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ParticipantsResponse {
    pub group_id: GroupId,
    pub group_name: String,
    pub participants: Vec<Participant>,
}

/// `GET /api/groups/{group_id}/chat/participants`: who is live in a group chat.
///
/// Callers must be allowed to attach to the group themselves.
pub async fn chat_participants(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    auth: AuthUser,
) -> Response {
    let permit = match state.broker.authorize(group_id, &auth.identity).await {
        Ok(permit) => permit,
        Err(e) => return (rejection_status(&e), Json(Outbound::error_from(&e))).into_response(),
    };

    let participants = state.broker.participants(group_id).await;
    (
        StatusCode::OK,
        Json(ParticipantsResponse { group_id, group_name: permit.group_name().to_owned(), participants }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tokio::sync::mpsc;

    use crate::config::ChatConfig;
    use crate::services::broker::Connection;
    use crate::state::test_helpers::{StaticSessionStore, alice, bob, carol, test_app_state_with};

    fn state() -> AppState {
        test_app_state_with(StaticSessionStore::default(), ChatConfig::default())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        serde_json::from_slice(&bytes).expect("body should be json")
    }

    #[tokio::test]
    async fn lists_live_participants_for_members() {
        let state = state();
        let permit = state.broker.authorize(5, &bob()).await.expect("authorize");
        let mut conn = Connection::new(bob());
        let (tx, _rx) = mpsc::channel(4);
        state.broker.attach(&mut conn, permit, tx).await.expect("attach");

        let response = chat_participants(State(state), Path(5), AuthUser { identity: alice() }).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["group_id"], 5);
        assert_eq!(body["group_name"], "Stout Society");
        assert_eq!(body["participants"][0]["username"], "bob");
        assert_eq!(body["participants"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn non_members_are_forbidden() {
        let response = chat_participants(State(state()), Path(5), AuthUser { identity: carol() }).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "E_NOT_MEMBER");
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let response = chat_participants(State(state()), Path(404), AuthUser { identity: alice() }).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
