pub mod auth;
pub mod chats;
pub mod error;
pub mod knocks;
pub mod middleware;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;

use crate::middleware::require_auth;

/// REST routes. Everything except register/login requires a bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/me/privacy", put(auth::set_privacy))
        .route("/knocks", post(knocks::create_knock))
        .route("/knocks/incoming", get(knocks::incoming))
        .route("/knocks/outgoing", get(knocks::outgoing))
        .route("/knocks/pending", get(knocks::pending))
        .route("/knocks/counts", get(knocks::counts))
        .route("/knocks/{edge_id}", delete(knocks::unknock))
        .route("/knocks/{edge_id}/knock-back", post(knocks::knock_back))
        .route("/knocks/{edge_id}/accept", post(knocks::accept))
        .route("/knocks/{edge_id}/decline", post(knocks::decline))
        .route("/locks/{user_id}", delete(knocks::break_lock))
        .route("/relationships/{user_id}", get(knocks::relationship))
        .route("/chats", post(chats::open_chat))
        .route("/chats/{chat_id}/access", get(chats::access))
        .route(
            "/chats/{chat_id}/messages",
            get(chats::get_messages).post(chats::send_message),
        )
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use knock_core::memory::RecordingNotifier;
    use knock_db::Database;
    use knock_gateway::Dispatcher;

    struct TestApp {
        _dir: tempfile::TempDir,
        router: Router,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("knock.db")).unwrap());
        let state = AppStateInner::new(
            db,
            Dispatcher::new(),
            Arc::new(RecordingNotifier::default()),
            "test-secret",
            3,
        );
        TestApp {
            _dir: dir,
            router: router(state),
        }
    }

    impl TestApp {
        async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        /// Returns (user_id, token).
        async fn register(&self, username: &str, is_private: bool) -> (String, String) {
            let (status, body) = self
                .call(
                    "POST",
                    "/auth/register",
                    None,
                    Some(json!({ "username": username, "password": "correct-horse", "is_private": is_private })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            (
                body["user_id"].as_str().unwrap().to_string(),
                body["token"].as_str().unwrap().to_string(),
            )
        }
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let app = app();
        let (status, body) = app.call("GET", "/knocks/incoming", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication_error");

        let (status, _) = app.call("GET", "/knocks/incoming", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_and_login() {
        let app = app();
        app.register("alice", true).await;

        let (status, body) = app
            .call("POST", "/auth/register", None, Some(json!({ "username": "alice", "password": "another-one" })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "username_taken");

        let (status, body) = app
            .call("POST", "/auth/login", None, Some(json!({ "username": "alice", "password": "correct-horse" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_private"], true);

        let (status, _) = app
            .call("POST", "/auth/login", None, Some(json!({ "username": "alice", "password": "wrong-password" })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn private_knock_is_accepted_into_a_lock() {
        let app = app();
        let (alice, alice_token) = app.register("alice", true).await;
        let (bob, bob_token) = app.register("bob", true).await;

        let (status, edge) = app
            .call("POST", "/knocks", Some(&alice_token), Some(json!({ "to": bob })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(edge["status"], "pending");

        let (_, pending) = app.call("GET", "/knocks/pending", Some(&bob_token), None).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let (status, body) = app
            .call("POST", "/knocks", Some(&alice_token), Some(json!({ "to": bob })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate_edge");

        // Bob's own request makes the pair mutual; accepting locks both sides
        app.call("POST", "/knocks", Some(&bob_token), Some(json!({ "to": alice })))
            .await;
        let uri = format!("/knocks/{}/accept", edge["id"].as_str().unwrap());
        let (status, accepted) = app.call("POST", &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["status"], "lockedIn");

        let (_, rel) = app
            .call("GET", &format!("/relationships/{}", bob), Some(&alice_token), None)
            .await;
        assert_eq!(rel["isLockedIn"], true);

        let (_, counts) = app.call("GET", "/knocks/counts", Some(&alice_token), None).await;
        assert_eq!(counts["lockedInCount"], 1);

        let (status, _) = app
            .call("DELETE", &format!("/locks/{}", bob), Some(&alice_token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, incoming) = app.call("GET", "/knocks/incoming", Some(&alice_token), None).await;
        assert_eq!(incoming.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn domain_errors_carry_reason_codes() {
        let app = app();
        let (alice, alice_token) = app.register("alice", false).await;

        let (status, body) = app
            .call("POST", "/knocks", Some(&alice_token), Some(json!({ "to": alice })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "self_target");

        let (status, body) = app
            .call("POST", "/knocks", Some(&alice_token), Some(json!({ "to": uuid::Uuid::new_v4() })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "target_not_found");

        let uri = format!("/knocks/{}/decline", uuid::Uuid::new_v4());
        let (status, body) = app.call("POST", &uri, Some(&alice_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "edge_not_eligible");
    }

    #[tokio::test]
    async fn restricted_chat_over_http() {
        let app = app();
        let (_, alice_token) = app.register("alice", false).await;
        let (bob, bob_token) = app.register("bob", true).await;

        let (status, access) = app
            .call("POST", "/chats", Some(&alice_token), Some(json!({ "with": bob })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(access["isRestricted"], true);
        let chat_id = access["chatId"].as_str().unwrap().to_string();
        let messages = format!("/chats/{}/messages", chat_id);

        let (status, sent) = app
            .call("POST", &messages, Some(&alice_token), Some(json!({ "body": "hi bob" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["access"]["allow"], false);

        let (status, body) = app
            .call("POST", &messages, Some(&alice_token), Some(json!({ "body": "hello?" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "chat_restricted");
        assert_eq!(body["message"], "recipient must reply to unlock");

        let (status, _) = app
            .call("POST", &messages, Some(&bob_token), Some(json!({ "body": "   " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call("POST", &messages, Some(&bob_token), Some(json!({ "body": "hey" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, access) = app
            .call("GET", &format!("/chats/{}/access", chat_id), Some(&alice_token), None)
            .await;
        assert_eq!(access["allow"], true);
        assert_eq!(access["isRestricted"], false);

        let (_, history) = app.call("GET", &messages, Some(&alice_token), None).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
    }
}
