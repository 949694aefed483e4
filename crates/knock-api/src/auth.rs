use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use knock_core::{MessageGate, Notifier, RelationshipEngine};
use knock_db::Database;
use knock_gateway::Dispatcher;
use knock_types::api::{
    Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, SetPrivacyRequest,
};

use crate::error::{ApiError, ApiResult, run_blocking};
use crate::middleware::create_token;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub engine: RelationshipEngine,
    pub gate: MessageGate,
    pub dispatcher: Dispatcher,
    pub jwt_secret: Arc<str>,
}

impl AppStateInner {
    /// Wire the engine and gate over one database.
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        notifier: Arc<dyn Notifier>,
        jwt_secret: impl Into<Arc<str>>,
        max_attempts: u32,
    ) -> AppState {
        let engine = RelationshipEngine::new(db.clone(), db.clone(), notifier)
            .with_max_attempts(max_attempts);
        let gate = MessageGate::new(db.clone(), db.clone(), engine.clone());

        Arc::new(Self {
            db,
            engine,
            gate,
            dispatcher,
            jwt_secret: jwt_secret.into(),
        })
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation("username must be 3-32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation("password must be at least 8 characters".into()));
    }

    let user_id = Uuid::new_v4();
    let username = req.username.clone();
    let db = state.db.clone();

    run_blocking(move || {
        if db.get_user_by_username(&req.username)?.is_some() {
            return Err(ApiError::UsernameTaken);
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();

        // A concurrent registration can pass the lookup above
        db.create_user(&user_id.to_string(), &req.username, &password_hash, req.is_private)
            .map_err(|e| {
                if knock_db::is_unique_violation(&e) {
                    ApiError::UsernameTaken
                } else {
                    ApiError::Internal(e)
                }
            })?;
        Ok(())
    })
    .await?;

    info!("Registered {} ({})", username, user_id);

    let token = create_token(&state.jwt_secret, user_id, &username)?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();

    let user = run_blocking(move || {
        let user = db
            .get_user_by_username(&req.username)?
            .ok_or(ApiError::Unauthorized)?;

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("corrupt password hash for {}: {}", user.username, e))?;

        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(user)
    })
    .await?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt user id '{}': {}", user.id, e))?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        is_private: user.is_private,
        token,
    }))
}

pub async fn set_privacy(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetPrivacyRequest>,
) -> ApiResult<StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let is_private = req.is_private;

    let updated = run_blocking(move || Ok(db.set_private(&user_id.to_string(), is_private)?)).await?;
    if !updated {
        return Err(ApiError::Unauthorized);
    }

    info!("{} ({}) set private={}", claims.username, user_id, is_private);
    Ok(StatusCode::NO_CONTENT)
}
