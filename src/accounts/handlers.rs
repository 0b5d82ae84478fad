use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::dto::{
    is_valid_email, validate_credentials, validate_password, ChangePasswordRequest,
    FavoritesResponse, MessageResponse, RefreshRequest, RegisterResponse, TokenResponse,
};
use crate::{
    auth::{
        cookies::{extract_cookie, token_cookie_headers, REFRESH_COOKIE},
        AuthClaims, Claims, TokenPair,
    },
    entity::{EntityId, EntityKind},
    error::{AppError, AppResult},
    state::AppState,
};

/// Routes for one entity kind. The kind is fixed here and reaches the
/// handlers as an extension.
pub fn kind_routes(kind: EntityKind) -> Router<AppState> {
    let mut router = Router::new()
        .route("/", get(list_entities))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/me", get(get_me));

    if kind == EntityKind::User {
        router = router
            .route("/favorites", get(list_favorites))
            .route("/favorites/:restaurant_id", post(add_favorite));
    }

    router
        .route(
            "/:id",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
        .route("/:id/password", put(change_password))
        .layer(Extension(kind))
}

fn parse_id(raw: &str) -> AppResult<EntityId> {
    raw.parse()
}

/// Mutations are only allowed on the caller's own record.
fn ensure_owner(claims: &Claims, kind: EntityKind, id: EntityId) -> AppResult<()> {
    if claims.kind != kind || claims.sub != id {
        warn!(caller = %claims.sub, target = %id, %kind, "caller is not the owner");
        return Err(AppError::Forbidden);
    }
    Ok(())
}

fn token_response(state: &AppState, pair: TokenPair) -> AppResult<impl IntoResponse> {
    let cookies = token_cookie_headers(&pair, &state.tokens, state.config.cookie_secure)?;
    Ok((AppendHeaders(cookies), Json(TokenResponse::from(pair))))
}

#[instrument(skip(state, body))]
pub async fn register(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    Json(body): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let entity = kind.decode_request(body)?;
    validate_credentials(entity.as_ref())?;

    let entity_id = state.service.register(entity.as_ref()).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { entity_id })))
}

#[instrument(skip(state, body))]
pub async fn login(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    Json(body): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let credentials = kind.decode_request(body)?;
    if !is_valid_email(credentials.email()) {
        return Err(AppError::Validation("Invalid email".into()));
    }

    let (_, pair) = state
        .service
        .authenticate_and_issue_tokens(credentials.as_ref())
        .await
        .map_err(AppError::collapse_credentials)?;
    token_response(&state, pair)
}

#[instrument(skip(state, headers, body))]
pub async fn refresh(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> AppResult<impl IntoResponse> {
    let token = body
        .and_then(|Json(req)| req.refresh_token)
        .filter(|t| !t.is_empty())
        .or_else(|| extract_cookie(&headers, REFRESH_COOKIE))
        .ok_or_else(|| {
            warn!("refresh without token");
            AppError::InvalidToken
        })?;

    let pair = state.service.refresh_tokens(token.trim(), kind).await?;
    info!(%kind, "tokens refreshed");
    token_response(&state, pair)
}

#[instrument(skip(state, claims), fields(entity_id = %claims.sub))]
pub async fn get_me(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    AuthClaims(claims): AuthClaims,
) -> AppResult<Json<Value>> {
    if claims.kind != kind {
        return Err(AppError::Forbidden);
    }
    let entity = state.reader.get_by_id(claims.sub, kind).await?;
    Ok(Json(entity.public_view()?))
}

#[instrument(skip(state, _claims))]
pub async fn list_entities(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    AuthClaims(_claims): AuthClaims,
) -> AppResult<Json<Vec<Value>>> {
    let entities = state.service.list_entities(kind).await?;
    let views = entities
        .iter()
        .map(|e| e.public_view())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(views))
}

#[instrument(skip(state))]
pub async fn get_entity(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let entity = state.reader.get_by_id(id, kind).await?;
    Ok(Json(entity.public_view()?))
}

#[instrument(skip(state, claims, body))]
pub async fn update_entity(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Json<MessageResponse>> {
    let id = parse_id(&id)?;
    ensure_owner(&claims, kind, id)?;

    let changes = kind.decode_request(body)?;
    if !changes.email().is_empty() && !is_valid_email(changes.email()) {
        return Err(AppError::Validation("Invalid email".into()));
    }

    state.service.update_entity(id, changes.as_ref()).await?;
    state.reader.invalidate(id).await;
    Ok(Json(MessageResponse { message: "updated" }))
}

#[instrument(skip(state, claims))]
pub async fn delete_entity(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    let id = parse_id(&id)?;
    ensure_owner(&claims, kind, id)?;

    state.service.delete_entity(id, kind).await?;
    state.reader.invalidate(id).await;
    Ok(Json(MessageResponse { message: "deleted" }))
}

#[instrument(skip(state, claims, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    Extension(kind): Extension<EntityKind>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    let id = parse_id(&id)?;
    ensure_owner(&claims, kind, id)?;
    validate_password(&payload.new_password)?;

    state
        .service
        .change_password(id, &payload.old_password, &payload.new_password, kind)
        .await?;
    state.reader.invalidate(id).await;
    Ok(Json(MessageResponse {
        message: "password changed",
    }))
}

#[instrument(skip(state, claims), fields(entity_id = %claims.sub))]
pub async fn add_favorite(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(restaurant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if claims.kind != EntityKind::User {
        return Err(AppError::Forbidden);
    }
    let restaurant_id = parse_id(&restaurant_id)?;

    state.service.add_favorite(claims.sub, restaurant_id).await?;
    state.reader.invalidate(claims.sub).await;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "favorite added",
        }),
    ))
}

#[instrument(skip(state, claims), fields(entity_id = %claims.sub))]
pub async fn list_favorites(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
) -> AppResult<Json<FavoritesResponse>> {
    if claims.kind != EntityKind::User {
        return Err(AppError::Forbidden);
    }
    let favorites = state.service.list_favorites(claims.sub).await?;
    Ok(Json(FavoritesResponse { favorites }))
}
