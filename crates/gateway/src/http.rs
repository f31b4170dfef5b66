//! REST surface: login/registration/account management, room CRUD, subtitle
//! upload/download, and the WebSocket upgrade endpoint that hands off into
//! [`crate::session::run`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Json},
};
use axum_extra::extract::{
    cookie::{Cookie, CookieJar, SameSite},
    Query as MultiQuery,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use watchroom_common::{Error, Result};
use watchroom_protocol::{
    outgoing::{ChatMessageWire, OutgoingMessage, ProfileUpdateData, RoomInfoWire},
    validation, SYSTEM_USER_ID,
};

use crate::{
    auth::{self, TOKEN_COOKIE_NAME},
    registry::SinkEvent,
    server::AppState,
};

const RESET_TOKEN_TTL_MINUTES: i64 = 10;
const TOKEN_COOKIE_MAX_AGE_DAYS: i64 = 31;

fn chat_wire(msg: watchroom_db::ChatMessage) -> ChatMessageWire {
    ChatMessageWire {
        id: msg.id,
        user_id: msg.user_id.unwrap_or(SYSTEM_USER_ID),
        message: msg.message,
        timestamp: msg.timestamp,
    }
}

fn token_cookie(state: &AppState, value: String, max_age_days: i64) -> Cookie<'static> {
    let mut cookie = Cookie::new(TOKEN_COOKIE_NAME, value);
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(state.config.secure_cookies);
    cookie.set_path(state.config.base_path.clone());
    cookie.set_max_age(Some(time::Duration::days(max_age_days)));
    cookie
}

fn expired_token_cookie(state: &AppState) -> Cookie<'static> {
    let mut cookie = Cookie::new(TOKEN_COOKIE_NAME, "");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(state.config.secure_cookies);
    cookie.set_path(state.config.base_path.clone());
    cookie.set_max_age(Some(time::Duration::seconds(-1)));
    cookie
}

/// Resolves the bearer/cookie token to its `(Token, User)` pair, or `Unauthenticated`.
async fn authenticate(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    jar: &CookieJar,
) -> Result<(watchroom_db::Token, watchroom_db::User)> {
    let token = auth::extract_token(headers, jar)
        .ok_or_else(|| Error::Unauthenticated("Not authenticated.".to_string()))?;
    state.gateway.find_token(&token).await
}

// ── GET / ────────────────────────────────────────────────────────────────

pub async fn status(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
) -> impl IntoResponse {
    let Ok((_, user)) = authenticate(&state, &headers, &jar).await else {
        return Json(json!({ "online": true, "authenticated": false }));
    };
    Json(json!({
        "online": true,
        "authenticated": true,
        "username": user.username,
        "userId": user.id,
    }))
}

// ── Auth / account ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginBody {
    username: String,
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse> {
    let user = state
        .gateway
        .find_user_by_username(&body.username)
        .await
        .map_err(|_| Error::Unauthenticated("Invalid username or password.".to_string()))?;

    if !auth::verify_password(&body.password, &user.password_hash) {
        return Err(Error::Unauthenticated("Invalid username or password.".to_string()));
    }
    if !user.verified {
        return Err(Error::Forbidden("Your account is not verified yet!".to_string()));
    }

    let token = state.gateway.insert_token(user.id).await?;
    let jar = jar.add(token_cookie(&state, token.token.clone(), TOKEN_COOKIE_MAX_AGE_DAYS));
    Ok((jar, Json(json!({ "token": token.token, "username": user.username }))))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    if let Some(token) = auth::extract_token(&headers, &jar) {
        if let Ok((tok, user)) = state.gateway.find_token(&token).await {
            state.registry.disconnect_user_sessions(user.id, &tok.token);
            state.gateway.delete_token(&token).await?;
        }
    }
    let jar = jar.add(expired_token_cookie(&state));
    Ok((jar, Json(json!({ "ok": true }))))
}

#[derive(Deserialize)]
pub struct RegisterBody {
    username: String,
    email: String,
    password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse> {
    validation::validate_username(&body.username)?;
    validation::validate_email(&body.email)?;
    validation::validate_password(&body.password)?;

    if state.gateway.find_user_by_email(&body.email).await.is_ok() {
        return Err(Error::Conflict("An account with this email already exists!".to_string()));
    }
    if state.gateway.find_user_by_username(&body.username).await.is_ok() {
        return Err(Error::Conflict("An account with this username already exists!".to_string()));
    }

    let hash = auth::hash_password(&body.password)?;
    let user = state.gateway.insert_user(&body.username, &body.email, &hash).await?;
    Ok(Json(json!({ "id": user.id, "username": user.username })))
}

#[derive(Deserialize)]
pub struct ForgotPasswordQuery {
    user: String,
}

pub async fn forgot_password(
    State(state): State<AppState>,
    Query(query): Query<ForgotPasswordQuery>,
) -> Result<impl IntoResponse> {
    let Ok(user) = state.gateway.find_user_by_username(&query.user).await else {
        // Do not reveal whether the account exists.
        return Ok(Json(json!({ "ok": true })));
    };
    if state.gateway.recent_reset_token_exists(user.id).await? {
        return Err(Error::TooManyRequests(
            "A password reset was already requested recently.".to_string(),
        ));
    }
    let reset = state.gateway.insert_password_reset_token(user.id).await?;
    tracing::info!(user_id = %user.id, reset_id = %reset.id, "password reset token issued");
    // Email delivery is an external collaborator; this core only mints the token.
    Ok(Json(json!({ "ok": true })))
}

pub async fn check_reset_token(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let reset = state.gateway.find_password_reset_token(token).await?;
    if is_reset_token_expired(&reset) {
        state.gateway.delete_password_reset_token(token).await?;
        return Err(Error::NotFound("This password reset token has expired!".to_string()));
    }
    Ok(Json(json!({ "valid": true })))
}

fn is_reset_token_expired(reset: &watchroom_db::PasswordResetToken) -> bool {
    chrono::Utc::now() - reset.created_at > chrono::Duration::minutes(RESET_TOKEN_TTL_MINUTES)
}

#[derive(Deserialize)]
pub struct ResetPasswordBody {
    token: Uuid,
    password: String,
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordBody>,
) -> Result<impl IntoResponse> {
    validation::validate_password(&body.password)?;
    let reset = state.gateway.find_password_reset_token(body.token).await?;
    if is_reset_token_expired(&reset) {
        state.gateway.delete_password_reset_token(body.token).await?;
        return Err(Error::NotFound("This password reset token has expired!".to_string()));
    }
    let hash = auth::hash_password(&body.password)?;
    state.gateway.update_user_password(reset.user_id, &hash).await?;
    state.gateway.delete_password_reset_token(body.token).await?;
    state.gateway.delete_tokens_for_user(reset.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangePasswordBody>,
) -> Result<impl IntoResponse> {
    let (_, user) = authenticate(&state, &headers, &jar).await?;
    if !auth::verify_password(&body.current_password, &user.password_hash) {
        return Err(Error::Unauthenticated("Invalid current password.".to_string()));
    }
    validation::validate_password(&body.new_password)?;
    let hash = auth::hash_password(&body.new_password)?;
    state.gateway.update_user_password(user.id, &hash).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeUsernameBody {
    current_password: String,
    new_username: String,
}

pub async fn change_username(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangeUsernameBody>,
) -> Result<impl IntoResponse> {
    let (_, user) = authenticate(&state, &headers, &jar).await?;
    if !auth::verify_password(&body.current_password, &user.password_hash) {
        return Err(Error::Unauthenticated("Invalid current password.".to_string()));
    }
    validation::validate_username(&body.new_username)?;
    if state.gateway.find_user_by_username(&body.new_username).await.is_ok() {
        return Err(Error::Conflict("An account with this username already exists!".to_string()));
    }
    state.gateway.update_username(user.id, &body.new_username).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEmailBody {
    current_password: String,
    new_email: String,
}

pub async fn change_email(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangeEmailBody>,
) -> Result<impl IntoResponse> {
    let (_, user) = authenticate(&state, &headers, &jar).await?;
    if !auth::verify_password(&body.current_password, &user.password_hash) {
        return Err(Error::Unauthenticated("Invalid current password.".to_string()));
    }
    validation::validate_email(&body.new_email)?;
    state.gateway.update_email(user.id, &body.new_email).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAccountBody {
    current_password: String,
}

pub async fn delete_account(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<DeleteAccountBody>,
) -> Result<impl IntoResponse> {
    let (token, user) = authenticate(&state, &headers, &jar).await?;
    if !auth::verify_password(&body.current_password, &user.password_hash) {
        return Err(Error::Unauthenticated("Invalid current password.".to_string()));
    }
    state.registry.disconnect_user_sessions(user.id, &token.token);
    state.gateway.delete_user(user.id).await?;
    let jar = jar.add(expired_token_cookie(&state));
    Ok((jar, Json(json!({ "ok": true }))))
}

#[derive(Deserialize)]
pub struct UsernamesQuery {
    #[serde(default)]
    id: Vec<Uuid>,
}

pub async fn usernames(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    // `?id=…&id=…` repeats the same key; the stock `axum::extract::Query`
    // (serde_urlencoded) can't collect that into a `Vec`, so this uses
    // axum-extra's `serde_html_form`-backed extractor instead.
    MultiQuery(query): MultiQuery<UsernamesQuery>,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    if query.id.is_empty() {
        return Err(Error::BadInput("No user IDs provided!".to_string()));
    }
    let pairs = state.gateway.find_usernames(&query.id).await?;
    Ok(Json(json!({
        "usernames": pairs.into_iter().map(|(id, name)| json!({ "id": id, "username": name })).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct ChangeAvatarBody {
    digest: Option<String>,
}

/// Not part of the realtime core (avatar decode/encode is an external
/// collaborator), but the cross-room fan-out on change is — see
/// `ConnectionRegistry::user_room_ids`.
pub async fn change_avatar(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangeAvatarBody>,
) -> Result<impl IntoResponse> {
    let (_, user) = authenticate(&state, &headers, &jar).await?;
    state
        .gateway
        .update_avatar_digest(user.id, body.digest.as_deref())
        .await?;
    for room_id in state.registry.user_room_ids(user.id) {
        state.registry.broadcast_room(
            &room_id,
            SinkEvent::Message(OutgoingMessage::UserProfileUpdate {
                id: user.id,
                data: ProfileUpdateData { avatar: body.digest.clone() },
            }),
        );
    }
    Ok(Json(json!({ "ok": true })))
}

// ── Room CRUD ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRoomBody {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    room_type: String,
    #[serde(default)]
    target: String,
}

fn random_room_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..12)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

pub async fn create_room(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateRoomBody>,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    let id = validation::validate_room_id(&body.id)?;
    validation::validate_room_type_target(&body.room_type, &body.target)?;
    let id = id.map(str::to_string).unwrap_or_else(random_room_id);
    let room = state.gateway.insert_room(&id, &body.room_type, &body.target).await?;
    Ok(Json(json!({ "id": room.id })))
}

pub async fn get_room(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    let room = state.gateway.find_room(&room_id).await?;
    let chat = state.gateway.find_chat(&room_id).await?;
    let subtitle_names = state.gateway.find_subtitle_names(&room_id).await?;
    Ok(Json(json!({
        "room": RoomInfoWire {
            id: room.id,
            created_at: room.created_at,
            modified_at: room.modified_at,
            room_type: room.room_type,
            target: room.target,
        },
        "playerState": room.player_state,
        "chat": chat.into_iter().map(chat_wire).collect::<Vec<_>>(),
        "subtitles": subtitle_names,
    })))
}

#[derive(Deserialize)]
pub struct UpdateRoomBody {
    #[serde(rename = "type")]
    room_type: String,
    target: String,
}

pub async fn update_room(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Path(room_id): Path<String>,
    Json(body): Json<UpdateRoomBody>,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    validation::validate_room_type_target(&body.room_type, &body.target)?;
    let (created_at, modified_at) = state
        .gateway
        .update_room(&room_id, &body.room_type, &body.target)
        .await?;

    state.registry.broadcast_room(
        &room_id,
        SinkEvent::Message(OutgoingMessage::RoomInfo(RoomInfoWire {
            id: room_id.clone(),
            created_at,
            modified_at,
            room_type: body.room_type.clone(),
            target: body.target.clone(),
        })),
    );
    Ok(Json(json!({ "ok": true })))
}

// ── WebSocket upgrade ────────────────────────────────────────────────────

pub async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols(["v0"]).on_upgrade(move |socket| {
        crate::session::run(socket, room_id, state.registry, state.gateway)
    })
}

// ── Subtitles ────────────────────────────────────────────────────────────

const MAX_SUBTITLE_BYTES: usize = 1024 * 1024;

#[derive(Deserialize)]
pub struct SubtitleNameQuery {
    name: String,
}

pub async fn get_subtitle(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Path(room_id): Path<String>,
    Query(query): Query<SubtitleNameQuery>,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    let data = state.gateway.find_subtitle(&room_id, &query.name).await?;
    Ok(data)
}

pub async fn upload_subtitle(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Path(room_id): Path<String>,
    Query(query): Query<SubtitleNameQuery>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    authenticate(&state, &headers, &jar).await?;
    if body.len() > MAX_SUBTITLE_BYTES {
        return Err(Error::PayloadTooLarge("Subtitle file is too large.".to_string()));
    }
    state
        .gateway
        .insert_subtitle(&room_id, &query.name, &body)
        .await
        .map_err(|_| Error::NotFound("Room not found!".to_string()))?;

    state.registry.broadcast_room(
        &room_id,
        SinkEvent::Message(OutgoingMessage::Subtitle { data: vec![query.name.clone()] }),
    );
    Ok(Json(json!({ "ok": true })))
}
