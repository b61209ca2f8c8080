//! Operator HTTP API for creating and steering sessions.

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::clock::Millis;
use crate::error::{OrchestratorError, Result};
use crate::state::StateType;

#[derive(Debug, Deserialize)]
pub struct CreateSession {
    pub filename: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub scheduled_start_time: Option<Millis>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipant {
    pub username: String,
    /// Title of one of the user's authorized devices.
    pub device: String,
}

fn with_state(state: StateType) -> impl Filter<Extract = (StateType,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn status_for(error: &OrchestratorError) -> StatusCode {
    use OrchestratorError::*;
    match error {
        InvalidDuration(_) => StatusCode::BAD_REQUEST,
        SessionNotFound(_) | NotParticipant { .. } => StatusCode::NOT_FOUND,
        SessionStopped(_)
        | AlreadyStarted(_)
        | NotActive(_)
        | NotPaused(_)
        | AlreadyInSession { .. } => StatusCode::CONFLICT,
        UnauthorizedDevice { .. } | ValidationFailed(_) => StatusCode::FORBIDDEN,
        UserOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
        Clock(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(result: Result<T>, success: StatusCode) -> Response {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), success).into_response(),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "error": e.to_string() })),
            status_for(&e),
        )
        .into_response(),
    }
}

pub fn routes(state: StateType) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let list = warp::path!("sessions")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_sessions);
    let create = warp::path!("sessions")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(create_session);
    let show = warp::path!("sessions" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(show_session);
    let remove = warp::path!("sessions" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(remove_session);
    let join = warp::path!("sessions" / String / "participants")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(add_participant);
    let leave = warp::path!("sessions" / String / "participants" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(remove_participant);
    let control = warp::path!("sessions" / String / String)
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(control_session);
    let users = warp::path!("users")
        .and(warp::get())
        .and(with_state(state))
        .and_then(list_users);

    list.or(create)
        .unify()
        .or(show)
        .unify()
        .or(remove)
        .unify()
        .or(join)
        .unify()
        .or(leave)
        .unify()
        .or(control)
        .unify()
        .or(users)
        .unify()
}

async fn list_sessions(state: StateType) -> std::result::Result<Response, Rejection> {
    Ok(reply(Ok(state.sessions.list_sessions().await), StatusCode::OK))
}

async fn create_session(
    body: CreateSession,
    state: StateType,
) -> std::result::Result<Response, Rejection> {
    let created = state
        .sessions
        .create_session(&body.filename, body.duration_ms, body.scheduled_start_time)
        .await;
    Ok(reply(created, StatusCode::CREATED))
}

async fn show_session(id: String, state: StateType) -> std::result::Result<Response, Rejection> {
    Ok(reply(state.sessions.session(&id).await, StatusCode::OK))
}

async fn remove_session(id: String, state: StateType) -> std::result::Result<Response, Rejection> {
    Ok(reply(state.sessions.remove_session(&id).await, StatusCode::OK))
}

async fn add_participant(
    id: String,
    body: AddParticipant,
    state: StateType,
) -> std::result::Result<Response, Rejection> {
    let result = match state
        .sessions
        .add_participant(&id, &body.username, &body.device)
        .await
    {
        Ok(()) => state.sessions.session(&id).await,
        Err(e) => Err(e),
    };
    Ok(reply(result, StatusCode::OK))
}

async fn remove_participant(
    id: String,
    username: String,
    state: StateType,
) -> std::result::Result<Response, Rejection> {
    let result = match state.sessions.remove_participant(&id, &username).await {
        Ok(()) => state.sessions.session(&id).await,
        Err(e) => Err(e),
    };
    Ok(reply(result, StatusCode::OK))
}

async fn control_session(
    id: String,
    action: String,
    state: StateType,
) -> std::result::Result<Response, Rejection> {
    let sessions = &state.sessions;
    let result = match action.as_str() {
        "start" => sessions.start_session(&id).await,
        "pause" => sessions.pause_session(&id).await,
        "resume" => sessions.resume_session(&id).await,
        "stop" => sessions.stop_session(&id).await,
        _ => return Err(warp::reject::not_found()),
    };
    let result = match result {
        Ok(()) => sessions.session(&id).await,
        Err(e) => Err(e),
    };
    Ok(reply(result, StatusCode::OK))
}

async fn list_users(state: StateType) -> std::result::Result<Response, Rejection> {
    Ok(reply(Ok(state.registry.users().await), StatusCode::OK))
}
