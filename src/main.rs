use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use failure::{format_err, Error};
use futures_util::{future, pin_mut, stream, stream::TryStreamExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::args::Args;
use crate::message::{ClientMessage, ServerMessage};
use crate::registry::{ConnectionId, Registration, Tx};
use crate::state::{State, StateType};

mod admin;
mod args;
mod clock;
mod config;
mod drift;
mod error;
mod intermission;
mod message;
mod metrics;
mod orchestrator;
mod registry;
mod scheduler;
mod session;
mod state;
mod validator;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct Credentials {
    username: Option<String>,
    passkey: Option<String>,
}

/// The authenticated end of one WebSocket connection.
struct Peer {
    id: ConnectionId,
    username: String,
    tx: Tx,
}

impl Peer {
    async fn reply(&self, message: ServerMessage) {
        if let Err(e) = self.tx.send(message).await {
            info!("Error replying to {}: {}", self.username, e);
        }
    }
}

async fn handle_message(state: &State, peer: &Peer, raw_payload: &str) -> Result<()> {
    match ClientMessage::decode(raw_payload)? {
        ClientMessage::Register {
            username,
            authorized_clients,
        } => {
            if let Some(claimed) = username.filter(|u| *u != peer.username) {
                info!(
                    "Connection {} authenticated as {} tried to register as {}",
                    peer.id, peer.username, claimed
                );
                peer.reply(ServerMessage::RegisterDeclined {
                    reason: format!("authenticated as {}", peer.username),
                })
                .await;
                return Ok(());
            }
            let registration = state
                .registry
                .register(&peer.username, peer.id, peer.tx.clone(), authorized_clients)
                .await;
            let devices = state.registry.authorized_clients(&peer.username).await;
            peer.reply(ServerMessage::Registered { devices }).await;
            if registration != Registration::Updated {
                state.sessions.on_register(&peer.username).await;
            }
        }
        ClientMessage::StatusUpdate {
            filename,
            offset_ms,
        } => {
            if !state.registry.is_registered(&peer.username, peer.id).await {
                return Err(format_err!(
                    "status update before registration on connection {}",
                    peer.id
                ));
            }
            let verdict = state
                .sessions
                .status_update(&peer.username, &filename, offset_ms)
                .await?;
            debug!(
                "{} reports {} at {} ms: {:?}",
                peer.username, filename, offset_ms, verdict
            );
        }
        ClientMessage::KeepAlive {} => {}
        ClientMessage::Unknown => {
            info!("Ignoring unknown message from {}: {}", peer.username, raw_payload);
        }
    };
    Ok(())
}

async fn process_message(
    msg: Message,
    state: &State,
    peer: &Peer,
) -> std::result::Result<(), warp::Error> {
    if !msg.is_text() {
        return Ok(());
    }

    if let Ok(s) = msg.to_str() {
        if let Err(e) = handle_message(state, peer, s).await {
            info!(
                "Error occurred when handling message: {}\nMessage: {}",
                e, s
            );
        }
    }
    Ok(())
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            warn!("Could not encode {:?}: {}", message, e);
            None
        }
    }
}

async fn handle_connection(state: StateType, websocket: WebSocket, username: String, addr: IpAddr) {
    let hashed_ip = metrics::hash_ip(addr, &state.config.ip_hash_salt).unwrap_or_else(|e| {
        warn!("Could not hash client address: {}", e);
        String::from("unknown")
    });

    metrics::NUM_CONNECTED_CLIENTS
        .with_label_values(&[hashed_ip.as_str()])
        .inc();

    let (tx, rx) = mpsc::channel(state.config.send_buffer.max(1));
    let peer = Peer {
        id: state.next_connection_id(),
        username,
        tx,
    };
    info!(
        "WebSocket connection {} established for {}",
        peer.id, peer.username
    );
    let (outgoing, incoming) = websocket.split();

    let handle_incoming = incoming.try_for_each(|msg| process_message(msg, &state, &peer));

    let receive_from_others =
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (msg, rx)) })
            .filter_map(|msg| future::ready(encode(&msg)))
            .map(Ok)
            .forward(outgoing);

    pin_mut!(handle_incoming, receive_from_others);
    future::select(handle_incoming, receive_from_others).await;

    metrics::NUM_CONNECTED_CLIENTS
        .with_label_values(&[hashed_ip.as_str()])
        .dec();
    info!("{} disconnected (connection {})", peer.username, peer.id);
    state.sessions.on_disconnect(&peer.username, peer.id).await;
}

fn with_state(state: StateType) -> impl Filter<Extract = (StateType,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// WebSocket endpoint at `/ws`. Credentials are checked before the upgrade; a failed
/// check answers 401 and never reaches the registry.
fn ws_route<F>(
    state: StateType,
    client_ip: F,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone
where
    F: Filter<Extract = (IpAddr,), Error = Infallible> + Clone + Send + Sync + 'static,
{
    warp::path!("ws")
        .and(warp::ws())
        .and(warp::query::<Credentials>())
        .and(client_ip)
        .and(with_state(state))
        .and_then(
            |ws: warp::ws::Ws, credentials: Credentials, ip: IpAddr, state: StateType| async move {
                let authenticated = state
                    .authenticate(
                        credentials.username.as_deref(),
                        credentials.passkey.as_deref(),
                    )
                    .await;
                let response = match authenticated {
                    Ok(username) => ws
                        .on_upgrade(move |socket| handle_connection(state, socket, username, ip))
                        .into_response(),
                    Err(e) => {
                        info!("Refusing connection from {}: {}", ip, e);
                        warp::reply::with_status(e.to_string(), StatusCode::UNAUTHORIZED)
                            .into_response()
                    }
                };
                Ok::<_, Rejection>(response)
            },
        )
}

fn forwarded_ip() -> impl Filter<Extract = (IpAddr,), Error = Infallible> + Clone {
    warp_real_ip::get_forwarded_for().map(|ip_addrs: Vec<IpAddr>| {
        ip_addrs
            .last()
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    })
}

pub(crate) async fn start_server(
    addr: SocketAddr,
    admin_addr: SocketAddr,
    state: StateType,
) -> Result<()> {
    metrics::register();

    let metrics_route = warp::path!("metrics").and_then(metrics::metrics_handler);
    let admin_routes = admin::routes(state.clone()).or(metrics_route);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_signal = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    let (addr, ws_server) = warp::serve(ws_route(state.clone(), forwarded_ip()))
        .try_bind_with_graceful_shutdown(addr, shutdown_signal(shutdown_rx.clone()))?;
    let (admin_addr, admin_server) = warp::serve(admin_routes)
        .try_bind_with_graceful_shutdown(admin_addr, shutdown_signal(shutdown_rx))?;

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for ctrl-c: {}", e);
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Server listening on {}", addr);
    info!("Admin API and metrics listening on {}", admin_addr);
    future::join(ws_server, admin_server).await;
    state.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();
    let address: SocketAddr = args.address.parse()?;
    let admin_address: SocketAddr = args.admin_address.parse()?;

    let config = config::load(&args.config)?;
    let state = State::new(&config);

    start_server(address, admin_address, state).await
}
