//! One WebSocket connection: the `connect` handshake, then concurrent method
//! dispatch. Every frame leaves through a single writer task, so responses and
//! events are written in the order they were queued.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use {
    tradeclaw_common::{
        HookEvent,
        events::{ClientConnected, ClientDisconnected},
        time::now_ms,
    },
    tradeclaw_protocol::{
        ConnectParams, ErrorShape, PROTOCOL_VERSION, RequestFrame, ResponseFrame, error_codes,
        parse_request,
    },
    tradeclaw_sessions::{CreateOptions, SessionKey},
};

use crate::{
    auth::AuthResult,
    events::FrameSender,
    rate_limit,
    methods::{MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

fn send_frame<T: Serialize>(tx: &FrameSender, frame: &T) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(text);
        },
        Err(e) => warn!(error = %e, "failed to serialize frame"),
    }
}

/// Drive one connection until the client goes away.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session_key: Option<String> = None;
    let mut principal = String::new();
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                send_frame(
                    &tx,
                    &ResponseFrame::err(
                        "",
                        ErrorShape::new(error_codes::INVALID_FRAME, "binary frames are not supported"),
                    ),
                );
                continue;
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        let req = match parse_request(&text) {
            Ok(req) => req,
            Err((id, err)) => {
                warn!(conn_id = %conn_id, error = %err, "ws: invalid frame");
                send_frame(
                    &tx,
                    &ResponseFrame::err(id.as_deref().unwrap_or_default(), err.to_error_shape()),
                );
                continue;
            },
        };

        match (&session_key, req.method.as_str()) {
            (None, "connect") => {
                match connect(&state, &conn_id, remote_addr, &req, &tx).await {
                    Ok((key, charged_to)) => {
                        session_key = Some(key);
                        principal = charged_to;
                    },
                    Err(err) => send_frame(&tx, &ResponseFrame::err(&req.id, err)),
                }
            },
            (None, _) => {
                debug!(conn_id = %conn_id, method = %req.method, "ws: request before connect");
                send_frame(
                    &tx,
                    &ResponseFrame::err(
                        &req.id,
                        ErrorShape::new(
                            error_codes::AUTH_REQUIRED,
                            "first request must be connect",
                        ),
                    ),
                );
            },
            (Some(_), "connect") => {
                send_frame(
                    &tx,
                    &ResponseFrame::err(
                        &req.id,
                        ErrorShape::new(error_codes::INVALID_FRAME, "already connected"),
                    ),
                );
            },
            (Some(key), _) => {
                let ctx = MethodContext {
                    request_id: req.id,
                    method: req.method,
                    params: req.params,
                    conn_id: conn_id.clone(),
                    session_key: key.clone(),
                    principal: principal.clone(),
                    state: Arc::clone(&state),
                };
                let methods = Arc::clone(&methods);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = methods.dispatch(ctx).await;
                    send_frame(&tx, &response);
                });
            },
        }
    }

    if let Some(key) = &session_key {
        state.streams.unsubscribe(key, &conn_id);
    }
    state.remove_client(&conn_id).await;
    state.publish(HookEvent::ClientDisconnected(ClientDisconnected {
        conn_id: conn_id.clone(),
        session_key: session_key.clone(),
    }));
    writer.abort();
    info!(conn_id = %conn_id, session_key = ?session_key, "ws: connection closed");
}

/// Authenticate, bind the session and subscribe the connection to its event
/// stream. The response is queued before any replayed events.
///
/// Returns the session key and the rate-limit principal.
async fn connect(
    state: &Arc<GatewayState>,
    conn_id: &str,
    remote_addr: SocketAddr,
    req: &RequestFrame,
    tx: &FrameSender,
) -> Result<(String, String), ErrorShape> {
    let params: ConnectParams = match &req.params {
        Value::Null => ConnectParams::default(),
        v => serde_json::from_value(v.clone())
            .map_err(|e| ErrorShape::invalid_param("params", &e.to_string()))?,
    };

    let auth_label = match state
        .auth
        .authorize_connect(params.token.as_deref(), now_ms())
    {
        AuthResult::Open => None,
        AuthResult::Token { label } => label,
        AuthResult::Denied(failure) => {
            warn!(conn_id, reason = failure.reason(), "ws: auth failed");
            return Err(
                ErrorShape::new(failure.code(), "authentication failed")
                    .with_details(json!({ "reason": failure.reason() })),
            );
        },
    };

    let principal = rate_limit::principal(auth_label.as_deref(), remote_addr);
    let key = params
        .session_id
        .clone()
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| SessionKey::generated().0);
    state
        .services
        .sessions
        .get_or_restore(&key, CreateOptions {
            display_name: params.display_name.clone(),
            channel: params.channel.clone(),
            ..Default::default()
        })
        .await;

    state
        .register_client(ConnectedClient {
            conn_id: conn_id.to_string(),
            session_key: key.clone(),
            client: params.client.clone(),
            channel: params.channel.clone(),
            auth_label,
            remote_addr: Some(remote_addr),
            connected_at: Instant::now(),
        })
        .await;

    // Without a resume point the client still gets whatever was published to
    // its stream between this response and the subscription.
    let resume_from = params
        .resume
        .as_ref()
        .map_or_else(|| state.streams.last_seq(&key), |r| r.last_seq);
    let replay = state.streams.replay(&key, resume_from);

    send_frame(
        tx,
        &ResponseFrame::ok(
            &req.id,
            json!({
                "sessionId": key,
                "gatewayId": state.gateway_id,
                "version": state.version,
                "protocol": PROTOCOL_VERSION,
                "connId": conn_id,
                "health": state.health().await,
                "resume": params.resume.as_ref().map(|_| json!({
                    "gap": replay.gap,
                    "oldestSeq": replay.oldest_seq,
                    "replayed": replay.events.len(),
                })),
            }),
        ),
    );
    state
        .streams
        .subscribe(&key, conn_id, tx.clone(), Some(resume_from));

    info!(
        conn_id,
        session_key = %key,
        client_id = ?params.client.id,
        platform = ?params.client.platform,
        "ws: handshake complete"
    );
    state.publish(HookEvent::ClientConnected(ClientConnected {
        conn_id: conn_id.to_string(),
        session_key: key.clone(),
        client_id: params.client.id.clone(),
        channel: params.channel.clone(),
    }));
    Ok((key, principal))
}
