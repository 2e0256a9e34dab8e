//! WebSocket endpoint: upgrades `/ws?page=<route>`, spawns the session, and
//! pumps frames both ways until the client leaves or the server drains.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::prelude::*;
use crate::serve::proto::{ClientFrame, ServerFrame};
use crate::serve::Server;
use crate::session::{self, SessionMsg};

pub async fn upgrade(
    State(server): State<Server>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(route) = params.get("page").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing ?page=<route>").into_response();
    };

    let Some(page) = server.site.page(&route) else {
        return (StatusCode::NOT_FOUND, format!("no page at '{route}'")).into_response();
    };

    ws.on_upgrade(move |socket| handle(server, page, socket))
}

async fn handle(server: Server, page: std::sync::Arc<crate::compile::Page>, socket: WebSocket) {
    server.sessions.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
    let handle = session::spawn(
        page.clone(),
        server.site.registry.clone(),
        server.ctx.operator().map(str::to_owned),
        out_tx,
    );

    let mut reloads = server.site.subscribe_reload();
    let mut shutdown = server.shutdown.clone();
    let hot_reload = server.ctx.features.hot_reload;

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ClientFrame::Event(event)) => {
                            handle.send(SessionMsg::Event(event)).await;
                        }
                        Ok(ClientFrame::Ping) => {}
                        Err(err) => {
                            debug!("undecodable client frame: {err}");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("websocket receive error: {err}");
                        break;
                    }
                }
            }

            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(json) = serde_json::to_string(&frame) else { continue };

                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            changed_route = reloads.recv() => {
                if let Ok(changed) = changed_route {
                    if hot_reload && changed == page.route {
                        handle.send(SessionMsg::Reload).await;
                    }
                }
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let close = ServerFrame::Close {
                        reason: "server shutting down".into(),
                    };
                    if let Ok(json) = serde_json::to_string(&close) {
                        let _ = sink.send(Message::Text(json)).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    handle.send(SessionMsg::Close).await;
    server.sessions.fetch_sub(1, Ordering::SeqCst);
}
