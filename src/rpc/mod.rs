//! The RPC Adapter (spec §4.8): exposes a VM's exported methods over a
//! websocket boundary. Mirrors the teacher's `serve` module's shape — a
//! `poem` `Route` bound by `Server`/`TcpListener` — but the endpoints are a
//! single dynamic websocket upgrade per mount instead of a REST surface,
//! since every mounted VM speaks the same call/response protocol.

pub mod protocol;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::{Data, Path};
use poem::{handler, listener::TcpListener, EndpointExt, IntoResponse, Route, Server};

use crate::error::CoreResult;
use crate::vm::Vm;
use protocol::{Handshake, Request, Response, RESERVED_METHODS};

/// Holds every currently-mounted VM, keyed by the path segment it's
/// reachable at. A factory VM mounts at its own path; each child it
/// provisions is mounted independently (spec §9) rather than nested under
/// the factory's.
pub struct RpcAdapter {
    mounts: RwLock<HashMap<String, Arc<Vm>>>,
}

impl RpcAdapter {
    pub fn new() -> Arc<RpcAdapter> {
        Arc::new(RpcAdapter {
            mounts: RwLock::new(HashMap::new()),
        })
    }

    pub fn mount(&self, path: impl Into<String>, vm: Arc<Vm>) {
        self.mounts.write().insert(path.into(), vm);
    }

    pub fn unmount(&self, path: &str) -> Option<Arc<Vm>> {
        self.mounts.write().remove(path)
    }

    pub fn mounted_paths(&self) -> Vec<String> {
        self.mounts.read().keys().cloned().collect()
    }

    fn get(&self, path: &str) -> Option<Arc<Vm>> {
        self.mounts.read().get(path).cloned()
    }

    /// Binds `addr` and serves every mount until the listener is dropped
    /// or the process is signalled to stop; mounting/unmounting while
    /// `listen` is running is safe since the route looks mounts up fresh
    /// on every connection.
    pub async fn listen(self: Arc<Self>, addr: &str) -> CoreResult<()> {
        let app = Route::new()
            .at("/:mount_id", poem::get(rpc_handler))
            .data(self);

        Server::new(TcpListener::bind(addr))
            .run(app)
            .await
            .map_err(crate::error::CoreError::Store)
    }

    /// Closes every mounted VM and clears the mount table. Individual
    /// mounts can also be torn down with [`Self::unmount`] without
    /// affecting the others.
    pub async fn close(&self) {
        let mounts: Vec<Arc<Vm>> = self.mounts.write().drain().map(|(_, vm)| vm).collect();
        for vm in mounts {
            vm.close().await;
        }
    }
}

#[handler]
fn rpc_handler(
    Path(mount_id): Path<String>,
    ws: WebSocket,
    Data(adapter): Data<&Arc<RpcAdapter>>,
) -> impl IntoResponse {
    let adapter = adapter.clone();
    ws.on_upgrade(move |socket| async move {
        if let Some(vm) = adapter.get(&mount_id) {
            serve_connection(vm, socket).await;
        }
    })
}

/// Runs one connection's handshake-then-request-loop. Never panics on a
/// malformed frame — an unparseable message is simply dropped, since the
/// protocol has no framing-level error channel before a request even
/// carries an `id` to reply against.
async fn serve_connection(vm: Arc<Vm>, socket: WebSocketStream) {
    let (mut sink, mut stream) = socket.split();

    let handshake = Handshake::for_methods(vm.methods(), vm.log().url(), vm.archive().url());
    if let Ok(text) = serde_json::to_string(&handshake) {
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Request>(&text) else {
            continue;
        };

        // `init` names the ledger's bootstrap entry, not a dispatchable
        // method — reject it here too, not just at handshake time, since a
        // client can send any method name regardless of what was advertised.
        let response = if RESERVED_METHODS.contains(&request.method.as_str()) {
            Response::err(
                request.id,
                &crate::error::CoreError::MethodNotSupported(request.method.clone()),
            )
        } else {
            match vm
                .execute_call(request.method, request.args, request.user_id)
                .await
            {
                Ok(result) => Response::ok(request.id, result),
                Err(e) => Response::err(request.id, &e),
            }
        };

        let Ok(text) = serde_json::to_string(&response) else {
            continue;
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
}
