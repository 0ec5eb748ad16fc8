use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::error::SyncError;
use crate::message::{
    ErrorReply, PullMessage, PullRequest, PushMessage, PushReply, RegisterReply, RepairMessage,
    WireError,
};
use crate::server::ServerEngine;
use crate::sync::Transport;

/// Serve the sync protocol on `addr` until the process exits. One request
/// at a time; the engine lock keeps version assignment serial.
pub fn serve(addr: &str, engine: ServerEngine) -> Result<(), SyncError> {
    let server = Server::http(addr).map_err(|e| SyncError::Transport(e.to_string()))?;
    info!("sync server listening on {addr}");
    serve_on(server, engine)
}

/// Same as [`serve`] for a listener the caller already bound, which is how
/// tests grab an ephemeral port.
pub fn serve_on(server: Server, engine: ServerEngine) -> Result<(), SyncError> {
    let engine = Mutex::new(engine);
    for mut request in server.incoming_requests() {
        match handle(&engine, &mut request) {
            Ok(response) => {
                if let Err(e) = request.respond(response) {
                    warn!("failed to respond: {e}");
                }
            }
            Err(e) => {
                warn!("request handling failed: {e}");
                let _ = request.respond(json_response(500, error_body(&e)));
            }
        }
    }
    Ok(())
}

fn handle(
    engine: &Mutex<ServerEngine>,
    request: &mut Request,
) -> Result<Response<std::io::Cursor<Vec<u8>>>, SyncError> {
    let mut body = String::new();
    request.as_reader().read_to_string(&mut body)?;
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (url.as_str(), None),
    };

    let engine = engine
        .lock()
        .map_err(|_| SyncError::Config("server engine lock poisoned"))?;
    match dispatch(&engine, request.method(), path, query, &body) {
        Ok(Some(json)) => Ok(json_response(200, json)),
        Ok(None) => Ok(json_response(
            404,
            String::from(r#"{"error":[{"code":"other","message":"no such route"}]}"#),
        )),
        Err(e) => {
            warn!("{:?} {} failed: {}", request.method(), path, e);
            Ok(json_response(status_for(&e), error_body(&e)))
        }
    }
}

/// Route one request; `Ok(None)` means no such route.
fn dispatch(
    engine: &ServerEngine,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &str,
) -> Result<Option<String>, SyncError> {
    let json = match (method, path) {
        (Method::Post, "/register") => serde_json::to_string(&engine.register()?)?,
        (Method::Post, "/push") => {
            let msg: PushMessage = serde_json::from_str(body)?;
            serde_json::to_string(&engine.handle_push(&msg)?)?
        }
        (Method::Post, "/pull") => {
            let req: PullRequest = serde_json::from_str(body)?;
            serde_json::to_string(&engine.handle_pull(&req)?)?
        }
        (Method::Get, "/repair") => serde_json::to_string(&engine.snapshot()?)?,
        (Method::Get, "/query") => {
            let type_id = query
                .and_then(|q| query_param(q, "type"))
                .ok_or(SyncError::Config("query requires a type parameter"))?;
            serde_json::to_string(&engine.query(&type_id)?)?
        }
        _ => return Ok(None),
    };
    Ok(Some(json))
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

fn status_for(e: &SyncError) -> u16 {
    match e {
        SyncError::Auth(_) => 401,
        SyncError::PushRejected { .. }
        | SyncError::UniqueConflict { .. }
        | SyncError::Integrity { .. }
        | SyncError::Serde(_)
        | SyncError::UnknownContentType(_)
        | SyncError::Config(_) => 400,
        _ => 500,
    }
}

fn error_body(e: &SyncError) -> String {
    let reply = ErrorReply {
        error: vec![WireError::from_error(e)],
    };
    serde_json::to_string(&reply).unwrap_or_else(|_| String::from(r#"{"error":[]}"#))
}

fn json_response(status: u16, body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid");
    Response::from_string(body)
        .with_status_code(StatusCode(status))
        .with_header(content_type)
}

/// Client transport over plain HTTP.
pub struct HttpTransport {
    base: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        Ok(Self { base, client })
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, SyncError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()?;
        read_reply(resp)
    }

    fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, SyncError> {
        let resp = self.client.get(format!("{}{}", self.base, path)).send()?;
        read_reply(resp)
    }
}

/// Success bodies parse as the expected reply; failure bodies carry typed
/// wire errors that turn back into `SyncError` values.
fn read_reply<R: DeserializeOwned>(resp: reqwest::blocking::Response) -> Result<R, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json()?);
    }
    match resp.json::<ErrorReply>() {
        Ok(reply) => match reply.error.into_iter().next() {
            Some(wire) => Err(wire.into_error()),
            None => Err(SyncError::Transport(format!("server replied {status}"))),
        },
        Err(_) => Err(SyncError::Transport(format!("server replied {status}"))),
    }
}

impl Transport for HttpTransport {
    fn register(&self) -> Result<RegisterReply, SyncError> {
        self.post("/register", &serde_json::json!({}))
    }

    fn push(&self, msg: &PushMessage) -> Result<PushReply, SyncError> {
        self.post("/push", msg)
    }

    fn pull(&self, req: &PullRequest) -> Result<PullMessage, SyncError> {
        self.post("/pull", req)
    }

    fn repair(&self) -> Result<RepairMessage, SyncError> {
        self.get("/repair")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_parsing() {
        assert_eq!(query_param("type=city", "type"), Some("city".to_string()));
        assert_eq!(
            query_param("a=1&type=person&b=2", "type"),
            Some("person".to_string())
        );
        assert_eq!(query_param("a=1", "type"), None);
        assert_eq!(query_param("type", "type"), None);
    }
}
