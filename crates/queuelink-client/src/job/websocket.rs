//! Dedicated socket per job.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};
use url::Url;

use queuelink_core::constants::SOCKET_HASH_ON_OPEN_BELOW;
use queuelink_core::version::is_older_than;
use queuelink_core::{Stage, Status};

use super::{JobInner, Payload, Step};
use crate::config::resolve_root;

/// Socket URL for `/queue/join`, signed with the space token when present.
fn join_url(job: &JobInner) -> crate::errors::Result<Url> {
    let shared = &job.shared;
    let endpoint = &shared.endpoint;
    let mount = shared.config.path.trim_end_matches('/');
    let host = if endpoint.host.ends_with(mount) {
        endpoint.host.clone()
    } else {
        resolve_root(&endpoint.host, mount, true)
    };
    let mut url = Url::parse(&format!("{}://{host}/queue/join", endpoint.ws_protocol))?;
    if let Some(jwt) = &shared.jwt {
        let _ = url.query_pairs_mut().append_pair("__sign", jwt);
    }
    Ok(url)
}

pub(super) async fn run(job: &JobInner, payload: Payload) {
    let _ = job.emit_status(Status::new(Stage::Pending, true));

    let url = match join_url(job) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "invalid socket url");
            job.fail_broken();
            return;
        }
    };

    // A cancel issued while connecting closes the socket as soon as it opens.
    let mut socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(e) => {
            warn!(url = %url, error = %e, "socket connect failed");
            job.fail_broken();
            return;
        }
    };
    debug!(url = %url, "socket open");
    if job.cancel.is_cancelled() {
        let _ = socket.close(None).await;
        return;
    }

    let shared = &job.shared;
    let hash_reply = json!({ "fn_index": job.fn_index, "session_hash": shared.session_hash });
    if is_older_than(shared.config.version_or_default(), SOCKET_HASH_ON_OPEN_BELOW) {
        let hello = json!({ "hash": shared.session_hash }).to_string();
        if socket.send(Message::Text(hello.into())).await.is_err() {
            job.fail_broken();
            return;
        }
    }

    loop {
        let frame = tokio::select! {
            () = job.cancel.cancelled() => {
                let _ = socket.close(None).await;
                return;
            }
            frame = socket.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => {
                debug!(fn_index = job.fn_index, "socket closed by service");
                if !job.is_terminal() {
                    job.fail_broken();
                }
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(fn_index = job.fn_index, error = %e, "socket read failed");
                job.fail_broken();
                return;
            }
            None => {
                job.fail_broken();
                return;
            }
        };

        let raw: Value = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                error!(fn_index = job.fn_index, error = %e, "socket message is not JSON");
                job.fail_unexpected();
                let _ = socket.close(None).await;
                return;
            }
        };

        let reply = match job.process(&raw, None) {
            Step::Continue => continue,
            Step::SendHash => hash_reply.to_string(),
            Step::SendData => match serde_json::to_string(&payload) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "could not encode payload");
                    job.fail_unexpected();
                    let _ = socket.close(None).await;
                    return;
                }
            },
            Step::Close => {
                let _ = socket.close(None).await;
                return;
            }
        };
        if socket.send(Message::Text(reply.into())).await.is_err() {
            job.fail_broken();
            return;
        }
    }
}
