use std::str::FromStr;
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::warn;

use super::auth::{GitAuthError, authenticate, authorize};
use super::process::StreamingProcess;
use crate::engine::{GitService, ProtocolMode, format_pkt_line_header};
use crate::server::AppState;
use crate::types::Repository;

#[derive(Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

#[derive(Deserialize)]
pub struct GitPathParams {
    owner: String,
    repo: String,
}

type RequestBody = Box<dyn AsyncRead + Send + Unpin>;

fn git_error_response(err: GitAuthError) -> Response {
    let mut response = (err.status_code(), err.message()).into_response();

    if err.requires_auth_header() {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"gitgate\""),
        );
    }

    response
}

fn internal_error(message: &'static str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

fn resolve(
    state: &AppState,
    headers: &HeaderMap,
    params: &GitPathParams,
    service: GitService,
) -> Result<Repository, GitAuthError> {
    let user = authenticate(headers, state.store.as_ref())?;
    authorize(
        state.store.as_ref(),
        user.as_ref(),
        &params.owner,
        &params.repo,
        service,
    )
}

fn build_git_response(body: Body, content_type: &'static str) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Request body as a reader, gunzipped when the client compressed it.
fn request_body(headers: &HeaderMap, body: Body) -> RequestBody {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    if gzip {
        Box::new(GzipDecoder::new(reader))
    } else {
        Box::new(reader)
    }
}

pub async fn info_refs(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = query
        .service
        .as_deref()
        .and_then(|s| GitService::from_str(s).ok())
    else {
        return (StatusCode::BAD_REQUEST, "Invalid service").into_response();
    };

    let repo = match resolve(&state, &headers, &params, service) {
        Ok(repo) => repo,
        Err(e) => return git_error_response(e),
    };

    let command = state
        .engine
        .protocol_command(&repo.path, service, ProtocolMode::Advertise);
    let process = match StreamingProcess::spawn(command, None::<tokio::io::Empty>) {
        Ok(process) => process,
        Err(e) => {
            warn!(repo_id = %repo.id, "Failed to spawn {service}: {e}");
            return internal_error("Git command failed");
        }
    };

    let header_line = stream::iter([Ok::<_, std::io::Error>(Bytes::from(
        format_pkt_line_header(service),
    ))]);
    let body = Body::from_stream(header_line.chain(process.output));

    build_git_response(body, service.advertisement_content_type())
}

pub async fn git_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let repo = match resolve(&state, &headers, &params, GitService::UploadPack) {
        Ok(repo) => repo,
        Err(e) => return git_error_response(e),
    };

    let command = state.engine.protocol_command(
        &repo.path,
        GitService::UploadPack,
        ProtocolMode::StatelessRpc,
    );
    let process = match StreamingProcess::spawn(command, Some(request_body(&headers, body))) {
        Ok(process) => process,
        Err(e) => {
            warn!(repo_id = %repo.id, "Failed to spawn git-upload-pack: {e}");
            return internal_error("Git command failed");
        }
    };

    build_git_response(
        Body::from_stream(process.output),
        GitService::UploadPack.content_type(),
    )
}

pub async fn git_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(params): Path<GitPathParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let repo = match resolve(&state, &headers, &params, GitService::ReceivePack) {
        Ok(repo) => repo,
        Err(e) => return git_error_response(e),
    };

    let pending = match state.trigger.capture(&repo.id, &repo.path).await {
        Ok(pending) => Some(pending),
        Err(e) => {
            warn!(repo_id = %repo.id, "Ref snapshot failed, push will not be indexed: {e}");
            None
        }
    };

    let command = state.engine.protocol_command(
        &repo.path,
        GitService::ReceivePack,
        ProtocolMode::StatelessRpc,
    );
    let process = match StreamingProcess::spawn(command, Some(request_body(&headers, body))) {
        Ok(process) => process,
        Err(e) => {
            warn!(repo_id = %repo.id, "Failed to spawn git-receive-pack: {e}");
            return internal_error("Git command failed");
        }
    };

    if let Some(pending) = pending {
        let trigger = Arc::clone(&state.trigger);
        let exit = process.exit;
        tokio::spawn(async move {
            match exit.await {
                Ok(Some(status)) if !status.success() => {
                    tracing::debug!(repo_id = %pending.repo_id, %status, "git-receive-pack failed");
                }
                Err(e) => warn!("git-receive-pack supervisor failed: {e}"),
                _ => {}
            }
            trigger.complete(pending);
        });
    }

    build_git_response(
        Body::from_stream(process.output),
        GitService::ReceivePack.content_type(),
    )
}
