//! Volume server object surface: `PUT` / `GET` / `DELETE /{fid}`.
//!
//! Deliberately minimal — bytes in, bytes out, addressed by file id. The
//! richer upload pipeline (multipart forms, gzip negotiation, chunked
//! manifests for oversized bodies) lives with the clients that need it;
//! a volume server only ever sees one already-prepared needle per request.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use needlehouse_core::{FileId, Needle};
use needlehouse_storage::Store;
use serde_json::json;
use tracing::debug;

pub fn volume_router(store: Arc<Store>) -> Router {
    Router::new()
        .route(
            "/:file_id",
            get(read_needle).put(write_needle).delete(delete_needle),
        )
        .route("/status", get(status))
        .with_state(store)
}

async fn status(State(store): State<Arc<Store>>) -> Response {
    let volumes: Vec<_> = store
        .status()
        .into_iter()
        .map(|v| {
            json!({
                "id": v.id,
                "collection": v.collection,
                "size": v.size,
                "fileCount": v.file_count,
                "deleteCount": v.delete_count,
                "deletedBytes": v.deleted_bytes,
                "readOnly": v.read_only,
                "compactRevision": v.compact_revision,
            })
        })
        .collect();
    Json(json!({ "volumes": volumes })).into_response()
}

async fn write_needle(
    State(store): State<Arc<Store>>,
    Path(file_id): Path<String>,
    body: Bytes,
) -> Response {
    let (volume, fid) = match resolve(&store, &file_id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let needle = Needle::new(fid.needle_id, fid.cookie, body).with_last_modified(now);
    let size = needle.data.len();
    match volume.write(&needle) {
        Ok(offset) => {
            debug!(fid = %file_id, size, offset, "wrote needle");
            Json(json!({ "size": size })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn read_needle(
    State(store): State<Arc<Store>>,
    Path(file_id): Path<String>,
) -> Response {
    let (volume, fid) = match resolve(&store, &file_id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match volume.read(fid.needle_id, fid.cookie) {
        Ok(needle) => needle.data.into_response(),
        Err(err) => storage_error(err),
    }
}

async fn delete_needle(
    State(store): State<Arc<Store>>,
    Path(file_id): Path<String>,
) -> Response {
    let (volume, fid) = match resolve(&store, &file_id) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match volume.delete(fid.needle_id, fid.cookie) {
        Ok(reclaimed) => (
            StatusCode::ACCEPTED,
            Json(json!({ "size": reclaimed })),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

fn resolve(
    store: &Arc<Store>,
    file_id: &str,
) -> Result<(Arc<needlehouse_storage::Volume>, FileId), Response> {
    let fid = FileId::parse(file_id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "malformed file id" })),
        )
            .into_response()
    })?;
    let volume = store.get_volume(fid.volume_id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("volume {} not found", fid.volume_id) })),
        )
            .into_response()
    })?;
    Ok((volume, fid))
}

fn storage_error(err: needlehouse_storage::Error) -> Response {
    use needlehouse_core::Error as CoreError;
    let status = match &err {
        needlehouse_storage::Error::Core(CoreError::NotFound) => StatusCode::NOT_FOUND,
        needlehouse_storage::Error::Core(CoreError::VolumeReadOnly(_))
        | needlehouse_storage::Error::Core(CoreError::VolumeFull(_)) => {
            StatusCode::NOT_ACCEPTABLE
        }
        // A single corrupt needle is a server-side read failure, not a
        // reason to fail the volume.
        needlehouse_storage::Error::Core(CoreError::Corrupt(_))
        | needlehouse_storage::Error::Core(CoreError::CrcMismatch) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
