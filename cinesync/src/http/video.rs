//! HLS artifact handler
//!
//! Playlists and segments are streamed whole; HLS clients fetch complete
//! segments, so range support is unnecessary.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use tokio_util::io::ReaderStream;

use cinesync_core::Error;

use crate::http::{AppResult, AppState};

pub async fn serve_video(
    State(state): State<AppState>,
    Path((stream, subpath)): Path<(String, String)>,
) -> AppResult<Response> {
    let (file, content_type) = state.catalog.open(&stream, &subpath).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .map_err(|e| Error::Internal(format!("build response: {e}")).into())
}
