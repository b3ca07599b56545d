//! Static site serving for `static` records
//!
//! Tries the literal file, then the directory's index document, then falls
//! back to the site's root index so client-side routed apps keep working.

use crate::error::{json_error_response, ProxyErrorCode};
use futures::{future, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::{header, Method, Request, Response, StatusCode};
use mime_guess::from_path;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Files up to this size are read in one go; larger ones are streamed
const BUFFERED_FILE_LIMIT: u64 = 256 * 1024;
/// Read size for streamed files
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

type StaticBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Clone)]
pub struct StaticFiles {
    index: String,
}

impl StaticFiles {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
        }
    }

    /// Serve `req` from the site rooted at `root`
    pub async fn serve<B>(&self, req: &Request<B>, root: &Path) -> Response<StaticBody> {
        let head_only = match *req.method() {
            Method::GET => false,
            Method::HEAD => true,
            _ => {
                let mut response =
                    json_error_response(ProxyErrorCode::MethodNotAllowed, "Static sites accept GET and HEAD only");
                response
                    .headers_mut()
                    .insert(header::ALLOW, header::HeaderValue::from_static("GET, HEAD"));
                return response;
            }
        };

        let Some(candidate) = resolve_path(root, req.uri().path()) else {
            debug!(path = req.uri().path(), "Rejected static path");
            return json_error_response(ProxyErrorCode::StaticNotFound, "Not found");
        };

        let Some(file) = self.pick_file(root, &candidate).await else {
            return json_error_response(ProxyErrorCode::StaticNotFound, "Not found");
        };

        match file_body(&file, head_only).await {
            Ok((length, body)) => file_response(&file, length, body),
            Err(e) => {
                error!(path = %file.display(), error = %e, "Failed to read static file");
                json_error_response(ProxyErrorCode::InternalError, "Failed to read file")
            }
        }
    }

    /// Literal file, then directory index, then the root index
    async fn pick_file(&self, root: &Path, candidate: &Path) -> Option<PathBuf> {
        let mut attempts = Vec::with_capacity(3);
        match fs::metadata(candidate).await {
            Ok(meta) if meta.is_dir() => attempts.push(candidate.join(&self.index)),
            Ok(_) => attempts.push(candidate.to_path_buf()),
            Err(_) => {}
        }
        attempts.push(root.join(&self.index));

        for path in attempts {
            if is_file_within(root, &path).await {
                return Some(path);
            }
        }
        None
    }
}

/// Map a request path onto `root`, rejecting any `..` component
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let relative = Path::new(decoded.trim_start_matches('/'));

    let mut full_path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => full_path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    full_path.starts_with(root).then_some(full_path)
}

/// Regular file whose real location is still inside `root` (symlinks included)
async fn is_file_within(root: &Path, path: &Path) -> bool {
    let (Ok(real_root), Ok(real_path)) = (fs::canonicalize(root).await, fs::canonicalize(path).await) else {
        return false;
    };
    if !real_path.starts_with(&real_root) {
        return false;
    }
    matches!(fs::metadata(&real_path).await, Ok(meta) if meta.is_file())
}

/// Length and body for `path`: empty for HEAD, buffered when small, streamed otherwise
async fn file_body(path: &Path, head_only: bool) -> std::io::Result<(u64, StaticBody)> {
    let length = fs::metadata(path).await?.len();

    if head_only {
        return Ok((length, Empty::<Bytes>::new().map_err(|never| match never {}).boxed()));
    }

    if length <= BUFFERED_FILE_LIMIT {
        let content = fs::read(path).await?;
        let length = content.len() as u64;
        return Ok((length, Full::new(Bytes::from(content)).map_err(|never| match never {}).boxed()));
    }

    let file = fs::File::open(path).await?;
    let shown = path.display().to_string();
    // A read error ends the stream early; the client sees a short body
    let frames = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)
        .inspect(move |chunk| {
            if let Err(e) = chunk {
                error!(path = %shown, error = %e, "Static file read failed mid-stream");
            }
        })
        .take_while(|chunk| future::ready(chunk.is_ok()))
        .filter_map(|chunk| future::ready(chunk.ok().map(|bytes| Ok::<_, hyper::Error>(Frame::data(bytes)))));

    debug!(path = %path.display(), length, "Streaming static file");
    Ok((length, BodyExt::boxed(StreamBody::new(frames))))
}

fn file_response(path: &Path, length: u64, body: StaticBody) -> Response<StaticBody> {
    let content_type = from_path(path).first_or_octet_stream().to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .body(body)
        .expect("valid response builder")
}
