//! Streaming multipart upload.
//!
//! The body is produced into one end of an in-memory pipe while the HTTP
//! request consumes the other end, so peak memory is one pipe buffer no
//! matter how large the document is. The document bytes are hashed on the
//! way through.

use std::io;
use std::path::{Path, PathBuf};

use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::contract::PublishedDocument;
use crate::document::DocumentFamily;
use crate::error::PublishError;
use crate::wire;

pub const AUTH_HEADER: &str = "X-Tableau-Auth";
pub const METADATA_FIELD: &str = "request_payload";

const CHUNK_SIZE: usize = 64 * 1024;

/// The two parts of a publish request.
#[derive(Debug, Clone)]
pub struct MultipartUpload<'a> {
    pub metadata_field: &'a str,
    pub metadata_xml: &'a str,
    pub file_field: &'a str,
    pub file_path: &'a Path,
}

/// Writes the multipart/mixed body for `upload` into `writer` and returns the
/// hex SHA-256 of the document bytes. The file is copied in fixed-size
/// chunks, never loaded whole.
pub async fn write_multipart<W>(
    writer: &mut W,
    boundary: &str,
    upload: &MultipartUpload<'_>,
) -> Result<String, PublishError>
where
    W: AsyncWrite + Unpin,
{
    let file_name = upload
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut file = tokio::fs::File::open(upload.file_path)
        .await
        .map_err(|e| PublishError::io(upload.file_path, e))?;

    let head = format!(
        "--{boundary}\r\nContent-Disposition: name=\"{}\"\r\nContent-Type: text/xml\r\n\r\n{}\r\n--{boundary}\r\nContent-Disposition: name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        upload.metadata_field, upload.metadata_xml, upload.file_field, file_name,
    );
    writer
        .write_all(head.as_bytes())
        .await
        .map_err(body_error)?;

    let digest = copy_hashed(&mut file, writer, upload.file_path).await?;

    writer
        .write_all(format!("\r\n--{boundary}--\r\n").as_bytes())
        .await
        .map_err(body_error)?;
    writer.flush().await.map_err(body_error)?;
    Ok(digest)
}

async fn copy_hashed<R, W>(reader: &mut R, writer: &mut W, source: &Path) -> Result<String, PublishError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0usize;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| PublishError::io(source, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await.map_err(body_error)?;
        total += n;
    }
    debug!(path = %source.display(), bytes = total, "Streamed document part");
    Ok(format!("{:x}", hasher.finalize()))
}

fn body_error(e: io::Error) -> PublishError {
    PublishError::io(PathBuf::from("<upload body>"), e)
}

/// The consumer hung up; its own error explains why.
fn is_closed_pipe(err: &PublishError) -> bool {
    matches!(err, PublishError::Io { source, .. } if source.kind() == io::ErrorKind::BrokenPipe)
}

/// Streams `upload` to `uri` and classifies the response into a
/// [`PublishedDocument`] of `family`.
///
/// A missing document fails with [`PublishError::DocumentNotFound`] before
/// any connection is opened. When both halves fail the producer's error is
/// returned, unless it only observed the consumer going away.
pub async fn stream_upload(
    client: &reqwest::Client,
    uri: &str,
    token: &str,
    family: DocumentFamily,
    upload: &MultipartUpload<'_>,
) -> Result<PublishedDocument, PublishError> {
    match tokio::fs::metadata(upload.file_path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(PublishError::DocumentNotFound(upload.file_path.to_path_buf())),
    }

    let boundary = uuid::Uuid::new_v4().simple().to_string();
    let content_type = format!("multipart/mixed; boundary={boundary}");
    let (mut body_writer, body_reader) = tokio::io::duplex(CHUNK_SIZE);

    // Owns the writer so the body ends (or breaks) as soon as it returns.
    let producer = async move {
        let digest = write_multipart(&mut body_writer, &boundary, upload).await?;
        body_writer.shutdown().await.map_err(body_error)?;
        Ok::<_, PublishError>(digest)
    };

    let exchange = async {
        let response = client
            .post(uri)
            .header(AUTH_HEADER, token)
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body_reader)))
            .send()
            .await
            .map_err(|e| PublishError::http(uri, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::http(uri, e))?;
        Ok::<_, PublishError>((status, body))
    };

    info!(uri, path = %upload.file_path.display(), "Uploading document");
    let (produced, exchanged) = futures::future::join(producer, exchange).await;

    settle(uri, family, produced, exchanged).inspect_err(|failure| {
        error!(uri, error = %failure, "Upload failed");
    })
}

/// Combines the body producer's outcome with the HTTP exchange's.
///
/// A server that rejects an upload early may answer before reading the
/// whole body. The producer then sees a closed pipe while the exchange
/// still carries the server's verdict, which wins when it is a failure.
fn settle(
    uri: &str,
    family: DocumentFamily,
    produced: Result<String, PublishError>,
    exchanged: Result<(u16, String), PublishError>,
) -> Result<PublishedDocument, PublishError> {
    match (produced, exchanged) {
        (Ok(digest), Ok((status, body))) => {
            let mut document = classify_response(uri, status, &body, family)?;
            document.payload_sha256 = Some(digest);
            Ok(document)
        }
        (Err(produce_err), Ok((status, body))) if is_closed_pipe(&produce_err) => {
            // A success for a body the server never finished reading is not one.
            Err(rejection(uri, status, &body).unwrap_or(produce_err))
        }
        (Err(produce_err), Err(http_err)) if is_closed_pipe(&produce_err) => Err(http_err),
        (Err(produce_err), _) => Err(produce_err),
        (Ok(_), Err(http_err)) => Err(http_err),
    }
}

/// A body mentioning "error" fails whatever the status; otherwise a 2xx body
/// is parsed as the published document descriptor.
pub fn classify_response(
    uri: &str,
    status: u16,
    body: &str,
    family: DocumentFamily,
) -> Result<PublishedDocument, PublishError> {
    if let Some(err) = rejection(uri, status, body) {
        return Err(err);
    }
    let document = wire::parse_published(body, family)?;
    info!(id = %document.id, name = %document.name, "Document published");
    Ok(document)
}

fn rejection(uri: &str, status: u16, body: &str) -> Option<PublishError> {
    (wire::body_reports_error(body) || !(200..300).contains(&status)).then(|| {
        PublishError::RemoteApi {
            uri: uri.to_string(),
            status,
            body: body.to_string(),
        }
    })
}
