//! Error taxonomy for the publish pipeline.
//!
//! Every stage fails fast and returns a [`PublishError`] carrying enough
//! context (document path, identity, target URI) to diagnose the failure
//! without retrying. Nothing in this crate retries on its own.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Post-upload steps of a data-source publish. A failure in one of these
/// leaves the uploaded document on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostUploadStep {
    ConnectionListing,
    CredentialBind,
    ExtractRefresh,
}

impl fmt::Display for PostUploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            PostUploadStep::ConnectionListing => "connection listing",
            PostUploadStep::CredentialBind => "credential binding",
            PostUploadStep::ExtractRefresh => "extract refresh",
        };
        f.write_str(step)
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("unsupported document kind '{extension}' for {}, expecting one of 'tds', 'tdsx', 'twb', 'twbx'", path.display())]
    UnsupportedDocumentKind { path: PathBuf, extension: String },

    #[error("archive member '{member}' escapes staging directory {}", dest.display())]
    PathTraversal { member: String, dest: PathBuf },

    #[error("can not parse {context}: {details}")]
    Parse { context: String, details: String },

    #[error("no target connection for '{identity}': {reason}")]
    Resolution { identity: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not signed in")]
    NotSignedIn,

    #[error("remote API call {uri} failed with status {status}: {body}")]
    RemoteApi {
        uri: String,
        status: u16,
        body: String,
    },

    #[error("document does not exist: {}", .0.display())]
    DocumentNotFound(PathBuf),

    #[error("document {document_id} was created remotely but {step} failed: {source}")]
    PartialPublish {
        document_id: String,
        step: PostUploadStep,
        source: Box<PublishError>,
    },

    #[error("can not rewrite {context}: {details}")]
    Rewrite { context: String, details: String },

    #[error("invalid destination folder path '{0}'")]
    InvalidDestination(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("HTTP request to {uri} failed: {source}")]
    Http {
        uri: String,
        source: reqwest::Error,
    },

    #[error("can not read archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        source: zip::result::ZipError,
    },
}

impl PublishError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PublishError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn http(uri: &str, source: reqwest::Error) -> Self {
        PublishError::Http {
            uri: uri.to_string(),
            source,
        }
    }

    pub(crate) fn parse(context: impl Into<String>, details: impl fmt::Display) -> Self {
        PublishError::Parse {
            context: context.into(),
            details: details.to_string(),
        }
    }

    pub(crate) fn partial(document_id: &str, step: PostUploadStep, source: PublishError) -> Self {
        PublishError::PartialPublish {
            document_id: document_id.to_string(),
            step,
            source: Box::new(source),
        }
    }

    /// True when the document already exists remotely and a post-upload step
    /// failed. Such a failure needs operator follow-up, not a blind retry.
    pub fn is_partial(&self) -> bool {
        matches!(self, PublishError::PartialPublish { .. })
    }

    /// Id of the remotely created document, for partial publishes only.
    pub fn published_document_id(&self) -> Option<&str> {
        match self {
            PublishError::PartialPublish { document_id, .. } => Some(document_id),
            _ => None,
        }
    }
}
