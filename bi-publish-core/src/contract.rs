//! # contract: seams between the publish pipeline and its collaborators
//!
//! Two traits live here:
//! - [`ConnectionResolver`]: the injected strategy mapping a connection caption
//!   to concrete target credentials. The core never provides a default; the
//!   calling context always supplies one.
//! - [`ServerApi`]: the remote management API, one method per endpoint the
//!   pipeline uses. [`crate::rest::RestClient`] is the HTTP implementation.
//!
//! Both traits are annotated for `mockall` so the session can be exercised
//! against deterministic mocks.
//!
//! The plain data types exchanged across the seams are defined alongside.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentKind;
use crate::error::PublishError;

/// Resolved destination credentials for one connection.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConnection {
    pub server_address: String,
    pub server_port: String,
    pub user_name: String,
    #[serde(alias = "passWord", alias = "PassWord")]
    pub password: String,
    #[serde(alias = "Schema")]
    pub schema: String,
    pub db_name: String,
    pub embed_password: bool,
}

impl fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConnection")
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("db_name", &self.db_name)
            .field("embed_password", &self.embed_password)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no target connection found for caption '{0}'")]
    NotFound(String),
    #[error("target connections unavailable: {0}")]
    Unavailable(String),
}

/// Maps a connection caption to its target credentials.
///
/// Resolution must be a pure function of the caption: the pipeline calls
/// `resolve` once per occurrence, so a caption used twice in one document
/// is resolved twice and both calls must agree.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, caption: &str) -> Result<TargetConnection, ResolveError>;
}

/// Token and site id obtained at sign-in, required on every later call.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub site_id: String,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token_len", &self.token.len())
            .field("site_id", &self.site_id)
            .finish()
    }
}

#[derive(Clone)]
pub struct SignInRequest {
    pub username: String,
    pub password: String,
    /// Site content URL; empty for the default site.
    pub site: String,
}

impl fmt::Debug for SignInRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("site", &self.site)
            .finish()
    }
}

/// A folder ("project") on the remote server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_project_id: Option<String>,
}

/// A connection the server associates with an uploaded data source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConnection {
    pub id: String,
    #[serde(rename = "type", default)]
    pub connection_type: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub server_port: String,
    #[serde(default)]
    pub user_name: String,
}

/// Everything the upload endpoint needs for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpload {
    pub kind: DocumentKind,
    /// File whose bytes are streamed; may be a rewritten staging copy.
    pub file_path: PathBuf,
    /// `tsRequest` metadata part.
    pub metadata_xml: String,
}

/// Descriptor returned by the server for a published document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishedDocument {
    pub id: String,
    pub name: String,
    pub content_url: Option<String>,
    pub webpage_url: Option<String>,
    pub project_id: Option<String>,
    /// SHA-256 of the streamed document bytes.
    pub payload_sha256: Option<String>,
}

/// Remote management API. Every call except `sign_in` is authenticated by
/// the [`AuthToken`] it receives; implementations hold no session state.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn sign_in(&self, request: &SignInRequest) -> Result<AuthToken, PublishError>;

    async fn sign_out(&self, auth: &AuthToken) -> Result<(), PublishError>;

    /// Lists every folder on the site.
    async fn list_folders(&self, auth: &AuthToken) -> Result<Vec<Folder>, PublishError>;

    /// Creates `name` under `parent_id`, or at top level for `None`.
    async fn create_folder(
        &self,
        auth: &AuthToken,
        parent_id: Option<String>,
        name: &str,
    ) -> Result<Folder, PublishError>;

    async fn upload_document(
        &self,
        auth: &AuthToken,
        upload: DocumentUpload,
    ) -> Result<PublishedDocument, PublishError>;

    async fn list_datasource_connections(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
    ) -> Result<Vec<RemoteConnection>, PublishError>;

    async fn update_datasource_connection(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        connection_id: &str,
        target: &TargetConnection,
    ) -> Result<(), PublishError>;

    async fn delete_extract(&self, auth: &AuthToken, datasource_id: &str)
        -> Result<(), PublishError>;

    async fn create_extract(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        encrypt: bool,
    ) -> Result<(), PublishError>;
}
