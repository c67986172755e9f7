//! `ServerApi` over HTTP.
//!
//! Every method is one endpoint. Success is judged per endpoint the way the
//! server reports it: some by status, some by the absence of "error" in the
//! body, some by both.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, info};

use crate::contract::{
    AuthToken, DocumentUpload, Folder, PublishedDocument, RemoteConnection, ServerApi,
    SignInRequest, TargetConnection,
};
use crate::error::PublishError;
use crate::uploader::{self, MultipartUpload, AUTH_HEADER, METADATA_FIELD};
use crate::wire;

pub const DEFAULT_API_VERSION: &str = "3.6";
const FOLDER_PAGE_SIZE: usize = 100;

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

/// Where the management API lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "url")]
    pub server_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl ServerConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        ServerConfig {
            server_url: server_url.into(),
            api_version: default_api_version(),
        }
    }

    /// `{url}/api/{version}`, without a doubled slash.
    pub fn base_url(&self) -> String {
        format!(
            "{}/api/{}",
            self.server_url.trim_end_matches('/'),
            self.api_version
        )
    }
}

pub struct RestClient {
    http: Client,
    base: String,
}

impl RestClient {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: &ServerConfig) -> Self {
        RestClient {
            http,
            base: config.base_url(),
        }
    }

    fn site_url(&self, auth: &AuthToken, path: &str) -> String {
        format!("{}/sites/{}/{}", self.base, auth.site_id, path)
    }

    /// Sends `request` and returns status and body text.
    async fn exchange(&self, uri: &str, request: RequestBuilder) -> Result<(u16, String), PublishError> {
        let response = request.send().await.map_err(|e| PublishError::http(uri, e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| PublishError::http(uri, e))?;
        debug!(uri, status, bytes = body.len(), "Remote API response");
        Ok((status, body))
    }

    /// Fails on a body mentioning "error" or a status outside `accepted`.
    fn check(
        uri: &str,
        status: u16,
        body: String,
        accepted: impl Fn(u16) -> bool,
    ) -> Result<String, PublishError> {
        if wire::body_reports_error(&body) || !accepted(status) {
            return Err(PublishError::RemoteApi {
                uri: uri.to_string(),
                status,
                body,
            });
        }
        Ok(body)
    }

    /// Status-only check, for endpoints whose bodies carry user content
    /// (folder names, descriptions) that may legitimately mention "error".
    fn check_status(uri: &str, status: u16, body: String) -> Result<String, PublishError> {
        if !is_success(status) {
            return Err(PublishError::RemoteApi {
                uri: uri.to_string(),
                status,
                body,
            });
        }
        Ok(body)
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[async_trait]
impl ServerApi for RestClient {
    async fn sign_in(&self, request: &SignInRequest) -> Result<AuthToken, PublishError> {
        let uri = format!("{}/auth/signin", self.base);
        let body = wire::sign_in_body(request)?;
        let (status, text) = self
            .exchange(
                &uri,
                self.http
                    .post(&uri)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, "application/json")
                    .body(body),
            )
            .await?;
        if wire::body_reports_error(&text) || !is_success(status) {
            return Err(PublishError::Auth(format!(
                "sign-in as '{}' rejected with status {status}: {text}",
                request.username
            )));
        }
        let auth = wire::parse_sign_in(&text)?;
        info!(user = %request.username, site_id = %auth.site_id, token_len = auth.token.len(), "Signed in");
        Ok(auth)
    }

    async fn sign_out(&self, auth: &AuthToken) -> Result<(), PublishError> {
        let uri = format!("{}/auth/signout", self.base);
        let (status, text) = self
            .exchange(&uri, self.http.post(&uri).header(AUTH_HEADER, &auth.token))
            .await?;
        if !text.is_empty() {
            return Err(PublishError::RemoteApi {
                uri,
                status,
                body: text,
            });
        }
        info!(site_id = %auth.site_id, "Signed out");
        Ok(())
    }

    async fn list_folders(&self, auth: &AuthToken) -> Result<Vec<Folder>, PublishError> {
        let mut folders = Vec::new();
        let mut page = 1;
        loop {
            let uri = self.site_url(
                auth,
                &format!("projects?pageSize={FOLDER_PAGE_SIZE}&pageNumber={page}"),
            );
            let (status, text) = self
                .exchange(
                    &uri,
                    self.http
                        .get(&uri)
                        .header(AUTH_HEADER, &auth.token)
                        .header(ACCEPT, "application/json"),
                )
                .await?;
            let text = Self::check_status(&uri, status, text)?;
            let (batch, total) = wire::parse_folder_page(&text)?;
            let received = batch.len();
            folders.extend(batch);
            match total {
                Some(total) if folders.len() < total && received > 0 => page += 1,
                _ => break,
            }
        }
        debug!(count = folders.len(), "Listed folders");
        Ok(folders)
    }

    async fn create_folder(
        &self,
        auth: &AuthToken,
        parent_id: Option<String>,
        name: &str,
    ) -> Result<Folder, PublishError> {
        let uri = self.site_url(auth, "projects");
        let body = wire::create_folder_request(parent_id.as_deref(), name);
        let (status, text) = self
            .exchange(
                &uri,
                self.http
                    .post(&uri)
                    .header(AUTH_HEADER, &auth.token)
                    .header(CONTENT_TYPE, "application/xml")
                    .body(body),
            )
            .await?;
        let text = Self::check(&uri, status, text, is_success)?;
        let folder = wire::parse_created_folder(&text, parent_id)?;
        info!(id = %folder.id, name = %folder.name, "Created folder");
        Ok(folder)
    }

    async fn upload_document(
        &self,
        auth: &AuthToken,
        upload: DocumentUpload,
    ) -> Result<PublishedDocument, PublishError> {
        let family = upload.kind.family();
        let uri = self.site_url(
            auth,
            &format!(
                "{}?{}={}&overwrite=true",
                family.collection(),
                family.type_parameter(),
                upload.kind.extension()
            ),
        );
        let parts = MultipartUpload {
            metadata_field: METADATA_FIELD,
            metadata_xml: &upload.metadata_xml,
            file_field: family.file_field(),
            file_path: &upload.file_path,
        };
        uploader::stream_upload(&self.http, &uri, &auth.token, family, &parts).await
    }

    async fn list_datasource_connections(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
    ) -> Result<Vec<RemoteConnection>, PublishError> {
        let uri = self.site_url(auth, &format!("datasources/{datasource_id}/connections"));
        let (status, text) = self
            .exchange(
                &uri,
                self.http
                    .get(&uri)
                    .header(AUTH_HEADER, &auth.token)
                    .header(ACCEPT, "application/json"),
            )
            .await?;
        let text = Self::check(&uri, status, text, is_success)?;
        wire::parse_connections(&text)
    }

    async fn update_datasource_connection(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        connection_id: &str,
        target: &TargetConnection,
    ) -> Result<(), PublishError> {
        let uri = self.site_url(
            auth,
            &format!("datasources/{datasource_id}/connections/{connection_id}"),
        );
        let (status, text) = self
            .exchange(
                &uri,
                self.http
                    .put(&uri)
                    .header(AUTH_HEADER, &auth.token)
                    .header(CONTENT_TYPE, "application/xml")
                    .body(wire::connection_update_request(target)),
            )
            .await?;
        Self::check(&uri, status, text, |s| s == 200)?;
        info!(datasource_id, connection_id, server = %target.server_address, "Bound connection credentials");
        Ok(())
    }

    async fn delete_extract(&self, auth: &AuthToken, datasource_id: &str) -> Result<(), PublishError> {
        let uri = self.site_url(auth, &format!("datasources/{datasource_id}/deleteExtract"));
        let (status, text) = self
            .exchange(&uri, self.http.post(&uri).header(AUTH_HEADER, &auth.token))
            .await?;
        Self::check(&uri, status, text, is_success)?;
        Ok(())
    }

    async fn create_extract(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        encrypt: bool,
    ) -> Result<(), PublishError> {
        let uri = self.site_url(
            auth,
            &format!("datasources/{datasource_id}/createExtract?encrypt={encrypt}"),
        );
        let (status, text) = self
            .exchange(&uri, self.http.post(&uri).header(AUTH_HEADER, &auth.token))
            .await?;
        Self::check(&uri, status, text, is_success)?;
        info!(datasource_id, encrypt, "Requested extract creation");
        Ok(())
    }
}
