//! # session: the publish protocol
//!
//! [`PublishSession`] owns the authentication state of one signed-in user
//! and drives a publish through its ordered steps:
//!
//! 1. classify the document and parse the destination path,
//! 2. prepare the payload locally (extract, scan, rewrite, resolve),
//! 3. resolve the destination folder, creating missing segments,
//! 4. stream the upload,
//! 5. for data sources, bind credentials to every remote connection and
//!    refresh the extract when the side file asks for it.
//!
//! Nothing touches the network before step 3, so a local failure leaves no
//! trace on the server. Failures in step 5 come back as
//! [`PublishError::PartialPublish`]: the document exists remotely by then.
//!
//! A session is used by one call chain at a time; `sign_in`/`sign_out` take
//! `&mut self` and publishes only read the token.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::container::{self, Staging};
use crate::contract::{
    AuthToken, ConnectionResolver, DocumentUpload, PublishedDocument, ServerApi, SignInRequest,
};
use crate::document::{DocumentFamily, DocumentKind, DocumentRef};
use crate::error::{PostUploadStep, PublishError};
use crate::extract_policy::ExtractPolicy;
use crate::folders::{self, FolderPath};
use crate::rewriter;
use crate::scanner::{self, CompositeKey};
use crate::wire;

/// What happened to the data extract after upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractOutcome {
    NotRequested,
    Refreshed { encrypted: bool },
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub document: PublishedDocument,
    pub folder_id: String,
    /// Credential binds issued after upload; always 0 for workbooks, whose
    /// credentials travel in the upload metadata.
    pub connections_bound: usize,
    pub extract: ExtractOutcome,
}

/// Locally prepared payload, ready for upload.
enum Prepared {
    Workbook {
        upload_path: PathBuf,
        credentials: String,
        // Keeps the rewritten copy alive until the upload is done.
        _staging: Staging,
    },
    DataSource {
        captions: HashMap<CompositeKey, String>,
        policy: Option<ExtractPolicy>,
    },
}

pub struct PublishSession<A: ServerApi> {
    api: A,
    auth: Option<AuthToken>,
}

impl<A: ServerApi> PublishSession<A> {
    pub fn new(api: A) -> Self {
        PublishSession { api, auth: None }
    }

    pub fn is_signed_in(&self) -> bool {
        self.auth.is_some()
    }

    pub fn site_id(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.site_id.as_str())
    }

    pub async fn sign_in(
        &mut self,
        username: &str,
        password: &str,
        site: &str,
    ) -> Result<(), PublishError> {
        let request = SignInRequest {
            username: username.to_string(),
            password: password.to_string(),
            site: site.to_string(),
        };
        let auth = self.api.sign_in(&request).await?;
        if self.auth.replace(auth).is_some() {
            debug!("Replaced previous session token");
        }
        Ok(())
    }

    /// Signs out and forgets the token. Fails with
    /// [`PublishError::NotSignedIn`] when there is no session; the token is
    /// kept when the server rejects the sign-out.
    pub async fn sign_out(&mut self) -> Result<(), PublishError> {
        let auth = self.auth.as_ref().ok_or(PublishError::NotSignedIn)?;
        self.api.sign_out(auth).await?;
        self.auth = None;
        Ok(())
    }

    /// Publishes `document` into the folder path `destination`, resolving
    /// embedded connections through `resolver`.
    pub async fn publish<R>(
        &self,
        document: &Path,
        destination: &str,
        resolver: &R,
    ) -> Result<PublishReport, PublishError>
    where
        R: ConnectionResolver + ?Sized,
    {
        let auth = self.auth.as_ref().ok_or(PublishError::NotSignedIn)?;
        let doc = DocumentRef::from_path(document)?;
        let path = FolderPath::parse(destination)?;
        info!(
            document = %doc.path.display(),
            kind = ?doc.kind,
            destination,
            "Publishing document"
        );

        let prepared = match doc.kind.family() {
            DocumentFamily::Workbook => prepare_workbook(&doc, resolver).await?,
            DocumentFamily::DataSource => prepare_datasource(&doc).await?,
        };

        let folder_id = self.resolve_destination(auth, &path).await?;

        match prepared {
            Prepared::Workbook {
                upload_path,
                credentials,
                _staging,
            } => {
                let upload = DocumentUpload {
                    kind: doc.kind,
                    file_path: upload_path,
                    metadata_xml: wire::workbook_request(&doc.base_name, &credentials, &folder_id),
                };
                let document = self.api.upload_document(auth, upload).await?;
                Ok(PublishReport {
                    document,
                    folder_id,
                    connections_bound: 0,
                    extract: ExtractOutcome::NotRequested,
                })
            }
            Prepared::DataSource { captions, policy } => {
                let upload = DocumentUpload {
                    kind: doc.kind,
                    file_path: doc.path.clone(),
                    metadata_xml: wire::datasource_request(&doc.base_name, &folder_id),
                };
                let document = self.api.upload_document(auth, upload).await?;
                let connections_bound = self
                    .bind_credentials(auth, &document.id, &captions, resolver)
                    .await?;
                let extract = self.refresh_extract(auth, &document.id, policy).await?;
                Ok(PublishReport {
                    document,
                    folder_id,
                    connections_bound,
                    extract,
                })
            }
        }
    }

    /// Walks `path` down the remote tree and creates whatever is missing,
    /// one segment at a time from the deepest existing folder.
    async fn resolve_destination(
        &self,
        auth: &AuthToken,
        path: &FolderPath,
    ) -> Result<String, PublishError> {
        let existing = self.api.list_folders(auth).await?;
        let resolution = folders::resolve_existing(&existing, path);
        let mut parent = resolution.parent_id;
        for segment in &path.segments()[resolution.resolved..] {
            let created = self
                .api
                .create_folder(auth, parent.clone(), segment)
                .await?;
            parent = Some(created.id);
        }
        let folder_id = parent.ok_or_else(|| PublishError::InvalidDestination(path.segments().join("/")))?;
        debug!(folder_id = %folder_id, created = path.segments().len() - resolution.resolved, "Resolved destination folder");
        Ok(folder_id)
    }

    /// Binds target credentials to each connection the server lists for the
    /// uploaded data source, sequentially and in listing order.
    async fn bind_credentials<R>(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        captions: &HashMap<CompositeKey, String>,
        resolver: &R,
    ) -> Result<usize, PublishError>
    where
        R: ConnectionResolver + ?Sized,
    {
        let partial = |step, e| PublishError::partial(datasource_id, step, e);
        let connections = self
            .api
            .list_datasource_connections(auth, datasource_id)
            .await
            .map_err(|e| partial(PostUploadStep::ConnectionListing, e))?;

        let mut bound = 0;
        for connection in &connections {
            let key = CompositeKey::from_remote(connection);
            let caption = captions.get(&key).ok_or_else(|| {
                partial(
                    PostUploadStep::CredentialBind,
                    PublishError::Resolution {
                        identity: key.to_string(),
                        reason: "no named connection in the document has this key".into(),
                    },
                )
            })?;
            let target = resolver.resolve(caption).map_err(|e| {
                partial(
                    PostUploadStep::CredentialBind,
                    PublishError::Resolution {
                        identity: caption.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;
            self.api
                .update_datasource_connection(auth, datasource_id, &connection.id, &target)
                .await
                .map_err(|e| partial(PostUploadStep::CredentialBind, e))?;
            bound += 1;
        }
        info!(datasource_id, bound, "Bound data source credentials");
        Ok(bound)
    }

    async fn refresh_extract(
        &self,
        auth: &AuthToken,
        datasource_id: &str,
        policy: Option<ExtractPolicy>,
    ) -> Result<ExtractOutcome, PublishError> {
        let policy = match policy {
            Some(policy) if policy.extract_data_source_data => policy,
            _ => return Ok(ExtractOutcome::NotRequested),
        };
        match self.api.delete_extract(auth, datasource_id).await {
            Ok(()) => debug!(datasource_id, "Deleted previous extract"),
            // No previous extract is the usual reason.
            Err(e @ PublishError::RemoteApi { .. }) => {
                warn!(datasource_id, error = %e, "Extract deletion failed, continuing")
            }
            Err(e) => return Err(PublishError::partial(datasource_id, PostUploadStep::ExtractRefresh, e)),
        }
        self.api
            .create_extract(auth, datasource_id, policy.encrypt_data)
            .await
            .map_err(|e| PublishError::partial(datasource_id, PostUploadStep::ExtractRefresh, e))?;
        Ok(ExtractOutcome::Refreshed {
            encrypted: policy.encrypt_data,
        })
    }
}

async fn read_document(path: &Path) -> Result<String, PublishError> {
    tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PublishError::DocumentNotFound(path.to_path_buf()),
        _ => PublishError::io(path, e),
    })
}

/// Single workbooks are rewritten into a staging copy, which is uploaded.
/// Bundles are uploaded unchanged: their `.twb` members are rewritten in
/// staging and their credentials travel in the upload metadata.
async fn prepare_workbook<R>(doc: &DocumentRef, resolver: &R) -> Result<Prepared, PublishError>
where
    R: ConnectionResolver + ?Sized,
{
    if doc.kind == DocumentKind::WorkbookBundle {
        let staging = container::extract_to_staging(&doc.path)?;
        let mut elements = Vec::new();
        for member in staging.files_with_extension(DocumentKind::Workbook.extension()) {
            let xml = read_document(&member).await?;
            let rewritten = rewriter::rewrite_workbook(&xml, resolver)?;
            tokio::fs::write(&member, rewritten.text)
                .await
                .map_err(|e| PublishError::io(&member, e))?;
            elements.extend(wire::credential_elements(&xml, resolver)?);
        }
        info!(document = %doc.path.display(), credentials = elements.len(), "Prepared workbook bundle");
        return Ok(Prepared::Workbook {
            upload_path: doc.path.clone(),
            credentials: wire::connections_fragment(&elements),
            _staging: staging,
        });
    }

    let xml = read_document(&doc.path).await?;
    let rewritten = rewriter::rewrite_workbook(&xml, resolver)?;
    let elements = wire::credential_elements(&xml, resolver)?;

    let staging = Staging::new()?;
    let upload_path = staging
        .path()
        .join(format!("{}.{}", doc.base_name, doc.kind.extension()));
    tokio::fs::write(&upload_path, rewritten.text)
        .await
        .map_err(|e| PublishError::io(&upload_path, e))?;
    info!(
        document = %doc.path.display(),
        rewritten = rewritten.connections_rewritten,
        credentials = elements.len(),
        "Prepared workbook"
    );
    Ok(Prepared::Workbook {
        upload_path,
        credentials: wire::connections_fragment(&elements),
        _staging: staging,
    })
}

/// Builds the composite key → caption lookup before upload and reads the
/// extract side file.
async fn prepare_datasource(doc: &DocumentRef) -> Result<Prepared, PublishError> {
    let captions = if doc.kind.is_bundle() {
        let staging = container::extract_to_staging(&doc.path)?;
        let members = staging.files_with_extension(DocumentKind::DataSource.extension());
        if members.is_empty() {
            return Err(PublishError::parse(
                format!("data source bundle {}", doc.path.display()),
                "no .tds member",
            ));
        }
        let mut captions = HashMap::new();
        for member in members {
            captions.extend(scanner::caption_lookup(&read_document(&member).await?)?);
        }
        captions
    } else {
        scanner::caption_lookup(&read_document(&doc.path).await?)?
    };
    let policy = ExtractPolicy::load_for(&doc.path).await?;
    debug!(document = %doc.path.display(), connections = captions.len(), "Prepared data source");
    Ok(Prepared::DataSource { captions, policy })
}
