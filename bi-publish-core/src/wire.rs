//! `tsRequest` payload builders and `tsResponse` parsing.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::contract::{AuthToken, ConnectionResolver, Folder, PublishedDocument, RemoteConnection, SignInRequest, TargetConnection};
use crate::document::DocumentFamily;
use crate::error::PublishError;
use crate::scanner;

/// The remote API embeds structured errors in otherwise successful
/// responses, so any body mentioning "error" (any case) is a failure. A
/// legitimate value containing the word is misclassified too.
pub fn body_reports_error(body: &str) -> bool {
    body.to_ascii_lowercase().contains("error")
}

/// One `<connection>` element of the embedded-credentials fragment.
pub fn credential_element(target: &TargetConnection) -> String {
    format!(
        r#"<connection serverAddress="{}"><connectionCredentials name="{}" password="{}" embed="true" /></connection>"#,
        escape(target.server_address.as_str()),
        escape(target.user_name.as_str()),
        escape(target.password.as_str()),
    )
}

/// Resolves every caption of a workbook, in document order, into credential
/// elements. Duplicated captions are resolved at each occurrence.
pub fn credential_elements<R>(xml: &str, resolver: &R) -> Result<Vec<String>, PublishError>
where
    R: ConnectionResolver + ?Sized,
{
    scanner::scan_captions(xml)?
        .iter()
        .map(|caption| {
            resolver
                .resolve(caption)
                .map(|target| credential_element(&target))
                .map_err(|e| PublishError::Resolution {
                    identity: caption.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Wraps credential elements in `<connections>`; empty input gives an empty
/// fragment.
pub fn connections_fragment(elements: &[String]) -> String {
    if elements.is_empty() {
        String::new()
    } else {
        format!("<connections>{}</connections>", elements.concat())
    }
}

pub fn workbook_request(name: &str, connections: &str, folder_id: &str) -> String {
    format!(
        r#"<tsRequest><workbook name="{}" showTabs="true">{}<project id="{}"/></workbook></tsRequest>"#,
        escape(name),
        connections,
        escape(folder_id),
    )
}

pub fn datasource_request(name: &str, folder_id: &str) -> String {
    format!(
        r#"<tsRequest><datasource name="{}"><project id="{}"/></datasource></tsRequest>"#,
        escape(name),
        escape(folder_id),
    )
}

pub fn connection_update_request(target: &TargetConnection) -> String {
    format!(
        r#"<tsRequest><connection serverAddress="{}" userName="{}" password="{}" embedPassword="true" /></tsRequest>"#,
        escape(target.server_address.as_str()),
        escape(target.user_name.as_str()),
        escape(target.password.as_str()),
    )
}

pub fn create_folder_request(parent_id: Option<&str>, name: &str) -> String {
    let parent = parent_id
        .map(|id| format!(r#" parentProjectId="{}""#, escape(id)))
        .unwrap_or_default();
    format!(r#"<tsRequest><project{} name="{}" /></tsRequest>"#, parent, escape(name))
}

// JSON bodies of the authentication and listing endpoints.

#[derive(Serialize)]
struct SignInBody<'a> {
    credentials: SignInCredentials<'a>,
}

#[derive(Serialize)]
struct SignInCredentials<'a> {
    name: &'a str,
    password: &'a str,
    site: SiteRef<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SiteRef<'a> {
    content_url: &'a str,
}

pub fn sign_in_body(request: &SignInRequest) -> Result<String, PublishError> {
    serde_json::to_string(&SignInBody {
        credentials: SignInCredentials {
            name: &request.username,
            password: &request.password,
            site: SiteRef {
                content_url: &request.site,
            },
        },
    })
    .map_err(|e| PublishError::parse("sign-in request", e))
}

#[derive(Deserialize)]
struct SignInResponse {
    credentials: SignedInCredentials,
}

#[derive(Deserialize)]
struct SignedInCredentials {
    token: String,
    site: SignedInSite,
}

#[derive(Deserialize)]
struct SignedInSite {
    id: String,
}

pub fn parse_sign_in(body: &str) -> Result<AuthToken, PublishError> {
    let parsed: SignInResponse = serde_json::from_str(body)
        .map_err(|e| PublishError::Auth(format!("can not decode sign-in response: {e}")))?;
    if parsed.credentials.token.is_empty() {
        return Err(PublishError::Auth("sign-in response carries no token".into()));
    }
    Ok(AuthToken {
        token: parsed.credentials.token,
        site_id: parsed.credentials.site.id,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub total_available: String,
}

#[derive(Deserialize)]
struct FolderPage {
    pagination: Option<Pagination>,
    #[serde(default)]
    projects: FolderList,
}

#[derive(Default, Deserialize)]
struct FolderList {
    #[serde(default)]
    project: Vec<Folder>,
}

/// One page of folders and the total number available.
pub fn parse_folder_page(body: &str) -> Result<(Vec<Folder>, Option<usize>), PublishError> {
    let page: FolderPage =
        serde_json::from_str(body).map_err(|e| PublishError::parse("folder listing", e))?;
    let total = page
        .pagination
        .and_then(|p| p.total_available.parse::<usize>().ok());
    Ok((page.projects.project, total))
}

#[derive(Deserialize)]
struct ConnectionsBody {
    #[serde(default)]
    connections: ConnectionList,
}

#[derive(Default, Deserialize)]
struct ConnectionList {
    #[serde(default)]
    connection: Vec<RemoteConnection>,
}

pub fn parse_connections(body: &str) -> Result<Vec<RemoteConnection>, PublishError> {
    let parsed: ConnectionsBody = serde_json::from_str(body)
        .map_err(|e| PublishError::parse("data source connection listing", e))?;
    Ok(parsed.connections.connection)
}

/// Reads the published document descriptor out of a `tsResponse`.
pub fn parse_published(body: &str, family: DocumentFamily) -> Result<PublishedDocument, PublishError> {
    let element = family.element().as_bytes();
    let mut reader = Reader::from_reader(body.as_bytes());
    let mut buf = Vec::new();
    let mut document: Option<PublishedDocument> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| PublishError::parse("publish response", e))?
        {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name();
                if document.is_none() && name.as_ref() == element {
                    document = Some(PublishedDocument {
                        id: attr(e, b"id")?.unwrap_or_default(),
                        name: attr(e, b"name")?.unwrap_or_default(),
                        content_url: attr(e, b"contentUrl")?,
                        webpage_url: attr(e, b"webpageUrl")?,
                        ..Default::default()
                    });
                } else if name.as_ref() == b"project" {
                    if let Some(doc) = document.as_mut() {
                        doc.project_id = attr(e, b"id")?;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match document {
        Some(doc) if !doc.id.is_empty() => Ok(doc),
        _ => Err(PublishError::parse(
            "publish response",
            format!("no <{}> element with an id in: {body}", family.element()),
        )),
    }
}

/// Reads the `<project>` of a folder creation response.
pub fn parse_created_folder(body: &str, parent_id: Option<String>) -> Result<Folder, PublishError> {
    let mut reader = Reader::from_reader(body.as_bytes());
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| PublishError::parse("create folder response", e))?
        {
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"project" => {
                let id = attr(e, b"id")?.unwrap_or_default();
                if id.is_empty() {
                    break;
                }
                return Ok(Folder {
                    id,
                    name: attr(e, b"name")?.unwrap_or_default(),
                    parent_project_id: attr(e, b"parentProjectId")?.or(parent_id),
                });
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Err(PublishError::parse(
        "create folder response",
        format!("no <project> element with an id in: {body}"),
    ))
}

fn attr(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, PublishError> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| PublishError::parse("response attribute", e))?;
        if attribute.key.as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|e| PublishError::parse("response attribute value", e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
