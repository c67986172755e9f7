//! Document classification by file extension.

use std::path::{Path, PathBuf};

use crate::error::PublishError;

/// The four publishable document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// `.tds`: single-file data source.
    DataSource,
    /// `.tdsx`: zip bundle holding a data source.
    DataSourceBundle,
    /// `.twb`: single-file workbook.
    Workbook,
    /// `.twbx`: zip bundle holding one or more workbooks.
    WorkbookBundle,
}

/// Document family; decides which upload endpoint and connection identity
/// scheme apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFamily {
    DataSource,
    Workbook,
}

impl DocumentKind {
    /// Maps a lowercase extension (without dot) to a kind.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "tds" => Some(DocumentKind::DataSource),
            "tdsx" => Some(DocumentKind::DataSourceBundle),
            "twb" => Some(DocumentKind::Workbook),
            "twbx" => Some(DocumentKind::WorkbookBundle),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentKind::DataSource => "tds",
            DocumentKind::DataSourceBundle => "tdsx",
            DocumentKind::Workbook => "twb",
            DocumentKind::WorkbookBundle => "twbx",
        }
    }

    pub fn family(&self) -> DocumentFamily {
        match self {
            DocumentKind::DataSource | DocumentKind::DataSourceBundle => DocumentFamily::DataSource,
            DocumentKind::Workbook | DocumentKind::WorkbookBundle => DocumentFamily::Workbook,
        }
    }

    pub fn is_bundle(&self) -> bool {
        matches!(
            self,
            DocumentKind::DataSourceBundle | DocumentKind::WorkbookBundle
        )
    }
}

impl DocumentFamily {
    /// Collection segment of the upload URI.
    pub fn collection(&self) -> &'static str {
        match self {
            DocumentFamily::DataSource => "datasources",
            DocumentFamily::Workbook => "workbooks",
        }
    }

    /// Query parameter naming the document type on upload.
    pub fn type_parameter(&self) -> &'static str {
        match self {
            DocumentFamily::DataSource => "datasourceType",
            DocumentFamily::Workbook => "workbookType",
        }
    }

    /// Multipart field name carrying the document bytes.
    pub fn file_field(&self) -> &'static str {
        match self {
            DocumentFamily::DataSource => "tableau_datasource",
            DocumentFamily::Workbook => "tableau_workbook",
        }
    }

    /// Element name of the document in request and response payloads.
    pub fn element(&self) -> &'static str {
        match self {
            DocumentFamily::DataSource => "datasource",
            DocumentFamily::Workbook => "workbook",
        }
    }
}

/// A document on disk with its derived base name and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub base_name: String,
    pub kind: DocumentKind,
}

impl DocumentRef {
    /// Classifies `path` by its extension. Fails with
    /// [`PublishError::UnsupportedDocumentKind`] for anything but the four
    /// known extensions.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PublishError> {
        let path = path.as_ref();
        let (base_name, extension) = split_document_name(path);
        let kind = DocumentKind::from_extension(&extension).ok_or_else(|| {
            PublishError::UnsupportedDocumentKind {
                path: path.to_path_buf(),
                extension: extension.clone(),
            }
        })?;
        Ok(DocumentRef {
            path: path.to_path_buf(),
            base_name,
            kind,
        })
    }
}

/// Splits a path into (base name without extension, lowercase extension).
pub fn split_document_name(path: &Path) -> (String, String) {
    let base_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    (base_name, extension)
}
