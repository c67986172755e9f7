//! Optional side file (`<document>.json`) requesting an extract rebuild.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::PublishError;

pub const POLICY_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtractPolicy {
    pub extract_data_source_data: bool,
    pub encrypt_data: bool,
}

impl ExtractPolicy {
    /// Side file location: the full document path with [`POLICY_SUFFIX`]
    /// appended, e.g. `sales.tds.json`.
    pub fn path_for(document: &Path) -> PathBuf {
        let mut path = document.as_os_str().to_owned();
        path.push(POLICY_SUFFIX);
        PathBuf::from(path)
    }

    /// Reads the policy next to `document`. A missing file means no extract
    /// action; a malformed one is fatal.
    pub async fn load_for(document: &Path) -> Result<Option<ExtractPolicy>, PublishError> {
        let path = Self::path_for(document);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No extract policy");
                return Ok(None);
            }
            Err(e) => return Err(PublishError::io(path, e)),
        };
        let policy: ExtractPolicy = serde_json::from_str(&raw).map_err(|e| {
            PublishError::parse(format!("extract policy {}", path.display()), e)
        })?;
        debug!(
            path = %path.display(),
            extract = policy.extract_data_source_data,
            encrypt = policy.encrypt_data,
            "Loaded extract policy"
        );
        Ok(Some(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_file_keeps_document_extension() {
        let path = ExtractPolicy::path_for(Path::new("/data/sales.tdsx"));
        assert_eq!(path, PathBuf::from("/data/sales.tdsx.json"));
    }

    #[tokio::test]
    async fn missing_file_is_no_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("sales.tds");
        assert_eq!(ExtractPolicy::load_for(&doc).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_pascal_case_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("sales.tds");
        std::fs::write(
            ExtractPolicy::path_for(&doc),
            r#"{"ExtractDataSourceData": true, "EncryptData": true}"#,
        )
        .unwrap();
        let policy = ExtractPolicy::load_for(&doc).await.unwrap().unwrap();
        assert!(policy.extract_data_source_data);
        assert!(policy.encrypt_data);
    }

    #[tokio::test]
    async fn malformed_file_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("sales.tds");
        std::fs::write(ExtractPolicy::path_for(&doc), "{not json").unwrap();
        let err = ExtractPolicy::load_for(&doc).await.unwrap_err();
        assert!(matches!(err, PublishError::Parse { .. }));
    }
}
