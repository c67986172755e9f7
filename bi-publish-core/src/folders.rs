//! Destination folder paths (`A/B/C`) resolved against the remote tree.

use crate::contract::Folder;
use crate::error::PublishError;

/// A slash-separated folder path with non-empty segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPath {
    segments: Vec<String>,
}

impl FolderPath {
    pub fn parse(path: &str) -> Result<Self, PublishError> {
        let segments: Vec<String> = path.trim_matches('/').split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(PublishError::InvalidDestination(path.to_string()));
        }
        Ok(FolderPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

/// How far a [`FolderPath`] exists remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResolution {
    /// Id of the deepest existing folder on the path, `None` if even the
    /// first segment is missing.
    pub parent_id: Option<String>,
    /// Number of leading segments that exist.
    pub resolved: usize,
}

impl PartialResolution {
    pub fn is_complete(&self, path: &FolderPath) -> bool {
        self.resolved == path.segments.len()
    }
}

/// Descends `path` segment by segment, matching each segment by name among
/// the children of the previously resolved folder.
pub fn resolve_existing(folders: &[Folder], path: &FolderPath) -> PartialResolution {
    let mut parent_id: Option<String> = None;
    let mut resolved = 0;
    for segment in &path.segments {
        let child = folders.iter().find(|folder| {
            folder.name == *segment && normalized_parent(folder) == parent_id.as_deref()
        });
        match child {
            Some(folder) => {
                parent_id = Some(folder.id.clone());
                resolved += 1;
            }
            None => break,
        }
    }
    PartialResolution {
        parent_id,
        resolved,
    }
}

fn normalized_parent(folder: &Folder) -> Option<&str> {
    folder
        .parent_project_id
        .as_deref()
        .filter(|parent| !parent.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, name: &str, parent: Option<&str>) -> Folder {
        Folder {
            id: id.into(),
            name: name.into(),
            parent_project_id: parent.map(str::to_string),
        }
    }

    fn tree() -> Vec<Folder> {
        vec![
            folder("1", "Finance", None),
            folder("2", "Reports", Some("1")),
            folder("3", "Reports", None),
            folder("4", "Monthly", Some("3")),
            folder("5", "Default", Some("")),
        ]
    }

    #[test]
    fn parses_and_trims_slashes() {
        let path = FolderPath::parse("/Finance/Reports/").unwrap();
        assert_eq!(path.segments(), ["Finance", "Reports"]);
        assert!(FolderPath::parse("").is_err());
        assert!(FolderPath::parse("A//B").is_err());
    }

    #[test]
    fn resolves_full_path_by_parent_chain() {
        let path = FolderPath::parse("Finance/Reports").unwrap();
        let res = resolve_existing(&tree(), &path);
        assert!(res.is_complete(&path));
        assert_eq!(res.parent_id.as_deref(), Some("2"));
    }

    #[test]
    fn same_name_under_other_parent_does_not_match() {
        let path = FolderPath::parse("Finance/Reports/Monthly").unwrap();
        let res = resolve_existing(&tree(), &path);
        assert_eq!(res.resolved, 2);
        assert_eq!(res.parent_id.as_deref(), Some("2"));
        assert!(!res.is_complete(&path));
    }

    #[test]
    fn missing_first_segment_has_no_parent() {
        let path = FolderPath::parse("Marketing/Q1").unwrap();
        let res = resolve_existing(&tree(), &path);
        assert_eq!(res, PartialResolution { parent_id: None, resolved: 0 });
    }

    #[test]
    fn empty_parent_id_counts_as_top_level() {
        let path = FolderPath::parse("Default").unwrap();
        assert_eq!(resolve_existing(&tree(), &path).parent_id.as_deref(), Some("5"));
    }
}
