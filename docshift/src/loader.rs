//! Changeset files.
//!
//! A changeset file is JSON or TOML and holds either one changeset or a
//! `changesets` array. Directories are walked recursively; file order does not
//! matter since the runner sorts by id.

use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::changeset::Changeset;
use crate::errors::LoadError;

const EXTENSIONS: &[&str] = &["json", "toml"];

/// Load every changeset file under `dir`.
pub fn load_dir(dir: &Path) -> Result<Vec<Changeset>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::MissingDirectory { path: dir.to_path_buf() });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|err| LoadError::Io {
            path: err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: err.into(),
        })?;
        if entry.file_type().is_file() && has_changeset_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut changesets = Vec::new();
    for path in files {
        changesets.extend(load_file(&path)?);
    }
    log::debug!("loaded {} changeset(s) from {}", changesets.len(), dir.display());
    Ok(changesets)
}

/// Load the changesets in a single file.
pub fn load_file(path: &Path) -> Result<Vec<Changeset>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &content)
}

fn has_changeset_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

fn parse_error(path: &Path, message: impl ToString) -> LoadError {
    LoadError::Parse {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn parse(path: &Path, content: &str) -> Result<Vec<Changeset>, LoadError> {
    let value: Value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(content).map_err(|err| parse_error(path, err))?,
        _ => serde_json::from_str(content).map_err(|err| parse_error(path, err))?,
    };

    let changesets = match value {
        Value::Object(mut map) if map.contains_key("changesets") => {
            let list = map.remove("changesets").unwrap_or(Value::Null);
            serde_json::from_value(list).map_err(|err| parse_error(path, err))?
        }
        value => vec![serde_json::from_value(value).map_err(|err| parse_error(path, err))?],
    };
    Ok(changesets)
}

/// Source file for each changeset id, used by the CLI when reporting errors.
pub fn locate(dir: &Path) -> Result<Vec<(PathBuf, Changeset)>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::MissingDirectory { path: dir.to_path_buf() });
    }
    let mut located = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|err| LoadError::Io {
            path: err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: err.into(),
        })?;
        if entry.file_type().is_file() && has_changeset_extension(entry.path()) {
            for changeset in load_file(entry.path())? {
                located.push((entry.path().to_path_buf(), changeset));
            }
        }
    }
    Ok(located)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangesetId, Operation};
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn loads_json_and_toml_recursively() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "v4.json",
            r#"{"id": "4.1", "context": "dev", "operations": [
                {"op": "insert", "collection": "users", "documents": [{"name": "John"}]}
            ]}"#,
        );
        write(
            tmp.path(),
            "nested/permissions.toml",
            r#"
            [[changesets]]
            id = 11
            context = "dev"

            [[changesets.operations]]
            op = "update"
            collection = "users"
            filter = { name = "Tom" }
            mutation = { "$set" = { role = "admin" } }
            "#,
        );
        write(tmp.path(), "README.md", "not a changeset");

        let mut changesets = load_dir(tmp.path()).unwrap();
        changesets.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(changesets.len(), 2);
        assert_eq!(changesets[0].id, "4.1".parse::<ChangesetId>().unwrap());
        assert_eq!(changesets[1].id, ChangesetId::version(11));
        assert!(matches!(changesets[1].operations[0], Operation::Update { .. }));
    }

    #[test]
    fn reports_the_offending_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "broken.json", r#"{"id": "1", "context": "dev", "operations": [{"op": "drop"}]}"#);

        let err = load_dir(tmp.path()).unwrap_err();
        match err {
            LoadError::Parse { path, .. } => assert!(path.ends_with("broken.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_dir(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, LoadError::MissingDirectory { .. }));
    }

    #[test]
    fn locate_keeps_source_paths() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.json", r#"{"changesets": [{"id": 1, "context": "dev"}, {"id": 2, "context": "dev"}]}"#);
        let located = locate(tmp.path()).unwrap();
        assert_eq!(located.len(), 2);
        assert!(located.iter().all(|(path, _)| path.ends_with("a.json")));
    }
}
