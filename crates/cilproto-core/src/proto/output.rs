//! Writing rendered file units to disk.

use super::{Schema, WriterConfig};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

impl Schema {
    /// Writes one `.proto` per file unit into `dir`, in file order.
    ///
    /// A name already taken by an earlier unit gets underscores prepended
    /// until it is unique. Returns the paths written.
    pub fn write_files(&self, dir: &Path, config: &WriterConfig) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|e| Error::directory_create(dir, e))?;

        let mut used = HashSet::new();
        let mut written = Vec::with_capacity(self.file_count());
        for (id, _) in self.files() {
            let path = dir.join(unique_file_name(self.file_name(id), &mut used));

            let mut content = String::new();
            self.write_file_to(id, config, &mut content)
                .expect("String write cannot fail");
            fs::write(&path, content).map_err(|e| Error::file_write(&path, e))?;

            debug!(path = %path.display(), "wrote file unit");
            written.push(path);
        }
        Ok(written)
    }

    /// Writes every file unit into the single file `path`
    pub fn write_combined(&self, path: &Path, config: &WriterConfig) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::directory_create(parent, e))?;
        }

        let mut content = String::new();
        self.write_all_to(config, &mut content)
            .expect("String write cannot fail");
        fs::write(path, content).map_err(|e| Error::file_write(path, e))
    }
}

fn unique_file_name(mut name: String, used: &mut HashSet<String>) -> String {
    while used.contains(&name) {
        name.insert(0, '_');
    }
    used.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Message, ProtoFile, TopLevelKind};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn schema_with(names: &[&str]) -> Schema {
        let mut schema = Schema::new();
        for name in names {
            let file = schema.add_file(ProtoFile::default());
            let id = schema.add_top_level(*name, false, TopLevelKind::Message(Message::default()));
            schema.attach(id, file);
        }
        schema
    }

    #[test]
    fn test_unique_file_name() {
        let mut used = HashSet::new();
        assert_eq!(unique_file_name("Foo.proto".into(), &mut used), "Foo.proto");
        assert_eq!(unique_file_name("Foo.proto".into(), &mut used), "_Foo.proto");
        assert_eq!(unique_file_name("Foo.proto".into(), &mut used), "__Foo.proto");
        assert_eq!(unique_file_name("Bar.proto".into(), &mut used), "Bar.proto");
    }

    #[test]
    fn test_write_files_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let written = schema_with(&["Foo", "Bar", "Foo"])
            .write_files(temp_dir.path(), &WriterConfig::default())
            .unwrap();

        let names: Vec<_> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["Foo.proto", "Bar.proto", "_Foo.proto"]);
        assert!(fs::read_to_string(&written[2]).unwrap().ends_with("message Foo {\n}\n"));
    }

    #[test]
    fn test_write_combined_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("all.proto");
        schema_with(&["One", "Two"])
            .write_combined(&path, &WriterConfig::default())
            .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("// Decompiled with cilproto").count(), 1);
        assert!(content.ends_with("message One {\n}\n\nmessage Two {\n}\n"));
    }

    #[test]
    fn test_write_files_into_a_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let err = schema_with(&["Foo"])
            .write_files(&blocker, &WriterConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::DirectoryCreate { .. }));
    }
}
