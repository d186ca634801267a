use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::{ClassId, StoreError};

/// Bidirectional class name/id table read from a `name,id` text file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassTable {
    by_name: BTreeMap<String, ClassId>,
    by_id: BTreeMap<ClassId, String>,
}

impl ClassTable {
    /// Parses one `name,id` pair per line. Lines without a comma or with a
    /// non-integer id are ignored.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let Some((name, id)) = line.trim().split_once(',') else { continue };
            let Ok(id) = id.trim().parse::<ClassId>() else {
                debug!(line, "ignoring class table line");
                continue;
            };
            table.insert(name.trim(), id);
        }
        table
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Ok(Self::parse(&text))
    }

    pub fn insert(&mut self, name: &str, id: ClassId) {
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
    }

    pub fn id_of(&self, name: &str) -> Option<ClassId> { self.by_name.get(name).copied() }

    pub fn name_of(&self, id: ClassId) -> Option<&str> { self.by_id.get(&id).map(String::as_str) }

    /// Display name of `id`, `"Unknown"` when the table has none.
    pub fn label(&self, id: ClassId) -> &str { self.name_of(id).unwrap_or("Unknown") }

    pub fn len(&self) -> usize { self.by_id.len() }

    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &str)> { self.by_id.iter().map(|(id, n)| (*id, n.as_str())) }
}
