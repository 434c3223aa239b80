//! Source units under trace and their text

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::interp::imported_modules;

/// The entry script plus every module it imports that resolves to a file
/// next to it. Only the entry is scanned; imports of imports are not
/// followed.
pub fn find_units(entry: &Path) -> Vec<PathBuf> {
    let mut units = vec![entry.to_path_buf()];
    let Some(dir) = entry.parent() else {
        return units;
    };
    let modules = match std::fs::read_to_string(entry)
        .map_err(|e| e.to_string())
        .and_then(|source| imported_modules(&source).map_err(|e| e.to_string()))
    {
        Ok(modules) => modules,
        Err(e) => {
            tracing::debug!(path = %entry.display(), error = %e, "Import analysis skipped");
            return units;
        }
    };

    for module in modules {
        let parts: Vec<&str> = module.split('.').collect();
        let Some((last, prefix)) = parts.split_last() else {
            continue;
        };
        let candidate = prefix
            .iter()
            .fold(dir.to_path_buf(), |path, part| path.join(part))
            .join(format!("{last}.py"));
        if candidate.is_file() && !units.contains(&candidate) {
            units.push(candidate);
        }
    }
    units
}

/// Lines of every traced unit, loaded once.
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<PathBuf, Vec<String>>,
}

impl SourceCache {
    pub fn load(units: &[PathBuf]) -> Self {
        let files = units
            .iter()
            .filter_map(|unit| {
                let text = std::fs::read_to_string(unit).ok()?;
                Some((unit.clone(), text.lines().map(String::from).collect()))
            })
            .collect();
        Self { files }
    }

    /// Trimmed text of a 1-based line, empty when unknown
    pub fn line(&self, unit: &Path, line: u32) -> String {
        let index = match (line as usize).checked_sub(1) {
            Some(index) => index,
            None => return String::new(),
        };
        self.files
            .get(unit)
            .and_then(|lines| lines.get(index))
            .map(|text| text.trim().to_string())
            .unwrap_or_default()
    }
}
