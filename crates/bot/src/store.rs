//! Shared JSON persistence helpers.
//!
//! Every persistent file the bridge owns (bindings, offsets, session map,
//! notify defaults) is rewritten whole via temp-file-then-rename so readers
//! never observe a torn write.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, data).with_context(|| format!("write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Load a JSON file, falling back to `T::default()` when the file is absent
/// or unreadable as `T`.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(data) = std::fs::read(path) else {
        return T::default();
    };
    serde_json::from_slice(&data).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn write_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("ccbot-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.json");

        let mut value: HashMap<String, u64> = HashMap::new();
        value.insert("a".into(), 7);
        write_json_atomic(&path, &value).unwrap();

        let back: HashMap<String, u64> = load_json_or_default(&path);
        assert_eq!(back.get("a"), Some(&7));

        // no stray temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_yields_default() {
        let path = std::env::temp_dir().join(format!("ccbot-store-missing-{}", std::process::id()));
        let back: HashMap<String, u64> = load_json_or_default(&path);
        assert!(back.is_empty());
    }
}
