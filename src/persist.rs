//! JSON file helpers shared by the file-backed stores.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Read and parse `path`, reporting the JSON path of any malformed field.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let display = path.display().to_string();
    let json = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: display.clone(),
        source,
    })?;
    let de = &mut serde_json::Deserializer::from_str(&json);
    let value = serde_path_to_error::deserialize(de).map_err(|source| Error::Json {
        path: display.clone(),
        source,
    })?;
    log::debug!("Read {display}");
    Ok(value)
}

/// Serialize `value` and replace `path` with it, creating parent directories.
///
/// The file is written next to its final location and renamed into place.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let display = path.display().to_string();
    let json = serde_json::to_string_pretty(value).map_err(|source| Error::Serialize {
        what: display.clone(),
        source,
    })?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|source| Error::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|source| Error::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| Error::Io {
        path: display.clone(),
        source,
    })?;
    log::debug!("Wrote {display}");
    Ok(())
}
