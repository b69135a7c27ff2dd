//! JSON persistence with optional gzip, selected by the `.gz` suffix

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::{HarError, Result};

use super::model::Har;

/// Whether `path` should be gzip-compressed
#[must_use]
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Serialize an archive to a JSON string
///
/// # Errors
///
/// Returns error if serialization fails
pub fn to_string(har: &Har, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(har)?
    } else {
        serde_json::to_string(har)?
    };
    Ok(json)
}

/// Deserialize an archive from a JSON string
///
/// # Errors
///
/// Returns [`HarError::Decode`] for empty or malformed input
pub fn from_str(json: &str) -> Result<Har> {
    if json.trim().is_empty() {
        return Err(HarError::Decode(serde::de::Error::custom(
            "archive document is empty",
        )));
    }
    Ok(serde_json::from_str(json)?)
}

/// Write an archive to `path`, gzip-compressed for `.gz` paths
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn save(har: &Har, path: &Path, pretty: bool) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);

    if is_gzip_path(path) {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        write_json(&mut encoder, har, pretty)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = writer;
        write_json(&mut writer, har, pretty)?;
        writer.flush()?;
    }

    debug!(
        "Saved archive to {} ({} entries)",
        path.display(),
        har.log.entries.len()
    );
    Ok(())
}

fn write_json<W: Write>(writer: &mut W, har: &Har, pretty: bool) -> Result<()> {
    if pretty {
        serde_json::to_writer_pretty(writer, har)?;
    } else {
        serde_json::to_writer(writer, har)?;
    }
    Ok(())
}

/// Read an archive from `path`, decompressing `.gz` paths
///
/// # Errors
///
/// Returns [`HarError::FileNotFound`] for a missing file and
/// [`HarError::Decode`] for malformed content
pub fn load(path: &Path) -> Result<Har> {
    if !path.exists() {
        return Err(HarError::FileNotFound(path.display().to_string()));
    }

    let mut file = BufReader::new(File::open(path)?);
    let mut raw = Vec::new();
    if is_gzip_path(path) {
        GzDecoder::new(file)
            .read_to_end(&mut raw)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                    HarError::Decode(serde::de::Error::custom(format!("corrupt gzip stream: {e}")))
                }
                _ => HarError::Io(e),
            })?;
    } else {
        file.read_to_end(&mut raw)?;
    }

    from_slice(&raw)
}

fn from_slice(raw: &[u8]) -> Result<Har> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(HarError::Decode(serde::de::Error::custom(
            "archive document is empty",
        )));
    }
    Ok(serde_json::from_slice(raw)?)
}

/// Async variant of [`save`] run on the blocking pool
///
/// # Errors
///
/// Returns error if the file cannot be written
pub async fn save_async(har: Har, path: PathBuf, pretty: bool) -> Result<()> {
    tokio::task::spawn_blocking(move || save(&har, &path, pretty))
        .await
        .map_err(|e| HarError::Other(format!("Save task failed: {e}")))?
}

/// Async variant of [`load`] run on the blocking pool
///
/// # Errors
///
/// Returns error if the file cannot be read or decoded
pub async fn load_async(path: PathBuf) -> Result<Har> {
    tokio::task::spawn_blocking(move || load(&path))
        .await
        .map_err(|e| HarError::Other(format!("Load task failed: {e}")))?
}
