use std::fs;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::error::IngestError;

pub fn validate_zip(zip_path: &Path) -> Result<usize, IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        IngestError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| IngestError::InvalidArchive(err.to_string()))?;

    let mut files = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::InvalidArchive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        if entry.enclosed_name().is_none() {
            return Err(IngestError::InvalidArchive(
                "zip entry path traversal detected".to_string(),
            ));
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| IngestError::InvalidArchive(err.to_string()))?;
        files += 1;
    }
    if files == 0 {
        return Err(IngestError::InvalidArchive("archive is empty".to_string()));
    }
    Ok(files)
}
