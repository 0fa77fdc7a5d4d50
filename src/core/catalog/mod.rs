pub mod fetch;
pub mod reader;
pub mod writer;

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::core::error::{UpdaterError, UpdaterResult};

pub fn gunzip(bytes: &[u8]) -> UpdaterResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|error| UpdaterError::CorruptCatalog(format!("bad gzip stream: {error}")))?;
    Ok(result)
}

pub fn gzip(bytes: &[u8]) -> UpdaterResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}
