//! Decoding of worker-compressed artifacts

use crate::catalog::Compressor;
use flate2::read::GzDecoder;
use std::io::{self, Read};

pub fn decode(compressor: Compressor, src: &[u8]) -> io::Result<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(src.to_vec()),
        // Raw block format, not the framed stream
        Compressor::Snappy => snap::raw::Decoder::new()
            .decompress_vec(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Compressor::Gzip => {
            let mut output = Vec::new();
            GzDecoder::new(src).read_to_end(&mut output)?;
            Ok(output)
        }
        Compressor::Zstd => zstd::stream::decode_all(src),
    }
}
