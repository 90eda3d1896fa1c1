use crate::proto::{blob::Data, Blob};
use bytes::{BufMut, BytesMut};
use error_stack::{Report, ResultExt};
use flate2::read::ZlibDecoder;
use std::io::{copy, Cursor, Read};
use thiserror::Error;

/// Encoded size limit for a BlobHeader message, per the PBF format spec.
pub const MAX_BLOB_HEADER_SIZE: u64 = 64 * 1024;
/// Encoded size limit for a Blob message, per the PBF format spec.
pub const MAX_BLOB_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Error)]
pub enum BlobExtractorError {
    #[error("Unsupported compression method")]
    UnsupportedCompression,
    #[error("Blob carries no payload")]
    Empty,
    #[error("Failed while decompressing")]
    Decompress,
}

impl Blob {
    fn extractor(self) -> Result<Box<dyn Read>, BlobExtractorError> {
        match self.data {
            Some(Data::Raw(data)) => Ok(Box::new(Cursor::new(data))),
            Some(Data::ZlibData(data)) => Ok(Box::new(ZlibDecoder::new(Cursor::new(data)))),
            Some(Data::ZstdData(data)) => {
                let decoder = zstd::stream::read::Decoder::new(Cursor::new(data))
                    .map_err(|_| BlobExtractorError::Decompress)?;
                Ok(Box::new(decoder))
            }
            Some(_) => Err(BlobExtractorError::UnsupportedCompression),
            None => Err(BlobExtractorError::Empty),
        }
    }

    /// Decompress the blob payload into a contiguous buffer.
    pub fn extract(self) -> Result<BytesMut, Report<BlobExtractorError>> {
        let raw_size = self.raw_size;
        let mut extractor = self.extractor()?;
        let mut output = BytesMut::with_capacity(raw_size.unwrap_or(0).max(0) as usize).writer();
        copy(&mut extractor, &mut output).change_context(BlobExtractorError::Decompress)?;

        let output = output.into_inner();
        if let Some(expected) = raw_size {
            if output.len() as u64 > MAX_BLOB_MESSAGE_SIZE || output.len() != expected as usize {
                return Err(Report::new(BlobExtractorError::Decompress));
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::{write::ZlibEncoder, Compression};
    use std::io::Write;

    #[test]
    fn test_extract_raw() {
        let blob = Blob {
            raw_size: None,
            data: Some(Data::Raw(b"abc".to_vec())),
        };
        assert_eq!(blob.extract().unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_extract_zlib() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello blob").unwrap();
        let blob = Blob {
            raw_size: Some(10),
            data: Some(Data::ZlibData(encoder.finish().unwrap())),
        };
        assert_eq!(blob.extract().unwrap().as_ref(), b"hello blob");
    }

    #[test]
    fn test_extract_rejects_size_mismatch() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello blob").unwrap();
        let blob = Blob {
            raw_size: Some(4),
            data: Some(Data::ZlibData(encoder.finish().unwrap())),
        };
        assert!(blob.extract().is_err());
    }

    #[test]
    fn test_extract_rejects_unsupported() {
        let blob = Blob {
            raw_size: Some(3),
            data: Some(Data::LzmaData(vec![1, 2, 3])),
        };
        assert!(blob.extract().is_err());
    }
}
