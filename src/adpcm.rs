use std::io::{Read, Seek, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::dtype::{OkdError, ReadWrite};

/// `YADD` payload: back-to-back `YAWV` blobs. The audio bytes are
/// carried opaquely; nothing here decodes ADPCM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdpcmChunk {
    pub adpcms: Vec<Vec<u8>>,
}

impl AdpcmChunk {
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<AdpcmChunk, OkdError> {
        let mut adpcms = Vec::new();
        loop {
            let mut tag = [0_u8; 4];
            if reader.read_exact(&mut tag).is_err() {
                break;
            }
            if &tag != b"YAWV" {
                return Err(OkdError::TruncatedChunk {
                    tag,
                    expected: 0,
                    actual: 0,
                });
            }
            let size = reader.read_u32::<BigEndian>()? as usize;
            let mut data = vec![0_u8; size];
            reader.read_exact(&mut data).map_err(|_| OkdError::TruncatedChunk {
                tag,
                expected: size,
                actual: 0,
            })?;
            adpcms.push(data);
        }
        Ok(AdpcmChunk { adpcms })
    }
}

impl ReadWrite for AdpcmChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        for adpcm in &self.adpcms {
            writer.write_all(b"YAWV")?;
            writer.write_u32::<BigEndian>(adpcm.len() as u32)?;
            writer.write_all(adpcm)?;
            bytes_written += 8 + adpcm.len();
        }
        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn yawv_blobs_roundtrip() {
        let chunk = AdpcmChunk {
            adpcms: vec![vec![1, 2, 3, 4], vec![0xAA; 16]],
        };
        let mut buffer = Cursor::new(Vec::new());
        chunk.write_to_file(&mut buffer).unwrap();
        buffer.set_position(0);
        assert_eq!(AdpcmChunk::read(&mut buffer).unwrap(), chunk);
    }

    #[test]
    fn foreign_tag_is_rejected() {
        let mut buffer = Cursor::new(b"YAWX\x00\x00\x00\x00".to_vec());
        assert!(AdpcmChunk::read(&mut buffer).is_err());
    }
}
