use std::io::{Cursor, Read, Seek, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::dtype::{OkdError, ReadWrite};

pub const FIXED_HEADER_SIZE: usize = 40;
pub const PERFORMANCE_MAGIC: [u8; 4] = *b"YKS1";
pub const AUDIO_MAGIC: [u8; 4] = *b"YOKA";

/// Version string stamped onto composed outputs.
pub const COMPOSED_VERSION: [u8; 16] = *b"YKS-1   v6.0v110";

/// Shape of the option-data block, keyed by its length. The sub-chunk
/// lengths and CRC words are opaque to the pipeline; CRCs are written
/// back as placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OptionData {
    None,
    Mmt {
        yks_chunks_length: u32,
        mmt_chunks_length: u32,
        crc_yks_loader: u16,
        crc_loader: u16,
    },
    Mmk {
        yks_chunks_length: u32,
        mmt_chunks_length: u32,
        mmk_chunks_length: u32,
        crc_yks_loader: u16,
        crc_yks_mmk_okd: u16,
        crc_loader: u16,
    },
    Spr {
        yks_chunks_length: u32,
        mmt_chunks_length: u32,
        mmk_chunks_length: u32,
        spr_chunks_length: u32,
        crc_yks_loader: u16,
        crc_yks_mmt_okd: u16,
        crc_yks_mmt_mmk_okd: u16,
        crc_loader: u16,
    },
    Dio {
        yks_chunks_length: u32,
        mmt_chunks_length: u32,
        mmk_chunks_length: u32,
        spr_chunks_length: u32,
        dio_chunks_length: u32,
        crc_yks_loader: u16,
        crc_yks_mmk_okd: u16,
        crc_yks_mmt_mmk_okd: u16,
        crc_yks_mmt_mmk_spr_okd: u16,
        crc_loader: u16,
    },
    Generic(Vec<u8>),
}

impl OptionData {
    pub fn parse(buffer: &[u8]) -> Result<OptionData, OkdError> {
        let mut reader = Cursor::new(buffer);
        Ok(match buffer.len() {
            0 => OptionData::None,
            12 => OptionData::Mmt {
                yks_chunks_length: reader.read_u32::<BigEndian>()?,
                mmt_chunks_length: reader.read_u32::<BigEndian>()?,
                crc_yks_loader: reader.read_u16::<BigEndian>()?,
                crc_loader: reader.read_u16::<BigEndian>()?,
            },
            20 => OptionData::Mmk {
                yks_chunks_length: reader.read_u32::<BigEndian>()?,
                mmt_chunks_length: reader.read_u32::<BigEndian>()?,
                mmk_chunks_length: reader.read_u32::<BigEndian>()?,
                crc_yks_loader: reader.read_u16::<BigEndian>()?,
                crc_yks_mmk_okd: reader.read_u16::<BigEndian>()?,
                crc_loader: reader.read_u16::<BigEndian>()?,
            },
            24 => OptionData::Spr {
                yks_chunks_length: reader.read_u32::<BigEndian>()?,
                mmt_chunks_length: reader.read_u32::<BigEndian>()?,
                mmk_chunks_length: reader.read_u32::<BigEndian>()?,
                spr_chunks_length: reader.read_u32::<BigEndian>()?,
                crc_yks_loader: reader.read_u16::<BigEndian>()?,
                crc_yks_mmt_okd: reader.read_u16::<BigEndian>()?,
                crc_yks_mmt_mmk_okd: reader.read_u16::<BigEndian>()?,
                crc_loader: reader.read_u16::<BigEndian>()?,
            },
            32 => OptionData::Dio {
                yks_chunks_length: reader.read_u32::<BigEndian>()?,
                mmt_chunks_length: reader.read_u32::<BigEndian>()?,
                mmk_chunks_length: reader.read_u32::<BigEndian>()?,
                spr_chunks_length: reader.read_u32::<BigEndian>()?,
                dio_chunks_length: reader.read_u32::<BigEndian>()?,
                crc_yks_loader: reader.read_u16::<BigEndian>()?,
                crc_yks_mmk_okd: reader.read_u16::<BigEndian>()?,
                crc_yks_mmt_mmk_okd: reader.read_u16::<BigEndian>()?,
                crc_yks_mmt_mmk_spr_okd: reader.read_u16::<BigEndian>()?,
                crc_loader: reader.read_u16::<BigEndian>()?,
            },
            _ => {
                log::info!(
                    "Unrecognized option data length, preserving verbatim. length={}",
                    buffer.len()
                );
                OptionData::Generic(buffer.to_vec())
            }
        })
    }

    pub fn len(&self) -> usize {
        match self {
            OptionData::None => 0,
            OptionData::Mmt { .. } => 12,
            OptionData::Mmk { .. } => 20,
            OptionData::Spr { .. } => 24,
            OptionData::Dio { .. } => 32,
            OptionData::Generic(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadWrite for OptionData {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let declared = self.len();
        let mut buffer = Vec::with_capacity(declared);
        match self {
            OptionData::None => {}
            OptionData::Mmt {
                yks_chunks_length,
                mmt_chunks_length,
                crc_yks_loader,
                crc_loader,
            } => {
                buffer.write_u32::<BigEndian>(*yks_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmt_chunks_length)?;
                buffer.write_u16::<BigEndian>(*crc_yks_loader)?;
                buffer.write_u16::<BigEndian>(*crc_loader)?;
            }
            OptionData::Mmk {
                yks_chunks_length,
                mmt_chunks_length,
                mmk_chunks_length,
                crc_yks_loader,
                crc_yks_mmk_okd,
                crc_loader,
            } => {
                buffer.write_u32::<BigEndian>(*yks_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmt_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmk_chunks_length)?;
                buffer.write_u16::<BigEndian>(*crc_yks_loader)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmk_okd)?;
                buffer.write_u16::<BigEndian>(*crc_loader)?;
            }
            OptionData::Spr {
                yks_chunks_length,
                mmt_chunks_length,
                mmk_chunks_length,
                spr_chunks_length,
                crc_yks_loader,
                crc_yks_mmt_okd,
                crc_yks_mmt_mmk_okd,
                crc_loader,
            } => {
                buffer.write_u32::<BigEndian>(*yks_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmt_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmk_chunks_length)?;
                buffer.write_u32::<BigEndian>(*spr_chunks_length)?;
                buffer.write_u16::<BigEndian>(*crc_yks_loader)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmt_okd)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmt_mmk_okd)?;
                buffer.write_u16::<BigEndian>(*crc_loader)?;
            }
            OptionData::Dio {
                yks_chunks_length,
                mmt_chunks_length,
                mmk_chunks_length,
                spr_chunks_length,
                dio_chunks_length,
                crc_yks_loader,
                crc_yks_mmk_okd,
                crc_yks_mmt_mmk_okd,
                crc_yks_mmt_mmk_spr_okd,
                crc_loader,
            } => {
                buffer.write_u32::<BigEndian>(*yks_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmt_chunks_length)?;
                buffer.write_u32::<BigEndian>(*mmk_chunks_length)?;
                buffer.write_u32::<BigEndian>(*spr_chunks_length)?;
                buffer.write_u32::<BigEndian>(*dio_chunks_length)?;
                buffer.write_u16::<BigEndian>(*crc_yks_loader)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmk_okd)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmt_mmk_okd)?;
                buffer.write_u16::<BigEndian>(*crc_yks_mmt_mmk_spr_okd)?;
                buffer.write_u16::<BigEndian>(*crc_loader)?;
            }
            OptionData::Generic(bytes) => buffer.extend_from_slice(bytes),
        }
        buffer.resize(declared, 0x00);
        writer.write_all(&buffer)?;
        Ok(declared)
    }
}

impl Default for OptionData {
    fn default() -> Self {
        OptionData::None
    }
}

/// Fixed part of a performance (`YKS1`) header, 40 bytes plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OkdHeader {
    pub length: u32,
    pub version: [u8; 16],
    pub id_karaoke: u32,
    pub adpcm_offset: u32,
    pub encryption_mode: u32,
    pub option_data: OptionData,
}

impl OkdHeader {
    pub fn parse(fixed: &[u8], option_data: &[u8]) -> Result<OkdHeader, OkdError> {
        if fixed.len() != FIXED_HEADER_SIZE {
            return Err(OkdError::TruncatedHeader);
        }
        let mut reader = Cursor::new(&fixed[4..]);
        let length = reader.read_u32::<BigEndian>()?;
        let mut version = [0_u8; 16];
        reader.read_exact(&mut version)?;
        let id_karaoke = reader.read_u32::<BigEndian>()?;
        let adpcm_offset = reader.read_u32::<BigEndian>()?;
        let encryption_mode = reader.read_u32::<BigEndian>()?;
        Ok(OkdHeader {
            length,
            version,
            id_karaoke,
            adpcm_offset,
            encryption_mode,
            option_data: OptionData::parse(option_data)?,
        })
    }

    /// Header of a freshly composed container: no trailing audio
    /// region, encryption mode 1, no option data.
    pub fn composed(body_length: u32) -> OkdHeader {
        OkdHeader {
            length: FIXED_HEADER_SIZE as u32 + body_length,
            version: COMPOSED_VERSION,
            id_karaoke: 0,
            adpcm_offset: 0,
            encryption_mode: 1,
            option_data: OptionData::None,
        }
    }

    pub fn option_data_length_of(fixed: &[u8]) -> Result<u32, OkdError> {
        if fixed.len() != FIXED_HEADER_SIZE {
            return Err(OkdError::TruncatedHeader);
        }
        Ok(u32::from_be_bytes([fixed[36], fixed[37], fixed[38], fixed[39]]))
    }
}

impl ReadWrite for OkdHeader {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_all(&PERFORMANCE_MAGIC)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_all(&self.version)?;
        writer.write_u32::<BigEndian>(self.id_karaoke)?;
        writer.write_u32::<BigEndian>(self.adpcm_offset)?;
        writer.write_u32::<BigEndian>(self.encryption_mode)?;
        writer.write_u32::<BigEndian>(self.option_data.len() as u32)?;
        Ok(FIXED_HEADER_SIZE + self.option_data.write_to_file(writer)?)
    }
}

/// Header of an audio-only (`YOKA`) file. Same 40-byte footprint, no
/// option data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OkaHeader {
    pub length: u32,
    pub version: [u8; 16],
    pub id_karaoke: u32,
    pub data_offset: u32,
    pub reserved: u32,
    pub crc_loader: u32,
}

impl OkaHeader {
    pub fn parse(fixed: &[u8]) -> Result<OkaHeader, OkdError> {
        if fixed.len() != FIXED_HEADER_SIZE {
            return Err(OkdError::TruncatedHeader);
        }
        let mut reader = Cursor::new(&fixed[4..]);
        let length = reader.read_u32::<BigEndian>()?;
        let mut version = [0_u8; 16];
        reader.read_exact(&mut version)?;
        Ok(OkaHeader {
            length,
            version,
            id_karaoke: reader.read_u32::<BigEndian>()?,
            data_offset: reader.read_u32::<BigEndian>()?,
            reserved: reader.read_u32::<BigEndian>()?,
            crc_loader: reader.read_u32::<BigEndian>()?,
        })
    }
}

impl ReadWrite for OkaHeader {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_all(&AUDIO_MAGIC)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_all(&self.version)?;
        writer.write_u32::<BigEndian>(self.id_karaoke)?;
        writer.write_u32::<BigEndian>(self.data_offset)?;
        writer.write_u32::<BigEndian>(self.reserved)?;
        writer.write_u32::<BigEndian>(self.crc_loader)?;
        Ok(FIXED_HEADER_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileHeader {
    Okd(OkdHeader),
    Oka(OkaHeader),
}

impl FileHeader {
    pub fn length(&self) -> u32 {
        match self {
            FileHeader::Okd(header) => header.length,
            FileHeader::Oka(header) => header.length,
        }
    }

    /// Total plaintext header footprint preceding the chunk data.
    pub fn data_offset(&self) -> u32 {
        match self {
            FileHeader::Okd(header) => {
                FIXED_HEADER_SIZE as u32 + header.option_data.len() as u32
            }
            FileHeader::Oka(_) => FIXED_HEADER_SIZE as u32,
        }
    }

    /// Absolute offset of the trailing opaque region; zero when the
    /// whole body is chunk data.
    pub fn extended_data_offset(&self) -> u32 {
        let offset = match self {
            FileHeader::Okd(header) => header.adpcm_offset,
            FileHeader::Oka(header) => header.data_offset,
        };
        if offset == 0 {
            0
        } else {
            offset.saturating_sub(FIXED_HEADER_SIZE as u32)
        }
    }

    pub fn has_extended_data(&self) -> bool {
        match self {
            FileHeader::Okd(header) => header.adpcm_offset != 0,
            FileHeader::Oka(header) => header.data_offset != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_okd(header: &OkdHeader) -> OkdHeader {
        let mut buffer = Cursor::new(Vec::new());
        header.write_to_file(&mut buffer).unwrap();
        let bytes = buffer.into_inner();
        OkdHeader::parse(&bytes[..FIXED_HEADER_SIZE], &bytes[FIXED_HEADER_SIZE..]).unwrap()
    }

    #[test]
    fn composed_header_roundtrips() {
        let header = OkdHeader::composed(1000);
        assert_eq!(header.length, 1040);
        assert_eq!(roundtrip_okd(&header), header);
    }

    #[test]
    fn option_data_shapes_by_length() {
        assert_eq!(OptionData::parse(&[]).unwrap(), OptionData::None);
        assert!(matches!(
            OptionData::parse(&[0_u8; 12]).unwrap(),
            OptionData::Mmt { .. }
        ));
        assert!(matches!(
            OptionData::parse(&[0_u8; 20]).unwrap(),
            OptionData::Mmk { .. }
        ));
        assert!(matches!(
            OptionData::parse(&[0_u8; 24]).unwrap(),
            OptionData::Spr { .. }
        ));
        assert!(matches!(
            OptionData::parse(&[0_u8; 32]).unwrap(),
            OptionData::Dio { .. }
        ));
        assert!(matches!(
            OptionData::parse(&[0_u8; 16]).unwrap(),
            OptionData::Generic(_)
        ));
    }

    #[test]
    fn option_data_preserves_declared_length() {
        for length in [0_usize, 12, 20, 24, 32, 16] {
            let option = OptionData::parse(&vec![0x11_u8; length]).unwrap();
            assert_eq!(option.len(), length);
            let mut buffer = Cursor::new(Vec::new());
            option.write_to_file(&mut buffer).unwrap();
            assert_eq!(buffer.into_inner().len(), length);
        }
    }

    #[test]
    fn mmt_fields_are_big_endian() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x11223344_u32.to_be_bytes());
        bytes.extend_from_slice(&0x55667788_u32.to_be_bytes());
        bytes.extend_from_slice(&0xAABB_u16.to_be_bytes());
        bytes.extend_from_slice(&0xCCDD_u16.to_be_bytes());
        let option = OptionData::parse(&bytes).unwrap();
        assert_eq!(
            option,
            OptionData::Mmt {
                yks_chunks_length: 0x11223344,
                mmt_chunks_length: 0x55667788,
                crc_yks_loader: 0xAABB,
                crc_loader: 0xCCDD,
            }
        );
    }

    #[test]
    fn oka_header_roundtrips() {
        let header = OkaHeader {
            length: 4096,
            version: COMPOSED_VERSION,
            id_karaoke: 7,
            data_offset: 2048,
            reserved: 0,
            crc_loader: 0,
        };
        let mut buffer = Cursor::new(Vec::new());
        header.write_to_file(&mut buffer).unwrap();
        let bytes = buffer.into_inner();
        assert_eq!(OkaHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn extended_offset_is_rebased_under_the_header() {
        let mut header = OkdHeader::composed(100);
        header.adpcm_offset = 0x100;
        let header = FileHeader::Okd(header);
        assert_eq!(header.extended_data_offset(), 0x100 - 40);
        let header = FileHeader::Okd(OkdHeader::composed(100));
        assert!(!header.has_extended_data());
        assert_eq!(header.extended_data_offset(), 0);
    }
}
