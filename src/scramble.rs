use std::io::{Read, Seek, SeekFrom};

use crate::dtype::OkdError;

/// Keystream table for the 16-bit XOR transform applied to every OKD
/// file. Indexed by the running word counter modulo 256; the same
/// operation scrambles and descrambles.
pub const SCRAMBLE_PATTERN: [u16; 256] = [
    0x87D2, 0x2F16, 0x5369, 0x4A56, 0xDF40, 0x307B, 0xF989, 0xDEAF,
    0xD74C, 0x5FB5, 0x77E2, 0x255A, 0xA546, 0x48E0, 0x4201, 0x925D,
    0xC9ED, 0x3B7A, 0x9DE3, 0x614B, 0x3A09, 0xB7AC, 0xB85D, 0x9B6D,
    0xE0BD, 0xA009, 0xD084, 0xDA98, 0x8DEB, 0xEB52, 0xAE4B, 0xD699,
    0x0FD3, 0xD9C7, 0xDA08, 0x03D6, 0x0F40, 0x2338, 0x1D2D, 0x6340,
    0x6F32, 0xC8DB, 0xC538, 0xCD98, 0xB3FF, 0x97FA, 0x29D1, 0x47E1,
    0xE77C, 0x8402, 0xF80E, 0xA1B9, 0xF416, 0x817F, 0x23BD, 0xED92,
    0x7316, 0xA849, 0x0427, 0x8412, 0x3821, 0xD6BD, 0xF775, 0x1901,
    0xE432, 0x3838, 0xB883, 0xDE50, 0x7C2D, 0x8BB0, 0xA39A, 0x6F52,
    0x712C, 0x2FCA, 0x6EA1, 0xC3A5, 0x6AC5, 0x4D98, 0x11AB, 0x0225,
    0x3F7C, 0xD65E, 0xABAE, 0x2670, 0x12AF, 0xB775, 0xAA96, 0x287F,
    0xD600, 0x33C7, 0xDE3D, 0xC3B0, 0x8503, 0xE1CA, 0x21B5, 0x6FC6,
    0x03BB, 0xACAB, 0xB5D9, 0xC2A8, 0x4528, 0x4874, 0x4308, 0x9480,
    0xE94E, 0xC3B3, 0x0768, 0x63D7, 0x1BF4, 0x5864, 0xF5FF, 0x469D,
    0x5F60, 0xE574, 0xFCED, 0x2615, 0x2622, 0x8A51, 0x75CA, 0xEE08,
    0x718F, 0xFE92, 0x0FB4, 0x5574, 0x7501, 0x2582, 0x10A1, 0xFDBC,
    0xB297, 0x2B16, 0x3EFD, 0x812E, 0xCDF7, 0xA2AB, 0xF8E3, 0x6C86,
    0x1376, 0x3906, 0xC124, 0x63C2, 0xB1DF, 0x227B, 0x7C0F, 0x99D0,
    0xBB35, 0x386F, 0x06D5, 0x3A19, 0x9CA6, 0xA70A, 0x80F1, 0x2BCB,
    0x7130, 0x148E, 0x4991, 0x5793, 0x47A6, 0x77AE, 0x52EE, 0x54CE,
    0x2E50, 0x2ACD, 0xFBF9, 0xD7C9, 0x4459, 0xE0C9, 0xF5AE, 0x0262,
    0xF83D, 0xD73F, 0x5735, 0xE2F0, 0x4FA1, 0x3AE2, 0x2F5A, 0x474F,
    0xD77A, 0x630A, 0xF13F, 0xAEE2, 0xCF3E, 0xAFD8, 0xBAAA, 0x61A0,
    0x7959, 0x7C4A, 0xB929, 0x9647, 0x4EAB, 0x2563, 0x61B5, 0x4A0F,
    0x4C51, 0xC28E, 0x371C, 0x7BAB, 0x2C71, 0x8DE6, 0x2C0E, 0x75B5,
    0x6B83, 0x8A1F, 0x51FD, 0x5F51, 0x3726, 0x556D, 0x2976, 0x7AD7,
    0xB40D, 0x2229, 0x7CA0, 0xD7C3, 0x47C8, 0x3FB7, 0x65A5, 0x3446,
    0x5499, 0xF56F, 0xB585, 0xDC12, 0xF15F, 0x5BD5, 0xD91B, 0xE53E,
    0x583F, 0xDBFD, 0xF294, 0xFAFF, 0x0A95, 0xFB85, 0xBB3C, 0xCBEA,
    0xB90A, 0x5BC5, 0x97D5, 0x0C0B, 0x8A36, 0xDCBF, 0x9C05, 0xCD5D,
    0x4F79, 0xB641, 0x8D6C, 0x443A, 0xE2C4, 0xDFAA, 0x893C, 0xF3BB,
    0xE167, 0xA1E5, 0xCB5E, 0xF21F, 0x56CD, 0x7238, 0xB80B, 0xCF59,
];

pub fn choose_scramble_pattern_index() -> u8 {
    rand::random::<u8>()
}

/// XOR `data` against the keystream starting at `scramble_pattern_index`,
/// one big-endian 16-bit word at a time. `data` must have even length.
/// Returns the pattern index following the processed region.
pub fn scramble(data: &mut [u8], scramble_pattern_index: u8) -> u8 {
    let mut index = scramble_pattern_index as usize;
    for word in data.chunks_exact_mut(2) {
        let pattern = SCRAMBLE_PATTERN[index % 0x100];
        let plaintext = u16::from_be_bytes([word[0], word[1]]);
        let scrambled = plaintext ^ pattern;
        word.copy_from_slice(&scrambled.to_be_bytes());
        index += 1;
    }
    (index % 0x100) as u8
}

/// The transform is an involution.
pub fn descramble(data: &mut [u8], scramble_pattern_index: u8) -> u8 {
    scramble(data, scramble_pattern_index)
}

/// Read `length` bytes and descramble them, returning the plaintext and
/// the pattern index following the region.
pub fn descramble_exact<R: Read>(
    reader: &mut R,
    length: usize,
    scramble_pattern_index: u8,
) -> Result<(Vec<u8>, u8), OkdError> {
    let mut buffer = vec![0_u8; length];
    reader.read_exact(&mut buffer)?;
    let next_index = descramble(&mut buffer, scramble_pattern_index);
    Ok((buffer, next_index))
}

/// Recover the starting pattern index from the first four scrambled
/// bytes, given the magic bytes they must descramble to. The candidate
/// for index 255 wraps around to the table's first entry.
pub fn detect_scramble_pattern_index(
    scrambled_magic: [u8; 4],
    expected_magic: [u8; 4],
) -> Result<u8, OkdError> {
    let scrambled = u32::from_be_bytes(scrambled_magic);
    let expected = u32::from_be_bytes(expected_magic);
    let expected_key = scrambled ^ expected;
    for scramble_pattern_index in 0..0x100_usize {
        let mut candidate_key: u32 = if scramble_pattern_index == 0xFF {
            SCRAMBLE_PATTERN[0] as u32
        } else {
            SCRAMBLE_PATTERN[scramble_pattern_index + 1] as u32
        };
        candidate_key |= (SCRAMBLE_PATTERN[scramble_pattern_index] as u32) << 16;
        if expected_key == candidate_key {
            log::info!(
                "Scramble pattern index detected. scramble_pattern_index={}",
                scramble_pattern_index
            );
            return Ok(scramble_pattern_index as u8);
        }
    }
    Err(OkdError::UnknownKey)
}

/// Skip the optional `SPRC` pre-header (16 bytes); rewinds otherwise.
pub fn absorb_spr_header<R: Read + Seek>(reader: &mut R) -> Result<bool, OkdError> {
    let start_position = reader.stream_position()?;
    let mut buffer = [0_u8; 4];
    if reader.read_exact(&mut buffer).is_err() {
        reader.seek(SeekFrom::Start(start_position))?;
        return Ok(false);
    }
    if &buffer == b"SPRC" {
        log::info!("SPR header detected.");
        reader.seek(SeekFrom::Start(start_position + 16))?;
        Ok(true)
    } else {
        reader.seek(SeekFrom::Start(start_position))?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scramble_is_an_involution() {
        let original: Vec<u8> = (0..64_u8).collect();
        for index in [0x00, 0x01, 0x7F, 0xFE, 0xFF] {
            let mut buffer = original.clone();
            scramble(&mut buffer, index);
            assert_ne!(buffer, original);
            descramble(&mut buffer, index);
            assert_eq!(buffer, original);
        }
    }

    #[test]
    fn scramble_advances_across_regions() {
        let mut whole: Vec<u8> = (0..40_u8).collect();
        let mut head = whole[..16].to_vec();
        let mut tail = whole[16..].to_vec();
        scramble(&mut whole, 3);
        let next = scramble(&mut head, 3);
        assert_eq!(next, 3 + 8);
        scramble(&mut tail, next);
        assert_eq!(&whole[..16], &head[..]);
        assert_eq!(&whole[16..], &tail[..]);
    }

    #[test]
    fn detects_every_start_index() {
        for index in 0..=0xFF_u8 {
            let mut magic = *b"YKS1";
            scramble(&mut magic, index);
            assert_eq!(
                detect_scramble_pattern_index(magic, *b"YKS1").unwrap(),
                index
            );
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            detect_scramble_pattern_index([0x59, 0x4B, 0x53, 0x31], *b"YKS1"),
            Err(OkdError::UnknownKey)
        ));
    }

    #[test]
    fn spr_header_is_absorbed() {
        use std::io::Cursor;
        let mut data = b"SPRC".to_vec();
        data.extend_from_slice(&[0_u8; 12]);
        data.extend_from_slice(b"rest");
        let mut cursor = Cursor::new(data);
        assert!(absorb_spr_header(&mut cursor).unwrap());
        assert_eq!(cursor.position(), 16);

        let mut cursor = Cursor::new(b"YKS1....".to_vec());
        assert!(!absorb_spr_header(&mut cursor).unwrap());
        assert_eq!(cursor.position(), 0);
    }
}
