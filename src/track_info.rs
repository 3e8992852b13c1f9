use std::io::{Read, Seek, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::dtype::{OkdError, ReadWrite};

bitflags! {
    /// Raw track status word. Only the lossless-duration bit has known
    /// meaning; the rest round-trips untouched.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TrackStatus: u8 {
        const LOSSLESS_DURATION = 0x08;
        const _ = !0;
    }
}

impl TrackStatus {
    pub fn lossless_duration(&self) -> bool {
        self.contains(TrackStatus::LOSSLESS_DURATION)
    }
}

/// Per-channel routing values shared by every track-info variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelRouting {
    pub ports: u16,
    pub control_change_ax: u8,
    pub control_change_cx: u8,
}

/// Uniform view over the three track-info shapes, used by the P-Track
/// projection. The variants differ in field widths but are isomorphic.
pub trait TrackInfoEntry {
    fn track_number(&self) -> u8;
    fn track_status(&self) -> TrackStatus;
    fn single_channel_group(&self, channel: usize) -> u16;
    fn channel_group(&self, channel: usize) -> u16;
    fn channel_routing(&self, channel: usize) -> ChannelRouting;
    fn system_ex_ports(&self) -> u16;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTrackInfoChannelInfoEntry {
    pub attribute: u8,
    pub ports: u8,
    pub control_change_ax: u8,
    pub control_change_cx: u8,
}
impl PTrackInfoChannelInfoEntry {
    pub fn read<R: Read>(reader: &mut R) -> Result<PTrackInfoChannelInfoEntry, OkdError> {
        Ok(PTrackInfoChannelInfoEntry {
            attribute: reader.read_u8()?,
            ports: reader.read_u8()?,
            control_change_ax: reader.read_u8()?,
            control_change_cx: reader.read_u8()?,
        })
    }
    pub fn is_chorus(&self) -> bool {
        self.attribute & 0x80 != 0x80
    }
}
impl ReadWrite for PTrackInfoChannelInfoEntry {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_u8(self.attribute)?;
        writer.write_u8(self.ports)?;
        writer.write_u8(self.control_change_ax)?;
        writer.write_u8(self.control_change_cx)?;
        Ok(4)
    }
}

/// Short-form (`YPTI`) entry. `single_channel_groups` slots whose flag
/// bit is clear are not stored; zero means single-channel identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTrackInfoEntry {
    pub track_number: u8,
    pub track_status: u8,
    pub use_channel_group_flag: u16,
    pub single_channel_groups: [u16; 16],
    pub channel_groups: [u16; 16],
    pub channel_info: Vec<PTrackInfoChannelInfoEntry>,
    pub system_ex_ports: u16,
}
impl PTrackInfoEntry {
    pub fn read<R: Read>(reader: &mut R) -> Result<PTrackInfoEntry, OkdError> {
        let track_number = reader.read_u8()?;
        let track_status = reader.read_u8()?;
        let use_channel_group_flag = reader.read_u16::<BigEndian>()?;

        let mut single_channel_groups = [0_u16; 16];
        for (channel, group) in single_channel_groups.iter_mut().enumerate() {
            if (use_channel_group_flag >> channel) & 0x0001 == 0x0001 {
                *group = reader.read_u16::<BigEndian>()?;
            }
        }

        let mut channel_groups = [0_u16; 16];
        for group in channel_groups.iter_mut() {
            *group = reader.read_u16::<BigEndian>()?;
        }

        let mut channel_info = Vec::with_capacity(16);
        for _ in 0..16 {
            channel_info.push(PTrackInfoChannelInfoEntry::read(reader)?);
        }

        let system_ex_ports = reader.read_u16::<LittleEndian>()?;

        Ok(PTrackInfoEntry {
            track_number,
            track_status,
            use_channel_group_flag,
            single_channel_groups,
            channel_groups,
            channel_info,
            system_ex_ports,
        })
    }
}
impl ReadWrite for PTrackInfoEntry {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        writer.write_u8(self.track_number)?;
        writer.write_u8(self.track_status)?;
        writer.write_u16::<BigEndian>(self.use_channel_group_flag)?;
        bytes_written += 4;
        for (channel, group) in self.single_channel_groups.iter().enumerate() {
            if (self.use_channel_group_flag >> channel) & 0x0001 == 0x0001 {
                writer.write_u16::<BigEndian>(*group)?;
                bytes_written += 2;
            }
        }
        for group in self.channel_groups.iter() {
            writer.write_u16::<BigEndian>(*group)?;
            bytes_written += 2;
        }
        for entry in &self.channel_info {
            bytes_written += entry.write_to_file(writer)?;
        }
        writer.write_u16::<LittleEndian>(self.system_ex_ports)?;
        bytes_written += 2;
        Ok(bytes_written)
    }
}
impl TrackInfoEntry for PTrackInfoEntry {
    fn track_number(&self) -> u8 {
        self.track_number
    }
    fn track_status(&self) -> TrackStatus {
        TrackStatus::from_bits_retain(self.track_status)
    }
    fn single_channel_group(&self, channel: usize) -> u16 {
        self.single_channel_groups[channel]
    }
    fn channel_group(&self, channel: usize) -> u16 {
        self.channel_groups[channel]
    }
    fn channel_routing(&self, channel: usize) -> ChannelRouting {
        let entry = &self.channel_info[channel];
        ChannelRouting {
            ports: entry.ports as u16,
            control_change_ax: entry.control_change_ax,
            control_change_cx: entry.control_change_cx,
        }
    }
    fn system_ex_ports(&self) -> u16 {
        self.system_ex_ports
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTrackInfoChunk {
    pub entries: Vec<PTrackInfoEntry>,
}
impl PTrackInfoChunk {
    pub fn read<R: Read>(reader: &mut R) -> Result<PTrackInfoChunk, OkdError> {
        let entry_count = reader.read_u16::<BigEndian>()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(PTrackInfoEntry::read(reader)?);
        }
        Ok(PTrackInfoChunk { entries })
    }
}
impl ReadWrite for PTrackInfoChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_u16::<BigEndian>(self.entries.len() as u16)?;
        let mut bytes_written = 2;
        for entry in &self.entries {
            bytes_written += entry.write_to_file(writer)?;
        }
        Ok(bytes_written)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPTrackInfoChannelInfoEntry {
    pub attribute: u16,
    pub ports: u16,
    pub reserved: u16,
    pub control_change_ax: u8,
    pub control_change_cx: u8,
}
impl ExtendedPTrackInfoChannelInfoEntry {
    pub fn read<R: Read>(reader: &mut R) -> Result<ExtendedPTrackInfoChannelInfoEntry, OkdError> {
        Ok(ExtendedPTrackInfoChannelInfoEntry {
            attribute: reader.read_u16::<LittleEndian>()?,
            ports: reader.read_u16::<BigEndian>()?,
            reserved: reader.read_u16::<BigEndian>()?,
            control_change_ax: reader.read_u8()?,
            control_change_cx: reader.read_u8()?,
        })
    }
    pub fn is_chorus(&self) -> bool {
        self.attribute & 0x0080 != 0x0080
    }
    pub fn is_guide_melody(&self) -> bool {
        self.attribute & 0x0100 == 0x0100
    }
}
impl ReadWrite for ExtendedPTrackInfoChannelInfoEntry {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_u16::<LittleEndian>(self.attribute)?;
        writer.write_u16::<BigEndian>(self.ports)?;
        writer.write_u16::<BigEndian>(self.reserved)?;
        writer.write_u8(self.control_change_ax)?;
        writer.write_u8(self.control_change_cx)?;
        Ok(8)
    }
}

/// Long-form (`YPXI`) entry; all sixteen single-channel groups are
/// stored unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPTrackInfoEntry {
    pub track_number: u8,
    pub track_status: u8,
    pub reserved_1: u16,
    pub single_channel_groups: [u16; 16],
    pub channel_groups: [u16; 16],
    pub channel_info: Vec<ExtendedPTrackInfoChannelInfoEntry>,
    pub system_ex_ports: u16,
    pub reserved_2: u16,
}
impl ExtendedPTrackInfoEntry {
    pub fn read<R: Read>(reader: &mut R) -> Result<ExtendedPTrackInfoEntry, OkdError> {
        let track_number = reader.read_u8()?;
        let track_status = reader.read_u8()?;
        let reserved_1 = reader.read_u16::<BigEndian>()?;

        let mut single_channel_groups = [0_u16; 16];
        for group in single_channel_groups.iter_mut() {
            *group = reader.read_u16::<BigEndian>()?;
        }
        let mut channel_groups = [0_u16; 16];
        for group in channel_groups.iter_mut() {
            *group = reader.read_u16::<BigEndian>()?;
        }
        let mut channel_info = Vec::with_capacity(16);
        for _ in 0..16 {
            channel_info.push(ExtendedPTrackInfoChannelInfoEntry::read(reader)?);
        }
        let system_ex_ports = reader.read_u16::<BigEndian>()?;
        let reserved_2 = reader.read_u16::<BigEndian>()?;

        Ok(ExtendedPTrackInfoEntry {
            track_number,
            track_status,
            reserved_1,
            single_channel_groups,
            channel_groups,
            channel_info,
            system_ex_ports,
            reserved_2,
        })
    }
}
impl ReadWrite for ExtendedPTrackInfoEntry {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        writer.write_u8(self.track_number)?;
        writer.write_u8(self.track_status)?;
        writer.write_u16::<BigEndian>(self.reserved_1)?;
        bytes_written += 4;
        for group in self.single_channel_groups.iter() {
            writer.write_u16::<BigEndian>(*group)?;
            bytes_written += 2;
        }
        for group in self.channel_groups.iter() {
            writer.write_u16::<BigEndian>(*group)?;
            bytes_written += 2;
        }
        for entry in &self.channel_info {
            bytes_written += entry.write_to_file(writer)?;
        }
        writer.write_u16::<BigEndian>(self.system_ex_ports)?;
        writer.write_u16::<BigEndian>(self.reserved_2)?;
        bytes_written += 4;
        Ok(bytes_written)
    }
}
impl TrackInfoEntry for ExtendedPTrackInfoEntry {
    fn track_number(&self) -> u8 {
        self.track_number
    }
    fn track_status(&self) -> TrackStatus {
        TrackStatus::from_bits_retain(self.track_status)
    }
    fn single_channel_group(&self, channel: usize) -> u16 {
        self.single_channel_groups[channel]
    }
    fn channel_group(&self, channel: usize) -> u16 {
        self.channel_groups[channel]
    }
    fn channel_routing(&self, channel: usize) -> ChannelRouting {
        let entry = &self.channel_info[channel];
        ChannelRouting {
            ports: entry.ports,
            control_change_ax: entry.control_change_ax,
            control_change_cx: entry.control_change_cx,
        }
    }
    fn system_ex_ports(&self) -> u16 {
        self.system_ex_ports
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPTrackInfoChunk {
    pub reserved: [u8; 8],
    pub tg_mode: u16,
    pub entries: Vec<ExtendedPTrackInfoEntry>,
}
impl ExtendedPTrackInfoChunk {
    pub fn read<R: Read>(reader: &mut R) -> Result<ExtendedPTrackInfoChunk, OkdError> {
        let mut reserved = [0_u8; 8];
        reader.read_exact(&mut reserved)?;
        let tg_mode = reader.read_u16::<BigEndian>()?;
        let entry_count = reader.read_u16::<BigEndian>()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(ExtendedPTrackInfoEntry::read(reader)?);
        }
        Ok(ExtendedPTrackInfoChunk {
            reserved,
            tg_mode,
            entries,
        })
    }
}
impl ReadWrite for ExtendedPTrackInfoChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_all(&self.reserved)?;
        writer.write_u16::<BigEndian>(self.tg_mode)?;
        writer.write_u16::<BigEndian>(self.entries.len() as u16)?;
        let mut bytes_written = 12;
        for entry in &self.entries {
            bytes_written += entry.write_to_file(writer)?;
        }
        Ok(bytes_written)
    }
}

/// `YP3I` scoring-reference info: a single short-form entry without the
/// count prefix. The port byte keeps only its low three bits on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P3TrackInfoChunk {
    pub track_number: u8,
    pub track_status: u8,
    pub use_channel_group_flag: u16,
    pub single_channel_groups: [u16; 16],
    pub channel_groups: [u16; 16],
    pub channel_info: Vec<PTrackInfoChannelInfoEntry>,
    pub system_ex_ports: u16,
}
impl P3TrackInfoChunk {
    pub fn read<R: Read>(reader: &mut R) -> Result<P3TrackInfoChunk, OkdError> {
        let track_number = reader.read_u8()?;
        let track_status = reader.read_u8()?;
        let use_channel_group_flag = reader.read_u16::<BigEndian>()?;

        let mut single_channel_groups = [0_u16; 16];
        for (channel, group) in single_channel_groups.iter_mut().enumerate() {
            if (use_channel_group_flag >> channel) & 0x0001 == 0x0001 {
                *group = reader.read_u16::<BigEndian>()?;
            }
        }
        let mut channel_groups = [0_u16; 16];
        for group in channel_groups.iter_mut() {
            *group = reader.read_u16::<BigEndian>()?;
        }
        let mut channel_info = Vec::with_capacity(16);
        for _ in 0..16 {
            let mut entry = PTrackInfoChannelInfoEntry::read(reader)?;
            entry.ports &= 0x07;
            channel_info.push(entry);
        }
        let system_ex_ports = reader.read_u16::<LittleEndian>()?;

        Ok(P3TrackInfoChunk {
            track_number,
            track_status,
            use_channel_group_flag,
            single_channel_groups,
            channel_groups,
            channel_info,
            system_ex_ports,
        })
    }
}
impl ReadWrite for P3TrackInfoChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        writer.write_u8(self.track_number)?;
        writer.write_u8(self.track_status)?;
        writer.write_u16::<BigEndian>(self.use_channel_group_flag)?;
        bytes_written += 4;
        for (channel, group) in self.single_channel_groups.iter().enumerate() {
            if (self.use_channel_group_flag >> channel) & 0x0001 == 0x0001 {
                writer.write_u16::<BigEndian>(*group)?;
                bytes_written += 2;
            }
        }
        for group in self.channel_groups.iter() {
            writer.write_u16::<BigEndian>(*group)?;
            bytes_written += 2;
        }
        for entry in &self.channel_info {
            bytes_written += entry.write_to_file(writer)?;
        }
        writer.write_u16::<LittleEndian>(self.system_ex_ports)?;
        bytes_written += 2;
        Ok(bytes_written)
    }
}
impl TrackInfoEntry for P3TrackInfoChunk {
    fn track_number(&self) -> u8 {
        self.track_number
    }
    fn track_status(&self) -> TrackStatus {
        TrackStatus::from_bits_retain(self.track_status)
    }
    fn single_channel_group(&self, channel: usize) -> u16 {
        self.single_channel_groups[channel]
    }
    fn channel_group(&self, channel: usize) -> u16 {
        self.channel_groups[channel]
    }
    fn channel_routing(&self, channel: usize) -> ChannelRouting {
        let entry = &self.channel_info[channel];
        ChannelRouting {
            ports: entry.ports as u16,
            control_change_ax: entry.control_change_ax,
            control_change_cx: entry.control_change_cx,
        }
    }
    fn system_ex_ports(&self) -> u16 {
        self.system_ex_ports
    }
}
