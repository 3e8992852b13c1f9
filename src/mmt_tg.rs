pub mod multi_part;

use serde::Serialize;

use crate::dtype::{AbsoluteTimeMessage, OkdError};
use self::multi_part::{general_midi_deltas, MultiPartEntry};

pub const CHANNEL_COUNT_PER_PORT: usize = 16;
pub const NATIVE_PARAMETER_MEMORY_SIZE: usize = 0x200000;
pub const MULTI_PART_ENTRY_COUNT: usize = 0x20;

const MULTI_PART_BASE_ADDRESS: usize = 0x008000;
const ALL_PARAMETERS_RESET_ADDRESS: u32 = 0x00007F;

/// Part numbers and table entries are related by a fixed permutation:
/// the rhythm part of each bank sits in front of its melodic parts.
pub const PART_NUMBER_TO_ENTRY_INDEX: [u8; MULTI_PART_ENTRY_COUNT] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
    0x09, 0x00, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18,
    0x19, 0x10, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
];

pub const ENTRY_INDEX_TO_PART_NUMBER: [u8; MULTI_PART_ENTRY_COUNT] = [
    0x09, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
    0x07, 0x08, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x19, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16,
    0x17, 0x18, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
];

/// Per-entry power-on defaults, as (register offset, value). The
/// receive channel register (`+0x04`) is the entry index itself and is
/// set separately.
const MULTI_PART_ENTRY_DEFAULTS: &[(usize, u8)] = &[
    (0x05, 0x01), (0x06, 0x01), (0x07, 0x01), (0x08, 0x01), (0x09, 0x01),
    (0x0A, 0x01), (0x0B, 0x01), (0x0C, 0x01), (0x0D, 0x01), (0x0E, 0x01),
    (0x0F, 0x01), (0x10, 0x01), (0x11, 0x01), (0x12, 0x01), (0x13, 0x01),
    (0x14, 0x01), (0x15, 0x01), (0x16, 0x01), (0x17, 0x01), (0x18, 0x01),
    (0x19, 0x08),
    (0x1B, 0x64), (0x1C, 0x40), (0x1D, 0x40), (0x1E, 0x40),
    (0x20, 0x7F), (0x21, 0x10), (0x22, 0x11), (0x23, 0x7F),
    (0x25, 0x40),
    (0x27, 0x40), (0x28, 0x40), (0x29, 0x40), (0x2A, 0x40),
    (0x2B, 0x40), (0x2C, 0x40), (0x2D, 0x40), (0x2E, 0x40),
    (0x2F, 0x40), (0x30, 0x40), (0x31, 0x40), (0x32, 0x40),
    (0x33, 0x40), (0x34, 0x40), (0x35, 0x40), (0x36, 0x40),
    (0x37, 0x40), (0x38, 0x40), (0x39, 0x40), (0x3A, 0x40),
    (0x3B, 0x40), (0x3C, 0x40), (0x3D, 0x40), (0x3E, 0x0A),
    (0x41, 0x42), (0x42, 0x40), (0x43, 0x40),
    (0x47, 0x40), (0x48, 0x40), (0x49, 0x40),
    (0x4D, 0x40), (0x4E, 0x40), (0x4F, 0x40),
    (0x53, 0x40), (0x54, 0x40), (0x55, 0x40),
    (0x59, 0x40), (0x5A, 0x40), (0x5B, 0x40),
];

/// System-region parameters at the base of the native memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemParams {
    pub master_tune: u16,
    pub master_volume: u8,
    pub transpose: u8,
    pub master_pan: u8,
    pub master_cutoff: u8,
    pub master_pitch_modulation_depth: u8,
    pub variation_effect_send_control_change_number: u8,
}

/// Parameter memory of the karaoke platform's FM/AWM tone generator.
/// Only the memory and its projection to General MIDI are modeled.
pub struct MmtTg {
    pub sound_module_mode: u8,
    memory: Box<[u8; NATIVE_PARAMETER_MEMORY_SIZE]>,
}

impl Default for MmtTg {
    fn default() -> Self {
        MmtTg::new()
    }
}

impl MmtTg {
    pub fn new() -> MmtTg {
        let mut device = MmtTg {
            sound_module_mode: 0x00,
            memory: vec![0_u8; NATIVE_PARAMETER_MEMORY_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("memory size is fixed"),
        };
        device.initialize_state();
        device
    }

    pub fn initialize_state(&mut self) {
        self.sound_module_mode = 0x00;
        self.memory.fill(0x00);
        for entry_index in 0..MULTI_PART_ENTRY_COUNT {
            let entry_address = MULTI_PART_BASE_ADDRESS + (entry_index << 7);
            self.memory[entry_address + 0x04] = entry_index as u8;
            for &(offset, value) in MULTI_PART_ENTRY_DEFAULTS {
                self.memory[entry_address + offset] = value;
            }
        }
    }

    pub fn memory(&self) -> &[u8] {
        self.memory.as_ref()
    }

    pub fn system_params(&self) -> SystemParams {
        SystemParams {
            master_tune: (((self.memory[0x000000] & 0x0F) as u16) << 12)
                | (((self.memory[0x000001] & 0x0F) as u16) << 8)
                | (((self.memory[0x000002] & 0x0F) as u16) << 4)
                | ((self.memory[0x000003] & 0x0F) as u16),
            master_volume: self.memory[0x000004],
            transpose: self.memory[0x000005],
            master_pan: self.memory[0x000006],
            master_cutoff: self.memory[0x000007],
            master_pitch_modulation_depth: self.memory[0x000008],
            variation_effect_send_control_change_number: self.memory[0x000009],
        }
    }

    pub fn multi_part_entry(&self, part_number: usize) -> MultiPartEntry {
        let entry_index = PART_NUMBER_TO_ENTRY_INDEX[part_number] as usize;
        let entry_address = MULTI_PART_BASE_ADDRESS + (entry_index << 7);
        MultiPartEntry::from_memory(self.memory.as_ref(), entry_address)
    }

    fn is_sysex_message(data: &[u8]) -> bool {
        data.len() >= 3 && data[0] == 0xF0 && data.last() == Some(&0xF7)
    }

    fn is_universal_realtime_message(data: &[u8]) -> bool {
        Self::is_sysex_message(data) && data.len() >= 8 && data[1] == 0x7F
    }

    fn is_universal_non_realtime_message(data: &[u8]) -> bool {
        Self::is_sysex_message(data) && data.len() >= 6 && data[1] == 0x7E
    }

    pub fn is_native_parameter_change_message(data: &[u8]) -> bool {
        Self::is_sysex_message(data) && data.len() >= 10 && data[1] == 0x43 && data[2] & 0xF0 == 0x10
    }

    pub fn receive_sysex_message(&mut self, data: &[u8]) -> Result<(), OkdError> {
        if data.len() < 2 || data[0] != 0xF0 {
            return Err(OkdError::BadSysexFrame("status byte is not F0"));
        }
        if data.last() != Some(&0xF7) {
            return Err(OkdError::BadSysexFrame("missing F7 terminator"));
        }

        match data[1] {
            0x7F => self.receive_universal_realtime_message(data),
            0x7E => self.receive_universal_non_realtime_message(data),
            0x43 => {
                if data[2] & 0xF0 != 0x10 {
                    log::warn!(
                        "Unknown native SysEx message detected. device_number_byte={:#04X}",
                        data[2]
                    );
                    return Ok(());
                }
                self.receive_native_parameter_change_message(data)
            }
            manufacture_id => {
                log::warn!(
                    "Unknown manufacture ID detected. manufacture_id={:#04X}",
                    manufacture_id
                );
                Ok(())
            }
        }
    }

    fn receive_universal_realtime_message(&mut self, data: &[u8]) -> Result<(), OkdError> {
        if !Self::is_universal_realtime_message(data) {
            return Err(OkdError::BadSysexFrame("short universal realtime message"));
        }
        let sub_id_1 = data[3];
        if sub_id_1 != 0x04 {
            log::warn!("Unknown sub ID 1 detected. sub_id_1={:#04X}", sub_id_1);
            return Ok(());
        }
        let sub_id_2 = data[4];
        match sub_id_2 {
            0x01 => {
                // Master volume, MSB only.
                self.memory[0x000004] = data[6];
            }
            0x02 => {
                // Master balance, MSB only.
                self.memory[0x000006] = data[6];
            }
            _ => log::warn!("Unknown sub ID 2 detected. sub_id_2={:#04X}", sub_id_2),
        }
        Ok(())
    }

    fn receive_universal_non_realtime_message(&mut self, data: &[u8]) -> Result<(), OkdError> {
        if !Self::is_universal_non_realtime_message(data) {
            return Err(OkdError::BadSysexFrame(
                "short universal non-realtime message",
            ));
        }
        let sub_id_1 = data[3];
        if sub_id_1 != 0x09 {
            log::warn!("Unknown sub ID 1 detected. sub_id_1={:#04X}", sub_id_1);
            return Ok(());
        }
        let sub_id_2 = data[4];
        if sub_id_2 == 0x01 {
            // General MIDI mode; the short form carries no mode byte.
            self.sound_module_mode = if data.len() >= 7 { data[5] } else { 0x00 };
        } else {
            log::warn!("Unknown sub ID 2 detected. sub_id_2={:#04X}", sub_id_2);
        }
        Ok(())
    }

    fn receive_native_parameter_change_message(&mut self, data: &[u8]) -> Result<(), OkdError> {
        if !Self::is_native_parameter_change_message(data) {
            return Err(OkdError::BadSysexFrame("short native parameter change"));
        }
        let address =
            ((data[4] as u32) << 14) | ((data[5] as u32) << 7) | (data[6] as u32);
        if address == ALL_PARAMETERS_RESET_ADDRESS {
            self.initialize_state();
            return Ok(());
        }
        let payload = &data[7..data.len() - 2];
        let _check_sum = data[data.len() - 2];

        let start = address as usize;
        let end = (start + payload.len()).min(NATIVE_PARAMETER_MEMORY_SIZE);
        self.memory[start..end].copy_from_slice(&payload[..end - start]);
        Ok(())
    }

    /// The full mapped multi-part state of one port, emitted as if every
    /// register had just been written. Used once per port before its
    /// first event.
    pub fn track_setup_messages(&self, port: u8) -> Vec<AbsoluteTimeMessage> {
        let mut messages = Vec::new();
        for index in 0..CHANNEL_COUNT_PER_PORT {
            let part_number =
                (port as usize * CHANNEL_COUNT_PER_PORT + index) % MULTI_PART_ENTRY_COUNT;
            let entry = self.multi_part_entry(part_number);
            let track = port as u16 * CHANNEL_COUNT_PER_PORT as u16 + index as u16;
            for data in general_midi_deltas(None, &entry, index as u8) {
                messages.push(AbsoluteTimeMessage {
                    time: 0,
                    port,
                    track,
                    data,
                });
            }
        }
        messages
    }

    /// Apply one SysEx message and derive the General MIDI traffic its
    /// state change implies. Multi-part writes diff the 32-part view;
    /// anything else mutates memory silently.
    pub fn sysex_to_general_midi(
        &mut self,
        message: &AbsoluteTimeMessage,
    ) -> Vec<AbsoluteTimeMessage> {
        let data = &message.data;
        if !Self::is_sysex_message(data) {
            log::warn!("Not a well-formed SysEx message. data={:02X?}", data);
            return Vec::new();
        }

        if !Self::is_native_parameter_change_message(data) || data[4] != 0x02 {
            if let Err(error) = self.receive_sysex_message(data) {
                log::warn!("SysEx message discarded. error={}", error);
            }
            return Vec::new();
        }

        let before: Vec<MultiPartEntry> = (0..MULTI_PART_ENTRY_COUNT)
            .map(|part_number| self.multi_part_entry(part_number))
            .collect();
        if let Err(error) = self.receive_sysex_message(data) {
            log::warn!("SysEx message discarded. error={}", error);
            return Vec::new();
        }

        let mut general_midi_messages = Vec::new();
        for (part_number, before_entry) in before.iter().enumerate() {
            let after_entry = self.multi_part_entry(part_number);
            let channel = (part_number % CHANNEL_COUNT_PER_PORT) as u8;
            let port = (part_number / CHANNEL_COUNT_PER_PORT) as u8;
            for data in general_midi_deltas(Some(before_entry), &after_entry, channel) {
                general_midi_messages.push(AbsoluteTimeMessage {
                    time: message.time,
                    port,
                    track: part_number as u16,
                    data,
                });
            }
        }
        general_midi_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_parameter_change(address: u32, payload: &[u8]) -> Vec<u8> {
        let address_bytes = [
            ((address >> 14) & 0x7F) as u8,
            ((address >> 7) & 0x7F) as u8,
            (address & 0x7F) as u8,
        ];
        let mut data = vec![0xF0, 0x43, 0x10, 0x4C];
        data.extend_from_slice(&address_bytes);
        data.extend_from_slice(payload);
        let sum: u32 = address_bytes.iter().map(|&b| b as u32).sum::<u32>()
            + payload.iter().map(|&b| b as u32).sum::<u32>();
        data.push(((0x80 - (sum & 0x7F)) & 0x7F) as u8);
        data.push(0xF7);
        data
    }

    fn abs_message(data: Vec<u8>) -> AbsoluteTimeMessage {
        AbsoluteTimeMessage {
            time: 960,
            port: 0,
            track: 0,
            data,
        }
    }

    fn part_program_address(part_number: usize) -> u32 {
        let entry_index = PART_NUMBER_TO_ENTRY_INDEX[part_number] as u32;
        0x008000 + (entry_index << 7) + 0x03
    }

    #[test]
    fn permutation_tables_are_inverse() {
        for part_number in 0..MULTI_PART_ENTRY_COUNT {
            let entry_index = PART_NUMBER_TO_ENTRY_INDEX[part_number] as usize;
            assert_eq!(
                ENTRY_INDEX_TO_PART_NUMBER[entry_index] as usize,
                part_number
            );
        }
    }

    #[test]
    fn defaults_match_the_documented_registers() {
        let device = MmtTg::new();
        let entry = device.multi_part_entry(0);
        assert_eq!(entry.volume, 0x64);
        assert_eq!(entry.pan, 0x40);
        assert_eq!(entry.bend_pitch_control, 0x42);
        assert_eq!(entry.ac_1_controller_number, 0x10);
        assert_eq!(entry.scale_tuning_b, 0x40);
        assert_eq!(entry.mw_lfo_pmod_depth, 0x0A);
        // Part 0 lives in entry 1.
        assert_eq!(entry.rcv_channel, 0x01);
    }

    #[test]
    fn program_write_projects_to_program_change() {
        let mut device = MmtTg::new();
        let message =
            abs_message(native_parameter_change(part_program_address(0), &[0x20]));
        let general_midi = device.sysex_to_general_midi(&message);
        assert_eq!(general_midi.len(), 1);
        assert_eq!(general_midi[0].data, vec![0xC0, 0x20]);
        assert_eq!(general_midi[0].time, 960);
        assert_eq!(general_midi[0].track, 0);
    }

    #[test]
    fn repeated_write_is_idempotent() {
        let mut device = MmtTg::new();
        let message =
            abs_message(native_parameter_change(part_program_address(3), &[0x51]));
        let first = device.sysex_to_general_midi(&message);
        assert!(!first.is_empty());
        let second = device.sysex_to_general_midi(&message);
        assert!(second.is_empty());
    }

    #[test]
    fn reset_address_restores_defaults() {
        let mut device = MmtTg::new();
        let write = abs_message(native_parameter_change(part_program_address(5), &[0x33]));
        device.sysex_to_general_midi(&write);
        assert_eq!(device.multi_part_entry(5).program_number, 0x33);

        let reset = native_parameter_change(0x00007F, &[0x00]);
        device.receive_sysex_message(&reset).unwrap();
        let fresh = MmtTg::new();
        assert_eq!(device.multi_part_entry(5), fresh.multi_part_entry(5));
        assert_eq!(device.memory(), fresh.memory());
    }

    #[test]
    fn master_volume_is_stored_not_projected() {
        let mut device = MmtTg::new();
        let message = abs_message(vec![0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x00, 0x65, 0xF7]);
        let general_midi = device.sysex_to_general_midi(&message);
        assert!(general_midi.is_empty());
        assert_eq!(device.system_params().master_volume, 0x65);
    }

    #[test]
    fn general_midi_mode_message_sets_module_mode() {
        let mut device = MmtTg::new();
        device
            .receive_sysex_message(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7])
            .unwrap();
        assert_eq!(device.sound_module_mode, 0x00);
        device
            .receive_sysex_message(&[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0x02, 0xF7])
            .unwrap();
        assert_eq!(device.sound_module_mode, 0x02);
    }

    #[test]
    fn bad_frames_are_rejected() {
        let mut device = MmtTg::new();
        assert!(device.receive_sysex_message(&[0x90, 0x3C, 0x40]).is_err());
        assert!(device
            .receive_sysex_message(&[0xF0, 0x43, 0x10, 0x4C, 0x00])
            .is_err());
    }

    #[test]
    fn writes_stay_inside_the_memory_bound() {
        let mut device = MmtTg::new();
        // Highest addressable byte, payload spills past the end.
        let message = native_parameter_change(0x1FFFFF, &[0x11, 0x22, 0x33]);
        device.receive_sysex_message(&message).unwrap();
        assert_eq!(device.memory()[0x1FFFFF], 0x11);
    }

    #[test]
    fn setup_burst_covers_the_port() {
        let device = MmtTg::new();
        let messages = device.track_setup_messages(1);
        // 16 parts, 12 mapped fields, the RPN run counting three.
        assert_eq!(messages.len(), 16 * 14);
        assert!(messages.iter().all(|message| message.port == 1));
        assert_eq!(messages[0].track, 16);
    }
}
