use bevy_reflect::{Reflect, Struct};
use phf::phf_ordered_map;
use serde::Serialize;

/// One slot of the multi-part parameter change table, mirroring the
/// tone generator's own register layout at `0x008000 + (entry << 7)`.
/// Field order is the register order; the General MIDI projection walks
/// the fields by reflection and emits deltas in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Reflect, Serialize)]
pub struct MultiPartEntry {
    pub bank_select_msb: u8,
    pub bank_select_lsb: u8,
    pub program_number: u8,
    pub rcv_channel: u8,
    pub rcv_pitch_bend: u8,
    pub rcv_ch_after_touch: u8,
    pub rcv_program_change: u8,
    pub rcv_control_change: u8,
    pub rcv_poly_after_touch: u8,
    pub rcv_note_message: u8,
    pub rcv_rpn: u8,
    pub rcv_nrpn: u8,
    pub rcv_modulation: u8,
    pub rcv_volume: u8,
    pub rcv_pan: u8,
    pub rcv_expression: u8,
    pub rcv_hold_1: u8,
    pub rcv_portamento: u8,
    pub rcv_sostenuto: u8,
    pub rcv_soft_pedal: u8,

    pub mono_poly_mode: u8,
    pub same_note_number_key_on_assign: u8,
    pub part_mode: u8,
    pub note_shift: u8,
    pub detune: u16,
    pub volume: u8,
    pub velocity_sense_depth: u8,
    pub velocity_sense_offset: u8,
    pub pan: u8,
    pub note_limit_low: u8,
    pub note_limit_high: u8,
    pub ac_1_controller_number: u8,
    pub ac_2_controller_number: u8,
    pub dry_level: u8,
    pub chorus_send: u8,
    pub reverb_send: u8,
    pub variation_send: u8,

    pub vibrato_rate: u8,
    pub vibrato_depth: u8,
    pub filter_cutoff_frequency: u8,
    pub filter_resonance: u8,
    pub eg_attack_time: u8,
    pub eg_decay_time: u8,
    pub eg_release_time: u8,
    pub vibrato_delay: u8,

    pub scale_tuning_c: u8,
    pub scale_tuning_c_sharp: u8,
    pub scale_tuning_d: u8,
    pub scale_tuning_d_sharp: u8,
    pub scale_tuning_e: u8,
    pub scale_tuning_f: u8,
    pub scale_tuning_f_sharp: u8,
    pub scale_tuning_g: u8,
    pub scale_tuning_g_sharp: u8,
    pub scale_tuning_a: u8,
    pub scale_tuning_a_sharp: u8,
    pub scale_tuning_b: u8,

    pub mw_pitch_control: u8,
    pub mw_filter_control: u8,
    pub mw_amplitude_control: u8,
    pub mw_lfo_pmod_depth: u8,
    pub mw_lfo_fmod_depth: u8,

    pub bend_pitch_control: u8,
    pub bend_filter_control: u8,
    pub bend_amplitude_control: u8,
    pub bend_lfo_pmod_depth: u8,
    pub bend_lfo_fmod_depth: u8,

    pub cat_pitch_control: u8,
    pub cat_filter_control: u8,
    pub cat_amplitude_control: u8,
    pub cat_lfo_pmod_depth: u8,
    pub cat_lfo_fmod_depth: u8,

    pub pat_pitch_control: u8,
    pub pat_filter_control: u8,
    pub pat_amplitude_control: u8,
    pub pat_lfo_pmod_depth: u8,
    pub pat_lfo_fmod_depth: u8,

    pub ac_1_pitch_control: u8,
    pub ac_1_filter_control: u8,
    pub ac_1_amplitude_control: u8,
    pub ac_1_lfo_pmod_depth: u8,
    pub ac_1_lfo_fmod_depth: u8,

    pub ac_2_pitch_control: u8,
    pub ac_2_filter_control: u8,
    pub ac_2_amplitude_control: u8,
    pub ac_2_lfo_pmod_depth: u8,
    pub ac_2_lfo_fmod_depth: u8,

    pub portamento_switch: u8,
    pub portamento_time: u8,
}

impl MultiPartEntry {
    pub fn from_memory(memory: &[u8], entry_address: usize) -> MultiPartEntry {
        let at = |offset: usize| memory[entry_address + offset];
        MultiPartEntry {
            bank_select_msb: at(0x01),
            bank_select_lsb: at(0x02),
            program_number: at(0x03),
            rcv_channel: at(0x04),
            rcv_pitch_bend: at(0x05),
            rcv_ch_after_touch: at(0x06),
            rcv_program_change: at(0x07),
            rcv_control_change: at(0x08),
            rcv_poly_after_touch: at(0x09),
            rcv_note_message: at(0x0A),
            rcv_rpn: at(0x0B),
            rcv_nrpn: at(0x0C),
            rcv_modulation: at(0x0D),
            rcv_volume: at(0x0E),
            rcv_pan: at(0x0F),
            rcv_expression: at(0x10),
            rcv_hold_1: at(0x11),
            rcv_portamento: at(0x12),
            rcv_sostenuto: at(0x13),
            rcv_soft_pedal: at(0x14),
            mono_poly_mode: at(0x15),
            same_note_number_key_on_assign: at(0x16),
            part_mode: at(0x17),
            note_shift: at(0x18),
            detune: (((at(0x19) & 0x0F) as u16) << 4) | ((at(0x1A) & 0x0F) as u16),
            volume: at(0x1B),
            velocity_sense_depth: at(0x1C),
            velocity_sense_offset: at(0x1D),
            pan: at(0x1E),
            note_limit_low: at(0x1F),
            note_limit_high: at(0x20),
            ac_1_controller_number: at(0x21),
            ac_2_controller_number: at(0x22),
            dry_level: at(0x23),
            chorus_send: at(0x24),
            reverb_send: at(0x25),
            variation_send: at(0x26),
            vibrato_rate: at(0x27),
            vibrato_depth: at(0x28),
            filter_cutoff_frequency: at(0x29),
            filter_resonance: at(0x2A),
            eg_attack_time: at(0x2B),
            eg_decay_time: at(0x2C),
            eg_release_time: at(0x2D),
            vibrato_delay: at(0x2E),
            scale_tuning_c: at(0x2F),
            scale_tuning_c_sharp: at(0x30),
            scale_tuning_d: at(0x31),
            scale_tuning_d_sharp: at(0x32),
            scale_tuning_e: at(0x33),
            scale_tuning_f: at(0x34),
            scale_tuning_f_sharp: at(0x35),
            scale_tuning_g: at(0x36),
            scale_tuning_g_sharp: at(0x37),
            scale_tuning_a: at(0x38),
            scale_tuning_a_sharp: at(0x39),
            scale_tuning_b: at(0x3A),
            mw_pitch_control: at(0x3B),
            mw_filter_control: at(0x3C),
            mw_amplitude_control: at(0x3D),
            mw_lfo_pmod_depth: at(0x3E),
            mw_lfo_fmod_depth: at(0x3F),
            bend_pitch_control: at(0x41),
            bend_filter_control: at(0x42),
            bend_amplitude_control: at(0x43),
            bend_lfo_pmod_depth: at(0x44),
            bend_lfo_fmod_depth: at(0x45),
            cat_pitch_control: at(0x47),
            cat_filter_control: at(0x48),
            cat_amplitude_control: at(0x49),
            cat_lfo_pmod_depth: at(0x4A),
            cat_lfo_fmod_depth: at(0x4B),
            pat_pitch_control: at(0x4D),
            pat_filter_control: at(0x4E),
            pat_amplitude_control: at(0x4F),
            pat_lfo_pmod_depth: at(0x50),
            pat_lfo_fmod_depth: at(0x51),
            ac_1_pitch_control: at(0x53),
            ac_1_filter_control: at(0x54),
            ac_1_amplitude_control: at(0x55),
            ac_1_lfo_pmod_depth: at(0x56),
            ac_1_lfo_fmod_depth: at(0x57),
            ac_2_pitch_control: at(0x59),
            ac_2_filter_control: at(0x5A),
            ac_2_amplitude_control: at(0x5B),
            ac_2_lfo_pmod_depth: at(0x5C),
            ac_2_lfo_fmod_depth: at(0x5D),
            portamento_switch: at(0x5F),
            portamento_time: at(0x60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmAction {
    ProgramChange,
    ControlChange(u8),
    BendPitchRpn,
    PortamentoSwitch,
}

/// Registers with a General MIDI equivalent. Everything else changes
/// the tone generator's state without producing controller traffic.
static GM_PROJECTION: phf::OrderedMap<&'static str, GmAction> = phf_ordered_map! {
    "program_number" => GmAction::ProgramChange,
    "volume" => GmAction::ControlChange(0x07),
    "pan" => GmAction::ControlChange(0x0A),
    "chorus_send" => GmAction::ControlChange(0x5D),
    "reverb_send" => GmAction::ControlChange(0x5B),
    "variation_send" => GmAction::ControlChange(0x46),
    "vibrato_rate" => GmAction::ControlChange(0x4C),
    "vibrato_depth" => GmAction::ControlChange(0x4D),
    "vibrato_delay" => GmAction::ControlChange(0x4E),
    "bend_pitch_control" => GmAction::BendPitchRpn,
    "portamento_switch" => GmAction::PortamentoSwitch,
    "portamento_time" => GmAction::ControlChange(0x05),
};

fn action_messages(action: GmAction, value: u8, channel: u8) -> Vec<Vec<u8>> {
    match action {
        GmAction::ProgramChange => vec![vec![0xC0 | channel, value & 0x7F]],
        GmAction::ControlChange(controller) => {
            vec![vec![0xB0 | channel, controller, value & 0x7F]]
        }
        GmAction::BendPitchRpn => vec![
            vec![0xB0 | channel, 0x65, 0x00],
            vec![0xB0 | channel, 0x64, 0x00],
            vec![0xB0 | channel, 0x06, value.wrapping_sub(0x40) & 0x7F],
        ],
        GmAction::PortamentoSwitch => {
            let switch = if value == 0x00 { 0x00 } else { 0x7F };
            vec![vec![0xB0 | channel, 0x41, switch]]
        }
    }
}

/// General MIDI messages for one part. With `before` the output covers
/// only the fields that changed; without it, the full mapped state is
/// emitted (track setup).
pub fn general_midi_deltas(
    before: Option<&MultiPartEntry>,
    after: &MultiPartEntry,
    channel: u8,
) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    for field_index in 0..Struct::field_len(after) {
        let Some(name) = after.name_at(field_index) else {
            continue;
        };
        let Some(field) = after.field_at(field_index) else {
            continue;
        };
        let Some(&value) = field.as_any().downcast_ref::<u8>() else {
            continue;
        };
        if let Some(before) = before {
            let unchanged = before
                .field_at(field_index)
                .and_then(|field| field.as_any().downcast_ref::<u8>())
                .is_some_and(|&previous| previous == value);
            if unchanged {
                continue;
            }
        }
        if let Some(&action) = GM_PROJECTION.get(name) {
            messages.extend(action_messages(action, value, channel));
        }
    }
    messages
}
