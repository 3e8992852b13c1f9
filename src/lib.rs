//! Codec for the DAM OKD karaoke container: scrambled envelope, typed
//! chunk stream, M-Track markers, P-Track performance data in the
//! platform's MIDI dialect, tone-generator SysEx emulation, and
//! translation to and from standard MIDI files.

pub mod adpcm;
pub mod compose;
pub mod dtype;
pub mod m_track;
pub mod midi;
pub mod mmt_tg;
pub mod okd;
pub mod okd_midi;
pub mod p_track;
pub mod scramble;
pub mod track_info;
