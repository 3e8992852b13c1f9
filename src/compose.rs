use midly::num::{u24, u28, u4, u7};
use midly::{MetaMessage, MidiMessage, Smf, TrackEvent, TrackEventKind};

use crate::dtype::{OkdError, OkdMidiMessage};
use crate::m_track::MTrackChunk;
use crate::midi;
use crate::okd::Chunk;
use crate::p_track::PTrackChunk;
use crate::track_info::{
    ExtendedPTrackInfoChannelInfoEntry, ExtendedPTrackInfoChunk, ExtendedPTrackInfoEntry,
    P3TrackInfoChunk, PTrackInfoChannelInfoEntry, PTrackInfoChunk, PTrackInfoEntry,
};

/// Track status stamped onto composed tracks: quartered durations.
const COMPOSED_TRACK_STATUS: u8 = 0x40;

/// Port of the synthesized marker track in karaoke SMF layouts.
const M_TRACK_PORT: u8 = 15;

/// Scoring-reference files carry the melody on port 2, channel 14.
const SCORING_PORT: u8 = 2;
const SCORING_CHANNEL: u8 = 14;
const MELODY_PORT: u8 = 1;
const MELODY_CHANNEL: u8 = 8;

/// Chunks of a main performance file and its scoring-reference
/// companion, composed from one karaoke SMF.
pub struct ComposedOkd {
    pub main: Vec<Chunk>,
    pub scoring_reference: Vec<Chunk>,
}

pub fn compose_karaoke_okd(smf: &Smf) -> Result<ComposedOkd, OkdError> {
    let m_track = MTrackChunk::from_midi(smf)?;

    let mut p_tracks = PTrackChunk::from_midi(smf)?;
    p_tracks.retain(|chunk| chunk.chunk_number != M_TRACK_PORT);
    if p_tracks.is_empty() {
        return Err(OkdError::UnsupportedSmf("no performance tracks"));
    }
    let track_info = track_info_from_p_tracks(&p_tracks);

    let mut main = vec![track_info, Chunk::MTrack(m_track)];
    main.extend(p_tracks.into_iter().map(Chunk::PTrack));

    let scoring_smf = scoring_reference_smf(smf)?;
    let p3_tracks = PTrackChunk::from_midi(&scoring_smf)?;
    let p3_track = p3_tracks
        .into_iter()
        .next()
        .ok_or(OkdError::UnsupportedSmf("melody track has no notes"))?;
    let p3_info = p3_track_info_from_p3_track(&p3_track);
    let scoring_reference = vec![Chunk::P3TrackInfo(p3_info), Chunk::PTrack(p3_track)];

    Ok(ComposedOkd {
        main,
        scoring_reference,
    })
}

fn exists_channel_message(messages: &[OkdMidiMessage], channel: u8) -> bool {
    messages.iter().any(|message| {
        let status_byte = message.status_byte();
        status_byte & 0xF0 != 0xF0 && status_byte & 0x0F == channel
    })
}

/// Channel attribute convention of composed outputs: `127` flags the
/// drum channel of chunk 1, `255` any channel with traffic, `0` silence.
fn composed_channel_attribute(chunk_number: u8, channel: u8, exists: bool) -> u8 {
    if !exists {
        return 0;
    }
    if chunk_number == 1 && channel == 9 {
        127
    } else {
        255
    }
}

/// Short form for up to two tracks, extended form beyond that.
pub fn track_info_from_p_tracks(p_tracks: &[PTrackChunk]) -> Chunk {
    if p_tracks.len() <= 2 {
        let mut entries = Vec::with_capacity(p_tracks.len());
        for p_track in p_tracks {
            let ports = 0x0001_u16 << p_track.chunk_number;
            let mut channel_info = Vec::with_capacity(16);
            for channel in 0..16_u8 {
                let exists = exists_channel_message(&p_track.messages, channel);
                channel_info.push(PTrackInfoChannelInfoEntry {
                    attribute: composed_channel_attribute(p_track.chunk_number, channel, exists),
                    ports: ports as u8,
                    control_change_ax: 0x00,
                    control_change_cx: 0x00,
                });
            }
            entries.push(PTrackInfoEntry {
                track_number: p_track.chunk_number,
                track_status: COMPOSED_TRACK_STATUS,
                use_channel_group_flag: 0x0000,
                single_channel_groups: [0; 16],
                channel_groups: [0; 16],
                channel_info,
                system_ex_ports: ports,
            });
        }
        Chunk::PTrackInfo(PTrackInfoChunk { entries })
    } else {
        let mut entries = Vec::with_capacity(p_tracks.len());
        for p_track in p_tracks {
            let ports = 0x0001_u16 << p_track.chunk_number;
            let mut channel_info = Vec::with_capacity(16);
            for channel in 0..16_u8 {
                let exists = exists_channel_message(&p_track.messages, channel);
                channel_info.push(ExtendedPTrackInfoChannelInfoEntry {
                    attribute: composed_channel_attribute(p_track.chunk_number, channel, exists)
                        as u16,
                    ports,
                    reserved: 0x0000,
                    control_change_ax: 0x00,
                    control_change_cx: 0x00,
                });
            }
            entries.push(ExtendedPTrackInfoEntry {
                track_number: p_track.chunk_number,
                track_status: COMPOSED_TRACK_STATUS,
                reserved_1: 0x0000,
                single_channel_groups: [0; 16],
                channel_groups: [0; 16],
                channel_info,
                system_ex_ports: ports,
                reserved_2: 0x0000,
            });
        }
        Chunk::ExtendedPTrackInfo(ExtendedPTrackInfoChunk {
            reserved: [0; 8],
            tg_mode: 0x0000,
            entries,
        })
    }
}

pub fn p3_track_info_from_p3_track(p3_track: &PTrackChunk) -> P3TrackInfoChunk {
    let ports = 0x0001_u16 << SCORING_PORT;
    let mut channel_info = Vec::with_capacity(16);
    for channel in 0..16_u8 {
        let exists = exists_channel_message(&p3_track.messages, channel);
        channel_info.push(PTrackInfoChannelInfoEntry {
            attribute: if exists { 255 } else { 0 },
            ports: ports as u8,
            control_change_ax: 0x00,
            control_change_cx: 0x00,
        });
    }
    P3TrackInfoChunk {
        track_number: SCORING_PORT,
        track_status: COMPOSED_TRACK_STATUS,
        use_channel_group_flag: 0x0000,
        single_channel_groups: [0; 16],
        channel_groups: [0; 16],
        channel_info,
        system_ex_ports: ports,
    }
}

/// Extract the guide melody and relocate it onto the scoring port and
/// channel. Deltas of skipped events are folded into their successors.
fn scoring_reference_smf<'a>(smf: &Smf<'a>) -> Result<Smf<'a>, OkdError> {
    let melody_index = midi::get_port_channel_track(smf, MELODY_PORT, MELODY_CHANNEL)
        .ok_or(OkdError::UnsupportedSmf("melody track not found"))?;
    let tempo = midi::get_first_tempo(smf);

    let mut track: Vec<TrackEvent> = vec![
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::MidiPort(u7::from(SCORING_PORT))),
        },
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(tempo))),
        },
    ];

    let mut pending_delta: u32 = 0;
    for event in &smf.tracks[melody_index] {
        pending_delta += event.delta.as_int();
        let TrackEventKind::Midi { channel, message } = event.kind else {
            continue;
        };
        if channel.as_int() != MELODY_CHANNEL {
            continue;
        }
        let relocated = match message {
            MidiMessage::NoteOn { .. } | MidiMessage::NoteOff { .. } => message,
            _ => continue,
        };
        track.push(TrackEvent {
            delta: u28::from(pending_delta),
            kind: TrackEventKind::Midi {
                channel: u4::from(SCORING_CHANNEL),
                message: relocated,
            },
        });
        pending_delta = 0;
    }
    track.push(TrackEvent {
        delta: u28::from(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    Ok(Smf {
        header: smf.header,
        tracks: vec![track],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::u15;
    use midly::{Format, Header, Timing};

    fn karaoke_smf() -> Smf<'static> {
        let meta_track = vec![
            TrackEvent {
                delta: u28::from(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(480000))),
            },
            TrackEvent {
                delta: u28::from(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ];
        let mut band_track = vec![TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::MidiPort(u7::from(0))),
        }];
        for delta in [0_u32, 480] {
            band_track.push(TrackEvent {
                delta: u28::from(delta),
                kind: TrackEventKind::Midi {
                    channel: u4::from(0),
                    message: MidiMessage::NoteOn {
                        key: u7::from(0x40),
                        vel: u7::from(0x50),
                    },
                },
            });
            band_track.push(TrackEvent {
                delta: u28::from(240),
                kind: TrackEventKind::Midi {
                    channel: u4::from(0),
                    message: MidiMessage::NoteOff {
                        key: u7::from(0x40),
                        vel: u7::from(0x40),
                    },
                },
            });
        }
        band_track.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        let mut melody_track = vec![TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::MidiPort(u7::from(MELODY_PORT))),
        }];
        melody_track.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Midi {
                channel: u4::from(MELODY_CHANNEL),
                message: MidiMessage::NoteOn {
                    key: u7::from(0x3C),
                    vel: u7::from(0x60),
                },
            },
        });
        melody_track.push(TrackEvent {
            delta: u28::from(960),
            kind: TrackEventKind::Midi {
                channel: u4::from(MELODY_CHANNEL),
                message: MidiMessage::NoteOff {
                    key: u7::from(0x3C),
                    vel: u7::from(0x40),
                },
            },
        });
        melody_track.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        Smf {
            header: Header {
                format: Format::Parallel,
                timing: Timing::Metrical(u15::from(480)),
            },
            tracks: vec![meta_track, band_track, melody_track],
        }
    }

    #[test]
    fn composes_main_and_scoring_chunk_sets() {
        let smf = karaoke_smf();
        let composed = compose_karaoke_okd(&smf).unwrap();

        assert!(matches!(composed.main[0], Chunk::PTrackInfo(_)));
        assert!(matches!(composed.main[1], Chunk::MTrack(_)));
        let p_track_count = composed
            .main
            .iter()
            .filter(|chunk| matches!(chunk, Chunk::PTrack(_)))
            .count();
        assert_eq!(p_track_count, 2);

        assert_eq!(composed.scoring_reference.len(), 2);
        let Chunk::P3TrackInfo(p3_info) = &composed.scoring_reference[0] else {
            panic!("expected P3 track info");
        };
        assert_eq!(p3_info.track_number, SCORING_PORT);
        let Chunk::PTrack(p3_track) = &composed.scoring_reference[1] else {
            panic!("expected the relocated melody track");
        };
        assert_eq!(p3_track.chunk_number, SCORING_PORT);
        assert!(exists_channel_message(&p3_track.messages, SCORING_CHANNEL));
    }

    #[test]
    fn derived_info_reflects_channel_traffic() {
        let p_track = PTrackChunk {
            chunk_number: 1,
            messages: vec![
                OkdMidiMessage::new(0, vec![0x99, 0x24, 0x40], 120),
                OkdMidiMessage::new(0, vec![0xB0, 0x07, 0x64], 0),
            ],
        };
        let Chunk::PTrackInfo(info) = track_info_from_p_tracks(std::slice::from_ref(&p_track))
        else {
            panic!("short form expected for a single track");
        };
        let entry = &info.entries[0];
        assert_eq!(entry.channel_info[9].attribute, 127);
        assert_eq!(entry.channel_info[0].attribute, 255);
        assert_eq!(entry.channel_info[5].attribute, 0);
        assert_eq!(entry.system_ex_ports, 0x0002);
    }

    #[test]
    fn three_tracks_use_the_extended_form() {
        let p_tracks: Vec<PTrackChunk> = (0..3)
            .map(|chunk_number| PTrackChunk {
                chunk_number,
                messages: vec![OkdMidiMessage::new(0, vec![0x90, 0x3C, 0x40], 1)],
            })
            .collect();
        assert!(matches!(
            track_info_from_p_tracks(&p_tracks),
            Chunk::ExtendedPTrackInfo(_)
        ));
    }
}
