//! End-to-end container scenarios: scramble round-trips, General MIDI
//! export of decoded containers, and tone-generator SysEx lifting.

use std::io::Cursor;

use okd::adpcm::AdpcmChunk;
use okd::dtype::{AbsoluteTimeMessage, OkdMidiMessage};
use okd::m_track::MTrackChunk;
use okd::okd::header::FileHeader;
use okd::okd::{Chunk, GenericChunk, OkdFile};
use okd::p_track::PTrackChunk;
use okd::scramble;
use okd::track_info::{PTrackInfoChannelInfoEntry, PTrackInfoChunk, PTrackInfoEntry};

fn message(delta_time: u32, data: &[u8], duration: u32) -> OkdMidiMessage {
    OkdMidiMessage::new(delta_time, data.to_vec(), duration)
}

fn track_info_entry(track_status: u8) -> PTrackInfoEntry {
    let mut entry = PTrackInfoEntry {
        track_number: 0,
        track_status,
        channel_info: vec![PTrackInfoChannelInfoEntry::default(); 16],
        system_ex_ports: 0x0001,
        ..Default::default()
    };
    for channel_info in entry.channel_info.iter_mut() {
        channel_info.attribute = 255;
        channel_info.ports = 0x01;
        channel_info.control_change_ax = 0x0B;
        channel_info.control_change_cx = 0x01;
    }
    entry
}

fn container_with(track_status: u8, messages: Vec<OkdMidiMessage>) -> Vec<Chunk> {
    vec![
        Chunk::PTrackInfo(PTrackInfoChunk {
            entries: vec![track_info_entry(track_status)],
        }),
        Chunk::PTrack(PTrackChunk {
            chunk_number: 0,
            messages,
        }),
    ]
}

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

fn decode(container: &[u8]) -> (FileHeader, Vec<Chunk>) {
    let mut reader = Cursor::new(container);
    let (header, body) = OkdFile::descramble(&mut reader).unwrap();
    let chunks = OkdFile::parse_chunks(&body).unwrap();
    (header, chunks)
}

#[test]
fn scrambled_magic_reveals_the_key_index() {
    // The first four container bytes XOR against the plaintext magic to
    // reveal the keystream start, whatever index the writer chose.
    let chunks = container_with(0x48, vec![message(0, &[0x90, 0x3C, 0x40], 240)]);
    let mut container = Cursor::new(Vec::new());
    OkdFile::scramble(&mut container, &chunks).unwrap();
    let container = container.into_inner();

    assert_ne!(&container[0..4], b"YKS1");
    let scrambled_magic = [container[0], container[1], container[2], container[3]];
    scramble::detect_scramble_pattern_index(scrambled_magic, *b"YKS1").unwrap();

    let (header, reread) = decode(&container);
    assert!(matches!(header, FileHeader::Okd(_)));
    assert_eq!(reread, chunks);
}

#[test]
fn every_chunk_kind_roundtrips_through_a_container() {
    let chunks = vec![
        Chunk::PTrackInfo(PTrackInfoChunk {
            entries: vec![track_info_entry(0x48)],
        }),
        Chunk::MTrack(MTrackChunk {
            chunk_number: 0,
            messages: vec![
                message(0, &[0xF1], 0),
                message(480, &[0xF2], 0),
                message(480, &[0xF3, 0x00], 0),
                message(960, &[0xF3, 0x01], 0),
            ],
        }),
        Chunk::PTrack(PTrackChunk {
            chunk_number: 0,
            messages: vec![
                message(0, &[0x90, 0x3C, 0x40], 240),
                message(240, &[0xA0, 0x50], 0),
                message(0, &[0xFD], 0),
                message(0, &[0x91, 0x40, 0x60], 120),
                message(
                    120,
                    &native_parameter_change(0x008103, &[0x20]),
                    0,
                ),
            ],
        }),
        Chunk::Adpcm(AdpcmChunk {
            adpcms: vec![vec![0xA0; 32], vec![0xB1; 7]],
        }),
        Chunk::Generic(GenericChunk {
            chunk_id: *b"YOPT",
            data: vec![1, 2, 3, 4],
        }),
    ];

    let mut container = Cursor::new(Vec::new());
    OkdFile::scramble(&mut container, &chunks).unwrap();
    let (_, reread) = decode(&container.into_inner());
    assert_eq!(reread, chunks);
}

#[test]
fn bare_p_tracks_get_a_derived_track_info() {
    let chunks = vec![Chunk::PTrack(PTrackChunk {
        chunk_number: 0,
        messages: vec![message(0, &[0x90, 0x3C, 0x40], 240)],
    })];
    let mut container = Cursor::new(Vec::new());
    OkdFile::scramble(&mut container, &chunks).unwrap();

    let (_, reread) = decode(&container.into_inner());
    assert_eq!(reread.len(), 2);
    let Chunk::PTrackInfo(info) = &reread[0] else {
        panic!("expected a derived short-form track info");
    };
    assert_eq!(info.entries.len(), 1);
    assert_eq!(info.entries[0].track_number, 0);
    assert_eq!(info.entries[0].channel_info[0].attribute, 255);
    assert_eq!(info.entries[0].channel_info[1].attribute, 0);
    assert_eq!(reread[1], chunks[0]);
}

#[test]
fn minimal_container_exports_one_paired_note() {
    // Lossless durations: the note-off lands at its stored distance.
    let chunks = container_with(0x48, vec![message(0, &[0x90, 0x3C, 0x40], 240)]);
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();

    let note_on: Vec<&AbsoluteTimeMessage> = messages
        .iter()
        .filter(|message| message.data == vec![0x90, 0x3C, 0x40])
        .collect();
    assert_eq!(note_on.len(), 1);
    assert_eq!(note_on[0].time, 0);
    assert_eq!(note_on[0].port, 0);
    assert_eq!(note_on[0].track, 0);

    let note_off: Vec<&AbsoluteTimeMessage> = messages
        .iter()
        .filter(|message| message.data == vec![0x80, 0x3C, 0x40])
        .collect();
    assert_eq!(note_off.len(), 1);
    assert_eq!(note_off[0].time, 240);
}

#[test]
fn quartered_durations_project_times_four() {
    let chunks = container_with(0x40, vec![message(0, &[0x90, 0x3C, 0x40], 240)]);
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();
    let note_off = messages
        .iter()
        .find(|message| message.data == vec![0x80, 0x3C, 0x40])
        .unwrap();
    assert_eq!(note_off.time, 960);
}

#[test]
fn alternate_cc_rewrites_unless_escaped() {
    let chunks = container_with(
        0x48,
        vec![
            message(0, &[0xA0, 0x50], 0),
            message(0, &[0xFE, 0xA0, 0x50], 0),
        ],
    );
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();
    assert!(messages
        .iter()
        .any(|message| message.data == vec![0xB0, 0x0B, 0x50]));
    assert!(messages
        .iter()
        .any(|message| message.data == vec![0xA0, 0x50]));
}

#[test]
fn grouping_arms_exactly_one_event() {
    let mut entry = track_info_entry(0x48);
    entry.channel_groups[0] = 0x0003;
    let chunks = vec![
        Chunk::PTrackInfo(PTrackInfoChunk {
            entries: vec![entry],
        }),
        Chunk::PTrack(PTrackChunk {
            chunk_number: 0,
            messages: vec![
                message(0, &[0xFD], 0),
                message(0, &[0x90, 0x3C, 0x40], 10),
                message(100, &[0x90, 0x3E, 0x40], 10),
            ],
        }),
    ];
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();

    let first_note_ons: Vec<_> = messages
        .iter()
        .filter(|message| message.time == 0 && message.data[1] == 0x3C && message.data[0] & 0xF0 == 0x90)
        .collect();
    assert_eq!(first_note_ons.len(), 2);
    assert_eq!(first_note_ons[0].data[0], 0x90);
    assert_eq!(first_note_ons[1].data[0], 0x91);

    let second_note_ons: Vec<_> = messages
        .iter()
        .filter(|message| message.data[1] == 0x3E && message.data[0] & 0xF0 == 0x90)
        .collect();
    assert_eq!(second_note_ons.len(), 1);
    assert_eq!(second_note_ons[0].data[0], 0x90);
}

#[test]
fn tone_generator_write_becomes_a_program_change() {
    // Address 02 01 03 targets the program register of the entry that
    // the permutation maps to part 0.
    let sysex = native_parameter_change(0x008083, &[0x20]);
    let chunks = container_with(
        0x48,
        vec![
            message(960, &sysex, 0),
            message(0, &[0x90, 0x3C, 0x40], 240),
        ],
    );
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();

    let program_changes: Vec<&AbsoluteTimeMessage> = messages
        .iter()
        .filter(|message| message.data == vec![0xC0, 0x20])
        .collect();
    assert_eq!(program_changes.len(), 1);
    assert_eq!(program_changes[0].time, 960);
    assert_eq!(program_changes[0].track, 0);

    // The setup burst precedes it with the default program.
    assert!(messages
        .iter()
        .any(|message| message.time == 0 && message.data == vec![0xC0, 0x00]));
}

#[test]
fn repeated_tone_generator_writes_emit_one_delta() {
    let sysex = native_parameter_change(0x008083, &[0x20]);
    let chunks = container_with(
        0x48,
        vec![message(100, &sysex, 0), message(100, &sysex, 0)],
    );
    let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();
    let program_changes: Vec<_> = messages
        .iter()
        .filter(|message| message.data == vec![0xC0, 0x20])
        .collect();
    assert_eq!(program_changes.len(), 1);
}

#[test]
fn exported_smf_parses_and_keeps_port_metas() {
    let chunks = container_with(0x48, vec![message(0, &[0x90, 0x3C, 0x40], 240)]);
    let smf_bytes = OkdFile::to_midi(&chunks).unwrap();
    let smf = midly::Smf::parse(&smf_bytes).unwrap();

    assert_eq!(
        smf.header.timing,
        midly::Timing::Metrical(midly::num::u15::from(480))
    );
    let has_port_meta = smf.tracks[0].iter().any(|event| {
        matches!(
            event.kind,
            midly::TrackEventKind::Meta(midly::MetaMessage::MidiPort(_))
        )
    });
    assert!(has_port_meta);
}

#[test]
fn audio_only_container_decodes_with_an_opaque_body() {
    use okd::dtype::ReadWrite;
    use okd::okd::header::{OkaHeader, COMPOSED_VERSION, FIXED_HEADER_SIZE};

    let tail = vec![0x11_u8, 0x22, 0x33, 0x44, 0x55, 0x66];
    let header = OkaHeader {
        length: (FIXED_HEADER_SIZE + tail.len()) as u32,
        version: COMPOSED_VERSION,
        id_karaoke: 42,
        data_offset: FIXED_HEADER_SIZE as u32,
        reserved: 0,
        crc_loader: 0,
    };
    let mut header_writer = Cursor::new(Vec::new());
    header.write_to_file(&mut header_writer).unwrap();
    let mut container = header_writer.into_inner();

    let next_index = scramble::scramble(&mut container, 0x21);
    assert_eq!(next_index, 0x21 + (FIXED_HEADER_SIZE / 2) as u8);
    container.extend_from_slice(&tail);

    let (decoded_header, body) = decode_raw(&container);
    let FileHeader::Oka(decoded) = decoded_header else {
        panic!("expected an audio-only header");
    };
    assert_eq!(decoded, header);
    assert_eq!(body, tail);
}

fn decode_raw(container: &[u8]) -> (FileHeader, Vec<u8>) {
    let mut reader = Cursor::new(container);
    let (header, body) = OkdFile::descramble(&mut reader).unwrap();
    (header, body)
}

#[test]
fn m_track_interpretation_survives_the_container() {
    let m_track = MTrackChunk {
        chunk_number: 0,
        messages: vec![
            message(0, &[0xF6, 0x00], 0),
            message(0, &[0xF1], 0),
            message(480, &[0xF2], 0),
            message(480, &[0xF2], 0),
            message(480, &[0xF2], 0),
            message(480, &[0xF1], 0),
            message(480, &[0xF6, 0x01], 0),
        ],
    };
    let chunks = vec![Chunk::MTrack(m_track)];
    let mut container = Cursor::new(Vec::new());
    OkdFile::scramble(&mut container, &chunks).unwrap();
    let (_, reread) = decode(&container.into_inner());

    let Chunk::MTrack(reread_m_track) = &reread[0] else {
        panic!("expected the marker track");
    };
    let interpretation = reread_m_track.interpret();
    assert_eq!(interpretation.tempos, vec![(0, 125)]);
    assert_eq!(interpretation.time_signatures, vec![(0, 4)]);
    assert_eq!(interpretation.song_section, Some((0, 2400)));
}
