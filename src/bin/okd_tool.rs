/// Example: okd_tool dump "./karaoke/*.okd" -o ./unpack
/// Example: okd_tool pack ./out.okd ./unpack/p_track_info.json ./unpack/p_track.mid
/// Example: okd_tool compose ./karaoke.mid ./main.okd ./scoring.okd

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::{command, Parser, Subcommand};
use colored::Colorize;
use serde_json::json;

use okd::compose::compose_karaoke_okd;
use okd::midi::open_midi;
use okd::okd::{Chunk, OkdFile};
use okd::p_track::PTrackChunk;
use okd::track_info::{ExtendedPTrackInfoChunk, P3TrackInfoChunk, PTrackInfoChunk};

#[path = "../binutils.rs"]
mod binutils;
use binutils::{get_final_output_folder, get_input_output_dirs, open_file_overwrite_rw, VERSION};

#[derive(Parser)]
#[command(author, version = VERSION, about = "Tools for working with DAM OKD karaoke files", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Descramble OKD files and extract chunks, JSON dumps, ADPCM and a
    /// General MIDI rendition
    Dump {
        /// Sets the path of the OKD files to be dumped
        #[arg(value_name = "INPUT")]
        input_glob: String,

        /// Sets the folder to output the dumped files
        #[arg(short = 'o', long, value_name = "OUTPUT")]
        output_folder: Option<PathBuf>,
    },
    /// Pack track info JSON and SMF files into an OKD file
    Pack {
        /// Sets the path of the output OKD file
        #[arg(value_name = "OUTPUT")]
        output_path: PathBuf,

        /// Sets the paths of the input files (.json track info, .mid tracks)
        #[arg(value_name = "INPUT")]
        input_paths: Vec<PathBuf>,
    },
    /// Compose a karaoke SMF into a main OKD and a scoring reference OKD
    Compose {
        /// Sets the path of the karaoke SMF
        #[arg(value_name = "KARAOKE")]
        karaoke_path: PathBuf,

        /// Sets the path of the output main file
        #[arg(value_name = "MAIN")]
        main_output_path: PathBuf,

        /// Sets the path of the output scoring reference file
        #[arg(value_name = "SCORING")]
        scoring_output_path: PathBuf,
    },
}

fn dump_one(
    input_file_path: &PathBuf,
    output_folder: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(output_folder)?;

    let mut input_file = File::open(input_file_path)?;
    let (header, body) = OkdFile::descramble(&mut input_file)?;

    serde_json::to_writer_pretty(
        open_file_overwrite_rw(output_folder.join("header.json"))?,
        &header,
    )?;
    open_file_overwrite_rw(output_folder.join("chunks.bin"))?.write_all(&body)?;

    let mut chunks = Vec::new();
    for (position, size) in OkdFile::index_chunks(&body) {
        let chunk_buffer = &body[position..position + size];
        let generic = OkdFile::parse_generic_chunk(chunk_buffer)?;
        let chunk_file_name = format!("chunk_0x{}.bin", hex_string(&generic.chunk_id));
        open_file_overwrite_rw(output_folder.join(chunk_file_name))?.write_all(&generic.data)?;

        let chunk = OkdFile::parse_chunk(chunk_buffer)?;
        match &chunk {
            Chunk::PTrackInfo(info) => {
                serde_json::to_writer_pretty(
                    open_file_overwrite_rw(output_folder.join("p_track_info.json"))?,
                    info,
                )?;
            }
            Chunk::ExtendedPTrackInfo(info) => {
                serde_json::to_writer_pretty(
                    open_file_overwrite_rw(output_folder.join("extended_p_track_info.json"))?,
                    info,
                )?;
            }
            Chunk::P3TrackInfo(info) => {
                serde_json::to_writer_pretty(
                    open_file_overwrite_rw(output_folder.join("p3_track_info.json"))?,
                    info,
                )?;
            }
            Chunk::MTrack(m_track) => {
                let file_name = format!("m_track_{}.json", m_track.chunk_number);
                serde_json::to_writer_pretty(
                    open_file_overwrite_rw(output_folder.join(file_name))?,
                    &json!({
                        "messages": m_track.messages,
                        "interpretation": m_track.interpret(),
                    }),
                )?;
            }
            Chunk::PTrack(p_track) => {
                let file_name = format!("p_track_{}.json", p_track.chunk_number);
                serde_json::to_writer_pretty(
                    open_file_overwrite_rw(output_folder.join(file_name))?,
                    &p_track.messages,
                )?;
            }
            Chunk::Adpcm(adpcm) => {
                for (index, blob) in adpcm.adpcms.iter().enumerate() {
                    let file_name = format!("adpcm_{}.bin", index);
                    open_file_overwrite_rw(output_folder.join(file_name))?.write_all(blob)?;
                }
            }
            Chunk::Generic(_) => {}
        }
        chunks.push(chunk);
    }

    let smf_bytes = OkdFile::to_midi(&chunks)?;
    open_file_overwrite_rw(output_folder.join("p_track.mid"))?.write_all(&smf_bytes)?;

    Ok(())
}

fn load_pack_input(path: &PathBuf) -> Result<Vec<Chunk>, Box<dyn std::error::Error>> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase());
    match extension.as_deref() {
        Some("json") => {
            let value: serde_json::Value = serde_json::from_reader(File::open(path)?)?;
            if value.get("track_number").is_some() {
                let info: P3TrackInfoChunk = serde_json::from_value(value)?;
                println!("{}", "P3-Track Information loaded.".green());
                Ok(vec![Chunk::P3TrackInfo(info)])
            } else if value.get("tg_mode").is_some() {
                let info: ExtendedPTrackInfoChunk = serde_json::from_value(value)?;
                println!("{}", "Extended P-Track Information loaded.".green());
                Ok(vec![Chunk::ExtendedPTrackInfo(info)])
            } else {
                let info: PTrackInfoChunk = serde_json::from_value(value)?;
                println!("{}", "P-Track Information loaded.".green());
                Ok(vec![Chunk::PTrackInfo(info)])
            }
        }
        Some("mid") => {
            let smf_source = std::fs::read(path)?;
            let smf = open_midi(&smf_source)?;
            let chunks = PTrackChunk::from_midi(&smf)?;
            println!("{}", "P-Track loaded.".green());
            Ok(chunks.into_iter().map(Chunk::PTrack).collect())
        }
        _ => Err(format!("Unknown file type detected. path={}", path.display()).into()),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<String>>()
        .join("")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Dump {
            input_glob,
            output_folder,
        } => {
            let output_folder = get_final_output_folder(output_folder)?;
            let input_file_paths = get_input_output_dirs(input_glob, "okd", &output_folder);

            for (input_file_path, output_file_path) in input_file_paths {
                print!("Dumping {}... ", input_file_path.display());
                dump_one(&input_file_path, &output_file_path)?;
                println!("done!");
            }
            println!("\nAll files successfully processed.");
        }
        Commands::Pack {
            output_path,
            input_paths,
        } => {
            let mut chunks: Vec<Chunk> = Vec::new();
            for input_path in input_paths {
                chunks.extend(load_pack_input(input_path)?);
            }
            let mut output_file = open_file_overwrite_rw(output_path)?;
            OkdFile::scramble(&mut output_file, &chunks)?;
            println!("Packed {} chunks into {}.", chunks.len(), output_path.display());
        }
        Commands::Compose {
            karaoke_path,
            main_output_path,
            scoring_output_path,
        } => {
            let smf_source = std::fs::read(karaoke_path)?;
            let smf = open_midi(&smf_source)?;
            let composed = compose_karaoke_okd(&smf)?;

            let mut main_output_file = open_file_overwrite_rw(main_output_path)?;
            OkdFile::scramble(&mut main_output_file, &composed.main)?;
            let mut scoring_output_file = open_file_overwrite_rw(scoring_output_path)?;
            OkdFile::scramble(&mut scoring_output_file, &composed.scoring_reference)?;

            println!(
                "{}",
                format!(
                    "Composed {} and {}.",
                    main_output_path.display(),
                    scoring_output_path.display()
                )
                .green()
            );
        }
    }

    Ok(())
}
