use std::{
    fs::{File, OpenOptions},
    io::Seek,
    path::{Path, PathBuf},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn open_file_overwrite_rw<P: AsRef<Path>>(path: P) -> Result<File, Box<dyn std::error::Error>> {
    let mut file = OpenOptions::new()
        .append(false)
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    Ok(file)
}

fn file_has_extension<P: AsRef<Path>>(path: P, wanted: &str) -> bool {
    let Ok(metadata) = std::fs::metadata(&path) else {
        return false;
    };
    metadata.is_file()
        && path
            .as_ref()
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case(wanted))
}

/// Expand an input glob into (input file, per-input output directory)
/// pairs under the chosen output folder. Each container gets its own
/// dump directory named after the file stem.
pub fn get_input_output_dirs(
    input_glob: &str,
    source_file_format: &str,
    output_folder: &Path,
) -> Vec<(PathBuf, PathBuf)> {
    glob::glob(input_glob)
        .expect("Failed to read glob pattern")
        .filter_map(|entry| match entry {
            Ok(path) => {
                if !file_has_extension(&path, source_file_format) {
                    println!("Skipping {}!", path.display());
                    return None;
                }
                let stem = path.file_stem()?.to_owned();
                Some((path, output_folder.join(stem)))
            }
            Err(e) => {
                println!("{:?}", e);
                None
            }
        })
        .collect()
}

pub fn get_final_output_folder(
    output_folder: &Option<PathBuf>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match output_folder {
        Some(custom_output_folder) => {
            if !std::fs::metadata(custom_output_folder)?.is_dir() {
                return Err("Output path must be a folder!".into());
            }
            Ok(custom_output_folder.clone())
        }
        None => Ok(std::env::current_dir()?),
    }
}
