//! Partial-result files: one `part_<rank>.bin` per rank inside the
//! rendezvous directory, written once by its rank and read once by rank 0.

use crate::GatherError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PartHeader {
    pub rank: u32,
    pub world_size: u32,
    pub len: u64,
}

pub fn part_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("part_{}.bin", rank))
}

/// Serialize one rank's results and make them durable before returning.
pub fn write_part<R: Serialize>(
    dir: &Path,
    rank: usize,
    world_size: usize,
    results: &[R],
) -> Result<PathBuf, GatherError> {
    let path = part_path(dir, rank);
    let header = PartHeader {
        rank: rank as u32,
        world_size: world_size as u32,
        len: results.len() as u64,
    };

    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);
    let config = bincode::config::standard();
    bincode::encode_into_std_write(header, &mut writer, config)?;
    for result in results {
        bincode::serde::encode_into_std_write(result, &mut writer, config)?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| GatherError::Io(e.into_error()))?;
    file.sync_all()?;

    Ok(path)
}

fn open_part(path: &Path, rank: usize) -> Result<BufReader<File>, GatherError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(GatherError::MissingPart {
            rank,
            path: path.to_path_buf(),
        }),
        Err(e) => Err(GatherError::Io(e)),
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> GatherError {
    GatherError::CorruptPart {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn decode_header<Rd: Read>(reader: &mut Rd, path: &Path) -> Result<PartHeader, GatherError> {
    bincode::decode_from_std_read(reader, bincode::config::standard())
        .map_err(|e| corrupt(path, format!("unreadable header: {}", e)))
}

/// Header of a partial-result file, without loading its items.
pub fn read_header(path: &Path) -> Result<PartHeader, GatherError> {
    let mut reader = BufReader::new(File::open(path)?);
    decode_header(&mut reader, path)
}

/// Load the results rank `rank` wrote for a job of `world_size` ranks.
pub fn read_part<R: DeserializeOwned>(
    dir: &Path,
    rank: usize,
    world_size: usize,
) -> Result<Vec<R>, GatherError> {
    let path = part_path(dir, rank);
    let mut reader = open_part(&path, rank)?;
    let header = decode_header(&mut reader, &path)?;

    if header.rank as usize != rank || header.world_size as usize != world_size {
        return Err(corrupt(
            &path,
            format!(
                "written by rank {} of {}, expected rank {} of {}",
                header.rank, header.world_size, rank, world_size
            ),
        ));
    }

    let config = bincode::config::standard();
    let mut results = Vec::with_capacity((header.len as usize).min(1 << 16));
    for index in 0..header.len {
        let item = bincode::serde::decode_from_std_read(&mut reader, config)
            .map_err(|e| corrupt(&path, format!("item {} of {}: {}", index, header.len, e)))?;
        results.push(item);
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(corrupt(&path, "trailing bytes after last item"));
    }

    Ok(results)
}
