use crate::comm::Communicator;
use crate::GatherError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Upper bound on the encoded rendezvous path.
pub const MAX_PATH_BYTES: usize = 512;

const LEN_PREFIX: usize = 4;

/// Shared directory every rank writes its partial results into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousDir {
    path: PathBuf,
    negotiated: bool,
}

impl RendezvousDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the coordinator allocated the directory and broadcast it.
    pub fn was_negotiated(&self) -> bool {
        self.negotiated
    }
}

/// Frame a path as `u32` little-endian length followed by its UTF-8 bytes.
pub fn encode_dir(path: &Path) -> Result<Vec<u8>, GatherError> {
    let text = path.to_str().ok_or_else(|| {
        GatherError::Config(format!("rendezvous path is not valid UTF-8: {}", path.display()))
    })?;
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return Err(GatherError::Config("rendezvous path is empty".to_string()));
    }
    if bytes.len() > MAX_PATH_BYTES {
        return Err(GatherError::Config(format!(
            "rendezvous path is {} bytes, limit is {}",
            bytes.len(),
            MAX_PATH_BYTES
        )));
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Frame telling the other ranks the coordinator could not set up a directory.
fn abort_frame() -> Vec<u8> {
    0u32.to_le_bytes().to_vec()
}

/// Inverse of [`encode_dir`]. Bytes after the framed path are ignored.
pub fn decode_dir(frame: &[u8]) -> Result<PathBuf, GatherError> {
    if frame.len() < LEN_PREFIX {
        return Err(GatherError::Comm(format!(
            "rendezvous frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&frame[..LEN_PREFIX]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(GatherError::Comm(
            "coordinator failed to establish a rendezvous directory".to_string(),
        ));
    }
    if len > MAX_PATH_BYTES {
        return Err(GatherError::Comm(format!(
            "rendezvous frame announces {} bytes, limit is {}",
            len, MAX_PATH_BYTES
        )));
    }
    let body = frame.get(LEN_PREFIX..LEN_PREFIX + len).ok_or_else(|| {
        GatherError::Comm(format!(
            "rendezvous frame truncated: expected {} path bytes, got {}",
            len,
            frame.len() - LEN_PREFIX
        ))
    })?;
    let text = std::str::from_utf8(body)
        .map_err(|e| GatherError::Comm(format!("rendezvous path is not UTF-8: {}", e)))?;
    Ok(PathBuf::from(text.trim_end()))
}

fn allocate_temp_dir(temp_root: Option<&Path>) -> Result<PathBuf, GatherError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("detgather_");
    let dir = match temp_root {
        Some(root) => {
            fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir.keep())
}

/// Agree on one rendezvous directory across all ranks.
///
/// With an explicit path every rank uses it verbatim and no broadcast takes
/// place. Otherwise rank 0 allocates a fresh temporary directory (under
/// `temp_root` when given) and broadcasts its path.
pub fn establish(
    comm: &dyn Communicator,
    explicit: Option<&Path>,
    temp_root: Option<&Path>,
) -> Result<RendezvousDir, GatherError> {
    if let Some(path) = explicit {
        fs::create_dir_all(path)?;
        debug!(rank = comm.rank(), dir = %path.display(), "using explicit rendezvous directory");
        return Ok(RendezvousDir {
            path: path.to_path_buf(),
            negotiated: false,
        });
    }

    let path = if comm.is_coordinator() {
        let allocated = allocate_temp_dir(temp_root).and_then(|dir| {
            let frame = encode_dir(&dir);
            if frame.is_err() {
                let _ = fs::remove_dir_all(&dir);
            }
            frame.map(|frame| (dir, frame))
        });
        match allocated {
            Ok((dir, frame)) => {
                comm.broadcast(Some(frame))?;
                info!(dir = %dir.display(), world_size = comm.world_size(), "allocated rendezvous directory");
                dir
            }
            Err(e) => {
                comm.broadcast(Some(abort_frame()))?;
                return Err(e);
            }
        }
    } else {
        let dir = decode_dir(&comm.broadcast(None)?)?;
        fs::create_dir_all(&dir)?;
        debug!(rank = comm.rank(), dir = %dir.display(), "received rendezvous directory");
        dir
    };

    Ok(RendezvousDir {
        path,
        negotiated: true,
    })
}
