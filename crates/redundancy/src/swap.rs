//! Pairwise file exchange.
//!
//! The building block under both the partner encode (COPY: the receiver
//! gains a second copy) and the restart redistribute (MOVE: files migrate
//! to their new owner, reusing the sender's storage in place to keep peak
//! cache usage flat).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use group::Communicator;
use meta::FileMeta;

use crate::RedundancyError;

/// Whether the exchange copies or moves files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapMode {
    /// Sender keeps its file; receiver writes a fresh copy.
    Copy,
    /// Sender gives its file up; with traffic in both directions the
    /// sender's file is overwritten in place, truncated, and renamed.
    Move,
}

/// Exchanges file names ahead of the payload: the sender ships the path
/// it is about to send, and the receiver maps its basename into
/// `dir_recv`.
pub fn swap_file_names(
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    rank_recv: Option<usize>,
    dir_recv: &Path,
    comm: &dyn Communicator,
) -> Result<Option<PathBuf>, RedundancyError> {
    let name_bytes = file_send.map(|p| p.to_string_lossy().into_owned().into_bytes());
    let send = match (&name_bytes, rank_send) {
        (Some(bytes), Some(rank)) => Some((rank, bytes.as_slice())),
        _ => None,
    };
    let incoming = comm.sendrecv(send, rank_recv)?;
    Ok(incoming.map(|bytes| {
        let remote = PathBuf::from(String::from_utf8_lossy(&bytes).into_owned());
        let name = remote.file_name().map(ToOwned::to_owned).unwrap_or_default();
        dir_recv.join(name)
    }))
}

fn fill_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Streams one file to `rank_send` while accepting one from `rank_recv`,
/// in lockstep chunks of `buf_size` bytes. Either direction may be
/// absent. Returns `Ok(false)` when the received file failed its size or
/// CRC check (the copy is marked incomplete but the protocol completed).
pub fn swap_files(
    mode: SwapMode,
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    file_recv: Option<&Path>,
    rank_recv: Option<usize>,
    comm: &dyn Communicator,
    buf_size: usize,
    crc_on_copy: bool,
) -> Result<bool, RedundancyError> {
    let have_outgoing = file_send.is_some() && rank_send.is_some();
    let have_incoming = file_recv.is_some() && rank_recv.is_some();
    if !have_outgoing && !have_incoming {
        return Ok(true);
    }

    // drop any stale completion marker before we start writing
    if let Some(path) = file_recv.filter(|_| have_incoming) {
        meta::incomplete(path);
    }

    let mut meta_send: Option<FileMeta> = match file_send.filter(|_| have_outgoing) {
        Some(path) => Some(meta::read(path)?),
        None => None,
    };

    let mut crc_send = crc32fast::Hasher::new();
    let mut crc_recv = crc32fast::Hasher::new();

    match mode {
        SwapMode::Copy => {
            let mut reader = match file_send.filter(|_| have_outgoing) {
                Some(path) => Some(File::open(path).map_err(|source| {
                    fileio::FileIoError::Io {
                        action: "open",
                        path: path.to_path_buf(),
                        source,
                    }
                })?),
                None => None,
            };
            let mut writer = match file_recv.filter(|_| have_incoming) {
                Some(path) => Some(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(path)
                        .map_err(|source| fileio::FileIoError::Io {
                            action: "create",
                            path: path.to_path_buf(),
                            source,
                        })?,
                ),
                None => None,
            };

            let mut sending = reader.is_some();
            let mut receiving = writer.is_some();
            let mut buf = vec![0u8; buf_size.max(1)];
            while sending || receiving {
                let nread = match reader.as_mut().filter(|_| sending) {
                    Some(file) => Some(fill_chunk(file, &mut buf)?),
                    None => None,
                };
                if crc_on_copy {
                    if let Some(n) = nread {
                        crc_send.update(&buf[..n]);
                    }
                }

                let send = nread.map(|n| (rank_send.expect("sender rank"), &buf[..n]));
                let incoming = comm.sendrecv(send, rank_recv.filter(|_| receiving))?;

                if let Some(n) = nread {
                    if n < buf.len() {
                        sending = false;
                    }
                }
                if let Some(data) = incoming {
                    if crc_on_copy {
                        crc_recv.update(&data);
                    }
                    writer
                        .as_mut()
                        .expect("receiver file open")
                        .write_all(&data)?;
                    if data.len() < buf.len() {
                        receiving = false;
                    }
                }
            }
            if let Some(writer) = writer.as_mut() {
                writer.sync_all()?;
            }

            // record the CRC we just computed if the sidecar lacks one
            if crc_on_copy {
                if let (Some(meta), Some(path)) = (meta_send.as_mut(), file_send) {
                    if meta.crc32.is_none() {
                        meta.crc32 = Some(std::mem::take(&mut crc_send).finalize());
                        meta::complete(path, meta)?;
                    }
                }
            }
        }
        SwapMode::Move => {
            let mut file = if have_outgoing {
                let path = file_send.expect("outgoing path");
                Some(
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(path)
                        .map_err(|source| fileio::FileIoError::Io {
                            action: "open",
                            path: path.to_path_buf(),
                            source,
                        })?,
                )
            } else if have_incoming {
                let path = file_recv.expect("incoming path");
                Some(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(path)
                        .map_err(|source| fileio::FileIoError::Io {
                            action: "create",
                            path: path.to_path_buf(),
                            source,
                        })?,
                )
            } else {
                None
            };
            let file = file.as_mut().expect("one side present");

            let size_send = meta_send.as_ref().map_or(0, |m| m.size);
            let mut sending = have_outgoing;
            let mut receiving = have_incoming;
            let mut read_pos = 0u64;
            let mut write_pos = 0u64;
            let mut buf = vec![0u8; buf_size.max(1)];

            while sending || receiving {
                let nread = if sending {
                    let count = ((size_send - read_pos) as usize).min(buf.len());
                    file.seek(SeekFrom::Start(read_pos))?;
                    let n = fill_chunk(file, &mut buf[..count])?;
                    read_pos += n as u64;
                    if crc_on_copy {
                        crc_send.update(&buf[..n]);
                    }
                    Some(n)
                } else {
                    None
                };

                let send = nread.map(|n| (rank_send.expect("sender rank"), &buf[..n]));
                let incoming = comm.sendrecv(send, rank_recv.filter(|_| receiving))?;

                if let Some(n) = nread {
                    if read_pos == size_send && n < buf.len() {
                        sending = false;
                    }
                }
                if let Some(data) = incoming {
                    if crc_on_copy {
                        crc_recv.update(&data);
                    }
                    file.seek(SeekFrom::Start(write_pos))?;
                    file.write_all(&data)?;
                    write_pos += data.len() as u64;
                    if data.len() < buf.len() {
                        receiving = false;
                    }
                }
            }
            file.sync_all()?;

            match (have_outgoing, have_incoming) {
                (true, true) => {
                    // reuse the sender's storage: truncate to what came in
                    // and rename into place
                    let old = file_send.expect("outgoing path");
                    let new = file_recv.expect("incoming path");
                    fileio::truncate(old, write_pos)?;
                    std::fs::rename(old, new).map_err(|source| fileio::FileIoError::Io {
                        action: "rename",
                        path: old.to_path_buf(),
                        source,
                    })?;
                    meta::incomplete(old);
                }
                (true, false) => {
                    let old = file_send.expect("outgoing path");
                    std::fs::remove_file(old).map_err(|source| fileio::FileIoError::Io {
                        action: "unlink",
                        path: old.to_path_buf(),
                        source,
                    })?;
                    meta::incomplete(old);
                }
                _ => {}
            }

            if crc_on_copy {
                if let Some(meta) = meta_send.as_mut() {
                    // file is gone; keep the CRC in the record we ship
                    if meta.crc32.is_none() {
                        meta.crc32 = Some(std::mem::take(&mut crc_send).finalize());
                    }
                }
            }
        }
    }

    // exchange meta records and complete the received file
    let meta_tree = meta_send.as_ref().map(FileMeta::to_tree);
    let send = match (&meta_tree, rank_send) {
        (Some(tree), Some(rank)) if have_outgoing => Some((tree, rank)),
        _ => None,
    };
    let incoming = kvtree::exchange::sendrecv(
        send.map(|(tree, rank)| (tree, rank)),
        rank_recv.filter(|_| have_incoming),
        comm,
    )?;

    let mut good = true;
    if let (Some(tree), Some(path)) = (incoming, file_recv) {
        let mut meta_recv = FileMeta::from_tree(&tree, path)?;

        let written = fileio::file_size(path)?;
        if written < meta_recv.size {
            meta_recv.complete = false;
            good = false;
        }
        if crc_on_copy {
            if let Some(expected) = meta_recv.crc32 {
                if std::mem::take(&mut crc_recv).finalize() != expected {
                    meta_recv.complete = false;
                    good = false;
                }
            }
        }
        meta::complete(path, &meta_recv)?;
    }

    Ok(good)
}
