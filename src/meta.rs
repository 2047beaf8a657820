use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fs;
use std::io;
use std::path::Path;

use fault_injection::maybe;

use crate::checkpoint::CheckpointInfo;
use crate::log::write_file_atomically;
use crate::{Error, Lsa, Result};

/// Checkpoint infos by the LSA of their checkpoint, plus the
/// clean-shutdown flag, persisted in a small side file.
///
/// ```text
/// [u64 payload size][payload]
/// payload = [bool clean_shutdown][i32 count]
///           [(i64 pageid, i32 offset, packed checkpoint info) x count]
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Meta {
    checkpoints: BTreeMap<Lsa, CheckpointInfo>,
    clean_shutdown: bool,
}

fn eat<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    if buf.len() < N {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "meta file ends in the middle of a field",
        )));
    }
    let (head, tail) = buf.split_at(N);
    *buf = tail;
    head.try_into().map_err(|_| {
        Error::ReportableBug("split_at returned the wrong length".to_string())
    })
}

impl Meta {
    pub fn is_clean_shutdown(&self) -> bool {
        self.clean_shutdown
    }

    pub fn set_clean_shutdown(&mut self, clean_shutdown: bool) {
        self.clean_shutdown = clean_shutdown;
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// Records `info` for the checkpoint at `lsa`, replacing any
    /// previous one there.
    pub fn add_checkpoint_info(&mut self, lsa: Lsa, info: CheckpointInfo) {
        self.checkpoints.insert(lsa, info);
    }

    pub fn get_checkpoint_info(&self, lsa: Lsa) -> Option<&CheckpointInfo> {
        self.checkpoints.get(&lsa)
    }

    pub fn get_highest_lsa_checkpoint_info(
        &self,
    ) -> Option<(Lsa, &CheckpointInfo)> {
        self.checkpoints.iter().next_back().map(|(lsa, info)| (*lsa, info))
    }

    /// Drops every checkpoint strictly older than `lsa`.
    pub fn remove_checkpoint_info_before_lsa(&mut self, lsa: Lsa) {
        self.checkpoints = self.checkpoints.split_off(&lsa);
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut payload = vec![u8::from(self.clean_shutdown)];
        let count: i32 = self.checkpoints.len().try_into().map_err(|_| {
            Error::Unsupported("too many checkpoints to pack".to_string())
        })?;
        payload.extend_from_slice(&count.to_le_bytes());
        for (lsa, info) in &self.checkpoints {
            payload.extend_from_slice(&lsa.pageid.to_le_bytes());
            payload.extend_from_slice(&lsa.offset.to_le_bytes());
            info.pack(&mut payload)?;
        }

        let mut buf = Vec::with_capacity(payload.len() + 8);
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn unpack(mut buf: &[u8]) -> Result<Meta> {
        let size = u64::from_le_bytes(eat::<8>(&mut buf)?);
        if size != buf.len() as u64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "meta payload claims {} bytes but {} follow",
                    size,
                    buf.len()
                ),
            )));
        }

        let clean_shutdown = eat::<1>(&mut buf)?[0] != 0;
        let count = i32::from_le_bytes(eat::<4>(&mut buf)?);
        let mut checkpoints = BTreeMap::new();
        for _ in 0..count.max(0) {
            let pageid = i64::from_le_bytes(eat::<8>(&mut buf)?);
            let offset = i32::from_le_bytes(eat::<4>(&mut buf)?);
            let info = CheckpointInfo::unpack(&mut buf)?;
            checkpoints.insert(Lsa::new(pageid, offset), info);
        }

        Ok(Meta { checkpoints, clean_shutdown })
    }

    /// Loads the meta file. A missing or empty file is an empty meta.
    pub fn load_from_file(path: &Path) -> Result<Meta> {
        let buf = match maybe!(fs::read(path)) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Meta::default());
            }
            Err(e) => return Err(e.into()),
        };
        if buf.is_empty() {
            return Ok(Meta::default());
        }
        Meta::unpack(&buf)
    }

    pub fn flush_to_file(&self, path: &Path) -> Result<()> {
        let buf = self.pack()?;
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        write_file_atomically(directory, Path::new(&tmp_name), path, &buf)
    }
}
