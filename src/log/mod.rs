//! The write-ahead log: an active log file of fixed-size pages and a
//! small header file pointing into it.
//!
//! Records are appended at the append LSA, where an `EndOfLog` record
//! always sits until the next append overwrites it. Record headers
//! never straddle a page; bodies may.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fault_injection::{annotate, fallible, maybe};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointInfo;
use crate::meta::Meta;
use crate::page_buffer::PageBuffer;
use crate::tdes::{Tdes, TranTable};
use crate::volume::sys_io;
use crate::{Config, Error, Lsa, MvccId, Result, TranId, NULL_LSA, NULL_TRANID};

mod page;
mod reader;
mod record;

pub(crate) use page::{LogPage, IO_BLOCK_SIZE, LOG_PAGE_HEADER_SIZE, NULL_OFFSET};
pub(crate) use reader::LogReader;
pub(crate) use record::{align_up, RECORD_HEADER_SIZE};
pub use record::{
    LogRecord, PageOp, RecordBody, RecordHeader, RecordType, SysopEnd,
    SysopEndKind,
};

const ACTIVE_LOG_FILE: &str = "log_active";
const LOG_HEADER_FILE: &str = "log_header";
const LOG_HEADER_TMP_FILE: &str = "log_header.tmp";
const META_FILE: &str = "log_meta";

/// First MVCC id handed out on a fresh log.
const MVCCID_FIRST: MvccId = 3;

/// Persistent description of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    /// Where the next record goes. An `EndOfLog` record lives here.
    pub append_lsa: Lsa,
    /// The last record before `append_lsa`.
    pub prev_lsa: Lsa,
    /// Where Analysis starts.
    pub chkpt_lsa: Lsa,
    pub next_trid: TranId,
    pub mvcc_next_id: MvccId,
    /// Set by a clean shutdown, cleared while the log is in use.
    pub is_shutdown: bool,
    pub log_page_size: u32,
}

impl LogHeader {
    fn fresh(log_page_size: usize) -> LogHeader {
        LogHeader {
            append_lsa: Lsa::new(0, 0),
            prev_lsa: NULL_LSA,
            chkpt_lsa: Lsa::new(0, 0),
            next_trid: 1,
            mvcc_next_id: MVCCID_FIRST,
            is_shutdown: false,
            log_page_size: log_page_size as u32,
        }
    }

    fn to_frame(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut frame = Vec::with_capacity(payload.len() + 12);
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&payload);
        let hash: u32 = crc32fast::hash(&frame) ^ 0xAF;
        frame.extend_from_slice(&hash.to_le_bytes());
        Ok(frame)
    }

    fn from_frame(frame: &[u8]) -> io::Result<LogHeader> {
        let invalid = |what: &str| {
            annotate!(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
        };

        if frame.len() < 12 {
            return Err(invalid("log header frame is too short"));
        }
        let mut len_buf = [0_u8; 8];
        len_buf.copy_from_slice(&frame[..8]);
        let len = usize::try_from(u64::from_le_bytes(len_buf))
            .map_err(|_| invalid("log header frame length overflows"))?;
        if frame.len() != len + 12 {
            return Err(invalid("log header frame length mismatch"));
        }

        let crc_actual = crc32fast::hash(&frame[..len + 8]) ^ 0xAF;
        let mut crc_buf = [0_u8; 4];
        crc_buf.copy_from_slice(&frame[len + 8..]);
        if crc_actual != u32::from_le_bytes(crc_buf) {
            log::warn!("encountered incorrect crc for the log header");
            return Err(invalid("crc mismatch for the log header"));
        }

        bincode::deserialize(&frame[8..len + 8])
            .map_err(|e| invalid(&format!("undecodable log header: {:?}", e)))
    }
}

/// Milliseconds since the epoch, as stored by commit and abort records.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct LogInner {
    header: LogHeader,
    /// The page holding `header.append_lsa`. Pages before it have
    /// already been handed to the file.
    append_page: LogPage,
    /// `append_page` holds bytes the file does not have yet.
    append_dirty: bool,
}

/// The write-ahead log of one storage directory.
pub struct LogManager {
    config: Config,
    file: fs::File,
    inner: Mutex<LogInner>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LogManager")
            .field("path", &self.config.path)
            .field("header", &inner.header)
            .finish()
    }
}

impl LogManager {
    /// Opens the log under `config.path`, creating an empty one when
    /// there is no log header yet.
    pub fn open(config: &Config) -> Result<LogManager> {
        if config.log_page_size < IO_BLOCK_SIZE
            || config.log_page_size % IO_BLOCK_SIZE != 0
        {
            return Err(Error::Unsupported(format!(
                "log_page_size must be a multiple of {}, got {}",
                IO_BLOCK_SIZE, config.log_page_size
            )));
        }

        fallible!(fs::create_dir_all(&config.path));

        let file = fallible!(
            fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(config.path.join(ACTIVE_LOG_FILE))
        );
        fallible!(file.try_lock_exclusive());

        let header_path = config.path.join(LOG_HEADER_FILE);
        let existing = match maybe!(fs::read(&header_path)) {
            Ok(frame) => Some(LogHeader::from_frame(&frame)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let log = match existing {
            Some(mut header) => {
                if header.log_page_size as usize != config.log_page_size {
                    return Err(Error::Unsupported(format!(
                        "log was created with {} byte pages, config asks for {}",
                        header.log_page_size, config.log_page_size
                    )));
                }
                let was_shutdown = header.is_shutdown;
                header.is_shutdown = false;

                let append_page = read_log_page(
                    &file,
                    config.log_page_size,
                    header.append_lsa.pageid,
                )?
                .unwrap_or_else(|| {
                    LogPage::new(config.log_page_size, header.append_lsa.pageid)
                });

                log::debug!(
                    "opened log at {:?}, append lsa {}, checkpoint lsa {}, clean shutdown: {}",
                    config.path,
                    header.append_lsa,
                    header.chkpt_lsa,
                    was_shutdown
                );

                let log = LogManager {
                    config: config.clone(),
                    file,
                    inner: Mutex::new(LogInner {
                        header,
                        append_page,
                        append_dirty: false,
                    }),
                };
                log.flush_header()?;
                log
            }
            None => {
                let header = LogHeader::fresh(config.log_page_size);
                let append_page = LogPage::new(config.log_page_size, 0);
                let log = LogManager {
                    config: config.clone(),
                    file,
                    inner: Mutex::new(LogInner {
                        header,
                        append_page,
                        append_dirty: false,
                    }),
                };
                {
                    let mut inner = log.inner.lock();
                    log.write_end_of_log(&mut inner, Lsa::new(0, 0), NULL_LSA)?;
                }
                log.flush()?;
                log.flush_header()?;
                log::info!("created a new log at {:?}", config.path);
                log
            }
        };

        Ok(log)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn header(&self) -> LogHeader {
        self.inner.lock().header.clone()
    }

    pub fn append_lsa(&self) -> Lsa {
        self.inner.lock().header.append_lsa
    }

    pub fn prev_lsa(&self) -> Lsa {
        self.inner.lock().header.prev_lsa
    }

    pub fn meta_path(&self) -> PathBuf {
        self.config.path.join(META_FILE)
    }

    pub fn page_size(&self) -> usize {
        self.config.log_page_size
    }

    pub(crate) fn area_size(&self) -> usize {
        self.config.log_page_size - LOG_PAGE_HEADER_SIZE
    }

    pub fn set_next_trid(&self, next_trid: TranId) {
        self.inner.lock().header.next_trid = next_trid;
    }

    pub fn set_mvcc_next_id(&self, mvcc_next_id: MvccId) {
        self.inner.lock().header.mvcc_next_id = mvcc_next_id;
    }

    /// Hands out a new transaction id.
    pub fn assign_trid(&self) -> TranId {
        let mut inner = self.inner.lock();
        let trid = inner.header.next_trid;
        inner.header.next_trid = trid.checked_add(1).unwrap_or(1);
        trid
    }

    /// Hands out a new MVCC id.
    pub fn assign_mvccid(&self) -> MvccId {
        let mut inner = self.inner.lock();
        let id = inner.header.mvcc_next_id;
        inner.header.mvcc_next_id += 1;
        id
    }

    /// Appends a record and returns its address. The record is not
    /// durable until the next [`LogManager::flush`].
    pub fn append(
        &self,
        trid: TranId,
        prev_tranlsa: Lsa,
        rtype: RecordType,
        body: &RecordBody,
    ) -> Result<Lsa> {
        let mut inner = self.inner.lock();
        self.append_locked(&mut inner, trid, prev_tranlsa, rtype, body)
    }

    /// Appends a record on behalf of `tdes`, chaining it behind the
    /// transaction's tail.
    pub fn append_for(
        &self,
        tdes: &mut Tdes,
        rtype: RecordType,
        body: &RecordBody,
    ) -> Result<Lsa> {
        let lsa = self.append(tdes.trid, tdes.tail_lsa, rtype, body)?;
        tdes.tail_lsa = lsa;
        if tdes.head_lsa.is_null() {
            tdes.head_lsa = lsa;
        }
        if body.undo_data().is_some() {
            tdes.undo_nxlsa = lsa;
        }
        if rtype.is_mvcc_op() {
            tdes.last_mvcc_lsa = lsa;
        }
        Ok(lsa)
    }

    fn append_locked(
        &self,
        inner: &mut LogInner,
        trid: TranId,
        prev_tranlsa: Lsa,
        rtype: RecordType,
        body: &RecordBody,
    ) -> Result<Lsa> {
        if rtype == RecordType::EndOfLog || rtype == RecordType::Corrupted {
            return Err(Error::Unsupported(format!(
                "{:?} records are maintained by the log itself",
                rtype
            )));
        }
        if !body.fits(rtype) {
            return Err(Error::ReportableBug(format!(
                "record body {:?} does not belong to a {:?} record",
                body, rtype
            )));
        }

        let payload = bincode::serialize(body)?;
        let lsa = inner.header.append_lsa;
        let next = self.next_record_lsa(lsa, payload.len());

        let header = RecordHeader {
            prev_tranlsa,
            back_lsa: inner.header.prev_lsa,
            forw_lsa: next,
            trid,
            rtype,
            body_len: payload.len() as u32,
        };

        self.put_header(inner, lsa, &header)?;
        self.put_bytes(
            inner,
            lsa.pageid,
            lsa.offset as usize + RECORD_HEADER_SIZE,
            &payload,
        )?;
        self.write_end_of_log(inner, next, lsa)?;

        log::trace!("appended {:?} for trid {} at {}", rtype, trid, lsa);
        Ok(lsa)
    }

    /// The address right after a record at `lsa` with a body of
    /// `body_len` bytes, moved to the next page when a record header
    /// would not fit.
    fn next_record_lsa(&self, lsa: Lsa, body_len: usize) -> Lsa {
        let area = self.area_size() as u64;
        let linear = lsa.pageid as u64 * area
            + lsa.offset as u64
            + (RECORD_HEADER_SIZE + body_len) as u64;
        let linear = align_up(linear as usize) as u64;
        let pageid = linear / area;
        let offset = linear % area;
        if offset as usize + RECORD_HEADER_SIZE > area as usize {
            Lsa::new(pageid as i64 + 1, 0)
        } else {
            Lsa::new(pageid as i64, offset as i32)
        }
    }

    /// Makes `pageid` the in-memory append page, handing the previous
    /// one to the file.
    fn switch_append_page(&self, inner: &mut LogInner, pageid: i64) -> Result<()> {
        if inner.append_page.logical_pageid() == pageid {
            return Ok(());
        }
        self.write_page(&mut inner.append_page)?;
        inner.append_page = LogPage::new(self.config.log_page_size, pageid);
        inner.append_dirty = false;
        Ok(())
    }

    fn write_page(&self, page: &mut LogPage) -> Result<()> {
        page.stamp_checksum();
        let offset = page.logical_pageid() as u64 * page.size() as u64;
        sys_io::write_all_at(&self.file, page.as_bytes(), offset)?;
        Ok(())
    }

    fn put_header(
        &self,
        inner: &mut LogInner,
        lsa: Lsa,
        header: &RecordHeader,
    ) -> Result<()> {
        self.switch_append_page(inner, lsa.pageid)?;
        let offset = lsa.offset as usize;
        inner.append_dirty = true;
        let page = &mut inner.append_page;
        header.write_to(&mut page.area_mut()[offset..offset + RECORD_HEADER_SIZE]);
        let first = page.first_record_offset();
        if first == NULL_OFFSET || first > lsa.offset {
            page.set_first_record_offset(lsa.offset);
        }
        Ok(())
    }

    fn put_bytes(
        &self,
        inner: &mut LogInner,
        mut pageid: i64,
        mut offset: usize,
        mut bytes: &[u8],
    ) -> Result<()> {
        let area = self.area_size();
        while !bytes.is_empty() {
            if offset >= area {
                pageid += 1;
                offset = 0;
            }
            self.switch_append_page(inner, pageid)?;
            let n = bytes.len().min(area - offset);
            inner.append_dirty = true;
            inner.append_page.area_mut()[offset..offset + n]
                .copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset += n;
        }
        Ok(())
    }

    fn write_end_of_log(
        &self,
        inner: &mut LogInner,
        lsa: Lsa,
        back_lsa: Lsa,
    ) -> Result<()> {
        self.put_header(inner, lsa, &RecordHeader::end_of_log(back_lsa))?;
        inner.header.append_lsa = lsa;
        inner.header.prev_lsa = back_lsa;
        Ok(())
    }

    /// Writes the append page and makes every appended record durable.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_page(&mut inner.append_page)?;
        inner.append_dirty = false;
        fallible!(self.file.sync_all());
        Ok(())
    }

    /// Persists the log header by writing a fresh copy next to the
    /// old one and renaming it into place.
    pub fn flush_header(&self) -> Result<()> {
        let frame = self.inner.lock().header.to_frame()?;
        write_file_atomically(
            &self.config.path,
            &self.config.path.join(LOG_HEADER_TMP_FILE),
            &self.config.path.join(LOG_HEADER_FILE),
            &frame,
        )
    }

    /// Reads one log page. The append page comes from memory once
    /// something was appended to it, every other page from the file.
    /// Pages read from the file are returned as found, checksum and all.
    pub fn fetch_page(&self, pageid: i64) -> Result<LogPage> {
        let inner = self.inner.lock();
        let is_append_page = inner.append_page.logical_pageid() == pageid;
        if is_append_page && inner.append_dirty {
            let mut page = inner.append_page.clone();
            page.stamp_checksum();
            return Ok(page);
        }

        match read_log_page(&self.file, self.config.log_page_size, pageid)? {
            Some(page) => Ok(page),
            None if is_append_page => {
                let mut page = inner.append_page.clone();
                page.stamp_checksum();
                Ok(page)
            }
            None => Err(Error::Io(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("log page {} is beyond the end of the log", pageid),
            )))),
        }
    }

    /// Truncates the log at `lsa`: everything from `lsa` on is dropped
    /// and a new `EndOfLog` record is written there, pointing back at
    /// `prev_lsa`.
    pub fn reset_append_lsa(&self, lsa: Lsa, prev_lsa: Lsa) -> Result<()> {
        let lsa = self.reposition(lsa, prev_lsa)?;
        log::warn!("log truncated at {}, previous record {}", lsa, prev_lsa);
        Ok(())
    }

    /// Moves the append position to the `EndOfLog` record Analysis
    /// found at `lsa`. The header may lag behind it after a crash.
    pub(crate) fn resume_at(&self, lsa: Lsa, prev_lsa: Lsa) -> Result<()> {
        let lsa = self.reposition(lsa, prev_lsa)?;
        log::debug!("log appends resume at {}", lsa);
        Ok(())
    }

    fn reposition(&self, lsa: Lsa, prev_lsa: Lsa) -> Result<Lsa> {
        let page_size = self.config.log_page_size;
        let mut lsa = lsa;
        if lsa.offset as usize + RECORD_HEADER_SIZE > self.area_size() {
            lsa = Lsa::new(lsa.pageid + 1, 0);
        }

        let mut inner = self.inner.lock();
        let mut page = if inner.append_page.logical_pageid() == lsa.pageid {
            inner.append_page.clone()
        } else {
            read_log_page(&self.file, page_size, lsa.pageid)?
                .unwrap_or_else(|| LogPage::new(page_size, lsa.pageid))
        };
        page.set_logical_pageid(lsa.pageid);
        page.area_mut()[lsa.offset as usize..].fill(page::LOG_PAGE_INIT_VALUE);
        if page.first_record_offset() > lsa.offset {
            page.set_first_record_offset(NULL_OFFSET);
        }
        inner.append_page = page;

        self.write_end_of_log(&mut inner, lsa, prev_lsa)?;
        self.write_page(&mut inner.append_page)?;
        inner.append_dirty = false;
        fallible!(self.file.set_len((lsa.pageid as u64 + 1) * page_size as u64));
        fallible!(self.file.sync_all());
        Ok(lsa)
    }

    /// Takes a sharp checkpoint: pages are flushed, the transaction
    /// table snapshot is recorded in the meta file, and the header is
    /// pointed at the new checkpoint. Callers must not log concurrently.
    pub fn checkpoint(
        &self,
        table: &TranTable,
        meta: &mut Meta,
        page_buffer: &dyn PageBuffer,
    ) -> Result<Lsa> {
        self.flush()?;
        page_buffer.flush_all()?;

        let (chkpt_lsa, info) = {
            let mut inner = self.inner.lock();
            let snapshot_lsa = inner.header.append_lsa;
            let (info, _smallest) = CheckpointInfo::load_trantable_snapshot(
                table,
                snapshot_lsa,
                snapshot_lsa,
            );
            let lsa = self.append_locked(
                &mut inner,
                NULL_TRANID,
                NULL_LSA,
                RecordType::EndCheckpoint,
                &RecordBody::Empty,
            )?;
            debug_assert_eq!(lsa, snapshot_lsa);
            (lsa, info)
        };
        self.flush()?;

        meta.add_checkpoint_info(chkpt_lsa, info);
        meta.remove_checkpoint_info_before_lsa(chkpt_lsa);
        meta.flush_to_file(&self.meta_path())?;

        self.inner.lock().header.chkpt_lsa = chkpt_lsa;
        self.flush_header()?;

        log::info!("checkpoint taken at {}", chkpt_lsa);
        Ok(chkpt_lsa)
    }

    /// Flushes everything and marks the log as cleanly shut down.
    pub fn shutdown(&self, meta: &mut Meta) -> Result<()> {
        self.flush()?;
        meta.set_clean_shutdown(true);
        meta.flush_to_file(&self.meta_path())?;
        self.inner.lock().header.is_shutdown = true;
        self.flush_header()
    }
}

fn read_log_page(
    file: &fs::File,
    page_size: usize,
    pageid: i64,
) -> Result<Option<LogPage>> {
    if pageid < 0 {
        return Ok(None);
    }
    let offset = pageid as u64 * page_size as u64;
    let len = fallible!(file.metadata()).len();
    if offset + page_size as u64 > len {
        return Ok(None);
    }
    let mut buf = vec![0_u8; page_size];
    sys_io::read_exact_at(file, &mut buf, offset)?;
    Ok(Some(LogPage::from_bytes(buf)))
}

/// Writes `data` to `tmp_path`, fsyncs it, renames it over `path` and
/// fsyncs the directory.
pub(crate) fn write_file_atomically(
    directory: &Path,
    tmp_path: &Path,
    path: &Path,
    data: &[u8],
) -> Result<()> {
    let mut file = fallible!(
        fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(tmp_path)
    );
    fallible!(file.write_all(data));
    fallible!(file.sync_all());
    drop(file);

    fallible!(fs::rename(tmp_path, path));
    #[cfg(unix)]
    {
        let dir = fallible!(fs::File::open(directory));
        fallible!(dir.sync_all());
    }
    #[cfg(not(unix))]
    let _ = directory;
    Ok(())
}
