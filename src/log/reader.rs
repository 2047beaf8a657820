use super::{
    LogManager, LogPage, LogRecord, RecordBody, RecordHeader, RecordType,
    RECORD_HEADER_SIZE,
};
use crate::{Error, Lsa, Result};

/// Bodies above this are treated as garbage rather than allocated.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Random-access record reader that keeps the last fetched page.
pub(crate) struct LogReader<'a> {
    log: &'a LogManager,
    page: Option<LogPage>,
    verify: bool,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(log: &'a LogManager) -> LogReader<'a> {
        LogReader { log, page: None, verify: true }
    }

    /// A reader that hands out pages failing their checksum, for
    /// Analysis, which inspects torn pages itself. Record bodies that
    /// continue onto such a page are still rejected.
    pub(crate) fn unverified(log: &'a LogManager) -> LogReader<'a> {
        LogReader { log, page: None, verify: false }
    }

    /// Returns a copy of `pageid`, verified unless this reader is
    /// unverified. A cached copy of the append page is never trusted
    /// since appends keep changing it.
    pub(crate) fn fetch(&mut self, pageid: i64) -> Result<&LogPage> {
        let verify = self.verify;
        self.fetch_checked(pageid, verify)
    }

    fn fetch_checked(&mut self, pageid: i64, verify: bool) -> Result<&LogPage> {
        let reusable = match &self.page {
            Some(page) => {
                page.logical_pageid() == pageid
                    && pageid < self.log.append_lsa().pageid
            }
            None => false,
        };

        if !reusable {
            self.page = Some(self.log.fetch_page(pageid)?);
        }

        if verify && self.page.as_ref().is_some_and(LogPage::is_corrupted) {
            log::error!("log page {} failed its checksum", pageid);
            self.page = None;
            return Err(Error::Corruption { at: Lsa::new(pageid, 0) });
        }

        self.page.as_ref().ok_or_else(|| {
            Error::ReportableBug("log reader lost its page".to_string())
        })
    }

    pub(crate) fn read_header(&mut self, lsa: Lsa) -> Result<RecordHeader> {
        let page = self.fetch(lsa.pageid)?;
        let offset = lsa.offset as usize;
        if lsa.offset < 0 || offset + RECORD_HEADER_SIZE > page.area_size() {
            return Err(Error::Corruption { at: lsa });
        }
        Ok(RecordHeader::read_from(&page.area()[offset..]))
    }

    /// Reads the `body_len` bytes following the header at `lsa`,
    /// crossing page boundaries as needed.
    pub(crate) fn read_body(
        &mut self,
        lsa: Lsa,
        header: &RecordHeader,
    ) -> Result<RecordBody> {
        // the end-of-log marker is a bare header
        if header.rtype == RecordType::EndOfLog {
            return Ok(RecordBody::Empty);
        }

        let len = header.body_len as usize;
        if len > MAX_BODY_LEN {
            return Err(Error::Corruption { at: lsa });
        }

        let mut bytes = Vec::with_capacity(len);
        let mut pageid = lsa.pageid;
        let mut offset = lsa.offset as usize + RECORD_HEADER_SIZE;
        while bytes.len() < len {
            let verify = self.verify || pageid != lsa.pageid;
            let page = self.fetch_checked(pageid, verify)?;
            let area = page.area();
            if offset >= area.len() {
                pageid += 1;
                offset = 0;
                continue;
            }
            let n = (len - bytes.len()).min(area.len() - offset);
            bytes.extend_from_slice(&area[offset..offset + n]);
            offset += n;
        }

        bincode::deserialize(&bytes).map_err(|e| {
            log::warn!("undecodable body for the record at {}: {:?}", lsa, e);
            Error::Corruption { at: lsa }
        })
    }

    pub(crate) fn read_record(&mut self, lsa: Lsa) -> Result<LogRecord> {
        let header = self.read_header(lsa)?;
        let body = self.read_body(lsa, &header)?;
        Ok(LogRecord { lsa, header, body })
    }
}
