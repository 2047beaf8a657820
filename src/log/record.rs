use serde::{Deserialize, Serialize};

use crate::{Lsa, MvccId, TranId, Vpid, NULL_LSA, NULL_TRANID};

/// Size of the fixed header in front of every log record.
pub const RECORD_HEADER_SIZE: usize = 48;

/// Records start on this alignment within the page area.
pub const RECORD_ALIGNMENT: usize = 8;

pub(crate) const fn align_up(offset: usize) -> usize {
    (offset + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// The kinds of records found in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    /// Unknown type byte, seen when reading garbage or a torn tail.
    Corrupted = 0,
    UndoRedoData = 1,
    DiffUndoRedoData = 2,
    UndoData = 3,
    RedoData = 4,
    MvccUndoRedoData = 5,
    MvccDiffUndoRedoData = 6,
    MvccUndoData = 7,
    MvccRedoData = 8,
    DummyHeadPostpone = 9,
    Postpone = 10,
    RunPostpone = 11,
    Compensate = 12,
    CommitWithPostpone = 13,
    CommitWithPostponeObsolete = 14,
    SysopStartPostpone = 15,
    AtomicSysopStart = 16,
    Commit = 17,
    Abort = 18,
    SysopEnd = 19,
    Savepoint = 20,
    TwoPcPrepare = 21,
    TwoPcStart = 22,
    TwoPcCommitDecision = 23,
    TwoPcAbortDecision = 24,
    TwoPcCommitInformParticipants = 25,
    TwoPcAbortInformParticipants = 26,
    TwoPcRecvAck = 27,
    AssignedMvccid = 28,
    TrantableSnapshot = 29,
    DummyCrashRecovery = 30,
    DummyHead = 31,
    /// Marks the position a checkpoint was taken at.
    EndCheckpoint = 32,
    EndOfLog = 33,
}

impl From<u8> for RecordType {
    fn from(byte: u8) -> Self {
        use RecordType::*;
        match byte {
            1 => UndoRedoData,
            2 => DiffUndoRedoData,
            3 => UndoData,
            4 => RedoData,
            5 => MvccUndoRedoData,
            6 => MvccDiffUndoRedoData,
            7 => MvccUndoData,
            8 => MvccRedoData,
            9 => DummyHeadPostpone,
            10 => Postpone,
            11 => RunPostpone,
            12 => Compensate,
            13 => CommitWithPostpone,
            14 => CommitWithPostponeObsolete,
            15 => SysopStartPostpone,
            16 => AtomicSysopStart,
            17 => Commit,
            18 => Abort,
            19 => SysopEnd,
            20 => Savepoint,
            21 => TwoPcPrepare,
            22 => TwoPcStart,
            23 => TwoPcCommitDecision,
            24 => TwoPcAbortDecision,
            25 => TwoPcCommitInformParticipants,
            26 => TwoPcAbortInformParticipants,
            27 => TwoPcRecvAck,
            28 => AssignedMvccid,
            29 => TrantableSnapshot,
            30 => DummyCrashRecovery,
            31 => DummyHead,
            32 => EndCheckpoint,
            33 => EndOfLog,
            other => {
                log::trace!("encountered unexpected record type byte {}", other);
                Corrupted
            }
        }
    }
}

impl RecordType {
    /// Records that Redo may have to replay.
    pub const fn is_redo_counted(self) -> bool {
        use RecordType::*;
        matches!(
            self,
            UndoRedoData
                | DiffUndoRedoData
                | RedoData
                | MvccUndoRedoData
                | MvccDiffUndoRedoData
                | MvccRedoData
                | RunPostpone
                | Compensate
                | TwoPcPrepare
                | TwoPcStart
                | TwoPcRecvAck
        )
    }

    pub const fn is_mvcc_op(self) -> bool {
        use RecordType::*;
        matches!(
            self,
            MvccUndoRedoData | MvccDiffUndoRedoData | MvccUndoData | MvccRedoData
        )
    }
}

/// Physical location and recovery index of a logged page operation.
/// A null `vpid` marks a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOp {
    pub rcvindex: u16,
    pub vpid: Vpid,
    pub offset: i32,
}

impl PageOp {
    pub const fn new(rcvindex: u16, vpid: Vpid, offset: i32) -> PageOp {
        PageOp { rcvindex, vpid, offset }
    }

    pub const fn logical(rcvindex: u16) -> PageOp {
        PageOp { rcvindex, vpid: crate::NULL_VPID, offset: -1 }
    }

    pub const fn is_logical(&self) -> bool {
        self.vpid.is_null()
    }
}

/// How a system operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysopEndKind {
    Commit,
    Abort,
    /// Committed, leaving a logical undo behind for the parent.
    LogicalUndo { op: PageOp, undo: Vec<u8> },
    LogicalMvccUndo { op: PageOp, mvccid: MvccId, undo: Vec<u8> },
    /// Closed a logical undo run during rollback.
    LogicalCompensate { compensate_lsa: Lsa },
    /// Closed a logical postpone run during commit.
    LogicalRunPostpone { postpone_lsa: Lsa, is_sysop_postpone: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysopEnd {
    pub kind: SysopEndKind,
    /// The transaction's tail when the system operation started.
    pub lastparent_lsa: Lsa,
    pub prv_topresult_lsa: Lsa,
}

impl SysopEnd {
    pub fn new(kind: SysopEndKind, lastparent_lsa: Lsa) -> SysopEnd {
        SysopEnd { kind, lastparent_lsa, prv_topresult_lsa: NULL_LSA }
    }
}

/// Type-specific part of a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordBody {
    Empty,
    UndoRedo { op: PageOp, undo: Vec<u8>, redo: Vec<u8> },
    Undo { op: PageOp, undo: Vec<u8> },
    Redo { op: PageOp, redo: Vec<u8> },
    MvccUndoRedo { op: PageOp, mvccid: MvccId, undo: Vec<u8>, redo: Vec<u8> },
    MvccUndo { op: PageOp, mvccid: MvccId, undo: Vec<u8> },
    MvccRedo { op: PageOp, mvccid: MvccId, redo: Vec<u8> },
    /// A change that only runs once its transaction commits.
    Postpone { op: PageOp, redo: Vec<u8> },
    RunPostpone { op: PageOp, ref_lsa: Lsa, redo: Vec<u8> },
    /// Redo-only image of an undo applied during rollback.
    Compensate { op: PageOp, undo_nxlsa: Lsa, data: Vec<u8> },
    StartPostpone { posp_lsa: Lsa },
    SysopStartPostpone { sysop_end: SysopEnd, posp_lsa: Lsa },
    SysopEnd(SysopEnd),
    /// Commit and abort carry the wall-clock time they happened at,
    /// in milliseconds since the epoch.
    Donetime { at_time: i64 },
    Savepoint { prv_savept: Lsa, name: String },
    AssignedMvccid { mvccid: MvccId },
    /// A packed `CheckpointInfo`.
    TrantableSnapshot { snapshot: Vec<u8> },
}

impl RecordBody {
    /// Whether this body is a legal payload for `rtype`.
    pub fn fits(&self, rtype: RecordType) -> bool {
        use RecordType as T;
        match self {
            RecordBody::Empty => matches!(
                rtype,
                T::DummyHeadPostpone
                    | T::AtomicSysopStart
                    | T::TwoPcPrepare
                    | T::TwoPcStart
                    | T::TwoPcCommitDecision
                    | T::TwoPcAbortDecision
                    | T::TwoPcCommitInformParticipants
                    | T::TwoPcAbortInformParticipants
                    | T::TwoPcRecvAck
                    | T::DummyCrashRecovery
                    | T::DummyHead
                    | T::EndCheckpoint
                    | T::EndOfLog
            ),
            RecordBody::UndoRedo { .. } => {
                matches!(rtype, T::UndoRedoData | T::DiffUndoRedoData)
            }
            RecordBody::Undo { .. } => rtype == T::UndoData,
            RecordBody::Redo { .. } => rtype == T::RedoData,
            RecordBody::MvccUndoRedo { .. } => {
                matches!(rtype, T::MvccUndoRedoData | T::MvccDiffUndoRedoData)
            }
            RecordBody::MvccUndo { .. } => rtype == T::MvccUndoData,
            RecordBody::MvccRedo { .. } => rtype == T::MvccRedoData,
            RecordBody::Postpone { .. } => rtype == T::Postpone,
            RecordBody::RunPostpone { .. } => rtype == T::RunPostpone,
            RecordBody::Compensate { .. } => rtype == T::Compensate,
            RecordBody::StartPostpone { .. } => matches!(
                rtype,
                T::CommitWithPostpone | T::CommitWithPostponeObsolete
            ),
            RecordBody::SysopStartPostpone { .. } => {
                rtype == T::SysopStartPostpone
            }
            RecordBody::SysopEnd(_) => rtype == T::SysopEnd,
            RecordBody::Donetime { .. } => {
                matches!(rtype, T::Commit | T::Abort)
            }
            RecordBody::Savepoint { .. } => rtype == T::Savepoint,
            RecordBody::AssignedMvccid { .. } => rtype == T::AssignedMvccid,
            RecordBody::TrantableSnapshot { .. } => {
                rtype == T::TrantableSnapshot
            }
        }
    }

    pub fn page_op(&self) -> Option<&PageOp> {
        match self {
            RecordBody::UndoRedo { op, .. }
            | RecordBody::Undo { op, .. }
            | RecordBody::Redo { op, .. }
            | RecordBody::MvccUndoRedo { op, .. }
            | RecordBody::MvccUndo { op, .. }
            | RecordBody::MvccRedo { op, .. }
            | RecordBody::Postpone { op, .. }
            | RecordBody::RunPostpone { op, .. }
            | RecordBody::Compensate { op, .. } => Some(op),
            _ => None,
        }
    }

    /// The data Undo hands to the recovery function.
    pub fn undo_data(&self) -> Option<&[u8]> {
        match self {
            RecordBody::UndoRedo { undo, .. }
            | RecordBody::Undo { undo, .. }
            | RecordBody::MvccUndoRedo { undo, .. }
            | RecordBody::MvccUndo { undo, .. } => Some(undo),
            _ => None,
        }
    }

    /// The data Redo hands to the recovery function.
    pub fn redo_data(&self) -> Option<&[u8]> {
        match self {
            RecordBody::UndoRedo { redo, .. }
            | RecordBody::Redo { redo, .. }
            | RecordBody::MvccUndoRedo { redo, .. }
            | RecordBody::MvccRedo { redo, .. }
            | RecordBody::Postpone { redo, .. }
            | RecordBody::RunPostpone { redo, .. } => Some(redo),
            RecordBody::Compensate { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn mvccid(&self) -> Option<MvccId> {
        match self {
            RecordBody::MvccUndoRedo { mvccid, .. }
            | RecordBody::MvccUndo { mvccid, .. }
            | RecordBody::MvccRedo { mvccid, .. }
            | RecordBody::AssignedMvccid { mvccid } => Some(*mvccid),
            RecordBody::SysopEnd(SysopEnd {
                kind: SysopEndKind::LogicalMvccUndo { mvccid, .. },
                ..
            }) => Some(*mvccid),
            _ => None,
        }
    }
}

/// The fixed part of every record, stored little-endian:
///
/// ```text
/// 0..12   prev_tranlsa  previous record of the same transaction
/// 12..24  back_lsa      previous record in the log
/// 24..36  forw_lsa      next record in the log
/// 36..40  trid
/// 40      type
/// 41..44  padding
/// 44..48  body length
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub prev_tranlsa: Lsa,
    pub back_lsa: Lsa,
    pub forw_lsa: Lsa,
    pub trid: TranId,
    pub rtype: RecordType,
    pub body_len: u32,
}

fn put_lsa(buf: &mut [u8], lsa: Lsa) {
    buf[0..8].copy_from_slice(&lsa.pageid.to_le_bytes());
    buf[8..12].copy_from_slice(&lsa.offset.to_le_bytes());
}

fn get_lsa(buf: &[u8]) -> Lsa {
    let mut pageid = [0_u8; 8];
    pageid.copy_from_slice(&buf[0..8]);
    let mut offset = [0_u8; 4];
    offset.copy_from_slice(&buf[8..12]);
    Lsa::new(i64::from_le_bytes(pageid), i32::from_le_bytes(offset))
}

impl RecordHeader {
    pub fn end_of_log(back_lsa: Lsa) -> RecordHeader {
        RecordHeader {
            prev_tranlsa: NULL_LSA,
            back_lsa,
            forw_lsa: NULL_LSA,
            trid: NULL_TRANID,
            rtype: RecordType::EndOfLog,
            body_len: 0,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= RECORD_HEADER_SIZE);
        put_lsa(&mut buf[0..12], self.prev_tranlsa);
        put_lsa(&mut buf[12..24], self.back_lsa);
        put_lsa(&mut buf[24..36], self.forw_lsa);
        buf[36..40].copy_from_slice(&self.trid.to_le_bytes());
        buf[40] = self.rtype as u8;
        buf[41..44].fill(0);
        buf[44..48].copy_from_slice(&self.body_len.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> RecordHeader {
        let mut trid = [0_u8; 4];
        trid.copy_from_slice(&buf[36..40]);
        let mut body_len = [0_u8; 4];
        body_len.copy_from_slice(&buf[44..48]);
        RecordHeader {
            prev_tranlsa: get_lsa(&buf[0..12]),
            back_lsa: get_lsa(&buf[12..24]),
            forw_lsa: get_lsa(&buf[24..36]),
            trid: i32::from_le_bytes(trid),
            rtype: RecordType::from(buf[40]),
            body_len: u32::from_le_bytes(body_len),
        }
    }
}

/// One decoded record and the address it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsa: Lsa,
    pub header: RecordHeader,
    pub body: RecordBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = RecordHeader {
            prev_tranlsa: Lsa::new(3, 40),
            back_lsa: Lsa::new(3, 88),
            forw_lsa: NULL_LSA,
            trid: 17,
            rtype: RecordType::Compensate,
            body_len: 300,
        };
        let mut buf = [0xFF_u8; RECORD_HEADER_SIZE];
        header.write_to(&mut buf);
        assert_eq!(buf[40], 12);
        assert_eq!(&buf[41..44], &[0, 0, 0]);
        assert_eq!(RecordHeader::read_from(&buf), header);
    }

    #[test]
    fn unwritten_bytes_decode_as_corrupted() {
        let buf = [0xFF_u8; RECORD_HEADER_SIZE];
        let header = RecordHeader::read_from(&buf);
        assert_eq!(header.rtype, RecordType::Corrupted);
        assert!(header.forw_lsa.is_null());
    }

    #[test]
    fn body_type_pairing() {
        let op = PageOp::new(1, Vpid::new(0, 3), 0);
        let body = RecordBody::Redo { op, redo: vec![1] };
        assert!(body.fits(RecordType::RedoData));
        assert!(!body.fits(RecordType::UndoData));
        assert!(RecordBody::Empty.fits(RecordType::EndOfLog));
        assert!(
            RecordBody::Donetime { at_time: 0 }.fits(RecordType::Abort)
        );
        assert_eq!(body.redo_data(), Some(&[1_u8][..]));
        assert_eq!(body.undo_data(), None);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(48), 48);
        assert_eq!(align_up(49), 56);
    }
}
