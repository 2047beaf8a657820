use crate::{Lsa, NULL_LSA};

/// Which server the recovery runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    /// Owns transactions: full analysis, redo and undo.
    #[default]
    Transaction,
    /// Only replays pages. Analysis just looks for the end of the log.
    Page,
}

/// How recovery should treat the log it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryOptions {
    /// The log comes from a backup being restored, not from a crash.
    pub restore_from_backup: bool,
    /// When restoring, stop before the first commit or abort later than
    /// this many milliseconds since the epoch.
    pub stop_at: Option<i64>,
    pub role: ServerRole,
}

/// State shared by the recovery phases of one run.
#[derive(Debug, Clone)]
pub(crate) struct RecoveryContext {
    checkpoint_lsa: Lsa,
    start_redo_lsa: Lsa,
    end_redo_lsa: Lsa,
    options: RecoveryOptions,
    forced_restore_stop: bool,
    restore_incomplete: bool,
    pub(crate) num_redo_records: usize,
    pub(crate) max_trid_seen: i32,
    pub(crate) max_mvccid_seen: u64,
}

impl RecoveryContext {
    pub(crate) fn new(checkpoint_lsa: Lsa, options: RecoveryOptions) -> RecoveryContext {
        RecoveryContext {
            checkpoint_lsa,
            start_redo_lsa: checkpoint_lsa,
            end_redo_lsa: NULL_LSA,
            options,
            forced_restore_stop: false,
            restore_incomplete: false,
            num_redo_records: 0,
            max_trid_seen: 0,
            max_mvccid_seen: 0,
        }
    }

    pub(crate) fn checkpoint_lsa(&self) -> Lsa {
        self.checkpoint_lsa
    }

    pub(crate) fn start_redo_lsa(&self) -> Lsa {
        self.start_redo_lsa
    }

    pub(crate) fn set_start_redo_lsa(&mut self, lsa: Lsa) {
        self.start_redo_lsa = lsa;
    }

    pub(crate) fn end_redo_lsa(&self) -> Lsa {
        self.end_redo_lsa
    }

    pub(crate) fn set_end_redo_lsa(&mut self, lsa: Lsa) {
        self.end_redo_lsa = lsa;
    }

    pub(crate) fn is_restore_from_backup(&self) -> bool {
        self.options.restore_from_backup
    }

    /// Whether a commit or abort that happened at `donetime` lies past
    /// the requested restore point.
    pub(crate) fn does_restore_stop_before(&self, donetime: i64) -> bool {
        match self.options.stop_at {
            Some(stop_at) => self.options.restore_from_backup && donetime > stop_at,
            None => false,
        }
    }

    pub(crate) fn set_forced_restore_stop(&mut self) {
        self.forced_restore_stop = true;
    }

    pub(crate) fn is_forced_restore_stop(&self) -> bool {
        self.forced_restore_stop
    }

    pub(crate) fn set_incomplete_restore(&mut self) {
        self.restore_incomplete = true;
    }

    pub(crate) fn is_restore_incomplete(&self) -> bool {
        self.restore_incomplete
    }

    pub(crate) fn is_page_server(&self) -> bool {
        self.options.role == ServerRole::Page
    }
}
