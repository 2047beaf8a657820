//! Transaction descriptors as rebuilt by recovery.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::{Lsa, MvccId, TranId, MVCCID_NULL, NULL_LSA};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranState {
    /// Placeholder while recovery has not decided anything yet.
    Recovery,
    Active,
    UnactiveCommitted,
    UnactiveWillCommit,
    UnactiveCommittedWithPostpone,
    UnactiveTopopeCommittedWithPostpone,
    UnactiveAborted,
    UnactiveUnilaterallyAborted,
    Unactive2pcPrepare,
    Unactive2pcCollectingParticipantVotes,
    Unactive2pcAbortDecision,
    Unactive2pcCommitDecision,
    UnactiveCommittedInformingParticipants,
    UnactiveAbortedInformingParticipants,
}

impl TranState {
    pub const fn is_2pc(self) -> bool {
        use TranState::*;
        matches!(
            self,
            Unactive2pcPrepare
                | Unactive2pcCollectingParticipantVotes
                | Unactive2pcAbortDecision
                | Unactive2pcCommitDecision
                | UnactiveCommittedInformingParticipants
                | UnactiveAbortedInformingParticipants
        )
    }

    /// States Undo rolls back.
    pub const fn is_aborted(self) -> bool {
        matches!(
            self,
            TranState::UnactiveUnilaterallyAborted | TranState::UnactiveAborted
        )
    }

    pub const fn is_committed_with_postpone(self) -> bool {
        matches!(
            self,
            TranState::UnactiveWillCommit
                | TranState::UnactiveCommittedWithPostpone
                | TranState::UnactiveTopopeCommittedWithPostpone
        )
    }

    pub const fn is_completed(self) -> bool {
        matches!(self, TranState::UnactiveCommitted | TranState::UnactiveAborted)
    }
}

/// One open nested top operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopOp {
    pub lastparent_lsa: Lsa,
    pub posp_lsa: Lsa,
}

/// Stack of open nested top operations. `last == -1` means empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopOps {
    pub stack: Vec<TopOp>,
    pub last: i32,
}

impl Default for TopOps {
    fn default() -> TopOps {
        TopOps { stack: vec![], last: -1 }
    }
}

impl TopOps {
    pub fn is_empty(&self) -> bool {
        self.last < 0
    }

    /// Makes sure the slot at `last` exists and returns it.
    pub fn top_mut(&mut self) -> Option<&mut TopOp> {
        if self.last < 0 {
            return None;
        }
        let last = self.last as usize;
        if self.stack.len() <= last {
            self.stack.resize(last + 1, TopOp::default());
        }
        self.stack.get_mut(last)
    }

    pub fn top(&self) -> Option<&TopOp> {
        if self.last < 0 {
            None
        } else {
            self.stack.get(self.last as usize)
        }
    }

    pub fn push(&mut self, op: TopOp) {
        self.last += 1;
        if let Some(slot) = self.top_mut() {
            *slot = op;
        }
    }

    pub fn pop(&mut self) -> Option<TopOp> {
        let top = self.top().copied();
        if self.last >= 0 {
            self.last -= 1;
        }
        top
    }
}

/// Addresses only recovery cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLsas {
    pub sysop_start_postpone_lsa: Lsa,
    pub atomic_sysop_start_lsa: Lsa,
    pub tran_start_postpone_lsa: Lsa,
    pub analysis_last_aborted_sysop_lsa: Lsa,
    pub analysis_last_aborted_sysop_start_lsa: Lsa,
}

impl Default for RecoveryLsas {
    fn default() -> RecoveryLsas {
        RecoveryLsas {
            sysop_start_postpone_lsa: NULL_LSA,
            atomic_sysop_start_lsa: NULL_LSA,
            tran_start_postpone_lsa: NULL_LSA,
            analysis_last_aborted_sysop_lsa: NULL_LSA,
            analysis_last_aborted_sysop_start_lsa: NULL_LSA,
        }
    }
}

/// A transaction descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tdes {
    pub trid: TranId,
    pub state: TranState,
    pub head_lsa: Lsa,
    pub tail_lsa: Lsa,
    pub undo_nxlsa: Lsa,
    pub posp_nxlsa: Lsa,
    pub savept_lsa: Lsa,
    pub tail_topresult_lsa: Lsa,
    pub commit_abort_lsa: Lsa,
    pub topops: TopOps,
    pub rcv: RecoveryLsas,
    pub mvccid: MvccId,
    pub last_mvcc_lsa: Lsa,
    pub isloose_end: bool,
    pub user_name: String,
}

impl Tdes {
    pub fn new(trid: TranId) -> Tdes {
        Tdes {
            trid,
            state: TranState::Active,
            head_lsa: NULL_LSA,
            tail_lsa: NULL_LSA,
            undo_nxlsa: NULL_LSA,
            posp_nxlsa: NULL_LSA,
            savept_lsa: NULL_LSA,
            tail_topresult_lsa: NULL_LSA,
            commit_abort_lsa: NULL_LSA,
            topops: TopOps::default(),
            rcv: RecoveryLsas::default(),
            mvccid: MVCCID_NULL,
            last_mvcc_lsa: NULL_LSA,
            isloose_end: false,
            user_name: String::new(),
        }
    }

    /// Sets tail and undo-next together, the common case for records
    /// that can be rolled back.
    pub(crate) fn set_tail_and_undo(&mut self, lsa: Lsa) {
        self.tail_lsa = lsa;
        self.undo_nxlsa = lsa;
    }
}

/// The transaction table, keyed by trid.
#[derive(Debug, Default, Clone)]
pub struct TranTable {
    tdes: FnvHashMap<TranId, Tdes>,
}

impl TranTable {
    pub fn new() -> TranTable {
        TranTable::default()
    }

    pub fn len(&self) -> usize {
        self.tdes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tdes.is_empty()
    }

    pub fn get(&self, trid: TranId) -> Option<&Tdes> {
        self.tdes.get(&trid)
    }

    pub fn get_mut(&mut self, trid: TranId) -> Option<&mut Tdes> {
        self.tdes.get_mut(&trid)
    }

    pub fn insert(&mut self, tdes: Tdes) {
        self.tdes.insert(tdes.trid, tdes);
    }

    pub fn free(&mut self, trid: TranId) -> Option<Tdes> {
        self.tdes.remove(&trid)
    }

    /// Looks up `trid`, creating a descriptor in the `Recovery`
    /// state when it is missing.
    pub fn find_or_insert(&mut self, trid: TranId) -> &mut Tdes {
        self.tdes.entry(trid).or_insert_with(|| {
            let mut tdes = Tdes::new(trid);
            tdes.state = TranState::Recovery;
            tdes
        })
    }

    /// Looks up `trid` for Analysis. A newly seen transaction starts
    /// unilaterally aborted with its head at `lsa`.
    pub fn rv_find_or_allocate(&mut self, trid: TranId, lsa: Lsa) -> &mut Tdes {
        self.tdes.entry(trid).or_insert_with(|| {
            let mut tdes = Tdes::new(trid);
            tdes.state = TranState::UnactiveUnilaterallyAborted;
            tdes.head_lsa = lsa;
            tdes
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tdes> {
        self.tdes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tdes> {
        self.tdes.values_mut()
    }

    /// Trids in ascending order, for deterministic passes.
    pub fn trids(&self) -> Vec<TranId> {
        let mut trids: Vec<TranId> = self.tdes.keys().copied().collect();
        trids.sort_unstable();
        trids
    }

    /// The aborted transaction with the highest undo-next address.
    pub fn max_undo_nxlsa(&self) -> Option<(TranId, Lsa)> {
        self.tdes
            .values()
            .filter(|tdes| tdes.state.is_aborted() && !tdes.undo_nxlsa.is_null())
            .map(|tdes| (tdes.trid, tdes.undo_nxlsa))
            .max_by_key(|(_trid, lsa)| *lsa)
    }

    pub fn max_trid(&self) -> Option<TranId> {
        self.tdes.keys().copied().max()
    }
}
