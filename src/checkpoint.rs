//! Checkpoint snapshots of the transaction table.

use serde::{Deserialize, Serialize};

use crate::tdes::{TopOp, TopOps, TranState, TranTable};
use crate::{Lsa, MvccId, Result, TranId, NULL_LSA, NULL_TRANID};

/// What a checkpoint remembers about one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranInfo {
    pub isloose_end: bool,
    pub trid: TranId,
    pub state: TranState,
    pub head_lsa: Lsa,
    pub tail_lsa: Lsa,
    pub undo_nxlsa: Lsa,
    pub posp_nxlsa: Lsa,
    pub savept_lsa: Lsa,
    pub tail_topresult_lsa: Lsa,
    pub start_postpone_lsa: Lsa,
    pub user_name: String,
    pub mvcc_id: MvccId,
}

/// What a checkpoint remembers about an open system operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysopInfo {
    pub trid: TranId,
    pub sysop_start_postpone_lsa: Lsa,
    pub atomic_sysop_start_lsa: Lsa,
}

/// Transaction table snapshot plus the log positions recovery
/// starts from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub start_redo_lsa: Lsa,
    pub snapshot_lsa: Lsa,
    pub trans: Vec<TranInfo>,
    pub sysops: Vec<SysopInfo>,
    pub has_2pc: bool,
}

impl CheckpointInfo {
    /// Captures `table` as of `snapshot_lsa`. Also returns the smallest
    /// head LSA among the captured transactions, null when there is none.
    pub fn load_trantable_snapshot(
        table: &TranTable,
        snapshot_lsa: Lsa,
        start_redo_lsa: Lsa,
    ) -> (CheckpointInfo, Lsa) {
        let mut info = CheckpointInfo {
            start_redo_lsa,
            snapshot_lsa,
            ..CheckpointInfo::default()
        };
        let mut smallest_lsa = NULL_LSA;

        let mut trids = table.trids();
        trids.retain(|trid| *trid != NULL_TRANID);

        for trid in trids {
            let tdes = match table.get(trid) {
                Some(tdes) => tdes,
                None => continue,
            };

            // finished transactions have nothing left for recovery
            if tdes.state.is_completed() && !tdes.commit_abort_lsa.is_null() {
                continue;
            }

            if tdes.state.is_2pc() {
                info.has_2pc = true;
            }

            if !tdes.head_lsa.is_null()
                && (smallest_lsa.is_null() || tdes.head_lsa < smallest_lsa)
            {
                smallest_lsa = tdes.head_lsa;
            }

            info.trans.push(TranInfo {
                isloose_end: tdes.isloose_end,
                trid: tdes.trid,
                state: tdes.state,
                head_lsa: tdes.head_lsa,
                tail_lsa: tdes.tail_lsa,
                undo_nxlsa: tdes.undo_nxlsa,
                posp_nxlsa: tdes.posp_nxlsa,
                savept_lsa: tdes.savept_lsa,
                tail_topresult_lsa: tdes.tail_topresult_lsa,
                start_postpone_lsa: tdes.rcv.tran_start_postpone_lsa,
                user_name: tdes.user_name.clone(),
                mvcc_id: tdes.mvccid,
            });

            if !tdes.rcv.sysop_start_postpone_lsa.is_null()
                || !tdes.rcv.atomic_sysop_start_lsa.is_null()
            {
                info.sysops.push(SysopInfo {
                    trid: tdes.trid,
                    sysop_start_postpone_lsa: tdes.rcv.sysop_start_postpone_lsa,
                    atomic_sysop_start_lsa: tdes.rcv.atomic_sysop_start_lsa,
                });
            }
        }

        (info, smallest_lsa)
    }

    pub fn packed_size(&self) -> Result<usize> {
        Ok(bincode::serialized_size(self)? as usize)
    }

    /// Appends the packed form to `buf`. Several infos may be packed
    /// back to back into one buffer.
    pub fn pack(&self, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(buf, self)?;
        Ok(())
    }

    /// Unpacks one info from the front of `buf`, advancing it.
    pub fn unpack(buf: &mut &[u8]) -> Result<CheckpointInfo> {
        Ok(bincode::deserialize_from(buf)?)
    }

    /// Seeds `table` with the snapshot and returns where Redo starts.
    /// With `skip_empty`, transactions that never logged are left out.
    pub fn recovery_analysis(&self, table: &mut TranTable, skip_empty: bool) -> Lsa {
        for chkpt in &self.trans {
            if skip_empty && chkpt.tail_lsa.is_null() {
                continue;
            }

            let tdes = table.find_or_insert(chkpt.trid);
            tdes.topops.last = -1;

            tdes.state = match chkpt.state {
                TranState::Active | TranState::UnactiveAborted => {
                    TranState::UnactiveUnilaterallyAborted
                }
                other => other,
            };

            tdes.head_lsa = chkpt.head_lsa;
            tdes.tail_lsa = chkpt.tail_lsa;
            tdes.undo_nxlsa = if chkpt.state == TranState::UnactiveAborted {
                // an abort in progress resumes from the tail
                chkpt.tail_lsa
            } else {
                chkpt.undo_nxlsa
            };
            tdes.posp_nxlsa = chkpt.posp_nxlsa;
            tdes.savept_lsa = chkpt.savept_lsa;
            tdes.tail_topresult_lsa = chkpt.tail_topresult_lsa;
            tdes.rcv.tran_start_postpone_lsa = chkpt.start_postpone_lsa;
            tdes.user_name = chkpt.user_name.clone();
            tdes.mvccid = chkpt.mvcc_id;
            tdes.isloose_end = chkpt.isloose_end;
        }

        for sysop in &self.sysops {
            if table.get(sysop.trid).is_none() && skip_empty {
                continue;
            }
            let tdes = table.find_or_insert(sysop.trid);
            tdes.rcv.sysop_start_postpone_lsa = sysop.sysop_start_postpone_lsa;
            tdes.rcv.atomic_sysop_start_lsa = sysop.atomic_sysop_start_lsa;
            tdes.topops = TopOps::default();
            if !sysop.sysop_start_postpone_lsa.is_null() {
                tdes.topops.push(TopOp::default());
            }
        }

        self.start_redo_lsa
    }

    /// Marks the transactions left in a 2PC state as loose ends and
    /// returns how many there are.
    pub fn recovery_2pc_analysis(&self, table: &mut TranTable) -> usize {
        if !self.has_2pc {
            return 0;
        }

        let mut loose_ends = 0;
        for tdes in table.iter_mut() {
            if tdes.state.is_2pc() {
                tdes.isloose_end = true;
                loose_ends += 1;
            }
        }
        if loose_ends > 0 {
            log::info!(
                "checkpoint carries {} two-phase commit loose ends",
                loose_ends
            );
        }
        loose_ends
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen};

    use super::*;
    use crate::tdes::Tdes;

    fn arbitrary_lsa(g: &mut Gen) -> Lsa {
        if u8::arbitrary(g) % 5 == 0 {
            NULL_LSA
        } else {
            Lsa::new(i64::from(u16::arbitrary(g)), i32::from(u16::arbitrary(g)))
        }
    }

    fn arbitrary_state(g: &mut Gen) -> TranState {
        *g.choose(&[
            TranState::Active,
            TranState::UnactiveCommitted,
            TranState::UnactiveAborted,
            TranState::UnactiveUnilaterallyAborted,
            TranState::UnactiveCommittedWithPostpone,
            TranState::UnactiveTopopeCommittedWithPostpone,
            TranState::Unactive2pcPrepare,
            TranState::Unactive2pcCommitDecision,
        ])
        .unwrap()
    }

    fn generate_info(g: &mut Gen, ntrans: usize, nsysops: usize) -> CheckpointInfo {
        let trans = (0..ntrans)
            .map(|i| TranInfo {
                isloose_end: bool::arbitrary(g),
                trid: i as TranId + 1,
                state: arbitrary_state(g),
                head_lsa: arbitrary_lsa(g),
                tail_lsa: arbitrary_lsa(g),
                undo_nxlsa: arbitrary_lsa(g),
                posp_nxlsa: arbitrary_lsa(g),
                savept_lsa: arbitrary_lsa(g),
                tail_topresult_lsa: arbitrary_lsa(g),
                start_postpone_lsa: arbitrary_lsa(g),
                user_name: ["dba", "user", "pub", "ab"][i % 4].to_string(),
                mvcc_id: u64::arbitrary(g),
            })
            .collect();
        let sysops = (0..nsysops)
            .map(|i| SysopInfo {
                trid: i as TranId + 1,
                sysop_start_postpone_lsa: arbitrary_lsa(g),
                atomic_sysop_start_lsa: arbitrary_lsa(g),
            })
            .collect();
        CheckpointInfo {
            start_redo_lsa: arbitrary_lsa(g),
            snapshot_lsa: arbitrary_lsa(g),
            trans,
            sysops,
            has_2pc: bool::arbitrary(g),
        }
    }

    #[test]
    fn pack_unpack() {
        let mut g = Gen::new(100);
        for (ntrans, nsysops) in [(100, 100), (0, 100), (100, 0), (0, 0)] {
            let info = generate_info(&mut g, ntrans, nsysops);
            let mut buf = vec![];
            info.pack(&mut buf).unwrap();
            assert_eq!(buf.len(), info.packed_size().unwrap());

            let mut cursor = &buf[..];
            assert_eq!(CheckpointInfo::unpack(&mut cursor).unwrap(), info);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn two_infos_in_one_buffer() {
        let mut g = Gen::new(100);
        let first = generate_info(&mut g, 220, 80);
        let second = generate_info(&mut g, 3, 1);

        let mut buf = vec![];
        first.pack(&mut buf).unwrap();
        second.pack(&mut buf).unwrap();

        let mut cursor = &buf[..];
        assert_eq!(CheckpointInfo::unpack(&mut cursor).unwrap(), first);
        assert_eq!(CheckpointInfo::unpack(&mut cursor).unwrap(), second);
        assert!(cursor.is_empty());
    }

    #[test]
    fn empty_snapshot_seeds_nothing() {
        let info = CheckpointInfo::default();
        let mut table = TranTable::new();
        info.recovery_analysis(&mut table, true);
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_then_seed() {
        let mut live = TranTable::new();

        let mut active = Tdes::new(1);
        active.head_lsa = Lsa::new(2, 0);
        active.set_tail_and_undo(Lsa::new(2, 96));
        live.insert(active);

        let mut aborting = Tdes::new(2);
        aborting.state = TranState::UnactiveAborted;
        aborting.head_lsa = Lsa::new(1, 8);
        aborting.tail_lsa = Lsa::new(3, 0);
        aborting.undo_nxlsa = Lsa::new(2, 40);
        live.insert(aborting);

        let mut done = Tdes::new(3);
        done.state = TranState::UnactiveCommitted;
        done.head_lsa = Lsa::new(1, 0);
        done.tail_lsa = Lsa::new(1, 64);
        done.commit_abort_lsa = Lsa::new(1, 64);
        live.insert(done);

        let mut in_sysop = Tdes::new(4);
        in_sysop.state = TranState::UnactiveTopopeCommittedWithPostpone;
        in_sysop.head_lsa = Lsa::new(2, 8);
        in_sysop.tail_lsa = Lsa::new(2, 200);
        in_sysop.rcv.sysop_start_postpone_lsa = Lsa::new(2, 200);
        live.insert(in_sysop);

        let never_logged = Tdes::new(5);
        live.insert(never_logged);

        let (info, smallest) =
            CheckpointInfo::load_trantable_snapshot(&live, Lsa::new(4, 0), Lsa::new(1, 8));
        assert_eq!(smallest, Lsa::new(1, 8));
        assert_eq!(info.trans.len(), 4);
        assert_eq!(info.sysops.len(), 1);
        assert!(!info.has_2pc);

        let mut table = TranTable::new();
        let start_redo = info.recovery_analysis(&mut table, true);
        assert_eq!(start_redo, Lsa::new(1, 8));
        assert_eq!(table.len(), 3);

        let active = table.get(1).unwrap();
        assert_eq!(active.state, TranState::UnactiveUnilaterallyAborted);
        assert_eq!(active.undo_nxlsa, Lsa::new(2, 96));

        let aborting = table.get(2).unwrap();
        assert_eq!(aborting.state, TranState::UnactiveUnilaterallyAborted);
        assert_eq!(aborting.undo_nxlsa, Lsa::new(3, 0));

        let in_sysop = table.get(4).unwrap();
        assert_eq!(in_sysop.topops.last, 0);
        assert_eq!(in_sysop.rcv.sysop_start_postpone_lsa, Lsa::new(2, 200));

        assert!(table.get(3).is_none());
        assert!(table.get(5).is_none());
    }

    #[test]
    fn loose_ends_are_counted() {
        let mut live = TranTable::new();
        let mut prepared = Tdes::new(9);
        prepared.state = TranState::Unactive2pcPrepare;
        prepared.set_tail_and_undo(Lsa::new(1, 0));
        live.insert(prepared);

        let (info, _) =
            CheckpointInfo::load_trantable_snapshot(&live, Lsa::new(2, 0), Lsa::new(2, 0));
        assert!(info.has_2pc);

        let mut table = TranTable::new();
        info.recovery_analysis(&mut table, true);
        assert_eq!(info.recovery_2pc_analysis(&mut table), 1);
        assert!(table.get(9).unwrap().isloose_end);
    }
}
