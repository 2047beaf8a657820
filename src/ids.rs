use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction identifier as it appears in log records.
pub type TranId = i32;

/// Version identifier handed out to MVCC transactions.
pub type MvccId = u64;

pub const NULL_TRANID: TranId = -1;
pub const MVCCID_NULL: MvccId = 0;

/// Log Sequence Address: a (page, offset) pointer into the write-ahead log.
///
/// Addresses are totally ordered by page then offset. The null address
/// sorts below every real one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Lsa {
    pub pageid: i64,
    pub offset: i32,
}

pub const NULL_LSA: Lsa = Lsa { pageid: -1, offset: -1 };

impl Default for Lsa {
    fn default() -> Lsa {
        NULL_LSA
    }
}

impl Lsa {
    pub const fn new(pageid: i64, offset: i32) -> Lsa {
        Lsa { pageid, offset }
    }

    pub const fn is_null(&self) -> bool {
        self.pageid == NULL_LSA.pageid
    }

    pub fn set_null(&mut self) {
        *self = NULL_LSA;
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.pageid, self.offset)
    }
}

/// Volume and page identifier of a data page.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Vpid {
    pub volid: i16,
    pub pageid: i32,
}

pub const NULL_VPID: Vpid = Vpid { volid: -1, pageid: -1 };

impl Default for Vpid {
    fn default() -> Vpid {
        NULL_VPID
    }
}

impl Vpid {
    pub const fn new(volid: i16, pageid: i32) -> Vpid {
        Vpid { volid, pageid }
    }

    pub const fn is_null(&self) -> bool {
        self.pageid == NULL_VPID.pageid
    }
}

impl concurrent_map::Minimum for Vpid {
    const MIN: Vpid = Vpid { volid: i16::MIN, pageid: i32::MIN };
}

impl fmt::Display for Vpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.volid, self.pageid)
    }
}

#[cfg(test)]
mod qc {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    impl Arbitrary for Lsa {
        fn arbitrary(g: &mut Gen) -> Lsa {
            if u8::arbitrary(g) % 8 == 0 {
                NULL_LSA
            } else {
                Lsa::new(i64::from(u16::arbitrary(g)), i32::from(u16::arbitrary(g)))
            }
        }
    }

    fn prop_null_sorts_first(lsa: Lsa) -> bool {
        NULL_LSA <= lsa
    }

    fn prop_order_is_page_then_offset(a: Lsa, b: Lsa) -> bool {
        let expected = (a.pageid, a.offset).cmp(&(b.pageid, b.offset));
        a.cmp(&b) == expected
    }

    #[test]
    fn lsa_ordering() {
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop_null_sorts_first as fn(Lsa) -> bool);
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop_order_is_page_then_offset as fn(Lsa, Lsa) -> bool);
    }

    #[test]
    fn vpid_minimum_is_lowest() {
        use concurrent_map::Minimum;
        assert!(Vpid::MIN < NULL_VPID);
        assert!(Vpid::MIN < Vpid::new(0, 0));
    }
}
