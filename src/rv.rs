//! The registry of recovery functions, indexed by the `rcvindex`
//! logged with every page operation.

use std::sync::Arc;

use fnv::FnvHashMap;

use crate::{Error, Lsa, MvccId, Result, Vpid};

/// Arguments handed to a recovery function.
#[derive(Debug)]
pub struct Rcv<'a> {
    /// The page to change, `None` for logical operations.
    pub page: Option<&'a mut [u8]>,
    pub vpid: Vpid,
    pub offset: i32,
    pub data: &'a [u8],
    pub mvccid: Option<MvccId>,
    /// Address of the record being applied.
    pub lsa: Lsa,
}

pub type RvFn = Arc<dyn Fn(&mut Rcv<'_>) -> Result<()> + Send + Sync>;

/// Undo and redo callbacks of one recovery index.
#[derive(Clone, Default)]
pub struct RecoveryFunction {
    pub undo: Option<RvFn>,
    pub redo: Option<RvFn>,
    /// Redo of this index must run on the scanning thread after all
    /// outstanding parallel work is done.
    pub sync_redo: bool,
}

impl std::fmt::Debug for RecoveryFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryFunction")
            .field("undo", &self.undo.is_some())
            .field("redo", &self.redo.is_some())
            .field("sync_redo", &self.sync_redo)
            .finish()
    }
}

impl RecoveryFunction {
    pub fn new() -> RecoveryFunction {
        RecoveryFunction::default()
    }

    pub fn undo<F>(mut self, f: F) -> RecoveryFunction
    where
        F: Fn(&mut Rcv<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.undo = Some(Arc::new(f));
        self
    }

    pub fn redo<F>(mut self, f: F) -> RecoveryFunction
    where
        F: Fn(&mut Rcv<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.redo = Some(Arc::new(f));
        self
    }

    pub fn sync_redo(mut self, sync_redo: bool) -> RecoveryFunction {
        self.sync_redo = sync_redo;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryFunctions {
    table: FnvHashMap<u16, RecoveryFunction>,
}

impl RecoveryFunctions {
    pub fn new() -> RecoveryFunctions {
        RecoveryFunctions::default()
    }

    pub fn register(&mut self, rcvindex: u16, function: RecoveryFunction) {
        if self.table.insert(rcvindex, function).is_some() {
            log::debug!("replaced recovery functions for index {}", rcvindex);
        }
    }

    pub fn get(&self, rcvindex: u16) -> Result<&RecoveryFunction> {
        self.table
            .get(&rcvindex)
            .ok_or(Error::RecoveryFunctionMissing(rcvindex))
    }

    pub fn is_sync_redo(&self, rcvindex: u16) -> bool {
        self.table.get(&rcvindex).map(|f| f.sync_redo).unwrap_or(false)
    }

    pub(crate) fn apply_redo(&self, rcvindex: u16, rcv: &mut Rcv<'_>) -> Result<()> {
        match &self.get(rcvindex)?.redo {
            Some(redo) => redo(rcv),
            None => Ok(()),
        }
    }

    pub(crate) fn apply_undo(&self, rcvindex: u16, rcv: &mut Rcv<'_>) -> Result<()> {
        match &self.get(rcvindex)?.undo {
            Some(undo) => undo(rcv),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn registered_functions_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let redo_calls = calls.clone();

        let mut functions = RecoveryFunctions::new();
        functions.register(
            7,
            RecoveryFunction::new()
                .redo(move |rcv| {
                    redo_calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(page) = rcv.page.as_deref_mut() {
                        page[0] = rcv.data[0];
                    }
                    Ok(())
                })
                .sync_redo(true),
        );

        let mut page = vec![0_u8; 8];
        let mut rcv = Rcv {
            page: Some(&mut page[..]),
            vpid: Vpid::new(0, 1),
            offset: 0,
            data: &[9],
            mvccid: None,
            lsa: Lsa::new(1, 0),
        };
        functions.apply_redo(7, &mut rcv).unwrap();
        functions.apply_undo(7, &mut rcv).unwrap();
        drop(rcv);

        assert_eq!(page[0], 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(functions.is_sync_redo(7));
        assert_eq!(
            functions.apply_redo(8, &mut Rcv {
                page: None,
                vpid: Vpid::new(0, 1),
                offset: 0,
                data: &[],
                mvccid: None,
                lsa: Lsa::new(1, 0),
            }),
            Err(Error::RecoveryFunctionMissing(8))
        );
    }
}
