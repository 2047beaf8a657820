use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::flush::{FlushVolumesInfo, VolumeFlushState};
use super::Shared;

pub(crate) enum FlushMessage {
    /// Some block became full.
    BlockFull,
    Shutdown(Sender<()>),
}

pub(crate) enum SyncMessage {
    Sync { info: Arc<FlushVolumesInfo>, done: Sender<io::Result<()>> },
    Shutdown(Sender<()>),
}

/// Drains full blocks in ring order, starting from the block after
/// the last one it flushed.
fn flush_ready_blocks(shared: &Shared) {
    let arena = match shared.arena() {
        Some(arena) => arena,
        None => return,
    };

    let block_pages = arena.geometry.block_pages;
    loop {
        if shared.check_error().is_err() {
            return;
        }

        let block_no = arena.next_block_to_flush.load(Ordering::Acquire);
        let block = &arena.blocks[block_no];
        if block.count() != block_pages {
            return;
        }

        match shared.flush_block_with_retry(&arena, block_no) {
            Ok(_) => {
                let next = (block_no + 1) % arena.geometry.num_blocks;
                arena.next_block_to_flush.store(next, Ordering::Release);
            }
            Err(e) => {
                log::error!(
                    "double-write flush daemon stopping after error: {:?}",
                    e
                );
                return;
            }
        }
    }
}

fn flush_daemon(rx: Receiver<FlushMessage>, shared: Arc<Shared>) {
    loop {
        match rx.recv() {
            Ok(FlushMessage::BlockFull) => {
                // coalesce wakeups that piled up while we were flushing
                while let Ok(msg) = rx.try_recv() {
                    if let FlushMessage::Shutdown(tx) = msg {
                        flush_ready_blocks(&shared);
                        drop(shared);
                        let _ = tx.send(());
                        return;
                    }
                }
                flush_ready_blocks(&shared);
            }
            Ok(FlushMessage::Shutdown(tx)) => {
                flush_ready_blocks(&shared);
                drop(shared);
                if let Err(e) = tx.send(()) {
                    log::error!(
                        "double-write flush daemon failed to ack shutdown: {e:?}"
                    );
                }
                return;
            }
            Err(e) => {
                log::error!(
                    "double-write flush daemon unable to receive message, unexpected shutdown: {e:?}"
                );
                return;
            }
        }
    }
}

fn file_sync_helper(rx: Receiver<SyncMessage>, shared: Arc<Shared>) {
    loop {
        match rx.recv() {
            Ok(SyncMessage::Sync { info, done }) => {
                let res = info
                    .sync_unclaimed(
                        &*shared.volumes,
                        VolumeFlushState::FlushedByHelper,
                    )
                    .map(|synced| {
                        log::trace!("file sync helper fsynced {} volumes", synced);
                    });
                let _ = done.send(res);
            }
            Ok(SyncMessage::Shutdown(tx)) => {
                drop(shared);
                let _ = tx.send(());
                return;
            }
            Err(e) => {
                log::error!(
                    "file sync helper unable to receive message, unexpected shutdown: {e:?}"
                );
                return;
            }
        }
    }
}

pub(crate) fn spawn_flush_daemon(
    rx: Receiver<FlushMessage>,
    shared: Arc<Shared>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dwb_flush_block".into())
        .spawn(move || flush_daemon(rx, shared))
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("unable to spawn double-write flush daemon: {:?}", e),
            )
        })
}

pub(crate) fn spawn_file_sync_helper(
    rx: Receiver<SyncMessage>,
    shared: Arc<Shared>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dwb_file_sync".into())
        .spawn(move || file_sync_helper(rx, shared))
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("unable to spawn double-write file sync helper: {:?}", e),
            )
        })
}
