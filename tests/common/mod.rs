#![allow(dead_code)]

use std::sync::Arc;

use keel::{
    Config, DoubleWriteBuffer, DwbPageBuffer, FileVolumes, LogManager, Lsa, Meta,
    PageBuffer, PageOp, Rcv, RecordBody, RecordType, RecoveryEnv, RecoveryFunction,
    RecoveryFunctions, RecoveryOptions, RecoveryOutcome, Tdes, Volumes, Vpid,
    PAGE_HEADER_SIZE,
};

pub const PAGE: usize = 4096;
pub const VOLID: i16 = 1;
pub const VOLUME_PAGES: i32 = 64;

/// Physical byte write at `offset` into the page body, for both undo
/// and redo.
pub const RV_WRITE: u16 = 1;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

pub fn cleanup(dir: &str) {
    let dir = std::path::Path::new(dir);
    if dir.exists() {
        std::fs::remove_dir_all(dir).unwrap();
    }
}

/// A small temporary store: 4 KiB pages, no background threads.
pub fn tmp_config() -> Config {
    Config::tmp()
        .unwrap()
        .page_size(PAGE)
        .log_page_size(PAGE)
        .dwb_flush_daemon(false)
        .dwb_file_sync_helper(false)
}

pub fn write_bytes(rcv: &mut Rcv<'_>) -> keel::Result<()> {
    if let Some(page) = rcv.page.as_deref_mut() {
        let at = PAGE_HEADER_SIZE + rcv.offset as usize;
        page[at..at + rcv.data.len()].copy_from_slice(rcv.data);
    }
    Ok(())
}

pub fn functions() -> RecoveryFunctions {
    let mut functions = RecoveryFunctions::new();
    functions.register(RV_WRITE, RecoveryFunction::new().undo(write_bytes).redo(write_bytes));
    functions
}

/// A fresh temporary config holding a copy of every file under
/// `config.path`, so the same on-disk state can be recovered twice.
pub fn copy_of(config: &Config) -> Config {
    fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
        std::fs::create_dir_all(to).unwrap();
        for entry in std::fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let target = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                copy_dir(&entry.path(), &target);
            } else {
                std::fs::copy(entry.path(), target).unwrap();
            }
        }
    }

    let copy = tmp_config()
        .page_size(config.page_size)
        .log_page_size(config.log_page_size);
    copy_dir(&config.path, &copy.path);
    copy
}

/// Everything a storage engine wires together, opened the way it
/// would be at restart.
pub struct Store {
    pub config: Config,
    pub volumes: Arc<FileVolumes>,
    pub dwb: Arc<DoubleWriteBuffer>,
    pub log: LogManager,
    pub meta: Meta,
    pub page_buffer: DwbPageBuffer,
}

impl Store {
    pub fn open(config: &Config) -> Store {
        let volumes = Arc::new(FileVolumes::open(&config.path, config.page_size).unwrap());
        if !volumes.has_volume(VOLID) {
            volumes.format(VOLID, VOLUME_PAGES).unwrap();
        }

        let dwb = Arc::new(DoubleWriteBuffer::open(config, volumes.clone()).unwrap());
        dwb.load_and_recover_pages().unwrap();

        let log = LogManager::open(config).unwrap();
        let meta = Meta::load_from_file(&log.meta_path()).unwrap();
        let page_buffer = DwbPageBuffer::new(volumes.clone(), dwb.clone());

        Store { config: config.clone(), volumes, dwb, log, meta, page_buffer }
    }

    pub fn recover(
        &mut self,
        functions: &RecoveryFunctions,
        options: RecoveryOptions,
    ) -> RecoveryOutcome {
        let env = RecoveryEnv {
            log: &self.log,
            meta: &mut self.meta,
            page_buffer: &self.page_buffer,
            functions,
        };
        keel::recover(env, options).unwrap()
    }

    pub fn begin(&self) -> Tdes {
        Tdes::new(self.log.assign_trid())
    }

    /// Logs and applies a physical write, the way a page change is
    /// made under write-ahead logging.
    pub fn write(&self, tdes: &mut Tdes, vpid: Vpid, offset: i32, after: &[u8]) -> Lsa {
        let mut page = self.page_buffer.fix(vpid).unwrap().unwrap();
        let at = PAGE_HEADER_SIZE + offset as usize;
        let before = page.data()[at..at + after.len()].to_vec();

        let body = RecordBody::UndoRedo {
            op: PageOp::new(RV_WRITE, vpid, offset),
            undo: before,
            redo: after.to_vec(),
        };
        let lsa = self.log.append_for(tdes, RecordType::UndoRedoData, &body).unwrap();
        page.data_mut()[at..at + after.len()].copy_from_slice(after);
        page.set_lsa(lsa);
        page.set_dirty();
        lsa
    }

    pub fn commit(&self, tdes: &mut Tdes, at_time: i64) -> Lsa {
        let lsa = self
            .log
            .append_for(tdes, RecordType::Commit, &RecordBody::Donetime { at_time })
            .unwrap();
        self.log.flush().unwrap();
        lsa
    }

    pub fn read(&self, vpid: Vpid, offset: i32, len: usize) -> Vec<u8> {
        let page = self.page_buffer.fix(vpid).unwrap().unwrap();
        let at = PAGE_HEADER_SIZE + offset as usize;
        page.data()[at..at + len].to_vec()
    }

    /// Makes the log durable and loses every page still cached.
    pub fn crash(self) -> Config {
        self.log.flush().unwrap();
        let Store { config, .. } = self;
        config
    }
}
