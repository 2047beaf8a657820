use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fault_injection::{annotate, fallible, maybe};
use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::Vpid;

/// Fixed-size page I/O against the data volumes.
pub trait Volumes: Send + Sync {
    fn page_size(&self) -> usize;

    /// Creates (or extends) a volume so that it holds `num_pages` pages.
    fn format(&self, volid: i16, num_pages: i32) -> io::Result<()>;

    fn has_volume(&self, volid: i16) -> bool;

    fn num_pages(&self, volid: i16) -> io::Result<i32>;

    fn read_page(&self, vpid: Vpid, buf: &mut [u8]) -> io::Result<()>;

    fn write_page(&self, vpid: Vpid, buf: &[u8]) -> io::Result<()>;

    fn sync(&self, volid: i16) -> io::Result<()>;
}

#[cfg(unix)]
pub(crate) mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use super::*;

    pub fn read_exact_at<F: FileExt>(
        file: &F,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub fn write_all_at<F: FileExt>(
        file: &F,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

#[cfg(windows)]
pub(crate) mod sys_io {
    use std::os::windows::fs::FileExt;

    use super::*;

    pub fn read_exact_at<F: FileExt>(
        file: &F,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_read(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        if !buf.is_empty() {
            Err(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer"
            )))
        } else {
            Ok(())
        }
    }

    pub fn write_all_at<F: FileExt>(
        file: &F,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_write(buf, offset)) {
                Ok(0) => {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }
}

fn volume_path(directory: &Path, volid: i16) -> PathBuf {
    directory.join(format!("vol_{:05}", volid))
}

/// One file per volume under a common directory.
#[derive(Debug)]
pub struct FileVolumes {
    directory: PathBuf,
    page_size: usize,
    files: RwLock<FnvHashMap<i16, Arc<fs::File>>>,
}

impl FileVolumes {
    pub fn open<P: AsRef<Path>>(
        directory: P,
        page_size: usize,
    ) -> io::Result<FileVolumes> {
        let directory = directory.as_ref().to_path_buf();
        if let Err(e) = fs::read_dir(&directory) {
            if e.kind() == io::ErrorKind::NotFound {
                fallible!(fs::create_dir_all(&directory));
            }
        }

        Ok(FileVolumes { directory, page_size, files: Default::default() })
    }

    fn file(&self, volid: i16) -> io::Result<Arc<fs::File>> {
        if let Some(file) = self.files.read().get(&volid) {
            return Ok(file.clone());
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(&volid) {
            return Ok(file.clone());
        }

        let path = volume_path(&self.directory, volid);
        let file = match maybe!(
            fs::OpenOptions::new().read(true).write(true).open(&path)
        ) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(annotate!(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("volume {} is not mounted", volid),
                )));
            }
            Err(e) => return Err(e),
        };

        let file = Arc::new(file);
        files.insert(volid, file.clone());
        Ok(file)
    }
}

impl Volumes for FileVolumes {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn format(&self, volid: i16, num_pages: i32) -> io::Result<()> {
        let path = volume_path(&self.directory, volid);
        let file = fallible!(
            fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
        );

        let wanted = num_pages.max(0) as u64 * self.page_size as u64;
        let current = fallible!(file.metadata()).len();
        if current < wanted {
            fallible!(file.set_len(wanted));
        }
        fallible!(file.sync_all());

        log::debug!("formatted volume {} with {} pages", volid, num_pages);

        self.files.write().insert(volid, Arc::new(file));
        Ok(())
    }

    fn has_volume(&self, volid: i16) -> bool {
        self.files.read().contains_key(&volid)
            || volume_path(&self.directory, volid).exists()
    }

    fn num_pages(&self, volid: i16) -> io::Result<i32> {
        let file = self.file(volid)?;
        let len = fallible!(file.metadata()).len();
        Ok((len / self.page_size as u64) as i32)
    }

    fn read_page(&self, vpid: Vpid, buf: &mut [u8]) -> io::Result<()> {
        assert_eq!(buf.len(), self.page_size);
        let file = self.file(vpid.volid)?;
        let offset = vpid.pageid as u64 * self.page_size as u64;
        sys_io::read_exact_at(&*file, buf, offset)
    }

    fn write_page(&self, vpid: Vpid, buf: &[u8]) -> io::Result<()> {
        assert_eq!(buf.len(), self.page_size);
        let file = self.file(vpid.volid)?;
        let offset = vpid.pageid as u64 * self.page_size as u64;
        sys_io::write_all_at(&*file, buf, offset)
    }

    fn sync(&self, volid: i16) -> io::Result<()> {
        let file = self.file(volid)?;
        fallible!(file.sync_all());
        Ok(())
    }
}
