//! FUSE bridge: adapts the kernel's inode-based callbacks onto the
//! path-based capability set of [`MayakashiFs`].
//!
//! Inodes are interned on first sight (lookup/readdir) and map back to
//! display paths; all real semantics live in the core.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use tracing::info;

use mar_fs::{Attr, FileKind, FsError, MayakashiFs, OpenFlags};
use mar_index::normalize_key;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

pub fn mount(core: Arc<MayakashiFs>, mountpoint: &Path, extra_options: &[String]) -> anyhow::Result<()> {
    let mut options = vec![MountOption::FSName("mayakashi".to_string())];
    for opt in extra_options {
        if opt == "-o" {
            continue;
        }
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(MarFuse::new(core), mountpoint, &options)?;
    Ok(())
}

struct MarFuse {
    core: Arc<MayakashiFs>,
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
}

impl MarFuse {
    fn new(core: Arc<MayakashiFs>) -> Self {
        let mut fs = Self {
            core,
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: FUSE_ROOT_ID + 1,
        };
        fs.inode_to_path.insert(FUSE_ROOT_ID, "/".to_string());
        fs.path_to_inode.insert("/".to_string(), FUSE_ROOT_ID);
        fs
    }

    fn intern(&mut self, display_path: &str) -> u64 {
        let key = normalize_key(display_path);
        if let Some(&ino) = self.path_to_inode.get(&key) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(ino, display_path.to_string());
        self.path_to_inode.insert(key, ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_to_path.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str()?;
        if parent_path == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{parent_path}/{name}"))
        }
    }

    fn fuse_attr(ino: u64, attr: &Attr) -> FileAttr {
        let mtime = attr.modified.unwrap_or(UNIX_EPOCH);
        let kind = match attr.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::File => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: 1,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: 0o777,
            nlink: if attr.kind == FileKind::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE,
        }
    }
}

fn errno(err: &FsError) -> i32 {
    err.errno()
}

impl Filesystem for MarFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.getattr(&path) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&TTL, &Self::fuse_attr(ino, &attr), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::fuse_attr(ino, &attr)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(err) = self.core.truncate(&path, size, fh) {
                reply.error(errno(&err));
                return;
            }
        }
        match self.core.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::fuse_attr(ino, &attr)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.open(&path, OpenFlags::from_posix(flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self.core.read(&path, &mut buf, offset.max(0) as u64, fh) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.write(&path, data, offset.max(0) as u64, fh) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.create(&path, OpenFlags::from_posix(flags)) {
            Ok(fh) => match self.core.getattr(&path) {
                Ok(attr) => {
                    let ino = self.intern(&path);
                    reply.created(&TTL, &Self::fuse_attr(ino, &attr), 0, fh, 0);
                }
                Err(err) => reply.error(errno(&err)),
            },
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.mkdir(&path) {
            Ok(()) => {
                let ino = self.intern(&path);
                match self.core.getattr(&path) {
                    Ok(attr) => reply.entry(&TTL, &Self::fuse_attr(ino, &attr), 0),
                    Err(err) => reply.error(errno(&err)),
                }
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_path), Some(new_path)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.rename(&old_path, &new_path) {
            Ok(()) => {
                // keep the interned inode pointing at the file's new name
                if let Some(ino) = self.path_to_inode.remove(&normalize_key(&old_path)) {
                    self.inode_to_path.insert(ino, new_path.clone());
                    self.path_to_inode.insert(normalize_key(&new_path), ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.core.readdir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let (child_ino, kind) = match entry.name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => (FUSE_ROOT_ID, FileType::Directory),
                name => {
                    let child = if path == "/" {
                        format!("/{name}")
                    } else {
                        format!("{path}/{name}")
                    };
                    let kind = match entry.attr.map(|a| a.kind) {
                        Some(FileKind::Directory) => FileType::Directory,
                        _ => FileType::RegularFile,
                    };
                    (self.intern(&child), kind)
                }
            };
            if reply.add(child_ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = self.path_of(ino).unwrap_or_default();
        match self.core.release(&path, fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let st = self.core.statfs();
        reply.statfs(
            st.blocks,
            st.bfree,
            st.bavail,
            0,
            0,
            st.bsize,
            255,
            st.frsize,
        );
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.access(&path, mask as u32) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }
}
