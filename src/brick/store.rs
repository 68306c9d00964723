use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::{Errno, FopResult};
use crate::fop::*;
use crate::topology::types::SubvolId;

const DEFAULT_CAPACITY: u64 = 1 << 30;

/// One stored object: attributes, extended attributes, contents and held locks.
#[derive(Debug, Clone)]
pub struct Object {
    pub iatt: Iatt,
    pub xattrs: Xattrs,
    pub data: Vec<u8>,
    pub locks: Vec<Flock>,
}

impl Object {
    pub fn new(iatt: Iatt, xattrs: Xattrs) -> Self {
        Self {
            iatt,
            xattrs,
            data: Vec::new(),
            locks: Vec::new(),
        }
    }

    fn resize(&mut self, size: u64) {
        self.data.resize(size as usize, 0);
        self.iatt.size = size;
        self.iatt.blocks = size.div_ceil(512);
    }

    fn touch(&mut self) {
        let now = after(self.iatt.mtime.max(self.iatt.ctime));
        self.iatt.mtime = now;
        self.iatt.ctime = now;
    }

    fn touch_ctime(&mut self) {
        self.iatt.ctime = after(self.iatt.ctime);
    }
}

/// The current time, or one tick past `prev` if the clock has not moved on, so every
/// change is visible in the timestamps.
fn after(prev: Timespec) -> Timespec {
    let now = Timespec::now();
    if now > prev {
        return now;
    }
    match prev.nsec {
        999_999_999 => Timespec {
            sec: prev.sec + 1,
            nsec: 0,
        },
        nsec => Timespec {
            sec: prev.sec,
            nsec: nsec + 1,
        },
    }
}

/// In-memory namespace of a single subvolume.
///
/// Objects are keyed by absolute path in a `BTreeMap` so a directory's children are a
/// contiguous key range. The root directory always exists.
pub struct MemoryBrick {
    pub id: SubvolId,
    namespace: RwLock<BTreeMap<String, Object>>,
    capacity: std::sync::atomic::AtomicU64,
}

impl MemoryBrick {
    pub fn new(id: SubvolId) -> Self {
        let mut namespace = BTreeMap::new();
        namespace.insert(
            "/".to_string(),
            Object::new(Iatt::new(ROOT_GFID, IaType::Directory, 0o755), Xattrs::new()),
        );

        Self {
            id,
            namespace: RwLock::new(namespace),
            capacity: std::sync::atomic::AtomicU64::new(DEFAULT_CAPACITY),
        }
    }

    pub fn set_capacity(&self, bytes: u64) {
        self.capacity
            .store(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// A file may not grow past the brick's capacity.
    fn check_size(&self, end: Option<u64>) -> FopResult<u64> {
        let end = end.ok_or(Errno::EINVAL)?;
        if end > self.capacity() {
            return Err(Errno::EFBIG);
        }
        Ok(end)
    }

    pub async fn object(&self, path: &str) -> Option<Object> {
        self.namespace.read().await.get(path).cloned()
    }

    /// Places an object directly, bypassing parent checks.
    pub async fn insert(&self, path: &str, object: Object) {
        self.namespace
            .write()
            .await
            .insert(Loc::new(path).path, object);
    }

    pub async fn object_count(&self) -> usize {
        self.namespace.read().await.len()
    }

    pub async fn handle(&self, fop: Fop) -> FopResult<Reply> {
        tracing::trace!("{} {} {}", self.id, fop.name(), fop.loc());

        match fop {
            Fop::Lookup { loc } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                Ok(Reply::Entry {
                    iatt: obj.iatt.clone(),
                    xattrs: obj.xattrs.clone(),
                })
            }

            Fop::Stat { loc } | Fop::Open { loc, .. } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                Ok(Reply::Attr(obj.iatt.clone()))
            }

            Fop::Readv { loc, offset, size } => {
                let ns = self.namespace.read().await;
                let obj = file(&ns, &loc)?;
                let len = obj.data.len() as u64;
                let start = offset.min(len) as usize;
                let end = offset.saturating_add(size).min(len) as usize;
                Ok(Reply::Read {
                    data: obj.data[start..end].to_vec(),
                    iatt: obj.iatt.clone(),
                })
            }

            Fop::Writev { loc, offset, data } => {
                let end = self.check_size(offset.checked_add(data.len() as u64))?;
                let mut ns = self.namespace.write().await;
                let obj = file_mut(&mut ns, &loc)?;
                let pre = obj.iatt.clone();

                if end > obj.iatt.size {
                    obj.resize(end);
                }
                obj.data[offset as usize..end as usize].copy_from_slice(&data);
                obj.touch();

                Ok(Reply::PrePost {
                    pre,
                    post: obj.iatt.clone(),
                })
            }

            Fop::Flush { loc } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                Ok(Reply::Attr(obj.iatt.clone()))
            }

            Fop::Fsync { loc, .. } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                Ok(Reply::PrePost {
                    pre: obj.iatt.clone(),
                    post: obj.iatt.clone(),
                })
            }

            Fop::Access { loc, mask } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                let owner = (obj.iatt.mode >> 6) & 0o7;
                if mask & 0o7 & !owner != 0 {
                    return Err(Errno::EACCES);
                }
                Ok(Reply::Attr(obj.iatt.clone()))
            }

            Fop::Lk { loc, lock } => {
                let mut ns = self.namespace.write().await;
                let obj = ns.get_mut(&loc.path).ok_or(Errno::ENOENT)?;

                if lock.kind == LockKind::Unlock {
                    obj.locks
                        .retain(|held| held.owner != lock.owner || !overlaps(held, &lock));
                    return Ok(Reply::Lock {
                        lock,
                        iatt: obj.iatt.clone(),
                    });
                }

                let conflict = obj.locks.iter().any(|held| {
                    held.owner != lock.owner
                        && overlaps(held, &lock)
                        && (held.kind == LockKind::Write || lock.kind == LockKind::Write)
                });
                if conflict {
                    return Err(Errno::EAGAIN);
                }
                obj.locks.push(lock.clone());
                Ok(Reply::Lock {
                    lock,
                    iatt: obj.iatt.clone(),
                })
            }

            Fop::Truncate { loc, size } => {
                let size = self.check_size(Some(size))?;
                let mut ns = self.namespace.write().await;
                let obj = file_mut(&mut ns, &loc)?;
                let pre = obj.iatt.clone();
                obj.resize(size);
                obj.touch();
                Ok(Reply::PrePost {
                    pre,
                    post: obj.iatt.clone(),
                })
            }

            Fop::Setattr { loc, attr } => {
                let mut ns = self.namespace.write().await;
                let obj = ns.get_mut(&loc.path).ok_or(Errno::ENOENT)?;
                if let Some(expect) = &attr.expect
                    && !expect.matches(&obj.iatt)
                {
                    return Err(Errno::EAGAIN);
                }
                let pre = obj.iatt.clone();

                if let Some(mode) = attr.mode {
                    obj.iatt.mode = mode & PERM_MASK;
                }
                if let Some(uid) = attr.uid {
                    obj.iatt.uid = uid;
                }
                if let Some(gid) = attr.gid {
                    obj.iatt.gid = gid;
                }
                if let Some(atime) = attr.atime {
                    obj.iatt.atime = atime;
                }
                if let Some(mtime) = attr.mtime {
                    obj.iatt.mtime = mtime;
                }
                obj.touch_ctime();

                Ok(Reply::PrePost {
                    pre,
                    post: obj.iatt.clone(),
                })
            }

            Fop::Getxattr { loc, name } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                let xattrs = match name {
                    Some(name) => {
                        let value = obj.xattrs.get(&name).ok_or(Errno::ENODATA)?;
                        Xattrs::from([(name, value.clone())])
                    }
                    None => obj.xattrs.clone(),
                };
                Ok(Reply::Entry {
                    iatt: obj.iatt.clone(),
                    xattrs,
                })
            }

            Fop::Setxattr { loc, xattrs, flags } => {
                let mut ns = self.namespace.write().await;
                let obj = ns.get_mut(&loc.path).ok_or(Errno::ENOENT)?;
                for key in xattrs.keys() {
                    match flags {
                        XattrFlags::Create if obj.xattrs.contains_key(key) => {
                            return Err(Errno::EEXIST);
                        }
                        XattrFlags::Replace if !obj.xattrs.contains_key(key) => {
                            return Err(Errno::ENODATA);
                        }
                        _ => {}
                    }
                }
                obj.xattrs.extend(xattrs);
                obj.touch_ctime();
                Ok(Reply::Attr(obj.iatt.clone()))
            }

            Fop::Removexattr { loc, name } => {
                let mut ns = self.namespace.write().await;
                let obj = ns.get_mut(&loc.path).ok_or(Errno::ENOENT)?;
                obj.xattrs.remove(&name).ok_or(Errno::ENODATA)?;
                obj.touch_ctime();
                Ok(Reply::Attr(obj.iatt.clone()))
            }

            Fop::Mkdir {
                loc,
                mode,
                gfid,
                xattrs,
            } => self.make(loc, IaType::Directory, mode, gfid, xattrs).await,

            Fop::Create {
                loc,
                mode,
                gfid,
                xattrs,
            } => self.make(loc, IaType::Regular, mode, gfid, xattrs).await,

            Fop::Unlink { loc } => {
                let mut ns = self.namespace.write().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                if obj.iatt.is_dir() {
                    return Err(Errno::EISDIR);
                }
                ns.remove(&loc.path);
                Ok(Reply::Empty)
            }

            Fop::Rmdir { loc } => {
                let mut ns = self.namespace.write().await;
                if loc.is_root() {
                    return Err(Errno::EPERM);
                }
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                if !obj.iatt.is_dir() {
                    return Err(Errno::ENOTDIR);
                }
                if has_children(&ns, &loc) {
                    return Err(Errno::ENOTEMPTY);
                }
                ns.remove(&loc.path);
                Ok(Reply::Empty)
            }

            Fop::Rename { old, new } => {
                let mut ns = self.namespace.write().await;
                rename(&mut ns, &old, &new)
            }

            Fop::Readdir { loc } => {
                let ns = self.namespace.read().await;
                let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
                if !obj.iatt.is_dir() {
                    return Err(Errno::ENOTDIR);
                }
                let skip = child_prefix(&loc).len();
                let entries = children(&ns, &loc)
                    .filter(|(path, _)| !path[skip..].contains('/'))
                    .map(|(path, obj)| DirEntry {
                        name: path[skip..].to_string(),
                        iatt: obj.iatt.clone(),
                    })
                    .collect();
                Ok(Reply::Entries(entries))
            }

            Fop::Statfs { .. } => {
                let ns = self.namespace.read().await;
                let used: u64 = ns.values().map(|o| o.data.len() as u64).sum();
                let total = self.capacity();
                let free = total.saturating_sub(used);
                Ok(Reply::Statfs(Statvfs {
                    total_bytes: total,
                    free_bytes: free,
                    avail_bytes: free,
                    files: ns.len() as u64,
                    files_free: u64::MAX - ns.len() as u64,
                }))
            }
        }
    }

    async fn make(
        &self,
        loc: Loc,
        ia_type: IaType,
        mode: u32,
        gfid: uuid::Uuid,
        xattrs: Xattrs,
    ) -> FopResult<Reply> {
        let mut ns = self.namespace.write().await;
        if ns.contains_key(&loc.path) {
            return Err(Errno::EEXIST);
        }
        check_parent(&ns, &loc)?;

        let object = Object::new(Iatt::new(gfid, ia_type, mode), xattrs);
        let reply = Reply::Entry {
            iatt: object.iatt.clone(),
            xattrs: object.xattrs.clone(),
        };
        ns.insert(loc.path, object);
        Ok(reply)
    }
}

fn file<'a>(ns: &'a BTreeMap<String, Object>, loc: &Loc) -> FopResult<&'a Object> {
    let obj = ns.get(&loc.path).ok_or(Errno::ENOENT)?;
    if obj.iatt.is_dir() {
        return Err(Errno::EISDIR);
    }
    Ok(obj)
}

fn file_mut<'a>(ns: &'a mut BTreeMap<String, Object>, loc: &Loc) -> FopResult<&'a mut Object> {
    let obj = ns.get_mut(&loc.path).ok_or(Errno::ENOENT)?;
    if obj.iatt.is_dir() {
        return Err(Errno::EISDIR);
    }
    Ok(obj)
}

fn check_parent(ns: &BTreeMap<String, Object>, loc: &Loc) -> FopResult<()> {
    let parent = loc.parent().ok_or(Errno::EEXIST)?;
    match ns.get(&parent.path) {
        Some(obj) if obj.iatt.is_dir() => Ok(()),
        Some(_) => Err(Errno::ENOTDIR),
        None => Err(Errno::ENOENT),
    }
}

fn child_prefix(loc: &Loc) -> String {
    if loc.is_root() {
        "/".to_string()
    } else {
        format!("{}/", loc.path)
    }
}

/// Every descendant of `loc`, in key order.
fn children<'a>(
    ns: &'a BTreeMap<String, Object>,
    loc: &Loc,
) -> impl Iterator<Item = (&'a String, &'a Object)> {
    let prefix = child_prefix(loc);
    ns.range(prefix.clone()..)
        .take_while(move |(path, _)| path.starts_with(&prefix))
        .filter(|(path, _)| path.as_str() != "/")
}

fn has_children(ns: &BTreeMap<String, Object>, loc: &Loc) -> bool {
    children(ns, loc).next().is_some()
}

fn overlaps(a: &Flock, b: &Flock) -> bool {
    let end = |l: &Flock| {
        if l.len == 0 {
            u64::MAX
        } else {
            l.start.saturating_add(l.len)
        }
    };
    a.start < end(b) && b.start < end(a)
}

fn rename(ns: &mut BTreeMap<String, Object>, old: &Loc, new: &Loc) -> FopResult<Reply> {
    let source = ns.get(&old.path).ok_or(Errno::ENOENT)?;
    let moving_dir = source.iatt.is_dir();

    if old == new {
        return Ok(Reply::Attr(source.iatt.clone()));
    }
    if old.is_root() || new.path.starts_with(&child_prefix(old)) {
        return Err(Errno::EINVAL);
    }
    check_parent(ns, new)?;

    if let Some(existing) = ns.get(&new.path) {
        match (moving_dir, existing.iatt.is_dir()) {
            (true, false) => return Err(Errno::ENOTDIR),
            (false, true) => return Err(Errno::EISDIR),
            (true, true) if has_children(ns, new) => return Err(Errno::ENOTEMPTY),
            _ => {}
        }
        ns.remove(&new.path);
    }

    let mut moved = Vec::new();
    if moving_dir {
        let old_prefix = child_prefix(old);
        let descendants: Vec<String> = children(ns, old).map(|(path, _)| path.clone()).collect();
        for path in descendants {
            if let Some(obj) = ns.remove(&path) {
                let suffix = &path[old_prefix.len()..];
                moved.push((format!("{}/{}", new.path, suffix), obj));
            }
        }
    }

    let mut object = ns.remove(&old.path).ok_or(Errno::ENOENT)?;
    object.iatt.ctime = Timespec::now();
    let iatt = object.iatt.clone();
    ns.insert(new.path.clone(), object);
    ns.extend(moved);

    Ok(Reply::Attr(iatt))
}
