#![forbid(unsafe_code)]
//! A synthetic (sysfs-style) [`ninep::srv::Filesystem`] backend.
//!
//! Nodes live in a flat arena (`Vec<Entry>`, referenced by `u32` index)
//! rather than a pointer graph, per the design document's note that an
//! arena-and-index approach "removes the pointer-cycle headache and
//! works well with the fixed-capacity allocators" this project assumes.
//! A removed node's slot is pushed onto a free list and its index may
//! be reissued to an unrelated later file, matching the protocol's qid
//! invariant that a `path` value may be reused once the file it named
//! has been removed.
//!
//! Leaf files are backed by an application-supplied [`SyntheticFile`]
//! callback — the sysfs pattern of a per-file read/write/clunk hook —
//! or by the bundled [`RamFile`] for plain in-memory storage. Files and
//! directories created at runtime via `Tcreate` are always `RamFile`s;
//! callback-backed files can only be registered ahead of time through
//! [`SysFsBuilder`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ninep::error::{Error, ProtoKind};
use ninep::fcall::{QId, QIdType, Stat, dm};
use ninep::fcall::om;
use ninep::srv::Filesystem;
use ninep::Result;

/// A per-file callback hook, the sysfs half of this backend. The
/// dispatcher never sees this trait directly; [`SysFs`] adapts it to
/// [`Filesystem`]'s node-oriented calls.
pub trait SyntheticFile: Send + Sync {
    fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<u32>;
    /// Called when every fid referencing this node has been clunked.
    fn clunk(&self) -> Result<()> {
        Ok(())
    }
}

/// A plain in-memory file: `read`/`write` operate directly on a
/// `Vec<u8>`, growing it on out-of-bounds writes. Used for files
/// created at runtime and as the default leaf type for tests/demos.
pub struct RamFile(Mutex<Vec<u8>>);

impl RamFile {
    pub fn new(initial: Vec<u8>) -> Arc<RamFile> {
        Arc::new(RamFile(Mutex::new(initial)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SyntheticFile for RamFile {
    fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let data = self.0.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(count as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<u32> {
        let mut data = self.0.lock().unwrap();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len() as u32)
    }
}

enum Entry {
    Dir {
        name: String,
        parent: Option<u32>,
        children: Vec<u32>,
        mode: u32,
    },
    File {
        name: String,
        parent: u32,
        handler: Arc<dyn SyntheticFile>,
        mode: u32,
        version: u32,
    },
    Removed,
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Dir { name, .. } => name,
            Entry::File { name, .. } => name,
            Entry::Removed => unreachable!("removed entry accessed"),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir { .. })
    }

    fn mode_bits(&self) -> u32 {
        match self {
            Entry::Dir { mode, .. } => dm::DIR | mode,
            Entry::File { mode, .. } => *mode,
            Entry::Removed => 0,
        }
    }

    fn version(&self) -> u32 {
        match self {
            Entry::File { version, .. } => *version,
            _ => 0,
        }
    }
}

/// The synthetic backend itself: an arena of directories and
/// callback/RAM-backed files, usable directly as a
/// [`ninep::srv::Filesystem`] or mounted into a
/// [`ninep::union::Union`] alongside other backends.
pub struct SysFs {
    arena: Mutex<Vec<Entry>>,
    free: Mutex<Vec<u32>>,
}

fn stat_of(entry: &Entry, path: u32) -> Stat {
    let typ = if entry.is_dir() { QIdType::DIR } else { QIdType::FILE };
    let length = 0; // directories report 0; file length is read on demand by callers that need it
    Stat {
        typ: 0,
        dev: 0,
        qid: QId {
            typ,
            version: entry.version(),
            path: path as u64,
        },
        mode: entry.mode_bits(),
        atime: 0,
        mtime: 0,
        length,
        name: entry.name().to_owned(),
        uid: String::new(),
        gid: String::new(),
        muid: String::new(),
    }
}

impl SysFs {
    /// An empty tree with just a root directory. Prefer [`SysFsBuilder`]
    /// to populate a tree before serving it.
    pub fn new() -> SysFs {
        SysFs {
            arena: Mutex::new(vec![Entry::Dir {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                mode: 0o555,
            }]),
            free: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, entry: Entry) -> u32 {
        let mut arena = self.arena.lock().unwrap();
        if let Some(idx) = self.free.lock().unwrap().pop() {
            arena[idx as usize] = entry;
            idx
        } else {
            arena.push(entry);
            (arena.len() - 1) as u32
        }
    }
}

impl Default for SysFs {
    fn default() -> SysFs {
        SysFs::new()
    }
}

/// Builds a [`SysFs`] tree before it is handed to the dispatcher.
#[derive(Default)]
pub struct SysFsBuilder {
    fs: SysFs,
}

impl SysFsBuilder {
    pub fn new() -> SysFsBuilder {
        SysFsBuilder { fs: SysFs::new() }
    }

    pub const ROOT: u32 = 0;

    /// Add a subdirectory under `parent`, returning its node index.
    pub fn dir(&mut self, parent: u32, name: &str) -> u32 {
        let idx = self.fs.insert(Entry::Dir {
            name: name.to_owned(),
            parent: Some(parent),
            children: Vec::new(),
            mode: 0o555,
        });
        self.add_child(parent, idx);
        idx
    }

    /// Add a callback-backed file under `parent`.
    pub fn file(&mut self, parent: u32, name: &str, mode: u32, handler: Arc<dyn SyntheticFile>) -> u32 {
        let idx = self.fs.insert(Entry::File {
            name: name.to_owned(),
            parent,
            handler,
            mode,
            version: 0,
        });
        self.add_child(parent, idx);
        idx
    }

    /// Convenience for a plain in-memory file.
    pub fn ram_file(&mut self, parent: u32, name: &str, mode: u32, contents: Vec<u8>) -> u32 {
        self.file(parent, name, mode, RamFile::new(contents))
    }

    fn add_child(&mut self, parent: u32, child: u32) {
        let mut arena = self.fs.arena.lock().unwrap();
        match &mut arena[parent as usize] {
            Entry::Dir { children, .. } => children.push(child),
            _ => panic!("ninep-sysfs: parent node {parent} is not a directory"),
        }
    }

    pub fn build(self) -> SysFs {
        self.fs
    }
}

#[async_trait]
impl Filesystem for SysFs {
    type Node = u32;

    fn get_root(&self) -> Self::Node {
        0
    }

    fn node_qid(&self, node: &Self::Node) -> QId {
        let arena = self.arena.lock().unwrap();
        let entry = &arena[*node as usize];
        let typ = if entry.is_dir() { QIdType::DIR } else { QIdType::FILE };
        QId {
            typ,
            version: entry.version(),
            path: *node as u64,
        }
    }

    async fn walk(&self, parent: &Self::Node, name: &str) -> Option<Self::Node> {
        let arena = self.arena.lock().unwrap();
        match &arena[*parent as usize] {
            Entry::Dir { children, .. } => children
                .iter()
                .find(|&&c| arena[c as usize].name() == name)
                .copied(),
            _ => None,
        }
    }

    async fn open(&self, node: &Self::Node, mode: u8) -> Result<()> {
        let arena = self.arena.lock().unwrap();
        let entry = &arena[*node as usize];
        let wants_write = matches!(mode & 0x3, om::WRITE | om::RDWR) || mode & om::TRUNC != 0;
        if wants_write && entry.mode_bits() & dm::WRITE == 0 {
            return Err(Error::backend("permission denied"));
        }
        Ok(())
    }

    async fn read(&self, node: &Self::Node, offset: u64, count: u32, _uname: &str) -> Result<Vec<u8>> {
        let (is_dir, children, handler) = {
            let arena = self.arena.lock().unwrap();
            match &arena[*node as usize] {
                Entry::Dir { children, .. } => (true, children.clone(), None),
                Entry::File { handler, .. } => (false, Vec::new(), Some(handler.clone())),
                Entry::Removed => return Err(Error::proto(ProtoKind::UnknownFid)),
            }
        };

        if !is_dir {
            return handler.unwrap().read(offset, count);
        }

        let records: Vec<Vec<u8>> = {
            let arena = self.arena.lock().unwrap();
            children
                .iter()
                .map(|&c| {
                    let mut buf = Vec::new();
                    let stat = stat_of(&arena[c as usize], c);
                    let _ = ninep::serialize::Encodable::encode(&stat, &mut buf);
                    buf
                })
                .collect()
        };

        let mut skip = offset;
        let mut remaining = count as usize;
        let mut out = Vec::new();
        for rec in records {
            let len = rec.len() as u64;
            if skip >= len {
                skip -= len;
                continue;
            }
            if skip > 0 {
                // offset falls mid-record: never split a stat record.
                break;
            }
            if rec.len() > remaining {
                break;
            }
            remaining -= rec.len();
            out.extend(rec);
        }
        Ok(out)
    }

    async fn write(&self, node: &Self::Node, offset: u64, data: &[u8], _uname: &str) -> Result<u32> {
        let handler = {
            let mut arena = self.arena.lock().unwrap();
            match &mut arena[*node as usize] {
                Entry::Dir { .. } => return Err(Error::backend("is a directory")),
                Entry::File { handler, version, .. } => {
                    *version = version.wrapping_add(1);
                    handler.clone()
                }
                Entry::Removed => return Err(Error::proto(ProtoKind::UnknownFid)),
            }
        };
        handler.write(offset, data)
    }

    async fn stat(&self, node: &Self::Node) -> Result<Stat> {
        let arena = self.arena.lock().unwrap();
        Ok(stat_of(&arena[*node as usize], *node))
    }

    async fn create(
        &self,
        parent: &Self::Node,
        name: &str,
        perm: u32,
        _mode: u8,
        _uname: &str,
    ) -> Result<Self::Node> {
        {
            let arena = self.arena.lock().unwrap();
            if !arena[*parent as usize].is_dir() {
                return Err(Error::backend("not a directory"));
            }
        }
        let child = if perm & dm::DIR != 0 {
            self.insert(Entry::Dir {
                name: name.to_owned(),
                parent: Some(*parent),
                children: Vec::new(),
                mode: perm & 0o777,
            })
        } else {
            self.insert(Entry::File {
                name: name.to_owned(),
                parent: *parent,
                handler: RamFile::new(Vec::new()),
                mode: perm & 0o777,
                version: 0,
            })
        };
        let mut arena = self.arena.lock().unwrap();
        match &mut arena[*parent as usize] {
            Entry::Dir { children, .. } => children.push(child),
            _ => unreachable!(),
        }
        Ok(child)
    }

    async fn remove(&self, node: &Self::Node) -> Result<()> {
        let (parent, handler) = {
            let arena = self.arena.lock().unwrap();
            match &arena[*node as usize] {
                Entry::Dir { parent, children, .. } => {
                    if !children.is_empty() {
                        return Err(Error::backend("directory not empty"));
                    }
                    (*parent, None)
                }
                Entry::File { parent, handler, .. } => (Some(*parent), Some(handler.clone())),
                Entry::Removed => return Err(Error::proto(ProtoKind::UnknownFid)),
            }
        };
        if let Some(h) = handler {
            h.clunk()?;
        }
        if let Some(parent) = parent {
            let mut arena = self.arena.lock().unwrap();
            if let Entry::Dir { children, .. } = &mut arena[parent as usize] {
                children.retain(|&c| c != *node);
            }
        }
        let mut arena = self.arena.lock().unwrap();
        arena[*node as usize] = Entry::Removed;
        self.free.lock().unwrap().push(*node);
        Ok(())
    }

    async fn clunk(&self, node: &Self::Node) -> Result<()> {
        let handler = {
            let arena = self.arena.lock().unwrap();
            match &arena[*node as usize] {
                Entry::File { handler, .. } => Some(handler.clone()),
                _ => None,
            }
        };
        match handler {
            Some(h) => h.clunk(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walk_finds_registered_children() {
        let mut b = SysFsBuilder::new();
        let dir = b.dir(SysFsBuilder::ROOT, "etc");
        b.ram_file(dir, "motd", 0o644, b"hello\n".to_vec());
        let fs = b.build();

        let root = fs.get_root();
        let etc = fs.walk(&root, "etc").await.unwrap();
        let motd = fs.walk(&etc, "motd").await.unwrap();
        assert_eq!(fs.read(&motd, 0, 64, "glenda").await.unwrap(), b"hello\n");
        assert!(fs.walk(&root, "missing").await.is_none());
    }

    #[tokio::test]
    async fn directory_read_never_splits_a_stat_record() {
        let mut b = SysFsBuilder::new();
        b.ram_file(SysFsBuilder::ROOT, "a", 0o644, vec![1, 2, 3]);
        b.ram_file(SysFsBuilder::ROOT, "bb", 0o644, vec![4, 5]);
        let fs = b.build();
        let root = fs.get_root();

        let whole = fs.read(&root, 0, 4096, "glenda").await.unwrap();
        let first_len = {
            let a_stat = fs.stat(&fs.walk(&root, "a").await.unwrap()).await.unwrap();
            let mut buf = Vec::new();
            ninep::serialize::Encodable::encode(&a_stat, &mut buf).unwrap();
            buf.len()
        };

        // Asking for fewer bytes than the second record needs must
        // return only the first, never a truncated second record.
        let partial = fs.read(&root, 0, (first_len + 1) as u32, "glenda").await.unwrap();
        assert_eq!(partial.len(), first_len);
        assert!(whole.len() > first_len);
    }

    #[tokio::test]
    async fn create_and_remove_lifecycle() {
        let fs = SysFs::new();
        let root = fs.get_root();
        let node = fs
            .create(&root, "new.txt", 0o644, om::RDWR, "glenda")
            .await
            .unwrap();
        fs.write(&node, 0, b"data", "glenda").await.unwrap();
        assert_eq!(fs.read(&node, 0, 16, "glenda").await.unwrap(), b"data");

        fs.remove(&node).await.unwrap();
        assert!(fs.walk(&root, "new.txt").await.is_none());
    }

    #[tokio::test]
    async fn removed_path_is_reissued() {
        let fs = SysFs::new();
        let root = fs.get_root();
        let first = fs.create(&root, "tmp", 0o644, om::RDWR, "glenda").await.unwrap();
        fs.remove(&first).await.unwrap();
        let second = fs.create(&root, "tmp2", 0o644, om::RDWR, "glenda").await.unwrap();
        assert_eq!(first, second, "freed arena slot should be reused");
    }

    #[tokio::test]
    async fn clunk_invokes_callback_hook() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct TrackedFile(Arc<AtomicBool>);
        impl SyntheticFile for TrackedFile {
            fn read(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn write(&self, _offset: u64, data: &[u8]) -> Result<u32> {
                Ok(data.len() as u32)
            }
            fn clunk(&self) -> Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let clunked = Arc::new(AtomicBool::new(false));
        let mut b = SysFsBuilder::new();
        b.file(SysFsBuilder::ROOT, "ctl", 0o644, Arc::new(TrackedFile(clunked.clone())));
        let fs = b.build();

        let node = fs.walk(&fs.get_root(), "ctl").await.unwrap();
        fs.clunk(&node).await.unwrap();
        assert!(clunked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_permission_denied_on_read_only_file() {
        let mut b = SysFsBuilder::new();
        b.ram_file(SysFsBuilder::ROOT, "ro", 0o444, b"x".to_vec());
        let fs = b.build();
        let node = fs.walk(&fs.get_root(), "ro").await.unwrap();
        assert!(fs.open(&node, om::WRITE).await.is_err());
        assert!(fs.open(&node, om::READ).await.is_ok());
    }
}
