//! The union/synthetic filesystem composer (§4.9): longest-prefix-match
//! routing of namespace operations across registered backend mounts,
//! presented to the dispatcher as a single [`Filesystem`].
//!
//! Each backend has its own node type, so mounts are stored behind a
//! small type-erased [`ErasedBackend`] trait (downcasting through
//! `dyn Any`) rather than the fixed array of tagged pointers the
//! design document's source used (§9: "production implementations
//! should prefer typed node handles that embed the owner tag... or a
//! hash map keyed on node identity" — this crate's version of that is
//! the `mount` index baked into every [`UnionNode::Mounted`] it hands
//! out).

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::fcall::{QId, QIdType, Stat};
use crate::srv::Filesystem;
use crate::utils::Result;

/// Object-safe facade over one [`Filesystem`] backend, with its
/// associated node type erased behind `dyn Any`.
#[async_trait]
trait ErasedBackend: Send + Sync {
    fn get_root(&self) -> Arc<dyn Any + Send + Sync>;
    fn node_qid(&self, node: &(dyn Any + Send + Sync)) -> QId;
    async fn walk(
        &self,
        parent: &(dyn Any + Send + Sync),
        name: &str,
    ) -> Option<Arc<dyn Any + Send + Sync>>;
    async fn open(&self, node: &(dyn Any + Send + Sync), mode: u8) -> Result<()>;
    async fn read(
        &self,
        node: &(dyn Any + Send + Sync),
        offset: u64,
        count: u32,
        uname: &str,
    ) -> Result<Vec<u8>>;
    async fn write(
        &self,
        node: &(dyn Any + Send + Sync),
        offset: u64,
        data: &[u8],
        uname: &str,
    ) -> Result<u32>;
    async fn stat(&self, node: &(dyn Any + Send + Sync)) -> Result<Stat>;
    async fn create(
        &self,
        parent: &(dyn Any + Send + Sync),
        name: &str,
        perm: u32,
        mode: u8,
        uname: &str,
    ) -> Result<Arc<dyn Any + Send + Sync>>;
    async fn remove(&self, node: &(dyn Any + Send + Sync)) -> Result<()>;
    async fn clunk(&self, node: &(dyn Any + Send + Sync)) -> Result<()>;
}

struct Adapter<Fs: Filesystem>(Arc<Fs>);

fn downcast<N: 'static>(node: &(dyn Any + Send + Sync)) -> &N {
    node.downcast_ref::<N>()
        .expect("union composer: node handed back to the wrong mount")
}

#[async_trait]
impl<Fs: 'static + Filesystem> ErasedBackend for Adapter<Fs>
where
    Fs::Node: 'static,
{
    fn get_root(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(self.0.get_root())
    }

    fn node_qid(&self, node: &(dyn Any + Send + Sync)) -> QId {
        self.0.node_qid(downcast::<Fs::Node>(node))
    }

    async fn walk(
        &self,
        parent: &(dyn Any + Send + Sync),
        name: &str,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let child = self.0.walk(downcast::<Fs::Node>(parent), name).await?;
        Some(Arc::new(child))
    }

    async fn open(&self, node: &(dyn Any + Send + Sync), mode: u8) -> Result<()> {
        self.0.open(downcast::<Fs::Node>(node), mode).await
    }

    async fn read(
        &self,
        node: &(dyn Any + Send + Sync),
        offset: u64,
        count: u32,
        uname: &str,
    ) -> Result<Vec<u8>> {
        self.0.read(downcast::<Fs::Node>(node), offset, count, uname).await
    }

    async fn write(
        &self,
        node: &(dyn Any + Send + Sync),
        offset: u64,
        data: &[u8],
        uname: &str,
    ) -> Result<u32> {
        self.0.write(downcast::<Fs::Node>(node), offset, data, uname).await
    }

    async fn stat(&self, node: &(dyn Any + Send + Sync)) -> Result<Stat> {
        self.0.stat(downcast::<Fs::Node>(node)).await
    }

    async fn create(
        &self,
        parent: &(dyn Any + Send + Sync),
        name: &str,
        perm: u32,
        mode: u8,
        uname: &str,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        let node = self
            .0
            .create(downcast::<Fs::Node>(parent), name, perm, mode, uname)
            .await?;
        Ok(Arc::new(node))
    }

    async fn remove(&self, node: &(dyn Any + Send + Sync)) -> Result<()> {
        self.0.remove(downcast::<Fs::Node>(node)).await
    }

    async fn clunk(&self, node: &(dyn Any + Send + Sync)) -> Result<()> {
        self.0.clunk(downcast::<Fs::Node>(node)).await
    }
}

struct Mount {
    /// Path segments, e.g. `["usr", "bin"]` for `/usr/bin`; empty for `/`.
    path: Vec<String>,
    backend: Arc<dyn ErasedBackend>,
}

/// A node handed out by the composer: either a synthetic directory at
/// some path prefix that hasn't reached a mount point yet, or a node
/// owned by the mount at `mount`.
pub enum UnionNode {
    Synthetic(Vec<String>),
    Mounted {
        mount: usize,
        node: Arc<dyn Any + Send + Sync>,
    },
}

impl Clone for UnionNode {
    fn clone(&self) -> UnionNode {
        match self {
            UnionNode::Synthetic(prefix) => UnionNode::Synthetic(prefix.clone()),
            UnionNode::Mounted { mount, node } => UnionNode::Mounted {
                mount: *mount,
                node: node.clone(),
            },
        }
    }
}

/// The composer itself. Build with [`Union::builder`], register mounts,
/// then use the result as any other [`Filesystem`].
pub struct Union {
    mounts: Vec<Mount>,
    root_mount: Option<usize>,
}

#[derive(Default)]
pub struct UnionBuilder {
    mounts: Vec<Mount>,
}

impl UnionBuilder {
    pub fn new() -> UnionBuilder {
        UnionBuilder { mounts: Vec::new() }
    }

    /// Register `backend` at `path` (e.g. `"/"`, `"/usr/bin"`).
    pub fn mount<Fs: 'static + Filesystem>(mut self, path: &str, backend: Arc<Fs>) -> UnionBuilder
    where
        Fs::Node: 'static,
    {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_owned())
            .collect();
        self.mounts.push(Mount {
            path: segments,
            backend: Arc::new(Adapter(backend)),
        });
        self
    }

    pub fn build(self) -> Union {
        let root_mount = self.mounts.iter().position(|m| m.path.is_empty());
        Union {
            mounts: self.mounts,
            root_mount,
        }
    }
}

impl Union {
    pub fn builder() -> UnionBuilder {
        UnionBuilder::new()
    }

    /// The names reachable one segment past `prefix`: either a mount's
    /// final segment (a leaf into that backend) or another synthetic
    /// directory segment shared by several deeper mounts.
    fn children_at(&self, prefix: &[String]) -> Vec<String> {
        let mut names = Vec::new();
        for mount in &self.mounts {
            if mount.path.len() > prefix.len() && mount.path[..prefix.len()] == *prefix {
                let next = &mount.path[prefix.len()];
                if !names.contains(next) {
                    names.push(next.clone());
                }
            }
        }
        names
    }

    fn find_mount(&self, path: &[String]) -> Option<usize> {
        self.mounts.iter().position(|m| m.path == path)
    }

    fn synthetic_qid(prefix: &[String]) -> QId {
        let joined = prefix.join("/");
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in joined.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        QId {
            typ: QIdType::DIR,
            version: 0,
            path: hash,
        }
    }

    /// Remap a backend-local qid path into a namespace-wide unique one
    /// by folding the mount index into its high byte, so two backends
    /// that independently chose the same `path` value don't collide
    /// once both are visible under the union (§3's qid uniqueness
    /// invariant, extended across mounts).
    fn salted_qid(mount: usize, mut qid: QId) -> QId {
        qid.path = (qid.path & 0x00FF_FFFF_FFFF_FFFF) | ((mount as u64 & 0xFF) << 56);
        qid
    }
}

#[async_trait]
impl Filesystem for Union {
    type Node = UnionNode;

    fn get_root(&self) -> Self::Node {
        match self.root_mount {
            Some(i) => UnionNode::Mounted {
                mount: i,
                node: self.mounts[i].backend.get_root(),
            },
            None => UnionNode::Synthetic(Vec::new()),
        }
    }

    fn node_qid(&self, node: &Self::Node) -> QId {
        match node {
            UnionNode::Synthetic(prefix) => Self::synthetic_qid(prefix),
            UnionNode::Mounted { mount, node } => {
                Self::salted_qid(*mount, self.mounts[*mount].backend.node_qid(node.as_ref()))
            }
        }
    }

    async fn walk(&self, parent: &Self::Node, name: &str) -> Option<Self::Node> {
        match parent {
            UnionNode::Mounted { mount, node } => {
                let child = self.mounts[*mount].backend.walk(node.as_ref(), name).await?;
                Some(UnionNode::Mounted {
                    mount: *mount,
                    node: child,
                })
            }
            UnionNode::Synthetic(prefix) => {
                let mut next_prefix = prefix.clone();
                next_prefix.push(name.to_owned());
                if let Some(i) = self.find_mount(&next_prefix) {
                    return Some(UnionNode::Mounted {
                        mount: i,
                        node: self.mounts[i].backend.get_root(),
                    });
                }
                if self
                    .mounts
                    .iter()
                    .any(|m| m.path.len() > next_prefix.len() && m.path[..next_prefix.len()] == next_prefix)
                {
                    return Some(UnionNode::Synthetic(next_prefix));
                }
                None
            }
        }
    }

    async fn open(&self, node: &Self::Node, mode: u8) -> Result<()> {
        match node {
            UnionNode::Mounted { mount, node } => self.mounts[*mount].backend.open(node.as_ref(), mode).await,
            UnionNode::Synthetic(_) => Ok(()),
        }
    }

    async fn read(&self, node: &Self::Node, offset: u64, count: u32, uname: &str) -> Result<Vec<u8>> {
        match node {
            UnionNode::Mounted { mount, node } => {
                self.mounts[*mount].backend.read(node.as_ref(), offset, count, uname).await
            }
            UnionNode::Synthetic(prefix) => {
                let mut records = Vec::new();
                for name in self.children_at(prefix) {
                    let mut child_prefix = prefix.clone();
                    child_prefix.push(name.clone());
                    let qid = Self::synthetic_qid(&child_prefix);
                    let stat = Stat {
                        typ: 0,
                        dev: 0,
                        qid,
                        mode: crate::fcall::dm::DIR | 0o555,
                        atime: 0,
                        mtime: 0,
                        length: 0,
                        name,
                        uid: String::new(),
                        gid: String::new(),
                        muid: String::new(),
                    };
                    let mut encoded = Vec::new();
                    let _ = crate::serialize::Encodable::encode(&stat, &mut encoded);
                    records.push(encoded);
                }

                // Never split a stat record across the returned slice
                // (§4.5: "the server guarantees each returned block
                // ends on a stat boundary").
                let mut skip = offset;
                let mut remaining = count as usize;
                let mut out = Vec::new();
                for rec in records {
                    let len = rec.len() as u64;
                    if skip >= len {
                        skip -= len;
                        continue;
                    }
                    if skip > 0 || rec.len() > remaining {
                        break;
                    }
                    remaining -= rec.len();
                    out.extend(rec);
                }
                Ok(out)
            }
        }
    }

    async fn write(&self, node: &Self::Node, offset: u64, data: &[u8], uname: &str) -> Result<u32> {
        match node {
            UnionNode::Mounted { mount, node } => {
                self.mounts[*mount].backend.write(node.as_ref(), offset, data, uname).await
            }
            UnionNode::Synthetic(_) => Err(Error::backend("mount listing is read-only")),
        }
    }

    async fn stat(&self, node: &Self::Node) -> Result<Stat> {
        match node {
            UnionNode::Mounted { mount, node } => self.mounts[*mount].backend.stat(node.as_ref()).await,
            UnionNode::Synthetic(prefix) => Ok(Stat {
                typ: 0,
                dev: 0,
                qid: Self::synthetic_qid(prefix),
                mode: crate::fcall::dm::DIR | 0o555,
                atime: 0,
                mtime: 0,
                length: 0,
                name: prefix.last().cloned().unwrap_or_default(),
                uid: String::new(),
                gid: String::new(),
                muid: String::new(),
            }),
        }
    }

    async fn create(
        &self,
        parent: &Self::Node,
        name: &str,
        perm: u32,
        mode: u8,
        uname: &str,
    ) -> Result<Self::Node> {
        match parent {
            UnionNode::Mounted { mount, node } => {
                let child = self.mounts[*mount]
                    .backend
                    .create(node.as_ref(), name, perm, mode, uname)
                    .await?;
                Ok(UnionNode::Mounted {
                    mount: *mount,
                    node: child,
                })
            }
            UnionNode::Synthetic(_) => Err(Error::backend("mount listing is read-only")),
        }
    }

    async fn remove(&self, node: &Self::Node) -> Result<()> {
        match node {
            UnionNode::Mounted { mount, node } => self.mounts[*mount].backend.remove(node.as_ref()).await,
            UnionNode::Synthetic(_) => Err(Error::backend("mount listing is read-only")),
        }
    }

    async fn clunk(&self, node: &Self::Node) -> Result<()> {
        match node {
            UnionNode::Mounted { mount, node } => self.mounts[*mount].backend.clunk(node.as_ref()).await,
            UnionNode::Synthetic(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::Decodable;

    /// A single-file backend tagged with a label, so tests can confirm
    /// a walk through the composer reached the right mount.
    struct TaggedFs {
        label: &'static str,
    }

    #[async_trait]
    impl Filesystem for TaggedFs {
        type Node = &'static str;

        fn get_root(&self) -> Self::Node {
            self.label
        }

        fn node_qid(&self, node: &Self::Node) -> QId {
            QId {
                typ: if *node == self.label { QIdType::DIR } else { QIdType::FILE },
                version: 0,
                path: node.len() as u64,
            }
        }

        async fn walk(&self, parent: &Self::Node, name: &str) -> Option<Self::Node> {
            if *parent == self.label && name == "marker" {
                Some(self.label)
            } else {
                None
            }
        }

        async fn open(&self, _node: &Self::Node, _mode: u8) -> Result<()> {
            Ok(())
        }

        async fn read(&self, node: &Self::Node, offset: u64, count: u32, _uname: &str) -> Result<Vec<u8>> {
            let bytes = node.as_bytes();
            let start = (offset as usize).min(bytes.len());
            let end = start.saturating_add(count as usize).min(bytes.len());
            Ok(bytes[start..end].to_vec())
        }

        async fn write(&self, _node: &Self::Node, _offset: u64, _data: &[u8], _uname: &str) -> Result<u32> {
            Err(Error::backend("read-only"))
        }

        async fn stat(&self, _node: &Self::Node) -> Result<Stat> {
            Err(Error::backend("no stat"))
        }

        async fn create(
            &self,
            _parent: &Self::Node,
            _name: &str,
            _perm: u32,
            _mode: u8,
            _uname: &str,
        ) -> Result<Self::Node> {
            Err(Error::backend("read-only"))
        }

        async fn remove(&self, _node: &Self::Node) -> Result<()> {
            Err(Error::backend("read-only"))
        }
    }

    async fn read_marker(union: &Union, node: &UnionNode) -> Vec<u8> {
        let marker = union.walk(node, "marker").await.unwrap();
        union.read(&marker, 0, 64, "glenda").await.unwrap()
    }

    #[tokio::test]
    async fn longest_prefix_match_does_not_confuse_foo_with_foobar() {
        let union = Union::builder()
            .mount("/foo", Arc::new(TaggedFs { label: "foo" }))
            .mount("/foobar", Arc::new(TaggedFs { label: "foobar" }))
            .build();

        let root = union.get_root();
        let foo = union.walk(&root, "foo").await.unwrap();
        assert_eq!(read_marker(&union, &foo).await, b"foo");

        let foobar = union.walk(&root, "foobar").await.unwrap();
        assert_eq!(read_marker(&union, &foobar).await, b"foobar");
    }

    #[tokio::test]
    async fn synthetic_root_lists_top_level_mounts_when_nothing_mounted_at_slash() {
        let union = Union::builder()
            .mount("/a", Arc::new(TaggedFs { label: "a" }))
            .mount("/b/c", Arc::new(TaggedFs { label: "c" }))
            .build();

        let root = union.get_root();
        assert!(matches!(root, UnionNode::Synthetic(ref p) if p.is_empty()));

        let listing = union.read(&root, 0, 4096, "glenda").await.unwrap();
        let mut names = Vec::new();
        let mut cursor = std::io::Cursor::new(listing.as_slice());
        while (cursor.position() as usize) < listing.len() {
            let stat: Stat = Decodable::decode(&mut cursor).unwrap();
            names.push(stat.name);
        }
        names.sort();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn root_mount_is_delegated_to_opaquely() {
        let union = Union::builder()
            .mount("/", Arc::new(TaggedFs { label: "root" }))
            .build();

        let root = union.get_root();
        assert!(matches!(root, UnionNode::Mounted { mount: 0, .. }));
        assert_eq!(read_marker(&union, &root).await, b"root");
    }

    #[tokio::test]
    async fn node_ownership_routes_back_to_originating_mount() {
        let union = Union::builder()
            .mount("/a", Arc::new(TaggedFs { label: "a" }))
            .mount("/b", Arc::new(TaggedFs { label: "b" }))
            .build();

        let root = union.get_root();
        let a = union.walk(&root, "a").await.unwrap();
        let b = union.walk(&root, "b").await.unwrap();
        assert_eq!(read_marker(&union, &a).await, b"a");
        assert_eq!(read_marker(&union, &b).await, b"b");
    }
}
