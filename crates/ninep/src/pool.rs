//! The session pool (§4.7): per-connection isolation of fid
//! namespaces for multi-client servers sharing one filesystem context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::auth::Verifier;
use crate::config::Config;
use crate::error::{Error, ProtoKind};
use crate::srv::{self, Filesystem};
use crate::transport::Transport;
use crate::utils::Result;

/// Lifecycle of one pool slot, per §4.7's state diagram.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Allocated,
    Connected,
    Disconnecting,
}

struct Slot {
    state: Mutex<SlotState>,
}

/// A fixed-size array of session slots shared by one backend filesystem
/// context. Slot allocation is guarded by one lock; once a slot is
/// handed to a session, that session owns its own fid table and
/// buffers exclusively (the backend context itself is shared).
pub struct SessionPool<Fs: Filesystem> {
    fs: Arc<Fs>,
    config: Config,
    verifier: Option<Arc<dyn Verifier>>,
    slots: Vec<Slot>,
    in_use: AtomicUsize,
}

impl<Fs: 'static + Filesystem> SessionPool<Fs> {
    pub fn new(fs: Arc<Fs>, config: Config, verifier: Option<Arc<dyn Verifier>>) -> Arc<SessionPool<Fs>> {
        let slots = (0..config.pool_size)
            .map(|_| Slot {
                state: Mutex::new(SlotState::Free),
            })
            .collect();
        Arc::new(SessionPool {
            fs,
            config,
            verifier,
            slots,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Allocate the first free slot, returning its index.
    fn alloc_slot(&self) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut state = slot.state.lock().unwrap();
            if *state == SlotState::Free {
                *state = SlotState::Allocated;
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(i);
            }
        }
        Err(Error::proto_msg(ProtoKind::FidExhausted, "session pool exhausted"))
    }

    fn free_slot(&self, i: usize) {
        *self.slots[i].state.lock().unwrap() = SlotState::Free;
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Accept a new connection on `transport`: allocate a slot, run
    /// the dispatcher to completion, then return the slot to `free`
    /// regardless of how the session ended.
    pub async fn accept(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        let slot = self.alloc_slot()?;
        *self.slots[slot].state.lock().unwrap() = SlotState::Connected;
        info!("session pool: slot {slot} connected ({}/{})", self.in_use(), self.capacity());

        let result = srv::serve(
            self.fs.clone(),
            transport,
            self.config.clone(),
            self.verifier.clone(),
        )
        .await;

        *self.slots[slot].state.lock().unwrap() = SlotState::Disconnecting;
        if let Err(ref e) = result {
            error!("session pool: slot {slot} ended with error: {}", e.ename());
        }
        self.free_slot(slot);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{QId, QIdType, Stat};
    use async_trait::async_trait;

    struct EmptyFs;

    #[async_trait]
    impl Filesystem for EmptyFs {
        type Node = ();

        fn get_root(&self) -> Self::Node {}

        fn node_qid(&self, _node: &Self::Node) -> QId {
            QId {
                typ: QIdType::DIR,
                version: 0,
                path: 0,
            }
        }

        async fn walk(&self, _parent: &Self::Node, _name: &str) -> Option<Self::Node> {
            None
        }

        async fn open(&self, _node: &Self::Node, _mode: u8) -> Result<()> {
            Ok(())
        }

        async fn read(&self, _node: &Self::Node, _offset: u64, _count: u32, _uname: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn write(&self, _node: &Self::Node, _offset: u64, _data: &[u8], _uname: &str) -> Result<u32> {
            Ok(0)
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

    #[tokio::test]
    async fn pool_allocation_is_bounded() {
        let mut config = Config::default();
        config.pool_size = 1;
        let pool = SessionPool::new(Arc::new(EmptyFs), config, None);
        assert_eq!(pool.alloc_slot().unwrap(), 0);
        let err = pool.alloc_slot().unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::FidExhausted, _)));
        pool.free_slot(0);
        assert_eq!(pool.alloc_slot().unwrap(), 0);
    }
}
