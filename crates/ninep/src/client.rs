//! The client-side request/response multiplexer (§4.6): tag
//! allocation, request framing, pending-request table, response
//! matching with timeouts and cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::warn;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{Error, ProtoKind};
use crate::fcall::*;
use crate::fid::FidTable;
use crate::serialize::{decode_frame, encode_frame};
use crate::tag::TagTable;
use crate::transport::Transport;
use crate::utils::Result;

/// Per-tag completion state: the slot a waiting caller parks on.
struct Pending {
    result: StdMutex<Option<Result<FCall>>>,
    notify: Notify,
}

impl Pending {
    fn new() -> Arc<Pending> {
        Arc::new(Pending {
            result: StdMutex::new(None),
            notify: Notify::new(),
        })
    }

    fn complete(&self, result: Result<FCall>) {
        *self.result.lock().unwrap() = Some(result);
        self.notify.notify_one();
    }

    async fn wait(&self, timeout_dur: Duration) -> Result<FCall> {
        loop {
            if let Some(result) = self.result.lock().unwrap().take() {
                return result;
            }
            if timeout(timeout_dur, self.notify.notified()).await.is_err() {
                return Err(Error::proto(ProtoKind::Timeout));
            }
        }
    }
}

/// A 9P2000 client: owns a fid-number bookkeeping table, a tag table
/// of outstanding requests, a negotiated `msize`, and a background
/// task draining the transport's inbound frames into tag slots.
pub struct Client {
    transport: Arc<dyn Transport>,
    tx_lock: tokio::sync::Mutex<()>,
    tags: StdMutex<TagTable<Arc<Pending>>>,
    fids: StdMutex<FidTable<()>>,
    msize: AtomicU32,
    timeout: Duration,
    version_slot: Arc<Pending>,
    reader: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Spawn the background reader and build a client ready for
    /// `version`/`attach`. The caller must still negotiate a version
    /// before issuing other requests, per the protocol.
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Arc<Client> {
        let tags = StdMutex::new(TagTable::new(config.max_tags));
        let version_slot = Pending::new();

        let client = Arc::new(Client {
            transport: transport.clone(),
            tx_lock: tokio::sync::Mutex::new(()),
            tags,
            fids: StdMutex::new(FidTable::new(config.max_fids)),
            msize: AtomicU32::new(config.msize),
            timeout: config.request_timeout,
            version_slot: version_slot.clone(),
            reader: StdMutex::new(None),
        });

        let reader_client = client.clone();
        let handle = tokio::spawn(async move {
            reader_client.reader_loop().await;
        });
        *client.reader.lock().unwrap() = Some(handle);
        client
    }

    async fn reader_loop(self: Arc<Client>) {
        loop {
            let frame = match self.transport.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    warn!("transport recv failed: {}", e.ename());
                    return;
                }
            };
            let msg = match decode_frame(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping malformed frame: {}", e.ename());
                    continue;
                }
            };
            let result = match msg.body {
                FCall::RError { ename } => Err(Error::backend(ename)),
                other => Ok(other),
            };
            if msg.tag == NOTAG {
                self.version_slot.complete(result);
                continue;
            }
            let slot = self.tags.lock().unwrap().get(msg.tag).cloned();
            match slot {
                Some(slot) => slot.complete(result),
                None => warn!("response for unknown/released tag {}", msg.tag),
            }
        }
    }

    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    async fn send_and_wait(&self, body: FCall) -> Result<FCall> {
        let msize = self.msize();
        let (tag, slot) = {
            let _tx = self.tx_lock.lock().await;
            let slot = Pending::new();
            let tag = self
                .tags
                .lock()
                .unwrap()
                .alloc(slot.clone())
                .map_err(|_| Error::proto(ProtoKind::TagExhausted))?;
            let frame = encode_frame(&Msg { tag, body }, msize)?;
            if let Err(e) = self.transport.send(&frame).await {
                self.tags.lock().unwrap().free(tag);
                return Err(e);
            }
            (tag, slot)
        };

        match slot.wait(self.timeout).await {
            Ok(body) => {
                self.tags.lock().unwrap().free(tag);
                Ok(body)
            }
            Err(e) => {
                self.tags.lock().unwrap().free(tag);
                // Fire-and-forget: the tag we just freed is safe to
                // reuse for the flush request itself since nothing
                // waits on its response; an eventual Rflush (or the
                // abandoned request's own late response) arrives at
                // the reader loop with no matching slot and is logged
                // and dropped, per the spec's documented behavior.
                let flush = Msg {
                    tag,
                    body: FCall::TFlush { oldtag: tag },
                };
                if let Ok(frame) = encode_frame(&flush, msize) {
                    let _ = self.transport.send(&frame).await;
                }
                Err(e)
            }
        }
    }

    /// Negotiate the protocol version. Must be the first call made on
    /// a fresh connection.
    pub async fn version(&self, client_msize: u32) -> Result<u32> {
        let frame = encode_frame(
            &Msg {
                tag: NOTAG,
                body: FCall::TVersion {
                    msize: client_msize,
                    version: P92000.to_owned(),
                },
            },
            client_msize,
        )?;
        self.transport.send(&frame).await?;
        match self.version_slot.wait(self.timeout).await? {
            FCall::RVersion { msize, version } if version == P92000 => {
                self.msize.store(msize, Ordering::Relaxed);
                Ok(msize)
            }
            FCall::RVersion { .. } => Err(Error::proto(ProtoKind::UnknownVersion)),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    /// Reserve a specific fid number for the caller's own bookkeeping.
    pub fn alloc_fid(&self, fid: u32) -> Result<()> {
        self.fids.lock().unwrap().alloc(fid, ())
    }

    pub fn free_fid(&self, fid: u32) {
        self.fids.lock().unwrap().free(fid);
    }

    /// Start the auth handshake: allocate `afid` and request a
    /// challenge for `uname`. The caller reads the challenge back with
    /// [`Client::read`] and answers it with [`Client::write`] before
    /// attaching with the same `uname`.
    pub async fn auth(&self, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        self.alloc_fid(afid)?;
        let body = FCall::TAuth {
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.send_and_wait(body).await {
            Ok(FCall::RAuth { aqid }) => Ok(aqid),
            Ok(_) => Err(Error::proto(ProtoKind::MalformedMessage)),
            Err(e) => {
                self.free_fid(afid);
                Err(e)
            }
        }
    }

    pub async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        self.alloc_fid(fid)?;
        let body = FCall::TAttach {
            fid,
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.send_and_wait(body).await {
            Ok(FCall::RAttach { qid }) => Ok(qid),
            Ok(_) => Err(Error::proto(ProtoKind::MalformedMessage)),
            Err(e) => {
                self.free_fid(fid);
                Err(e)
            }
        }
    }

    pub async fn walk(&self, fid: u32, newfid: u32, wname: Vec<String>) -> Result<Vec<QId>> {
        let body = FCall::TWalk {
            fid,
            newfid,
            wname,
        };
        match self.send_and_wait(body).await? {
            FCall::RWalk { wqid } => Ok(wqid),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    /// Walk a slash-separated path, chaining Twalk calls in chunks of
    /// at most [`MAXWELEM`] elements as the wire format requires.
    pub async fn walk_path(&self, fid: u32, newfid: u32, path: &str) -> Result<Vec<QId>> {
        let elements: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_owned())
            .collect();

        self.alloc_fid(newfid)?;

        if elements.is_empty() {
            return match self.walk(fid, newfid, Vec::new()).await {
                Ok(qids) => Ok(qids),
                Err(e) => {
                    self.free_fid(newfid);
                    Err(e)
                }
            };
        }

        let mut cur = fid;
        let mut all_qids = Vec::new();
        for chunk in elements.chunks(MAXWELEM) {
            let qids = match self.walk(cur, newfid, chunk.to_vec()).await {
                Ok(qids) => qids,
                Err(e) => {
                    self.free_fid(newfid);
                    return Err(e);
                }
            };
            let complete = qids.len() == chunk.len();
            all_qids.extend(qids);
            cur = newfid;
            if !complete {
                self.free_fid(newfid);
                return Err(Error::backend("path not found"));
            }
        }
        Ok(all_qids)
    }

    pub async fn open(&self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.send_and_wait(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn create(
        &self,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)> {
        let body = FCall::TCreate {
            fid,
            name: name.to_owned(),
            perm,
            mode,
        };
        match self.send_and_wait(body).await? {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.send_and_wait(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn write(&self, fid: u32, offset: u64, buf: &[u8]) -> Result<u32> {
        let body = FCall::TWrite {
            fid,
            offset,
            data: Data(buf.to_vec()),
        };
        match self.send_and_wait(body).await? {
            FCall::RWrite { count } => Ok(count),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn stat(&self, fid: u32) -> Result<Stat> {
        match self.send_and_wait(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn wstat(&self, fid: u32, stat: Stat) -> Result<()> {
        match self.send_and_wait(FCall::TWStat { fid, stat }).await? {
            FCall::RWStat => Ok(()),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn remove(&self, fid: u32) -> Result<()> {
        let result = self.send_and_wait(FCall::TRemove { fid }).await;
        self.free_fid(fid);
        match result? {
            FCall::RRemove => Ok(()),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }

    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let result = self.send_and_wait(FCall::TClunk { fid }).await;
        self.free_fid(fid);
        match result? {
            FCall::RClunk => Ok(()),
            _ => Err(Error::proto(ProtoKind::MalformedMessage)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}
