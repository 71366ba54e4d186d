//! The server-side request dispatcher (§4.5): a state machine that
//! accepts framed messages, multiplexes tags, routes each to a
//! filesystem backend through [`Filesystem`], and emits a correctly
//! ordered response for every request.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::auth::{AuthState, Verifier};
use crate::config::Config;
use crate::error::{Error, ProtoKind};
use crate::fcall::*;
use crate::fid::{FidEntry, FidTable};
use crate::serialize::{decode_frame, encode_frame};
use crate::transport::Transport;
use crate::utils::Result;

/// The capability interface the dispatcher consumes (§4.8). `Node` is
/// the backend's own node identity — typically an arena index or a
/// path, never a raw pointer (§9: "an arena-and-index approach...
/// works well with the fixed-capacity allocators this spec assumes").
#[async_trait]
pub trait Filesystem: Send + Sync {
    type Node: Clone + Send + Sync;

    /// The tree root. Must be stable for the lifetime of the backend.
    fn get_root(&self) -> Self::Node;

    /// The qid of a node. Cheap and synchronous: the dispatcher calls
    /// this on every walk step and attach.
    fn node_qid(&self, node: &Self::Node) -> QId;

    /// One walk step. `None` means "no such child".
    async fn walk(&self, parent: &Self::Node, name: &str) -> Option<Self::Node>;

    /// Validate `mode` against the node and prepare it for I/O.
    async fn open(&self, node: &Self::Node, mode: u8) -> Result<()>;

    /// Read at `offset`. For directories, returns a concatenation of
    /// whole wire-format stat records. A short or zero-length result
    /// is a valid end-of-data signal, not an error.
    async fn read(&self, node: &Self::Node, offset: u64, count: u32, uname: &str) -> Result<Vec<u8>>;

    async fn write(&self, node: &Self::Node, offset: u64, data: &[u8], uname: &str) -> Result<u32>;

    async fn stat(&self, node: &Self::Node) -> Result<Stat>;

    /// Create `name` under `parent`, returning the new node. The fid
    /// that named `parent` is rebound to this new node by the caller.
    async fn create(
        &self,
        parent: &Self::Node,
        name: &str,
        perm: u32,
        mode: u8,
        uname: &str,
    ) -> Result<Self::Node>;

    async fn remove(&self, node: &Self::Node) -> Result<()>;

    /// Called on every fid release. Optional: most backends have
    /// nothing to do here.
    async fn clunk(&self, _node: &Self::Node) -> Result<()> {
        Ok(())
    }

    /// `Twstat` is typically unsupported on embedded backends.
    async fn wstat(&self, _node: &Self::Node, _stat: &Stat) -> Result<()> {
        Err(Error::proto(ProtoKind::NotSupported))
    }
}

/// One session's dispatcher state: its fid table, its auth-fid table,
/// and the negotiated `msize`. One instance per accepted connection.
pub struct Dispatcher<Fs: Filesystem> {
    fs: Arc<Fs>,
    fids: FidTable<Fs::Node>,
    auth_fids: FidTable<AuthState>,
    verifier: Option<Arc<dyn Verifier>>,
    config: Config,
    /// The smaller of the configured `server_max` and the transport's
    /// own `mtu()`, if it reports one (§4.5: "msize = min(client_msize,
    /// server_max, transport_mtu)").
    transport_mtu: Option<u32>,
    msize: u32,
    next_auth_path: u64,
}

impl<Fs: Filesystem> Dispatcher<Fs> {
    pub fn new(fs: Arc<Fs>, config: Config, verifier: Option<Arc<dyn Verifier>>) -> Dispatcher<Fs> {
        Dispatcher::with_transport_mtu(fs, config, verifier, None)
    }

    pub fn with_transport_mtu(
        fs: Arc<Fs>,
        config: Config,
        verifier: Option<Arc<dyn Verifier>>,
        transport_mtu: Option<u32>,
    ) -> Dispatcher<Fs> {
        let server_max = match transport_mtu {
            Some(mtu) => config.msize.min(mtu),
            None => config.msize,
        };
        Dispatcher {
            fs,
            fids: FidTable::new(config.max_fids),
            auth_fids: FidTable::new(config.max_fids),
            verifier,
            msize: server_max,
            transport_mtu,
            next_auth_path: 0,
            config,
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Process one request, returning the response (always Some body —
    /// the protocol never drops a T-message silently).
    pub async fn dispatch(&mut self, msg: &Msg) -> Msg {
        let body = self.dispatch_body(&msg.body).await.unwrap_or_else(|e| {
            error!(
                "{:?} tag={}: {}",
                MsgType::from(&msg.body),
                msg.tag,
                e.ename()
            );
            FCall::RError { ename: e.ename() }
        });
        Msg {
            tag: msg.tag,
            body,
        }
    }

    async fn dispatch_body(&mut self, body: &FCall) -> Result<FCall> {
        match *body {
            FCall::TVersion {
                ref msize,
                ref version,
            } => self.tversion(*msize, version),
            FCall::TAuth {
                afid,
                ref uname,
                ref aname,
            } => self.tauth(afid, uname, aname),
            FCall::TAttach {
                fid,
                afid,
                ref uname,
                ref aname,
            } => self.tattach(fid, afid, uname, aname).await,
            FCall::TWalk {
                fid,
                newfid,
                ref wname,
            } => self.twalk(fid, newfid, wname).await,
            FCall::TOpen { fid, mode } => self.topen(fid, mode).await,
            FCall::TCreate {
                fid,
                ref name,
                perm,
                mode,
            } => self.tcreate(fid, name, perm, mode).await,
            FCall::TRead { fid, offset, count } => self.tread(fid, offset, count).await,
            FCall::TWrite {
                fid,
                offset,
                ref data,
            } => self.twrite(fid, offset, data).await,
            FCall::TClunk { fid } => self.tclunk(fid).await,
            FCall::TRemove { fid } => self.tremove(fid).await,
            FCall::TStat { fid } => self.tstat(fid).await,
            FCall::TWStat { fid, ref stat } => self.twstat(fid, stat).await,
            FCall::TFlush { oldtag: _ } => Ok(FCall::RFlush),
            _ => Err(Error::proto(ProtoKind::UnknownType)),
        }
    }

    fn tversion(&mut self, client_msize: u32, version: &str) -> Result<FCall> {
        self.fids.clear();
        self.auth_fids.clear();
        let server_max = match self.transport_mtu {
            Some(mtu) => self.config.msize.min(mtu),
            None => self.config.msize,
        };
        let bound = server_max.min(client_msize);
        if version != P92000 {
            self.msize = bound;
            return Ok(FCall::RVersion {
                msize: bound,
                version: VERSION_UNKNOWN.to_owned(),
            });
        }
        self.msize = bound;
        Ok(FCall::RVersion {
            msize: bound,
            version: P92000.to_owned(),
        })
    }

    fn tauth(&mut self, afid: u32, uname: &str, _aname: &str) -> Result<FCall> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| Error::proto_msg(ProtoKind::AuthRequired, "authentication not required"))?;
        let _ = verifier;
        let path = self.next_auth_path;
        self.next_auth_path += 1;
        let state = AuthState::new(uname.to_owned());
        let qid = QId {
            typ: QIdType::AUTH,
            version: 0,
            path,
        };
        self.auth_fids.alloc(
            afid,
            FidEntry {
                fid: afid,
                node: state,
                qid,
                uname: uname.to_owned(),
                iounit: None,
            },
        )?;
        Ok(FCall::RAuth { aqid: qid })
    }

    async fn tattach(&mut self, fid: u32, afid: u32, uname: &str, _aname: &str) -> Result<FCall> {
        if self.verifier.is_some() {
            let auth = self
                .auth_fids
                .lookup(afid)
                .map_err(|_| Error::proto_msg(ProtoKind::AuthRequired, "afid not authenticated"))?;
            if !auth.node.authenticated {
                return Err(Error::proto_msg(ProtoKind::AuthRequired, "afid not authenticated"));
            }
            if auth.node.uname != uname {
                return Err(Error::proto_msg(
                    ProtoKind::AuthFailed,
                    "uname does not match authenticated identity",
                ));
            }
        }
        let root = self.fs.get_root();
        let qid = self.fs.node_qid(&root);
        self.fids.alloc(
            fid,
            FidEntry {
                fid,
                node: root,
                qid,
                uname: uname.to_owned(),
                iounit: None,
            },
        )?;
        Ok(FCall::RAttach { qid })
    }

    async fn twalk(&mut self, fid: u32, newfid: u32, wname: &[String]) -> Result<FCall> {
        if wname.len() > MAXWELEM {
            return Err(Error::proto_msg(ProtoKind::MalformedMessage, "too many wname elements"));
        }
        let start = self.fids.lookup(fid)?.clone();

        if wname.is_empty() {
            self.bind_fid(fid, newfid, start.node, start.qid, start.uname)?;
            return Ok(FCall::RWalk { wqid: Vec::new() });
        }

        let mut node = start.node;
        let mut qids = Vec::with_capacity(wname.len());
        for name in wname {
            match self.fs.walk(&node, name).await {
                Some(next) => {
                    let qid = self.fs.node_qid(&next);
                    qids.push(qid);
                    node = next;
                }
                None => break,
            }
        }

        if qids.is_empty() {
            return Err(Error::backend("file not found"));
        }
        if qids.len() == wname.len() {
            let last_qid = *qids.last().unwrap();
            self.bind_fid(fid, newfid, node, last_qid, start.uname)?;
        }
        Ok(FCall::RWalk { wqid: qids })
    }

    /// Bind `newfid` to `(node, qid, uname)`. `newfid == fid` rebinds
    /// the existing slot in place (clone-into-self); otherwise this is
    /// a fresh allocation that must not collide with another fid.
    fn bind_fid(
        &mut self,
        fid: u32,
        newfid: u32,
        node: Fs::Node,
        qid: QId,
        uname: String,
    ) -> Result<()> {
        if newfid == fid {
            let entry = self.fids.lookup_mut(fid)?;
            entry.node = node;
            entry.qid = qid;
            entry.iounit = None;
            Ok(())
        } else {
            self.fids.alloc(
                newfid,
                FidEntry {
                    fid: newfid,
                    node,
                    qid,
                    uname,
                    iounit: None,
                },
            )
        }
    }

    async fn topen(&mut self, fid: u32, mode: u8) -> Result<FCall> {
        let node = self.fids.lookup(fid)?.node.clone();
        self.fs.open(&node, mode).await?;
        let qid = self.fs.node_qid(&node);
        let iounit = self.msize.saturating_sub(IOHDRSZ);
        let entry = self.fids.lookup_mut(fid)?;
        entry.iounit = Some(iounit);
        Ok(FCall::ROpen { qid, iounit })
    }

    async fn tcreate(&mut self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<FCall> {
        let (parent, uname) = {
            let entry = self.fids.lookup(fid)?;
            (entry.node.clone(), entry.uname.clone())
        };
        let node = self.fs.create(&parent, name, perm, mode, &uname).await?;
        let qid = self.fs.node_qid(&node);
        let iounit = self.msize.saturating_sub(IOHDRSZ);
        let entry = self.fids.lookup_mut(fid)?;
        entry.node = node;
        entry.qid = qid;
        entry.iounit = Some(iounit);
        Ok(FCall::RCreate { qid, iounit })
    }

    async fn tread(&mut self, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        if let Ok(auth) = self.auth_fids.lookup(fid) {
            let challenge = &auth.node.challenge;
            let start = (offset as usize).min(challenge.len());
            let end = start.saturating_add(count as usize).min(challenge.len());
            return Ok(FCall::RRead {
                data: Data(challenge[start..end].to_vec()),
            });
        }
        let entry = self.fids.lookup(fid)?;
        if entry.iounit.is_none() {
            return Err(Error::backend("fid not open"));
        }
        let node = entry.node.clone();
        let uname = entry.uname.clone();
        let data = self.fs.read(&node, offset, count, &uname).await?;
        Ok(FCall::RRead { data: Data(data) })
    }

    async fn twrite(&mut self, fid: u32, offset: u64, data: &Data) -> Result<FCall> {
        if let Some(verifier) = self.verifier.clone() {
            if let Ok(auth) = self.auth_fids.lookup_mut(fid) {
                if auth.node.is_expired() {
                    return Err(Error::proto(ProtoKind::AuthTimeout));
                }
                return if auth.node.apply_response(verifier.as_ref(), &data.0) {
                    Ok(FCall::RWrite {
                        count: data.0.len() as u32,
                    })
                } else {
                    Err(Error::proto_msg(ProtoKind::AuthFailed, "authentication failed"))
                };
            }
        }
        let entry = self.fids.lookup(fid)?;
        if entry.iounit.is_none() {
            return Err(Error::backend("fid not open"));
        }
        let node = entry.node.clone();
        let uname = entry.uname.clone();
        let count = self.fs.write(&node, offset, &data.0, &uname).await?;
        Ok(FCall::RWrite { count })
    }

    async fn tclunk(&mut self, fid: u32) -> Result<FCall> {
        if self.auth_fids.free(fid).is_some() {
            return Ok(FCall::RClunk);
        }
        if let Some(entry) = self.fids.free(fid) {
            if let Err(e) = self.fs.clunk(&entry.node).await {
                warn!("clunk hook failed for fid {fid}: {}", e.ename());
            }
        }
        Ok(FCall::RClunk)
    }

    async fn tremove(&mut self, fid: u32) -> Result<FCall> {
        if self.auth_fids.free(fid).is_some() {
            return Ok(FCall::RRemove);
        }
        if let Some(entry) = self.fids.free(fid) {
            if let Err(e) = self.fs.remove(&entry.node).await {
                warn!("remove failed for fid {fid}: {}", e.ename());
            }
        }
        Ok(FCall::RRemove)
    }

    async fn tstat(&mut self, fid: u32) -> Result<FCall> {
        let node = self.fids.lookup(fid)?.node.clone();
        let stat = self.fs.stat(&node).await?;
        Ok(FCall::RStat { stat })
    }

    async fn twstat(&mut self, fid: u32, stat: &Stat) -> Result<FCall> {
        let node = self.fids.lookup(fid)?.node.clone();
        self.fs.wstat(&node, stat).await?;
        Ok(FCall::RWStat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

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

    struct EchoVerifier;

    impl crate::auth::Verifier for EchoVerifier {
        fn verify(&self, _uname: &str, challenge: &[u8], response: &[u8]) -> bool {
            challenge == response
        }
    }

    /// §8 property 8: "write after 60s yields AuthTimeout". Drives the
    /// dispatcher's handlers directly so the challenge's `issued_at` can
    /// be backdated instead of actually sleeping a minute.
    #[tokio::test]
    async fn expired_challenge_yields_auth_timeout_on_write() {
        let mut dispatcher = Dispatcher::new(
            Arc::new(EmptyFs),
            Config::default(),
            Some(Arc::new(EchoVerifier)),
        );
        match dispatcher.tauth(10, "glenda", "").unwrap() {
            FCall::RAuth { .. } => {}
            other => panic!("expected RAuth, got {other:?}"),
        }

        let challenge = dispatcher.auth_fids.lookup(10).unwrap().node.challenge.clone();
        dispatcher
            .auth_fids
            .lookup_mut(10)
            .unwrap()
            .node
            .backdate(Duration::from_secs(61));

        let err = dispatcher
            .twrite(10, 0, &Data(challenge))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::AuthTimeout, _)));
    }

    /// §8 property 5: "Tversion resets all session state" — in
    /// particular every previously-allocated fid is cleared, not just
    /// the auth-fid table.
    #[tokio::test]
    async fn tversion_clears_every_previously_allocated_fid() {
        let mut dispatcher = Dispatcher::new(Arc::new(EmptyFs), Config::default(), None);
        dispatcher
            .dispatch_body(&FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: String::new(),
            })
            .await
            .unwrap();
        assert!(dispatcher.fids.lookup(0).is_ok());

        dispatcher.tversion(Config::default().msize, P92000).unwrap();

        let err = dispatcher
            .dispatch_body(&FCall::TStat { fid: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::UnknownFid, _)));
    }

    /// §4.5: negotiated `msize` is `min(client_msize, server_max,
    /// transport_mtu)`, not just the first two.
    #[tokio::test]
    async fn version_negotiation_is_bounded_by_the_transport_mtu() {
        let config = Config {
            msize: 8192,
            ..Config::default()
        };
        let mut dispatcher =
            Dispatcher::with_transport_mtu(Arc::new(EmptyFs), config, None, Some(4096));

        match dispatcher.tversion(10_000, P92000).unwrap() {
            FCall::RVersion { msize, .. } => assert_eq!(msize, 4096),
            other => panic!("expected RVersion, got {other:?}"),
        }

        match dispatcher.tversion(2048, P92000).unwrap() {
            FCall::RVersion { msize, .. } => assert_eq!(msize, 2048),
            other => panic!("expected RVersion, got {other:?}"),
        }
    }
}

/// Drive one session to completion: receive a frame, dispatch it,
/// send the response, repeat until the transport reports disconnect.
pub async fn serve<Fs: Filesystem>(
    fs: Arc<Fs>,
    transport: Arc<dyn Transport>,
    config: Config,
    verifier: Option<Arc<dyn Verifier>>,
) -> Result<()> {
    let mtu = transport.mtu();
    let mut dispatcher = Dispatcher::with_transport_mtu(fs, config, verifier, mtu);

    loop {
        let frame = match transport.recv().await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let msg = match decode_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed frame: {}", e.ename());
                continue;
            }
        };
        info!("\t<- {:?}", msg);
        let response = dispatcher.dispatch(&msg).await;
        info!("\t-> {:?}", response);
        let out = encode_frame(&response, dispatcher.msize().max(7))?;
        transport.send(&out).await?;
    }
}
