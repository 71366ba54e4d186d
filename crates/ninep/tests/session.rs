//! End-to-end session tests: a real [`Dispatcher`]/[`Client`] pair
//! talking over a [`ChannelTransport`], exercising the scenarios this
//! crate's design document lays out (version negotiation, attach,
//! walk, read, walk-to-nonexistent, and the clunk/remove lifecycle),
//! plus concurrent outstanding requests on one connection.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ninep::auth::Verifier;
use ninep::client::Client;
use ninep::config::Config;
use ninep::error::Error;
use ninep::fcall::{QId, QIdType, Stat, dm, om};
use ninep::srv::{Filesystem, serve};
use ninep::transport::ChannelTransport;
use ninep::Result;

/// A tiny two-level tree (`/`, `/greeting`) used by every test here.
struct TreeFs {
    greeting: Mutex<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Node {
    Root,
    Greeting,
}

#[async_trait]
impl Filesystem for TreeFs {
    type Node = Node;

    fn get_root(&self) -> Self::Node {
        Node::Root
    }

    fn node_qid(&self, node: &Self::Node) -> QId {
        match node {
            Node::Root => QId {
                typ: QIdType::DIR,
                version: 0,
                path: 0,
            },
            Node::Greeting => QId {
                typ: QIdType::FILE,
                version: 0,
                path: 1,
            },
        }
    }

    async fn walk(&self, parent: &Self::Node, name: &str) -> Option<Self::Node> {
        match (parent, name) {
            (Node::Root, "greeting") => Some(Node::Greeting),
            _ => None,
        }
    }

    async fn open(&self, _node: &Self::Node, _mode: u8) -> Result<()> {
        Ok(())
    }

    async fn read(&self, node: &Self::Node, offset: u64, count: u32, _uname: &str) -> Result<Vec<u8>> {
        match node {
            Node::Greeting => {
                let data = self.greeting.lock().unwrap();
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(count as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Node::Root => Ok(Vec::new()),
        }
    }

    async fn write(&self, node: &Self::Node, offset: u64, buf: &[u8], _uname: &str) -> Result<u32> {
        match node {
            Node::Greeting => {
                let mut data = self.greeting.lock().unwrap();
                let start = offset as usize;
                if start + buf.len() > data.len() {
                    data.resize(start + buf.len(), 0);
                }
                data[start..start + buf.len()].copy_from_slice(buf);
                Ok(buf.len() as u32)
            }
            Node::Root => Err(Error::backend("is a directory")),
        }
    }

    async fn stat(&self, node: &Self::Node) -> Result<Stat> {
        let (name, mode, length) = match node {
            Node::Root => (String::new(), dm::DIR | 0o555, 0),
            Node::Greeting => ("greeting".to_owned(), 0o644, self.greeting.lock().unwrap().len() as u64),
        };
        Ok(Stat {
            typ: 0,
            dev: 0,
            qid: self.node_qid(node),
            mode,
            atime: 0,
            mtime: 0,
            length,
            name,
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        })
    }

    async fn create(
        &self,
        _parent: &Self::Node,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _uname: &str,
    ) -> Result<Self::Node> {
        Err(Error::backend("read-only tree"))
    }

    async fn remove(&self, _node: &Self::Node) -> Result<()> {
        Err(Error::backend("read-only tree"))
    }
}

/// Spawn a dispatcher over one end of a channel pair and return a
/// client attached to the other end.
async fn serve_and_connect() -> Arc<Client> {
    serve_and_connect_with_verifier(None).await
}

async fn serve_and_connect_with_verifier(verifier: Option<Arc<dyn Verifier>>) -> Arc<Client> {
    let fs = Arc::new(TreeFs {
        greeting: Mutex::new(b"hello, 9p\n".to_vec()),
    });
    let (server_side, client_side) = ChannelTransport::pair();
    tokio::spawn(async move {
        let _ = serve(fs, Arc::new(server_side), Config::default(), verifier).await;
    });

    let client = Client::new(Arc::new(client_side), Config::default());
    client.version(Config::default().msize).await.unwrap();
    client
}

/// A verifier that accepts only the exact challenge bytes echoed back,
/// used to exercise both the success and bad-signature paths of the
/// Tauth handshake (§8 property 8).
struct EchoVerifier;

impl Verifier for EchoVerifier {
    fn verify(&self, _uname: &str, challenge: &[u8], response: &[u8]) -> bool {
        challenge == response
    }
}

#[tokio::test]
async fn version_negotiates_the_smaller_msize() {
    let client = serve_and_connect().await;
    // the default config on both ends means the client's own request.
    client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();
}

#[tokio::test]
async fn attach_walk_open_read_round_trip() {
    let client = serve_and_connect().await;
    let root_qid = client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();
    assert!(root_qid.typ.contains(QIdType::DIR));

    let wqid = client.walk(0, 1, vec!["greeting".to_owned()]).await.unwrap();
    assert_eq!(wqid.len(), 1);
    assert!(!wqid[0].typ.contains(QIdType::DIR));

    let (_qid, _iounit) = client.open(1, om::READ).await.unwrap();
    let data = client.read(1, 0, 4096).await.unwrap();
    assert_eq!(data, b"hello, 9p\n");

    client.clunk(1).await.unwrap();
    client.clunk(0).await.unwrap();
}

#[tokio::test]
async fn walking_to_a_nonexistent_child_fails_and_leaves_fid_untouched() {
    let client = serve_and_connect().await;
    client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();

    let err = client
        .walk(0, 1, vec!["does-not-exist".to_owned()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Proto(_, _)) || matches!(err, Error::Backend(_)));

    // fid 0 (root) must still be usable after the failed walk.
    let wqid = client.walk(0, 2, vec!["greeting".to_owned()]).await.unwrap();
    assert_eq!(wqid.len(), 1);

    // the newfid from the failed walk (S5, §8) was never bound: it is
    // still free and can be walked into fresh.
    let wqid = client.walk(0, 1, vec!["greeting".to_owned()]).await.unwrap();
    assert_eq!(wqid.len(), 1);
}

#[tokio::test]
async fn clunk_then_stat_on_the_same_fid_reports_unknown_fid() {
    // S6, §8: Tclunk always releases the fid, and a subsequent
    // operation against it reports the fid as gone.
    let client = serve_and_connect().await;
    client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();
    client.walk(0, 1, vec!["greeting".to_owned()]).await.unwrap();
    client.open(1, om::READ).await.unwrap();

    client.clunk(1).await.unwrap();

    let err = client.stat(1).await.unwrap_err();
    match err {
        Error::Backend(msg) => assert_eq!(msg, "unknown fid"),
        other => panic!("expected Rerror(\"unknown fid\"), got {other:?}"),
    }
}

#[tokio::test]
async fn write_then_read_back_through_a_second_fid() {
    let client = serve_and_connect().await;
    client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();
    client.walk(0, 1, vec!["greeting".to_owned()]).await.unwrap();
    client.open(1, om::RDWR).await.unwrap();
    client.write(1, 0, b"overwritten").await.unwrap();

    client.walk(0, 2, vec!["greeting".to_owned()]).await.unwrap();
    client.open(2, om::READ).await.unwrap();
    let data = client.read(2, 0, 4096).await.unwrap();
    assert_eq!(&data[..11], b"overwritten");
}

#[tokio::test]
async fn many_concurrent_requests_on_one_connection_each_get_their_own_answer() {
    let client = serve_and_connect().await;
    client.attach(0, ninep::fcall::NOFID, "glenda", "").await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=8u32 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.walk(0, i, vec!["greeting".to_owned()]).await.unwrap();
            client.open(i, om::READ).await.unwrap();
            let data = client.read(i, 0, 4096).await.unwrap();
            client.clunk(i).await.unwrap();
            data
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), b"hello, 9p\n");
    }
}

#[tokio::test]
async fn tauth_is_rejected_when_the_server_has_no_verifier() {
    let client = serve_and_connect().await;
    let err = client.auth(10, "glenda", "").await.unwrap_err();
    match err {
        Error::Backend(msg) => assert_eq!(msg, "authentication not required"),
        other => panic!("expected Rerror(\"authentication not required\"), got {other:?}"),
    }
}

#[tokio::test]
async fn attach_without_completing_auth_is_rejected() {
    let client = serve_and_connect_with_verifier(Some(Arc::new(EchoVerifier))).await;
    client.auth(10, "glenda", "").await.unwrap();

    let err = client.attach(0, 10, "glenda", "").await.unwrap_err();
    match err {
        Error::Backend(msg) => assert_eq!(msg, "afid not authenticated"),
        other => panic!("expected Rerror(\"afid not authenticated\"), got {other:?}"),
    }
}

#[tokio::test]
async fn attach_uname_mismatch_against_an_authenticated_afid_is_rejected() {
    let client = serve_and_connect_with_verifier(Some(Arc::new(EchoVerifier))).await;
    client.auth(10, "glenda", "").await.unwrap();
    let challenge = client.read(10, 0, 64).await.unwrap();
    client.write(10, 0, &challenge).await.unwrap();

    let err = client.attach(0, 10, "someone-else", "").await.unwrap_err();
    match err {
        Error::Backend(msg) => assert_eq!(msg, "uname does not match authenticated identity"),
        other => panic!("expected Rerror(\"uname does not match authenticated identity\"), got {other:?}"),
    }
}

#[tokio::test]
async fn bad_auth_response_is_rejected_and_good_response_completes_the_handshake() {
    let client = serve_and_connect_with_verifier(Some(Arc::new(EchoVerifier))).await;
    client.auth(10, "glenda", "").await.unwrap();
    let challenge = client.read(10, 0, 64).await.unwrap();

    let mut wrong = challenge.clone();
    wrong[0] ^= 0xFF;
    let err = client.write(10, 0, &wrong).await.unwrap_err();
    match err {
        Error::Backend(msg) => assert_eq!(msg, "authentication failed"),
        other => panic!("expected Rerror(\"authentication failed\"), got {other:?}"),
    }

    client.write(10, 0, &challenge).await.unwrap();
    client.attach(0, 10, "glenda", "").await.unwrap();
}

#[tokio::test]
async fn two_auth_handshakes_issue_distinct_challenges() {
    let client = serve_and_connect_with_verifier(Some(Arc::new(EchoVerifier))).await;
    client.auth(10, "glenda", "").await.unwrap();
    client.auth(11, "glenda", "").await.unwrap();

    let a = client.read(10, 0, 64).await.unwrap();
    let b = client.read(11, 0, 64).await.unwrap();
    assert_ne!(a, b);
}
