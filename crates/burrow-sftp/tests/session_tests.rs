//! End-to-end SFTP session tests
//!
//! Runs the session pump over an in-memory duplex stream and speaks raw
//! SFTP v3 packets to it, the way an SSH channel would carry them.

use burrow_sftp::dispatcher::DEFAULT_MAX_READ_LEN;
use burrow_sftp::protocol::{MessageType, OpenFlags, SFTP_VERSION, StatusCode, codec};
use burrow_sftp::{Dispatcher, Error, HandleTable, Jail, session};
use bytes::{BufMut, BytesMut};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const MAX_PACKET_SIZE: u32 = 32768;

/// Client end of a running session
struct TestClient {
    stream: DuplexStream,
    server: JoinHandle<burrow_sftp::Result<()>>,
}

/// Decoded server reply
#[derive(Debug)]
struct Reply {
    kind: u8,
    id: u32,
    body: Vec<u8>,
}

impl Reply {
    fn status(&self) -> (StatusCode, String) {
        assert_eq!(self.kind, MessageType::Status as u8, "expected STATUS, got {self:?}");
        let mut buf = self.body.as_slice();
        let code = codec::get_u32(&mut buf).unwrap();
        let message = codec::get_string(&mut buf).unwrap();
        let code = [
            StatusCode::Ok,
            StatusCode::Eof,
            StatusCode::NoSuchFile,
            StatusCode::PermissionDenied,
            StatusCode::Failure,
            StatusCode::BadMessage,
            StatusCode::NoConnection,
            StatusCode::ConnectionLost,
            StatusCode::OpUnsupported,
        ]
        .into_iter()
        .find(|c| u32::from(*c) == code)
        .unwrap();
        (code, message)
    }

    fn handle(&self) -> Vec<u8> {
        assert_eq!(self.kind, MessageType::Handle as u8, "expected HANDLE, got {self:?}");
        codec::get_bytes(&mut self.body.as_slice()).unwrap()
    }

    fn data(&self) -> Vec<u8> {
        assert_eq!(self.kind, MessageType::Data as u8, "expected DATA, got {self:?}");
        codec::get_bytes(&mut self.body.as_slice()).unwrap()
    }

    fn names(&self) -> Vec<(String, String)> {
        assert_eq!(self.kind, MessageType::Name as u8, "expected NAME, got {self:?}");
        let mut buf = self.body.as_slice();
        let count = codec::get_u32(&mut buf).unwrap();
        (0..count)
            .map(|_| {
                let filename = codec::get_string(&mut buf).unwrap();
                let longname = codec::get_string(&mut buf).unwrap();
                burrow_sftp::protocol::FileAttrs::decode(&mut buf).unwrap();
                (filename, longname)
            })
            .collect()
    }
}

impl TestClient {
    fn start(root: &std::path::Path) -> Self {
        let jail = Jail::new(root).unwrap();
        let dispatcher = Dispatcher::new(jail, HandleTable::default(), DEFAULT_MAX_READ_LEN);
        let (stream, server_end) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            session::serve(server_end, dispatcher, MAX_PACKET_SIZE, "tester").await
        });
        Self { stream, server }
    }

    async fn send_raw(&mut self, body: &[u8]) {
        let mut frame = BytesMut::new();
        frame.put_u32(u32::try_from(body.len()).unwrap());
        frame.put_slice(body);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send(&mut self, kind: MessageType, id: u32, payload: &[u8]) {
        let mut body = BytesMut::new();
        body.put_u8(kind as u8);
        body.put_u32(id);
        body.put_slice(payload);
        self.send_raw(&body).await;
    }

    async fn recv(&mut self) -> Reply {
        let len = self.stream.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body).await.unwrap();

        let kind = body[0];
        if kind == MessageType::Version as u8 {
            return Reply {
                kind,
                id: 0,
                body: body[1..].to_vec(),
            };
        }
        Reply {
            kind,
            id: u32::from_be_bytes([body[1], body[2], body[3], body[4]]),
            body: body[5..].to_vec(),
        }
    }

    async fn init(&mut self) {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Init as u8);
        body.put_u32(SFTP_VERSION);
        self.send_raw(&body).await;

        let reply = self.recv().await;
        assert_eq!(reply.kind, MessageType::Version as u8);
        assert_eq!(reply.body, SFTP_VERSION.to_be_bytes());
    }

    async fn request(&mut self, kind: MessageType, id: u32, payload: &[u8]) -> Reply {
        self.send(kind, id, payload).await;
        let reply = self.recv().await;
        assert_eq!(reply.id, id);
        reply
    }

    async fn finish(self) -> burrow_sftp::Result<()> {
        drop(self.stream);
        self.server.await.unwrap()
    }
}

fn path_payload(path: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_string(&mut buf, path);
    buf.to_vec()
}

fn handle_payload(handle: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_bytes(&mut buf, handle);
    buf.to_vec()
}

fn open_payload(path: &str, pflags: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_string(&mut buf, path);
    buf.put_u32(pflags);
    buf.put_u32(0); // no attributes
    buf.to_vec()
}

fn read_payload(handle: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_bytes(&mut buf, handle);
    buf.put_u64(offset);
    buf.put_u32(len);
    buf.to_vec()
}

/// INIT is answered with VERSION 3
#[tokio::test]
async fn test_init_version_exchange() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = TestClient::start(temp_dir.path());

    client.init().await;
    assert!(client.finish().await.is_ok());
}

/// open, read to EOF and close over the wire
#[tokio::test]
async fn test_open_read_close() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("greeting.txt"), b"hello, sftp").unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    let handle = client
        .request(MessageType::Open, 1, &open_payload("/greeting.txt", OpenFlags::READ))
        .await
        .handle();
    assert_eq!(handle, b"handle-0");

    let data = client
        .request(MessageType::Read, 2, &read_payload(&handle, 0, 4096))
        .await
        .data();
    assert_eq!(data, b"hello, sftp");

    let (code, _) = client
        .request(MessageType::Read, 3, &read_payload(&handle, 11, 4096))
        .await
        .status();
    assert_eq!(code, StatusCode::Eof);

    let (code, _) = client
        .request(MessageType::Close, 4, &handle_payload(&handle))
        .await
        .status();
    assert_eq!(code, StatusCode::Ok);

    assert!(client.finish().await.is_ok());
}

/// opendir/readdir list the root, then report EOF
#[tokio::test]
async fn test_directory_listing() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("a.txt"), b"aaaa").unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    let handle = client
        .request(MessageType::Opendir, 7, &path_payload("."))
        .await
        .handle();

    let names = client
        .request(MessageType::Readdir, 8, &handle_payload(&handle))
        .await
        .names();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].0, "a.txt");
    assert!(names[0].1.starts_with("-rw"));
    assert!(names[0].1.ends_with(" a.txt"));

    let (code, _) = client
        .request(MessageType::Readdir, 9, &handle_payload(&handle))
        .await
        .status();
    assert_eq!(code, StatusCode::Eof);

    assert!(client.finish().await.is_ok());
}

/// Write requests are declined with OP_UNSUPPORTED
#[tokio::test]
async fn test_unsupported_operation_status() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    let (code, _) = client
        .request(MessageType::Remove, 5, &path_payload("anything"))
        .await
        .status();
    assert_eq!(code, StatusCode::OpUnsupported);

    let (code, _) = client
        .request(
            MessageType::Open,
            6,
            &open_payload("new.txt", OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC),
        )
        .await
        .status();
    assert_eq!(code, StatusCode::OpUnsupported);
    assert!(!temp_dir.path().join("new.txt").exists());

    assert!(client.finish().await.is_ok());
}

/// A symlink out of the root is refused over the wire too
#[tokio::test]
async fn test_symlink_escape_over_session() {
    let temp_dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
    std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("escape")).unwrap();

    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    let (code, message) = client
        .request(
            MessageType::Open,
            1,
            &open_payload("escape/secret.txt", OpenFlags::READ),
        )
        .await
        .status();
    assert_eq!(code, StatusCode::Failure);
    assert!(message.starts_with("Bad path"));

    assert!(client.finish().await.is_ok());
}

/// A malformed request with a readable id gets a FAILURE status
#[tokio::test]
async fn test_malformed_request_gets_status() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    // READ with a truncated handle string
    let reply = client.request(MessageType::Read, 42, &[0, 0, 0, 9, b'h']).await;
    let (code, _) = reply.status();
    assert_eq!(code, StatusCode::Failure);

    // The session keeps going
    let (code, _) = client
        .request(MessageType::Stat, 43, &path_payload("missing"))
        .await
        .status();
    assert_eq!(code, StatusCode::NoSuchFile);

    assert!(client.finish().await.is_ok());
}

/// An unknown request type with a readable id is declined, not failed
#[tokio::test]
async fn test_unknown_request_type_unsupported() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    client.send_raw(&[42, 0, 0, 0, 5]).await;
    let reply = client.recv().await;
    assert_eq!(reply.id, 5);
    assert_eq!(reply.status().0, StatusCode::OpUnsupported);

    // Truncated packets still get FAILURE
    let (code, _) = client
        .request(MessageType::Opendir, 6, &[0, 0, 0, 50])
        .await
        .status();
    assert_eq!(code, StatusCode::Failure);

    assert!(client.finish().await.is_ok());
}

/// A client that pipelines past a short reply can still fetch the gap
#[tokio::test]
async fn test_pipelined_reads_over_session() {
    let temp_dir = TempDir::new().unwrap();
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(temp_dir.path().join("big.bin"), &content).unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    let handle = client
        .request(MessageType::Open, 1, &open_payload("big.bin", OpenFlags::READ))
        .await
        .handle();

    // Three 64 KiB requests in flight before any reply is read
    for (id, offset) in [(2u32, 0u64), (3, 65_536), (4, 131_072)] {
        client
            .send(MessageType::Read, id, &read_payload(&handle, offset, 65_536))
            .await;
    }
    let mut downloaded = Vec::new();
    let first = client.recv().await.data();
    assert_eq!(first.len(), DEFAULT_MAX_READ_LEN);
    downloaded.extend_from_slice(&first);
    let second = client.recv().await.data();
    let third = client.recv().await;
    assert_eq!(third.id, 4);
    assert_eq!(third.status().0, StatusCode::Eof);

    // Fill in what the capped replies left out
    let gap = client
        .request(MessageType::Read, 5, &read_payload(&handle, 32_768, 32_768))
        .await
        .data();
    downloaded.extend_from_slice(&gap);
    downloaded.extend_from_slice(&second);
    let tail = client
        .request(MessageType::Read, 6, &read_payload(&handle, 98_304, 32_768))
        .await
        .data();
    downloaded.extend_from_slice(&tail);
    assert_eq!(downloaded, content);

    let (code, _) = client
        .request(MessageType::Read, 7, &read_payload(&handle, 100_000, 32_768))
        .await
        .status();
    assert_eq!(code, StatusCode::Eof);

    assert!(client.finish().await.is_ok());
}

/// A request before INIT ends the session
#[tokio::test]
async fn test_request_before_init() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = TestClient::start(temp_dir.path());

    client.send(MessageType::Realpath, 1, &path_payload(".")).await;

    let result = client.finish().await;
    assert!(matches!(result, Err(Error::Protocol(_))));
}

/// Files left open are released when the client disconnects
#[tokio::test]
async fn test_disconnect_releases_handles() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("f.txt"), b"x").unwrap();
    let mut client = TestClient::start(temp_dir.path());
    client.init().await;

    for id in 0..3 {
        client
            .request(MessageType::Open, id, &open_payload("f.txt", OpenFlags::READ))
            .await
            .handle();
    }

    assert!(client.finish().await.is_ok());
}
