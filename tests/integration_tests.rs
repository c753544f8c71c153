use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use ssmprov::protocol::FULL_STOP;
use ssmprov::{
    ByteTokenizer, CheckpointStore, ConnectionOptions, Model, Result, SamplingSettings, Server, Session,
    SessionHandle, TokenId, Tokenizer, TurnLimits,
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Feed(String),
    Token,
    Serialize,
    Deserialize,
}

/// Answers every prompt with the same script, then end-of-sequence.
/// State is the full byte history; every call is logged.
struct ScriptedModel {
    tokenizer: ByteTokenizer,
    reply: Vec<u8>,
    pos: usize,
    step_delay: Duration,
    events: Arc<Mutex<Vec<Event>>>,
}

impl ScriptedModel {
    fn new(reply: &str) -> Self {
        Self {
            tokenizer: ByteTokenizer::new(),
            reply: reply.as_bytes().to_vec(),
            pos: 0,
            step_delay: Duration::ZERO,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Model for ScriptedModel {
    type State = Vec<u8>;

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn initial_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn step(&mut self, state: &mut Vec<u8>, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let bytes = self.tokenizer.decode(tokens)?;
        if tokens.len() == 1 {
            self.pos += 1;
            self.events.lock().push(Event::Token);
        } else {
            self.pos = 0;
            self.events.lock().push(Event::Feed(String::from_utf8_lossy(&bytes).into_owned()));
        }
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        state.extend(bytes);

        let next = self.reply.get(self.pos).copied().unwrap_or(0);
        let mut logits = vec![-30.0; 256];
        logits[next as usize] = 30.0;
        Ok(logits)
    }

    fn serialize(&self, state: &Vec<u8>) -> Result<Vec<u8>> {
        self.events.lock().push(Event::Serialize);
        Ok(state.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.events.lock().push(Event::Deserialize);
        Ok(bytes.to_vec())
    }

    fn eos_token(&self) -> Option<TokenId> {
        Some(TokenId(0))
    }
}

struct Harness {
    dir: tempfile::TempDir,
    addr: SocketAddr,
}

impl Harness {
    fn store(&self) -> CheckpointStore {
        CheckpointStore::open(self.dir.path()).unwrap()
    }
}

async fn start(model: ScriptedModel, options: ConnectionOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    let session = Session::new(model, store, TurnLimits::default(), 3);
    let (handle, _worker) = SessionHandle::spawn(session).unwrap();

    let server = Server::bind("127.0.0.1:0", handle, options).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Harness { dir, addr }
}

async fn send_frame(stream: &mut TcpStream, body: &str) {
    stream.write_all(body.as_bytes()).await.unwrap();
    stream.write_all(&[0]).await.unwrap();
}

async fn read_reply<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut buf = Vec::new();
    reader.read_until(0, &mut buf).await.unwrap();
    assert_eq!(buf.pop(), Some(0), "reply must be NUL-terminated");
    String::from_utf8(buf).unwrap()
}

async fn request(addr: SocketAddr, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_frame(&mut stream, body).await;
    read_reply(&mut BufReader::new(stream)).await
}

#[tokio::test]
async fn test_checkpoint_scenario_over_tcp() {
    let harness = start(ScriptedModel::new("Hi!\n\n~~~(end)~~~\n\n"), ConnectionOptions::default()).await;

    assert_eq!(request(harness.addr, "/save blank").await, "[saved -> blank (0B)]\n");

    let coder = SamplingSettings {
        temperature: 0.0,
        ..SamplingSettings::default()
    };
    harness.store().save_settings("coder", &coder.to_blob().unwrap()).unwrap();

    let reply = request(harness.addr, "!blank coder session1\nUSER: Hello\n\n~~~(end)~~~\n\nINTERFACE: ").await;
    assert_eq!(reply, "Hi!\n\n~~~(end)~~~\n\n");
    assert_eq!(request(harness.addr, "/t").await, "0");

    let saved = harness.store().load_state("session1").unwrap();
    assert_eq!(saved, b"USER: Hello\n\n~~~(end)~~~\n\nINTERFACE: Hi!\n\n~~~(end)~~~\n\n");

    let names: Vec<_> = harness.store().list().unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["blank", "coder", "session1"]);
}

#[tokio::test]
async fn test_errors_are_replies() {
    let harness = start(ScriptedModel::new(""), ConnectionOptions::default()).await;

    assert_eq!(
        request(harness.addr, "!missing\nhello").await,
        "[load error] checkpoint not found: missing\n"
    );
    assert_eq!(
        request(harness.addr, "/bogus").await,
        "[protocol error] unknown command: /bogus\n"
    );
    assert_eq!(request(harness.addr, "").await, "");
}

#[tokio::test]
async fn test_forced_stop_is_marker_terminated() {
    let harness = start(ScriptedModel::new("rambling on and on"), ConnectionOptions::default()).await;

    assert_eq!(request(harness.addr, "/max 4").await, "4");
    let reply = request(harness.addr, "USER: talk\n\n~~~(end)~~~\n\nINTERFACE: ").await;
    assert_eq!(reply, format!("ramb{}", FULL_STOP));
    assert!(reply.as_bytes()[reply.len() - 15..] == *FULL_STOP.as_bytes());
}

#[tokio::test]
async fn test_oversized_frame_closes_without_reply() {
    let options = ConnectionOptions {
        max_frame_bytes: 16,
        keep_alive: true,
    };
    let harness = start(ScriptedModel::new(""), options).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&[b'x'; 64]).await.unwrap();

    let mut buf = Vec::new();
    match stream.read_to_end(&mut buf).await {
        Ok(_) => assert!(buf.is_empty()),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }

    assert_eq!(request(harness.addr, "/k").await, "40");
}

#[tokio::test]
async fn test_keep_alive_serves_many_frames() {
    let options = ConnectionOptions {
        keep_alive: true,
        ..ConnectionOptions::default()
    };
    let harness = start(ScriptedModel::new(""), options).await;

    let stream = TcpStream::connect(harness.addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    write.write_all(b"/t 0.5\0").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "0.5");
    write.write_all(b"/t\0").await.unwrap();
    assert_eq!(read_reply(&mut reader).await, "0.5");
}

#[tokio::test]
async fn test_one_frame_per_connection_by_default() {
    let harness = start(ScriptedModel::new(""), ConnectionOptions::default()).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(b"/k\0").await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"40\0");
}

#[tokio::test]
async fn test_concurrent_requests_never_interleave() {
    let mut model = ScriptedModel::new("fine\n\n~~~(end)~~~\n\n");
    model.step_delay = Duration::from_millis(2);
    let events = model.events.clone();
    let harness = start(model, ConnectionOptions::default()).await;

    request(harness.addr, "/save blank").await;
    events.lock().clear();

    let (a, b) = tokio::join!(
        request(harness.addr, "!blank - a\nAAAA"),
        request(harness.addr, "!blank - b\nBBBB"),
    );
    assert_eq!(a, "fine\n\n~~~(end)~~~\n\n");
    assert_eq!(b, "fine\n\n~~~(end)~~~\n\n");

    // Each request is load, feed, tokens, save; one block must finish
    // before the next block's load.
    let events = events.lock().clone();
    let blocks: Vec<&[Event]> = events.split_inclusive(|e| *e == Event::Serialize).collect();
    assert_eq!(blocks.len(), 2, "{:?}", events);
    for block in blocks {
        assert_eq!(block.first(), Some(&Event::Deserialize));
        assert_eq!(block.last(), Some(&Event::Serialize));
        let feeds: Vec<_> = block
            .iter()
            .filter_map(|e| match e {
                Event::Feed(text) => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(feeds.len(), 1, "{:?}", block);
        assert!(block.iter().filter(|e| **e == Event::Deserialize).count() == 1);
    }

    let a_state = harness.store().load_state("a").unwrap();
    let b_state = harness.store().load_state("b").unwrap();
    assert_eq!(a_state, b"AAAAfine\n\n~~~(end)~~~\n\n");
    assert_eq!(b_state, b"BBBBfine\n\n~~~(end)~~~\n\n");
}
