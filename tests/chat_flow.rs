// tests/chat_flow.rs
//! Black-box coverage over real sockets: authentication, history replay,
//! broadcast fan-out, private delivery (online and queued), claims and
//! bans, comments, and the loose framing rules.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use room_chat::protocol::HELP_LINES;
use room_chat::server::ChatServer;
use room_chat::settings::Settings;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    db_path: String,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Binds port 0, seeds an empty registry in /tmp and runs the server in
    /// the background. `tweak` adjusts settings before startup.
    async fn spawn_with(tweak: impl FnOnce(&mut Settings)) -> Self {
        let db_path = format!(
            "/tmp/room_chat_test_{}.json",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        std::fs::write(&db_path, "[]").unwrap();

        let mut settings = Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_chat_messages: 100,
            message_ttl: 3600,
            time_of_ban: 120,
            user_database_filename: db_path.clone(),
            verbose: 0,
        };
        tweak(&mut settings);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(ChatServer::new(settings).run_on(listener, shutdown.clone()));

        TestServer {
            addr,
            shutdown,
            db_path,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let _ = std::fs::remove_file(&self.db_path);
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        let (read, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn register(server: &TestServer, nick: &str, password: &str) -> Self {
        let mut client = Self::connect(server).await;
        client.send(&format!("new {} {}", nick, password)).await;
        client
    }

    async fn login(server: &TestServer, nick: &str, password: &str) -> Self {
        let mut client = Self::connect(server).await;
        client.send(&format!("{} {}", nick, password)).await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send_raw(&mut self, payload: &[u8]) {
        self.writer.write_all(payload).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed");
        assert!(n > 0, "connection closed while a frame was expected");
        line.trim_end_matches('\n').to_string()
    }

    /// Round-trips `@help` to make sure the session finished logging in and
    /// holds its roster entry before another client depends on it.
    async fn sync(&mut self) {
        self.send("@help").await;
        for _ in HELP_LINES {
            self.recv().await;
        }
    }

    /// Asserts the server sends nothing within a short window.
    async fn expect_silence(&mut self) {
        let mut line = String::new();
        let result = timeout(SILENCE_WINDOW, self.reader.read_line(&mut line)).await;
        assert!(result.is_err(), "unexpected frame: {}", line.trim_end());
    }

    /// Asserts the server closed the connection.
    async fn expect_closed(&mut self) {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the close")
            .expect("read failed");
        assert_eq!(n, 0, "expected EOF, got: {}", line.trim_end());
    }
}

// --- S1: broadcast fan-out and clipped history replay -----------------------

#[tokio::test]
async fn broadcast_fanout_and_history_replay() {
    let server = TestServer::spawn_with(|s| s.max_chat_messages = 2).await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send("hello").await;
    let own = a.recv().await;
    assert!(own.starts_with("Chat![0] ("), "got: {}", own);
    assert!(own.ends_with(") A: hello"));

    let mut b = TestClient::register(&server, "B", "pw").await;
    let replayed = b.recv().await;
    assert!(replayed.starts_with("History![0] ("));
    assert!(replayed.ends_with(") A: hello"));

    b.send("hi").await;
    assert!(a.recv().await.ends_with(") B: hi"));
    assert!(b.recv().await.starts_with("Chat![1] ("));

    let mut c = TestClient::register(&server, "C", "pw").await;
    let first = c.recv().await;
    let second = c.recv().await;
    assert!(first.starts_with("History![0] ("));
    assert!(first.ends_with(") A: hello"));
    assert!(second.starts_with("History![1] ("));
    assert!(second.ends_with(") B: hi"));
    c.expect_silence().await;
}

#[tokio::test]
async fn history_replay_is_clipped_to_the_newest_entries() {
    let server = TestServer::spawn_with(|s| s.max_chat_messages = 2).await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    for body in ["one", "two", "three"] {
        a.send(body).await;
        a.recv().await;
    }

    let mut b = TestClient::register(&server, "B", "pw").await;
    assert!(b.recv().await.ends_with(") A: two"));
    assert!(b.recv().await.ends_with(") A: three"));
    b.expect_silence().await;
}

#[tokio::test]
async fn indices_increase_monotonically() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    for (expected, body) in ["first", "second", "third"].iter().enumerate() {
        a.send(body).await;
        let frame = a.recv().await;
        assert!(
            frame.starts_with(&format!("Chat![{}] (", expected)),
            "got: {}",
            frame
        );
    }
}

// --- S2/S3: private messages, online and queued -----------------------------

#[tokio::test]
async fn private_message_to_online_user() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    let mut b = TestClient::register(&server, "B", "pw").await;
    b.sync().await;

    a.send("@B how are you").await;
    let delivered = b.recv().await;
    assert!(delivered.starts_with("Private!("), "got: {}", delivered);
    assert!(delivered.ends_with(") A: how are you"));
    assert_eq!(a.recv().await, "Server!Private message was sent to B");

    // No Chat! frame anywhere.
    a.expect_silence().await;
    b.expect_silence().await;
}

#[tokio::test]
async fn private_message_to_offline_user_queues_until_next_login() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    let mut b = TestClient::register(&server, "B", "pw").await;
    b.send("@exit").await;
    b.expect_closed().await;

    a.send("@B later").await;
    assert_eq!(a.recv().await, "Server!User B is not connected");

    let mut b = TestClient::login(&server, "B", "pw").await;
    let queued = b.recv().await;
    assert!(queued.starts_with("Private!("));
    assert!(queued.ends_with(") A: later"));
    b.expect_silence().await;
    b.send("@exit").await;
    b.expect_closed().await;

    // Delivered at most once: the next login gets nothing.
    let mut b = TestClient::login(&server, "B", "pw").await;
    b.expect_silence().await;
}

#[tokio::test]
async fn queued_privates_arrive_in_send_order() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    let mut b = TestClient::register(&server, "B", "pw").await;
    b.send("@exit").await;
    b.expect_closed().await;

    a.send("@B first").await;
    a.recv().await;
    a.send("@B second").await;
    a.recv().await;

    let mut b = TestClient::login(&server, "B", "pw").await;
    assert!(b.recv().await.ends_with(") A: first"));
    assert!(b.recv().await.ends_with(") A: second"));
}

#[tokio::test]
async fn private_message_to_unknown_user_is_rejected() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send("@ghost hello").await;
    assert_eq!(a.recv().await, "Server!User ghost is not registered");
}

// --- S4: claims and bans ----------------------------------------------------

#[tokio::test]
async fn three_claims_mute_broadcasts_but_not_commands() {
    let server = TestServer::spawn_with(|s| s.time_of_ban = 60).await;

    let mut x = TestClient::register(&server, "X", "pw").await;
    let mut y = TestClient::register(&server, "Y", "pw").await;
    let mut z = TestClient::register(&server, "Z", "pw").await;
    let mut t = TestClient::register(&server, "T", "pw").await;
    t.sync().await;

    for claimer in [&mut x, &mut y, &mut z] {
        claimer.send("@claim T").await;
        assert_eq!(claimer.recv().await, "Server!Claim on user T accepted");
    }

    t.send("hello").await;
    assert_eq!(
        t.recv().await,
        "Server!You are not allowed to send messages (1 minutes left)"
    );
    x.expect_silence().await;

    // Commands keep working while muted.
    t.send("@X psst").await;
    assert!(x.recv().await.ends_with(") T: psst"));
    assert_eq!(t.recv().await, "Server!Private message was sent to X");
}

#[tokio::test]
async fn expired_ban_frees_the_user() {
    let server = TestServer::spawn_with(|s| s.time_of_ban = 1).await;

    let mut x = TestClient::register(&server, "X", "pw").await;
    let mut y = TestClient::register(&server, "Y", "pw").await;
    let mut z = TestClient::register(&server, "Z", "pw").await;
    let mut t = TestClient::register(&server, "T", "pw").await;
    t.sync().await;

    for claimer in [&mut x, &mut y, &mut z] {
        claimer.send("@claim T").await;
        claimer.recv().await;
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    t.send("free again").await;
    for client in [&mut x, &mut y, &mut z, &mut t] {
        assert!(client.recv().await.ends_with(") T: free again"));
    }
}

#[tokio::test]
async fn claims_against_offline_or_unknown_users_do_not_count() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    let mut b = TestClient::register(&server, "B", "pw").await;
    b.send("@exit").await;
    b.expect_closed().await;

    a.send("@claim B").await;
    assert_eq!(a.recv().await, "Server!User B is not connected");
    a.send("@claim ghost").await;
    assert_eq!(a.recv().await, "Server!User ghost is not registered");
}

// --- S5: comments -----------------------------------------------------------

#[tokio::test]
async fn comment_quotes_the_original_message() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send("hello").await;
    a.recv().await;

    let mut b = TestClient::register(&server, "B", "pw").await;
    b.recv().await; // replayed hello

    b.send("@comment0 ack").await;
    for client in [&mut a, &mut b] {
        let quote = client.recv().await;
        let fresh = client.recv().await;
        assert!(quote.starts_with("Chat!Commenting [0] ("), "got: {}", quote);
        assert!(quote.ends_with(") A: hello"));
        assert!(fresh.starts_with("[1] ("), "got: {}", fresh);
        assert!(fresh.ends_with(") B: ack"));
    }

    // The composite is history too: a fresh login replays the quote.
    let mut c = TestClient::register(&server, "C", "pw").await;
    assert!(c.recv().await.starts_with("History![0] ("));
    assert!(c.recv().await.starts_with("History!Commenting [0] ("));
    assert!(c.recv().await.starts_with("[1] ("));
    c.expect_silence().await;
}

#[tokio::test]
async fn comment_on_missing_message_is_not_broadcast() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    let mut b = TestClient::register(&server, "B", "pw").await;

    b.send("@comment55 late").await;
    assert_eq!(b.recv().await, "Server!Message not found or deleted!");
    a.expect_silence().await;
}

// --- S6 and the rest of authentication --------------------------------------

#[tokio::test]
async fn duplicate_registration_is_rejected_but_login_still_works() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send("hello").await;
    a.recv().await;

    let mut dup = TestClient::connect(&server).await;
    dup.send("new A pw2").await;
    assert_eq!(dup.recv().await, "AuthError!User already exists!");
    dup.expect_closed().await;

    a.send("@exit").await;
    a.expect_closed().await;

    let mut again = TestClient::login(&server, "A", "pw").await;
    assert!(again.recv().await.starts_with("History![0] ("));

    let mut wrong = TestClient::login(&server, "A", "pw2").await;
    assert_eq!(wrong.recv().await, "AuthError!Wrong password! Try again!");
    wrong.expect_closed().await;
}

#[tokio::test]
async fn unknown_user_cannot_log_in() {
    let server = TestServer::spawn().await;

    let mut ghost = TestClient::login(&server, "ghost", "pw").await;
    assert_eq!(ghost.recv().await, "AuthError!User not found! Register first!");
    ghost.expect_closed().await;
}

#[tokio::test]
async fn malformed_auth_line_closes_the_connection() {
    let server = TestServer::spawn().await;

    let mut bad = TestClient::connect(&server).await;
    bad.send("justonetoken").await;
    assert_eq!(bad.recv().await, "AuthError!Wrong command format! Try later!");
    bad.expect_closed().await;

    let mut bad = TestClient::connect(&server).await;
    bad.send("too many tokens here").await;
    assert_eq!(bad.recv().await, "AuthError!Wrong command format! Try later!");
    bad.expect_closed().await;
}

#[tokio::test]
async fn second_login_for_an_online_nickname_is_rejected() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.sync().await;

    let mut intruder = TestClient::login(&server, "A", "pw").await;
    assert_eq!(intruder.recv().await, "AuthError!User already connected!");
    intruder.expect_closed().await;

    // The established session is untouched.
    a.send("still here").await;
    assert!(a.recv().await.ends_with(") A: still here"));
}

// --- Commands and framing ---------------------------------------------------

#[tokio::test]
async fn help_returns_the_full_help_text() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send("@help").await;
    for expected in HELP_LINES {
        assert_eq!(a.recv().await, expected);
    }
    a.expect_silence().await;
}

#[tokio::test]
async fn malformed_commands_keep_the_session_open() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    for bad in ["@", "@nobodyhere", "@comment nan text", "@claim a b"] {
        a.send(bad).await;
        assert_eq!(
            a.recv().await,
            "Server!Don't use @ symbol if its not a command!"
        );
    }

    a.send("still alive").await;
    assert!(a.recv().await.ends_with(") A: still alive"));
}

#[tokio::test]
async fn fragmented_auth_line_is_buffered_to_the_newline() {
    let server = TestServer::spawn().await;

    // The first exchange is strictly line-delimited: a registration split
    // across two TCP writes must still parse as one line.
    let mut a = TestClient::connect(&server).await;
    a.send_raw(b"new A p").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.send_raw(b"w\n").await;

    a.send("hello").await;
    let frame = a.recv().await;
    assert!(frame.ends_with(") A: hello"), "got: {}", frame);
}

#[tokio::test]
async fn unterminated_payload_counts_as_one_message() {
    let server = TestServer::spawn().await;

    let mut a = TestClient::register(&server, "A", "pw").await;
    a.send_raw(b"no newline here").await;
    let frame = a.recv().await;
    assert!(frame.ends_with(") A: no newline here"), "got: {}", frame);
}
