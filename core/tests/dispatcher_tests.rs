//! End-to-end dispatcher tests over loopback TCP

use ferricd_core::{Config, Core, ManualClock, OperatorConfig, PollBackend, Server, SocketEngine};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

fn start_server() -> Server {
    let mut config = Config::default();
    config.listen.address = "127.0.0.1:0".to_string();
    config.dns.enabled = false;
    config.operators.push(OperatorConfig {
        name: "root".to_string(),
        password: "secret".to_string(),
    });
    let engine = SocketEngine::with_backend(Box::new(PollBackend::new())).expect("engine");
    let core = Core::with_parts(config, Box::new(ManualClock::new(0)), engine).expect("core");
    Server::with_core(core).expect("server")
}

struct TestClient {
    stream: TcpStream,
    received: String,
}

impl TestClient {
    fn connect(server: &Server) -> Self {
        let stream = TcpStream::connect(server.local_addr()).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");
        stream.set_nodelay(true).expect("nodelay");
        // Let the listener pick the connection up.
        for _ in 0..5 {
            server.run_once(10);
        }
        Self {
            stream,
            received: String::new(),
        }
    }

    fn send(&mut self, server: &Server, line: &str) {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .expect("write");
        for _ in 0..5 {
            server.run_once(10);
        }
    }

    fn drain(&mut self) {
        self.stream.set_nonblocking(true).expect("nonblocking");
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.received.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("read failed: {}", e),
            }
        }
        self.stream.set_nonblocking(false).expect("blocking");
    }

    /// Pump the server until `pattern` shows up in the stream
    fn expect(&mut self, server: &Server, pattern: &str) {
        for _ in 0..100 {
            server.run_once(10);
            self.drain();
            if self.received.contains(pattern) {
                return;
            }
        }
        panic!(
            "never received {:?}; got:\n{}",
            pattern, self.received
        );
    }

    fn assert_not_received(&mut self, server: &Server, pattern: &str) {
        for _ in 0..10 {
            server.run_once(10);
        }
        self.drain();
        assert!(
            !self.received.contains(pattern),
            "unexpectedly received {:?}:\n{}",
            pattern,
            self.received
        );
    }

    fn register(server: &Server, nick: &str) -> Self {
        let mut client = Self::connect(server);
        client.send(server, &format!("NICK {}", nick));
        client.send(server, &format!("USER {} 0 * :{}", nick, nick));
        client.expect(server, &format!(" 001 {} ", nick));
        client
    }
}

#[test]
fn registration_emits_the_welcome_burst() {
    let server = start_server();
    let mut client = TestClient::connect(&server);

    client.send(&server, "NICK alice");
    client.send(&server, "USER al 0 * :Alice Wonderland");
    client.expect(
        &server,
        ":irc.example.net 001 alice :Welcome to the Internet Relay Network alice!al@127.0.0.1",
    );
    client.expect(&server, " 002 alice ");
    client.expect(&server, " 003 alice ");
    client.expect(&server, " 004 alice ");
}

#[test]
fn commands_are_gated_on_registration() {
    let server = start_server();
    let mut client = TestClient::connect(&server);

    // Unknown verbs are dropped silently before registration.
    client.send(&server, "WIBBLE");
    client.assert_not_received(&server, "421");

    client.send(&server, "JOIN #test");
    client.expect(&server, " 451 * :You have not registered");
}

#[test]
fn unknown_commands_get_421_after_registration() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    alice.send(&server, "WIBBLE a b c");
    alice.expect(&server, " 421 alice WIBBLE :Unknown command");
}

#[test]
fn arity_is_enforced() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    alice.send(&server, "OPER root");
    alice.expect(&server, " 461 alice OPER :Not enough parameters");
}

#[test]
fn nick_collisions_are_rejected() {
    let server = start_server();
    let _alice = TestClient::register(&server, "alice");
    let mut imposter = TestClient::connect(&server);
    imposter.send(&server, "NICK alice");
    imposter.expect(&server, " 433 * alice :Nickname is already in use");
    imposter.send(&server, "NICK 1bad");
    imposter.expect(&server, " 432 * 1bad :Erroneous nickname");
}

#[test]
fn ping_pong_works_before_registration() {
    let server = start_server();
    let mut client = TestClient::connect(&server);
    client.send(&server, "PING 12345");
    client.expect(&server, ":irc.example.net PONG irc.example.net 12345");
}

#[test]
fn oper_authentication() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");

    alice.send(&server, "OPER root wrong");
    alice.expect(&server, " 464 alice :Password incorrect");

    alice.send(&server, "OPER root secret");
    alice.expect(&server, " 381 alice :You are now an IRC operator");
}

#[test]
fn channel_messaging_end_to_end() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");

    alice.send(&server, "JOIN #test");
    alice.expect(&server, ":alice!alice@127.0.0.1 JOIN #test");

    bob.send(&server, "JOIN #test");
    bob.expect(&server, ":bob!bob@127.0.0.1 JOIN #test");
    alice.expect(&server, ":bob!bob@127.0.0.1 JOIN #test");

    alice.send(&server, "PRIVMSG #test :hello there");
    bob.expect(&server, ":alice!alice@127.0.0.1 PRIVMSG #test :hello there");

    bob.send(&server, "PRIVMSG alice :hi back");
    alice.expect(&server, ":bob!bob@127.0.0.1 PRIVMSG alice :hi back");
}

#[test]
fn external_messages_blocked_by_plus_n() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut charlie = TestClient::register(&server, "charlie");

    alice.send(&server, "JOIN #priv");
    alice.expect(&server, "JOIN #priv");
    alice.send(&server, "MODE #priv +n");
    alice.expect(&server, ":alice!alice@127.0.0.1 MODE #priv +n");

    charlie.send(&server, "PRIVMSG #priv :let me in");
    charlie.expect(
        &server,
        " 404 charlie #priv :You cannot send messages to this channel whilst the +n (noextmsg) mode is set.",
    );
}

#[test]
fn mode_changes_require_channel_operator() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");

    alice.send(&server, "JOIN #ops");
    alice.expect(&server, "JOIN #ops");
    bob.send(&server, "JOIN #ops");
    bob.expect(&server, "JOIN #ops");

    bob.send(&server, "MODE #ops +t");
    bob.expect(
        &server,
        " 482 bob #ops :You must be a channel operator or higher to change channel modes.",
    );
}

#[test]
fn invalid_limit_parameter_gets_696() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");

    alice.send(&server, "JOIN #cap");
    alice.expect(&server, "JOIN #cap");
    alice.send(&server, "MODE #cap +l banana");
    alice.expect(
        &server,
        " 696 alice #cap l banana :Invalid limit mode parameter.",
    );

    alice.send(&server, "MODE #cap +l 2");
    alice.expect(&server, ":alice!alice@127.0.0.1 MODE #cap +l 2");
    alice.send(&server, "MODE #cap");
    alice.expect(&server, " 324 alice #cap :+l 2");
}

#[test]
fn channel_limit_is_enforced_on_join() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");
    let mut carol = TestClient::register(&server, "carol");

    alice.send(&server, "JOIN #small");
    alice.expect(&server, "JOIN #small");
    alice.send(&server, "MODE #small +l 2");
    alice.expect(&server, "MODE #small +l 2");

    bob.send(&server, "JOIN #small");
    bob.expect(&server, "JOIN #small");

    carol.send(&server, "JOIN #small");
    carol.expect(&server, " 471 carol #small :Cannot join channel (+l)");
}

#[test]
fn part_and_quit_notify_members() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");

    alice.send(&server, "JOIN #farewell");
    alice.expect(&server, "JOIN #farewell");
    bob.send(&server, "JOIN #farewell");
    bob.expect(&server, "JOIN #farewell");

    bob.send(&server, "PART #farewell :gone");
    alice.expect(&server, ":bob!bob@127.0.0.1 PART #farewell :gone");

    bob.send(&server, "JOIN #farewell");
    alice.expect(&server, ":bob!bob@127.0.0.1 JOIN #farewell");

    bob.send(&server, "QUIT :bye now");
    alice.expect(&server, ":bob!bob@127.0.0.1 QUIT :bye now");
    bob.expect(&server, "ERROR :Closing link: (bye now)");
}

#[test]
fn deaf_users_reject_private_messages() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");

    bob.send(&server, "MODE bob +D");
    bob.send(&server, "MODE bob");
    bob.expect(&server, " 221 bob +D");

    alice.send(&server, "PRIVMSG bob :anyone home?");
    alice.expect(
        &server,
        " 531 alice bob :You cannot send messages to this user whilst they have the +D (deaf) mode set.",
    );
}

#[test]
fn nick_change_is_seen_by_channel_members() {
    let server = start_server();
    let mut alice = TestClient::register(&server, "alice");
    let mut bob = TestClient::register(&server, "bob");

    alice.send(&server, "JOIN #rename");
    alice.expect(&server, "JOIN #rename");
    bob.send(&server, "JOIN #rename");
    bob.expect(&server, "JOIN #rename");

    alice.send(&server, "NICK alicia");
    alice.expect(&server, ":alice!alice@127.0.0.1 NICK alicia");
    bob.expect(&server, ":alice!alice@127.0.0.1 NICK alicia");

    // The new nick works as a PRIVMSG target; the old one is gone.
    bob.send(&server, "PRIVMSG alicia :still there?");
    alice.expect(&server, "PRIVMSG alicia :still there?");
    bob.send(&server, "PRIVMSG alice :hello?");
    bob.expect(&server, " 401 bob alice :No such nick");
}
