//! End-to-end tests driving the seamless-echo binary with real signals

mod common;

use common::{free_port, read_pid, wait_for, wait_with_timeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct EchoServer {
    child: Child,
    pidfile: PathBuf,
    port: u16,
    _dir: TempDir,
}

impl EchoServer {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("echo.pid");
        let port = free_port();

        let child = Command::new(env!("CARGO_BIN_EXE_seamless-echo"))
            .arg("--bind")
            .arg(format!("tcp://127.0.0.1:{port}"))
            .arg("--pidfile")
            .arg(&pidfile)
            .arg("--handoff-timeout-secs")
            .arg("10")
            .env_remove("RUST_LOG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let server = Self {
            child,
            pidfile,
            port,
            _dir: dir,
        };
        let pid = server.child.id() as i32;
        assert!(
            wait_for(Duration::from_secs(10), || server.pid() == Some(pid)),
            "server never wrote its pidfile"
        );
        server
    }

    fn pid(&self) -> Option<i32> {
        read_pid(&self.pidfile)
    }

    fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.child.id() as i32), signal).unwrap();
    }

    fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).unwrap()
    }

    fn echo(&self, line: &str) -> String {
        echo_over(self.connect(), line)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        // a restarted successor is not our child, find it through the pidfile
        if let Some(pid) = self.pid() {
            if pid != self.child.id() as i32 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn echo_over(mut stream: TcpStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).unwrap();
    reply
}

#[test]
fn test_writes_pidfile_and_echoes() {
    let server = EchoServer::start();
    assert_eq!(server.pid(), Some(server.child.id() as i32));
    assert_eq!(server.echo("hello\n"), "hello\n");
    assert_eq!(server.echo("world\n"), "world\n");
}

#[test]
fn test_terminate_idle_server_exits_zero() {
    let mut server = EchoServer::start();
    server.signal(Signal::SIGTERM);
    let status = wait_with_timeout(&mut server.child, Duration::from_secs(5))
        .expect("server did not exit after SIGTERM");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_interrupt_behaves_like_terminate() {
    let mut server = EchoServer::start();
    server.signal(Signal::SIGINT);
    let status = wait_with_timeout(&mut server.child, Duration::from_secs(5))
        .expect("server did not exit after SIGINT");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_active_connection_delays_exit() {
    let mut server = EchoServer::start();
    let mut slow = server.connect();
    thread::sleep(Duration::from_millis(300));

    server.signal(Signal::SIGTERM);
    thread::sleep(Duration::from_millis(500));
    assert!(server.child.try_wait().unwrap().is_none(), "exited with a connection still active");

    // no new connections once draining
    assert!(TcpStream::connect(("127.0.0.1", server.port)).is_err());

    slow.write_all(b"finally\n").unwrap();
    let mut reply = String::new();
    BufReader::new(slow).read_line(&mut reply).unwrap();
    assert_eq!(reply, "finally\n");

    let status = wait_with_timeout(&mut server.child, Duration::from_secs(5))
        .expect("server did not exit after its last connection finished");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_second_terminate_forces_exit() {
    let mut server = EchoServer::start();
    let _stuck = server.connect();
    thread::sleep(Duration::from_millis(300));

    server.signal(Signal::SIGTERM);
    thread::sleep(Duration::from_millis(200));
    server.signal(Signal::SIGTERM);

    let status = wait_with_timeout(&mut server.child, Duration::from_secs(5))
        .expect("server ignored the second SIGTERM");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_terminates_in_quick_succession_force_exit() {
    let mut server = EchoServer::start();
    let _stuck = server.connect();
    thread::sleep(Duration::from_millis(300));

    // standard signals still pending in the kernel are coalesced, so leave
    // just enough room for the first one to be delivered
    server.signal(Signal::SIGTERM);
    thread::sleep(Duration::from_millis(5));
    server.signal(Signal::SIGTERM);

    let status = wait_with_timeout(&mut server.child, Duration::from_secs(2))
        .expect("server kept draining after two SIGTERMs");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_restart_hands_over_without_refusing_connections() {
    let mut server = EchoServer::start();
    let original_pid = server.child.id() as i32;
    let port = server.port;

    let stop = Arc::new(AtomicBool::new(false));
    let served = Arc::new(AtomicUsize::new(0));
    let hammer = {
        let stop = Arc::clone(&stop);
        let served = Arc::clone(&served);
        thread::spawn(move || {
            let mut failures = Vec::new();
            while !stop.load(Ordering::Relaxed) {
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(stream) => {
                        if echo_over(stream, "still up\n") == "still up\n" {
                            served.fetch_add(1, Ordering::Relaxed);
                        } else {
                            failures.push("short reply".to_string());
                        }
                    }
                    Err(e) => failures.push(e.to_string()),
                }
                thread::sleep(Duration::from_millis(5));
            }
            failures
        })
    };

    thread::sleep(Duration::from_millis(200));
    server.signal(Signal::SIGUSR1);

    assert!(
        wait_for(Duration::from_secs(10), || server
            .pid()
            .is_some_and(|pid| pid != original_pid)),
        "successor never wrote its pidfile"
    );
    let status = wait_with_timeout(&mut server.child, Duration::from_secs(10))
        .expect("predecessor did not exit after the handoff");
    assert_eq!(status.code(), Some(0));

    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::Relaxed);
    let failures = hammer.join().unwrap();
    assert!(failures.is_empty(), "connections failed during restart: {failures:?}");
    assert!(served.load(Ordering::Relaxed) > 0);

    let successor = server.pid().unwrap();
    assert_ne!(successor, original_pid);
    assert_eq!(server.echo("from the successor\n"), "from the successor\n");

    kill(Pid::from_raw(successor), Signal::SIGTERM).unwrap();
}

#[test]
fn test_successor_can_restart_again() {
    let mut server = EchoServer::start();
    let original_pid = server.child.id() as i32;

    server.signal(Signal::SIGUSR1);
    assert!(
        wait_for(Duration::from_secs(10), || server
            .pid()
            .is_some_and(|pid| pid != original_pid)),
        "first successor never wrote its pidfile"
    );
    let first = server.pid().unwrap();
    let status = wait_with_timeout(&mut server.child, Duration::from_secs(10))
        .expect("original did not exit after the handoff");
    assert_eq!(status.code(), Some(0));
    assert_eq!(server.echo("first\n"), "first\n");

    kill(Pid::from_raw(first), Signal::SIGUSR1).unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || server
            .pid()
            .is_some_and(|pid| pid != first)),
        "second successor never wrote its pidfile"
    );
    let second = server.pid().unwrap();
    assert_ne!(second, original_pid);
    assert_eq!(server.echo("second\n"), "second\n");

    kill(Pid::from_raw(second), Signal::SIGTERM).unwrap();
}

#[test]
fn test_unix_socket_server() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("echo.sock");
    let pidfile = dir.path().join("echo.pid");

    let mut child = Command::new(env!("CARGO_BIN_EXE_seamless-echo"))
        .arg("--bind")
        .arg(format!("unix://{}", socket.display()))
        .arg("--pidfile")
        .arg(&pidfile)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    assert!(wait_for(Duration::from_secs(10), || read_pid(&pidfile).is_some()));

    let mut stream = UnixStream::connect(&socket).unwrap();
    stream.write_all(b"over unix\n").unwrap();
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).unwrap();
    assert_eq!(reply, "over unix\n");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(5)).unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_invalid_configuration_fails_fast() {
    let output = Command::new(env!("CARGO_BIN_EXE_seamless-echo"))
        .arg("--bind")
        .arg("nonsense uri")
        .output()
        .unwrap();
    assert!(!output.status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_seamless-echo"))
        .arg("--bind")
        .arg("unix:///tmp/seamless-never-bound.sock")
        .arg("--allowed-network")
        .arg("127.0.0.0/8")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("TCP"));
}
