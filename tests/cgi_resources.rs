//! Descriptor and child-process accounting around failing CGI scripts.
//! Kept alone in its own test binary so no other test opens descriptors or
//! spawns children while the counts are taken.

use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use webserv::{Config, Reactor, Router, VirtualHostTable};

fn get_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Sends one `Connection: close` request and reads until the server hangs up.
fn fetch(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn failing_cgi_leaks_no_descriptors_or_children() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("cgi")).unwrap();
    fs::write(root.path().join("cgi/fail.sh"), "echo half\nexit 1\n").unwrap();

    let port = get_free_port();
    let toml = format!(
        r#"
[engine]
poll_timeout_ms = 20

[[server]]
listen = ["127.0.0.1:{port}"]
server_name = ["localhost"]
root = "{root}"

[[server.location]]
path = "/cgi"

[server.location.cgi]
".sh" = "/bin/sh"
"#,
        port = port,
        root = root.path().display()
    );
    let config = Config::from_toml(&toml).unwrap();
    let router = Router::new(VirtualHostTable::from_config(&config).unwrap());
    let mut reactor = Reactor::new(config.engine.clone(), router).unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = thread::spawn(move || reactor.run(&flag).unwrap());

    let first = fetch(port, "/cgi/fail.sh");
    assert!(first.starts_with("HTTP/1.1 500 "), "{}", first);
    let baseline = open_fds();

    for _ in 0..256 {
        let response = fetch(port, "/cgi/fail.sh");
        assert!(response.starts_with("HTTP/1.1 500 "), "{}", response);
    }

    assert_eq!(open_fds(), baseline);
    let reaped = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
    assert_eq!(reaped, -1, "a CGI child was left unreaped");
    assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::ECHILD));

    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}
