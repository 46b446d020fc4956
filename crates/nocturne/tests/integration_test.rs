use nocturne::{
    AsyncTask, AsyncTaskGroup, ConnectionQueue, CookieFlags, InputFilter, Limits, Request, Root,
    ServerConfig, Status,
};
use nocturne::logging::init_test_logging;
use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn parse(raw: &str) -> Response {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let headers = lines
            .filter_map(|l| l.split_once(": "))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Response {
            status,
            headers,
            body: body.to_string(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("body is not JSON")
    }
}

struct TestServer {
    queue: ConnectionQueue,
    addr: SocketAddrV4,
}

impl TestServer {
    fn start(root: impl Root + 'static) -> TestServer {
        Self::with_config(root, ServerConfig::new("127.0.0.1:0").workers(2))
    }

    fn with_config(root: impl Root + 'static, config: ServerConfig) -> TestServer {
        init_test_logging();
        let mut queue = ConnectionQueue::new(Arc::new(root), config).unwrap();
        queue.run().unwrap();
        let addr = queue.local_addr().unwrap();
        TestServer { queue, addr }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn send(&self, raw: &[u8]) -> Response {
        exchange(self.connect(), raw)
    }
}

fn exchange(mut stream: impl Read + Write, raw: &[u8]) -> Response {
    stream.write_all(raw).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    Response::parse(&out)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ═══ Basic requests ═══

#[test]
fn test_get_returns_json_status_and_closes() {
    let server = TestServer::start(|_: &mut Request| Status::Done);
    let res = server.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    assert_eq!(res.status, 200);
    assert_eq!(res.header("Connection"), Some("close"));
    assert_eq!(res.header("Server"), Some("nocturne"));
    assert!(res.header("Date").is_some());
    assert_eq!(res.json()["status"], 200);
    assert_eq!(
        res.header("Content-Length").unwrap().parse::<usize>().unwrap(),
        res.body.len()
    );
}

#[test]
fn test_handler_sees_request_details() {
    let server = TestServer::start(|req: &mut Request| {
        let info = req.info();
        let body = serde_json::json!({
            "method": info.method_name,
            "path": info.url.path,
            "query": info.url.query,
            "host": info.url.host,
            "agent": req.request_header("user-agent"),
            "session": req.cookie("session"),
        });
        req.write_json(&body);
        req.set_response_header("X-Handler", "yes");
        req.set_cookie("seen", "1", Some(Duration::from_secs(60)), CookieFlags::DEFAULT);
        Status::Done
    });

    let res = server.send(
        b"GET /items/7?sort=asc HTTP/1.1\r\nHost: example.org:8080\r\nUser-Agent: curl/8.5.0\r\nCookie: a=1; session=abc\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.header("X-Handler"), Some("yes"));
    assert_eq!(res.header("Set-Cookie"), Some("seen=1; Max-Age=60; HttpOnly; SameSite=Lax"));
    let json = res.json();
    assert_eq!(json["method"], "GET");
    assert_eq!(json["path"], "/items/7");
    assert_eq!(json["query"], "sort=asc");
    assert_eq!(json["host"], "example.org");
    assert_eq!(json["agent"], "curl/8.5.0");
    assert_eq!(json["session"], "abc");
}

#[test]
fn test_head_sends_headers_only() {
    let server = TestServer::start(|req: &mut Request| {
        req.set_content_type("text/plain");
        req.write(b"hello");
        Status::Done
    });
    let res = server.send(b"HEAD / HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("5"));
    assert_eq!(res.header("Content-Type"), Some("text/plain"));
    assert!(res.body.is_empty());
}

#[test]
fn test_declined_is_not_found() {
    let server = TestServer::start(|req: &mut Request| {
        req.set_error_header("X-Reason", "missing");
        Status::Declined
    });
    let res = server.send(b"GET /nope HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 404);
    assert_eq!(res.header("X-Reason"), Some("missing"));
    assert_eq!(res.json()["status"], 404);
}

#[test]
fn test_explicit_status_wins() {
    let server = TestServer::start(|req: &mut Request| {
        req.set_status(201);
        req.write(b"created");
        Status::Done
    });
    let res = server.send(b"PUT /thing HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 201);
    assert_eq!(res.body, "created");
}

// ═══ Protocol errors ═══

#[test]
fn test_malformed_request_line() {
    let server = TestServer::start(|_: &mut Request| Status::Done);
    let res = server.send(b"get / HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 400);
    assert_eq!(res.json()["status"], 400);
}

#[test]
fn test_oversized_request_line() {
    let limits = Limits {
        max_request_line: 1024,
        ..Limits::default()
    };
    let config = ServerConfig::new("127.0.0.1:0").workers(1).limits(limits);
    let server = TestServer::with_config(|_: &mut Request| Status::Done, config);

    let mut raw = b"GET /".to_vec();
    raw.resize(4096, b'a');
    let res = server.send(&raw);
    assert_eq!(res.status, 413);
}

#[test]
fn test_bad_content_length() {
    let server = TestServer::start(|_: &mut Request| Status::Done);
    let res = server.send(b"POST / HTTP/1.1\r\nContent-Length: many\r\n\r\n");
    assert_eq!(res.status, 400);
}

// ═══ Request bodies ═══

struct Collect {
    body: Vec<u8>,
}

impl InputFilter for Collect {
    fn step(&mut self, data: &[u8]) -> Status {
        self.body.extend_from_slice(data);
        Status::Ok
    }

    fn finalize(&mut self, request: &mut Request) -> Status {
        let echoed = std::mem::take(&mut self.body);
        request.set_content_type("application/octet-stream");
        request.write(&echoed);
        Status::Done
    }
}

#[test]
fn test_body_upload_through_input_filter() {
    let server = TestServer::start(|req: &mut Request| {
        req.set_input_filter(Box::new(Collect { body: Vec::new() }));
        Status::Ok
    });

    let body = "x".repeat(20_000);
    let mut stream = server.connect();
    let head = format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len());
    stream.write_all(head.as_bytes()).unwrap();
    for chunk in body.as_bytes().chunks(3000) {
        stream.write_all(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    let res = exchange(stream, b"");

    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("20000"));
    assert_eq!(res.body, body);
}

// ═══ Files ═══

#[test]
fn test_file_response_from_document_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "file contents\n").unwrap();
    let root_dir = dir.path().to_path_buf();

    let server = TestServer::start(move |req: &mut Request| {
        req.set_document_root(root_dir.clone());
        let name = req.info().url.path.trim_start_matches('/').to_string();
        req.set_filename(name);
        Status::Done
    });

    let res = server.send(b"GET /hello.txt HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("14"));
    assert_eq!(res.body, "file contents\n");

    let res = server.send(b"GET /absent.txt HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 404);
}

// ═══ Transports ═══

#[test]
fn test_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nocturne.sock");
    let config = ServerConfig::new(format!("unix:{}", path.display())).workers(1);

    let mut queue = ConnectionQueue::new(Arc::new(|_: &mut Request| Status::Done), config).unwrap();
    queue.run().unwrap();
    assert!(queue.local_addr().is_none());
    assert!(path.exists());

    let stream = UnixStream::connect(&path).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let res = exchange(stream, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);

    queue.cancel();
    assert!(!path.exists());
}

#[test]
fn test_concurrent_clients() {
    let server = Arc::new(TestServer::start(|req: &mut Request| {
        let path = req.info().url.path.clone();
        req.write(path.as_bytes());
        Status::Done
    }));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let server = server.clone();
            std::thread::spawn(move || {
                let res = server.send(format!("GET /client/{i} HTTP/1.1\r\n\r\n").as_bytes());
                assert_eq!(res.status, 200);
                assert_eq!(res.body, format!("/client/{i}"));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(server.queue.metrics().snapshot().requests, 16);
}

// ═══ Tasks ═══

#[test]
fn test_handler_offloads_task() {
    let (tx, rx) = mpsc::channel::<String>();
    let tx = Mutex::new(tx);
    let server = TestServer::start(move |req: &mut Request| {
        let tx = tx.lock().unwrap().clone();
        let path = req.info().url.path.clone();
        let mut task = AsyncTask::new();
        task.add_execute_fn(move |_| tx.send(path).is_ok());
        req.push_task(task);
        Status::Done
    });

    let res = server.send(b"GET /job HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "/job");
    assert!(wait_until(|| server.queue.metrics().snapshot().tasks_executed == 1));
}

#[test]
fn test_suspended_request_finished_by_task() {
    let server = TestServer::start(|req: &mut Request| {
        let Some(completion) = req.completion() else {
            return Status::INTERNAL_SERVER_ERROR;
        };
        let path = req.info().url.path.clone();
        let mut task = AsyncTask::new();
        task.add_execute_fn(move |_| {
            std::thread::sleep(Duration::from_millis(20));
            completion.complete(move |req| {
                req.set_content_type("text/plain");
                req.write(format!("finished {path}").as_bytes());
                Status::Done
            });
            true
        });
        req.push_task(task);
        Status::Suspended
    });

    let res = server.send(b"GET /later HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/plain"));
    assert_eq!(res.body, "finished /later");
}

#[test]
fn test_abandoned_suspension_is_server_error() {
    let server = TestServer::start(|req: &mut Request| {
        let completion = req.completion();
        let mut task = AsyncTask::new();
        task.add_execute_fn(move |_| {
            drop(completion);
            false
        });
        req.push_task(task);
        Status::Suspended
    });

    let res = server.send(b"GET /lost HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 500);
}

#[test]
fn test_task_group_completes_on_owner_thread() {
    let server = TestServer::start(|_: &mut Request| Status::Done);
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let group = AsyncTaskGroup::with_notify(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 0..8 {
        let done = completed.clone();
        let task = AsyncTask::prepare(Some(group.clone()), |task| {
            task.set_priority((i * 30) as u8);
            task.add_execute_fn(|_| true);
            task.add_complete_fn(move |_, ok| {
                assert!(ok);
                done.fetch_add(1, Ordering::SeqCst);
            });
        });
        server.queue.push_task(task);
    }

    group.wait_for_all();
    assert_eq!(group.counters(), (8, 8));
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    assert_eq!(notified.load(Ordering::SeqCst), 8);
    assert!(wait_until(|| !server.queue.has_tasks()));
}

// ═══ Lifecycle ═══

#[test]
fn test_reload_keeps_existing_connections() {
    let server = TestServer::start(|_: &mut Request| Status::Done);
    let early = server.connect();
    // let a worker accept it under the first generation
    assert!(wait_until(|| server.queue.metrics().snapshot().active_connections >= 1));

    server.queue.reload();
    let res = server.send(b"GET /after HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);

    let res = exchange(early, b"GET /before HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 200);
}

#[test]
fn test_cancel_stops_listening() {
    let mut server = TestServer::start(|_: &mut Request| Status::Done);
    assert_eq!(server.send(b"GET / HTTP/1.1\r\n\r\n").status, 200);

    server.queue.cancel();
    assert!(!server.queue.is_running());
    assert!(TcpStream::connect(server.addr).is_err());
    assert!(wait_until(|| server.queue.metrics().snapshot().active_connections == 0));
}
