//! WinRM session lifecycle against a scripted WS-Management endpoint

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use pv_agent::session::{close_session, ControllerSessionStore, Credentials, SessionStore};
use pv_agent::{open_session, RemoteTarget, SessionIo, SessionOptions, SessionState};
use pv_core::error::SessionError;
use pv_core::{ControllerRecord, InMemoryCluster, Transport};

const CONTROLLER: &str = "win-rc";
const HOST: &str = "win1";

const NS: &str = r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell""#;

/// One request seen by the fake endpoint
#[derive(Debug, Clone)]
struct Seen {
    action: &'static str,
    shell: Option<String>,
    /// Shell id recorded on the controller when the request arrived
    recorded_session: Option<String>,
}

#[derive(Default)]
struct EndpointState {
    seen: Vec<Seen>,
    open_shells: HashSet<String>,
    next_shell: u32,
    receives: u32,
}

/// Minimal WinRM endpoint: one request per connection
struct FakeWinRm {
    addr: SocketAddr,
    state: Arc<Mutex<EndpointState>>,
}

impl FakeWinRm {
    async fn start(exit_code: i32, reject_auth: bool, cluster: Option<Arc<InMemoryCluster>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(EndpointState::default()));

        let shared = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = shared.clone();
                let cluster = cluster.clone();
                tokio::spawn(async move {
                    serve(socket, state, exit_code, reject_auth, cluster).await;
                });
            }
        });

        Self { addr, state }
    }

    async fn open_shell(&self, id: &str) {
        self.state.lock().await.open_shells.insert(id.to_string());
    }

    async fn actions(&self) -> Vec<&'static str> {
        self.state.lock().await.seen.iter().map(|s| s.action).collect()
    }

    async fn seen(&self) -> Vec<Seen> {
        self.state.lock().await.seen.clone()
    }

    async fn open_shells(&self) -> HashSet<String> {
        self.state.lock().await.open_shells.clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Some((head, body))
}

fn action_of(body: &str) -> &'static str {
    for action in ["Create", "Delete", "Command", "Send", "Receive", "Signal"] {
        if body.contains(&format!("/{}</a:Action>", action)) {
            return action;
        }
    }
    "Unknown"
}

fn shell_of(body: &str) -> Option<String> {
    let start = body.find("<w:Selector Name=\"ShellId\">")? + "<w:Selector Name=\"ShellId\">".len();
    let end = body[start..].find("</w:Selector>")?;
    Some(body[start..start + end].to_string())
}

fn fault(code: u32, subcode: &str) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>{subcode}</s:Value></s:Subcode></s:Code><s:Reason><s:Text>fault</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="{code}"><f:Message>fault {code}</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#
    )
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<Mutex<EndpointState>>,
    exit_code: i32,
    reject_auth: bool,
    cluster: Option<Arc<InMemoryCluster>>,
) {
    let Some((head, body)) = read_request(&mut socket).await else {
        return;
    };

    let (status, reply) = if reject_auth || !head.to_ascii_lowercase().contains("authorization: basic") {
        ("401 Unauthorized", String::new())
    } else {
        let action = action_of(&body);
        let shell = shell_of(&body);
        let recorded_session = match &cluster {
            Some(cluster) => cluster
                .controller(CONTROLLER)
                .await
                .and_then(|r| r.session_id(HOST).map(str::to_string)),
            None => None,
        };

        let mut state = state.lock().await;
        state.seen.push(Seen {
            action,
            shell: shell.clone(),
            recorded_session,
        });

        let known = shell
            .as_ref()
            .map(|s| state.open_shells.contains(s))
            .unwrap_or(false);
        match action {
            "Create" => {
                state.next_shell += 1;
                let id = format!("SHELL-{}", state.next_shell);
                state.open_shells.insert(id.clone());
                (
                    "200 OK",
                    format!(r#"<s:Envelope {NS}><s:Body><rsp:Shell><rsp:ShellId>{id}</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>"#),
                )
            }
            _ if !known => ("500 Internal Server Error", fault(2150858843, "w:InvalidSelectors")),
            "Delete" => {
                if let Some(shell) = &shell {
                    state.open_shells.remove(shell);
                }
                ("200 OK", format!(r#"<s:Envelope {NS}><s:Body/></s:Envelope>"#))
            }
            "Command" => (
                "200 OK",
                format!(r#"<s:Envelope {NS}><s:Body><rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse></s:Body></s:Envelope>"#),
            ),
            "Receive" => {
                state.receives += 1;
                if state.receives == 1 {
                    // First poll times out without output
                    ("500 Internal Server Error", fault(2150858793, "w:TimedOut"))
                } else {
                    (
                        "200 OK",
                        format!(
                            r#"<s:Envelope {NS}><s:Body><rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="CMD-1">aGVsbG8=</rsp:Stream><rsp:CommandState CommandId="CMD-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>{exit_code}</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse></s:Body></s:Envelope>"#
                        ),
                    )
                }
            }
            _ => ("200 OK", format!(r#"<s:Envelope {NS}><s:Body/></s:Envelope>"#)),
        }
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/soap+xml;charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reply.len(),
        reply
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn target(addr: SocketAddr) -> RemoteTarget {
    RemoteTarget {
        name: HOST.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        user: "Administrator".to_string(),
        transport: Transport::WinRm,
        credentials: Credentials::Password("secret".to_string()),
    }
}

async fn cluster_with_record(session: Option<&str>) -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::new("default");
    let mut record = ControllerRecord::new(CONTROLLER);
    if let Some(id) = session {
        record.set_session_id(HOST, id);
    }
    cluster.insert_controller(record).await;
    cluster
}

fn options(cluster: &Arc<InMemoryCluster>, shell_reentry: bool) -> SessionOptions {
    let store: Arc<dyn SessionStore> =
        Arc::new(ControllerSessionStore::new(cluster.clone(), CONTROLLER));
    SessionOptions {
        connect_timeout: None,
        store: Some(store),
        shell_reentry,
    }
}

fn io() -> (SessionIo, tokio::io::DuplexStream) {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let io = SessionIo {
        stdin: Box::new(tokio::io::empty()),
        stdout: Box::new(writer),
        stderr: Box::new(tokio::io::sink()),
    };
    (io, reader)
}

#[tokio::test]
async fn test_executes_and_closes_shell() {
    let cluster = cluster_with_record(None).await;
    let server = FakeWinRm::start(0, false, Some(cluster.clone())).await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::SessionOpen);

    let (io, mut stdout) = io();
    let outcome = session
        .execute("ipconfig", &BTreeMap::new(), io)
        .await
        .unwrap();
    assert!(outcome.success());

    let mut output = Vec::new();
    stdout.read_to_end(&mut output).await.unwrap();
    assert_eq!(output, b"hello");

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    assert_eq!(
        server.actions().await,
        vec!["Create", "Command", "Receive", "Receive", "Delete"]
    );
    assert!(server.open_shells().await.is_empty());

    let record = cluster.controller(CONTROLLER).await.unwrap();
    assert_eq!(record.session_id(HOST), None);
}

#[tokio::test]
async fn test_shell_id_recorded_before_command_runs() {
    let cluster = cluster_with_record(None).await;
    let server = FakeWinRm::start(0, false, Some(cluster.clone())).await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    session.connect().await.unwrap();
    let (io, _stdout) = io();
    session.execute("dir", &BTreeMap::new(), io).await.unwrap();
    session.close().await.unwrap();

    let seen = server.seen().await;
    let command = seen.iter().find(|s| s.action == "Command").unwrap();
    assert_eq!(command.recorded_session.as_deref(), Some("SHELL-1"));
    assert_eq!(command.shell.as_deref(), Some("SHELL-1"));
}

#[tokio::test]
async fn test_previous_shell_closed_before_new_one() {
    let cluster = cluster_with_record(Some("OLD-SHELL")).await;
    let server = FakeWinRm::start(0, false, Some(cluster.clone())).await;
    server.open_shell("OLD-SHELL").await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    session.connect().await.unwrap();

    let seen = server.seen().await;
    assert_eq!(seen[0].action, "Delete");
    assert_eq!(seen[0].shell.as_deref(), Some("OLD-SHELL"));
    assert_eq!(seen[1].action, "Create");
    assert!(!server.open_shells().await.contains("OLD-SHELL"));

    let record = cluster.controller(CONTROLLER).await.unwrap();
    assert_eq!(record.session_id(HOST), Some("SHELL-1"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_stale_shell_already_gone_is_ignored() {
    let cluster = cluster_with_record(Some("VANISHED")).await;
    let server = FakeWinRm::start(0, false, Some(cluster.clone())).await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    session.connect().await.unwrap();

    assert_eq!(server.actions().await, vec!["Delete", "Create"]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_non_zero_exit_is_command_failure() {
    let cluster = cluster_with_record(None).await;
    let server = FakeWinRm::start(3, false, None).await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    session.connect().await.unwrap();
    let (io, _stdout) = io();
    let err = session
        .execute("exit 3", &BTreeMap::new(), io)
        .await
        .unwrap_err();

    match err {
        SessionError::CommandFailed { exit_code, command } => {
            assert_eq!(exit_code, 3);
            assert_eq!(command, "exit 3");
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }

    session.close().await.unwrap();
    assert!(server.open_shells().await.is_empty());
}

#[tokio::test]
async fn test_shell_reentry_leaves_recorded_shell_alone() {
    let cluster = cluster_with_record(Some("PARENT-SHELL")).await;
    let server = FakeWinRm::start(0, false, None).await;
    server.open_shell("PARENT-SHELL").await;

    let mut session = open_session(target(server.addr), options(&cluster, true)).unwrap();
    session.connect().await.unwrap();
    let (io, _stdout) = io();
    session.execute("cmd", &BTreeMap::new(), io).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(
        server.actions().await,
        vec!["Create", "Command", "Receive", "Receive", "Delete"]
    );
    assert!(server.open_shells().await.contains("PARENT-SHELL"));

    let record = cluster.controller(CONTROLLER).await.unwrap();
    assert_eq!(record.session_id(HOST), Some("PARENT-SHELL"));
}

#[tokio::test]
async fn test_close_session_is_idempotent() {
    let server = FakeWinRm::start(0, false, None).await;
    server.open_shell("S-42").await;
    let target = target(server.addr);

    close_session(&target, "S-42").await.unwrap();
    close_session(&target, "S-42").await.unwrap();
    close_session(&target, "NEVER-EXISTED").await.unwrap();

    assert_eq!(server.actions().await, vec!["Delete", "Delete", "Delete"]);
    assert!(server.open_shells().await.is_empty());
}

#[tokio::test]
async fn test_rejected_credentials() {
    let cluster = cluster_with_record(None).await;
    let server = FakeWinRm::start(0, true, None).await;

    let mut session = open_session(target(server.addr), options(&cluster, false)).unwrap();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = close_session(&target(addr), "S-1").await.unwrap_err();
    assert!(matches!(err, SessionError::Connect { .. }));
}
