//! End-to-end scenarios driven over real loopback UDP sockets: a proxy
//! `Engine` bound to `127.0.0.1:0`, and one or two plain `UdpSocket`s
//! standing in for user agents.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use sipcore::auth::NonceTable;
use sipcore::cdr::CdrRecorder;
use sipcore::config::LogLevel;
use sipcore::dialog::{DialogTable, InviteBranchTable, PendingRequestTable};
use sipcore::error::SendErrorKind;
use sipcore::message::{self, parse_addr_header, HeaderName};
use sipcore::registrar::Registrar;
use sipcore::transport::udp::UdpTransport;
use sipcore::{Config, ConfigSnapshot, Engine};

/// A CDR scratch directory unique to one test run, removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("sipcore-cdr-test-{}-{id}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        ScratchDir(path)
    }

    fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

async fn spawn_proxy(users: HashMap<String, String>) -> (SocketAddr, Arc<Engine>, ScratchDir) {
    let cdr_tmp = ScratchDir::new();

    let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let proxy_addr = transport.local_addr().unwrap();
    let sender = transport.sender();
    let (socket, _writer) = transport.spawn_writer();

    let config = Config {
        server_ip: proxy_addr.ip().to_string(),
        server_port: proxy_addr.port(),
        advertised_host: None,
        users,
        local_networks: vec![],
        force_local_addr: true,
        log_level: LogLevel::Error,
        cdr_merge_mode: true,
        registration_expires: 3600,
        max_forwards: 70,
        cdr_dir: cdr_tmp.path().to_string_lossy().to_string(),
    };

    let engine = Arc::new(Engine {
        config: Arc::new(ConfigSnapshot::new(config)),
        registrar: Arc::new(Registrar::new()),
        dialogs: Arc::new(DialogTable::new()),
        pending: Arc::new(PendingRequestTable::new()),
        invite_branches: Arc::new(InviteBranchTable::new()),
        cdr: Arc::new(CdrRecorder::new(cdr_tmp.path(), true)),
        nonces: Arc::new(NonceTable::new(Duration::from_secs(60))),
        sender,
    });

    let dispatch = engine.clone();
    tokio::spawn(async move {
        let _ = UdpTransport::run_receive_loop(socket, move |inbound| {
            let engine = dispatch.clone();
            async move {
                engine.on_datagram(&inbound.data, inbound.peer).await;
            }
        })
        .await;
    });

    (proxy_addr, engine, cdr_tmp)
}

async fn ua_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(sock: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 65535];
    let (len, peer) = timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    (buf[..len].to_vec(), peer)
}

fn extract_quoted(header: &str, key: &str) -> String {
    let needle = format!("{key}=\"");
    let start = header.find(&needle).unwrap_or_else(|| panic!("{key} missing from {header}")) + needle.len();
    let rest = &header[start..];
    let end = rest.find('"').unwrap();
    rest[..end].to_string()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[tokio::test]
async fn successful_call_setup_and_response_round_trip() {
    let (proxy_addr, engine, cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();
    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-1".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcall1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag\r\n\
Call-ID: call-1@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();

    let (forwarded, peer) = recv(&bob_sock).await;
    assert_eq!(peer, proxy_addr);
    let forwarded_msg = message::parse(&forwarded).unwrap();
    assert_eq!(forwarded_msg.max_forwards(), Some(69));
    assert_eq!(forwarded_msg.request_uri(), Some(format!("sip:bob@{bob_addr}").as_str()));
    let top_via = forwarded_msg.top_via().unwrap().unwrap();
    assert_eq!(top_via.host, proxy_addr.ip().to_string());
    assert!(forwarded_msg.record_routes().unwrap().len() == 1);

    let response = format!(
        "SIP/2.0 200 OK\r\n\
Via: {via_top}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcall1\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtag\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag\r\n\
Call-ID: call-1@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:bob@{bob_addr}>\r\n\
Content-Length: 0\r\n\r\n",
        via_top = format!("SIP/2.0/UDP {proxy_addr};branch=z9hG4bKproxy1")
    );
    bob_sock.send_to(response.as_bytes(), proxy_addr).await.unwrap();

    let (reply, reply_peer) = recv(&alice_sock).await;
    assert_eq!(reply_peer, proxy_addr);
    let reply_msg = message::parse(&reply).unwrap();
    assert_eq!(reply_msg.status_code(), Some(200));
    assert!(reply_msg.top_via().unwrap().unwrap().host.contains("127.0.0.1"));

    // gives the spawned handler a moment to flush the CDR row before we inspect it
    tokio::time::sleep(Duration::from_millis(50)).await;
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let cdr_path = cdr_tmp.path().join(&date).join(format!("cdr_{date}.csv"));
    let contents = std::fs::read_to_string(&cdr_path).expect("CDR file written");
    assert!(contents.contains(&format!("call-1@{alice_addr}")));
    assert!(contents.contains("SUCCESS"));
}

#[tokio::test]
async fn invite_to_unregistered_user_gets_480() {
    let (proxy_addr, _engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();
    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let invite = format!(
        "INVITE sip:carol@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcall2\r\n\
Max-Forwards: 70\r\n\
To: Carol <sip:carol@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag2\r\n\
Call-ID: call-2@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();

    let (data, peer) = recv(&alice_sock).await;
    assert_eq!(peer, proxy_addr);
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(480));
}

#[tokio::test]
async fn max_forwards_exhausted_gets_483() {
    let (proxy_addr, engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();
    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-2".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcall3\r\n\
Max-Forwards: 0\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag3\r\n\
Call-ID: call-3@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();

    let (data, _peer) = recv(&alice_sock).await;
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(483));
}

#[tokio::test]
async fn self_via_loop_detected_gets_482() {
    let (proxy_addr, engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();
    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-3".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch=z9hG4bKloop\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag4\r\n\
Call-ID: call-4@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();

    let (data, _peer) = recv(&alice_sock).await;
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(482));
}

#[tokio::test]
async fn register_requires_digest_challenge_then_succeeds() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "hunter2".to_string());
    let (proxy_addr, _engine, _cdr_tmp) = spawn_proxy(users).await;
    let realm = proxy_addr.ip().to_string();

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let register_no_auth = format!(
        "REGISTER sip:{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKreg1\r\n\
Max-Forwards: 70\r\n\
To: Alice <sip:alice@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=regtag\r\n\
Call-ID: reg-call@{alice_addr}\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Expires: 3600\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(register_no_auth.as_bytes(), proxy_addr).await.unwrap();

    let (challenge_bytes, _peer) = recv(&alice_sock).await;
    let challenge_msg = message::parse(&challenge_bytes).unwrap();
    assert_eq!(challenge_msg.status_code(), Some(401));
    let www_auth = challenge_msg.first_header(&HeaderName::WwwAuthenticate).unwrap();
    let nonce = extract_quoted(www_auth, "nonce");

    let uri = format!("sip:{realm}");
    let ha1 = md5_hex(&format!("alice:{realm}:hunter2"));
    let ha2 = md5_hex(&format!("REGISTER:{uri}"));
    let cnonce = "clientnonce1";
    let nc = "00000001";
    let response = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));

    let register_with_auth = format!(
        "REGISTER sip:{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKreg2\r\n\
Max-Forwards: 70\r\n\
To: Alice <sip:alice@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=regtag\r\n\
Call-ID: reg-call@{alice_addr}\r\n\
CSeq: 2 REGISTER\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Expires: 3600\r\n\
Authorization: Digest username=\"alice\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\", algorithm=MD5, qop=auth, cnonce=\"{cnonce}\", nc={nc}\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(register_with_auth.as_bytes(), proxy_addr).await.unwrap();

    let (ok_bytes, _peer) = recv(&alice_sock).await;
    let ok_msg = message::parse(&ok_bytes).unwrap();
    assert_eq!(ok_msg.status_code(), Some(200));
    let contact = ok_msg.first_header(&HeaderName::Contact).unwrap();
    assert!(contact.contains(&format!("sip:alice@{alice_addr}")));
    assert!(contact.contains("expires="));
}

#[tokio::test]
async fn bye_with_unresolvable_route_gets_404() {
    let (proxy_addr, _engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let bye = format!(
        "BYE sip:bob@remote.invalid.example:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKbye1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@remote.invalid.example>;tag=bobtag\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetag5\r\n\
Call-ID: call-5@{alice_addr}\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(bye.as_bytes(), proxy_addr).await.unwrap();

    let (data, _peer) = recv(&alice_sock).await;
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(404));
}

/// Scenario 5: INVITE rings, the caller CANCELs, and the 200 to the CANCEL
/// itself must not be mistaken for the call's final disposition — only the
/// subsequent 487 decides the CDR row, which must end up CANCELLED exactly
/// once even though both a 200 and a 487 are observed for the same call.
#[tokio::test]
async fn cancel_during_ringing_yields_single_cancelled_cdr_row() {
    let (proxy_addr, engine, cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();
    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-cancel".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let call_id = format!("call-cancel@{alice_addr}");

    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcallc\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetagc\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();
    let (forwarded, _peer) = recv(&bob_sock).await;
    let forwarded_invite = message::parse(&forwarded).unwrap();
    let invite_branch = forwarded_invite.top_via().unwrap().unwrap().branch().unwrap().to_string();

    // 180 Ringing, Bob -> proxy -> Alice.
    let ringing = format!(
        "SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch={invite_branch}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcallc\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagc\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetagc\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
    );
    bob_sock.send_to(ringing.as_bytes(), proxy_addr).await.unwrap();
    let (_ringing_fwd, _peer) = recv(&alice_sock).await;

    // Alice CANCELs.
    let cancel = format!(
        "CANCEL sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcallc2\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetagc\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 CANCEL\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(cancel.as_bytes(), proxy_addr).await.unwrap();
    let (fwd_cancel, _peer) = recv(&bob_sock).await;
    let fwd_cancel_msg = message::parse(&fwd_cancel).unwrap();
    assert_eq!(fwd_cancel_msg.method(), Some(sipcore::message::Method::Cancel));
    assert_eq!(fwd_cancel_msg.top_via().unwrap().unwrap().branch(), Some(invite_branch.as_str()));

    // Bob 200s the CANCEL transaction itself.
    let cancel_200 = format!(
        "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch={invite_branch}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcallc2\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagc\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetagc\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 CANCEL\r\n\
Content-Length: 0\r\n\r\n"
    );
    bob_sock.send_to(cancel_200.as_bytes(), proxy_addr).await.unwrap();
    let (cancel_200_fwd, _peer) = recv(&alice_sock).await;
    assert_eq!(message::parse(&cancel_200_fwd).unwrap().status_code(), Some(200));

    // Bob then 487s the original INVITE.
    let terminated = format!(
        "SIP/2.0 487 Request Terminated\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch={invite_branch}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKcallc\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagc\r\n\
From: Alice <sip:alice@{realm}>;tag=alicetagc\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
    );
    bob_sock.send_to(terminated.as_bytes(), proxy_addr).await.unwrap();
    let (terminated_fwd, _peer) = recv(&alice_sock).await;
    assert_eq!(message::parse(&terminated_fwd).unwrap().status_code(), Some(487));

    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let cdr_path = cdr_tmp.path().join(&date).join(format!("cdr_{date}.csv"));
    let contents = std::fs::read_to_string(&cdr_path).expect("CDR file written");
    let matching_rows: Vec<&str> = contents.lines().filter(|l| l.contains(&call_id)).collect();
    assert_eq!(matching_rows.len(), 1, "expected exactly one CDR row, got: {contents}");
    assert!(matching_rows[0].contains("CANCELLED"));
}

/// §7: a direct OPTIONS to an AOR with no active binding gets 404, distinct
/// from the 480 an unreachable INVITE/MESSAGE target gets.
#[tokio::test]
async fn options_to_unregistered_user_gets_404() {
    let (proxy_addr, _engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();
    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let options = format!(
        "OPTIONS sip:carol@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKopt1\r\n\
Max-Forwards: 70\r\n\
To: Carol <sip:carol@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=aliceopt\r\n\
Call-ID: call-opt@{alice_addr}\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(options.as_bytes(), proxy_addr).await.unwrap();

    let (data, peer) = recv(&alice_sock).await;
    assert_eq!(peer, proxy_addr);
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(404));
}

/// §7: a datagram that fails full parsing but still looks like a request
/// gets a best-effort 400 rather than being silently dropped.
#[tokio::test]
async fn malformed_request_gets_best_effort_400() {
    let (proxy_addr, _engine, _cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();

    let broken = format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKbroken\r\n\
From: Alice <sip:alice@example.com>;tag=brokentag\r\n\
Call-ID: call-broken@{alice_addr}\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(broken.as_bytes(), proxy_addr).await.unwrap();

    let (data, peer) = recv(&alice_sock).await;
    assert_eq!(peer, proxy_addr);
    let text = String::from_utf8(data).unwrap();
    assert!(text.starts_with("SIP/2.0 400"));
    assert!(text.contains("call-broken"));
}

/// Scenario 3: Bob's UAS retransmits 486 Busy Here three times (as a UAS
/// typically does while it waits for the ACK that ends the INVITE
/// transaction). Each one must still reach Alice, but the CDR must end up
/// with exactly one row for the call.
#[tokio::test]
async fn retransmitted_486_forwards_each_time_but_single_cdr_row() {
    let (proxy_addr, engine, cdr_tmp) = spawn_proxy(HashMap::new()).await;
    let realm = proxy_addr.ip().to_string();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();
    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-busy".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let call_id = format!("call-busy@{alice_addr}");

    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKbusy1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=alicebusy\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();
    let (forwarded, _peer) = recv(&bob_sock).await;
    let forwarded_msg = message::parse(&forwarded).unwrap();
    let invite_branch = forwarded_msg.top_via().unwrap().unwrap().branch().unwrap().to_string();

    let busy = format!(
        "SIP/2.0 486 Busy Here\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch={invite_branch}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKbusy1\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagbusy\r\n\
From: Alice <sip:alice@{realm}>;tag=alicebusy\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
    );

    for _ in 0..3 {
        bob_sock.send_to(busy.as_bytes(), proxy_addr).await.unwrap();
        let (data, _peer) = recv(&alice_sock).await;
        let msg = message::parse(&data).unwrap();
        assert_eq!(msg.status_code(), Some(486));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let cdr_path = cdr_tmp.path().join(&date).join(format!("cdr_{date}.csv"));
    let contents = std::fs::read_to_string(&cdr_path).expect("CDR file written");
    let matching: Vec<&str> = contents.lines().filter(|l| l.contains(&call_id)).collect();
    assert_eq!(matching.len(), 1, "expected exactly one CDR row despite three retransmitted 486s, got: {contents}");
    assert!(matching[0].contains("BUSY"));
}

/// Scenario 4: after a confirmed call, the callee's peer goes unreachable.
/// The BYE's forward attempt fails with a synthesized host-unreachable, the
/// proxy answers 408 to the caller instead of the callee's BYE response,
/// and a retransmitted BYE (the caller hasn't learned the call already
/// ended) gets the same 408 without a second CDR row.
#[tokio::test]
async fn bye_to_unreachable_peer_gets_408_and_single_cdr_row() {
    let cdr_tmp = ScratchDir::new();

    let bob_sock = ua_socket().await;
    let bob_addr = bob_sock.local_addr().unwrap();

    let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let proxy_addr = transport.local_addr().unwrap();
    let sender = transport.sender();
    let blackhole_trigger = Arc::new(AtomicBool::new(false));
    let (socket, _writer) = transport.spawn_writer_with_switchable_blackhole(
        bob_addr,
        SendErrorKind::HostUnreachable,
        blackhole_trigger.clone(),
    );

    let realm = proxy_addr.ip().to_string();
    let config = Config {
        server_ip: proxy_addr.ip().to_string(),
        server_port: proxy_addr.port(),
        advertised_host: None,
        users: HashMap::new(),
        local_networks: vec![],
        force_local_addr: true,
        log_level: LogLevel::Error,
        cdr_merge_mode: true,
        registration_expires: 3600,
        max_forwards: 70,
        cdr_dir: cdr_tmp.path().to_string_lossy().to_string(),
    };
    let engine = Arc::new(Engine {
        config: Arc::new(ConfigSnapshot::new(config)),
        registrar: Arc::new(Registrar::new()),
        dialogs: Arc::new(DialogTable::new()),
        pending: Arc::new(PendingRequestTable::new()),
        invite_branches: Arc::new(InviteBranchTable::new()),
        cdr: Arc::new(CdrRecorder::new(cdr_tmp.path(), true)),
        nonces: Arc::new(NonceTable::new(Duration::from_secs(60))),
        sender,
    });

    let dispatch = engine.clone();
    tokio::spawn(async move {
        let _ = UdpTransport::run_receive_loop(socket, move |inbound| {
            let engine = dispatch.clone();
            async move {
                engine.on_datagram(&inbound.data, inbound.peer).await;
            }
        })
        .await;
    });

    let bob_contact = parse_addr_header(&format!("<sip:bob@{bob_addr}>")).unwrap();
    let config = engine.config.current();
    engine.registrar.register(
        &config,
        format!("sip:bob@{realm}"),
        &[bob_contact],
        3600,
        bob_addr,
        "reg-bob-offline".to_string(),
        1,
    );

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let call_id = format!("call-offline@{alice_addr}");

    let invite = format!(
        "INVITE sip:bob@{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKoff1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=aliceoff\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(invite.as_bytes(), proxy_addr).await.unwrap();
    let (forwarded, _peer) = recv(&bob_sock).await;
    let forwarded_msg = message::parse(&forwarded).unwrap();
    let invite_branch = forwarded_msg.top_via().unwrap().unwrap().branch().unwrap().to_string();

    let ok_200 = format!(
        "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP {proxy_addr};branch={invite_branch}\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKoff1\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagoff\r\n\
From: Alice <sip:alice@{realm}>;tag=aliceoff\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:bob@{bob_addr}>\r\n\
Content-Length: 0\r\n\r\n"
    );
    bob_sock.send_to(ok_200.as_bytes(), proxy_addr).await.unwrap();
    let (_ok_fwd, _peer) = recv(&alice_sock).await;

    // Bob's network drops after the call is confirmed; every further send
    // to him fails as if the peer were unreachable.
    blackhole_trigger.store(true, Ordering::SeqCst);

    let bye = format!(
        "BYE sip:bob@{bob_addr} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKoffbye1\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@{realm}>;tag=bobtagoff\r\n\
From: Alice <sip:alice@{realm}>;tag=aliceoff\r\n\
Call-ID: {call_id}\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n"
    );
    alice_sock.send_to(bye.as_bytes(), proxy_addr).await.unwrap();
    let (data, _peer) = recv(&alice_sock).await;
    let msg = message::parse(&data).unwrap();
    assert_eq!(msg.status_code(), Some(408));

    // Retransmitted BYE (Alice hasn't learned the dialog already ended):
    // same 408, no duplicate CDR row.
    alice_sock.send_to(bye.as_bytes(), proxy_addr).await.unwrap();
    let (data2, _peer) = recv(&alice_sock).await;
    let msg2 = message::parse(&data2).unwrap();
    assert_eq!(msg2.status_code(), Some(408));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let cdr_path = cdr_tmp.path().join(&date).join(format!("cdr_{date}.csv"));
    let contents = std::fs::read_to_string(&cdr_path).expect("CDR file written");
    let matching: Vec<&str> = contents.lines().filter(|l| l.contains(&call_id)).collect();
    assert_eq!(matching.len(), 1, "expected exactly one CDR row despite a retransmitted BYE, got: {contents}");
}

/// Scenario 6: re-registering the same AOR under the same Call-ID with a
/// positive `Expires` both times refreshes the existing binding — the
/// Registrar ends up with exactly one binding, and only one REGISTER CDR
/// row is ever written for that Call-ID.
#[tokio::test]
async fn re_registration_refreshes_single_binding_and_cdr_row() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "hunter2".to_string());
    let (proxy_addr, engine, cdr_tmp) = spawn_proxy(users).await;
    let realm = proxy_addr.ip().to_string();

    let alice_sock = ua_socket().await;
    let alice_addr = alice_sock.local_addr().unwrap();
    let call_id = format!("reg-refresh@{alice_addr}");

    async fn register_once(
        alice_sock: &UdpSocket,
        proxy_addr: SocketAddr,
        realm: &str,
        alice_addr: SocketAddr,
        call_id: &str,
        cseq: u32,
    ) {
        let register_no_auth = format!(
            "REGISTER sip:{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKreg{cseq}a\r\n\
Max-Forwards: 70\r\n\
To: Alice <sip:alice@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=regrefresh\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} REGISTER\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Expires: 3600\r\n\
Content-Length: 0\r\n\r\n"
        );
        alice_sock.send_to(register_no_auth.as_bytes(), proxy_addr).await.unwrap();
        let (challenge_bytes, _peer) = recv(alice_sock).await;
        let challenge_msg = message::parse(&challenge_bytes).unwrap();
        assert_eq!(challenge_msg.status_code(), Some(401));
        let www_auth = challenge_msg.first_header(&HeaderName::WwwAuthenticate).unwrap();
        let nonce = extract_quoted(www_auth, "nonce");

        let uri = format!("sip:{realm}");
        let ha1 = md5_hex(&format!("alice:{realm}:hunter2"));
        let ha2 = md5_hex(&format!("REGISTER:{uri}"));
        let cnonce = format!("cnonce{cseq}");
        let nc = "00000001";
        let response = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
        let next_cseq = cseq + 1;

        let register_with_auth = format!(
            "REGISTER sip:{realm} SIP/2.0\r\n\
Via: SIP/2.0/UDP {alice_addr};branch=z9hG4bKreg{cseq}b\r\n\
Max-Forwards: 70\r\n\
To: Alice <sip:alice@{realm}>\r\n\
From: Alice <sip:alice@{realm}>;tag=regrefresh\r\n\
Call-ID: {call_id}\r\n\
CSeq: {next_cseq} REGISTER\r\n\
Contact: <sip:alice@{alice_addr}>\r\n\
Expires: 3600\r\n\
Authorization: Digest username=\"alice\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\", algorithm=MD5, qop=auth, cnonce=\"{cnonce}\", nc={nc}\r\n\
Content-Length: 0\r\n\r\n"
        );
        alice_sock.send_to(register_with_auth.as_bytes(), proxy_addr).await.unwrap();
        let (ok_bytes, _peer) = recv(alice_sock).await;
        let ok_msg = message::parse(&ok_bytes).unwrap();
        assert_eq!(ok_msg.status_code(), Some(200));
    }

    register_once(&alice_sock, proxy_addr, &realm, alice_addr, &call_id, 1).await;
    register_once(&alice_sock, proxy_addr, &realm, alice_addr, &call_id, 3).await;

    assert_eq!(engine.registrar.lookup(&format!("sip:alice@{realm}")).len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let cdr_path = cdr_tmp.path().join(&date).join(format!("cdr_{date}.csv"));
    let contents = std::fs::read_to_string(&cdr_path).expect("CDR file written");
    let matching: Vec<&str> = contents.lines().filter(|l| l.contains(&call_id)).collect();
    assert_eq!(matching.len(), 1, "expected exactly one REGISTER CDR row across both registrations, got: {contents}");
}
