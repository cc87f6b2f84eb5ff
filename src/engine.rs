//! Ties transport, parsing, authentication, registrar, routing, dialog
//! state, and the CDR recorder into the per-datagram dispatch function (2).

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::{self, Algorithm, Challenge, Credentials, NonceTable};
use crate::cdr::{CallResult, CdrRecorder};
use crate::config::ConfigSnapshot;
use crate::dialog::{DialogTable, InviteBranchTable, PendingRequestTable};
use crate::error::{Error, Result, SendErrorKind};
use crate::message::{self, HeaderField, HeaderName, Method, SipMessage};
use crate::registrar::{RegisterOutcome, Registrar};
use crate::routing::{self, ForwardOutcome, RequestClass, ResponseOutcome};
use crate::transport::udp::UdpSender;

pub struct Engine {
    pub config: Arc<ConfigSnapshot>,
    pub registrar: Arc<Registrar>,
    pub dialogs: Arc<DialogTable>,
    pub pending: Arc<PendingRequestTable>,
    pub invite_branches: Arc<InviteBranchTable>,
    pub cdr: Arc<CdrRecorder>,
    pub nonces: Arc<NonceTable>,
    pub sender: UdpSender,
}

impl Engine {
    /// Entry point for every received datagram (2's data flow diagram).
    /// Parse failures on a request get a best-effort 400; on a response
    /// they are dropped silently at DEBUG (7).
    pub async fn on_datagram(&self, data: &[u8], source: SocketAddr) {
        let msg = match message::parse(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(%source, error = %e, "DROP parse error");
                if let Some(bytes) = best_effort_400(data) {
                    let _ = self.sender.send(bytes, source).await;
                }
                return;
            }
        };

        let result = if msg.is_request() {
            self.handle_request(msg, source).await
        } else {
            self.handle_response(msg).await
        };

        if let Err(e) = result {
            debug!(%source, error = %e, "DROP");
        }
    }

    async fn send(&self, msg: &SipMessage, target: SocketAddr) -> Result<()> {
        self.sender
            .send(message::serialize(msg), target)
            .await
            .map_err(|kind| match kind {
                SendErrorKind::HostUnreachable => Error::NetworkUnreachable {
                    addr: target,
                    source: std::io::Error::other("host unreachable"),
                },
                SendErrorKind::Other => Error::NetworkError {
                    addr: target,
                    source: std::io::Error::other("send failed"),
                },
            })
    }

    /// Sends a message we are forwarding on behalf of someone else. On an
    /// outbound send failure, classifies the OS error and synthesizes the
    /// method-appropriate failure back to the original requester, cleaning
    /// up the dialog/pending state so the requester's own retransmission of
    /// the original message doesn't produce a second CDR row (4.2, 7,
    /// scenario 4).
    async fn forward_or_synthesize_failure(
        &self,
        outcome: ForwardOutcome,
        call_id: Option<&str>,
        method: Method,
        original: &SipMessage,
        source: SocketAddr,
    ) -> Result<()> {
        let target = outcome.target;
        match self.sender.send(message::serialize(&outcome.message), target).await {
            Ok(()) => Ok(()),
            Err(kind) => {
                let code = match kind {
                    SendErrorKind::HostUnreachable => match method {
                        Method::Invite | Method::Message | Method::Options | Method::Register => 480,
                        Method::Bye => 408,
                        _ => 503,
                    },
                    SendErrorKind::Other => 502,
                };
                warn!(%target, ?kind, code, "NETWORK forward failed, synthesizing failure");
                if let Some(cid) = call_id {
                    self.dialogs.remove(cid);
                    self.pending.remove(cid);
                    // The dialog/pending tables are genuinely keyed by plain
                    // Call-ID, but the CDR row for this request may be
                    // staged under the MESSAGE `(call-id, cseq)` dedup key
                    // (record_milestone) rather than bare Call-ID — use the
                    // same key here or the row never gets flushed.
                    let cseq = outcome.message.cseq().map(|(n, _)| n).unwrap_or(0);
                    let cdr_key = CdrRecorder::dedup_key(method.as_str(), cid, cseq);
                    // A BYE that can't reach a dead peer still ended the call
                    // normally from the requester's point of view (scenario
                    // 4); everything else is a genuine failure.
                    let result = if code == 408 { CallResult::Success } else { CallResult::Failed };
                    self.cdr.set_result(&cdr_key, result);
                    self.cdr.set_reason(
                        &cdr_key,
                        if matches!(kind, SendErrorKind::HostUnreachable) {
                            "Timeout"
                        } else {
                            "NetworkError"
                        },
                    );
                    let _ = self.cdr.flush(&[cdr_key]);
                }
                self.respond_failure(original, source, code).await
            }
        }
    }

    async fn handle_request(&self, mut msg: SipMessage, source: SocketAddr) -> Result<()> {
        let config = self.config.current();
        let method = msg.method().expect("is_request checked by caller");

        if method == Method::Register {
            return self.handle_register(msg, source).await;
        }

        let class = routing::classify_request(&msg, &self.dialogs)?;
        match class {
            RequestClass::Initial => {
                let original = msg.clone();
                match routing::forward_initial(
                    msg,
                    source,
                    &config,
                    &self.registrar,
                    &self.dialogs,
                    &self.pending,
                    &self.invite_branches,
                ) {
                    Ok(outcome) => {
                        self.record_milestone(&outcome.message, source, outcome.target, method);
                        let call_id = outcome.message.call_id().map(|s| s.to_string());
                        self.forward_or_synthesize_failure(outcome, call_id.as_deref(), method, &original, source)
                            .await
                    }
                    Err(Error::NoRoute(aor)) => {
                        // §7: INVITE/MESSAGE get 480 Temporarily Unavailable;
                        // a direct OPTIONS to an unregistered AOR gets 404.
                        let code = if method == Method::Options { 404 } else { 480 };
                        self.respond_failure(&original, source, code).await?;
                        self.record_failure(&original, method, &aor, code);
                        Ok(())
                    }
                    Err(Error::MaxForwardsExceeded) => {
                        self.respond_failure(&original, source, 483).await
                    }
                    Err(Error::LoopDetected(reason)) => {
                        self.respond_failure(&original, source, 482).await?;
                        warn!(%reason, "DROP loop detected");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            RequestClass::InDialog | RequestClass::Cancel => {
                let original = msg.clone();
                let our_host = config.advertised_host();
                match routing::forward_in_dialog(
                    msg,
                    &our_host,
                    config.server_port,
                    &config,
                    source,
                    &self.dialogs,
                    &self.invite_branches,
                ) {
                    Ok(outcome) => {
                        let call_id = outcome.message.call_id().map(|s| s.to_string());
                        self.forward_or_synthesize_failure(outcome, call_id.as_deref(), method, &original, source)
                            .await
                    }
                    Err(Error::NoRoute(target)) => {
                        warn!(%target, "DROP in-dialog request: no route");
                        self.respond_failure(&original, source, 404).await
                    }
                    Err(Error::MaxForwardsExceeded) => {
                        self.respond_failure(&original, source, 483).await
                    }
                    Err(Error::LoopDetected(reason)) => {
                        warn!(%reason, "DROP loop detected");
                        self.respond_failure(&original, source, 482).await
                    }
                    Err(e) => Err(e),
                }
            }
            RequestClass::AckTwoxx | RequestClass::AckNonTwoxx => {
                let outcome = routing::forward_ack(msg, &self.dialogs, &self.invite_branches)?;
                self.send(&outcome.message, outcome.target).await
            }
        }
    }

    async fn handle_register(&self, mut msg: SipMessage, source: SocketAddr) -> Result<()> {
        let config = self.config.current();
        let authz = msg.first_header(&HeaderName::Authorization).map(|s| s.to_string());

        let Some(raw) = authz else {
            return self.challenge(&msg, source).await;
        };
        let Some(params) = auth::digest::parse_authorization(&raw) else {
            return self.challenge(&msg, source).await;
        };
        let Some(password) = config.users.get(&params.username) else {
            return self.challenge(&msg, source).await;
        };
        if !self.nonces.check_and_consume(&params.nonce) {
            return self.challenge(&msg, source).await;
        }
        let creds = Credentials {
            username: &params.username,
            realm: &config.advertised_host(),
            password,
        };
        if !auth::verify_response(&creds, "REGISTER", &params) {
            return self.challenge(&msg, source).await;
        }

        let to = msg.to_value()?;
        let aor = message::aor_of(&to);
        let expires: u32 = msg
            .first_header(&HeaderName::Expires)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(3600);
        let mut contacts = msg.contacts()?;
        for c in &mut contacts {
            routing::nat_rewrite_contact(c, &config, source);
        }
        let call_id = msg.call_id().unwrap_or_default().to_string();
        let cseq = msg.cseq().map(|(n, _)| n).unwrap_or(0);

        let result = self.registrar.register(
            &config,
            aor.clone(),
            &contacts,
            expires,
            source,
            call_id.clone(),
            cseq,
        );

        let outcome_str = match result.outcome {
            RegisterOutcome::Success => "SUCCESS",
            RegisterOutcome::Unregistered => "UNREGISTERED",
        };
        let user_agent = msg.first_header(&HeaderName::UserAgent).unwrap_or_default().to_string();
        let contact = contacts.first().map(|c| c.uri.to_string()).unwrap_or_default();
        self.cdr.record_or_update(call_id.clone(), |row| {
            row.call_id = call_id.clone();
            row.record_type = "REGISTER".to_string();
            row.caller_uri = to.uri.to_string();
            row.caller_user = to.uri.user_str();
            row.caller_host_port = source.to_string();
            row.callee_uri = to.uri.to_string();
            row.callee_user = to.uri.user_str();
            row.callee_host_port = source.to_string();
            row.result = outcome_str.to_string();
            row.final_status_code = "200".to_string();
            row.end_time = crate::cdr::now_iso();
            row.user_agent = user_agent;
            row.contact = contact;
            row.cseq = cseq.to_string();
        });
        self.cdr.flush(&[call_id]).ok();

        let body = build_register_200_body(&result.remaining);
        let mut response = build_response(&msg, 200, "OK", body);
        for header in register_200_contact_headers(&result.remaining) {
            response.push_header(header);
        }
        self.send(&response, source).await
    }

    async fn challenge(&self, msg: &SipMessage, source: SocketAddr) -> Result<()> {
        let config = self.config.current();
        let challenge = Challenge {
            realm: config.advertised_host(),
            nonce: self.nonces.issue(),
            algorithm: Algorithm::Md5,
            qop: true,
        };
        let mut response = build_response(msg, 401, "Unauthorized", Vec::new());
        response.push_header(HeaderField::new(HeaderName::WwwAuthenticate, challenge.render()));
        self.send(&response, source).await
    }

    async fn handle_response(&self, msg: SipMessage) -> Result<()> {
        let config = self.config.current();
        let our_host = config.advertised_host();
        match routing::forward_response(msg, &our_host, config.server_port, &self.dialogs)? {
            ResponseOutcome::Forward(ForwardOutcome { message, target }) => {
                let status = message.status_code().unwrap_or(0);
                if status >= 200 {
                    self.record_final_status(&message, status);
                }
                self.send(&message, target).await
            }
            ResponseOutcome::Drop(reason) => {
                debug!(%reason, "DROP response");
                Ok(())
            }
        }
    }

    /// Synthesizes a method-appropriate failure response toward the
    /// original requester (4.2, 7).
    async fn respond_failure(&self, request: &SipMessage, source: SocketAddr, code: u16) -> Result<()> {
        let reason = reason_phrase(code);
        let response = build_response(request, code, reason, Vec::new());
        self.send(&response, source).await
    }

    /// Stages the first milestone of a newly forwarded initial
    /// INVITE/MESSAGE/OPTIONS (4.8): caller/callee identity and real
    /// endpoints, the record type, and (for INVITE) `invite_time`.
    fn record_milestone(&self, msg: &SipMessage, source: SocketAddr, target: SocketAddr, method: Method) {
        let Some(call_id) = msg.call_id().map(|s| s.to_string()) else {
            return;
        };
        let cseq = msg.cseq().map(|(n, _)| n).unwrap_or(0);
        let key = CdrRecorder::dedup_key(method.as_str(), &call_id, cseq);
        let from = msg.from_value().ok();
        let to = msg.to_value().ok();
        let contact = msg.contacts().ok().and_then(|c| c.into_iter().next());
        let user_agent = msg.first_header(&HeaderName::UserAgent).map(|s| s.to_string());
        let record_type = match method {
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            _ => "CALL",
        };
        self.cdr.record_or_update(key, |row| {
            row.call_id = call_id;
            row.record_type = record_type.to_string();
            row.cseq = cseq.to_string();
            if let Some(f) = &from {
                row.caller_uri = f.uri.to_string();
                row.caller_user = f.uri.user_str();
            }
            row.caller_host_port = source.to_string();
            if let Some(t) = &to {
                row.callee_uri = t.uri.to_string();
                row.callee_user = t.uri.user_str();
            }
            row.callee_host_port = target.to_string();
            if method == Method::Invite {
                row.invite_time = crate::cdr::now_iso();
            }
            if let Some(c) = &contact {
                row.contact = c.uri.to_string();
            }
            if let Some(ua) = &user_agent {
                row.user_agent = ua.clone();
            }
        });
    }

    /// Emits the FAILED CDR row for a request that never found a route
    /// (NoRoute → 480/404, scenario 2) — these never reach `record_milestone`
    /// since forwarding never happened, so the row is built and flushed here
    /// directly instead of staged.
    fn record_failure(&self, original: &SipMessage, method: Method, aor: &str, status: u16) {
        let Some(call_id) = original.call_id().map(|s| s.to_string()) else {
            return;
        };
        let cseq = original.cseq().map(|(n, _)| n).unwrap_or(0);
        let key = CdrRecorder::dedup_key(method.as_str(), &call_id, cseq);
        let record_type = match method {
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            _ => "CALL",
        };
        let from = original.from_value().ok();
        let user_agent = original.first_header(&HeaderName::UserAgent).unwrap_or_default().to_string();
        self.cdr.record_or_update(key.clone(), |row| {
            row.call_id = call_id;
            row.record_type = record_type.to_string();
            row.cseq = cseq.to_string();
            if let Some(f) = &from {
                row.caller_uri = f.uri.to_string();
                row.caller_user = f.uri.user_str();
            }
            row.callee_uri = format!("sip:{aor}");
            row.result = CallResult::Failed.as_str().to_string();
            row.final_status_code = status.to_string();
            row.end_time = crate::cdr::now_iso();
            row.user_agent = user_agent;
        });
        let _ = self.cdr.flush(&[key]);
    }

    /// Merges a response's milestone into the staged row (4.8): `180` sets
    /// `ringing_time` without finalizing anything; a final response (`>=
    /// 200`) sets `answer_time`/`bye_time`/`duration_seconds` as applicable,
    /// the final status code and state, and flushes.
    fn record_final_status(&self, msg: &SipMessage, status: u16) {
        let Some(call_id) = msg.call_id().map(|s| s.to_string()) else {
            return;
        };
        // The response's CSeq carries the original request's method and
        // number, so the same `(call-id, cseq)` dedup key `record_milestone`
        // staged the row under for MESSAGE is the one we must flush here —
        // otherwise a MESSAGE's final-status row is staged under one key and
        // "flushed" under another, leaving it stuck in the cache forever.
        let Some((cseq_num, cseq_method)) = msg.cseq() else {
            return;
        };
        let key = CdrRecorder::dedup_key(cseq_method.as_str(), &call_id, cseq_num);

        if status == 180 {
            self.cdr.record_or_update(key, |row| {
                if row.ringing_time.is_empty() {
                    row.ringing_time = crate::cdr::now_iso();
                }
            });
            return;
        }
        if status < 200 {
            return;
        }

        // A 200 to the CANCEL request itself is not the call's final
        // disposition — it's just the downstream UAS acking the CANCEL
        // transaction. The call's actual outcome is CANCELLED regardless of
        // what status code that 200 carries; treating it as a generic 2xx
        // would record state=SUCCESS and flush/tombstone the row before the
        // INVITE's real 487 arrives (scenario 5 requires state=CANCELLED).
        let result = if cseq_method == Method::Cancel && (200..300).contains(&status) {
            CallResult::Cancelled
        } else {
            match status {
                200..=299 => CallResult::Success,
                487 => CallResult::Cancelled,
                486 => CallResult::Busy,
                408 => CallResult::Failed,
                _ => CallResult::Failed,
            }
        };
        self.cdr.record_or_update(key.clone(), |row| {
            if cseq_method != Method::Cancel {
                row.final_status_code = status.to_string();
            }
            row.result = result.as_str().to_string();
            if cseq_method == Method::Invite && (200..300).contains(&status) {
                row.answer_time = crate::cdr::now_iso();
            }
            if matches!(cseq_method, Method::Bye) && status == 200 {
                row.bye_time = crate::cdr::now_iso();
            }
            row.end_time = crate::cdr::now_iso();
            row.duration_seconds = crate::cdr::duration_seconds(&row.answer_time, &row.end_time);
        });
        self.cdr.flush(&[key]).ok();
    }
}

/// Best-effort 400 Bad Request for a datagram that failed full parsing (7:
/// "respond 400 for requests if source is routable, never CDR"). The
/// datagram is malformed enough that [`message::parse`] gave up, so this
/// scans the raw lines directly for the handful of headers a response must
/// echo rather than re-running the structural parser. Returns `None` when
/// the first line looks like a status line (a malformed response is dropped
/// silently, never answered).
fn best_effort_400(data: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(data).ok()?;
    let normalized = text.replace("\r\n", "\n");
    let mut lines = normalized.split('\n');
    let first = lines.next()?.trim();
    if first.starts_with("SIP/2.0") || first.is_empty() {
        return None;
    }

    let mut via = None;
    let mut from = None;
    let mut to = None;
    let mut call_id = None;
    let mut cseq = None;
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "v" | "via" if via.is_none() => via = Some(value.to_string()),
            "f" | "from" if from.is_none() => from = Some(value.to_string()),
            "t" | "to" if to.is_none() => to = Some(value.to_string()),
            "i" | "call-id" if call_id.is_none() => call_id = Some(value.to_string()),
            "cseq" if cseq.is_none() => cseq = Some(value.to_string()),
            _ => {}
        }
    }

    let mut out = String::from("SIP/2.0 400 Bad Request\r\n");
    if let Some(v) = via {
        out.push_str(&format!("Via: {v}\r\n"));
    }
    if let Some(v) = from {
        out.push_str(&format!("From: {v}\r\n"));
    }
    if let Some(v) = to {
        out.push_str(&format!("To: {v}\r\n"));
    }
    if let Some(v) = call_id {
        out.push_str(&format!("Call-ID: {v}\r\n"));
    }
    if let Some(v) = cseq {
        out.push_str(&format!("CSeq: {v}\r\n"));
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    Some(out.into_bytes())
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        404 => "Not Found",
        480 => "Temporarily Unavailable",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        408 => "Request Timeout",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Renders the remaining bindings as Contact header values for the REGISTER
/// 200 OK (4.4: "listing all remaining bindings with their remaining
/// expiry"). The body itself stays empty; RFC 3261 REGISTER responses carry
/// this information in headers, not in the message body.
fn build_register_200_body(_bindings: &[crate::registrar::ContactBinding]) -> Vec<u8> {
    Vec::new()
}

fn register_200_contact_headers(bindings: &[crate::registrar::ContactBinding]) -> Vec<HeaderField> {
    let now = std::time::Instant::now();
    bindings
        .iter()
        .map(|b| {
            let remaining = b.expires_at.saturating_duration_since(now).as_secs();
            HeaderField::new(
                HeaderName::Contact,
                format!("<{}>;expires={}", b.contact_uri, remaining),
            )
        })
        .collect()
}

/// Builds a response reusing the request's Via/From/To/Call-ID/CSeq, per
/// the standard "UAS builds its response from the request" shape.
fn build_response(request: &SipMessage, status: u16, reason: &str, body: Vec<u8>) -> SipMessage {
    let mut headers = Vec::new();
    for name in [
        HeaderName::Via,
        HeaderName::From,
        HeaderName::To,
        HeaderName::CallId,
        HeaderName::CSeq,
    ] {
        for value in request.header_values(&name) {
            headers.push(HeaderField::new(name.clone(), value));
        }
    }
    SipMessage {
        start_line: message::StartLine::Response {
            status_code: status,
            reason: reason.to_string(),
        },
        headers,
        body,
    }
}
