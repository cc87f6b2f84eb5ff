//! Request classification, loop prevention, and the forwarding algorithms
//! (4.5) — the heart of the proxy. Functions here are pure with respect to
//! the wire: they take a parsed [`SipMessage`] and the engine's state
//! tables and return the message(s) to send, leaving the actual socket I/O
//! to [`crate::engine`].

use std::net::SocketAddr;

use rand::Rng;

use crate::config::Config;
use crate::dialog::{DialogContext, DialogState, DialogTable, InviteBranchTable, PendingRequestTable};
use crate::dialog::shortcuts::{InviteBranchEntry, PendingRequestEntry};
use crate::error::{Error, Result};
use crate::message::{AddrHeaderValue, HeaderField, HeaderName, Method, SipMessage, UriExt};
use crate::registrar::Registrar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Initial,
    InDialog,
    AckTwoxx,
    AckNonTwoxx,
    Cancel,
}

pub fn classify_request(msg: &SipMessage, dialogs: &DialogTable) -> Result<RequestClass> {
    let method = msg.method().ok_or_else(|| Error::ParseError("not a request".into()))?;
    let to = msg.to_value()?;
    let call_id = msg.call_id().ok_or(Error::MissingHeader("Call-ID"))?;

    if method == Method::Cancel {
        return Ok(RequestClass::Cancel);
    }
    if method == Method::Ack {
        return Ok(if dialogs.exists(call_id) {
            RequestClass::AckTwoxx
        } else {
            RequestClass::AckNonTwoxx
        });
    }
    Ok(if to.tag().is_some() {
        RequestClass::InDialog
    } else {
        RequestClass::Initial
    })
}

/// Decrements Max-Forwards and checks for both termination conditions in
/// §4.5's loop prevention rule. Returns the decremented value on success.
pub fn check_loop_and_forwards(
    msg: &SipMessage,
    config: &Config,
    our_host: &str,
    our_port: u16,
) -> Result<u8> {
    let max_forwards = msg.max_forwards().unwrap_or(config.max_forwards);
    if max_forwards == 0 {
        return Err(Error::MaxForwardsExceeded);
    }
    let decremented = max_forwards - 1;

    if let Some(via) = msg.top_via() {
        let via = via?;
        let is_us = via.host.eq_ignore_ascii_case(our_host)
            && via.port.unwrap_or(5060) == our_port;
        if is_us {
            return Err(Error::LoopDetected(format!(
                "self Via already present with branch {:?}",
                via.branch()
            )));
        }
    }
    Ok(decremented)
}

pub fn fresh_branch() -> String {
    let mut rng = rand::rng();
    let suffix: u64 = rng.random();
    format!("z9hG4bK{suffix:016x}")
}

/// Pushes our own Via with a fresh branch and `rport` (step 4 of "forwarding
/// an initial INVITE/MESSAGE/OPTIONS").
pub fn push_own_via(msg: &mut SipMessage, our_host: &str, our_port: u16) -> String {
    let branch = fresh_branch();
    let value = format!("SIP/2.0/UDP {our_host}:{our_port};branch={branch};rport");
    msg.push_header_front(HeaderField::new(HeaderName::Via, value));
    branch
}

/// Prepends our Record-Route (`<sip:host:port;lr>`), required whenever the
/// Request-URI is rewritten (step 5).
pub fn push_own_record_route(msg: &mut SipMessage, our_host: &str, our_port: u16) {
    let value = format!("<sip:{our_host}:{our_port};lr>");
    msg.push_header_front(HeaderField::new(HeaderName::RecordRoute, value));
}

/// NAT-rewrites a Contact value's host/port to the datagram's real source
/// endpoint, unless the peer counts as local (4.5 NAT rewriting rule).
pub fn nat_rewrite_contact(contact: &mut AddrHeaderValue, config: &Config, source: SocketAddr) {
    if config.is_local_peer(source.ip()) {
        return;
    }
    contact.uri = contact.uri.with_host_port(&source.ip().to_string(), source.port());
}

/// Adds `received`/`rport` to the top Via of an inbound request so the
/// response path can reach back through NAT (4.5).
pub fn annotate_via_received(msg: &mut SipMessage, source: SocketAddr) -> Result<()> {
    let Some(via) = msg.top_via() else {
        return Ok(());
    };
    let mut via = via?;
    via.set_received(&source.ip().to_string());
    if via.has_rport() {
        via.set_rport(source.port());
    }
    let formatted = crate::message::format_via(&via);
    let pos = msg
        .headers
        .iter()
        .position(|h| h.name.eq_ignore_case(&HeaderName::Via))
        .expect("top_via returned Some");
    msg.headers[pos] = HeaderField::new(HeaderName::Via, formatted);
    Ok(())
}

pub struct ForwardOutcome {
    pub message: SipMessage,
    pub target: SocketAddr,
}

/// Forwards an initial INVITE/MESSAGE/OPTIONS to a registered user (4.5).
/// Returns `Err(NoRoute)` when the AOR has no active bindings — the caller
/// synthesizes 480 and a FAILED CDR row for that case.
pub fn forward_initial(
    mut msg: SipMessage,
    source: SocketAddr,
    config: &Config,
    registrar: &Registrar,
    dialogs: &DialogTable,
    pending: &PendingRequestTable,
    invite_branches: &InviteBranchTable,
) -> Result<ForwardOutcome> {
    let request_uri = msg
        .request_uri()
        .ok_or_else(|| Error::ParseError("request has no Request-URI".into()))?
        .to_string();
    let uri = crate::message::parse_uri(&request_uri)?;
    let aor = uri.aor();

    let bindings = registrar.lookup(&aor);
    let binding = bindings
        .into_iter()
        .find(|b| !b.is_expired(std::time::Instant::now()))
        .ok_or_else(|| Error::NoRoute(aor.clone()))?;

    msg.set_request_uri(binding.contact_uri.clone());

    let our_host = config.advertised_host();
    let our_port = config.server_port;
    let decremented = check_loop_and_forwards(&msg, config, &our_host, our_port)?;

    annotate_via_received(&mut msg, source)?;
    let branch = push_own_via(&mut msg, &our_host, our_port);
    push_own_record_route(&mut msg, &our_host, our_port);
    msg.set_max_forwards(decremented);

    let call_id = msg.call_id().ok_or(Error::MissingHeader("Call-ID"))?.to_string();
    pending.insert(
        call_id.clone(),
        PendingRequestEntry {
            branch: branch.clone(),
            upstream_addr: source,
            downstream_addr: binding.received_addr,
            created_at: std::time::Instant::now(),
        },
    );

    if msg.method() == Some(Method::Invite) {
        let from = msg.from_value()?;
        invite_branches.insert(
            call_id.clone(),
            InviteBranchEntry {
                branch,
                downstream_addr: binding.received_addr,
                created_at: std::time::Instant::now(),
            },
        );
        dialogs.insert(DialogContext {
            call_id,
            state: DialogState::Early,
            from_tag: from.tag().unwrap_or_default().to_string(),
            to_tag: None,
            route_set: vec![],
            remote_target: Some(binding.contact_uri.clone()),
            upstream_via_addr: source,
            downstream_addr: Some(binding.received_addr),
            last_activity: std::time::Instant::now(),
        });
    }

    Ok(ForwardOutcome {
        message: msg,
        target: binding.received_addr,
    })
}

/// Whether a final response code is one of the end-of-path errors the
/// engine drops instead of propagating further (4.5 step 4).
pub fn is_dropped_final_response(status: u16) -> bool {
    matches!(status, 482 | 483 | 502 | 503 | 504)
}

pub enum ResponseOutcome {
    Forward(ForwardOutcome),
    Drop(&'static str),
}

/// Forwards a response, popping our own Via and consulting the Dialog
/// Context for final INVITE responses (4.5's "Dialog beats Via" rule).
pub fn forward_response(
    mut msg: SipMessage,
    our_host: &str,
    our_port: u16,
    dialogs: &DialogTable,
) -> Result<ResponseOutcome> {
    let Some(via_raw) = msg.top_via() else {
        return Ok(ResponseOutcome::Drop("no Via present"));
    };
    let top_via = via_raw?;
    let is_ours = top_via.host.eq_ignore_ascii_case(our_host)
        && top_via.port.unwrap_or(5060) == our_port;
    if !is_ours {
        return Ok(ResponseOutcome::Drop("top Via is not ours"));
    }
    msg.headers.remove(
        msg.headers
            .iter()
            .position(|h| h.name.eq_ignore_case(&HeaderName::Via))
            .unwrap(),
    );

    let status = msg.status_code().unwrap_or(0);
    if is_dropped_final_response(status) {
        return Ok(ResponseOutcome::Drop("end-of-path error response"));
    }

    let call_id = msg.call_id().map(|s| s.to_string());
    let cseq_method = msg.cseq().map(|(_, m)| m);
    let is_invite_final = cseq_method == Some(Method::Invite) && status >= 200;

    let dialog_target = call_id
        .as_deref()
        .and_then(|cid| dialogs.get(cid))
        .map(|ctx| ctx.upstream_via_addr);

    let target = if is_invite_final {
        dialog_target.unwrap_or_else(|| via_target(&msg).unwrap_or_else(|| "0.0.0.0:5060".parse().unwrap()))
    } else {
        match via_target(&msg) {
            Some(t) => t,
            None => return Ok(ResponseOutcome::Drop("no remaining Via")),
        }
    };

    if let Some(cid) = &call_id {
        if cseq_method == Some(Method::Invite) {
            if status >= 200 && status < 300 {
                let _ = dialogs.update(cid, |ctx| ctx.transition(DialogState::Confirmed));
            } else if status >= 300 && !matches!(status, 401 | 407) {
                dialogs.remove(cid);
            }
        } else if matches!(cseq_method, Some(Method::Bye) | Some(Method::Cancel)) && status == 200 {
            dialogs.remove(cid);
        }
    }

    Ok(ResponseOutcome::Forward(ForwardOutcome { message: msg, target }))
}

fn via_target(msg: &SipMessage) -> Option<SocketAddr> {
    let via = msg.top_via()?.ok()?;
    let host = via.received().map(|s| s.to_string()).unwrap_or(via.host.clone());
    let port = via.rport_value().or(via.port).unwrap_or(5060);
    format!("{host}:{port}").parse().ok()
}

/// Forwards an in-dialog request (BYE, re-INVITE, UPDATE, NOTIFY, REFER,
/// PRACK): consumes a leading Route that points at us, pushes our own Via,
/// and copies the INVITE's branch onto a CANCEL (4.5).
pub fn forward_in_dialog(
    mut msg: SipMessage,
    our_host: &str,
    our_port: u16,
    config: &Config,
    source: SocketAddr,
    dialogs: &DialogTable,
    invite_branches: &InviteBranchTable,
) -> Result<ForwardOutcome> {
    annotate_via_received(&mut msg, source)?;
    let mut routes = msg.routes()?;
    if let Some(first) = routes.first() {
        let points_at_us = first.uri.host_str().eq_ignore_ascii_case(our_host)
            && first.uri.port_or(our_port) == our_port;
        if points_at_us {
            routes.remove(0);
            msg.remove_headers(&HeaderName::Route);
            for r in &routes {
                msg.push_header(HeaderField::new(HeaderName::Route, crate::message::format_addr_header(r)));
            }
        }
    }

    let next_hop_uri = if let Some(first) = routes.first() {
        first.uri.to_string()
    } else {
        msg.request_uri().unwrap_or_default().to_string()
    };
    let next_hop = crate::message::parse_uri(&next_hop_uri)?;

    let decremented = check_loop_and_forwards(&msg, config, our_host, our_port)?;
    let mut branch = push_own_via(&mut msg, our_host, our_port);
    msg.set_max_forwards(decremented);

    // A CANCEL carries the same Request-URI the UAC sent on the original
    // INVITE (the AOR, not our rewritten Contact) and ordinarily no Route
    // set, so the generic Route/Request-URI resolution above would aim it
    // at the proxy itself rather than at the callee. It must "hit the same
    // server transaction downstream" (3, invite-branch) as the INVITE: same
    // target *and* same top-Via branch.
    let mut cancel_target = None;
    if msg.method() == Some(Method::Cancel) {
        if let Some(call_id) = msg.call_id().map(|s| s.to_string()) {
            if let Some(entry) = invite_branches.get(&call_id) {
                let pos = msg
                    .headers
                    .iter()
                    .position(|h| h.name.eq_ignore_case(&HeaderName::Via))
                    .expect("push_own_via just inserted one");
                let value = format!("SIP/2.0/UDP {our_host}:{our_port};branch={};rport", entry.branch);
                msg.headers[pos] = HeaderField::new(HeaderName::Via, value);
                branch = entry.branch;
                cancel_target = Some(entry.downstream_addr);
            }
        }
    }
    let _ = branch;

    let target = match cancel_target {
        Some(t) => t,
        None => {
            let target_port = next_hop.port_or(5060);
            format!("{}:{}", next_hop.host_str(), target_port)
                .parse()
                .map_err(|_| Error::NoRoute(next_hop_uri.clone()))?
        }
    };

    if matches!(msg.method(), Some(Method::Bye) | Some(Method::Cancel)) {
        if let Some(call_id) = msg.call_id() {
            let _ = dialogs.update(call_id, |ctx| ctx.transition(DialogState::Terminating));
        }
    }

    Ok(ForwardOutcome { message: msg, target })
}

/// ACK gets no Via of ours, per the stateless-proxy rule (4.5). 2xx-ACK uses
/// the dialog's route set / remote target; non-2xx-ACK reuses the original
/// INVITE's Request-URI and branch and is matched by Call-ID alone.
pub fn forward_ack(
    msg: SipMessage,
    dialogs: &DialogTable,
    invite_branches: &InviteBranchTable,
) -> Result<ForwardOutcome> {
    let call_id = msg.call_id().ok_or(Error::MissingHeader("Call-ID"))?.to_string();

    if let Some(ctx) = dialogs.get(&call_id) {
        let target = ctx
            .downstream_addr
            .ok_or_else(|| Error::NoRoute(call_id.clone()))?;
        return Ok(ForwardOutcome { message: msg, target });
    }

    let entry = invite_branches
        .get(&call_id)
        .ok_or_else(|| Error::NoRoute(call_id.clone()))?;
    Ok(ForwardOutcome {
        message: msg,
        target: entry.downstream_addr,
    })
}
