//! Server-side call dispatch.
//!
//! Turns one CALL into exactly one reply frame. Every failure a client can
//! cause is answered with a FAILURE reply carrying the matching status; the
//! session itself is never torn down from here.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::protocol::rpc::{CallContext, Context};
use crate::protocol::xdr::rpc::{
    call_body, call_stat, garbage_args_reply_message, make_failure_reply, make_success_reply,
    rpc_msg, rpc_vers_mismatch, unimplemented_reply_message, RPC_VERSION,
};

/// Handles one call and produces its reply.
///
/// An empty service and method name is a ping and is answered with an empty
/// success payload without touching the handler set.
#[tracing_attributes::instrument(
    skip_all,
    fields(xid = xid, service = %call.service, method = %call.method)
)]
pub async fn handle_call(
    xid: u32,
    call: call_body,
    context: &Context,
    cancellation: watch::Receiver<bool>,
) -> rpc_msg {
    if call.rpcvers != RPC_VERSION {
        warn!("Invalid RPC version {} != {}", call.rpcvers, RPC_VERSION);
        return rpc_vers_mismatch(xid, call.rpcvers);
    }

    if call.is_ping() {
        trace!("ping from {}", context.client_addr);
        return make_success_reply(xid, Vec::new());
    }

    let Some(bound) = context.handlers.lookup(&call.service, &call.method) else {
        debug!("No handler bound for {}/{}", call.service, call.method);
        return unimplemented_reply_message(xid, &call.service, &call.method);
    };

    let codec = context.handlers.codec();
    let request = match codec.decode(&call.payload, &bound.request) {
        Ok(request) => request,
        Err(e) => {
            warn!("Undecodable {} payload: {}", bound.request.name(), e);
            return garbage_args_reply_message(xid, format!("{}: {e}", bound.request.name()));
        }
    };

    let deadline =
        (call.timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(call.timeout_ms));
    let call_context = CallContext::new(&call.service, &call.method, deadline, cancellation);

    let outcome =
        AssertUnwindSafe(bound.handler.handle(request, call_context)).catch_unwind().await;
    match outcome {
        Ok(Ok(response)) => match codec.encode(&response, &bound.response) {
            Ok(payload) => {
                trace!("{} replied with {} bytes", bound.definition.name, payload.len());
                make_success_reply(xid, payload)
            }
            Err(e) => {
                error!("Handler response is not a valid {}: {}", bound.response.name(), e);
                make_failure_reply(
                    xid,
                    call_stat::HANDLER_ERROR,
                    format!("response is not a valid {}: {e}", bound.response.name()),
                )
            }
        },
        Ok(Err(e)) if e.is_cancellation() => {
            debug!("Handler observed cancellation");
            make_failure_reply(xid, call_stat::CANCELLED, e.message())
        }
        Ok(Err(e)) => {
            debug!("Handler failed: {}", e);
            make_failure_reply(xid, call_stat::HANDLER_ERROR, e.message())
        }
        Err(_) => {
            error!("Handler panicked");
            make_failure_reply(xid, call_stat::HANDLER_ERROR, "handler panicked")
        }
    }
}
