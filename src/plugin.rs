//! Plugin trait and the per-session message loop shared by every service.

use crate::channel::Channel;
use crate::error::HandlerOutcome;
use crate::rpc::Request;

/// A service plugin instantiated fresh for each TCP session.
pub trait Plugin {
    /// The 4-byte ASCII plugin tag this handler answers to.
    fn mark(&self) -> &'static str;

    /// Handle one request. Implementations never panic; they report
    /// failure through `HandlerOutcome`.
    fn handle(&mut self, channel: &mut Channel, request: &Request) -> HandlerOutcome;
}

/// Drive the plugin's message loop for the lifetime of one session.
///
/// ```text
/// loop:
///   req <- channel.rpcRead()
///   if req is None: return               // clean end-of-stream
///   match plugin.handle(req):
///     Continue(Some(resp)) -> channel.rpcSend(resp); continue
///     Continue(None)       -> continue                      // no reply by contract
///     Abort(msg)           -> log(msg); continue             // no protocol reply
///     Kill(msg)             -> log(msg); return               // terminate session
/// ```
pub fn run_session(channel: &mut Channel, plugin: &mut dyn Plugin) {
    loop {
        let request = match channel.rpc_read() {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                log::warn!("[{}] transport break: {}", plugin.mark(), e);
                return;
            }
        };
        match plugin.handle(channel, &request) {
            HandlerOutcome::Continue(Some(response)) => {
                if let Err(e) = channel.rpc_send(&response) {
                    log::warn!("[{}] failed to send response: {}", plugin.mark(), e);
                    return;
                }
            }
            HandlerOutcome::Continue(None) => {}
            HandlerOutcome::Abort(msg) => {
                log::warn!("[{}] {}", plugin.mark(), msg);
            }
            HandlerOutcome::Kill(msg) => {
                log::warn!("[{}] {}", plugin.mark(), msg);
                return;
            }
        }
    }
}
