//! RPC correlation: pending-request bookkeeping, the three invocation modes,
//! and dispatch of inbound requests to registered per-command handlers.

mod core;
mod server;
mod service;

pub use self::core::RemotingCore;
pub use server::RemotingServer;
pub use service::RemotingService;

use crate::protocol::RemotingCommand;
use crate::transport::ConnectionContext;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Processes one inbound request for a registered command code.
///
/// Returning `Ok(Some(response))` sends the response (unless the request was
/// oneway); `Ok(None)` means the handler already responded out-of-band or
/// has nothing to send; `Err` is turned into a SYSTEM_ERROR response to the
/// peer and never propagates further.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn process(
        &self,
        ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>>;
}

/// Wraps every handler invocation and every outbound invocation.
pub trait RpcHook: Send + Sync {
    fn before_request(&self, ctx: &Arc<ConnectionContext>, request: &RemotingCommand);
    fn after_response(
        &self,
        ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
        response: Option<&RemotingCommand>,
    );
}

/// Callback delivered exactly once per async invocation, by whichever of
/// response arrival and timeout sweep resolves the pending entry first.
pub type InvokeCallback = Box<dyn Fn(&ResponseFuture) + Send + Sync>;

/// Bookkeeping for one outstanding request awaiting its response.
pub struct ResponseFuture {
    opaque: i32,
    timeout: Duration,
    begin: Instant,
    send_ok: AtomicBool,
    timed_out: AtomicBool,
    callback_fired: AtomicBool,
    response: Mutex<Option<RemotingCommand>>,
    callback: Option<InvokeCallback>,
    completion: Mutex<Option<oneshot::Sender<()>>>,
}

impl ResponseFuture {
    pub(crate) fn new(opaque: i32, timeout: Duration, callback: Option<InvokeCallback>) -> Self {
        Self {
            opaque,
            timeout,
            begin: Instant::now(),
            send_ok: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            callback_fired: AtomicBool::new(false),
            response: Mutex::new(None),
            callback,
            completion: Mutex::new(None),
        }
    }

    /// The correlation id this future is waiting on.
    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    /// Whether the request was written to the socket successfully.
    pub fn is_send_ok(&self) -> bool {
        self.send_ok.load(Ordering::SeqCst)
    }

    /// Whether the timeout sweep expired this request.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// The matched response, if one arrived before the timeout.
    pub fn response_command(&self) -> Option<RemotingCommand> {
        self.response.lock().clone()
    }

    pub(crate) fn mark_send_ok(&self) {
        self.send_ok.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_response(&self, response: RemotingCommand) {
        *self.response.lock() = Some(response);
    }

    pub(crate) fn take_response(&self) -> Option<RemotingCommand> {
        self.response.lock().take()
    }

    pub(crate) fn set_completion(&self, tx: oneshot::Sender<()>) {
        *self.completion.lock() = Some(tx);
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn is_expired(&self, margin: Duration) -> bool {
        self.begin.elapsed() >= self.timeout + margin
    }

    /// Invoke the callback (at most once) and release the completion signal.
    pub(crate) fn complete(&self) {
        if let Some(callback) = &self.callback {
            if !self.callback_fired.swap(true, Ordering::SeqCst) {
                callback(self);
            }
        }
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(());
        }
    }
}
