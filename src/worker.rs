//! Actor thread that owns an [`Engine`].
//!
//! Requests arrive over a `std::sync::mpsc` queue and run one at a time, so
//! the engine never needs a lock. Between requests the thread sleeps until
//! the engine's next deadline and runs whatever work is due.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::ddc::DdcPort;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::hdcp1_tee::Hdcp1Backend;
use crate::hdcp2_tee::Hdcp2Backend;
use crate::session::{ContentProtection, Encryption, HdcpState, Mcap, SinkVersion};

/// Snapshot of the engine taken on the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: HdcpState,
    pub error: Option<Error>,
    pub value: ContentProtection,
    pub encryption: Encryption,
    pub sink_version: SinkVersion,
    pub hdcp_info: String,
    pub hdcp_state: String,
}

enum Request {
    Enable(Sender<Result<()>>),
    Disable(Sender<()>),
    LinkCheckTick(Sender<Result<()>>),
    CapabilityUpdate(Mcap),
    CommitState {
        old: ContentProtection,
        new: ContentProtection,
    },
    Hotplug(bool),
    Status(Sender<Status>),
    Shutdown,
}

/// Handle to a running worker.
///
/// Dropping the handle stops the worker and shuts the engine down.
pub struct HdcpHandle<P, H1, H2> {
    tx: Sender<Request>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine<P, H1, H2>>>,
}

/// Move `engine` onto its own thread.
pub fn spawn<P, H1, H2>(engine: Engine<P, H1, H2>) -> io::Result<HdcpHandle<P, H1, H2>>
where
    P: DdcPort + 'static,
    H1: Hdcp1Backend + 'static,
    H2: Hdcp2Backend + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = engine.cancel_flag();
    let thread = thread::Builder::new()
        .name("rtkhdcp-worker".into())
        .spawn(move || run(engine, rx))?;
    Ok(HdcpHandle {
        tx,
        cancel,
        thread: Some(thread),
    })
}

fn run<P, H1, H2>(mut engine: Engine<P, H1, H2>, rx: Receiver<Request>) -> Engine<P, H1, H2>
where
    P: DdcPort,
    H1: Hdcp1Backend,
    H2: Hdcp2Backend,
{
    debug!("hdcp worker started");
    loop {
        let request = match engine.next_deadline() {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    engine.run_due(now);
                    continue;
                }
                match rx.recv_timeout(at - now) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        engine.run_due(Instant::now());
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        // A caller that gave up waiting is not an error.
        match request {
            Request::Enable(reply) => {
                let _ = reply.send(engine.enable());
            }
            Request::Disable(reply) => {
                engine.disable();
                let _ = reply.send(());
            }
            Request::LinkCheckTick(reply) => {
                let _ = reply.send(engine.check_link());
            }
            Request::CapabilityUpdate(mcap) => engine.update_cap(mcap),
            Request::CommitState { old, new } => engine.commit_state(old, new),
            Request::Hotplug(connected) => engine.on_hotplug(connected),
            Request::Status(reply) => {
                let session = engine.session();
                let _ = reply.send(Status {
                    state: session.state,
                    error: session.error,
                    value: session.value,
                    encryption: session.encryption,
                    sink_version: session.sink_version,
                    hdcp_info: engine.hdcp_info(),
                    hdcp_state: engine.hdcp_state(),
                });
            }
            Request::Shutdown => break,
        }
    }
    engine.shutdown();
    debug!("hdcp worker stopped");
    engine
}

impl<P, H1, H2> HdcpHandle<P, H1, H2> {
    fn send(&self, request: Request) {
        if self.tx.send(request).is_err() {
            warn!("hdcp worker is gone");
        }
    }

    fn round_trip<T>(&self, request: impl FnOnce(Sender<T>) -> Request) -> Option<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(request(reply_tx));
        reply_rx.recv().ok()
    }

    /// Authenticate now. `Err(Error::Canceled)` also covers a stopped worker.
    pub fn enable(&self) -> Result<()> {
        self.round_trip(Request::Enable)
            .unwrap_or(Err(Error::Canceled))
    }

    /// Cancel any in-flight enable and tear encryption down. Returns once
    /// the worker has processed the request.
    pub fn disable(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if self.round_trip(Request::Disable).is_none() {
            self.cancel.store(false, Ordering::SeqCst);
        }
    }

    /// Run one link check immediately.
    pub fn check_link(&self) -> Result<()> {
        self.round_trip(Request::LinkCheckTick)
            .unwrap_or(Err(Error::Canceled))
    }

    pub fn update_cap(&self, mcap: Mcap) {
        self.send(Request::CapabilityUpdate(mcap));
    }

    pub fn commit_state(&self, old: ContentProtection, new: ContentProtection) {
        self.send(Request::CommitState { old, new });
    }

    pub fn hotplug(&self, connected: bool) {
        self.send(Request::Hotplug(connected));
    }

    pub fn status(&self) -> Option<Status> {
        self.round_trip(Request::Status)
    }

    /// Stop the worker and take the engine back.
    pub fn shutdown(mut self) -> Option<Engine<P, H1, H2>> {
        self.stop()
    }

    fn stop(&mut self) -> Option<Engine<P, H1, H2>> {
        let thread = self.thread.take()?;
        self.send(Request::Shutdown);
        thread.join().ok()
    }
}

impl<P, H1, H2> Drop for HdcpHandle<P, H1, H2> {
    fn drop(&mut self) {
        // Engine is dropped on this thread once joined.
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::spawn;
    use crate::engine::{EngineConfig, Timings};
    use crate::error::Error;
    use crate::session::{ContentProtection, Encryption, HdcpState};
    use crate::sim::{self, SimState};

    fn config() -> EngineConfig {
        EngineConfig {
            timings: Timings::fast(),
            ..Default::default()
        }
    }

    #[test]
    fn requests_run_on_worker() {
        let state = SimState::hdcp1_sink();
        let mut engine = sim::engine(&state, config());
        engine.init().expect("init");
        let handle = spawn(engine).expect("spawn");

        handle.enable().expect("enable");
        let status = handle.status().expect("status");
        assert_eq!(status.state, HdcpState::Hdcp1Success);
        assert_eq!(status.encryption, Encryption::Hdcp1);
        assert_eq!(status.hdcp_state, "STATE=HDCP1_SUCCESS\nHDCP_ERR=0\n");
        handle.check_link().expect("link ok");

        handle.disable();
        let status = handle.status().expect("status");
        assert_eq!(status.state, HdcpState::Unauthenticated);
        assert!(!state.lock().hdcp1_encryption);

        let engine = handle.shutdown().expect("engine back");
        assert_eq!(engine.session().encryption, Encryption::None);
    }

    #[test]
    fn commit_state_runs_from_deadline() {
        let state = SimState::hdcp2_sink();
        let mut engine = sim::engine(&state, config());
        engine.init().expect("init");
        let handle = spawn(engine).expect("spawn");

        handle.commit_state(ContentProtection::Undesired, ContentProtection::Desired);
        let mut status = handle.status().expect("status");
        for _ in 0..100 {
            if status.state == HdcpState::Hdcp2Success {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
            status = handle.status().expect("status");
        }
        assert_eq!(status.state, HdcpState::Hdcp2Success);
        assert_eq!(status.value, ContentProtection::Enabled);

        // periodic checks keep polling RxStatus in the background
        let before = state.lock().reads_at(0x70);
        std::thread::sleep(Duration::from_millis(100));
        assert!(state.lock().reads_at(0x70) > before);
    }

    #[test]
    fn stopped_worker_reports_canceled() {
        let state = SimState::hdcp1_sink();
        let mut engine = sim::engine(&state, config());
        engine.init().expect("init");
        let mut handle = spawn(engine).expect("spawn");
        assert!(handle.stop().is_some());
        assert_eq!(handle.enable(), Err(Error::Canceled));
        assert!(handle.status().is_none());
        handle.disable();
    }
}
