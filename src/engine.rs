//! HDCP protocol engine.
//!
//! [`Engine`] owns the link transport, both secure back-ends, the session
//! and the listener. Every entry point takes `&mut self`; deferred work is
//! kept as deadlines and picked up by [`Engine::run_due`]. The cancel flag is
//! shared so another thread can ask an in-flight enable to stop at its next
//! checkpoint.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::ddc::{Ddc, DdcPort};
use crate::error::{self, Error, Result};
use crate::hdcp1::{self, Hdcp1Flow};
use crate::hdcp1_tee::Hdcp1Backend;
use crate::hdcp2::{self, Hdcp2Flow};
use crate::hdcp2_tee::Hdcp2Backend;
use crate::session::{ContentProtection, Encryption, HdcpSession, HdcpState, Mcap, SinkVersion};
use crate::utils::RevocationList;

/// Every protocol delay and deadline the engine uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Minimum time between writing Aksv and reading R0'.
    pub r0_wait: Duration,
    /// Hot-plug sampling interval while waiting for R0'.
    pub hpd_poll: Duration,
    /// How long a repeater may take to fill its KSV FIFO.
    pub ksv_fifo: Duration,
    pub hdcp1_check_period: Duration,
    pub hdcp2_check_period: Duration,
    /// Delay before a failed enable is attempted again.
    pub recommit: Duration,
    pub ake_init_delay: Duration,
    /// Pause between repeater messages.
    pub msg_delay: Duration,
    /// Wall-clock bound on stream management retries.
    pub stream_manage: Duration,
    /// Gap between session key exchange and cipher enable.
    pub hdcp2_settle: Duration,
    pub cipher_clear_delay: Duration,
    pub ced_min: Duration,
    pub ced_max: Duration,
    pub ced_poll: Duration,
    /// Consecutive clean CED reads required.
    pub ced_passes: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            r0_wait: Duration::from_millis(300),
            hpd_poll: Duration::from_millis(10),
            ksv_fifo: Duration::from_secs(5),
            hdcp1_check_period: Duration::from_millis(500),
            hdcp2_check_period: Duration::from_millis(2000),
            recommit: Duration::from_millis(100),
            ake_init_delay: Duration::from_millis(10),
            msg_delay: Duration::from_millis(30),
            stream_manage: Duration::from_millis(120),
            hdcp2_settle: Duration::from_millis(200),
            cipher_clear_delay: Duration::from_millis(50),
            ced_min: Duration::from_millis(100),
            ced_max: Duration::from_millis(1500),
            ced_poll: Duration::from_millis(30),
            ced_passes: 3,
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for tests and the simulator.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            r0_wait: Duration::from_millis(5),
            hpd_poll: Duration::from_millis(1),
            ksv_fifo: Duration::from_millis(50),
            hdcp1_check_period: Duration::from_millis(20),
            hdcp2_check_period: Duration::from_millis(40),
            recommit: Duration::from_millis(10),
            ake_init_delay: Duration::ZERO,
            msg_delay: Duration::from_millis(1),
            stream_manage: Duration::from_millis(10),
            hdcp2_settle: Duration::from_millis(4),
            cipher_clear_delay: Duration::ZERO,
            ced_min: Duration::ZERO,
            ced_max: Duration::from_millis(20),
            ced_poll: Duration::from_millis(1),
            ced_passes: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// 0 for HDCP 1.4 only, 2 or more to try HDCP 2.2 first.
    pub support_level: u32,
    /// Skip HDCP 2.2 even on a capable sink.
    pub force_hdcp14: bool,
    pub timings: Timings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            support_level: 2,
            force_hdcp14: false,
            timings: Timings::default(),
        }
    }
}

/// Emitted on every effective state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEvent {
    pub state: HdcpState,
    pub error: Option<Error>,
}

impl StateEvent {
    #[must_use]
    pub fn code(&self) -> u32 {
        self.error.map_or(error::NO_ERROR, |e| e.code())
    }

    /// `KEY=value` strings in uevent form.
    #[must_use]
    pub fn envp(&self) -> [String; 3] {
        [
            format!("HDCP_STATE={}", self.state.name()),
            format!("HDCP_ERR={}", self.code()),
            format!("HDCP_ERR_DES={}", error::describe(self.code())),
        ]
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [state, err, des] = self.envp();
        write!(f, "{state}, {err}, {des}")
    }
}

/// Receives state events and content protection updates.
pub trait HdcpListener: Send {
    fn state_changed(&mut self, event: &StateEvent);

    fn content_protection_changed(&mut self, _value: ContentProtection) {}
}

pub struct Engine<P, H1, H2> {
    ddc: Ddc<P>,
    hdcp1: H1,
    hdcp2: H2,
    session: HdcpSession,
    config: EngineConfig,
    revoked: RevocationList,
    listener: Option<Box<dyn HdcpListener>>,
    cancel: Arc<AtomicBool>,
    check_at: Option<Instant>,
    commit_at: Option<Instant>,
}

impl<P: DdcPort, H1: Hdcp1Backend, H2: Hdcp2Backend> Engine<P, H1, H2> {
    pub fn new(port: P, hdcp1: H1, hdcp2: H2, config: EngineConfig) -> Self {
        let session = HdcpSession {
            force_hdcp14: config.force_hdcp14,
            ..Default::default()
        };
        Self {
            ddc: Ddc::new(port),
            hdcp1,
            hdcp2,
            session,
            config,
            revoked: RevocationList::new(),
            listener: None,
            cancel: Arc::new(AtomicBool::new(false)),
            check_at: None,
            commit_at: None,
        }
    }

    #[must_use]
    pub fn with_revocation_list(mut self, revoked: RevocationList) -> Self {
        self.revoked = revoked;
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: impl HdcpListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn session(&self) -> &HdcpSession {
        &self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ddc(&self) -> &Ddc<P> {
        &self.ddc
    }

    pub fn ddc_mut(&mut self) -> &mut Ddc<P> {
        &mut self.ddc
    }

    pub fn hdcp1(&self) -> &H1 {
        &self.hdcp1
    }

    pub fn hdcp1_mut(&mut self) -> &mut H1 {
        &mut self.hdcp1
    }

    pub fn hdcp2(&self) -> &H2 {
        &self.hdcp2
    }

    pub fn hdcp2_mut(&mut self) -> &mut H2 {
        &mut self.hdcp2
    }

    /// Flag checked by [`Engine::enable`] at its checkpoints.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Set up back-ends and seed the session from the current link.
    pub fn init(&mut self) -> Result<()> {
        self.session.hdcp2_supported = self.config.support_level >= 2;
        self.session.encryption = Encryption::None;
        self.session.error = None;
        self.cancel.store(false, Ordering::SeqCst);

        if self.session.hdcp2_supported {
            self.hdcp2.init().map_err(|e| {
                error!("hdcp2 init failed: {e}");
                e
            })?;
            if let Err(e) = self.hdcp2.read_key() {
                error!("hdcp2 key doesn't exist, dis support hdcp2: {e}");
                self.session.hdcp2_supported = false;
            }
        }

        self.session.value = ContentProtection::Undesired;

        if self.ddc.hpd() {
            self.session.state = HdcpState::Unauthenticated;
            self.session.sink_version = self.detect_sink_version();
        } else {
            self.session.sink_version = SinkVersion::None;
            self.session.state = HdcpState::HdmiDisconnected;
            if self.session.hdcp2_supported {
                self.session.mcap = Mcap::NoDigitalOutput;
                self.hdcp2.update_mcap(Mcap::NoDigitalOutput);
            }
        }
        info!(
            "hdcp init, hdcp2_supported={} sink_hdcp_ver={}",
            self.session.hdcp2_supported, self.session.sink_version as u8
        );
        Ok(())
    }

    fn detect_sink_version(&mut self) -> SinkVersion {
        if matches!(hdcp2::capable(&mut self.ddc), Ok(true)) {
            SinkVersion::Hdcp2
        } else if hdcp1::capable(&mut self.ddc).is_ok() {
            SinkVersion::Hdcp1
        } else {
            SinkVersion::None
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    fn hdcp1_flow(&mut self) -> Hdcp1Flow<'_, P, H1> {
        Hdcp1Flow {
            ddc: &mut self.ddc,
            backend: &mut self.hdcp1,
            session: &mut self.session,
            revoked: &self.revoked,
            timings: &self.config.timings,
        }
    }

    fn hdcp2_flow(&mut self) -> Hdcp2Flow<'_, P, H2> {
        Hdcp2Flow {
            ddc: &mut self.ddc,
            backend: &mut self.hdcp2,
            session: &mut self.session,
            revoked: &self.revoked,
            timings: &self.config.timings,
        }
    }

    fn set_state(&mut self, state: HdcpState, error: Option<Error>) {
        if !self.ddc.hpd()
            && self.session.state == HdcpState::HdmiDisconnected
            && state == HdcpState::Unauthenticated
        {
            return;
        }
        if self.session.state == state {
            return;
        }
        self.session.state = state;
        self.session.error = error;

        let event = StateEvent { state, error };
        if self.session.suspended {
            info!("skip state event in suspend");
        } else if let Some(listener) = self.listener.as_mut() {
            listener.state_changed(&event);
        }
        info!("{event}");
    }

    /// Record a failed attempt. Unplug always reads as a disconnect.
    fn set_failure(&mut self, state: HdcpState, e: Error) {
        if e.is_plugout() {
            self.set_state(HdcpState::HdmiDisconnected, Some(e));
        } else {
            self.set_state(state, Some(e));
        }
    }

    fn notify_content_protection(&mut self) {
        let value = self.session.value;
        if value == ContentProtection::Undesired {
            return;
        }
        debug!("update content_protection={value:?}");
        if let Some(listener) = self.listener.as_mut() {
            listener.content_protection_changed(value);
        }
    }

    fn check_period(&self) -> Duration {
        if self.session.hdcp2_encrypted() {
            self.config.timings.hdcp2_check_period
        } else {
            self.config.timings.hdcp1_check_period
        }
    }

    fn wait_ced_stable(&mut self) {
        let t = self.config.timings.clone();
        let start = Instant::now();
        thread::sleep(t.ced_min);

        let mut stable = 0;
        let mut res = Ok(());
        while stable < t.ced_passes {
            res = self.ddc.check_ced();
            match res {
                Err(Error::Plugout | Error::CedNotSupported | Error::DdcReadTransfer) => break,
                Ok(()) => stable += 1,
                Err(_) => stable = 0,
            }
            if start.elapsed() > t.ced_max || self.cancelled() {
                break;
            }
            thread::sleep(t.ced_poll);
        }

        match res {
            Ok(()) => info!("CED check consume {}ms", start.elapsed().as_millis()),
            Err(e) => info!("CED result: {e}"),
        }
    }

    /// Authenticate with the best version both ends support and start
    /// encryption.
    pub fn enable(&mut self) -> Result<()> {
        info!(
            "enable hdcp, hdcp2_supported={} force_hdcp14={}",
            self.session.hdcp2_supported, self.session.force_hdcp14
        );
        self.wait_ced_stable();

        if self.session.value == ContentProtection::Enabled {
            warn!("enable while content protection is already enabled");
        }
        let res = self.try_enable();
        if res.is_ok() {
            self.session.value = ContentProtection::Enabled;
        }

        if self.cancelled() {
            info!("cancel hdcp authentication");
            return Err(Error::Canceled);
        }

        match res {
            Ok(()) => {
                self.check_at = Some(Instant::now() + self.check_period());
                self.notify_content_protection();
            }
            Err(e) if e.allows_retry() && self.session.value == ContentProtection::Desired => {
                self.commit_at = Some(Instant::now() + self.config.timings.recommit);
            }
            Err(_) => {}
        }
        res
    }

    fn try_enable(&mut self) -> Result<()> {
        self.checkpoint()?;
        // One cipher at a time, whichever version wins below.
        self.stop_cipher();

        let mut use_hdcp2 = false;
        // HDCP 2.2 is preferred whenever both ends can do it.
        if self.session.hdcp2_supported && !self.session.force_hdcp14 {
            match hdcp2::capable(&mut self.ddc) {
                Ok(capable) => use_hdcp2 = capable,
                Err(e) => info!("sink device doesn't support hdcp2: {e}"),
            }
            if !self.hdcp2.is_initialized() {
                if let Err(e) = self.hdcp2.init().and_then(|()| self.hdcp2.read_key()) {
                    error!("hdcp2 back-end unavailable: {e}");
                    use_hdcp2 = false;
                }
            }
        }

        self.checkpoint()?;
        if use_hdcp2 {
            self.session.sink_version = SinkVersion::Hdcp2;
            self.set_state(HdcpState::Hdcp2InAuth, None);
            match self.enable_hdcp2() {
                Ok(()) => return Ok(()),
                Err(Error::Plugout) => return Err(Error::Plugout),
                Err(e) => debug!("falling back to HDCP1.4 after {e}"),
            }
        }

        self.checkpoint()?;
        match hdcp1::capable(&mut self.ddc) {
            Ok(()) => {
                if self.session.sink_version != SinkVersion::Hdcp2 {
                    self.session.sink_version = SinkVersion::Hdcp1;
                }
                self.set_state(HdcpState::Hdcp1InAuth, None);
                self.enable_hdcp1()
            }
            Err(e) => {
                self.set_failure(HdcpState::Hdcp1Failure, e);
                Err(e)
            }
        }
    }

    fn enable_hdcp1(&mut self) -> Result<()> {
        debug!("HDCP1.4 is being enabled");
        if let Err(e) = self.hdcp1.init() {
            self.set_failure(HdcpState::Hdcp1Failure, e);
            return Err(e);
        }
        match self.hdcp1_flow().authenticate() {
            Ok(()) => {
                self.session.encryption = Encryption::Hdcp1;
                self.set_state(HdcpState::Hdcp1Success, None);
                debug!("HDCP1.4 is enabled");
                Ok(())
            }
            Err(e) => {
                debug!("HDCP1.4 auth failure: {e}");
                self.disable_hdcp1();
                self.set_failure(HdcpState::Hdcp1Failure, e);
                Err(e)
            }
        }
    }

    fn enable_hdcp2(&mut self) -> Result<()> {
        debug!("HDCP2 authentication start");
        match self.hdcp2_flow().authenticate_and_encrypt() {
            Ok(()) => {
                self.session.encryption = Encryption::Hdcp2;
                self.set_state(HdcpState::Hdcp2Success, None);
                debug!("HDCP2 authentication done, cipher is enabled");
                Ok(())
            }
            Err(e) => {
                debug!("HDCP2 authentication failed: {e}");
                self.set_failure(HdcpState::Hdcp2Failure, e);
                Err(e)
            }
        }
    }

    fn disable_hdcp1(&mut self) {
        self.hdcp1_flow().disable();
        self.session.encryption = Encryption::None;
    }

    fn disable_hdcp2(&mut self) {
        self.hdcp2_flow().disable();
        self.session.encryption = Encryption::None;
    }

    fn stop_cipher(&mut self) {
        match self.session.encryption {
            Encryption::Hdcp2 => self.disable_hdcp2(),
            Encryption::Hdcp1 => self.disable_hdcp1(),
            Encryption::None => {}
        }
    }

    /// Stop encryption and pending work. Safe to call in any state.
    pub fn disable(&mut self) {
        info!(
            "disable hdcp, current hdcp2_encrypted={} hdcp_encrypted={}",
            self.session.hdcp2_encrypted(),
            self.session.hdcp1_encrypted()
        );
        self.cancel.store(true, Ordering::SeqCst);
        self.check_at = None;
        self.commit_at = None;

        self.stop_cipher();
        if self.session.value != ContentProtection::Undesired {
            self.session.value = ContentProtection::Desired;
        }

        self.cancel.store(false, Ordering::SeqCst);
        let state = if self.ddc.hpd() && !self.ddc.output_enabled() {
            HdcpState::HdmiDisabled
        } else {
            HdcpState::Unauthenticated
        };
        self.set_state(state, None);
    }

    /// Periodic link integrity check for whichever version is running.
    ///
    /// On success the next check is scheduled. When nothing is encrypted and
    /// protection is still desired, a commit is scheduled instead.
    pub fn check_link(&mut self) -> Result<()> {
        self.check_at = None;
        let res = if self.session.value != ContentProtection::Enabled {
            Ok(())
        } else {
            match self.session.encryption {
                Encryption::Hdcp2 => self.check_hdcp2_link(),
                Encryption::Hdcp1 => self.check_hdcp1_link(),
                Encryption::None => Ok(()),
            }
        };

        if res.is_ok() && self.session.encryption != Encryption::None {
            self.check_at = Some(Instant::now() + self.check_period());
        }
        if self.session.encryption == Encryption::None
            && self.session.value == ContentProtection::Desired
        {
            self.commit_at = Some(Instant::now() + self.config.timings.recommit);
        }
        res
    }

    fn check_hdcp1_link(&mut self) -> Result<()> {
        let e = match self.hdcp1_flow().check_link() {
            Ok(()) => {
                trace!("HDCP1.4 integrity check ri = ri'");
                return Ok(());
            }
            Err(e) => e,
        };
        self.disable_hdcp1();
        self.session.value = ContentProtection::Desired;
        self.set_failure(HdcpState::Hdcp1Failure, e);
        debug!("HDCP1.4 link failed: {e}");
        self.notify_content_protection();
        Err(e)
    }

    fn check_hdcp2_link(&mut self) -> Result<()> {
        let e = match hdcp2::check_link(&mut self.ddc) {
            Ok(()) => {
                trace!("HDCP2 polling rx status");
                return Ok(());
            }
            Err(Error::TopologyChange) => {
                debug!("HDCP2 downstream topology change");
                let mut flow = self.hdcp2_flow();
                match flow.repeater_topology() {
                    Ok(()) => {
                        let mcap = flow.downstream_mcap();
                        self.session.mcap = mcap;
                        self.hdcp2.update_mcap(mcap);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("HDCP2 repeater topology auth failed: {e}");
                        e
                    }
                }
            }
            Err(e) => e,
        };
        self.disable_hdcp2();
        self.session.value = ContentProtection::Desired;
        self.set_failure(HdcpState::Hdcp2Failure, e);
        debug!("HDCP2 link failed: {e}");
        self.notify_content_protection();
        Err(e)
    }

    /// Content protection property change from the connector.
    ///
    /// Only a request to turn protection off, or a first request to turn it
    /// on, schedules a commit.
    pub fn commit_state(&mut self, old: ContentProtection, new: ContentProtection) {
        if old == new {
            return;
        }
        if new == ContentProtection::Undesired
            || (old == ContentProtection::Undesired && new == ContentProtection::Desired)
        {
            info!("change content_protection {old:?} -> {new:?}");
            self.session.value = new;
            self.commit_at = Some(Instant::now());
        }
    }

    /// Apply the current content protection value.
    pub fn commit(&mut self) {
        if self.cancelled() {
            info!("cancel pending, skip commit");
            return;
        }
        match self.session.value {
            ContentProtection::Desired => {
                if self.session.encryption != Encryption::None {
                    self.disable();
                }
                if self.ddc.output_enabled() {
                    // Failures are recorded in the session and may re-arm a commit.
                    let _ = self.enable();
                } else {
                    info!("skip enable hdcp when hdmi is off");
                }
            }
            ContentProtection::Undesired => self.disable(),
            ContentProtection::Enabled => {}
        }
        debug!("commit done, value={:?}", self.session.value);
    }

    /// Downstream capability tag reported by the output controller.
    pub fn update_cap(&mut self, mcap: Mcap) {
        if self.session.hdcp2_supported {
            self.session.mcap = mcap;
            self.hdcp2.update_mcap(mcap);
        }
        match mcap {
            Mcap::None => self.session.sink_version = self.detect_sink_version(),
            Mcap::NoDigitalOutput => self.session.sink_version = SinkVersion::None,
            _ => {}
        }
    }

    /// Hot-plug edge from the connector.
    pub fn on_hotplug(&mut self, connected: bool) {
        if connected {
            self.session.sink_version = self.detect_sink_version();
            self.set_state(HdcpState::Unauthenticated, None);
            if self.session.value != ContentProtection::Undesired {
                self.session.value = ContentProtection::Desired;
                self.commit_at = Some(Instant::now());
            }
            return;
        }

        self.check_at = None;
        self.commit_at = None;
        self.stop_cipher();
        if self.session.value == ContentProtection::Enabled {
            self.session.value = ContentProtection::Desired;
            self.notify_content_protection();
        }
        self.session.sink_version = SinkVersion::None;
        self.set_state(HdcpState::HdmiDisconnected, None);
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.session.suspended = suspended;
    }

    pub fn set_force_hdcp14(&mut self, force: bool) {
        self.session.force_hdcp14 = force;
    }

    pub fn set_rekey_window(&mut self, rekey_win: u8) -> Result<()> {
        self.hdcp1.init()?;
        self.hdcp1.set_rekey_window(rekey_win)
    }

    /// Earliest pending work item.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.check_at, self.commit_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run every work item due at `now`.
    pub fn run_due(&mut self, now: Instant) {
        if self.check_at.is_some_and(|at| at <= now) {
            self.check_at = None;
            // Failures are reflected in the session state.
            let _ = self.check_link();
        }
        if self.commit_at.is_some_and(|at| at <= now) {
            self.commit_at = None;
            self.commit();
        }
    }

    /// `hdcp_info` attribute.
    #[must_use]
    pub fn hdcp_info(&self) -> String {
        self.session.info()
    }

    /// `hdcp_state` attribute.
    #[must_use]
    pub fn hdcp_state(&self) -> String {
        self.session.state_attr()
    }

    /// Disable and close both back-ends.
    pub fn shutdown(&mut self) {
        self.disable();
        self.hdcp1.deinit();
        self.hdcp2.deinit();
    }
}
