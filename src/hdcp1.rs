//! HDCP 1.4 authentication and link integrity.

use std::time::{Duration, Instant};

use crate::ddc::{
    Ddc, DdcPort, BCAPS_KSV_FIFO_READY, BCAPS_REPEATER, HDCP1_AKSV, HDCP1_AN, HDCP1_BCAPS,
    HDCP1_BKSV, HDCP1_BSTATUS, HDCP1_KSV_FIFO, HDCP1_RI_PRIME, HDCP1_V_PRIME,
};
use crate::engine::Timings;
use crate::error::{Error, Result};
use crate::hdcp1_tee::{Hdcp1Backend, BSTATUS_LEN, RI_LEN, SHA_DATA_LEN, V_PRIME_LEN};
use crate::session::HdcpSession;
use crate::utils::{is_valid_ksv, wait_for, RevocationList, KSV_LEN};

/// Bksv reads before giving up on an invalid value.
const BKSV_TRIES: usize = 2;
/// Ri' read and verify attempts per link check.
const RI_RETRY_CNT: usize = 2;
const V_PRIME_PART_LEN: usize = 4;

const BSTATUS_MAX_DEVS_EXCEEDED: u8 = 0x80;
const BSTATUS_MAX_CASCADE_EXCEEDED: u8 = 0x08;
const BSTATUS_DEVICE_COUNT: u8 = 0x7f;

/// Whether the sink answers on the HDCP 1.4 port at all.
pub fn capable<P: DdcPort>(ddc: &mut Ddc<P>) -> Result<()> {
    let res = ddc
        .read_array::<1>(HDCP1_BCAPS)
        .and_then(|_| ddc.read_array::<BSTATUS_LEN>(HDCP1_BSTATUS));
    match res {
        Ok(_) => Ok(()),
        Err(Error::Plugout) => Err(Error::Plugout),
        Err(e) => {
            debug!("hdcp1 capability read failed: {e}");
            Err(Error::Hdcp1NotSupported)
        }
    }
}

pub fn repeater_present<P: DdcPort>(ddc: &mut Ddc<P>) -> Result<bool> {
    let bcaps = ddc.read_array::<1>(HDCP1_BCAPS)?;
    Ok(bcaps[0] & BCAPS_REPEATER != 0)
}

/// One HDCP 1.4 authentication against the attached sink.
pub struct Hdcp1Flow<'a, P, B> {
    pub ddc: &'a mut Ddc<P>,
    pub backend: &'a mut B,
    pub session: &'a mut HdcpSession,
    pub revoked: &'a RevocationList,
    pub timings: &'a Timings,
}

impl<P: DdcPort, B: Hdcp1Backend> Hdcp1Flow<'_, P, B> {
    /// Run the full handshake and turn on encryption.
    pub fn authenticate(&mut self) -> Result<()> {
        self.session.reset_ake();
        let an = self.backend.generate_an()?;
        let aksv = self.read_valid_aksv()?;

        self.ddc.write(HDCP1_AN, &an)?;
        self.ddc.write(HDCP1_AKSV, &aksv)?;
        let r0_start = Instant::now();

        let bksv = self.read_valid_bksv()?;
        if self.revoked.contains(&bksv) {
            info!("Bksv {} is revoked", hex::encode(bksv));
            return Err(Error::RevokedBksv);
        }

        let repeater = repeater_present(self.ddc)?;
        self.session.is_repeater = repeater;
        self.backend.set_repeater_bit(repeater)?;
        self.backend.write_bksv(&bksv)?;

        // R0' is only valid once r0_wait has passed since Aksv went out.
        let remaining = self.timings.r0_wait.saturating_sub(r0_start.elapsed());
        self.ddc.hold(remaining, self.timings.hpd_poll)?;

        let ri_prime = self.ddc.read_array::<RI_LEN>(HDCP1_RI_PRIME)?;
        self.backend.check_ri(&ri_prime)?;

        if repeater {
            self.authenticate_downstream()?;
        }

        if !self.backend.set_wider_window()? {
            debug!("wider window not applied");
        }
        self.backend.set_encryption(true)?;
        debug!("HDCP1.4 encryption on, repeater={repeater}");
        Ok(())
    }

    fn read_valid_aksv(&mut self) -> Result<[u8; KSV_LEN]> {
        for _ in 0..2 {
            let aksv = self.backend.read_aksv()?;
            if is_valid_ksv(&aksv) {
                return Ok(aksv);
            }
            debug!("invalid Aksv {}", hex::encode(aksv));
        }
        Err(Error::InvalidAksv)
    }

    fn read_valid_bksv(&mut self) -> Result<[u8; KSV_LEN]> {
        for _ in 0..BKSV_TRIES {
            let bksv = self.ddc.read_array::<KSV_LEN>(HDCP1_BKSV)?;
            debug!("Bksv {}", hex::encode(bksv));
            if is_valid_ksv(&bksv) {
                return Ok(bksv);
            }
        }
        Err(Error::InvalidBksv)
    }

    fn poll_ksv_fifo(&mut self) -> Result<()> {
        let res = wait_for(
            self.ddc,
            self.timings.ksv_fifo,
            Duration::from_millis(1),
            Duration::from_millis(100),
            |ddc| ddc.read_array::<1>(HDCP1_BCAPS),
            |ddc| !ddc.hpd(),
            |bcaps| matches!(bcaps, Ok(b) if b[0] & BCAPS_KSV_FIFO_READY != 0),
        );
        match res {
            Ok(_) => Ok(()),
            Err(Error::Plugout) => Err(Error::Plugout),
            Err(_) => Err(Error::KsvListTimeout),
        }
    }

    /// Second part of authentication against a repeater: validate the
    /// downstream KSV list and its V'.
    fn authenticate_downstream(&mut self) -> Result<()> {
        debug!("wait KSV list ready");
        self.poll_ksv_fifo()?;

        let bstatus = self.ddc.read_array::<BSTATUS_LEN>(HDCP1_BSTATUS)?;
        if bstatus[0] & BSTATUS_MAX_DEVS_EXCEEDED != 0 {
            debug!("max device count exceeded, bstatus={}", hex::encode(bstatus));
            return Err(Error::Hdcp1MaxDevice);
        }
        if bstatus[1] & BSTATUS_MAX_CASCADE_EXCEEDED != 0 {
            debug!("max cascade exceeded, bstatus={}", hex::encode(bstatus));
            return Err(Error::Hdcp1MaxCascade);
        }

        let devices = usize::from(bstatus[0] & BSTATUS_DEVICE_COUNT);
        let ksv_bytes = devices * KSV_LEN;
        let mut ksv_fifo = [0u8; SHA_DATA_LEN];
        if devices > 0 {
            self.ddc.read(HDCP1_KSV_FIFO, &mut ksv_fifo[..ksv_bytes])?;
            if self.revoked.contains_any(&ksv_fifo[..ksv_bytes]) {
                info!("revoked KSV in downstream list");
                return Err(Error::RevokedKsvList);
            }
        }

        let byte_cnt = self.backend.sha_append(&mut ksv_fifo, ksv_bytes, &bstatus)?;

        let mut v_prime = [0u8; V_PRIME_LEN];
        for (i, part) in v_prime.chunks_exact_mut(V_PRIME_PART_LEN).enumerate() {
            self.ddc.read(HDCP1_V_PRIME + (i * V_PRIME_PART_LEN) as u8, part)?;
        }

        self.backend.compute_v(&mut ksv_fifo, byte_cnt)?;
        self.backend.verify_v(&v_prime)?;
        debug!("{devices} downstream devices verified");
        Ok(())
    }

    /// Ri' against Ri, retried once.
    pub fn check_link(&mut self) -> Result<()> {
        let mut last = Error::IncorrectRi;
        for _ in 0..RI_RETRY_CNT {
            let ri_prime = self.ddc.read_array::<RI_LEN>(HDCP1_RI_PRIME)?;
            match self.backend.check_ri(&ri_prime) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("hdcp1 retry check Ri: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Turn encryption off. Failures are logged only.
    pub fn disable(&mut self) {
        debug!("HDCP1.4 is being disabled");
        match self.backend.set_encryption(false) {
            Ok(()) => debug!("HDCP1.4 is disabled"),
            Err(e) => debug!("disable HDCP1.4 failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{capable, Hdcp1Flow};
    use crate::ddc::Ddc;
    use crate::engine::Timings;
    use crate::error::Error;
    use crate::session::HdcpSession;
    use crate::sim::{SimHdcp1, SimSink, SimState};
    use crate::utils::RevocationList;

    fn run_with(
        state: &SimState,
        revoked: &RevocationList,
        session: &mut HdcpSession,
    ) -> Result<(), Error> {
        let mut ddc = Ddc::new(SimSink::new(state.clone()));
        let mut backend = SimHdcp1::new(state.clone());
        let timings = Timings::fast();
        let mut flow = Hdcp1Flow {
            ddc: &mut ddc,
            backend: &mut backend,
            session,
            revoked,
            timings: &timings,
        };
        flow.authenticate()
    }

    fn run(state: &SimState, revoked: &RevocationList) -> Result<(), Error> {
        run_with(state, revoked, &mut HdcpSession::default())
    }

    #[test]
    fn plain_sink_authenticates() {
        let state = SimState::hdcp1_sink();
        run(&state, &RevocationList::new()).expect("auth");
        assert!(state.lock().hdcp1_encryption);
        assert!(!state.lock().backend_calls.contains(&"sha_append"));
    }

    #[test]
    fn revoked_bksv_stops_before_ri() {
        let state = SimState::hdcp1_sink();
        let revoked: RevocationList = [state.lock().bksv].into_iter().collect();
        assert_eq!(run(&state, &revoked), Err(Error::RevokedBksv));
        let calls = state.lock().backend_calls.clone();
        assert!(!calls.contains(&"write_bksv"));
        assert!(!calls.contains(&"check_ri"));
    }

    #[test]
    fn invalid_bksv_is_read_twice() {
        let state = SimState::hdcp1_sink();
        state.lock().bksv = [0xff; 5];
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::InvalidBksv));
        assert_eq!(state.lock().reads_at(0x00), 2);
    }

    #[test]
    fn invalid_aksv_is_reread_once() {
        let state = SimState::hdcp1_sink();
        state.lock().aksv = [0; 5];
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::InvalidAksv));
        let reads = state
            .lock()
            .backend_calls
            .iter()
            .filter(|c| **c == "read_aksv")
            .count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn repeater_downstream_is_verified() {
        let state = SimState::hdcp1_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.downstream = vec![[0x0f, 0xff, 0x0f, 0x00, 0xf0], [0xf0, 0x0f, 0xff, 0x00, 0x0f]];
        }
        let mut session = HdcpSession::default();
        run_with(&state, &RevocationList::new(), &mut session).expect("auth");
        assert!(session.is_repeater);
        let calls = state.lock().backend_calls.clone();
        assert!(calls.contains(&"sha_append"));
        assert!(calls.contains(&"verify_v"));
    }

    #[test]
    fn revoked_downstream_ksv() {
        let state = SimState::hdcp1_sink();
        let bad = [0x0f, 0xff, 0x0f, 0x00, 0xf0];
        {
            let mut s = state.lock();
            s.repeater = true;
            s.downstream = vec![bad];
        }
        let revoked: RevocationList = [bad].into_iter().collect();
        assert_eq!(run(&state, &revoked), Err(Error::RevokedKsvList));
    }

    #[test]
    fn bstatus_limits() {
        let state = SimState::hdcp1_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.max_devs_exceeded = true;
        }
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::Hdcp1MaxDevice));

        let state = SimState::hdcp1_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.max_cascade_exceeded = true;
        }
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::Hdcp1MaxCascade));
    }

    #[test]
    fn ksv_fifo_never_ready() {
        let state = SimState::hdcp1_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.ksv_fifo_ready = false;
        }
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::KsvListTimeout));
    }

    #[test]
    fn ri_mismatch_keeps_encryption_off() {
        let state = SimState::hdcp1_sink();
        state.lock().ri_prime = [0xde, 0xad];
        assert_eq!(run(&state, &RevocationList::new()), Err(Error::IncorrectRi));
        assert!(!state.lock().hdcp1_encryption);
    }

    #[test]
    fn link_check_retries_ri_once() {
        let state = SimState::hdcp1_sink();
        let mut ddc = Ddc::new(SimSink::new(state.clone()));
        let mut backend = SimHdcp1::new(state.clone());
        let timings = Timings::fast();
        let revoked = RevocationList::new();
        let mut session = HdcpSession::default();
        let mut flow = Hdcp1Flow {
            ddc: &mut ddc,
            backend: &mut backend,
            session: &mut session,
            revoked: &revoked,
            timings: &timings,
        };
        flow.check_link().expect("link ok");

        state.lock().ri_prime = [0, 1];
        assert_eq!(flow.check_link(), Err(Error::IncorrectRi));
        assert_eq!(state.lock().reads_at(0x08), 3);
    }

    #[test]
    fn capable_needs_bcaps_and_bstatus() {
        let state = SimState::hdcp1_sink();
        let mut ddc = Ddc::new(SimSink::new(state.clone()));
        capable(&mut ddc).expect("capable");
        state.lock().hdcp1 = false;
        assert_eq!(capable(&mut ddc), Err(Error::Hdcp1NotSupported));
        state.lock().hpd = false;
        assert_eq!(capable(&mut ddc), Err(Error::Plugout));
    }
}
