//! HDCP 2.2 authentication: AKE, locality check, session key exchange and
//! the repeater sub-flows, plus the periodic RxStatus check.

use std::thread;
use std::time::Instant;

use crate::ddc::{Ddc, DdcPort, HDCP2_VERSION, HDCP2_VERSION_CAPABLE};
use crate::engine::Timings;
use crate::error::{Error, Result};
use crate::hdcp2_msg::{
    read_msg, read_rx_status, write_msg, AkeSendCert, AkeSendHPrime, AkeSendPairingInfo,
    LcSendLPrime, RepSendAck, RepSendReceiverIdList, RepStreamManage, RepStreamReady,
    AKE_SEND_CERT, AKE_SEND_CERT_LEN, AKE_SEND_HPRIME, AKE_SEND_HPRIME_LEN,
    AKE_SEND_PAIRING_INFO, AKE_SEND_PAIRING_INFO_LEN, LC_SEND_LPRIME, LC_SEND_LPRIME_LEN,
    REP_SEND_RECVID_LIST, REP_SEND_RECVID_LIST_MAX_LEN, REP_STREAM_READY, REP_STREAM_READY_LEN,
    RXCAPS_VERSION_HDCP2, SEQ_NUM_MAX,
};
use crate::hdcp2_tee::Hdcp2Backend;
use crate::session::{HdcpSession, Mcap};
use crate::utils::RevocationList;

/// Whole-sequence attempts before HDCP 2.2 gives up.
pub const AUTH_RETRY_CNT: usize = 3;
/// LC_Init rounds before the locality check gives up.
pub const LC_RETRY_CNT: usize = 1024;

const CONTENT_TYPE_0: u8 = 0;
const CONTENT_TYPE_1: u8 = 1;

/// Whether the sink advertises HDCP 2.2 in its version register.
pub fn capable<P: DdcPort>(ddc: &mut Ddc<P>) -> Result<bool> {
    let version = ddc.read_array::<1>(HDCP2_VERSION)?;
    Ok(version[0] & HDCP2_VERSION_CAPABLE != 0)
}

/// Read RxStatus and report a pending re-auth or topology change.
pub fn check_link<P: DdcPort>(ddc: &mut Ddc<P>) -> Result<()> {
    let status = read_rx_status(ddc)?;
    // Re-auth request and link integrity failure share one bit.
    if status.reauth_req {
        return Err(Error::ReauthRequest);
    }
    if status.ready {
        return Err(Error::TopologyChange);
    }
    Ok(())
}

/// One HDCP 2.2 authentication against the attached sink.
pub struct Hdcp2Flow<'a, P, B> {
    pub ddc: &'a mut Ddc<P>,
    pub backend: &'a mut B,
    pub session: &'a mut HdcpSession,
    pub revoked: &'a RevocationList,
    pub timings: &'a Timings,
}

impl<P: DdcPort, B: Hdcp2Backend> Hdcp2Flow<'_, P, B> {
    fn ake(&mut self) -> Result<()> {
        self.session.reset_ake();

        let init = self.backend.ake_init()?;
        self.session.secrets.r_tx = init.r_tx;
        self.session.secrets.tx_caps = init.tx_caps;
        write_msg(self.ddc, &init.encode())?;

        // Some sinks answer the first status poll with a stale message id.
        thread::sleep(self.timings.ake_init_delay);

        let mut buf = vec![0u8; AKE_SEND_CERT_LEN];
        let n = read_msg(self.ddc, AKE_SEND_CERT, self.session.is_paired, &mut buf)?;
        let cert = AkeSendCert::decode(&buf[..n])?;
        if cert.rx_caps[0] != RXCAPS_VERSION_HDCP2 {
            debug!("cert.rx_caps don't claim HDCP2.2");
            return Err(Error::Hdcp2NotSupported);
        }
        self.session.secrets.r_rx = cert.r_rx;
        self.session.secrets.rx_caps = cert.rx_caps;
        self.session.is_repeater = cert.is_repeater();

        let receiver_id = cert.receiver_id();
        if self.revoked.contains(&receiver_id) {
            info!("receiver id {} is revoked", hex::encode(receiver_id));
            return Err(Error::RevokedReceiverId);
        }
        self.backend.verify_rx_cert(&cert)?;

        if self.backend.check_stored_km(&receiver_id)? {
            debug!("stored km found but unsupported, sending no_stored_km");
        }
        let km = self.backend.prepare_no_stored_km()?;
        write_msg(self.ddc, &km.encode())?;

        let mut buf = [0u8; AKE_SEND_HPRIME_LEN];
        let n = read_msg(self.ddc, AKE_SEND_HPRIME, self.session.is_paired, &mut buf)?;
        let h_prime = AkeSendHPrime::decode(&buf[..n])?;
        self.backend
            .verify_hprime(&h_prime, &self.session.secrets.verified_src())?;

        if !self.session.is_paired {
            let mut buf = [0u8; AKE_SEND_PAIRING_INFO_LEN];
            let n = read_msg(self.ddc, AKE_SEND_PAIRING_INFO, false, &mut buf)?;
            let pairing = AkeSendPairingInfo::decode(&buf[..n])?;
            self.backend.store_pairing_info(&pairing)?;
            self.session.is_paired = true;
        }
        Ok(())
    }

    fn locality_check(&mut self) -> Result<()> {
        let mut last = Error::ReadLPrime;
        for round in 0..LC_RETRY_CNT {
            let init = self.backend.lc_init()?;
            write_msg(self.ddc, &init.encode())?;

            let mut buf = [0u8; LC_SEND_LPRIME_LEN];
            let n = match read_msg(self.ddc, LC_SEND_LPRIME, self.session.is_paired, &mut buf) {
                Ok(n) => n,
                Err(Error::Plugout) => return Err(Error::Plugout),
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            match LcSendLPrime::decode(&buf[..n]).and_then(|m| self.backend.verify_lprime(&m)) {
                Ok(()) => {
                    trace!("locality check passed after {} rounds", round + 1);
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    fn session_key_exchange(&mut self) -> Result<()> {
        let eks = self.backend.session_key()?;
        write_msg(self.ddc, &eks.encode())
    }

    /// Read and verify the repeater's receiver id list, then acknowledge it.
    pub fn repeater_topology(&mut self) -> Result<()> {
        let mut buf = vec![0u8; REP_SEND_RECVID_LIST_MAX_LEN];
        let n = read_msg(self.ddc, REP_SEND_RECVID_LIST, self.session.is_paired, &mut buf)?;
        debug!("ReceiverID_List ready, msg_sz={n}");
        let list = RepSendReceiverIdList::decode(&buf[..n])?;

        if list.max_cascade_exceeded() {
            return Err(Error::Hdcp2MaxCascade);
        }
        if list.max_devs_exceeded() {
            return Err(Error::Hdcp2MaxDevice);
        }
        if self.revoked.contains_any(list.receiver_ids()) {
            info!("revoked receiver id(s) in list");
            return Err(Error::RevokedIdList);
        }

        let v = self.backend.verify_receiver_id_list(&list)?;
        self.session.hdcp1_device_downstream = list.hdcp1_device_downstream();
        write_msg(self.ddc, &RepSendAck { v }.encode())
    }

    /// One RepeaterAuth_Stream_Manage round. `seq_num_m` only advances when
    /// the round succeeds.
    pub fn stream_manage(&mut self) -> Result<()> {
        if self.session.seq_num_m > SEQ_NUM_MAX {
            debug!("seq_num_m roll over");
            return Err(Error::SeqNumMRollover);
        }
        let msg = RepStreamManage {
            seq_num_m: self.session.seq_num_m,
            stream_id: 0,
            content_type: if self.session.hdcp1_device_downstream {
                CONTENT_TYPE_0
            } else {
                CONTENT_TYPE_1
            },
        };
        write_msg(self.ddc, &msg.encode())?;

        let mut buf = [0u8; REP_STREAM_READY_LEN];
        let n = read_msg(self.ddc, REP_STREAM_READY, self.session.is_paired, &mut buf)?;
        let ready = RepStreamReady::decode(&buf[..n])?;
        self.backend.verify_mprime(&ready, &msg.m_input())?;

        self.session.seq_num_m += 1;
        Ok(())
    }

    fn authenticate_repeater(&mut self) -> Result<()> {
        self.repeater_topology()?;
        thread::sleep(self.timings.msg_delay);

        let start = Instant::now();
        loop {
            let res = self.stream_manage();
            // Rollover needs a fresh AKE; no retry can clear it.
            if matches!(res, Ok(()) | Err(Error::Plugout | Error::SeqNumMRollover)) {
                return res;
            }
            if start.elapsed() > self.timings.stream_manage {
                return res;
            }
            thread::sleep(self.timings.msg_delay);
        }
    }

    /// Downstream protection level once topology is known.
    #[must_use]
    pub fn downstream_mcap(&self) -> Mcap {
        if self.session.is_repeater && self.session.hdcp1_device_downstream {
            Mcap::V1
        } else {
            Mcap::V2_2
        }
    }

    fn authenticate_sink(&mut self) -> Result<()> {
        self.session.mcap = Mcap::None;

        debug!("AKE Init");
        self.ake()
            .inspect_err(|e| debug!("AKE Init failed: {e}"))?;
        debug!("Locality Check");
        self.locality_check()
            .inspect_err(|e| debug!("Locality Check failed: {e}"))?;
        debug!("SKE Init");
        self.session_key_exchange()
            .inspect_err(|e| debug!("SKE Init failed: {e}"))?;

        if self.session.is_repeater {
            debug!("Auth Repeater");
            self.authenticate_repeater()
                .inspect_err(|e| debug!("Repeater Auth failed: {e}"))?;
        }
        self.session.mcap = self.downstream_mcap();
        Ok(())
    }

    /// Authenticate with up to [`AUTH_RETRY_CNT`] attempts, then enable
    /// the cipher after the mandatory settle time.
    pub fn authenticate_and_encrypt(&mut self) -> Result<()> {
        let mut res = Ok(());
        for attempt in 1..=AUTH_RETRY_CNT {
            res = self.authenticate_sink();
            match res {
                Ok(()) => break,
                Err(Error::Plugout) => return Err(Error::Plugout),
                Err(e) => debug!("HDCP2 Auth {attempt} of {AUTH_RETRY_CNT} failed: {e}"),
            }
        }
        res?;

        let settle = self.timings.hdcp2_settle;
        self.ddc.hold(settle, settle / 20)?;
        self.backend.enable_cipher(self.session.mcap)
    }

    /// Stop the cipher and report the link as unprotected downstream.
    pub fn disable(&mut self) {
        debug!("HDCP2 is being disabled");
        self.backend.disable_cipher();
        // Clearing takes effect at once while disabling waits for the next
        // frame; keep the clear out of the current frame.
        thread::sleep(self.timings.cipher_clear_delay);
        self.backend.clear_cipher_setting();

        self.session.mcap = if self.ddc.hpd() {
            Mcap::None
        } else {
            Mcap::NoDigitalOutput
        };
        self.backend.update_mcap(self.session.mcap);
        debug!("HDCP2 is disabled");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{capable, check_link, Hdcp2Flow};
    use crate::ddc::Ddc;
    use crate::engine::Timings;
    use crate::error::Error;
    use crate::hdcp2_msg::{RxStatus, REP_STREAM_MANAGE, SEQ_NUM_MAX};
    use crate::session::{HdcpSession, Mcap};
    use crate::sim::{SimHdcp2, SimSink, SimState};
    use crate::utils::RevocationList;

    struct Rig {
        state: SimState,
        ddc: Ddc<SimSink>,
        backend: SimHdcp2,
        session: HdcpSession,
        revoked: RevocationList,
        timings: Timings,
    }

    impl Rig {
        fn new(state: SimState) -> Self {
            Self {
                ddc: Ddc::new(SimSink::new(state.clone())),
                backend: SimHdcp2::new(state.clone()),
                state,
                session: HdcpSession::default(),
                revoked: RevocationList::new(),
                timings: Timings::fast(),
            }
        }

        fn flow(&mut self) -> Hdcp2Flow<'_, SimSink, SimHdcp2> {
            Hdcp2Flow {
                ddc: &mut self.ddc,
                backend: &mut self.backend,
                session: &mut self.session,
                revoked: &self.revoked,
                timings: &self.timings,
            }
        }
    }

    #[test]
    fn receiver_authenticates() {
        let mut rig = Rig::new(SimState::hdcp2_sink());
        rig.flow().authenticate_and_encrypt().expect("auth");
        assert!(rig.session.is_paired);
        assert!(!rig.session.is_repeater);
        assert_eq!(rig.session.mcap, Mcap::V2_2);
        assert_eq!(rig.state.lock().cipher_enables, vec![Mcap::V2_2]);
    }

    #[test]
    fn capability_from_version_register() {
        let state = SimState::hdcp2_sink();
        let mut ddc = Ddc::new(SimSink::new(state.clone()));
        assert_eq!(capable(&mut ddc), Ok(true));
        state.lock().hdcp2 = false;
        assert_eq!(capable(&mut ddc), Ok(false));
    }

    #[test]
    fn rx_caps_version_must_be_hdcp2() {
        let state = SimState::hdcp2_sink();
        state.lock().rx_caps_version = 0x01;
        let mut rig = Rig::new(state);
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::Hdcp2NotSupported));
        assert!(rig.state.lock().cipher_enables.is_empty());
    }

    #[test]
    fn revoked_receiver_id() {
        let state = SimState::hdcp2_sink();
        let mut rig = Rig::new(state.clone());
        rig.revoked.insert(state.lock().receiver_id);
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::RevokedReceiverId));
        // three whole attempts, none reaching the signature check
        let s = state.lock();
        assert_eq!(s.count_calls("ake_init"), 3);
        assert_eq!(s.count_calls("verify_rx_cert"), 0);
    }

    #[test]
    fn hprime_failure_is_retried_three_times() {
        let state = SimState::hdcp2_sink();
        state.lock().fail("verify_hprime", Error::HPrimeMismatch);
        let mut rig = Rig::new(state.clone());
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::HPrimeMismatch));
        assert_eq!(state.lock().count_calls("verify_hprime"), 3);
    }

    #[test]
    fn locality_check_retries_until_match() {
        let state = SimState::hdcp2_sink();
        state.lock().fail_times("verify_lprime", Error::LPrimeMismatch, 5);
        let mut rig = Rig::new(state.clone());
        rig.flow().authenticate_and_encrypt().expect("auth");
        assert_eq!(state.lock().count_calls("lc_init"), 6);
    }

    #[test]
    fn repeater_with_hdcp1_downstream() {
        let state = SimState::hdcp2_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.hdcp1_downstream = true;
            s.downstream = vec![[1, 2, 3, 4, 5], [6, 7, 8, 9, 10]];
        }
        let mut rig = Rig::new(state.clone());
        rig.flow().authenticate_and_encrypt().expect("auth");
        assert!(rig.session.hdcp1_device_downstream);
        assert_eq!(rig.session.seq_num_m, 1);
        assert_eq!(rig.session.mcap, Mcap::V1);
        // stream type 0 content for an HDCP 1.4 device downstream
        let manage = state.lock().last_write(16).expect("stream manage sent");
        assert_eq!(manage[7], 0);
        assert_eq!(state.lock().cipher_enables, vec![Mcap::V1]);
    }

    #[test]
    fn revoked_id_in_repeater_list() {
        let state = SimState::hdcp2_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.downstream = vec![[1, 2, 3, 4, 5]];
        }
        let mut rig = Rig::new(state);
        rig.revoked.insert([1, 2, 3, 4, 5]);
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::RevokedIdList));
    }

    #[test]
    fn rxinfo_limits() {
        let state = SimState::hdcp2_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.max_cascade_exceeded = true;
        }
        let mut rig = Rig::new(state);
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::Hdcp2MaxCascade));

        let state = SimState::hdcp2_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.max_devs_exceeded = true;
        }
        let mut rig = Rig::new(state);
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::Hdcp2MaxDevice));
    }

    #[test]
    fn seq_num_m_rollover_is_terminal() {
        let state = SimState::hdcp2_sink();
        state.lock().repeater = true;
        let mut rig = Rig::new(state);
        rig.session.seq_num_m = SEQ_NUM_MAX;
        rig.flow().stream_manage().expect("last valid round");
        assert_eq!(rig.session.seq_num_m, SEQ_NUM_MAX + 1);
        assert_eq!(rig.flow().stream_manage(), Err(Error::SeqNumMRollover));
        assert_eq!(rig.session.seq_num_m, SEQ_NUM_MAX + 1);
    }

    #[test]
    fn rollover_ends_repeater_auth_at_once() {
        let state = SimState::hdcp2_sink();
        {
            let mut s = state.lock();
            s.repeater = true;
            s.downstream = vec![[1, 2, 3, 4, 5]];
            s.signal_topology_change();
        }
        let mut rig = Rig::new(state.clone());
        rig.timings.stream_manage = Duration::from_secs(10);
        rig.session.seq_num_m = SEQ_NUM_MAX + 1;

        let start = Instant::now();
        assert_eq!(rig.flow().authenticate_repeater(), Err(Error::SeqNumMRollover));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(state.lock().last_write(REP_STREAM_MANAGE).is_none());
    }

    #[test]
    fn unplug_during_cert_wait_skips_retries() {
        let state = SimState::hdcp2_sink();
        state.lock().unplug_after_write = Some(2);
        let mut rig = Rig::new(state.clone());
        assert_eq!(rig.flow().authenticate_and_encrypt(), Err(Error::Plugout));
        assert_eq!(state.lock().count_calls("ake_init"), 1);
    }

    #[test]
    fn link_check_reads_rx_status() {
        let state = SimState::hdcp2_sink();
        let mut ddc = Ddc::new(SimSink::new(state.clone()));
        assert_eq!(check_link(&mut ddc), Ok(()));
        state.lock().rx_status_override = Some(RxStatus {
            reauth_req: true,
            ready: true,
            msg_size: 0,
        });
        assert_eq!(check_link(&mut ddc), Err(Error::ReauthRequest));
        state.lock().rx_status_override = Some(RxStatus {
            ready: true,
            ..Default::default()
        });
        assert_eq!(check_link(&mut ddc), Err(Error::TopologyChange));
    }

    #[test]
    fn disable_reports_no_digital_output_when_unplugged() {
        let state = SimState::hdcp2_sink();
        let mut rig = Rig::new(state.clone());
        rig.flow().disable();
        assert_eq!(rig.session.mcap, Mcap::None);
        state.lock().hpd = false;
        rig.flow().disable();
        assert_eq!(rig.session.mcap, Mcap::NoDigitalOutput);
        let s = state.lock();
        assert_eq!(s.cipher_disables, 2);
        assert_eq!(s.mcap_updates, vec![Mcap::None, Mcap::NoDigitalOutput]);
    }
}
