//! Simulated sink and in-memory back-ends.
//!
//! [`SimState`] is one shared model of an attached sink plus the secure
//! side. [`SimSink`] answers DDC transfers from it the way an HDCP 1.4 port
//! and HDCP 2.2 mailbox would, while [`SimHdcp1`] and [`SimHdcp2`] stand in
//! for the trusted applications. Every back-end call is recorded and any of
//! them can be made to fail.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::ddc::{
    DdcPort, HDCP1_AKSV, HDCP1_AN, HDCP1_BCAPS, HDCP1_BKSV, HDCP1_BSTATUS, HDCP1_KSV_FIFO,
    HDCP1_RI_PRIME, HDCP1_V_PRIME, HDCP2_READ_MESSAGE, HDCP2_RX_STATUS, HDCP2_VERSION,
    HDCP2_VERSION_CAPABLE, HDCP2_WRITE_MESSAGE,
};
use crate::engine::{Engine, EngineConfig, HdcpListener, StateEvent};
use crate::error::{Error, Result};
use crate::hdcp1_tee::{Hdcp1Backend, AN_LEN, BSTATUS_LEN, KEY_LEN, RI_LEN, SHA_DATA_LEN, V_PRIME_LEN};
use crate::hdcp2_msg::{
    AkeInit, AkeNoStoredKm, AkeSendCert, AkeSendHPrime, LcInit, LcSendLPrime,
    RepSendReceiverIdList, RepStreamReady, RxStatus, SkeSendEks, AKE_INIT, AKE_NO_STORED_KM,
    AKE_SEND_HPRIME, AKE_SEND_PAIRING_INFO, CERT_RX_LEN, E_DKEY_KS_LEN, E_KH_KM_LEN,
    E_KPUB_KM_LEN, H_PRIME_LEN, LC_INIT, LC_SEND_LPRIME, L_PRIME_LEN, M_PRIME_LEN,
    REP_SEND_RECVID_LIST, REP_STREAM_MANAGE, REP_STREAM_READY, RIV_LEN, RRX_LEN, RTX_LEN,
    RXCAPS_VERSION_HDCP2, SEQ_NUM_LEN, SKE_SEND_EKS, STREAMID_TYPE_LEN, TX_CAPS,
    VERIFIED_SRC_LEN, V_PRIME_HALF_LEN,
};
use crate::hdcp2_tee::Hdcp2Backend;
use crate::session::{ContentProtection, HdcpState, Mcap};
use crate::tee::{OpenedSession, TeeClient, TeeParam, TEE_SUCCESS};
use crate::utils::KSV_LEN;

/// Engine wired to the simulator.
pub type SimEngine = Engine<SimSink, SimHdcp1, SimHdcp2>;

/// Build an engine over fresh handles to `state`.
pub fn engine(state: &SimState, config: EngineConfig) -> SimEngine {
    Engine::new(
        SimSink::new(state.clone()),
        SimHdcp1::new(state.clone()),
        SimHdcp2::new(state.clone()),
        config,
    )
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    error: Error,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// Sink and secure-side model.
#[derive(Debug)]
pub struct SimInner {
    // link
    pub hpd: bool,
    pub output_enabled: bool,
    pub scdc: bool,
    /// SCDC error detection block returned on every CED read.
    pub ced: [u8; 6],
    pub ced_reads: u32,

    // HDCP 1.4 port
    pub hdcp1: bool,
    pub bksv: [u8; KSV_LEN],
    pub ri_prime: [u8; RI_LEN],
    pub v_prime: [u8; V_PRIME_LEN],
    pub repeater: bool,
    pub ksv_fifo_ready: bool,
    pub downstream: Vec<[u8; KSV_LEN]>,
    pub max_devs_exceeded: bool,
    pub max_cascade_exceeded: bool,

    // HDCP 2.2 port
    pub hdcp2: bool,
    pub receiver_id: [u8; KSV_LEN],
    pub rx_caps_version: u8,
    pub hdcp1_downstream: bool,
    pub reauth_req: bool,
    /// Replaces the computed RxStatus when set.
    pub rx_status_override: Option<RxStatus>,
    /// Drop hot-plug on the first RxStatus read after this message id is
    /// written.
    pub unplug_after_write: Option<u8>,
    unplug_armed: bool,
    outbox: VecDeque<Vec<u8>>,
    seq_num_v: u32,

    // secure side
    pub aksv: [u8; KSV_LEN],
    /// Ri the HDCP 1.4 back-end computes.
    pub ri: [u8; RI_LEN],
    /// V the HDCP 1.4 back-end computes.
    pub v: [u8; V_PRIME_LEN],
    pub hdcp1_encryption: bool,
    pub hdcp2_cipher: bool,
    pub cipher_enables: Vec<Mcap>,
    pub cipher_disables: u32,
    pub mcap_updates: Vec<Mcap>,
    /// Sleep inside the named back-end call.
    pub stall: Option<(&'static str, Duration)>,
    pub backend_calls: Vec<&'static str>,
    failures: HashMap<&'static str, Failure>,

    reads: Vec<u8>,
    writes: Vec<Vec<u8>>,
}

impl Default for SimInner {
    fn default() -> Self {
        Self {
            hpd: true,
            output_enabled: true,
            scdc: false,
            ced: [0, 0x80, 0, 0x80, 0, 0x80],
            ced_reads: 0,
            hdcp1: true,
            bksv: [0xa5; KSV_LEN],
            ri_prime: [0x12, 0x34],
            v_prime: [0x5e; V_PRIME_LEN],
            repeater: false,
            ksv_fifo_ready: true,
            downstream: Vec::new(),
            max_devs_exceeded: false,
            max_cascade_exceeded: false,
            hdcp2: false,
            receiver_id: [0x3c, 0xc3, 0x3c, 0xc3, 0x3c],
            rx_caps_version: RXCAPS_VERSION_HDCP2,
            hdcp1_downstream: false,
            reauth_req: false,
            rx_status_override: None,
            unplug_after_write: None,
            unplug_armed: false,
            outbox: VecDeque::new(),
            seq_num_v: 0,
            aksv: [0x5a; KSV_LEN],
            ri: [0x12, 0x34],
            v: [0x5e; V_PRIME_LEN],
            hdcp1_encryption: false,
            hdcp2_cipher: false,
            cipher_enables: Vec::new(),
            cipher_disables: 0,
            mcap_updates: Vec::new(),
            stall: None,
            backend_calls: Vec::new(),
            failures: HashMap::new(),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }
}

impl SimInner {
    /// Make back-end call `op` fail with `error` from now on.
    pub fn fail(&mut self, op: &'static str, error: Error) {
        self.failures.insert(op, Failure { error, remaining: None });
    }

    /// Make back-end call `op` fail `times` times, then succeed.
    pub fn fail_times(&mut self, op: &'static str, error: Error, times: u32) {
        self.failures.insert(
            op,
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    #[must_use]
    pub fn count_calls(&self, op: &str) -> usize {
        self.backend_calls.iter().filter(|c| **c == op).count()
    }

    /// DDC reads issued at `offset`.
    #[must_use]
    pub fn reads_at(&self, offset: u8) -> usize {
        self.reads.iter().filter(|o| **o == offset).count()
    }

    /// Last HDCP 2.2 message with `msg_id` written by the source.
    #[must_use]
    pub fn last_write(&self, msg_id: u8) -> Option<Vec<u8>> {
        self.writes
            .iter()
            .rev()
            .filter(|w| w.first() == Some(&HDCP2_WRITE_MESSAGE))
            .map(|w| w[1..].to_vec())
            .find(|m| m.first() == Some(&msg_id))
    }

    /// Repeater reports a new topology: queue a fresh receiver id list and
    /// raise READY.
    pub fn signal_topology_change(&mut self) {
        let list = self.receiver_id_list();
        self.outbox.push_back(list);
    }

    fn consume(&mut self, op: &'static str) -> Result<Option<Duration>> {
        self.backend_calls.push(op);
        match self.failures.get(op).copied() {
            None => {}
            Some(Failure { error, remaining: None }) => return Err(error),
            Some(Failure { remaining: Some(0), .. }) => {
                self.failures.remove(op);
            }
            Some(Failure { error, remaining: Some(n) }) => {
                self.failures.insert(op, Failure { error, remaining: Some(n - 1) });
                return Err(error);
            }
        }
        Ok(self.stall.filter(|(name, _)| *name == op).map(|(_, d)| d))
    }

    fn bcaps(&self) -> u8 {
        let mut bcaps = 0x80;
        if self.repeater {
            bcaps |= 0x40;
            if self.ksv_fifo_ready {
                bcaps |= 0x20;
            }
        }
        bcaps
    }

    fn bstatus(&self) -> [u8; BSTATUS_LEN] {
        let mut b = [self.downstream.len() as u8 & 0x7f, 0x10];
        if self.repeater {
            b[1] |= 0x01;
        }
        if self.max_devs_exceeded {
            b[0] |= 0x80;
        }
        if self.max_cascade_exceeded {
            b[1] |= 0x08;
        }
        b
    }

    fn rx_status(&self) -> RxStatus {
        if let Some(status) = self.rx_status_override {
            return status;
        }
        let front = self.outbox.front();
        RxStatus {
            msg_size: front.map_or(0, Vec::len),
            ready: front.and_then(|m| m.first()) == Some(&REP_SEND_RECVID_LIST),
            reauth_req: self.reauth_req,
        }
    }

    fn send_cert(&self) -> Vec<u8> {
        let mut cert = test_cert(self.receiver_id, self.repeater);
        cert.rx_caps[0] = self.rx_caps_version;
        cert.encode()
    }

    fn receiver_id_list(&mut self) -> Vec<u8> {
        let count = self.downstream.len();
        let mut rx_info = [((count >> 4) & 0x01) as u8 | 0x02, ((count & 0x0f) << 4) as u8];
        if self.max_cascade_exceeded {
            rx_info[1] |= 0x04;
        }
        if self.max_devs_exceeded {
            rx_info[1] |= 0x08;
        }
        if self.hdcp1_downstream {
            rx_info[1] |= 0x01;
        }
        let seq = self.seq_num_v.to_be_bytes();
        self.seq_num_v += 1;

        let mut msg = vec![REP_SEND_RECVID_LIST];
        msg.extend_from_slice(&rx_info);
        msg.extend_from_slice(&seq[1..]);
        msg.extend_from_slice(&[0x77; V_PRIME_HALF_LEN]);
        for id in &self.downstream {
            msg.extend_from_slice(id);
        }
        msg
    }

    /// Sink side of the HDCP 2.2 mailbox.
    fn receive(&mut self, msg: &[u8]) {
        let Some(&id) = msg.first() else {
            return;
        };
        if self.unplug_after_write == Some(id) {
            self.unplug_armed = true;
        }
        let mut rng = rand::thread_rng();
        match id {
            AKE_INIT => {
                self.outbox.clear();
                let cert = self.send_cert();
                self.outbox.push_back(cert);
            }
            AKE_NO_STORED_KM => {
                let mut h = vec![AKE_SEND_HPRIME; 1 + H_PRIME_LEN];
                rng.fill(&mut h[1..]);
                self.outbox.push_back(h);
                let mut pairing = vec![AKE_SEND_PAIRING_INFO; 1 + E_KH_KM_LEN];
                rng.fill(&mut pairing[1..]);
                self.outbox.push_back(pairing);
            }
            LC_INIT => {
                let mut l = vec![LC_SEND_LPRIME; 1 + L_PRIME_LEN];
                rng.fill(&mut l[1..]);
                self.outbox.push_back(l);
            }
            SKE_SEND_EKS if self.repeater => {
                let list = self.receiver_id_list();
                self.outbox.push_back(list);
            }
            REP_STREAM_MANAGE => {
                let mut m = vec![REP_STREAM_READY; 1 + M_PRIME_LEN];
                rng.fill(&mut m[1..]);
                self.outbox.push_back(m);
            }
            _ => {}
        }
    }

    fn read_port(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()> {
        self.reads.push(offset);
        let hdcp1_reg = offset < HDCP2_VERSION;
        if hdcp1_reg && !self.hdcp1 {
            return Err(io::Error::other("hdcp1 port nak"));
        }
        match offset {
            HDCP1_BKSV => copy_reg(buf, &self.bksv),
            HDCP1_RI_PRIME => copy_reg(buf, &self.ri_prime),
            o if (HDCP1_V_PRIME..HDCP1_V_PRIME + V_PRIME_LEN as u8).contains(&o) => {
                let at = usize::from(o - HDCP1_V_PRIME);
                copy_reg(buf, &self.v_prime[at..])
            }
            HDCP1_BCAPS => copy_reg(buf, &[self.bcaps()]),
            HDCP1_BSTATUS => copy_reg(buf, &self.bstatus()),
            HDCP1_KSV_FIFO => {
                let fifo = self.downstream.concat();
                copy_reg(buf, &fifo)
            }
            HDCP2_VERSION => {
                let v = if self.hdcp2 { HDCP2_VERSION_CAPABLE } else { 0 };
                copy_reg(buf, &[v])
            }
            HDCP2_RX_STATUS if self.hdcp2 => {
                if self.unplug_armed {
                    self.unplug_armed = false;
                    self.hpd = false;
                }
                copy_reg(buf, &self.rx_status().to_bytes())
            }
            HDCP2_READ_MESSAGE if self.hdcp2 => {
                let msg = self
                    .outbox
                    .pop_front()
                    .ok_or_else(|| io::Error::other("no message queued"))?;
                copy_reg(buf, &msg)
            }
            _ => Err(io::Error::other("unmapped register")),
        }
    }

    fn write_port(&mut self, data: &[u8]) -> io::Result<()> {
        self.writes.push(data.to_vec());
        match data.first().copied() {
            Some(HDCP1_AN | HDCP1_AKSV) if self.hdcp1 => Ok(()),
            Some(HDCP2_WRITE_MESSAGE) if self.hdcp2 => {
                self.receive(&data[1..]);
                Ok(())
            }
            _ => Err(io::Error::other("write nak")),
        }
    }
}

fn copy_reg(buf: &mut [u8], reg: &[u8]) -> io::Result<()> {
    let src = reg
        .get(..buf.len())
        .ok_or_else(|| io::Error::other("read past register"))?;
    buf.copy_from_slice(src);
    Ok(())
}

/// Shared handle to one simulated setup.
#[derive(Debug, Clone, Default)]
pub struct SimState(Arc<Mutex<SimInner>>);

impl SimState {
    #[must_use]
    pub fn new(inner: SimInner) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    /// Plain HDCP 1.4 receiver.
    #[must_use]
    pub fn hdcp1_sink() -> Self {
        Self::default()
    }

    /// HDCP 2.2 receiver that also answers on the 1.4 port.
    #[must_use]
    pub fn hdcp2_sink() -> Self {
        Self::new(SimInner {
            hdcp2: true,
            ..Default::default()
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        let stall = self.lock().consume(op)?;
        if let Some(d) = stall {
            trace!("sim stalling {op} for {}ms", d.as_millis());
            thread::sleep(d);
        }
        Ok(())
    }
}

/// [`DdcPort`] answered by a [`SimState`].
#[derive(Debug, Clone)]
pub struct SimSink {
    state: SimState,
}

impl SimSink {
    pub fn new(state: SimState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }
}

impl DdcPort for SimSink {
    fn hpd(&self) -> bool {
        self.state.lock().hpd
    }

    fn i2c_read(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()> {
        self.state.lock().read_port(offset, buf)
    }

    fn i2c_write(&mut self, data: &[u8]) -> io::Result<()> {
        self.state.lock().write_port(data)
    }

    fn scdc_supported(&self) -> bool {
        self.state.lock().scdc
    }

    fn scdc_read(&mut self, _offset: u8, buf: &mut [u8]) -> io::Result<()> {
        let mut s = self.state.lock();
        s.ced_reads += 1;
        let ced = s.ced;
        copy_reg(buf, &ced)
    }

    fn output_enabled(&self) -> bool {
        self.state.lock().output_enabled
    }
}

/// In-memory HDCP 1.4 back-end.
#[derive(Debug, Clone)]
pub struct SimHdcp1 {
    state: SimState,
    initialized: bool,
}

impl SimHdcp1 {
    pub fn new(state: SimState) -> Self {
        Self {
            state,
            initialized: false,
        }
    }
}

impl Hdcp1Backend for SimHdcp1 {
    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.state.enter("hdcp1_init")?;
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn generate_an(&mut self) -> Result<[u8; AN_LEN]> {
        self.state.enter("generate_an")?;
        let mut an = [0u8; AN_LEN];
        rand::thread_rng().fill(&mut an[..]);
        Ok(an)
    }

    fn read_aksv(&mut self) -> Result<[u8; KSV_LEN]> {
        self.state.enter("read_aksv")?;
        Ok(self.state.lock().aksv)
    }

    fn set_repeater_bit(&mut self, _is_repeater: bool) -> Result<()> {
        self.state.enter("set_repeater_bit")
    }

    fn write_bksv(&mut self, _bksv: &[u8; KSV_LEN]) -> Result<()> {
        self.state.enter("write_bksv")
    }

    fn check_ri(&mut self, ri_prime: &[u8; RI_LEN]) -> Result<()> {
        self.state.enter("check_ri")?;
        if *ri_prime != self.state.lock().ri {
            return Err(Error::IncorrectRi);
        }
        Ok(())
    }

    fn set_encryption(&mut self, enable: bool) -> Result<()> {
        self.state.enter("set_encryption")?;
        self.state.lock().hdcp1_encryption = enable;
        Ok(())
    }

    fn sha_append(
        &mut self,
        ksv_fifo: &mut [u8; SHA_DATA_LEN],
        byte_cnt: usize,
        bstatus: &[u8; BSTATUS_LEN],
    ) -> Result<usize> {
        self.state.enter("sha_append")?;
        // Bstatus then an all-zero M0.
        let tail = ksv_fifo
            .get_mut(byte_cnt..byte_cnt + BSTATUS_LEN + 8)
            .ok_or(Error::Tee1ShaAppend)?;
        tail[..BSTATUS_LEN].copy_from_slice(bstatus);
        tail[BSTATUS_LEN..].fill(0);
        Ok(byte_cnt + BSTATUS_LEN + 8)
    }

    fn compute_v(&mut self, _ksv_fifo: &mut [u8; SHA_DATA_LEN], _byte_cnt: usize) -> Result<()> {
        self.state.enter("compute_v")
    }

    fn verify_v(&mut self, v_prime: &[u8; V_PRIME_LEN]) -> Result<()> {
        self.state.enter("verify_v")?;
        if *v_prime != self.state.lock().v {
            return Err(Error::VMismatch);
        }
        Ok(())
    }

    fn set_wider_window(&mut self) -> Result<bool> {
        self.state.enter("set_wider_window")?;
        Ok(true)
    }

    fn write_key(&mut self, _key: &[u8; KEY_LEN]) -> Result<()> {
        self.state.enter("write_key")
    }

    fn fix_480p(&mut self) -> Result<()> {
        self.state.enter("fix_480p")
    }

    fn set_keepout_window(&mut self) -> Result<()> {
        self.state.enter("set_keepout_window")
    }

    fn set_rekey_window(&mut self, _rekey_win: u8) -> Result<()> {
        self.state.enter("set_rekey_window")
    }
}

/// In-memory HDCP 2.2 back-end. Every verification passes unless told
/// otherwise.
#[derive(Debug, Clone)]
pub struct SimHdcp2 {
    state: SimState,
    initialized: bool,
}

impl SimHdcp2 {
    pub fn new(state: SimState) -> Self {
        Self {
            state,
            initialized: false,
        }
    }
}

impl Hdcp2Backend for SimHdcp2 {
    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.state.enter("hdcp2_init")?;
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn read_key(&mut self) -> Result<()> {
        self.state.enter("read_key")
    }

    fn write_key(&mut self, _key: &[u8]) -> Result<()> {
        self.state.enter("write_key")
    }

    fn ake_init(&mut self) -> Result<AkeInit> {
        self.state.enter("ake_init")?;
        let mut r_tx = [0u8; RTX_LEN];
        rand::thread_rng().fill(&mut r_tx[..]);
        Ok(AkeInit {
            r_tx,
            tx_caps: TX_CAPS,
        })
    }

    fn verify_rx_cert(&mut self, _cert: &AkeSendCert) -> Result<()> {
        self.state.enter("verify_rx_cert")
    }

    fn prepare_no_stored_km(&mut self) -> Result<AkeNoStoredKm> {
        self.state.enter("prepare_no_stored_km")?;
        Ok(AkeNoStoredKm {
            e_kpub_km: [0x4e; E_KPUB_KM_LEN],
        })
    }

    fn verify_hprime(
        &mut self,
        _msg: &AkeSendHPrime,
        _verified_src: &[u8; VERIFIED_SRC_LEN],
    ) -> Result<()> {
        self.state.enter("verify_hprime")
    }

    fn lc_init(&mut self) -> Result<LcInit> {
        self.state.enter("lc_init")?;
        let mut r_n = [0u8; 8];
        rand::thread_rng().fill(&mut r_n[..]);
        Ok(LcInit { r_n })
    }

    fn verify_lprime(&mut self, _msg: &LcSendLPrime) -> Result<()> {
        self.state.enter("verify_lprime")
    }

    fn session_key(&mut self) -> Result<SkeSendEks> {
        self.state.enter("session_key")?;
        Ok(SkeSendEks {
            e_dkey_ks: [0x2d; E_DKEY_KS_LEN],
            riv: [0x19; RIV_LEN],
        })
    }

    fn verify_receiver_id_list(
        &mut self,
        _msg: &RepSendReceiverIdList,
    ) -> Result<[u8; V_PRIME_HALF_LEN]> {
        self.state.enter("verify_receiver_id_list")?;
        Ok([0x56; V_PRIME_HALF_LEN])
    }

    fn verify_mprime(
        &mut self,
        _msg: &RepStreamReady,
        _input: &[u8; STREAMID_TYPE_LEN + SEQ_NUM_LEN],
    ) -> Result<()> {
        self.state.enter("verify_mprime")
    }

    fn enable_cipher(&mut self, mcap: Mcap) -> Result<()> {
        self.state.enter("enable_cipher")?;
        let mut s = self.state.lock();
        s.hdcp2_cipher = true;
        s.cipher_enables.push(mcap);
        Ok(())
    }

    fn disable_cipher(&mut self) {
        let mut s = self.state.lock();
        s.backend_calls.push("disable_cipher");
        s.hdcp2_cipher = false;
        s.cipher_disables += 1;
    }

    fn clear_cipher_setting(&mut self) {
        self.state.lock().backend_calls.push("clear_cipher_setting");
    }

    fn update_mcap(&mut self, mcap: Mcap) {
        let mut s = self.state.lock();
        s.backend_calls.push("update_mcap");
        s.mcap_updates.push(mcap);
    }
}

/// AKE_Send_Cert for `receiver_id` with filler key and signature.
#[must_use]
pub fn test_cert(receiver_id: [u8; KSV_LEN], repeater: bool) -> AkeSendCert {
    let mut cert_rx = Box::new([0xc5u8; CERT_RX_LEN]);
    cert_rx[..KSV_LEN].copy_from_slice(&receiver_id);
    AkeSendCert {
        cert_rx,
        r_rx: [0x3b; RRX_LEN],
        rx_caps: [RXCAPS_VERSION_HDCP2, 0x00, u8::from(repeater)],
    }
}

type Handler = Box<dyn FnMut(u32, &mut [TeeParam; 4]) -> u32 + Send>;

/// [`TeeClient`] whose invokes are answered by a closure.
pub struct ScriptedTee {
    handler: Handler,
    calls: Vec<u32>,
    open: bool,
}

impl ScriptedTee {
    pub fn new(handler: impl FnMut(u32, &mut [TeeParam; 4]) -> u32 + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Vec::new(),
            open: false,
        }
    }

    /// Command ids invoked so far.
    pub fn calls(&self) -> &[u32] {
        &self.calls
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl TeeClient for ScriptedTee {
    fn open_context(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn open_session(&mut self, _uuid: &Uuid) -> io::Result<OpenedSession> {
        self.open = true;
        Ok(OpenedSession {
            session: 1,
            ret: TEE_SUCCESS,
        })
    }

    fn invoke(&mut self, _session: u32, func: u32, params: &mut [TeeParam; 4]) -> io::Result<u32> {
        self.calls.push(func);
        Ok((self.handler)(func, params))
    }

    fn close_session(&mut self, _session: u32) {
        self.open = false;
    }

    fn close_context(&mut self) {}
}

#[derive(Debug, Default)]
struct Recorded {
    events: Vec<StateEvent>,
    content_protection: Vec<ContentProtection>,
}

/// Listener that keeps everything it is told. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener(Arc<Mutex<Recorded>>);

impl RecordingListener {
    fn record(&self) -> MutexGuard<'_, Recorded> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.record().events.clone()
    }

    pub fn states(&self) -> Vec<HdcpState> {
        self.record().events.iter().map(|e| e.state).collect()
    }

    pub fn content_protection(&self) -> Vec<ContentProtection> {
        self.record().content_protection.clone()
    }

    pub fn clear(&self) {
        let mut r = self.record();
        r.events.clear();
        r.content_protection.clear();
    }
}

impl HdcpListener for RecordingListener {
    fn state_changed(&mut self, event: &StateEvent) {
        self.record().events.push(*event);
    }

    fn content_protection_changed(&mut self, value: ContentProtection) {
        self.record().content_protection.push(value);
    }
}
