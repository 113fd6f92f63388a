//! HDCP 2.2 message layouts and the DDC mailbox.
//!
//! Outgoing messages are built with `encode`, incoming ones are parsed with
//! `decode`, which rejects a wrong leading message id with the kind the
//! corresponding verification step reports.

use std::time::Duration;

use crate::ddc::{Ddc, DdcPort, HDCP2_READ_MESSAGE, HDCP2_RX_STATUS, HDCP2_WRITE_MESSAGE};
use crate::error::{Error, Result};
use crate::utils::{wait_for, KSV_LEN};

// Message ids.
pub const AKE_INIT: u8 = 2;
pub const AKE_SEND_CERT: u8 = 3;
pub const AKE_NO_STORED_KM: u8 = 4;
pub const AKE_STORED_KM: u8 = 5;
pub const AKE_SEND_HPRIME: u8 = 7;
pub const AKE_SEND_PAIRING_INFO: u8 = 8;
pub const LC_INIT: u8 = 9;
pub const LC_SEND_LPRIME: u8 = 10;
pub const SKE_SEND_EKS: u8 = 11;
pub const REP_SEND_RECVID_LIST: u8 = 12;
pub const REP_SEND_ACK: u8 = 15;
pub const REP_STREAM_MANAGE: u8 = 16;
pub const REP_STREAM_READY: u8 = 17;

// Field sizes.
pub const RTX_LEN: usize = 8;
pub const RRX_LEN: usize = 8;
pub const TXCAPS_LEN: usize = 3;
pub const RXCAPS_LEN: usize = 3;
pub const K_PUB_RX_LEN: usize = 131;
pub const DCP_LLC_SIG_LEN: usize = 384;
pub const CERT_RX_LEN: usize = KSV_LEN + K_PUB_RX_LEN + 2 + DCP_LLC_SIG_LEN;
pub const E_KPUB_KM_LEN: usize = 128;
pub const E_KH_KM_LEN: usize = 16;
pub const H_PRIME_LEN: usize = 32;
pub const RN_LEN: usize = 8;
pub const L_PRIME_LEN: usize = 32;
pub const E_DKEY_KS_LEN: usize = 16;
pub const RIV_LEN: usize = 8;
pub const RXINFO_LEN: usize = 2;
pub const SEQ_NUM_LEN: usize = 3;
pub const V_PRIME_HALF_LEN: usize = 16;
pub const MAX_DEVICE_COUNT: usize = 31;
pub const M_PRIME_LEN: usize = 32;
pub const STREAMID_TYPE_LEN: usize = 2;
/// `r_rx || r_tx || rx_caps || tx_caps`, the H' input.
pub const VERIFIED_SRC_LEN: usize = RRX_LEN + RTX_LEN + RXCAPS_LEN + TXCAPS_LEN;

pub const AKE_INIT_LEN: usize = 1 + RTX_LEN + TXCAPS_LEN;
pub const AKE_SEND_CERT_LEN: usize = 1 + CERT_RX_LEN + RRX_LEN + RXCAPS_LEN;
pub const AKE_NO_STORED_KM_LEN: usize = 1 + E_KPUB_KM_LEN;
pub const AKE_SEND_HPRIME_LEN: usize = 1 + H_PRIME_LEN;
pub const AKE_SEND_PAIRING_INFO_LEN: usize = 1 + E_KH_KM_LEN;
pub const LC_INIT_LEN: usize = 1 + RN_LEN;
pub const LC_SEND_LPRIME_LEN: usize = 1 + L_PRIME_LEN;
pub const SKE_SEND_EKS_LEN: usize = 1 + E_DKEY_KS_LEN + RIV_LEN;
pub const REP_RECVID_LIST_HEADER_LEN: usize = 1 + RXINFO_LEN + SEQ_NUM_LEN + V_PRIME_HALF_LEN;
pub const REP_SEND_RECVID_LIST_MAX_LEN: usize =
    REP_RECVID_LIST_HEADER_LEN + MAX_DEVICE_COUNT * KSV_LEN;
pub const REP_SEND_ACK_LEN: usize = 1 + V_PRIME_HALF_LEN;
pub const REP_STREAM_MANAGE_LEN: usize = 1 + SEQ_NUM_LEN + 2 + STREAMID_TYPE_LEN;
pub const REP_STREAM_READY_LEN: usize = 1 + M_PRIME_LEN;

/// Largest `seq_num_M` that may still be sent.
pub const SEQ_NUM_MAX: u32 = 0x00ff_ffff;

/// HDCP 2.2 receiver version byte in `rx_caps[0]`.
pub const RXCAPS_VERSION_HDCP2: u8 = 0x02;
/// Transmitter capability bytes sent in AKE_Init.
pub const TX_CAPS: [u8; TXCAPS_LEN] = [0x02, 0x00, 0x00];

// RxInfo bits (second byte).
const RXINFO_MAX_CASCADE_EXCEEDED: u8 = 0x04;
const RXINFO_MAX_DEVS_EXCEEDED: u8 = 0x08;
const RXINFO_HDCP1_DEVICE_DOWNSTREAM: u8 = 0x01;

/// How long the sink may take to produce `msg_id`.
///
/// Messages the sink never sends unprompted resolve to zero, which makes
/// the mailbox wait a single poll.
pub fn message_timeout(msg_id: u8, paired: bool) -> Result<Duration> {
    let ms = match msg_id {
        AKE_SEND_CERT => 100 + 200,
        AKE_SEND_HPRIME if paired => 200,
        AKE_SEND_HPRIME => 1000,
        AKE_SEND_PAIRING_INFO => 200,
        LC_SEND_LPRIME => 20,
        REP_SEND_RECVID_LIST => 3000 + 500,
        REP_STREAM_READY => 100,
        AKE_INIT | AKE_NO_STORED_KM | AKE_STORED_KM | LC_INIT | SKE_SEND_EKS | REP_SEND_ACK
        | REP_STREAM_MANAGE => 0,
        _ => return Err(Error::NoMessageTimeout),
    };
    Ok(Duration::from_millis(ms))
}

fn wait_error(msg_id: u8) -> Error {
    match msg_id {
        AKE_SEND_CERT => Error::ReadAkeSendCert,
        AKE_SEND_HPRIME => Error::ReadHPrime,
        AKE_SEND_PAIRING_INFO => Error::ReadPairingInfo,
        LC_SEND_LPRIME => Error::ReadLPrime,
        REP_SEND_RECVID_LIST => Error::ReadReceiverIdList,
        REP_STREAM_READY => Error::ReadStreamReady,
        _ => Error::WaitMessageTimeout,
    }
}

/// Decoded RxStatus register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxStatus {
    pub msg_size: usize,
    pub ready: bool,
    pub reauth_req: bool,
}

impl RxStatus {
    #[must_use]
    pub fn parse(raw: [u8; 2]) -> Self {
        Self {
            msg_size: (usize::from(raw[1] & 0x03) << 8) | usize::from(raw[0]),
            ready: raw[1] & 0x04 != 0,
            reauth_req: raw[1] & 0x08 != 0,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 2] {
        let mut hi = ((self.msg_size >> 8) & 0x03) as u8;
        if self.ready {
            hi |= 0x04;
        }
        if self.reauth_req {
            hi |= 0x08;
        }
        [(self.msg_size & 0xff) as u8, hi]
    }

    /// Whether a message with `msg_id` can be read now.
    #[must_use]
    pub fn has_message(&self, msg_id: u8) -> bool {
        if msg_id == REP_SEND_RECVID_LIST {
            self.ready && self.msg_size != 0
        } else {
            self.msg_size != 0
        }
    }
}

pub fn read_rx_status<P: DdcPort>(ddc: &mut Ddc<P>) -> Result<RxStatus> {
    ddc.read_array::<2>(HDCP2_RX_STATUS).map(RxStatus::parse)
}

pub fn write_msg<P: DdcPort>(ddc: &mut Ddc<P>, msg: &[u8]) -> Result<()> {
    debug!("HDCP2 send id({}) message", msg.first().copied().unwrap_or(0));
    ddc.write(HDCP2_WRITE_MESSAGE, msg)
}

/// Wait until the sink has `msg_id` queued; returns its size.
pub fn wait_for_msg<P: DdcPort>(ddc: &mut Ddc<P>, msg_id: u8, paired: bool) -> Result<usize> {
    let timeout = message_timeout(msg_id, paired)?;
    let res = wait_for(
        ddc,
        timeout,
        Duration::from_millis(1),
        Duration::from_millis(5),
        |ddc| read_rx_status(ddc),
        |ddc| !ddc.hpd(),
        |status| matches!(status, Ok(s) if s.has_message(msg_id)),
    );
    match res {
        Ok(Ok(status)) => Ok(status.msg_size),
        Ok(Err(e)) => Err(e),
        Err(Error::Plugout) => Err(Error::Plugout),
        Err(e) => {
            info!("msg_id: {msg_id}, err: {e}, timeout: {}ms", timeout.as_millis());
            Err(wait_error(msg_id))
        }
    }
}

/// Wait for `msg_id` and read it into `buf`; returns the byte count.
pub fn read_msg<P: DdcPort>(
    ddc: &mut Ddc<P>,
    msg_id: u8,
    paired: bool,
    buf: &mut [u8],
) -> Result<usize> {
    debug!("HDCP2 wait id({msg_id}) message");
    let size = wait_for_msg(ddc, msg_id, paired)?;
    if size > buf.len() {
        debug!("HDCP2 msg_sz({size}) is more than exp size({})", buf.len());
        return Err(Error::MessageSize);
    }
    ddc.read(HDCP2_READ_MESSAGE, &mut buf[..size])?;
    Ok(size)
}

fn expect_id(buf: &[u8], msg_id: u8, err: Error) -> Result<()> {
    if buf.first() != Some(&msg_id) {
        debug!("unexpected msg id {:?}, want {msg_id}", buf.first());
        return Err(err);
    }
    Ok(())
}

fn field<const N: usize>(buf: &[u8], at: usize, err: Error) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(buf.get(at..at + N).ok_or(err)?);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeInit {
    pub r_tx: [u8; RTX_LEN],
    pub tx_caps: [u8; TXCAPS_LEN],
}

impl AkeInit {
    #[must_use]
    pub fn encode(&self) -> [u8; AKE_INIT_LEN] {
        let mut out = [0u8; AKE_INIT_LEN];
        out[0] = AKE_INIT;
        out[1..9].copy_from_slice(&self.r_tx);
        out[9..].copy_from_slice(&self.tx_caps);
        out
    }
}

/// AKE_Send_Cert. `cert_rx` is receiver id, public key, reserved bytes and
/// the DCP LLC signature, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeSendCert {
    pub cert_rx: Box<[u8; CERT_RX_LEN]>,
    pub r_rx: [u8; RRX_LEN],
    pub rx_caps: [u8; RXCAPS_LEN],
}

impl AkeSendCert {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, AKE_SEND_CERT, Error::CertMessageId)?;
        if buf.len() < AKE_SEND_CERT_LEN {
            return Err(Error::MessageSize);
        }
        let mut cert_rx = Box::new([0u8; CERT_RX_LEN]);
        cert_rx.copy_from_slice(&buf[1..1 + CERT_RX_LEN]);
        Ok(Self {
            cert_rx,
            r_rx: field(buf, 1 + CERT_RX_LEN, Error::MessageSize)?,
            rx_caps: field(buf, 1 + CERT_RX_LEN + RRX_LEN, Error::MessageSize)?,
        })
    }

    #[must_use]
    pub fn receiver_id(&self) -> [u8; KSV_LEN] {
        let mut id = [0u8; KSV_LEN];
        id.copy_from_slice(&self.cert_rx[..KSV_LEN]);
        id
    }

    #[must_use]
    pub fn is_repeater(&self) -> bool {
        self.rx_caps[2] & 0x01 != 0
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AKE_SEND_CERT_LEN);
        out.push(AKE_SEND_CERT);
        out.extend_from_slice(&self.cert_rx[..]);
        out.extend_from_slice(&self.r_rx);
        out.extend_from_slice(&self.rx_caps);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeNoStoredKm {
    pub e_kpub_km: [u8; E_KPUB_KM_LEN],
}

impl AkeNoStoredKm {
    #[must_use]
    pub fn encode(&self) -> [u8; AKE_NO_STORED_KM_LEN] {
        let mut out = [0u8; AKE_NO_STORED_KM_LEN];
        out[0] = AKE_NO_STORED_KM;
        out[1..].copy_from_slice(&self.e_kpub_km);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeSendHPrime {
    pub h_prime: [u8; H_PRIME_LEN],
}

impl AkeSendHPrime {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, AKE_SEND_HPRIME, Error::HPrimeMessageId)?;
        Ok(Self {
            h_prime: field(buf, 1, Error::MessageSize)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeSendPairingInfo {
    pub e_kh_km: [u8; E_KH_KM_LEN],
}

impl AkeSendPairingInfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, AKE_SEND_PAIRING_INFO, Error::PairingMessageId)?;
        Ok(Self {
            e_kh_km: field(buf, 1, Error::MessageSize)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcInit {
    pub r_n: [u8; RN_LEN],
}

impl LcInit {
    #[must_use]
    pub fn encode(&self) -> [u8; LC_INIT_LEN] {
        let mut out = [0u8; LC_INIT_LEN];
        out[0] = LC_INIT;
        out[1..].copy_from_slice(&self.r_n);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcSendLPrime {
    pub l_prime: [u8; L_PRIME_LEN],
}

impl LcSendLPrime {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, LC_SEND_LPRIME, Error::LPrimeMessageId)?;
        Ok(Self {
            l_prime: field(buf, 1, Error::MessageSize)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkeSendEks {
    pub e_dkey_ks: [u8; E_DKEY_KS_LEN],
    pub riv: [u8; RIV_LEN],
}

impl SkeSendEks {
    #[must_use]
    pub fn encode(&self) -> [u8; SKE_SEND_EKS_LEN] {
        let mut out = [0u8; SKE_SEND_EKS_LEN];
        out[0] = SKE_SEND_EKS;
        out[1..1 + E_DKEY_KS_LEN].copy_from_slice(&self.e_dkey_ks);
        out[1 + E_DKEY_KS_LEN..].copy_from_slice(&self.riv);
        out
    }
}

/// RepeaterAuth_Send_ReceiverID_List. `raw` keeps the whole message as
/// received since the back-end verifies V' over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepSendReceiverIdList {
    pub rx_info: [u8; RXINFO_LEN],
    pub seq_num_v: [u8; SEQ_NUM_LEN],
    pub v_prime: [u8; V_PRIME_HALF_LEN],
    pub raw: Vec<u8>,
}

impl RepSendReceiverIdList {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, REP_SEND_RECVID_LIST, Error::ReceiverIdListMessageId)?;
        Ok(Self {
            rx_info: field(buf, 1, Error::MessageSize)?,
            seq_num_v: field(buf, 1 + RXINFO_LEN, Error::MessageSize)?,
            v_prime: field(buf, 1 + RXINFO_LEN + SEQ_NUM_LEN, Error::MessageSize)?,
            raw: buf.to_vec(),
        })
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        (usize::from(self.rx_info[0] & 0x01) << 4) | usize::from(self.rx_info[1] >> 4)
    }

    #[must_use]
    pub fn max_cascade_exceeded(&self) -> bool {
        self.rx_info[1] & RXINFO_MAX_CASCADE_EXCEEDED != 0
    }

    #[must_use]
    pub fn max_devs_exceeded(&self) -> bool {
        self.rx_info[1] & RXINFO_MAX_DEVS_EXCEEDED != 0
    }

    #[must_use]
    pub fn hdcp1_device_downstream(&self) -> bool {
        self.rx_info[1] & RXINFO_HDCP1_DEVICE_DOWNSTREAM != 0
    }

    /// Receiver ids packed back to back, `device_count()` of them at most.
    #[must_use]
    pub fn receiver_ids(&self) -> &[u8] {
        let start = REP_RECVID_LIST_HEADER_LEN.min(self.raw.len());
        let end = (start + self.device_count() * KSV_LEN).min(self.raw.len());
        &self.raw[start..end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepSendAck {
    pub v: [u8; V_PRIME_HALF_LEN],
}

impl RepSendAck {
    #[must_use]
    pub fn encode(&self) -> [u8; REP_SEND_ACK_LEN] {
        let mut out = [0u8; REP_SEND_ACK_LEN];
        out[0] = REP_SEND_ACK;
        out[1..].copy_from_slice(&self.v);
        out
    }
}

/// RepeaterAuth_Stream_Manage for a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepStreamManage {
    pub seq_num_m: u32,
    pub stream_id: u8,
    pub content_type: u8,
}

impl RepStreamManage {
    #[must_use]
    pub fn seq_num_bytes(&self) -> [u8; SEQ_NUM_LEN] {
        let be = self.seq_num_m.to_be_bytes();
        [be[1], be[2], be[3]]
    }

    #[must_use]
    pub fn encode(&self) -> [u8; REP_STREAM_MANAGE_LEN] {
        let mut out = [0u8; REP_STREAM_MANAGE_LEN];
        out[0] = REP_STREAM_MANAGE;
        out[1..4].copy_from_slice(&self.seq_num_bytes());
        // k = 1 stream
        out[4..6].copy_from_slice(&1u16.to_be_bytes());
        out[6] = self.stream_id;
        out[7] = self.content_type;
        out
    }

    /// `StreamID_Type || seq_num_M`, the M' input.
    #[must_use]
    pub fn m_input(&self) -> [u8; STREAMID_TYPE_LEN + SEQ_NUM_LEN] {
        let seq = self.seq_num_bytes();
        [self.stream_id, self.content_type, seq[0], seq[1], seq[2]]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepStreamReady {
    pub m_prime: [u8; M_PRIME_LEN],
}

impl RepStreamReady {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        expect_id(buf, REP_STREAM_READY, Error::StreamReadyMessageId)?;
        Ok(Self {
            m_prime: field(buf, 1, Error::MessageSize)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn message_sizes() {
        assert_eq!(AKE_INIT_LEN, 12);
        assert_eq!(CERT_RX_LEN, 522);
        assert_eq!(AKE_SEND_CERT_LEN, 534);
        assert_eq!(AKE_NO_STORED_KM_LEN, 129);
        assert_eq!(SKE_SEND_EKS_LEN, 25);
        assert_eq!(REP_SEND_RECVID_LIST_MAX_LEN, 177);
        assert_eq!(REP_STREAM_MANAGE_LEN, 8);
        assert_eq!(VERIFIED_SRC_LEN, 22);
    }

    #[test]
    fn timeouts() {
        assert_eq!(message_timeout(AKE_SEND_CERT, false), Ok(Duration::from_millis(300)));
        assert_eq!(message_timeout(AKE_SEND_HPRIME, true), Ok(Duration::from_millis(200)));
        assert_eq!(message_timeout(AKE_SEND_HPRIME, false), Ok(Duration::from_millis(1000)));
        assert_eq!(message_timeout(REP_SEND_RECVID_LIST, false), Ok(Duration::from_millis(3500)));
        assert_eq!(message_timeout(SKE_SEND_EKS, false), Ok(Duration::ZERO));
        assert_eq!(message_timeout(99, false), Err(Error::NoMessageTimeout));
    }

    #[test]
    fn rx_status_bits() {
        let s = RxStatus::parse([0x21, 0x05]);
        assert_eq!(s.msg_size, 0x121);
        assert!(s.ready);
        assert!(!s.reauth_req);
        assert!(s.has_message(REP_SEND_RECVID_LIST));

        let s = RxStatus::parse([0x10, 0x08]);
        assert!(s.reauth_req);
        assert!(s.has_message(AKE_SEND_HPRIME));
        assert!(!s.has_message(REP_SEND_RECVID_LIST));
        assert_eq!(RxStatus::parse(s.to_bytes()), s);
    }

    #[test]
    fn wrong_id_is_step_specific() {
        let buf = [AKE_SEND_CERT; 40];
        assert_eq!(AkeSendHPrime::decode(&buf), Err(Error::HPrimeMessageId));
        assert_eq!(LcSendLPrime::decode(&buf), Err(Error::LPrimeMessageId));
        assert_eq!(AkeSendPairingInfo::decode(&buf), Err(Error::PairingMessageId));
        assert_eq!(RepStreamReady::decode(&buf), Err(Error::StreamReadyMessageId));
        assert_eq!(
            RepSendReceiverIdList::decode(&buf).map(|_| ()),
            Err(Error::ReceiverIdListMessageId)
        );
        let buf = [AKE_SEND_HPRIME; AKE_SEND_CERT_LEN];
        assert_eq!(AkeSendCert::decode(&buf).map(|_| ()), Err(Error::CertMessageId));
    }

    #[test]
    fn receiver_id_list_fields() {
        let mut raw = vec![REP_SEND_RECVID_LIST, 0x01, 0x21];
        raw.extend_from_slice(&[0, 0, 1]);
        raw.extend_from_slice(&[0xaa; V_PRIME_HALF_LEN]);
        for i in 0..17u8 {
            raw.extend_from_slice(&[i; 5]);
        }
        let list = RepSendReceiverIdList::decode(&raw).expect("decode");
        assert_eq!(list.device_count(), 18);
        assert!(list.hdcp1_device_downstream());
        assert!(!list.max_cascade_exceeded());
        assert!(!list.max_devs_exceeded());
        // only 17 ids on the wire, the slice is clamped
        assert_eq!(list.receiver_ids().len(), 17 * 5);
    }

    #[test]
    fn stream_manage_layout() {
        let msg = RepStreamManage {
            seq_num_m: 0x0001_0203,
            stream_id: 0,
            content_type: 1,
        };
        assert_eq!(msg.encode(), [REP_STREAM_MANAGE, 1, 2, 3, 0, 1, 0, 1]);
        assert_eq!(msg.m_input(), [0, 1, 1, 2, 3]);
    }
}
