//! HDCP 2.2 secure back-end.
//!
//! [`Hdcp2Backend`] covers everything the 2.2 flow needs from the secure
//! side. [`TeeHdcp2`] implements it over a [`TeeClient`] speaking the HDCP22
//! trusted application's command set.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hdcp2_msg::{
    AkeInit, AkeNoStoredKm, AkeSendCert, AkeSendHPrime, AkeSendPairingInfo, LcInit, LcSendLPrime,
    RepSendReceiverIdList, RepStreamReady, SkeSendEks, E_DKEY_KS_LEN, E_KPUB_KM_LEN, RIV_LEN,
    RN_LEN, RTX_LEN, STREAMID_TYPE_LEN, SEQ_NUM_LEN, TX_CAPS, VERIFIED_SRC_LEN, V_PRIME_HALF_LEN,
};
use crate::session::Mcap;
use crate::tee::{SessionErrors, TeeClient, TeeParam, TeeSession};

pub const HDCP2_TA_UUID: Uuid = Uuid::from_u128(0x8baaf200_2450_11e4_abe2_0002a5d5c51b);

// TA command ids.
const SEND_AKE_INIT: u32 = 0xa;
const CHECK_LLC_SIGNATURE: u32 = 0xb;
const SEND_AKE_NO_STORED_KM: u32 = 0xc;
const SEND_LC_INIT: u32 = 0xd;
const COMPUTE_L: u32 = 0xe;
const SEND_SKE: u32 = 0xf;
const COMPUTE_H: u32 = 0x11;
const RECEIVER_ID_LIST: u32 = 0x14;
const COMPUTE_M: u32 = 0x15;
const CIPHER_RESET: u32 = 0x16;
const SET_PARAM_KEY: u32 = 0x17;
const GET_PARAM_KEY: u32 = 0x18;
const SET_ENC_STATE: u32 = 0x19;
const CIPHER_ENABLE: u32 = 0x20;
const CIPHER_CLEAR: u32 = 0x21;

/// Translate the TA's own receiver-id-list error code.
#[must_use]
pub fn receiver_id_list_error(code: u64) -> Error {
    match code {
        0x100 => Error::RlistMaxExceeded,
        0x101 => Error::RlistMessageSize,
        0x102 => Error::RlistSeqNumV,
        0x103 => Error::RlistSeqNumVRollover,
        0x105 => Error::RlistVCompare,
        0xFFFF_0005 => Error::RlistVSize,
        0xFFFF_000E => Error::RlistMessageId,
        0xFFFF_3072 => Error::RlistComputeV,
        _ => Error::Tee2ReceiverIdList,
    }
}

/// Operations the HDCP 2.2 flow needs from the secure side.
pub trait Hdcp2Backend: Send {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self);
    fn is_initialized(&self) -> bool;

    /// Check that a provisioning key is installed.
    fn read_key(&mut self) -> Result<()>;
    fn write_key(&mut self, key: &[u8]) -> Result<()>;

    fn ake_init(&mut self) -> Result<AkeInit>;
    fn verify_rx_cert(&mut self, cert: &AkeSendCert) -> Result<()>;
    /// Look up a stored master key for `receiver_id`. Always reports not
    /// stored; pairing is not persisted.
    fn check_stored_km(&mut self, _receiver_id: &[u8; 5]) -> Result<bool> {
        Ok(false)
    }
    fn prepare_no_stored_km(&mut self) -> Result<AkeNoStoredKm>;
    fn verify_hprime(
        &mut self,
        msg: &AkeSendHPrime,
        verified_src: &[u8; VERIFIED_SRC_LEN],
    ) -> Result<()>;
    /// Persist pairing data. Intentionally a no-op.
    fn store_pairing_info(&mut self, _msg: &AkeSendPairingInfo) -> Result<()> {
        Ok(())
    }
    fn lc_init(&mut self) -> Result<LcInit>;
    fn verify_lprime(&mut self, msg: &LcSendLPrime) -> Result<()>;
    fn session_key(&mut self) -> Result<SkeSendEks>;
    /// Verify the list's V' and return the V to acknowledge with.
    fn verify_receiver_id_list(
        &mut self,
        msg: &RepSendReceiverIdList,
    ) -> Result<[u8; V_PRIME_HALF_LEN]>;
    fn verify_mprime(
        &mut self,
        msg: &RepStreamReady,
        input: &[u8; STREAMID_TYPE_LEN + SEQ_NUM_LEN],
    ) -> Result<()>;

    fn enable_cipher(&mut self, mcap: Mcap) -> Result<()>;
    fn disable_cipher(&mut self);
    fn clear_cipher_setting(&mut self);
    fn update_mcap(&mut self, mcap: Mcap);
}

impl<B: Hdcp2Backend + ?Sized> Hdcp2Backend for Box<B> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn deinit(&mut self) {
        (**self).deinit()
    }
    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }
    fn read_key(&mut self) -> Result<()> {
        (**self).read_key()
    }
    fn write_key(&mut self, key: &[u8]) -> Result<()> {
        (**self).write_key(key)
    }
    fn ake_init(&mut self) -> Result<AkeInit> {
        (**self).ake_init()
    }
    fn verify_rx_cert(&mut self, cert: &AkeSendCert) -> Result<()> {
        (**self).verify_rx_cert(cert)
    }
    fn check_stored_km(&mut self, receiver_id: &[u8; 5]) -> Result<bool> {
        (**self).check_stored_km(receiver_id)
    }
    fn prepare_no_stored_km(&mut self) -> Result<AkeNoStoredKm> {
        (**self).prepare_no_stored_km()
    }
    fn verify_hprime(
        &mut self,
        msg: &AkeSendHPrime,
        verified_src: &[u8; VERIFIED_SRC_LEN],
    ) -> Result<()> {
        (**self).verify_hprime(msg, verified_src)
    }
    fn store_pairing_info(&mut self, msg: &AkeSendPairingInfo) -> Result<()> {
        (**self).store_pairing_info(msg)
    }
    fn lc_init(&mut self) -> Result<LcInit> {
        (**self).lc_init()
    }
    fn verify_lprime(&mut self, msg: &LcSendLPrime) -> Result<()> {
        (**self).verify_lprime(msg)
    }
    fn session_key(&mut self) -> Result<SkeSendEks> {
        (**self).session_key()
    }
    fn verify_receiver_id_list(
        &mut self,
        msg: &RepSendReceiverIdList,
    ) -> Result<[u8; V_PRIME_HALF_LEN]> {
        (**self).verify_receiver_id_list(msg)
    }
    fn verify_mprime(
        &mut self,
        msg: &RepStreamReady,
        input: &[u8; STREAMID_TYPE_LEN + SEQ_NUM_LEN],
    ) -> Result<()> {
        (**self).verify_mprime(msg, input)
    }
    fn enable_cipher(&mut self, mcap: Mcap) -> Result<()> {
        (**self).enable_cipher(mcap)
    }
    fn disable_cipher(&mut self) {
        (**self).disable_cipher()
    }
    fn clear_cipher_setting(&mut self) {
        (**self).clear_cipher_setting()
    }
    fn update_mcap(&mut self, mcap: Mcap) {
        (**self).update_mcap(mcap)
    }
}

/// [`Hdcp2Backend`] over the HDCP22 trusted application.
pub struct TeeHdcp2<C> {
    tee: TeeSession<C>,
}

fn params() -> [TeeParam; 4] {
    Default::default()
}

fn copy_out<const N: usize>(param: &TeeParam, err: Error) -> Result<[u8; N]> {
    let buf = param.buffer().ok_or(err)?;
    let mut out = [0u8; N];
    out.copy_from_slice(buf.get(..N).ok_or(err)?);
    Ok(out)
}

impl<C: TeeClient> TeeHdcp2<C> {
    pub fn new(client: C) -> Self {
        let errors = SessionErrors {
            open_context: Error::Tee2OpenContext,
            open_session: Error::Tee2OpenSession,
            not_initialized: Error::Tee2NotInitialized,
            no_memory: Error::Tee2NoMemory,
        };
        Self {
            tee: TeeSession::new(client, "hdcp2_tee", HDCP2_TA_UUID, errors),
        }
    }

    pub fn client(&self) -> &C {
        self.tee.client()
    }

    pub fn client_mut(&mut self) -> &mut C {
        self.tee.client_mut()
    }

    /// Commands without a reported result; failures are only logged.
    fn invoke_quiet(&mut self, func: u32, mut p: [TeeParam; 4], what: &str) {
        if !self.tee.is_open() {
            error!("hdcp2_tee {what} fail, uninitialized");
            return;
        }
        if self.tee.invoke(func, &mut p, Error::Tee2NotInitialized).is_ok() {
            debug!("hdcp2 {what} done");
        }
    }
}

impl<C: TeeClient> Hdcp2Backend for TeeHdcp2<C> {
    fn init(&mut self) -> Result<()> {
        self.tee.open()
    }

    fn deinit(&mut self) {
        self.tee.close()
    }

    fn is_initialized(&self) -> bool {
        self.tee.is_open()
    }

    fn read_key(&mut self) -> Result<()> {
        let mut p = params();
        self.tee.invoke(GET_PARAM_KEY, &mut p, Error::Tee2ReadKey)
    }

    fn write_key(&mut self, key: &[u8]) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(key);
        p[1] = TeeParam::value(0, 0);
        self.tee.invoke(SET_PARAM_KEY, &mut p, Error::Tee2WriteKey)?;
        match p[1].value_a() {
            Some(0) => Ok(()),
            other => {
                error!("hdcp2_tee SetParamKey value.a={other:?}");
                Err(Error::Tee2WriteKey)
            }
        }
    }

    fn ake_init(&mut self) -> Result<AkeInit> {
        let mut p = params();
        p[0] = self.tee.shared(RTX_LEN)?;
        self.tee.invoke(SEND_AKE_INIT, &mut p, Error::Tee2AkeInit)?;
        Ok(AkeInit {
            r_tx: copy_out(&p[0], Error::Tee2AkeInit)?,
            tx_caps: TX_CAPS,
        })
    }

    fn verify_rx_cert(&mut self, cert: &AkeSendCert) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(&cert.cert_rx[..]);
        p[1] = TeeParam::value(0, 0);
        self.tee.invoke(CHECK_LLC_SIGNATURE, &mut p, Error::Tee2LlcSignature)?;
        if p[1].value_a() != Some(1) {
            return Err(Error::InvalidLlcSignature);
        }
        Ok(())
    }

    fn prepare_no_stored_km(&mut self) -> Result<AkeNoStoredKm> {
        let mut p = params();
        p[0] = self.tee.shared(E_KPUB_KM_LEN)?;
        p[1] = TeeParam::value(0, 0);
        self.tee.invoke(SEND_AKE_NO_STORED_KM, &mut p, Error::Tee2NoStoredKm)?;
        if p[1].value_a() != Some(0) {
            error!("hdcp2_tee NoStoredKm value.a={:?}", p[1].value_a());
            return Err(Error::Tee2NoStoredKm);
        }
        Ok(AkeNoStoredKm {
            e_kpub_km: copy_out(&p[0], Error::Tee2NoStoredKm)?,
        })
    }

    fn verify_hprime(
        &mut self,
        msg: &AkeSendHPrime,
        verified_src: &[u8; VERIFIED_SRC_LEN],
    ) -> Result<()> {
        let mut p = params();
        p[0] = self.tee.shared(msg.h_prime.len())?;
        p[1] = TeeParam::memref(&msg.h_prime);
        p[2] = TeeParam::memref(verified_src);
        p[3] = TeeParam::value(1, 0);
        self.tee.invoke(COMPUTE_H, &mut p, Error::Tee2ComputeH)?;
        if p[3].value_a() != Some(0) {
            info!("hdcp2_tee H != H'");
            return Err(Error::HPrimeMismatch);
        }
        Ok(())
    }

    fn lc_init(&mut self) -> Result<LcInit> {
        let mut p = params();
        p[0] = self.tee.shared(RN_LEN)?;
        self.tee.invoke(SEND_LC_INIT, &mut p, Error::Tee2LcInit)?;
        Ok(LcInit {
            r_n: copy_out(&p[0], Error::Tee2LcInit)?,
        })
    }

    fn verify_lprime(&mut self, msg: &LcSendLPrime) -> Result<()> {
        let mut p = params();
        p[0] = self.tee.shared(msg.l_prime.len())?;
        p[1] = TeeParam::memref(&msg.l_prime);
        p[2] = TeeParam::value(1, 0);
        self.tee.invoke(COMPUTE_L, &mut p, Error::Tee2ComputeL)?;
        if p[2].value_a() != Some(0) {
            info!("hdcp2_tee L != L'");
            return Err(Error::LPrimeMismatch);
        }
        Ok(())
    }

    fn session_key(&mut self) -> Result<SkeSendEks> {
        let mut p = params();
        p[0] = self.tee.shared(E_DKEY_KS_LEN)?;
        p[1] = self.tee.shared(RIV_LEN)?;
        self.tee.invoke(SEND_SKE, &mut p, Error::Tee2SessionKey)?;
        Ok(SkeSendEks {
            e_dkey_ks: copy_out(&p[0], Error::Tee2SessionKey)?,
            riv: copy_out(&p[1], Error::Tee2SessionKey)?,
        })
    }

    fn verify_receiver_id_list(
        &mut self,
        msg: &RepSendReceiverIdList,
    ) -> Result<[u8; V_PRIME_HALF_LEN]> {
        let mut p = params();
        p[0] = TeeParam::memref(&msg.raw);
        p[1] = self.tee.shared(V_PRIME_HALF_LEN)?;
        p[2] = TeeParam::value(0, 0);
        let ret = self
            .tee
            .invoke_raw(RECEIVER_ID_LIST, &mut p, Error::Tee2ReceiverIdList)?;
        let inner = p[2].value_a().unwrap_or(0);
        if ret != 0 || inner != 0 {
            debug!("ReceiverIDList ret={ret:#x} value.a={inner:#x}");
            return Err(receiver_id_list_error(inner));
        }
        copy_out(&p[1], Error::Tee2ReceiverIdList)
    }

    fn verify_mprime(
        &mut self,
        msg: &RepStreamReady,
        input: &[u8; STREAMID_TYPE_LEN + SEQ_NUM_LEN],
    ) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(input);
        p[1] = TeeParam::memref(&msg.m_prime);
        p[2] = TeeParam::value(1, 0);
        self.tee.invoke(COMPUTE_M, &mut p, Error::Tee2ComputeM)?;
        if p[2].value_a() != Some(0) {
            debug!("ComputeM value.a={:?}", p[2].value_a());
            return Err(Error::MPrimeMismatch);
        }
        Ok(())
    }

    fn enable_cipher(&mut self, mcap: Mcap) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(&[mcap.tag()]);
        self.tee.invoke(CIPHER_ENABLE, &mut p, Error::Tee2EnableCipher)
    }

    fn disable_cipher(&mut self) {
        let mut p = params();
        p[0] = TeeParam::value(0, 0);
        self.invoke_quiet(CIPHER_RESET, p, "cipher disable");
    }

    fn clear_cipher_setting(&mut self) {
        self.invoke_quiet(CIPHER_CLEAR, params(), "cipher clear");
    }

    fn update_mcap(&mut self, mcap: Mcap) {
        let mut p = params();
        p[0] = TeeParam::memref(&[mcap.tag()]);
        self.invoke_quiet(SET_ENC_STATE, p, "set mCap");
    }
}
