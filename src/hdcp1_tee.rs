//! HDCP 1.4 secure back-end.
//!
//! [`Hdcp1Backend`] is what the 1.4 flow talks to. [`TeeHdcp1`] implements
//! it over a [`TeeClient`] speaking the HDCP14 trusted application's command
//! set.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tee::{SessionErrors, TeeClient, TeeParam, TeeSession, TEE_ERROR_NOT_SUPPORTED, TEE_SUCCESS};

pub const AN_LEN: usize = 8;
pub const KSV_LEN: usize = 5;
pub const RI_LEN: usize = 2;
pub const BSTATUS_LEN: usize = 2;
pub const V_PRIME_LEN: usize = 20;
/// Size of the SHA input buffer: up to 127 KSVs plus Bstatus and M0.
pub const SHA_DATA_LEN: usize = 645;
pub const KEY_LEN: usize = 288;

pub const KEEPOUT_WIN_START: u64 = 0x1fa;
pub const KEEPOUT_WIN_END: u64 = 0x288;

pub const HDCP1_TA_UUID: Uuid = Uuid::from_u128(0x87ef28e8_f581_4e3d_b2b2_d7e3d48b2321);

// TA command ids.
const GEN_AN: u32 = 0x1;
const WRITE_BKSV: u32 = 0x2;
const SET_REPEATER_BIT: u32 = 0x3;
const SET_ENC: u32 = 0x5;
const SET_WIDER_WIN: u32 = 0x6;
const SHA_APPEND: u32 = 0x9;
const COMPUTE_V: u32 = 0xa;
const VERIFY_V: u32 = 0xb;
const CHECK_R0: u32 = 0xc;
const GET_AKSV: u32 = 0xd;
const SET_PARAM_KEY: u32 = 0xf;
const FIX_480P: u32 = 0x10;
const SET_KEEPOUT_WIN: u32 = 0x11;
const SET_REKEY_WIN: u32 = 0x12;

/// Operations the HDCP 1.4 flow needs from the secure side.
pub trait Hdcp1Backend: Send {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self);
    fn is_initialized(&self) -> bool;

    fn generate_an(&mut self) -> Result<[u8; AN_LEN]>;
    fn read_aksv(&mut self) -> Result<[u8; KSV_LEN]>;
    fn set_repeater_bit(&mut self, is_repeater: bool) -> Result<()>;
    fn write_bksv(&mut self, bksv: &[u8; KSV_LEN]) -> Result<()>;
    /// Compare Ri' against the locally computed Ri.
    fn check_ri(&mut self, ri_prime: &[u8; RI_LEN]) -> Result<()>;
    fn set_encryption(&mut self, enable: bool) -> Result<()>;

    /// Append Bstatus and M0 behind the KSV list; returns the new byte count.
    fn sha_append(
        &mut self,
        ksv_fifo: &mut [u8; SHA_DATA_LEN],
        byte_cnt: usize,
        bstatus: &[u8; BSTATUS_LEN],
    ) -> Result<usize>;
    fn compute_v(&mut self, ksv_fifo: &mut [u8; SHA_DATA_LEN], byte_cnt: usize) -> Result<()>;
    fn verify_v(&mut self, v_prime: &[u8; V_PRIME_LEN]) -> Result<()>;

    /// Returns `false` when the TA does not implement the setting.
    fn set_wider_window(&mut self) -> Result<bool>;

    fn write_key(&mut self, key: &[u8; KEY_LEN]) -> Result<()>;
    fn fix_480p(&mut self) -> Result<()>;
    fn set_keepout_window(&mut self) -> Result<()>;
    fn set_rekey_window(&mut self, rekey_win: u8) -> Result<()>;
}

impl<B: Hdcp1Backend + ?Sized> Hdcp1Backend for Box<B> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn deinit(&mut self) {
        (**self).deinit()
    }
    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }
    fn generate_an(&mut self) -> Result<[u8; AN_LEN]> {
        (**self).generate_an()
    }
    fn read_aksv(&mut self) -> Result<[u8; KSV_LEN]> {
        (**self).read_aksv()
    }
    fn set_repeater_bit(&mut self, is_repeater: bool) -> Result<()> {
        (**self).set_repeater_bit(is_repeater)
    }
    fn write_bksv(&mut self, bksv: &[u8; KSV_LEN]) -> Result<()> {
        (**self).write_bksv(bksv)
    }
    fn check_ri(&mut self, ri_prime: &[u8; RI_LEN]) -> Result<()> {
        (**self).check_ri(ri_prime)
    }
    fn set_encryption(&mut self, enable: bool) -> Result<()> {
        (**self).set_encryption(enable)
    }
    fn sha_append(
        &mut self,
        ksv_fifo: &mut [u8; SHA_DATA_LEN],
        byte_cnt: usize,
        bstatus: &[u8; BSTATUS_LEN],
    ) -> Result<usize> {
        (**self).sha_append(ksv_fifo, byte_cnt, bstatus)
    }
    fn compute_v(&mut self, ksv_fifo: &mut [u8; SHA_DATA_LEN], byte_cnt: usize) -> Result<()> {
        (**self).compute_v(ksv_fifo, byte_cnt)
    }
    fn verify_v(&mut self, v_prime: &[u8; V_PRIME_LEN]) -> Result<()> {
        (**self).verify_v(v_prime)
    }
    fn set_wider_window(&mut self) -> Result<bool> {
        (**self).set_wider_window()
    }
    fn write_key(&mut self, key: &[u8; KEY_LEN]) -> Result<()> {
        (**self).write_key(key)
    }
    fn fix_480p(&mut self) -> Result<()> {
        (**self).fix_480p()
    }
    fn set_keepout_window(&mut self) -> Result<()> {
        (**self).set_keepout_window()
    }
    fn set_rekey_window(&mut self, rekey_win: u8) -> Result<()> {
        (**self).set_rekey_window(rekey_win)
    }
}

/// [`Hdcp1Backend`] over the HDCP14 trusted application.
pub struct TeeHdcp1<C> {
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

impl<C: TeeClient> TeeHdcp1<C> {
    pub fn new(client: C) -> Self {
        let errors = SessionErrors {
            open_context: Error::Tee1OpenContext,
            open_session: Error::Tee1OpenSession,
            not_initialized: Error::Tee1NotInitialized,
            no_memory: Error::Tee1NoMemory,
        };
        Self {
            tee: TeeSession::new(client, "hdcp1_tee", HDCP1_TA_UUID, errors),
        }
    }

    pub fn client(&self) -> &C {
        self.tee.client()
    }

    pub fn client_mut(&mut self) -> &mut C {
        self.tee.client_mut()
    }
}

impl<C: TeeClient> Hdcp1Backend for TeeHdcp1<C> {
    fn init(&mut self) -> Result<()> {
        self.tee.open()
    }

    fn deinit(&mut self) {
        self.tee.close()
    }

    fn is_initialized(&self) -> bool {
        self.tee.is_open()
    }

    fn generate_an(&mut self) -> Result<[u8; AN_LEN]> {
        let mut p = params();
        p[0] = self.tee.shared(AN_LEN)?;
        self.tee.invoke(GEN_AN, &mut p, Error::Tee1GenAn)?;
        copy_out(&p[0], Error::Tee1GenAn)
    }

    fn read_aksv(&mut self) -> Result<[u8; KSV_LEN]> {
        let mut p = params();
        p[0] = self.tee.shared(KSV_LEN)?;
        p[1] = TeeParam::value(0, 0);
        self.tee.invoke(GET_AKSV, &mut p, Error::Tee1ReadAksv)?;
        copy_out(&p[0], Error::Tee1ReadAksv)
    }

    fn set_repeater_bit(&mut self, is_repeater: bool) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::value(u64::from(is_repeater), 0);
        self.tee.invoke(SET_REPEATER_BIT, &mut p, Error::Tee1RepeaterBit)
    }

    fn write_bksv(&mut self, bksv: &[u8; KSV_LEN]) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(bksv);
        self.tee.invoke(WRITE_BKSV, &mut p, Error::Tee1WriteBksv)
    }

    fn check_ri(&mut self, ri_prime: &[u8; RI_LEN]) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(ri_prime);
        p[1] = TeeParam::value(0, 0);
        self.tee.invoke(CHECK_R0, &mut p, Error::Tee1CheckRi)?;
        if p[1].value_a() != Some(0) {
            info!("hdcp1_tee Ri != Ri'");
            return Err(Error::IncorrectRi);
        }
        Ok(())
    }

    fn set_encryption(&mut self, enable: bool) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::value(u64::from(enable), 0);
        self.tee.invoke(SET_ENC, &mut p, Error::Tee1SetEncryption)
    }

    fn sha_append(
        &mut self,
        ksv_fifo: &mut [u8; SHA_DATA_LEN],
        byte_cnt: usize,
        bstatus: &[u8; BSTATUS_LEN],
    ) -> Result<usize> {
        let mut p = params();
        p[0] = TeeParam::memref(ksv_fifo);
        p[1] = TeeParam::memref(bstatus);
        p[2] = TeeParam::value(byte_cnt as u64, 0);
        self.tee.invoke(SHA_APPEND, &mut p, Error::Tee1ShaAppend)?;
        *ksv_fifo = copy_out(&p[0], Error::Tee1ShaAppend)?;
        let cnt = p[2].value_a().ok_or(Error::Tee1ShaAppend)?;
        usize::try_from(cnt).map_err(|_| Error::Tee1ShaAppend)
    }

    fn compute_v(&mut self, ksv_fifo: &mut [u8; SHA_DATA_LEN], byte_cnt: usize) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(ksv_fifo);
        // The TA clears `b` once V is ready.
        p[1] = TeeParam::value(byte_cnt as u64, u64::from(Error::Tee1ComputeV.code()));
        self.tee.invoke(COMPUTE_V, &mut p, Error::Tee1ComputeV)?;
        if p[1].value_b() != Some(0) {
            return Err(Error::Tee1WaitVReady);
        }
        let hashed = p[1].value_a().ok_or(Error::Tee1ComputeV)?;
        if hashed != byte_cnt as u64 {
            warn!("hdcp1_tee compute_V hashed {hashed} bytes, appended {byte_cnt}");
        }
        *ksv_fifo = copy_out(&p[0], Error::Tee1ComputeV)?;
        Ok(())
    }

    fn verify_v(&mut self, v_prime: &[u8; V_PRIME_LEN]) -> Result<()> {
        let mut p = params();
        // Wire contract: the TA validates the declared size against the SHA
        // buffer size, not the 20-byte V' it actually reads.
        p[0] = TeeParam::memref_with_size(v_prime, SHA_DATA_LEN);
        p[1] = TeeParam::value(u64::from(Error::Tee1VerifyV.code()), 0);
        self.tee.invoke(VERIFY_V, &mut p, Error::Tee1VerifyV)?;
        if p[1].value_a() != Some(0) {
            info!("hdcp1_tee verify V != V'");
            return Err(Error::VMismatch);
        }
        Ok(())
    }

    fn set_wider_window(&mut self) -> Result<bool> {
        let mut p = params();
        p[0] = TeeParam::value(1, 0);
        match self.tee.invoke_raw(SET_WIDER_WIN, &mut p, Error::Tee1WiderWindow)? {
            TEE_SUCCESS => Ok(true),
            TEE_ERROR_NOT_SUPPORTED => {
                debug!("hdcp1_tee wider window not supported");
                Ok(false)
            }
            ret => {
                error!("hdcp1_tee set_wider_window fail, ret={ret:#x}");
                Err(Error::Tee1WiderWindow)
            }
        }
    }

    fn write_key(&mut self, key: &[u8; KEY_LEN]) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::memref(key);
        p[1] = TeeParam::value(1, 0);
        self.tee.invoke(SET_PARAM_KEY, &mut p, Error::Tee1SetKey)?;
        match p[1].value_a() {
            Some(0) => Ok(()),
            _ => Err(Error::Tee1SetKey),
        }
    }

    fn fix_480p(&mut self) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::value(0, 0);
        self.tee.invoke(FIX_480P, &mut p, Error::Tee1Fix480p)
    }

    fn set_keepout_window(&mut self) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::value(KEEPOUT_WIN_START, KEEPOUT_WIN_END);
        self.tee.invoke(SET_KEEPOUT_WIN, &mut p, Error::Tee1KeepoutWindow)
    }

    fn set_rekey_window(&mut self, rekey_win: u8) -> Result<()> {
        let mut p = params();
        p[0] = TeeParam::value(u64::from(rekey_win), 0);
        self.tee.invoke(SET_REKEY_WIN, &mut p, Error::Tee1RekeyWindow)
    }
}
