//! Error kinds for rtkhdcp operations.
//!
//! Every kind has a stable numeric code (`Error::code`). The code and the
//! `Display` text are what the status attribute and the state-change event
//! report, so neither may change once published.

use thiserror::Error;

/// Main error type for HDCP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// Hot-plug went low before or during the operation.
    #[error("HDMI cable plugout")]
    Plugout,

    /// A polled condition did not become true before its deadline.
    #[error("wait timeout")]
    WaitTimeout,

    /// DDC read failed at an offset without a dedicated kind.
    #[error("i2c read transfer failed")]
    DdcReadTransfer,

    /// The write scratch buffer could not be allocated.
    #[error("hdcp ddc allocate memory failed")]
    DdcWriteNoMem,

    /// DDC write failed at an offset without a dedicated kind.
    #[error("i2c write transfer failed")]
    DdcWriteTransfer,

    /// Authentication was abandoned because a disable is in progress.
    #[error("hdcp authentication canceled")]
    Canceled,

    /// The link has no SCDC channel.
    #[error("sink device doesn't support scdc")]
    CedNotSupported,

    /// Nonzero character error counters; bit N set means channel N.
    #[error("character errors detected on channel mask {0:#03x}")]
    Ced(u8),

    /// A CED counter was read without its valid bit.
    #[error("CED counter valid bit is not set")]
    CedInvalid,

    // HDCP 1.4 protocol.
    #[error("sink device doesn't support hdcp")]
    Hdcp1NotSupported,
    #[error("AKSV of key is invalid")]
    InvalidAksv,
    #[error("BKSV of sink device is invalid")]
    InvalidBksv,
    #[error("BKSV of sink device is revoked")]
    RevokedBksv,
    #[error("KSV list of downstream is revoked")]
    RevokedKsvList,
    #[error("getting KSV list from repeater device timeout")]
    KsvListTimeout,
    #[error("hdcp1 max topology limit exceeded, more than seven levels")]
    Hdcp1MaxCascade,
    #[error("hdcp1 max topology limit exceeded, more than 127 downstream devices")]
    Hdcp1MaxDevice,

    // HDCP 1.4 register access.
    #[error("read Bcaps from sink device over i2c(offset=0x40) failed")]
    DdcBcaps,
    #[error("read Bstatus from sink device over i2c(offset=0x41) failed")]
    DdcBstatus,
    #[error("write An to sink device over i2c(offset=0x18) failed")]
    DdcAn,
    #[error("write AKSV to sink device over i2c(offset=0x10) failed")]
    DdcAksv,
    #[error("read BKSV from sink device over i2c(offset=0x00) failed")]
    DdcBksv,
    #[error("read Ri' from sink device over i2c(offset=0x08) failed")]
    DdcRiPrime,
    #[error("read KSV list form repeater device over i2c(offset=0x43) failed")]
    DdcKsvFifo,
    #[error("hdcp1 read V' from repeater device over i2c(offset=0x20) failed")]
    DdcVPrime,

    // HDCP 1.4 secure back-end.
    #[error("open context failed when init hdcp1 tee")]
    Tee1OpenContext,
    #[error("open session failed when init hdcp1 tee")]
    Tee1OpenSession,
    #[error("hdcp1 tee is not initialized")]
    Tee1NotInitialized,
    #[error("hdcp1 ca allocate memory failed")]
    Tee1NoMemory,
    #[error("invoke TA_TEE_HDCP14_GenAn command failed")]
    Tee1GenAn,
    #[error("invoke TA_TEE_HDCP14_GetAKSV command failed")]
    Tee1ReadAksv,
    #[error("invoke TA_TEE_HDCP14_SetRepeaterBitInTx command failed")]
    Tee1RepeaterBit,
    #[error("invoke TA_TEE_HDCP14_WriteBKSV command failed")]
    Tee1WriteBksv,
    /// The Ri check command itself failed.
    #[error("invoke TA_TEE_HDCP14_CheckR0 command failed")]
    Tee1CheckRi,
    /// The Ri check ran and Ri differs from Ri'.
    #[error("computed Ri does not equals to Ri prime")]
    IncorrectRi,
    #[error("invoke TA_TEE_HDCP14_SetEnc command failed")]
    Tee1SetEncryption,
    #[error("invoke TA_TEE_HDCP14_SetWinderWin command failed")]
    Tee1WiderWindow,
    #[error("invoke TA_TEE_HDCP14_SHAAppend command failed")]
    Tee1ShaAppend,
    #[error("invoke TA_TEE_HDCP14_ComputeV command failed")]
    Tee1ComputeV,
    #[error("compute V failed")]
    Tee1WaitVReady,
    /// The V check command itself failed.
    #[error("invoke TA_TEE_HDCP14_VerifyV command failed")]
    Tee1VerifyV,
    /// The V check ran and V differs from V'.
    #[error("hdcp1 computed V does not equals to V prime")]
    VMismatch,
    #[error("invoke TA_TEE_HDCP14_SetParamKey command failed")]
    Tee1SetKey,
    #[error("invoke TA_TEE_HDCP14_Fix480P command failed")]
    Tee1Fix480p,
    #[error("invoke TA_TEE_HDCP14_SetKeepoutwin command failed")]
    Tee1KeepoutWindow,
    #[error("invoke TA_TEE_HDCP14_SetRekeyWin command failed")]
    Tee1RekeyWindow,

    // HDCP 2.2 protocol.
    #[error("sink device doesn't support hdcp 2.x")]
    Hdcp2NotSupported,
    #[error("hdcp2 receiver id is revoked")]
    RevokedReceiverId,
    #[error("hdcp2 id list of downstream is revoked")]
    RevokedIdList,
    #[error("hdcp2 max topology limit exceeded, more than four levels")]
    Hdcp2MaxCascade,
    #[error("hdcp2 max topology limit exceeded, more than 31 downstream devices")]
    Hdcp2MaxDevice,
    #[error("seq_num_M rolls over")]
    SeqNumMRollover,
    #[error("hdcp2 reauth request")]
    ReauthRequest,
    #[error("hdcp2 topology is changed")]
    TopologyChange,
    #[error("hdcp2 get msg timeout value failed")]
    NoMessageTimeout,
    #[error("hdcp2 wait msg timeout")]
    WaitMessageTimeout,
    #[error("message size is more than expect size")]
    MessageSize,
    #[error("Read AKE_Send_Cert message failed")]
    ReadAkeSendCert,
    #[error("Read AKE_Send_H_prime message failed")]
    ReadHPrime,
    #[error("Read AKE_Send_Pairing_Info message failed")]
    ReadPairingInfo,
    #[error("Read LC_Send_L_prime message failed")]
    ReadLPrime,
    #[error("Read RepeaterAuth_Send_ReceiverID_List message failed")]
    ReadReceiverIdList,
    #[error("Read RepeaterAuth_Stream_Ready message failed")]
    ReadStreamReady,

    // HDCP 2.2 register access.
    #[error("read hdcp version from sink device over i2c(offset=0x50) failed")]
    DdcHdcp2Version,
    #[error("hdcp2 write message to sink device over i2c(offset=0x60) failed")]
    DdcWriteMessage,
    #[error("hdcp2 read RxStatus from sink device over i2c(offset=0x70) failed")]
    DdcRxStatus,
    #[error("hdcp2 read message from sink device over i2c(offset=0x80) failed")]
    DdcReadMessage,

    // HDCP 2.2 secure back-end.
    #[error("open context failed when init hdcp2 tee")]
    Tee2OpenContext,
    #[error("open session failed when init hdcp2 tee")]
    Tee2OpenSession,
    #[error("hdcp2 tee is not initialized")]
    Tee2NotInitialized,
    #[error("hdcp2 ca allocate memory failed")]
    Tee2NoMemory,
    /// No HDCP 2.2 key is provisioned. Permanent, never retried.
    #[error("hdcp2 key is not exist")]
    Tee2ReadKey,
    #[error("write hdcp2 key failed")]
    Tee2WriteKey,
    #[error("invoke TA_TEE_HDCPSendAkeInit command failed")]
    Tee2AkeInit,
    #[error("wrong msg_id when trying to verify rx_cert in CA")]
    CertMessageId,
    #[error("invoke TA_TEE_HDCPCheckLLCSignature command failed")]
    Tee2LlcSignature,
    #[error("invalid LLC signature from sink device")]
    InvalidLlcSignature,
    #[error("invoke TA_TEE_HDCPSendAkeNoStoredKm command failed")]
    Tee2NoStoredKm,
    #[error("wrong msg_id when trying to verify hprime in CA")]
    HPrimeMessageId,
    #[error("hdcp2 compute H failed")]
    Tee2ComputeH,
    #[error("calculated H does not equals to H prime")]
    HPrimeMismatch,
    #[error("wrong msg_id when store pairing_info")]
    PairingMessageId,
    #[error("invoke TA_TEE_HDCPSendLCInit command failed")]
    Tee2LcInit,
    #[error("wrong msg_id when trying to verify L prime in CA")]
    LPrimeMessageId,
    #[error("invoke TA_TEE_HDCPComputeL command failed")]
    Tee2ComputeL,
    #[error("computed L does not equals to L prime")]
    LPrimeMismatch,
    #[error("invoke TA_TEE_HDCPSendSke command failed")]
    Tee2SessionKey,
    #[error("wrong msg_id when trying to verify repeater topology")]
    ReceiverIdListMessageId,
    #[error("invoke TA_TEE_HDCPReceiverIDList command failed")]
    Tee2ReceiverIdList,
    #[error("invalid V prime half size in ta")]
    RlistVSize,
    #[error("wrong msg_id when trying to verify repeater topology in ta")]
    RlistMessageId,
    #[error("hdcp2 max topology limit exceeded")]
    RlistMaxExceeded,
    #[error("computed message size is incorrect when process receiver id list in ta")]
    RlistMessageSize,
    #[error("incorrect seq_num_V, repeater device should initializes seq_num_V")]
    RlistSeqNumV,
    #[error("seq_num_V rolls over")]
    RlistSeqNumVRollover,
    #[error("hdcp2 compute V failed")]
    RlistComputeV,
    #[error("hdcp2 computed V does not equals to V prime")]
    RlistVCompare,
    #[error("wrong msg_id when trying to verify M prime")]
    StreamReadyMessageId,
    #[error("invoke TA_TEE_HDCPComputeM command failed")]
    Tee2ComputeM,
    #[error("hdcp2 computed M does not equals to M prime")]
    MPrimeMismatch,
    #[error("invoke TA_TEE_HDCPLC128Cipher_2 command failed")]
    Tee2EnableCipher,
}

/// Result type alias for HDCP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Code reported when no error is recorded.
pub const NO_ERROR: u32 = 0;

impl Error {
    /// Every kind once, in code order. The seven CED channel masks are
    /// listed individually.
    pub const ALL: &'static [Error] = &[
        Error::Plugout,
        Error::WaitTimeout,
        Error::DdcReadTransfer,
        Error::DdcWriteNoMem,
        Error::DdcWriteTransfer,
        Error::Canceled,
        Error::CedNotSupported,
        Error::Ced(0b001),
        Error::Ced(0b010),
        Error::Ced(0b011),
        Error::Ced(0b100),
        Error::Ced(0b101),
        Error::Ced(0b110),
        Error::Ced(0b111),
        Error::CedInvalid,
        Error::Hdcp1NotSupported,
        Error::InvalidAksv,
        Error::InvalidBksv,
        Error::RevokedBksv,
        Error::RevokedKsvList,
        Error::KsvListTimeout,
        Error::Hdcp1MaxCascade,
        Error::Hdcp1MaxDevice,
        Error::DdcBcaps,
        Error::DdcBstatus,
        Error::DdcAn,
        Error::DdcAksv,
        Error::DdcBksv,
        Error::DdcRiPrime,
        Error::DdcKsvFifo,
        Error::DdcVPrime,
        Error::Tee1OpenContext,
        Error::Tee1OpenSession,
        Error::Tee1NotInitialized,
        Error::Tee1NoMemory,
        Error::Tee1GenAn,
        Error::Tee1ReadAksv,
        Error::Tee1RepeaterBit,
        Error::Tee1WriteBksv,
        Error::Tee1CheckRi,
        Error::IncorrectRi,
        Error::Tee1SetEncryption,
        Error::Tee1WiderWindow,
        Error::Tee1ShaAppend,
        Error::Tee1ComputeV,
        Error::Tee1WaitVReady,
        Error::Tee1VerifyV,
        Error::VMismatch,
        Error::Tee1SetKey,
        Error::Tee1Fix480p,
        Error::Tee1KeepoutWindow,
        Error::Tee1RekeyWindow,
        Error::Hdcp2NotSupported,
        Error::RevokedReceiverId,
        Error::RevokedIdList,
        Error::Hdcp2MaxCascade,
        Error::Hdcp2MaxDevice,
        Error::SeqNumMRollover,
        Error::ReauthRequest,
        Error::TopologyChange,
        Error::NoMessageTimeout,
        Error::WaitMessageTimeout,
        Error::MessageSize,
        Error::ReadAkeSendCert,
        Error::ReadHPrime,
        Error::ReadPairingInfo,
        Error::ReadLPrime,
        Error::ReadReceiverIdList,
        Error::ReadStreamReady,
        Error::DdcHdcp2Version,
        Error::DdcWriteMessage,
        Error::DdcRxStatus,
        Error::DdcReadMessage,
        Error::Tee2OpenContext,
        Error::Tee2OpenSession,
        Error::Tee2NotInitialized,
        Error::Tee2NoMemory,
        Error::Tee2ReadKey,
        Error::Tee2WriteKey,
        Error::Tee2AkeInit,
        Error::CertMessageId,
        Error::Tee2LlcSignature,
        Error::InvalidLlcSignature,
        Error::Tee2NoStoredKm,
        Error::HPrimeMessageId,
        Error::Tee2ComputeH,
        Error::HPrimeMismatch,
        Error::PairingMessageId,
        Error::Tee2LcInit,
        Error::LPrimeMessageId,
        Error::Tee2ComputeL,
        Error::LPrimeMismatch,
        Error::Tee2SessionKey,
        Error::ReceiverIdListMessageId,
        Error::Tee2ReceiverIdList,
        Error::RlistVSize,
        Error::RlistMessageId,
        Error::RlistMaxExceeded,
        Error::RlistMessageSize,
        Error::RlistSeqNumV,
        Error::RlistSeqNumVRollover,
        Error::RlistComputeV,
        Error::RlistVCompare,
        Error::StreamReadyMessageId,
        Error::Tee2ComputeM,
        Error::MPrimeMismatch,
        Error::Tee2EnableCipher,
    ];

    /// Stable numeric code of this kind.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Error::Plugout => 1,
            Error::WaitTimeout => 2,
            Error::DdcReadTransfer => 3,
            Error::DdcWriteNoMem => 4,
            Error::DdcWriteTransfer => 5,
            Error::Canceled => 10,
            Error::CedNotSupported => 16,
            Error::Ced(mask) => 0x10 | (*mask as u32 & 0x7),
            Error::CedInvalid => 24,
            Error::Hdcp1NotSupported => 100,
            Error::InvalidAksv => 101,
            Error::InvalidBksv => 102,
            Error::RevokedBksv => 103,
            Error::RevokedKsvList => 104,
            Error::KsvListTimeout => 105,
            Error::Hdcp1MaxCascade => 106,
            Error::Hdcp1MaxDevice => 107,
            Error::DdcBcaps => 130,
            Error::DdcBstatus => 131,
            Error::DdcAn => 132,
            Error::DdcAksv => 133,
            Error::DdcBksv => 134,
            Error::DdcRiPrime => 135,
            Error::DdcKsvFifo => 136,
            Error::DdcVPrime => 137,
            Error::Tee1OpenContext => 150,
            Error::Tee1OpenSession => 151,
            Error::Tee1NotInitialized => 152,
            Error::Tee1NoMemory => 153,
            Error::Tee1GenAn => 154,
            Error::Tee1ReadAksv => 155,
            Error::Tee1RepeaterBit => 156,
            Error::Tee1WriteBksv => 157,
            Error::Tee1CheckRi => 158,
            Error::IncorrectRi => 159,
            Error::Tee1SetEncryption => 160,
            Error::Tee1WiderWindow => 161,
            Error::Tee1ShaAppend => 162,
            Error::Tee1ComputeV => 163,
            Error::Tee1WaitVReady => 164,
            Error::Tee1VerifyV => 165,
            Error::VMismatch => 166,
            Error::Tee1SetKey => 167,
            Error::Tee1Fix480p => 168,
            Error::Tee1KeepoutWindow => 169,
            Error::Tee1RekeyWindow => 170,
            Error::Hdcp2NotSupported => 200,
            Error::RevokedReceiverId => 202,
            Error::RevokedIdList => 203,
            Error::Hdcp2MaxCascade => 205,
            Error::Hdcp2MaxDevice => 206,
            Error::SeqNumMRollover => 207,
            Error::ReauthRequest => 208,
            Error::TopologyChange => 209,
            Error::NoMessageTimeout => 210,
            Error::WaitMessageTimeout => 211,
            Error::MessageSize => 212,
            Error::ReadAkeSendCert => 213,
            Error::ReadHPrime => 214,
            Error::ReadPairingInfo => 215,
            Error::ReadLPrime => 216,
            Error::ReadReceiverIdList => 217,
            Error::ReadStreamReady => 218,
            Error::DdcHdcp2Version => 230,
            Error::DdcWriteMessage => 231,
            Error::DdcRxStatus => 232,
            Error::DdcReadMessage => 233,
            Error::Tee2OpenContext => 250,
            Error::Tee2OpenSession => 251,
            Error::Tee2NotInitialized => 252,
            Error::Tee2NoMemory => 253,
            Error::Tee2ReadKey => 254,
            Error::Tee2WriteKey => 255,
            Error::Tee2AkeInit => 256,
            Error::CertMessageId => 257,
            Error::Tee2LlcSignature => 258,
            Error::InvalidLlcSignature => 259,
            Error::Tee2NoStoredKm => 261,
            Error::HPrimeMessageId => 262,
            Error::Tee2ComputeH => 263,
            Error::HPrimeMismatch => 264,
            Error::PairingMessageId => 265,
            Error::Tee2LcInit => 267,
            Error::LPrimeMessageId => 268,
            Error::Tee2ComputeL => 269,
            Error::LPrimeMismatch => 270,
            Error::Tee2SessionKey => 271,
            Error::ReceiverIdListMessageId => 272,
            Error::Tee2ReceiverIdList => 273,
            Error::RlistVSize => 274,
            Error::RlistMessageId => 275,
            Error::RlistMaxExceeded => 276,
            Error::RlistMessageSize => 277,
            Error::RlistSeqNumV => 278,
            Error::RlistSeqNumVRollover => 279,
            Error::RlistComputeV => 280,
            Error::RlistVCompare => 281,
            Error::StreamReadyMessageId => 282,
            Error::Tee2ComputeM => 283,
            Error::MPrimeMismatch => 284,
            Error::Tee2EnableCipher => 285,
        }
    }

    /// Look a kind up by its numeric code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Error> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// True for the unplug kind, which short-circuits every retry loop.
    #[must_use]
    pub const fn is_plugout(&self) -> bool {
        matches!(self, Error::Plugout)
    }

    /// Whether a failed enable with this kind may be re-attempted
    /// automatically. Unplug, a missing HDCP 2.2 key and an invalid local
    /// Aksv cannot heal by retrying.
    #[must_use]
    pub const fn allows_retry(&self) -> bool {
        !matches!(
            self,
            Error::Plugout | Error::Tee2ReadKey | Error::InvalidAksv
        )
    }
}

/// Description reported alongside a numeric code.
#[must_use]
pub fn describe(code: u32) -> String {
    if code == NO_ERROR {
        return "no error".to_string();
    }
    Error::from_code(code)
        .map(|e| e.to_string())
        .unwrap_or_else(|| "Undefined error".to_string())
}
