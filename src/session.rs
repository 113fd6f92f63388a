//! Per-connector HDCP session state.
//!
//! The session is plain data owned by the engine. Which cipher is running is
//! a single [`Encryption`] value, so HDCP 1.4 and HDCP 2.2 encryption can
//! never both be on.

use std::fmt;

use crate::error::{self, Error};
use crate::hdcp2_msg::{RRX_LEN, RTX_LEN, RXCAPS_LEN, TXCAPS_LEN, VERIFIED_SRC_LEN};

/// Authentication state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HdcpState {
    HdmiDisconnected,
    HdmiDisabled,
    Unauthenticated,
    Hdcp1InAuth,
    Hdcp2InAuth,
    Hdcp1Success,
    Hdcp2Success,
    Hdcp1Failure,
    Hdcp2Failure,
}

impl HdcpState {
    /// Name reported through the state attribute and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            HdcpState::HdmiDisconnected => "CABLE_DISCONNECTED",
            HdcpState::HdmiDisabled => "HDMI_DISABLED",
            HdcpState::Unauthenticated => "HDCP_UNAUTH",
            HdcpState::Hdcp1InAuth => "HDCP1_IN_AUTH",
            HdcpState::Hdcp2InAuth => "HDCP2_IN_AUTH",
            HdcpState::Hdcp1Success => "HDCP1_SUCCESS",
            HdcpState::Hdcp2Success => "HDCP2_SUCCESS",
            HdcpState::Hdcp1Failure => "HDCP1_FAILURE",
            HdcpState::Hdcp2Failure => "HDCP2_FAILURE",
        }
    }
}

impl fmt::Display for HdcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// User-facing content protection property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentProtection {
    Undesired,
    Desired,
    Enabled,
}

/// Highest HDCP version the attached sink answered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SinkVersion {
    None = 0,
    Hdcp1 = 1,
    Hdcp2 = 2,
}

/// Downstream content protection level pushed to the HDCP 2.2 back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mcap {
    None,
    V1,
    V2,
    V2_1,
    V2_2,
    V2_3,
    NoDigitalOutput,
}

impl Mcap {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Mcap::None => 0,
            Mcap::V1 => 1,
            Mcap::V2 => 2,
            Mcap::V2_1 => 3,
            Mcap::V2_2 => 4,
            Mcap::V2_3 => 5,
            Mcap::NoDigitalOutput => 0xff,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Mcap> {
        Some(match tag {
            0 => Mcap::None,
            1 => Mcap::V1,
            2 => Mcap::V2,
            3 => Mcap::V2_1,
            4 => Mcap::V2_2,
            5 => Mcap::V2_3,
            0xff => Mcap::NoDigitalOutput,
            _ => return None,
        })
    }
}

/// Which link cipher is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encryption {
    #[default]
    None,
    Hdcp1,
    Hdcp2,
}

/// Values exchanged during AKE that feed the H' computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AkeSecrets {
    pub r_tx: [u8; RTX_LEN],
    pub tx_caps: [u8; TXCAPS_LEN],
    pub r_rx: [u8; RRX_LEN],
    pub rx_caps: [u8; RXCAPS_LEN],
}

impl AkeSecrets {
    /// `r_rx || r_tx || rx_caps || tx_caps`
    #[must_use]
    pub fn verified_src(&self) -> [u8; VERIFIED_SRC_LEN] {
        let mut out = [0u8; VERIFIED_SRC_LEN];
        out[..8].copy_from_slice(&self.r_rx);
        out[8..16].copy_from_slice(&self.r_tx);
        out[16..19].copy_from_slice(&self.rx_caps);
        out[19..].copy_from_slice(&self.tx_caps);
        out
    }
}

/// State of one connector's HDCP session.
#[derive(Debug, Clone)]
pub struct HdcpSession {
    pub state: HdcpState,
    pub value: ContentProtection,
    /// Cause of the last failure, `None` once a state is entered cleanly.
    pub error: Option<Error>,
    pub encryption: Encryption,
    pub sink_version: SinkVersion,
    pub hdcp2_supported: bool,
    pub force_hdcp14: bool,
    pub is_repeater: bool,
    pub is_paired: bool,
    pub hdcp1_device_downstream: bool,
    pub seq_num_m: u32,
    pub secrets: AkeSecrets,
    pub mcap: Mcap,
    /// Suppresses state events while the system is suspending.
    pub suspended: bool,
}

impl Default for HdcpSession {
    fn default() -> Self {
        Self {
            state: HdcpState::HdmiDisconnected,
            value: ContentProtection::Undesired,
            error: None,
            encryption: Encryption::None,
            sink_version: SinkVersion::None,
            hdcp2_supported: false,
            force_hdcp14: false,
            is_repeater: false,
            is_paired: false,
            hdcp1_device_downstream: false,
            seq_num_m: 0,
            secrets: AkeSecrets::default(),
            mcap: Mcap::None,
            suspended: false,
        }
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

impl HdcpSession {
    #[must_use]
    pub fn error_code(&self) -> u32 {
        self.error.map_or(error::NO_ERROR, |e| e.code())
    }

    #[must_use]
    pub fn hdcp1_encrypted(&self) -> bool {
        self.encryption == Encryption::Hdcp1
    }

    #[must_use]
    pub fn hdcp2_encrypted(&self) -> bool {
        self.encryption == Encryption::Hdcp2
    }

    /// Forget everything learned in a previous AKE.
    pub fn reset_ake(&mut self) {
        self.is_repeater = false;
        self.hdcp1_device_downstream = false;
        self.is_paired = false;
        self.seq_num_m = 0;
        self.secrets = AkeSecrets::default();
    }

    /// Diagnostic dump of the session flags.
    #[must_use]
    pub fn info(&self) -> String {
        format!(
            "sink_hdcp_ver: {}\n\
             hdcp2_supported: {}\n\
             hdcp_encrypted: {}\n\
             hdcp2_encrypted: {}\n\
             is_repeater: {}\n\
             hdcp1_device_downstream: {}\n",
            self.sink_version as u8,
            yes_no(self.hdcp2_supported),
            yes_no(self.hdcp1_encrypted()),
            yes_no(self.hdcp2_encrypted()),
            yes_no(self.is_repeater),
            yes_no(self.hdcp1_device_downstream),
        )
    }

    /// Machine-readable state and error code.
    #[must_use]
    pub fn state_attr(&self) -> String {
        format!("STATE={}\nHDCP_ERR={}\n", self.state.name(), self.error_code())
    }
}

#[cfg(test)]
mod tests {
    use super::{AkeSecrets, Encryption, HdcpSession, HdcpState, Mcap, SinkVersion};
    use crate::error::Error;

    #[test]
    fn state_attr_format() {
        let mut s = HdcpSession::default();
        assert_eq!(s.state_attr(), "STATE=CABLE_DISCONNECTED\nHDCP_ERR=0\n");
        s.state = HdcpState::Hdcp1Failure;
        s.error = Some(Error::RevokedBksv);
        assert_eq!(s.state_attr(), "STATE=HDCP1_FAILURE\nHDCP_ERR=103\n");
    }

    #[test]
    fn info_format() {
        let s = HdcpSession {
            sink_version: SinkVersion::Hdcp2,
            hdcp2_supported: true,
            encryption: Encryption::Hdcp2,
            is_repeater: true,
            ..Default::default()
        };
        assert_eq!(
            s.info(),
            "sink_hdcp_ver: 2\nhdcp2_supported: yes\nhdcp_encrypted: no\n\
             hdcp2_encrypted: yes\nis_repeater: yes\nhdcp1_device_downstream: no\n"
        );
    }

    #[test]
    fn verified_src_order() {
        let secrets = AkeSecrets {
            r_tx: [1; 8],
            tx_caps: [4; 3],
            r_rx: [2; 8],
            rx_caps: [3; 3],
        };
        let src = secrets.verified_src();
        assert_eq!(&src[..8], &[2; 8]);
        assert_eq!(&src[8..16], &[1; 8]);
        assert_eq!(&src[16..19], &[3; 3]);
        assert_eq!(&src[19..], &[4; 3]);
    }

    #[test]
    fn mcap_tags() {
        for tag in [0u8, 1, 2, 3, 4, 5, 0xff] {
            let mcap = Mcap::from_tag(tag).expect("known tag");
            assert_eq!(mcap.tag(), tag);
        }
        assert_eq!(Mcap::from_tag(6), None);
    }

    #[test]
    fn reset_ake_clears_flags() {
        let mut s = HdcpSession {
            is_repeater: true,
            is_paired: true,
            hdcp1_device_downstream: true,
            seq_num_m: 9,
            ..Default::default()
        };
        s.reset_ake();
        assert!(!s.is_repeater && !s.is_paired && !s.hdcp1_device_downstream);
        assert_eq!(s.seq_num_m, 0);
    }
}
