//! End-to-end authentication scenarios against the simulated sink.

use rtkhdcp::session::Encryption;
use rtkhdcp::sim::{self, RecordingListener, SimEngine, SimState};
use rtkhdcp::{
    ContentProtection, EngineConfig, Error, HdcpState, Mcap, RevocationList, SinkVersion, Timings,
};

fn config() -> EngineConfig {
    EngineConfig {
        timings: Timings::fast(),
        ..Default::default()
    }
}

fn setup(state: &SimState, revoked: RevocationList) -> (SimEngine, RecordingListener) {
    let listener = RecordingListener::default();
    let mut engine = sim::engine(state, config())
        .with_revocation_list(revoked)
        .with_listener(listener.clone());
    engine.init().expect("init");
    (engine, listener)
}

#[test]
fn hdcp2_receiver_reaches_success() {
    let state = SimState::hdcp2_sink();
    let (mut engine, listener) = setup(&state, RevocationList::new());

    engine.enable().expect("enable");
    assert_eq!(engine.session().state, HdcpState::Hdcp2Success);
    assert!(engine.session().hdcp2_encrypted());
    assert_eq!(engine.session().sink_version, SinkVersion::Hdcp2);

    let s = state.lock();
    assert_eq!(s.count_calls("enable_cipher"), 1);
    assert_eq!(s.cipher_enables, vec![Mcap::V2_2]);
    assert!(s.hdcp2_cipher);
    assert!(!s.hdcp1_encryption);
    drop(s);

    assert_eq!(
        listener.states(),
        vec![HdcpState::Hdcp2InAuth, HdcpState::Hdcp2Success]
    );
    assert_eq!(listener.content_protection(), vec![ContentProtection::Enabled]);
}

#[test]
fn hdcp1_receiver_reaches_success() {
    let state = SimState::hdcp1_sink();
    let (mut engine, listener) = setup(&state, RevocationList::new());

    engine.enable().expect("enable");
    assert_eq!(engine.session().state, HdcpState::Hdcp1Success);
    assert!(engine.session().hdcp1_encrypted());
    assert!(state.lock().hdcp1_encryption);
    assert_eq!(state.lock().count_calls("ake_init"), 0);
    assert_eq!(
        listener.states(),
        vec![HdcpState::Hdcp1InAuth, HdcpState::Hdcp1Success]
    );
}

#[test]
fn revoked_bksv_fails_before_r0_wait() {
    let state = SimState::hdcp1_sink();
    let bksv = state.lock().bksv;
    let revoked: RevocationList = [bksv].into_iter().collect();
    let (mut engine, listener) = setup(&state, revoked);

    assert_eq!(engine.enable(), Err(Error::RevokedBksv));
    assert_eq!(engine.session().state, HdcpState::Hdcp1Failure);
    assert_eq!(engine.session().error, Some(Error::RevokedBksv));
    assert!(!engine.session().hdcp1_encrypted());

    let s = state.lock();
    assert_eq!(s.reads_at(0x08), 0);
    assert_eq!(s.count_calls("check_ri"), 0);
    assert!(!s.hdcp1_encryption);
    drop(s);

    let last = listener.events().pop().expect("failure event");
    assert_eq!(last.envp()[1], "HDCP_ERR=103");
}

#[test]
fn unplug_mid_ake_reports_disconnect() {
    let state = SimState::hdcp2_sink();
    state.lock().unplug_after_write = Some(2);
    let (mut engine, listener) = setup(&state, RevocationList::new());

    assert_eq!(engine.enable(), Err(Error::Plugout));
    assert_eq!(engine.session().state, HdcpState::HdmiDisconnected);
    assert_eq!(engine.session().encryption, Encryption::None);

    let s = state.lock();
    assert_eq!(s.count_calls("ake_init"), 1);
    // no HDCP 1.4 fallback
    assert_eq!(s.count_calls("generate_an"), 0);
    assert!(s.cipher_enables.is_empty());
    drop(s);

    assert_eq!(
        listener.states(),
        vec![HdcpState::Hdcp2InAuth, HdcpState::HdmiDisconnected]
    );
    // nothing to retry after an unplug
    assert_eq!(engine.next_deadline(), None);
}

fn repeater_engine() -> (SimState, SimEngine) {
    let state = SimState::hdcp2_sink();
    {
        let mut s = state.lock();
        s.repeater = true;
        s.downstream = vec![[1, 2, 3, 4, 5]];
    }
    let (mut engine, _) = setup(&state, RevocationList::new());
    engine.enable().expect("repeater enable");
    assert!(engine.session().is_repeater);
    (state, engine)
}

#[test]
fn topology_change_reruns_repeater_flow() {
    let (state, mut engine) = repeater_engine();
    let lists_before = state.lock().count_calls("verify_receiver_id_list");
    {
        let mut s = state.lock();
        s.downstream.push([6, 7, 8, 9, 10]);
        s.hdcp1_downstream = true;
        s.signal_topology_change();
    }

    engine.check_link().expect("topology handled in place");
    assert_eq!(engine.session().state, HdcpState::Hdcp2Success);
    assert_eq!(engine.session().mcap, Mcap::V1);

    let s = state.lock();
    assert_eq!(s.cipher_disables, 0);
    assert_eq!(s.count_calls("ake_init"), 1);
    assert_eq!(s.count_calls("verify_receiver_id_list"), lists_before + 1);
    assert_eq!(s.mcap_updates.last(), Some(&Mcap::V1));
    assert!(s.hdcp2_cipher);
}

#[test]
fn topology_change_failure_disables_once() {
    let (state, mut engine) = repeater_engine();
    {
        let mut s = state.lock();
        s.max_devs_exceeded = true;
        s.signal_topology_change();
    }

    assert_eq!(engine.check_link(), Err(Error::Hdcp2MaxDevice));
    assert_eq!(engine.session().state, HdcpState::Hdcp2Failure);
    assert_eq!(engine.session().value, ContentProtection::Desired);
    assert_eq!(engine.session().encryption, Encryption::None);

    let s = state.lock();
    assert_eq!(s.cipher_disables, 1);
    assert!(!s.hdcp2_cipher);
    drop(s);

    // protection is still desired, so a re-enable is pending
    assert!(engine.next_deadline().is_some());
}

#[test]
fn reauth_request_fails_link() {
    let state = SimState::hdcp2_sink();
    let (mut engine, _) = setup(&state, RevocationList::new());
    engine.enable().expect("enable");

    state.lock().reauth_req = true;
    assert_eq!(engine.check_link(), Err(Error::ReauthRequest));
    assert_eq!(engine.session().state, HdcpState::Hdcp2Failure);
    assert_eq!(state.lock().cipher_disables, 1);
}

#[test]
fn hdcp1_repeater_with_downstream() {
    let state = SimState::hdcp1_sink();
    {
        let mut s = state.lock();
        s.repeater = true;
        s.downstream = vec![[0x0f, 0xff, 0x0f, 0x00, 0xf0]];
    }
    let (mut engine, _) = setup(&state, RevocationList::new());
    engine.enable().expect("enable");
    assert_eq!(engine.session().state, HdcpState::Hdcp1Success);
    assert!(engine.session().is_repeater);
    assert!(engine.hdcp_info().contains("is_repeater: yes\n"));
    assert_eq!(state.lock().count_calls("verify_v"), 1);
}

#[test]
fn sink_without_hdcp_reports_not_supported() {
    let state = SimState::hdcp1_sink();
    state.lock().hdcp1 = false;
    let (mut engine, _) = setup(&state, RevocationList::new());

    assert_eq!(engine.enable(), Err(Error::Hdcp1NotSupported));
    assert_eq!(engine.session().state, HdcpState::Hdcp1Failure);
    assert_eq!(engine.hdcp_state(), "STATE=HDCP1_FAILURE\nHDCP_ERR=100\n");
    assert_eq!(state.lock().count_calls("generate_an"), 0);
}

#[test]
fn hdcp1_v_mismatch_fails() {
    let state = SimState::hdcp1_sink();
    {
        let mut s = state.lock();
        s.repeater = true;
        s.v_prime = [0; 20];
    }
    let (mut engine, _) = setup(&state, RevocationList::new());
    assert_eq!(engine.enable(), Err(Error::VMismatch));
    assert_eq!(engine.session().state, HdcpState::Hdcp1Failure);
    assert!(!state.lock().hdcp1_encryption);
}
