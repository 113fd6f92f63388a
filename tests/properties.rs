//! Cross-cutting guarantees: cipher exclusivity, sequence numbering, unplug
//! precedence, idempotent disable and cancellation through the worker.

use std::thread;
use std::time::Duration;

use rtkhdcp::ddc::Ddc;
use rtkhdcp::hdcp2::Hdcp2Flow;
use rtkhdcp::hdcp2_msg::SEQ_NUM_MAX;
use rtkhdcp::session::{Encryption, HdcpSession};
use rtkhdcp::sim::{self, SimEngine, SimHdcp2, SimSink, SimState};
use rtkhdcp::utils::wait_for;
use rtkhdcp::worker;
use rtkhdcp::{ContentProtection, EngineConfig, Error, HdcpState, RevocationList, Timings};

fn config() -> EngineConfig {
    EngineConfig {
        timings: Timings::fast(),
        ..Default::default()
    }
}

fn setup(state: &SimState) -> SimEngine {
    let mut engine = sim::engine(state, config());
    engine.init().expect("init");
    engine
}

fn assert_exclusive(engine: &SimEngine, state: &SimState) {
    let session = engine.session();
    assert!(!(session.hdcp1_encrypted() && session.hdcp2_encrypted()));
    let s = state.lock();
    assert!(
        !(s.hdcp1_encryption && s.hdcp2_cipher),
        "both ciphers on in {:?}",
        session.state
    );
}

#[test]
fn ciphers_are_never_both_on() {
    let sinks = [
        SimState::hdcp1_sink(),
        SimState::hdcp2_sink(),
        // HDCP 2.2 fails, fallback to 1.4
        {
            let s = SimState::hdcp2_sink();
            s.lock().fail("verify_hprime", Error::HPrimeMismatch);
            s
        },
    ];

    for state in &sinks {
        let mut engine = setup(state);
        assert_exclusive(&engine, state);

        engine.enable().expect("enable");
        assert_exclusive(&engine, state);
        assert_ne!(engine.session().encryption, Encryption::None);

        // switch versions without an explicit disable in between
        engine.set_force_hdcp14(true);
        engine.commit_state(ContentProtection::Enabled, ContentProtection::Undesired);
        engine.run_due(std::time::Instant::now());
        assert_exclusive(&engine, state);
        engine.commit_state(ContentProtection::Undesired, ContentProtection::Desired);
        engine.run_due(std::time::Instant::now());
        assert_exclusive(&engine, state);
        assert_eq!(engine.session().state, HdcpState::Hdcp1Success);

        engine.set_force_hdcp14(false);
        engine.enable().expect("re-enable");
        assert_exclusive(&engine, state);

        let _ = engine.check_link();
        assert_exclusive(&engine, state);

        engine.on_hotplug(false);
        assert_exclusive(&engine, state);
        assert_eq!(engine.session().encryption, Encryption::None);
    }
}

#[test]
fn seq_num_m_advances_only_on_success() {
    let state = SimState::hdcp2_sink();
    let mut ddc = Ddc::new(SimSink::new(state.clone()));
    let mut backend = SimHdcp2::new(state.clone());
    let mut session = HdcpSession::default();
    let revoked = RevocationList::new();
    let timings = Timings::fast();
    let mut flow = Hdcp2Flow {
        ddc: &mut ddc,
        backend: &mut backend,
        session: &mut session,
        revoked: &revoked,
        timings: &timings,
    };

    for expected in 1..=4 {
        flow.stream_manage().expect("stream manage");
        assert_eq!(flow.session.seq_num_m, expected);
    }

    state.lock().fail_times("verify_mprime", Error::MPrimeMismatch, 1);
    assert_eq!(flow.stream_manage(), Err(Error::MPrimeMismatch));
    assert_eq!(flow.session.seq_num_m, 4);

    flow.session.seq_num_m = SEQ_NUM_MAX;
    flow.stream_manage().expect("last sequence number");
    assert_eq!(flow.stream_manage(), Err(Error::SeqNumMRollover));
    assert_eq!(flow.session.seq_num_m, SEQ_NUM_MAX + 1);
}

#[test]
fn repeater_enable_uses_first_sequence_number() {
    let state = SimState::hdcp2_sink();
    {
        let mut s = state.lock();
        s.repeater = true;
        s.downstream = vec![[9, 8, 7, 6, 5]];
    }
    let mut engine = setup(&state);
    engine.enable().expect("enable");
    assert_eq!(engine.session().seq_num_m, 1);
    let manage = state
        .lock()
        .last_write(rtkhdcp::hdcp2_msg::REP_STREAM_MANAGE)
        .expect("stream manage sent");
    // msg id, then the 3-byte seq_num_M
    assert_eq!(&manage[1..4], &[0, 0, 0]);
}

#[test]
fn unplug_wins_over_timeout() {
    struct Port {
        hpd: bool,
    }
    let mut port = Port { hpd: true };
    let res = wait_for(
        &mut port,
        Duration::ZERO,
        Duration::from_millis(1),
        Duration::from_millis(1),
        |p| {
            p.hpd = false;
            false
        },
        |p| !p.hpd,
        |done| *done,
    );
    assert_eq!(res, Err(Error::Plugout));

    let mut port = Port { hpd: true };
    let res = wait_for(
        &mut port,
        Duration::ZERO,
        Duration::from_millis(1),
        Duration::from_millis(1),
        |_| false,
        |p| !p.hpd,
        |done| *done,
    );
    assert_eq!(res, Err(Error::WaitTimeout));
}

#[test]
fn disable_is_idempotent() {
    let prepared: [(&str, fn() -> SimState); 4] = [
        ("unauthenticated", SimState::hdcp1_sink),
        ("hdcp1", SimState::hdcp1_sink),
        ("hdcp2", SimState::hdcp2_sink),
        ("failed", || {
            let s = SimState::hdcp1_sink();
            s.lock().ri_prime = [0, 0];
            s
        }),
    ];

    for (name, make) in prepared {
        let state = make();
        let mut engine = setup(&state);
        if name != "unauthenticated" {
            let _ = engine.enable();
        }

        engine.disable();
        let after_first = engine.session().clone();
        let calls_first = state.lock().backend_calls.len();

        engine.disable();
        let after_second = engine.session();
        assert_eq!(after_second.state, after_first.state, "{name}");
        assert_eq!(after_second.value, after_first.value, "{name}");
        assert_eq!(after_second.encryption, Encryption::None, "{name}");
        // nothing left to tear down the second time
        assert_eq!(state.lock().backend_calls.len(), calls_first, "{name}");

        let s = state.lock();
        assert!(!s.hdcp1_encryption && !s.hdcp2_cipher, "{name}");
        drop(s);

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.session().state, HdcpState::Unauthenticated, "{name}");
    }

    let state = SimState::hdcp1_sink();
    state.lock().hpd = false;
    let mut engine = setup(&state);
    engine.disable();
    engine.disable();
    assert_eq!(engine.session().state, HdcpState::HdmiDisconnected);
}

#[test]
fn disable_cancels_in_flight_enable() {
    let state = SimState::hdcp2_sink();
    state.lock().stall = Some(("ake_init", Duration::from_millis(100)));
    let handle = worker::spawn(setup(&state)).expect("spawn");

    let enable_res = thread::scope(|s| {
        let enabling = s.spawn(|| handle.enable());
        thread::sleep(Duration::from_millis(20));
        handle.disable();
        enabling.join().expect("enable thread")
    });
    assert_eq!(enable_res, Err(Error::Canceled));

    let status = handle.status().expect("status");
    assert_eq!(status.state, HdcpState::Unauthenticated);
    assert_eq!(status.encryption, Encryption::None);
    assert_ne!(status.value, ContentProtection::Enabled);

    let s = state.lock();
    assert!(!s.hdcp2_cipher);
    assert!(!s.hdcp1_encryption);
    let enabled_at = s.backend_calls.iter().position(|c| *c == "enable_cipher");
    let disabled_at = s.backend_calls.iter().rposition(|c| *c == "disable_cipher");
    if let Some(enabled_at) = enabled_at {
        assert!(disabled_at.is_some_and(|d| d > enabled_at));
    }
    drop(s);

    // the engine accepts work again once the cancel completed
    handle.enable().expect("enable after cancel");
    assert!(state.lock().hdcp2_cipher);
}
