//! Integration tests: IPsec association and DTLS tunnel lifecycles.
//!
//! The simulator's call log shows which driver calls install and teardown
//! made, and in which order.

use std::net::IpAddr;
use std::sync::Arc;

use cryptoline::ddk::{CdrtDescriptor, DmaHandle, DtlsVersion, L4Match, SaDirection};
use cryptoline::offload::ipsec::IPPROTO_ESP;
use cryptoline::sim::{Call, Sim};
use cryptoline::{
    ConfigBuilder, DtlsKeys, DtlsParams, DtlsSecMode, Engine, Error, NatT, OffloadState,
    XfrmCrypto, XfrmDirection, XfrmMode, XfrmState,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn engine() -> (Arc<Sim>, Engine) {
    let sim = Sim::new(2);
    let config = ConfigBuilder::new()
        .rings(2)
        .spawn_workers(false)
        .max_tunnels(4)
        .build()
        .unwrap();
    let engine = Engine::start(config, sim.services()).unwrap();
    (sim, engine)
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn gcm_state(direction: XfrmDirection, spi: u32) -> XfrmState {
    XfrmState {
        direction,
        spi,
        proto: IPPROTO_ESP,
        src: ip("10.1.0.1"),
        dst: ip("10.2.0.1"),
        mode: XfrmMode::Tunnel,
        nat_t: None,
        crypto: XfrmCrypto::Aead {
            name: "rfc4106(gcm(aes))".into(),
            key: vec![0x5a; 20],
            icv_bits: 128,
        },
    }
}

fn cbc_sha512_state(direction: XfrmDirection, spi: u32) -> XfrmState {
    XfrmState {
        crypto: XfrmCrypto::CipherAuth {
            cipher: "cbc(aes)".into(),
            cipher_key: vec![1; 32],
            auth: "hmac(sha512)".into(),
            auth_key: vec![2; 64],
            trunc_bits: 256,
        },
        mode: XfrmMode::Transport,
        ..gcm_state(direction, spi)
    }
}

fn transforms(calls: &[Call]) -> Vec<DmaHandle> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::TransformRegister(h) => Some(*h),
            _ => None,
        })
        .collect()
}

fn cdrt_indices(calls: &[Call]) -> Vec<u16> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::CdrtAlloc(i) => Some(*i),
            _ => None,
        })
        .collect()
}

fn position(calls: &[Call], call: Call) -> usize {
    calls
        .iter()
        .position(|c| *c == call)
        .unwrap_or_else(|| panic!("{call:?} not in call log"))
}

fn dtls_params(sec_mode: DtlsSecMode) -> DtlsParams {
    let key_len = match sec_mode {
        DtlsSecMode::Aes128Gcm
        | DtlsSecMode::Aes128CbcHmacSha1
        | DtlsSecMode::Aes128CbcHmacSha256 => 16,
        _ => 32,
    };
    let gcm = matches!(sec_mode, DtlsSecMode::Aes128Gcm | DtlsSecMode::Aes256Gcm);
    let keys = |seed: u8| DtlsKeys {
        cipher: vec![seed; key_len],
        mac: if gcm { Vec::new() } else { vec![seed; 32] },
        nonce: if gcm { vec![seed; 4] } else { Vec::new() },
    };
    DtlsParams {
        version: DtlsVersion::V1_2,
        sec_mode,
        epoch: 1,
        src: ip("192.168.10.1"),
        dst: ip("192.168.10.2"),
        src_port: 5246,
        dst_port: 5246,
        capwap: true,
        encrypt: keys(0x11),
        decrypt: keys(0x22),
    }
}

// ── IPsec ───────────────────────────────────────────────────────────

#[test]
fn outbound_association_writes_cdrt() {
    let (sim, engine) = engine();
    sim.clear_calls();
    let handle = engine
        .install_association(&gcm_state(XfrmDirection::Outbound, 0x100))
        .unwrap();
    assert_eq!(engine.association_state(handle).unwrap(), OffloadState::Active);
    assert_eq!(engine.association_count(), 1);

    let calls = sim.calls();
    let [transform] = transforms(&calls)[..] else {
        panic!("expected one transform");
    };
    let [index] = cdrt_indices(&calls)[..] else {
        panic!("expected one CDRT entry");
    };
    assert!(sim.transform_registered(transform));
    let desc = sim.cdrt(index).unwrap();
    assert!(!desc.is_cleared());
    assert_eq!((desc.desc_type, desc.token_len, desc.hw_service), (3, 48, 3));
    assert_eq!(desc.transform[1], 1);
    assert_eq!(desc.transform[0] & 0x3, 0x2);
    assert!(desc.allow_pad && desc.strip_pad);
    // Outbound associations are reached through the CDRT alone.
    assert!(sim.rules().is_empty());

    let sa = sim.sa_params(transform).unwrap();
    assert_eq!(sa.direction, SaDirection::Outbound);
    assert_eq!(sa.key.len(), 16);
    assert_eq!(sa.nonce, vec![0x5a; 4]);
    assert_eq!(sa.icv_len, 16);
}

#[test]
fn inbound_association_installs_rule() {
    let (sim, engine) = engine();
    let mut state = cbc_sha512_state(XfrmDirection::Inbound, 0xbeef);
    state.nat_t = Some(NatT {
        sport: 4500,
        dport: 4500,
    });
    sim.clear_calls();
    let handle = engine.install_association(&state).unwrap();
    assert_eq!(engine.association_state(handle).unwrap(), OffloadState::Active);

    let calls = sim.calls();
    let [index] = cdrt_indices(&calls)[..] else {
        panic!("expected one CDRT entry");
    };
    // SHA-384/512 transforms use the large record layout.
    assert_eq!(sim.cdrt(index).unwrap().transform[0] & 0x3, 0x3);
    let rules = sim.rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].spi, 0xbeef);
    assert_eq!(rules[0].cdrt_index, index);
    assert_eq!(rules[0].l4, L4Match::NatT { dport: 4500 });
}

#[test]
fn teardown_unwinds_in_reverse_order() {
    let (sim, engine) = engine();
    let before = sim.live_buffers();
    sim.clear_calls();
    let handle = engine
        .install_association(&gcm_state(XfrmDirection::Inbound, 7))
        .unwrap();
    let calls = sim.calls();
    let transform = transforms(&calls)[0];
    let index = cdrt_indices(&calls)[0];
    let rule = calls
        .iter()
        .find_map(|c| match c {
            Call::RuleInstall(r) => Some(*r),
            _ => None,
        })
        .unwrap();

    sim.clear_calls();
    assert!(engine.remove_association(handle).unwrap());
    let calls = sim.calls();
    let order = [
        position(&calls, Call::RuleRemove(rule)),
        position(&calls, Call::CdrtWrite(index, CdrtDescriptor::CLEARED)),
        position(&calls, Call::Invalidate(transform)),
        position(&calls, Call::TransformUnregister(transform)),
        position(&calls, Call::DmaRelease(transform)),
        position(&calls, Call::CdrtFree(index)),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{calls:?}");

    assert_eq!(engine.association_state(handle).unwrap(), OffloadState::TearDown);
    assert_eq!(engine.association_count(), 0);
    assert_eq!(sim.cdrt_in_use(), 0);
    assert!(!sim.transform_registered(transform));
    assert_eq!(sim.live_buffers(), before);
    assert_eq!(sim.double_releases(), 0);
}

#[test]
fn removal_is_idempotent() {
    let (sim, engine) = engine();
    let handle = engine
        .install_association(&gcm_state(XfrmDirection::Outbound, 9))
        .unwrap();
    assert!(engine.remove_association(handle).unwrap());
    sim.clear_calls();
    assert!(!engine.remove_association(handle).unwrap());
    assert!(sim.calls().is_empty());

    // A new association in the same slot is not reachable through the
    // old handle.
    let fresh = engine
        .install_association(&gcm_state(XfrmDirection::Outbound, 10))
        .unwrap();
    assert_ne!(fresh, handle);
    assert_eq!(engine.association_state(handle).unwrap(), OffloadState::TearDown);
    assert!(!engine.remove_association(handle).unwrap());
    assert_eq!(engine.association_state(fresh).unwrap(), OffloadState::Active);
}

#[test]
fn failed_rule_install_rolls_back() {
    let (sim, engine) = engine();
    let before = sim.live_buffers();
    sim.faults().fail_rule_install = true;
    sim.clear_calls();
    let err = engine
        .install_association(&gcm_state(XfrmDirection::Inbound, 0x42))
        .unwrap_err();
    assert!(matches!(err, Error::Register(_)));

    let calls = sim.calls();
    let transform = transforms(&calls)[0];
    let index = cdrt_indices(&calls)[0];
    assert!(calls.contains(&Call::CdrtWrite(index, CdrtDescriptor::CLEARED)));
    assert!(calls.contains(&Call::CdrtFree(index)));
    assert!(!sim.transform_registered(transform));
    assert_eq!(sim.cdrt_in_use(), 0);
    assert_eq!(sim.live_buffers(), before);
    assert_eq!(engine.association_count(), 0);
}

#[test]
fn failed_transform_register_frees_cdrt() {
    let (sim, engine) = engine();
    sim.faults().fail_transform_register = true;
    sim.clear_calls();
    let err = engine
        .install_association(&gcm_state(XfrmDirection::Outbound, 0x43))
        .unwrap_err();
    assert!(matches!(err, Error::Register(_)));
    let calls = sim.calls();
    assert!(!calls.iter().any(|c| matches!(c, Call::Invalidate(_))));
    assert!(!calls.iter().any(|c| matches!(c, Call::CdrtWrite(..))));
    assert_eq!(sim.cdrt_in_use(), 0);
}

#[test]
fn invalid_states_are_rejected() {
    let (sim, engine) = engine();
    let mut ah = gcm_state(XfrmDirection::Outbound, 1);
    ah.proto = 51;
    assert!(matches!(engine.install_association(&ah), Err(Error::Build(_))));

    let mut mixed = gcm_state(XfrmDirection::Outbound, 1);
    mixed.dst = ip("2001:db8::1");
    assert!(matches!(engine.install_association(&mixed), Err(Error::Build(_))));

    let mut unknown = gcm_state(XfrmDirection::Outbound, 1);
    unknown.crypto = XfrmCrypto::Aead {
        name: "rfc7539esp(chacha20,poly1305)".into(),
        key: vec![0; 36],
        icv_bits: 128,
    };
    assert!(matches!(engine.install_association(&unknown), Err(Error::Build(_))));
    assert_eq!(sim.cdrt_in_use(), 0);
}

#[test]
fn tear_down_all_and_shutdown() {
    let (sim, engine) = engine();
    for spi in 0..3 {
        engine
            .install_association(&gcm_state(XfrmDirection::Inbound, spi))
            .unwrap();
    }
    engine
        .install_association(&cbc_sha512_state(XfrmDirection::Outbound, 99))
        .unwrap();
    assert_eq!(engine.association_count(), 4);
    assert_eq!(engine.tear_down_all(), 4);
    assert_eq!(engine.association_count(), 0);
    assert_eq!(sim.cdrt_in_use(), 0);
    assert!(sim.rules().is_empty());

    engine
        .install_association(&gcm_state(XfrmDirection::Outbound, 5))
        .unwrap();
    engine.shutdown();
    assert_eq!(sim.cdrt_in_use(), 0);
    assert_eq!(sim.live_buffers(), 0);
}

// ── DTLS ────────────────────────────────────────────────────────────

#[test]
fn dtls_tunnel_routes_both_directions() {
    let (sim, engine) = engine();
    let id = engine.tunnel_id(2).unwrap();
    sim.clear_calls();
    engine
        .dtls_install(id, &dtls_params(DtlsSecMode::Aes128Gcm))
        .unwrap();
    assert_eq!(engine.dtls_tunnel_count(), 1);
    assert_eq!(sim.flow_count(), 2);

    let calls = sim.calls();
    let registered = transforms(&calls);
    assert_eq!(registered.len(), 2);
    let directions: Vec<_> = registered
        .iter()
        .map(|h| sim.sa_params(*h).unwrap().direction)
        .collect();
    assert_eq!(directions, [SaDirection::Outbound, SaDirection::Inbound]);
    for h in &registered {
        assert!(calls.contains(&Call::FlowAdd(*h)));
    }
    assert_eq!(sim.sa_params(registered[0]).unwrap().nonce, vec![0x11; 4]);

    assert!(engine.dtls_remove(id).unwrap());
    assert!(!engine.dtls_remove(id).unwrap());
    assert_eq!(sim.flow_count(), 0);
    assert_eq!(engine.dtls_tunnel_count(), 0);
    assert_eq!(sim.live_buffers(), 0);
}

#[test]
fn dtls_install_replaces_occupant() {
    let (sim, engine) = engine();
    let id = engine.tunnel_id(0).unwrap();
    engine
        .dtls_install(id, &dtls_params(DtlsSecMode::Aes256CbcHmacSha256))
        .unwrap();
    let old = transforms(&sim.calls());

    sim.clear_calls();
    engine
        .dtls_install(id, &dtls_params(DtlsSecMode::Aes128Gcm))
        .unwrap();
    let calls = sim.calls();
    for h in &old {
        assert!(calls.contains(&Call::FlowRemove(*h)));
        assert!(calls.contains(&Call::TransformUnregister(*h)));
        assert!(!sim.transform_registered(*h));
    }
    assert_eq!(engine.dtls_tunnel_count(), 1);
    assert_eq!(sim.flow_count(), 2);
}

#[test]
fn dtls_duplicate_flow_is_refused() {
    let (sim, engine) = engine();
    let params = dtls_params(DtlsSecMode::Aes128Gcm);
    engine
        .dtls_install(engine.tunnel_id(0).unwrap(), &params)
        .unwrap();
    let err = engine
        .dtls_install(engine.tunnel_id(1).unwrap(), &params)
        .unwrap_err();
    assert!(matches!(err, Error::Register(_)));
    assert_eq!(engine.dtls_tunnel_count(), 1);
    assert_eq!(sim.flow_count(), 2);
}

#[test]
fn dtls_inbound_failure_rolls_back_outbound() {
    let (sim, engine) = engine();
    sim.faults().fail_flow_add = Some(SaDirection::Inbound);
    sim.clear_calls();
    let err = engine
        .dtls_install(
            engine.tunnel_id(1).unwrap(),
            &dtls_params(DtlsSecMode::Aes128CbcHmacSha1),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Register(_)));

    let calls = sim.calls();
    let [outbound, inbound] = transforms(&calls)[..] else {
        panic!("expected two transforms");
    };
    assert!(calls.contains(&Call::FlowRemove(outbound)));
    assert!(calls.contains(&Call::DmaRelease(outbound)));
    assert!(calls.contains(&Call::DmaRelease(inbound)));
    assert!(!sim.transform_registered(outbound));
    assert!(!sim.transform_registered(inbound));
    assert_eq!(sim.flow_count(), 0);
    assert_eq!(engine.dtls_tunnel_count(), 0);
    assert_eq!(sim.live_buffers(), 0);
}

#[test]
fn dtls_rejects_bad_parameters() {
    let (_sim, engine) = engine();
    let id = engine.tunnel_id(0).unwrap();
    assert!(matches!(engine.tunnel_id(4), Err(Error::InvalidTunnel)));

    let mut short_nonce = dtls_params(DtlsSecMode::Aes128Gcm);
    short_nonce.decrypt.nonce.truncate(3);
    assert!(matches!(engine.dtls_install(id, &short_nonce), Err(Error::Build(_))));

    let mut wrong_key = dtls_params(DtlsSecMode::Aes256CbcHmacSha1);
    wrong_key.encrypt.cipher.truncate(16);
    assert!(matches!(engine.dtls_install(id, &wrong_key), Err(Error::Build(_))));

    let other = dtls_params(DtlsSecMode::Other(0xc0ff));
    assert!(matches!(engine.dtls_install(id, &other), Err(Error::Build(_))));
    assert_eq!(engine.dtls_tunnel_count(), 0);
}

#[test]
fn dtls_tear_down_all() {
    let (sim, engine) = engine();
    for (i, port) in [(0, 1000), (1, 1001), (3, 1002)] {
        let mut params = dtls_params(DtlsSecMode::Aes128Gcm);
        params.dst_port = port;
        engine
            .dtls_install(engine.tunnel_id(i).unwrap(), &params)
            .unwrap();
    }
    assert_eq!(engine.dtls_tunnel_count(), 3);
    assert_eq!(sim.flow_count(), 6);
    assert_eq!(engine.dtls_tear_down_all(), 3);
    assert_eq!(engine.dtls_tunnel_count(), 0);
    assert_eq!(sim.flow_count(), 0);
    assert_eq!(sim.live_buffers(), 0);
}
