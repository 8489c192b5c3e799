//! Integration tests: cipher and AEAD requests through the full pipeline.
//!
//! Each test starts an engine on the software simulator and checks results
//! against published vectors or a decrypt round trip.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cryptoline::sim::{Call, Sim};
use cryptoline::{
    CipherAlg, CipherContext, CipherMode, CipherOutput, CipherRequest, CipherSpec, ConfigBuilder,
    Engine, Enqueued, Error, HashAlg, Result,
};
use sha2::{Digest, Sha256};

// ── Helpers ─────────────────────────────────────────────────────────

fn unhex(s: &str) -> Vec<u8> {
    let s: String = s.split_whitespace().collect();
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// Single-ring engine driven from the test thread.
fn manual_engine() -> (Arc<Sim>, Engine) {
    let sim = Sim::new(1);
    let config = ConfigBuilder::new()
        .rings(1)
        .spawn_workers(false)
        .build()
        .unwrap();
    let engine = Engine::start(config, sim.services()).unwrap();
    (sim, engine)
}

fn threaded_engine(rings: usize) -> (Arc<Sim>, Engine) {
    let sim = Sim::new(rings);
    let config = ConfigBuilder::new()
        .rings(rings)
        .notify_delay(Duration::from_micros(200))
        .build()
        .unwrap();
    let engine = Engine::start(config, sim.services()).unwrap();
    (sim, engine)
}

fn run(engine: &Engine, ctx: &Arc<CipherContext>, req: CipherRequest) -> Result<CipherOutput> {
    let ticket = engine.submit(ctx, req)?;
    engine.drive(engine.ring_id(0)?);
    ticket.wait_timeout(Duration::from_secs(5))
}

fn keyed(engine: &Engine, spec: CipherSpec, key: &[u8]) -> Arc<CipherContext> {
    let ctx = CipherContext::new(spec).unwrap();
    engine.set_key(&ctx, key).unwrap();
    ctx
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut k = key.to_vec();
    k.resize(64, 0);
    let ipad: Vec<u8> = k.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = k.iter().map(|b| b ^ 0x5c).collect();
    let inner = Sha256::new().chain_update(&ipad).chain_update(data).finalize();
    Sha256::new()
        .chain_update(&opad)
        .chain_update(inner)
        .finalize()
        .to_vec()
}

const SP800_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
const SP800_IV: &str = "000102030405060708090a0b0c0d0e0f";
const SP800_PT: &str = "6bc1bee22e409f96e93d7e117393172a ae2d8a571e03ac9c9eb76fac45af8e51
                        30c81c46a35ce411e5fbc1191a0a52ef f69f2445df4f9b17ad2b417be66c3710";
const SP800_CBC_CT: &str = "7649abac8119b246cee98e9b12e9197d 5086cb9b507219ee95db113a917678b2
                            73bed6b8e3c1743b7116e69e22229516 3ff1caa1681fac09120eca307586e1a7";

// ── Skcipher ────────────────────────────────────────────────────────

#[test]
fn cbc_known_answer_and_buffer_lifecycle() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &unhex(SP800_KEY),
    );
    let iv = unhex(SP800_IV);
    let ct = unhex(SP800_CBC_CT);

    let out = run(&engine, &ctx, CipherRequest::encrypt(&iv, unhex(SP800_PT))).unwrap();
    assert_eq!(out.data, ct);
    assert_eq!(out.next_iv.as_deref(), Some(&ct[48..]));
    // Only the encrypt SA outlives the request.
    assert_eq!(sim.live_buffers(), 1);

    let out = run(&engine, &ctx, CipherRequest::decrypt(&iv, ct.clone())).unwrap();
    assert_eq!(out.data, unhex(SP800_PT));
    assert_eq!(out.next_iv.as_deref(), Some(&ct[48..]));
    assert_eq!(sim.live_buffers(), 2);

    drop(ctx);
    assert_eq!(sim.live_buffers(), 0);
    assert_eq!(sim.double_releases(), 0);
}

#[test]
fn cbc_request_is_one_command_with_one_completion() {
    let (sim, engine) = manual_engine();
    let ring = engine.ring_id(0).unwrap();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &unhex(SP800_KEY),
    );
    sim.clear_calls();
    sim.hold_results(0, true);

    let completions = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&completions);
    let enqueued = engine
        .submit_with(
            &ctx,
            CipherRequest::encrypt(&unhex(SP800_IV), unhex(SP800_PT)),
            move |res| {
                assert_eq!(res.unwrap().data, unhex(SP800_CBC_CT));
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    assert_eq!(enqueued, Enqueued::Queued);
    assert_eq!(engine.dispatch(ring), 1);

    let submits: Vec<_> = sim
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Submit { .. }))
        .collect();
    assert!(matches!(
        submits.as_slice(),
        [Call::Submit {
            ring: 0,
            src_len: 64,
            dst_len: 64,
            ..
        }]
    ));
    assert_eq!(engine.in_flight(ring).unwrap(), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    sim.hold_results(0, false);
    assert_eq!(engine.drain(ring), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(engine.in_flight(ring).unwrap(), 0);
    assert_eq!(engine.drive(ring), 0);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[test]
fn fragmented_source_matches_contiguous() {
    let (_sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &unhex(SP800_KEY),
    );
    let pt = unhex(SP800_PT);
    let frags = vec![
        Bytes::copy_from_slice(&pt[..10]),
        Bytes::copy_from_slice(&pt[10..40]),
        Bytes::copy_from_slice(&pt[40..]),
    ];
    let req = CipherRequest::encrypt(&unhex(SP800_IV), Bytes::new()).fragments(frags);
    let out = run(&engine, &ctx, req).unwrap();
    assert_eq!(out.data, unhex(SP800_CBC_CT));
}

#[test]
fn unaligned_cbc_payload_is_rejected() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[1; 16],
    );
    let err = run(&engine, &ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 20])).unwrap_err();
    assert!(matches!(err, Error::Build(_)));
    drop(ctx);
    assert_eq!(sim.live_buffers(), 0);
}

#[test]
fn stream_modes_round_trip() {
    let (_sim, engine) = manual_engine();
    let plain: Vec<u8> = (0..77u8).collect();
    for (mode, key_len, iv_len) in [
        (CipherMode::Ctr, 20, 8),
        (CipherMode::Ofb, 24, 16),
        (CipherMode::Cfb, 32, 16),
    ] {
        let ctx = keyed(
            &engine,
            CipherSpec::skcipher(CipherAlg::Aes, mode),
            &vec![0x42; key_len],
        );
        let iv = vec![7u8; iv_len];
        let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, plain.clone())).unwrap();
        assert_eq!(sealed.data.len(), plain.len(), "{mode:?}");
        assert_ne!(sealed.data, plain, "{mode:?}");
        let opened = run(&engine, &ctx, CipherRequest::decrypt(&iv, sealed.data)).unwrap();
        assert_eq!(opened.data, plain, "{mode:?}");
    }
}

#[test]
fn ecb_known_answer() {
    let (_sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ecb),
        &unhex(SP800_KEY),
    );
    let out = run(&engine, &ctx, CipherRequest::encrypt(&[], unhex(SP800_PT))).unwrap();
    // SP 800-38A F.1.1
    assert_eq!(
        out.data,
        unhex(
            "3ad77bb40d7a3660a89ecaf32466ef97 f5d3d58503b9699de785895a96fdbaaf
             43b1cd7f598ece23881b00e3ed030688 7b0c785e27e8ad3f8223207104725dd4"
        )
    );
}

#[test]
fn key_change_builds_a_fresh_sa() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[1; 16],
    );
    let iv = [0u8; 16];
    let first = run(&engine, &ctx, CipherRequest::encrypt(&iv, vec![0u8; 32])).unwrap();
    engine.set_key(&ctx, &[2; 16]).unwrap();
    let second = run(&engine, &ctx, CipherRequest::encrypt(&iv, vec![0u8; 32])).unwrap();
    assert_ne!(first.data, second.data);

    let registered: Vec<_> = sim
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::SaRegister(_, h) => Some(h),
            _ => None,
        })
        .collect();
    assert_eq!(registered.len(), 2);
    assert_ne!(registered[0], registered[1]);
    assert!(sim.calls().contains(&Call::SaUnregister(0, registered[0])));
    assert_eq!(sim.live_buffers(), 1);
}

#[test]
fn unkeyed_context_fails() {
    let (_sim, engine) = manual_engine();
    let ctx = CipherContext::new(CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc)).unwrap();
    let err = run(&engine, &ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16])).unwrap_err();
    assert!(matches!(err, Error::Build(_)));
}

// ── AEAD ────────────────────────────────────────────────────────────

#[test]
fn gcm_known_answer() {
    let (_sim, engine) = manual_engine();
    let ctx = keyed(&engine, CipherSpec::gcm(16), &[0; 16]);
    let out = run(&engine, &ctx, CipherRequest::encrypt(&[0; 12], vec![0u8; 16])).unwrap();
    assert_eq!(out.data[..16], unhex("0388dace60b6a392f328c2b971b2fe78"));
    assert_eq!(out.data[16..], unhex("ab6e47d42cec13bdf53a67b21257bddf"));
}

#[test]
fn gcm_with_aad_round_trips_and_detects_tampering() {
    let (_sim, engine) = manual_engine();
    let ctx = keyed(&engine, CipherSpec::gcm(12), &[9; 32]);
    let iv = [3u8; 12];
    let mut msg = vec![0xAA; 20];
    msg.extend((0..50u8).map(|b| b.wrapping_mul(3)));

    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, msg.clone()).assoclen(20)).unwrap();
    assert_eq!(sealed.data.len(), 20 + 50 + 12);
    assert_eq!(sealed.data[..20], msg[..20]);

    let opened = run(
        &engine,
        &ctx,
        CipherRequest::decrypt(&iv, sealed.data.clone()).assoclen(20),
    )
    .unwrap();
    assert_eq!(opened.data, msg);

    let mut tampered = sealed.data.clone();
    tampered[5] ^= 0x01;
    let err = run(&engine, &ctx, CipherRequest::decrypt(&iv, tampered).assoclen(20)).unwrap_err();
    assert_eq!(err, Error::IntegrityFailure);

    let mut bad_tag = sealed.data;
    let last = bad_tag.len() - 1;
    bad_tag[last] ^= 0x80;
    let err = run(&engine, &ctx, CipherRequest::decrypt(&iv, bad_tag).assoclen(20)).unwrap_err();
    assert_eq!(err, Error::IntegrityFailure);
}

#[test]
fn ccm_rfc3610_packet_vector() {
    let (_sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::ccm(8),
        &unhex("c0c1c2c3c4c5c6c7c8c9cacbcccdcecf"),
    );
    // A0: L' = 1, the 13-byte nonce, counter bytes.
    let iv = unhex("01 00000003020100a0a1a2a3a4a5 0000");
    let packet = unhex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e");
    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, packet.clone()).assoclen(8)).unwrap();
    assert_eq!(
        sealed.data,
        unhex(
            "0001020304050607 588c979a61c663d2f066d0c2c0f989806d5f6b61dac384 17e8d12cfdf926e0"
        )
    );
    let opened = run(&engine, &ctx, CipherRequest::decrypt(&iv, sealed.data).assoclen(8)).unwrap();
    assert_eq!(opened.data, packet);
}

#[test]
fn rfc4106_round_trip() {
    let (_sim, engine) = manual_engine();
    let mut key = vec![0x11; 16];
    key.extend_from_slice(&[0xca, 0xfe, 0xba, 0xbe]);
    let ctx = keyed(&engine, CipherSpec::rfc4106(16), &key);
    let iv = [0x5a; 8];
    // SPI and sequence number, then the explicit IV.
    let mut msg = unhex("00001234 00000001");
    msg.extend_from_slice(&iv);
    msg.extend((0..40u8).collect::<Vec<_>>());

    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, msg.clone()).assoclen(16)).unwrap();
    assert_eq!(sealed.data.len(), 16 + 40 + 16);
    assert_eq!(sealed.data[..16], msg[..16]);
    let opened = run(
        &engine,
        &ctx,
        CipherRequest::decrypt(&iv, sealed.data.clone()).assoclen(16),
    )
    .unwrap();
    assert_eq!(opened.data, msg);

    // The IV bytes of the associated data are not authenticated.
    let mut iv_flipped = sealed.data;
    iv_flipped[12] ^= 0xff;
    let opened = run(&engine, &ctx, CipherRequest::decrypt(&iv, iv_flipped).assoclen(16)).unwrap();
    assert_eq!(opened.data[16..], msg[16..]);
}

#[test]
fn rfc4309_decrypt_realigns_associated_data() {
    let (_sim, engine) = manual_engine();
    let mut key = vec![0x22; 16];
    key.extend_from_slice(&[1, 2, 3]);
    let ctx = keyed(&engine, CipherSpec::rfc4309(16), &key);
    let iv = [0x33; 8];
    let mut msg = unhex("0000abcd 00000007");
    msg.extend_from_slice(&iv);
    msg.extend(std::iter::repeat_n(0x44, 24));

    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, msg.clone()).assoclen(16)).unwrap();
    assert_eq!(sealed.data.len(), 16 + 24 + 16);
    assert_eq!(sealed.data[..16], msg[..16]);

    let opened = run(&engine, &ctx, CipherRequest::decrypt(&iv, sealed.data).assoclen(16)).unwrap();
    assert_eq!(opened.data.len(), 16 + 24);
    assert_eq!(opened.data[..8], [0; 8]);
    assert_eq!(opened.data[8..16], msg[..8]);
    assert_eq!(opened.data[16..], msg[16..]);
}

#[test]
fn rfc4543_authenticates_everything() {
    let (_sim, engine) = manual_engine();
    let mut key = vec![0x77; 16];
    key.extend_from_slice(&[9, 9, 9, 9]);
    let ctx = keyed(&engine, CipherSpec::rfc4543(), &key);
    let iv = [1u8; 8];
    let msg: Vec<u8> = (0..48u8).collect();

    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, msg.clone()).assoclen(16)).unwrap();
    assert_eq!(sealed.data.len(), 48 + 16);
    assert_eq!(sealed.data[..48], msg[..]);
    let opened = run(
        &engine,
        &ctx,
        CipherRequest::decrypt(&iv, sealed.data.clone()).assoclen(16),
    )
    .unwrap();
    assert_eq!(opened.data, msg);

    let mut tampered = sealed.data;
    tampered[30] ^= 1;
    let err = run(&engine, &ctx, CipherRequest::decrypt(&iv, tampered).assoclen(16)).unwrap_err();
    assert_eq!(err, Error::IntegrityFailure);
}

#[test]
fn authenc_tag_is_truncated_hmac() {
    let (_sim, engine) = manual_engine();
    let ctx = CipherContext::new(CipherSpec::authenc(HashAlg::Sha256, CipherAlg::Aes, 16)).unwrap();
    let auth_key = b"authentication key".to_vec();
    engine.set_authenc_key(&ctx, &unhex(SP800_KEY), &auth_key).unwrap();

    let aad = [0xEE; 8];
    let mut msg = aad.to_vec();
    msg.extend(unhex(SP800_PT));
    let iv = unhex(SP800_IV);
    let sealed = run(&engine, &ctx, CipherRequest::encrypt(&iv, msg.clone()).assoclen(8)).unwrap();
    let ct = unhex(SP800_CBC_CT);
    assert_eq!(sealed.data[..8], aad);
    assert_eq!(sealed.data[8..72], ct[..]);
    let mut authed = aad.to_vec();
    authed.extend_from_slice(&ct);
    assert_eq!(sealed.data[72..], hmac_sha256(&auth_key, &authed)[..16]);

    let opened = run(
        &engine,
        &ctx,
        CipherRequest::decrypt(&iv, sealed.data.clone()).assoclen(8),
    )
    .unwrap();
    assert_eq!(opened.data, msg);

    let mut tampered = sealed.data;
    tampered[0] ^= 1;
    let err = run(&engine, &ctx, CipherRequest::decrypt(&iv, tampered).assoclen(8)).unwrap_err();
    assert_eq!(err, Error::IntegrityFailure);
}

#[test]
fn authenc_without_auth_key_fails() {
    let (_sim, engine) = manual_engine();
    let ctx = CipherContext::new(CipherSpec::authenc(HashAlg::Sha1, CipherAlg::Aes, 12)).unwrap();
    assert!(matches!(engine.set_key(&ctx, &[0; 16]), Err(Error::Build(_))));
    assert!(!ctx.is_keyed());
}

// ── Completion codes ────────────────────────────────────────────────

#[test]
fn warning_only_code_completes_successfully() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &unhex(SP800_KEY),
    );
    sim.inject_error(0x4003);
    let out = run(&engine, &ctx, CipherRequest::encrypt(&unhex(SP800_IV), unhex(SP800_PT))).unwrap();
    assert_eq!(out.data, unhex(SP800_CBC_CT));

    sim.inject_error(0x0010);
    let err = run(&engine, &ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16])).unwrap_err();
    assert_eq!(err, Error::HardwareFault(0x0010));
}

#[test]
fn refused_submission_fails_the_request() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[3; 16],
    );
    sim.faults().fail_submit = true;
    let err = run(&engine, &ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16])).unwrap_err();
    assert!(matches!(err, Error::Submit(_)));
    sim.faults().fail_submit = false;
    assert!(run(&engine, &ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16])).is_ok());
    drop(ctx);
    assert_eq!(sim.live_buffers(), 0);
}

// ── Queueing and completion ─────────────────────────────────────────

#[test]
fn backlog_threshold_reports_backlogged() {
    let sim = Sim::new(1);
    let config = ConfigBuilder::new()
        .rings(1)
        .spawn_workers(false)
        .backlog_threshold(2)
        .build()
        .unwrap();
    let engine = Engine::start(config, sim.services()).unwrap();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[3; 16],
    );
    let tickets: Vec<_> = (0..3)
        .map(|_| {
            engine
                .submit(&ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16]))
                .unwrap()
        })
        .collect();
    assert_eq!(tickets[0].enqueued(), Enqueued::Queued);
    assert_eq!(tickets[2].enqueued(), Enqueued::Backlogged);
    engine.drive(engine.ring_id(0).unwrap());
    for t in tickets {
        assert!(t.wait().is_ok());
    }
}

#[test]
fn bad_requests_do_not_stall_the_ring() {
    let (_sim, engine) = threaded_engine(1);
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr),
        &[5; 20],
    );
    let overflowing = CipherRequest::encrypt(&[0; 8], vec![0u8; 16])
        .assoclen(1)
        .cryptlen(usize::MAX);
    let oversized = CipherRequest::encrypt(&[0; 8], vec![0u8; 200_000]);
    for req in [overflowing, oversized] {
        let res = engine
            .submit(&ctx, req)
            .unwrap()
            .wait_timeout(Duration::from_secs(5));
        assert!(matches!(res, Err(Error::Build(_))));
    }
    let out = engine
        .submit(&ctx, CipherRequest::encrypt(&[0; 8], vec![0u8; 16]))
        .unwrap()
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(out.data.len(), 16);
}

#[test]
fn results_complete_in_submission_order() {
    let (_sim, engine) = threaded_engine(2);
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr),
        &[5; 20],
    );
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..64usize {
        let tx = tx.clone();
        engine
            .submit_with(
                &ctx,
                CipherRequest::encrypt(&[i as u8; 8], vec![i as u8; 32]),
                move |res| {
                    tx.send((i, res.is_ok())).unwrap();
                },
            )
            .unwrap();
    }
    let order: Vec<_> = (0..64)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert!(order.iter().all(|(_, ok)| *ok));
    let indices: Vec<_> = order.into_iter().map(|(i, _)| i).collect();
    assert_eq!(indices, (0..64).collect::<Vec<_>>());
}

#[test]
fn threaded_engine_waits_on_tickets() {
    let (_sim, engine) = threaded_engine(4);
    let ctx = keyed(&engine, CipherSpec::gcm(16), &[0; 16]);
    let out = engine
        .submit(&ctx, CipherRequest::encrypt(&[0; 12], vec![0u8; 16]))
        .unwrap()
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(out.data[16..], unhex("ab6e47d42cec13bdf53a67b21257bddf"));
}

#[test]
fn concurrent_drain_and_poll_complete_each_result_once() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[8; 16],
    );
    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let completed = Arc::clone(&completed);
        engine
            .submit_with(
                &ctx,
                CipherRequest::encrypt(&[0; 16], vec![1u8; 48]),
                move |res| {
                    assert!(res.is_ok());
                    completed.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }
    let ring = engine.ring_id(0).unwrap();
    assert_eq!(engine.dispatch(ring), 200);

    std::thread::scope(|s| {
        s.spawn(|| {
            while engine.in_flight(ring).unwrap() > 0 {
                engine.drain(ring);
            }
        });
        s.spawn(|| {
            while engine.in_flight(ring).unwrap() > 0 {
                let _ = engine.harvest_polled(ring);
            }
        });
    });
    assert_eq!(completed.load(Ordering::SeqCst), 200);
    assert_eq!(sim.double_releases(), 0);
    drop(ctx);
    assert_eq!(sim.live_buffers(), 0);
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn shutdown_fails_queued_and_in_flight_requests() {
    let (sim, engine) = manual_engine();
    let ctx = keyed(
        &engine,
        CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
        &[4; 16],
    );
    let ring = engine.ring_id(0).unwrap();
    sim.hold_results(0, true);
    let in_flight = engine
        .submit(&ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16]))
        .unwrap();
    engine.dispatch(ring);
    assert_eq!(engine.in_flight(ring).unwrap(), 1);
    assert_eq!(sim.pending_results(0), 1);
    let queued = engine
        .submit(&ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16]))
        .unwrap();
    assert_eq!(engine.queued(ring).unwrap(), 1);

    engine.shutdown();
    assert_eq!(in_flight.wait(), Err(Error::Shutdown));
    assert_eq!(queued.wait(), Err(Error::Shutdown));
    assert!(matches!(
        engine.submit(&ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 16])),
        Err(Error::Shutdown)
    ));
    engine.shutdown();

    drop(ctx);
    assert_eq!(sim.live_buffers(), 0);
}

#[test]
fn engine_rejects_more_rings_than_hardware() {
    let sim = Sim::new(2);
    let config = ConfigBuilder::new().rings(4).build().unwrap();
    assert!(matches!(
        Engine::start(config, sim.services()),
        Err(Error::Config(_))
    ));
}
