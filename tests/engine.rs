//! End to end tests driving the engine against a mock device that pumps
//! the data rings and produces completion entries.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use wifi_dp_tx::*;

static NOW: AtomicU32 = AtomicU32::new(0);
fn ticks() -> u32 {
    NOW.load(Ordering::Relaxed)
}

fn small_config() -> TxConfig {
    TxConfig {
        num_pools: 1,
        pool_size: 8,
        ext_pool_size: 4,
        num_data_rings: 1,
        data_ring_size: 4,
        comp_ring_size: 8,
        initial_credit: 8,
        credit_lwm: 1,
        ticks,
        ..TxConfig::default()
    }
}

fn engine_with_vdev(cfg: TxConfig) -> TxEngine {
    let engine = TxEngine::new(cfg).unwrap();
    engine
        .vdev_attach(VdevConfig {
            vdev_id: 0,
            fl_lwm: 0,
            fl_hwm: 2,
            ..VdevConfig::default()
        })
        .unwrap();
    engine
}

fn frame(len: usize) -> NetBuf {
    NetBuf::new(vec![0xabu8; len])
}

/// Device side: consume everything on the data ring, returning the
/// descriptor IDs in submission order.
fn pump_data_ring(engine: &TxEngine, ring: usize) -> Vec<u32> {
    let mut access = engine.data_ring(ring).begin_access().unwrap();
    let mut ids = Vec::new();
    while let Some(entry) = access.consume_next() {
        ids.push(entry.buffer.desc_id());
    }
    ids
}

/// Device side: push a hardware-released completion entry.
fn push_hw_completion(engine: &TxEngine, ring: usize, desc_id: u32, reason: HwReleaseReason) {
    let mut access = engine.comp_ring(ring).begin_access().unwrap();
    *access.produce_next().unwrap() = CompletionInfo::new()
        .with_desc_id(desc_id)
        .with_release_source(ReleaseSource::Hw.into_bits())
        .with_release_reason(reason.into_bits());
}

/// Device side: push a firmware-released completion entry.
fn push_fw_completion(engine: &TxEngine, ring: usize, desc_id: u32, status: FwTxStatus) {
    let mut access = engine.comp_ring(ring).begin_access().unwrap();
    *access.produce_next().unwrap() = CompletionInfo::new()
        .with_desc_id(desc_id)
        .with_release_source(ReleaseSource::Fw.into_bits())
        .with_fw_status(status.into_bits() as u32);
}

#[test]
fn full_lifecycle_acked_frame() {
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);
    let credit = engine.credit_available();

    engine.send(0, frame(64)).unwrap();
    assert_eq!(engine.num_free_desc(0), pool_size - 1);
    assert_eq!(engine.credit_available(), credit - 1);
    assert_eq!(engine.outstanding(), 1);

    let ids = pump_data_ring(&engine, 0);
    assert_eq!(ids.len(), 1);

    engine.download_done(ids[0], true);
    // Still held, the transmit completion is outstanding.
    assert_eq!(engine.num_free_desc(0), pool_size - 1);

    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    assert_eq!(engine.drain_completions(0, 32), 1);

    assert_eq!(engine.num_free_desc(0), pool_size);
    assert_eq!(engine.credit_available(), credit);
    assert_eq!(engine.outstanding(), 0);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().comp_ok.get(), 1);
    assert_eq!(vdev.stats().completed.get(), 1);
}

#[test]
fn release_is_order_independent() {
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);

    // Transmit completion before download-done.
    engine.send(0, frame(32)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);
    assert_eq!(engine.num_free_desc(0), pool_size - 1);
    engine.download_done(ids[0], true);
    assert_eq!(engine.num_free_desc(0), pool_size);

    // Download-done before transmit completion.
    engine.send(0, frame(32)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    assert_eq!(engine.num_free_desc(0), pool_size - 1);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);
    assert_eq!(engine.num_free_desc(0), pool_size);
}

#[test]
fn batch_rejects_unwind_cleanly() {
    // Ring of 4 entries, so a batch of 6 has the tail rejected.
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);
    let credit = engine.credit_available();

    let frames: Vec<NetBuf> = (0..6).map(|_| frame(64)).collect();
    let rejected = engine.send_batch(0, frames);
    assert_eq!(rejected.len(), 2);

    // Rejected frames left nothing behind.
    assert_eq!(engine.num_free_desc(0), pool_size - 4);
    assert_eq!(engine.credit_available(), credit - 4);
    assert_eq!(engine.outstanding(), 4);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().drop_ring_full.get(), 2);
    assert_eq!(vdev.stats().enqueued.get(), 4);
}

#[test]
fn pool_exhaustion_hands_the_frame_back() {
    let mut cfg = small_config();
    cfg.pool_size = 2;
    let engine = engine_with_vdev(cfg);

    engine.send(0, frame(16)).unwrap();
    engine.send(0, frame(16)).unwrap();
    let (err, returned) = engine.send(0, frame(16)).unwrap_err();
    assert_eq!(err, TxError::NoDescriptors);
    assert_eq!(returned.len(), 16);
    assert_eq!(engine.num_free_desc(0), 0);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().drop_no_desc.get(), 1);

    // Freeing one descriptor makes exactly one submission succeed again.
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);
    engine.send(0, returned).unwrap();
    assert!(engine.send(0, frame(16)).is_err());
}

#[test]
fn credit_exhaustion_blocks_and_recovers() {
    let mut cfg = small_config();
    cfg.initial_credit = 1;
    let engine = engine_with_vdev(cfg);

    engine.send(0, frame(16)).unwrap();
    let (err, _frame) = engine.send(0, frame(16)).unwrap_err();
    assert_eq!(err, TxError::NoCredit);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().drop_no_credit.get(), 1);

    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);

    assert_eq!(engine.credit_available(), 1);
    engine.send(0, frame(16)).unwrap();
}

#[test]
fn download_failure_frees_immediately_and_restores_credit() {
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);
    let credit = engine.credit_available();

    engine.send(0, frame(64)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], false);

    assert_eq!(engine.num_free_desc(0), pool_size);
    assert_eq!(engine.credit_available(), credit);
    assert_eq!(engine.outstanding(), 0);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().drop_download_fail.get(), 1);
}

#[test]
fn drain_respects_budget() {
    let engine = engine_with_vdev(small_config());
    for _ in 0..3 {
        engine.send(0, frame(32)).unwrap();
    }
    let ids = pump_data_ring(&engine, 0);
    for &id in &ids {
        engine.download_done(id, true);
        push_hw_completion(&engine, 0, id, HwReleaseReason::Acked);
    }
    assert_eq!(engine.drain_completions(0, 2), 2);
    assert_eq!(engine.outstanding(), 1);
    assert_eq!(engine.drain_completions(0, 2), 1);
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(engine.stats().drain_budget_hit.get(), 1);
}

#[test]
fn fw_reinject_resubmits_the_frame() {
    let engine = engine_with_vdev(small_config());

    engine.send(0, frame(128)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    push_fw_completion(&engine, 0, ids[0], FwTxStatus::Reinject);
    engine.drain_completions(0, 32);

    // The original descriptor was released and the frame went back out.
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().reinjected.get(), 1);
    assert_eq!(engine.outstanding(), 1);
    let resubmitted = pump_data_ring(&engine, 0);
    assert_eq!(resubmitted.len(), 1);
}

#[test]
fn completion_message_batch_and_inspect() {
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);

    for _ in 0..3 {
        engine.send(0, frame(32)).unwrap();
    }
    let ids = pump_data_ring(&engine, 0);
    for &id in &ids {
        engine.download_done(id, true);
    }
    engine.completion_handler(TxStatus::Ok, &ids[..2]);
    engine.inspect_handler(&ids[2..]);

    assert_eq!(engine.num_free_desc(0), pool_size);
    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().comp_ok.get(), 3);
    assert_eq!(vdev.stats().inspected.get(), 1);
}

#[test]
fn no_free_buffer_is_handed_back() {
    let engine = engine_with_vdev(small_config());
    let returned: Arc<Mutex<Vec<(usize, TxStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&returned);
    engine.register_nonstd_completion(Box::new(move |nbuf, status| {
        sink.lock().unwrap().push((nbuf.len(), status));
    }));

    engine
        .send_nonstd(
            0,
            frame(96),
            TxSpec {
                no_free: true,
                ..TxSpec::default()
            },
        )
        .unwrap();
    assert_eq!(engine.exceptions_outstanding(), 1);
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    engine.completion_handler(TxStatus::Ok, &ids);

    let returned = returned.lock().unwrap();
    assert_eq!(returned.as_slice(), &[(96, TxStatus::Ok)]);
    assert_eq!(engine.exceptions_outstanding(), 0);
}

#[test]
fn mgmt_callbacks_fire() {
    let engine = engine_with_vdev(small_config());
    let downloads: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let otas: Arc<Mutex<Vec<TxStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let dl_sink = Arc::clone(&downloads);
    let ota_sink = Arc::clone(&otas);
    engine
        .register_mgmt_callbacks(
            2,
            MgmtCallbacks {
                download_cb: Some(Box::new(move |failed| {
                    dl_sink.lock().unwrap().push(failed);
                })),
                ota_cb: Some(Box::new(move |_nbuf, status| {
                    ota_sink.lock().unwrap().push(status);
                })),
            },
        )
        .unwrap();

    engine.send_mgmt(0, frame(48), 2).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::NoAck);
    engine.drain_completions(0, 32);

    assert_eq!(downloads.lock().unwrap().as_slice(), &[false]);
    assert_eq!(otas.lock().unwrap().as_slice(), &[TxStatus::NoAck]);
}

#[test]
fn flow_control_pauses_and_resumes() {
    let mut cfg = small_config();
    cfg.pool_size = 4;
    let engine = TxEngine::new(cfg).unwrap();
    engine
        .vdev_attach(VdevConfig {
            vdev_id: 0,
            fl_lwm: 1,
            fl_hwm: 2,
            ..VdevConfig::default()
        })
        .unwrap();
    let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine
        .register_flow_control(
            0,
            Box::new(move |resume| sink.lock().unwrap().push(resume)),
        )
        .unwrap();

    // Fill the pool down to the low watermark.
    for _ in 0..3 {
        engine.send(0, frame(16)).unwrap();
    }
    let vdev = engine.vdev(0).unwrap();
    assert!(vdev.is_paused());
    assert_eq!(events.lock().unwrap().as_slice(), &[false]);

    let ids = pump_data_ring(&engine, 0);
    for &id in &ids {
        engine.download_done(id, true);
        push_hw_completion(&engine, 0, id, HwReleaseReason::Acked);
    }
    engine.drain_completions(0, 32);
    assert!(!vdev.is_paused());
    assert_eq!(events.lock().unwrap().as_slice(), &[false, true]);
}

#[test]
fn nonlinear_frame_consumes_and_releases_scatter_desc() {
    let engine = engine_with_vdev(small_config());
    let nbuf = NetBuf::from_segments(vec![vec![0u8; 32], vec![0u8; 64], vec![0u8; 16]]).unwrap();
    engine.send(0, nbuf).unwrap();

    let ids = {
        let mut access = engine.data_ring(0).begin_access().unwrap();
        let entry = access.consume_next().unwrap();
        assert!(entry.frame.extension());
        vec![entry.buffer.desc_id()]
    };
    engine.download_done(ids[0], true);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);

    let vdev = engine.vdev(0).unwrap();
    assert_eq!(vdev.stats().sg_pkts.get(), 1);
    assert_eq!(vdev.stats().completed.get(), 1);
}

#[test]
fn stale_completion_is_skipped() {
    let engine = engine_with_vdev(small_config());
    // A completion for a descriptor that was never submitted.
    push_hw_completion(&engine, 0, 3, HwReleaseReason::Acked);
    assert_eq!(engine.drain_completions(0, 32), 1);
    assert_eq!(engine.stats().stale_completion.get(), 1);
    assert_eq!(engine.outstanding(), 0);
}

#[test]
fn single_completion_honors_outstanding_references() {
    let engine = engine_with_vdev(small_config());
    let pool_size = engine.num_free_desc(0);
    let credit = engine.credit_available();

    // Completion before download-done: the slot must stay held, a reuse
    // before the second signal would let a stale download-done free
    // somebody else's frame.
    engine.send(0, frame(24)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.single_completion_handler(TxStatus::Ok, ids[0]);
    assert_eq!(engine.num_free_desc(0), pool_size - 1);
    // The target gave its copy up already.
    assert_eq!(engine.credit_available(), credit);
    engine.download_done(ids[0], true);
    assert_eq!(engine.num_free_desc(0), pool_size);
    assert_eq!(engine.outstanding(), 0);

    // Download-done before completion: the single completion frees.
    engine.send(0, frame(24)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    assert_eq!(engine.num_free_desc(0), pool_size - 1);
    engine.single_completion_handler(TxStatus::Ok, ids[0]);
    assert_eq!(engine.num_free_desc(0), pool_size);
    assert_eq!(engine.credit_available(), credit);
}

#[test]
fn credit_update_applies_delta() {
    let engine = engine_with_vdev(small_config());
    let credit = engine.credit_available();
    engine.credit_update_handler(-3);
    assert_eq!(engine.credit_available(), credit - 3);
    engine.credit_update_handler(3);
    assert_eq!(engine.credit_available(), credit);
}

#[cfg(feature = "tx-delay")]
#[test]
fn delay_accounting_sees_completed_frames() {
    let engine = engine_with_vdev(small_config());
    engine.set_delay_avg_period(1);

    engine.send(0, frame(32)).unwrap();
    let ids = pump_data_ring(&engine, 0);
    engine.download_done(ids[0], true);
    push_hw_completion(&engine, 0, ids[0], HwReleaseReason::Acked);
    engine.drain_completions(0, 32);

    let (count, lost) = engine.delay_packet_counts(0).unwrap();
    assert_eq!((count, lost), (1, 0));
    assert!(engine.delay_packet_counts(NUM_DELAY_CATEGORIES).is_none());
}
