use std::sync::Arc;

use duracheck_dispatch::{Checker, Event, Outcome};
use duracheck_session::{NullStackSource, Options, ThreadId, TxId};
use duracheck_track::{MemRegion, RegionCover, StoreState};
use duracheck_tx::TxError;
use pretty_assertions::assert_eq;
use smallvec::smallvec;

const T1: ThreadId = ThreadId(1);
const T2: ThreadId = ThreadId(2);

fn checker(options: Options) -> Checker {
    Checker::new(options, Arc::new(NullStackSource))
}

fn handle(checker: &mut Checker, event: Event) -> Outcome {
    checker.handle_event(T1, event).expect("no diagnostic overflow expected")
}

fn states(checker: &Checker) -> Vec<(MemRegion, StoreState)> {
    checker.store_tracker().stores().map(|s| (s.region, s.state)).collect()
}

#[test]
fn store_walks_the_full_state_machine() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 1 });
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Dirty)]);

    handle(&mut c, Event::Flush { addr: 0, size: 8 });
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Flushed)]);

    handle(&mut c, Event::Fence);
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Fenced)]);

    handle(&mut c, Event::Commit);
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Committed)]);

    handle(&mut c, Event::Fence);
    assert_eq!(states(&c), vec![]);
    assert_eq!(c.error_count(), 0);
}

#[test]
fn stores_outside_registered_mappings_are_dropped() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 1 });
    assert_eq!(states(&c), vec![]);

    handle(&mut c, Event::RegisterMapping { addr: 0x1000, size: 0x100 });
    // partial overlap with the mapping is enough to be tracked, in full
    handle(&mut c, Event::Store { addr: 0xffc, size: 8, value: 1 });
    assert_eq!(states(&c), vec![(MemRegion::new(0xffc, 8), StoreState::Dirty)]);
}

#[test]
fn repeated_flushes_are_redundant() {
    let mut c = checker(Options {
        check_flush: true,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 1 });
    handle(&mut c, Event::Flush { addr: 0, size: 64 });
    handle(&mut c, Event::Flush { addr: 0, size: 64 });
    handle(&mut c, Event::Fence);
    handle(&mut c, Event::Flush { addr: 0, size: 64 });

    let stores = c.store_tracker();
    assert_eq!(stores.redundant_flushes().len(), 2);
    assert_eq!(stores.superfluous_flushes().len(), 0);
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Fenced)]);
}

#[test]
fn a_flush_covering_no_store_is_superfluous() {
    let mut c = checker(Options {
        check_flush: true,
        ..Options::default()
    });
    handle(&mut c, Event::Flush { addr: 0, size: 64 });

    let stores = c.store_tracker();
    assert_eq!(stores.superfluous_flushes().len(), 1);
    assert_eq!(stores.redundant_flushes().len(), 0);
    assert_eq!(stores.overwrites().len(), 0);
    assert_eq!(c.error_count(), 1);
}

#[test]
fn stores_outside_their_transaction_are_reported() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::BeginTx { tx: Some(TxId(1)) });
    assert_eq!(
        handle(&mut c, Event::AddObj { tx: TxId(1), addr: 0, size: 16 }),
        Outcome::Tx(Ok(()))
    );
    handle(&mut c, Event::Store { addr: 32, size: 4, value: 7 });
    assert_eq!(handle(&mut c, Event::EndTx { tx: Some(TxId(1)) }), Outcome::Tx(Ok(())));

    let oot = c.tx_tracker().oot_stores();
    assert_eq!(oot.len(), 1);
    assert_eq!(oot[0].region, MemRegion::new(32, 4));
}

#[test]
fn overlapping_members_of_two_transactions_are_reported_once() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::BeginTx { tx: Some(TxId(1)) });
    handle(&mut c, Event::BeginTx { tx: Some(TxId(2)) });
    handle(&mut c, Event::AddObj { tx: TxId(1), addr: 0, size: 32 });
    handle(&mut c, Event::AddObj { tx: TxId(2), addr: 16, size: 32 });

    let events = c.tx_tracker().cross_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].original.tx, TxId(1));
    assert_eq!(events[0].duplicate.tx, TxId(2));
}

#[test]
fn forced_alignment_widens_flushes_to_cache_lines() {
    let mut c = checker(Options {
        check_flush: true,
        force_flush_align: true,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 0x100 });

    // [0x10, 0x17) alone would miss the store at 0; widened it covers it
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 1 });
    handle(&mut c, Event::Flush { addr: 0x10, size: 7 });
    assert_eq!(states(&c), vec![(MemRegion::new(0, 8), StoreState::Flushed)]);
    assert_eq!(c.store_tracker().superfluous_flushes().len(), 0);

    // [0x20, 0x77) widens to [0x00, 0x80)
    handle(&mut c, Event::Store { addr: 0x78, size: 8, value: 2 });
    handle(&mut c, Event::Flush { addr: 0x20, size: 87 });
    assert_eq!(
        states(&c),
        vec![
            (MemRegion::new(0, 8), StoreState::Flushed),
            (MemRegion::new(0x78, 8), StoreState::Flushed),
        ]
    );
    assert_eq!(c.store_tracker().redundant_flushes().len(), 1);
}

#[test]
fn a_missed_flush_leaves_a_dangling_sliver() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 0x100 });
    handle(&mut c, Event::Store { addr: 0x20, size: 16, value: 7 });
    // only the first half of the store is ever written back
    handle(&mut c, Event::Flush { addr: 0x20, size: 8 });
    handle(&mut c, Event::Fence);
    handle(&mut c, Event::Commit);
    handle(&mut c, Event::Fence);

    assert_eq!(states(&c), vec![(MemRegion::new(0x28, 8), StoreState::Dirty)]);
    assert_eq!(c.error_count(), 1);

    let mut out = Vec::new();
    c.write_report(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("Number of stores not made persistent: 1"));
    assert!(report.contains("\tAddress: 0x28\tsize: 8\tstate: DIRTY"));
}

#[test]
fn mappings_can_be_enumerated() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0x1000, size: 0x100 });
    handle(&mut c, Event::RegisterMapping { addr: 0x3000, size: 0x40 });

    let mut out = Vec::new();
    c.write_mappings(&mut out).unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Registered persistent memory regions:\n\
         [0] Mapping base: 0x1000\tsize: 256\n\
         [1] Mapping base: 0x3000\tsize: 64\n"
    );
}

#[test]
fn check_mapping_classifies_coverage() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0x1000, size: 0x100 });

    assert_eq!(
        handle(&mut c, Event::CheckMapping { addr: 0x1010, size: 0x10 }),
        Outcome::Cover(RegionCover::Full)
    );
    assert_eq!(
        handle(&mut c, Event::CheckMapping { addr: 0x10f0, size: 0x20 }),
        Outcome::Cover(RegionCover::Partial)
    );
    assert_eq!(
        handle(&mut c, Event::CheckMapping { addr: 0x2000, size: 0x10 }),
        Outcome::Cover(RegionCover::Absent)
    );

    handle(&mut c, Event::RemoveMapping { addr: 0x1000, size: 0x100 });
    assert_eq!(
        handle(&mut c, Event::CheckMapping { addr: 0x1010, size: 0x10 }),
        Outcome::Cover(RegionCover::Absent)
    );
}

#[test]
fn transaction_ids_default_to_the_running_thread() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::BeginTx { tx: None });
    assert_eq!(c.tx_tracker().active_count(), 1);
    assert_eq!(c.tx_tracker().active().next().unwrap().id(), TxId(1));

    assert_eq!(handle(&mut c, Event::EndTx { tx: None }), Outcome::Tx(Ok(())));
    assert_eq!(
        handle(&mut c, Event::EndTx { tx: None }),
        Outcome::Tx(Err(TxError::NoSuchTx(TxId(1))))
    );
}

#[test]
fn attach_makes_a_foreign_thread_a_participant() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::BeginTx { tx: Some(TxId(5)) });
    handle(&mut c, Event::AddObj { tx: TxId(5), addr: 0, size: 64 });

    // a second thread may not touch the transaction before attaching
    assert_eq!(
        c.handle_event(T2, Event::AddObj { tx: TxId(5), addr: 0, size: 16 }).unwrap(),
        Outcome::Tx(Err(TxError::ThreadNotInTx { thread: T2, tx: TxId(5) }))
    );

    assert_eq!(
        c.handle_event(T2, Event::AttachThread { tx: TxId(5) }).unwrap(),
        Outcome::Tx(Ok(()))
    );
    c.handle_event(T2, Event::Store { addr: 8, size: 8, value: 1 }).unwrap();
    assert!(c.tx_tracker().oot_stores().is_empty());

    assert_eq!(
        c.handle_event(T2, Event::DetachThread { tx: TxId(5) }).unwrap(),
        Outcome::Tx(Ok(()))
    );
    c.handle_event(T2, Event::Store { addr: 8, size: 8, value: 1 }).unwrap();
    assert!(c.tx_tracker().oot_stores().is_empty());

    // attach/detach never touch nesting: one end closes the transaction
    assert_eq!(handle(&mut c, Event::EndTx { tx: Some(TxId(5)) }), Outcome::Tx(Ok(())));
    assert_eq!(c.tx_tracker().active_count(), 0);
}

#[test]
fn excluded_regions_silence_the_transaction_check() {
    let mut c = checker(Options {
        transactions_only: true,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::AddGlobalExclude { addr: 0, size: 16 });

    handle(&mut c, Event::Store { addr: 4, size: 8, value: 1 });
    assert!(c.tx_tracker().oot_stores().is_empty());

    handle(&mut c, Event::Store { addr: 20, size: 8, value: 1 });
    assert_eq!(c.tx_tracker().oot_stores().len(), 1);
}

#[test]
fn set_clean_forgets_tracked_bytes() {
    let mut c = checker(Options::default());
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::Store { addr: 0, size: 16, value: 1 });
    handle(&mut c, Event::SetClean { addr: 4, size: 8 });
    assert_eq!(
        states(&c),
        vec![
            (MemRegion::new(0, 4), StoreState::Dirty),
            (MemRegion::new(12, 4), StoreState::Dirty),
        ]
    );
}

#[test]
fn vector_stores_decompose_into_lanes() {
    let mut c = checker(Options {
        track_multiple_stores: true,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(
        &mut c,
        Event::VectorStore {
            addr: 0x10,
            lanes: smallvec![0x1111, 0x2222],
        },
    );

    let stores: Vec<(MemRegion, u64)> =
        c.store_tracker().stores().map(|s| (s.region, s.value)).collect();
    assert_eq!(
        stores,
        vec![(MemRegion::new(0x10, 8), 0x1111), (MemRegion::new(0x18, 8), 0x2222)]
    );
}

#[test]
fn superblocks_advance_the_idempotence_window() {
    let mut c = checker(Options {
        track_multiple_stores: true,
        store_sb_indiff: 2,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });

    handle(&mut c, Event::SbEnter);
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 7 });
    handle(&mut c, Event::SbEnter);
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 7 });
    assert!(c.store_tracker().overwrites().is_empty());

    handle(&mut c, Event::SbEnter);
    handle(&mut c, Event::SbEnter);
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 7 });
    assert_eq!(c.store_tracker().overwrites().len(), 1);
}

#[test]
fn the_report_totals_every_category() {
    let mut c = checker(Options {
        check_flush: true,
        transactions_only: true,
        ..Options::default()
    });
    handle(&mut c, Event::RegisterMapping { addr: 0, size: 64 });
    handle(&mut c, Event::Store { addr: 0, size: 8, value: 1 });
    handle(&mut c, Event::Flush { addr: 32, size: 8 });
    handle(&mut c, Event::BeginTx { tx: Some(TxId(9)) });

    let mut out = Vec::new();
    c.write_report(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();

    assert!(report.contains("Number of stores not made persistent: 1"));
    assert!(report.contains("Total memory not made persistent: 8"));
    assert!(report.contains("Number of stores made without adding to transaction: 1"));
    assert!(report.contains("Number of unnecessary flushes: 1"));
    assert!(report.contains("Number of active transactions: 1"));
    assert!(report.contains("tx_id: 9"));
    // dangling + oot + superfluous + active transaction
    assert!(report.contains("ERROR SUMMARY: 4 errors"));
}
