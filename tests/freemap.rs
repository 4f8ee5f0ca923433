use bstore::freemap::{FileSource, FreeMap, NoGrow, Strategy};
use bstore::types::Extent;
use bstore::StoreError;

/// Hands out capacities from a fixed list, then declines.
struct CapList {
    caps: Vec<u64>,
    next: usize,
}

impl CapList {
    fn new(caps: &[u64]) -> Self {
        Self { caps: caps.to_vec(), next: 0 }
    }
}

impl FileSource for CapList {
    fn provide(&mut self, _index: u32) -> Option<u64> {
        let cap = self.caps.get(self.next).copied();
        self.next += 1;
        cap
    }
}

fn lcg(seed: &mut u64) -> u64 {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *seed >> 33
}

/// No two free extents may be adjacent or overlapping within one file.
fn assert_coalesced(fm: &FreeMap) {
    let extents = fm.extents();
    for pair in extents.windows(2) {
        if pair[0].file == pair[1].file {
            assert!(
                pair[0].end() < pair[1].offset,
                "extents {} and {} must have been coalesced",
                pair[0],
                pair[1]
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Exact allocation and location reuse
// ---------------------------------------------------------------------------

#[test]
fn free_then_alloc_at_the_same_spot() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();

    assert_eq!(fm.alloc(40, true, &mut NoGrow).unwrap(), Extent::new(0, 0, 40));
    assert_eq!(fm.alloc(40, true, &mut NoGrow).unwrap(), Extent::new(0, 40, 40));
    fm.free(0, 0, 40).unwrap();
    assert_eq!(fm.alloc_at(0, 0, 40, true).unwrap(), Extent::new(0, 0, 40));
}

#[test]
fn alloc_at_works_inside_a_coalesced_extent() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();

    let a = fm.alloc(30, true, &mut NoGrow).unwrap();
    let b = fm.alloc(30, true, &mut NoGrow).unwrap();
    fm.free(a.file, a.offset, a.len).unwrap();
    fm.free(b.file, b.offset, b.len).unwrap();
    // Both frees merged with each other and the tail: one extent again.
    assert_eq!(fm.extents(), vec![Extent::new(0, 0, 100)]);

    // The old location of `b` is interior to the merged extent.
    assert_eq!(fm.alloc_at(0, 30, 30, true).unwrap(), Extent::new(0, 30, 30));
    assert_coalesced(&fm);
}

#[test]
fn alloc_at_fails_when_the_range_is_taken() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    fm.alloc(60, true, &mut NoGrow).unwrap();
    assert!(matches!(
        fm.alloc_at(0, 20, 10, true),
        Err(StoreError::NoSpace(_))
    ));
}

// ---------------------------------------------------------------------------
// Growth and exhaustion
// ---------------------------------------------------------------------------

#[test]
fn too_large_for_every_file_is_no_space() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(50).unwrap();
    fm.add_file(50).unwrap();
    // Allocations never span files, so 60 bytes can not be served.
    assert!(matches!(
        fm.alloc(60, true, &mut NoGrow),
        Err(StoreError::NoSpace(_))
    ));
    // The failed call left the map untouched.
    assert_eq!(fm.stats().free, 100);
    assert_eq!(fm.stats().extents, 2);
}

#[test]
fn growth_asks_the_source_until_satisfied() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    let mut source = CapList::new(&[50, 200]);
    // 120 does not fit in the first provided file; the second one takes it.
    let got = fm.alloc(120, true, &mut source).unwrap();
    assert_eq!(got, Extent::new(1, 0, 120));
    assert_eq!(fm.file_count(), 2);
    assert_eq!(fm.stats().free, 50 + 80);
}

// ---------------------------------------------------------------------------
// Append slack
// ---------------------------------------------------------------------------

#[test]
fn small_remainders_are_folded_into_the_grant() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 8);
    fm.add_file(100).unwrap();
    let got = fm.alloc(95, false, &mut NoGrow).unwrap();
    assert_eq!(got, Extent::new(0, 0, 100));
    assert_eq!(fm.stats().wasted, 5);
    assert_eq!(fm.stats().free, 0);
}

#[test]
fn large_remainders_are_kept_free() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 8);
    fm.add_file(100).unwrap();
    let got = fm.alloc(80, false, &mut NoGrow).unwrap();
    assert_eq!(got, Extent::new(0, 0, 80));
    assert_eq!(fm.stats().wasted, 0);
    assert_eq!(fm.extents(), vec![Extent::new(0, 80, 20)]);
}

#[test]
fn exact_mode_never_over_grants() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 64);
    fm.add_file(100).unwrap();
    let got = fm.alloc(95, true, &mut NoGrow).unwrap();
    assert_eq!(got.len, 95);
    assert_eq!(fm.stats().wasted, 0);
    assert_eq!(fm.extents(), vec![Extent::new(0, 95, 5)]);
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Carve the pool into free holes of 30, 10 and 20 bytes.
fn holey_map(strategy: Strategy) -> FreeMap {
    let mut fm = FreeMap::new(strategy, 0);
    fm.add_file(200).unwrap();
    fm.alloc(170, true, &mut NoGrow).unwrap(); // hole: [170, 200) = 30
    fm.free(0, 10, 10).unwrap(); // hole: [10, 20) = 10
    fm.free(0, 100, 20).unwrap(); // hole: [100, 120) = 20
    fm
}

#[test]
fn first_fit_takes_the_lowest_address() {
    let mut fm = holey_map(Strategy::FirstFit);
    assert_eq!(fm.alloc(5, true, &mut NoGrow).unwrap(), Extent::new(0, 10, 5));
}

#[test]
fn best_fit_takes_the_smallest_sufficient_hole() {
    let mut fm = holey_map(Strategy::BestFit);
    assert_eq!(fm.alloc(15, true, &mut NoGrow).unwrap(), Extent::new(0, 100, 15));
}

#[test]
fn worst_fit_takes_the_largest_hole() {
    let mut fm = holey_map(Strategy::WorstFit);
    assert_eq!(fm.alloc(5, true, &mut NoGrow).unwrap(), Extent::new(0, 170, 5));
}

#[test]
fn best_fit_breaks_ties_by_address() {
    let mut fm = FreeMap::new(Strategy::BestFit, 0);
    fm.add_file(100).unwrap();
    fm.alloc(100, true, &mut NoGrow).unwrap();
    fm.free(0, 10, 10).unwrap();
    fm.free(0, 50, 10).unwrap();
    assert_eq!(fm.alloc(10, true, &mut NoGrow).unwrap(), Extent::new(0, 10, 10));
}

// ---------------------------------------------------------------------------
// Extending in place
// ---------------------------------------------------------------------------

#[test]
fn extend_uses_the_adjacent_extent() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    let a = fm.alloc(40, true, &mut NoGrow).unwrap();
    assert_eq!(fm.extend(a.file, a.offset, a.len, 20, true).unwrap(), 20);
    // The grant came off the front of the tail extent.
    assert_eq!(fm.extents(), vec![Extent::new(0, 60, 40)]);
}

#[test]
fn extend_fails_without_an_adjacent_extent() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    let a = fm.alloc(40, true, &mut NoGrow).unwrap();
    fm.alloc(60, true, &mut NoGrow).unwrap();
    assert!(matches!(
        fm.extend(a.file, a.offset, a.len, 10, true),
        Err(StoreError::NoSpace(_))
    ));
}

#[test]
fn extend_respects_slack() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 8);
    fm.add_file(100).unwrap();
    let a = fm.alloc(40, true, &mut NoGrow).unwrap();
    // Tail is 60 bytes; asking for 55 leaves 5 <= slack, so take it all.
    assert_eq!(fm.extend(a.file, a.offset, a.len, 55, false).unwrap(), 60);
    assert_eq!(fm.stats().wasted, 5);
    assert_eq!(fm.stats().free, 0);
}

// ---------------------------------------------------------------------------
// Coalescing and misuse
// ---------------------------------------------------------------------------

#[test]
fn frees_coalesce_on_both_sides() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(90).unwrap();
    let a = fm.alloc(30, true, &mut NoGrow).unwrap();
    let b = fm.alloc(30, true, &mut NoGrow).unwrap();
    let c = fm.alloc(30, true, &mut NoGrow).unwrap();

    fm.free(a.file, a.offset, a.len).unwrap();
    fm.free(c.file, c.offset, c.len).unwrap();
    assert_eq!(fm.stats().extents, 2);
    // Freeing the middle merges everything.
    fm.free(b.file, b.offset, b.len).unwrap();
    assert_eq!(fm.extents(), vec![Extent::new(0, 0, 90)]);
}

#[test]
fn double_free_is_rejected() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    let a = fm.alloc(40, true, &mut NoGrow).unwrap();
    fm.free(a.file, a.offset, a.len).unwrap();
    assert!(matches!(
        fm.free(a.file, a.offset, a.len),
        Err(StoreError::Invalid(_))
    ));
}

#[test]
fn free_past_capacity_is_rejected() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    assert!(matches!(fm.free(0, 90, 20), Err(StoreError::Invalid(_))));
}

// ---------------------------------------------------------------------------
// Workload invariants
// ---------------------------------------------------------------------------

/// Random malloc/free churn: totals must balance at every step, free
/// extents must stay coalesced, and freeing everything must leave exactly
/// one extent per file.
#[test]
fn random_workload_balances_and_round_trips() {
    for strategy in [Strategy::FirstFit, Strategy::BestFit, Strategy::WorstFit] {
        let mut fm = FreeMap::new(strategy, 16);
        let capacity = 4096u64;
        fm.add_file(capacity).unwrap();
        fm.add_file(capacity).unwrap();

        let mut live: Vec<Extent> = Vec::new();
        let mut seed = 1234u64;
        for _ in 0..2000 {
            let do_alloc = live.is_empty() || lcg(&mut seed) % 2 == 0;
            if do_alloc {
                let wanted = 1 + lcg(&mut seed) % 200;
                let exact = lcg(&mut seed) % 2 == 0;
                match fm.alloc(wanted, exact, &mut NoGrow) {
                    Ok(got) => {
                        assert!(got.len >= wanted);
                        if exact {
                            assert_eq!(got.len, wanted);
                        }
                        live.push(got);
                    }
                    Err(StoreError::NoSpace(_)) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            } else {
                let i = (lcg(&mut seed) as usize) % live.len();
                let ext = live.swap_remove(i);
                fm.free(ext.file, ext.offset, ext.len).unwrap();
            }
            let stats = fm.stats();
            let granted: u64 = live.iter().map(|e| e.len).sum();
            assert_eq!(stats.free + granted, 2 * capacity, "totals must balance");
            assert_coalesced(&fm);
        }

        for ext in live.drain(..) {
            fm.free(ext.file, ext.offset, ext.len).unwrap();
        }
        assert_eq!(
            fm.extents(),
            vec![Extent::new(0, 0, capacity), Extent::new(1, 0, capacity)],
            "freeing everything must leave one extent per file ({strategy:?})"
        );
    }
}

#[test]
fn utilisation_and_display_report_the_pool() {
    let mut fm = FreeMap::new(Strategy::FirstFit, 0);
    fm.add_file(100).unwrap();
    fm.alloc(25, true, &mut NoGrow).unwrap();
    assert!((fm.utilisation() - 0.25).abs() < 1e-9);
    let report = fm.to_string();
    assert!(report.contains("75 free of 100"), "got: {report}");
    assert!(report.contains("[25, 100)"), "got: {report}");
}
