//! Differential-maintenance scenarios against the runtime, written the way
//! generated message handlers would execute them: worklist vectors, index
//! probes, and the ternary tuple-state protocol.
//!
//! Covered end to end: transitive closure under insert and delete,
//! stratified negation, per-group counting under insert and delete, functor
//! purity and impure retraction, bound-parameter queries over live data,
//! and batch rollback.

use riverlog::runtime::{
    tuple, ConditionRefCount, InsertResult, Set, Storage, TransitionLog, Tuple, TupleState, Value,
    Vector,
};
use std::collections::HashMap;
use std::sync::Arc;

fn t2(a: u64, b: u64) -> Tuple {
    tuple([Value::UInt(a), Value::UInt(b)])
}

fn t1(a: u64) -> Tuple {
    tuple([Value::UInt(a)])
}

fn pairs(rows: &[Tuple]) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = rows
        .iter()
        .map(|t| match (&t[0], &t[1]) {
            (Value::UInt(a), Value::UInt(b)) => (*a, *b),
            other => panic!("unexpected tuple {other:?}"),
        })
        .collect();
    out.sort_unstable();
    out
}

/// The transitive-closure database: edge and tc tables with the indexes the
/// compiled plan would select (edge by source, tc by target), plus the
/// handler and remover procedures.
struct TcDatabase {
    storage: Storage,
}

const EDGE: u32 = 0;
const TC: u32 = 1;

impl TcDatabase {
    fn new() -> Self {
        let storage = Storage::new();
        // edge: index 0 keyed by column 0 (forward join), index 1 by column 1.
        storage.create_table(EDGE, 2, &[vec![0], vec![1]]);
        // tc: index 0 keyed by column 1, index 1 by column 0.
        storage.create_table(TC, 2, &[vec![1], vec![0]]);
        TcDatabase { storage }
    }

    fn edge(&self) -> Arc<riverlog::runtime::Table> {
        self.storage.table(EDGE).expect("edge table")
    }

    fn tc(&self) -> Arc<riverlog::runtime::Table> {
        self.storage.table(TC).expect("tc table")
    }

    /// Message handler for added edges: seed the worklist from both clauses,
    /// then run the induction loop to fixpoint.
    fn insert_edges(&self, edges: &[(u64, u64)]) {
        let edge = self.edge();
        let tc = self.tc();
        let mut work = Vector::new(0);

        for &(x, y) in edges {
            let row = t2(x, y);
            if edge.insert_or_transition(&row) == InsertResult::Unchanged {
                continue;
            }
            // tc(X, Y) : edge(X, Y).
            work.append(row.clone());
            // tc(X, Z) : tc(X, Y), edge(Y, Z) with the new edge as (Y, Z):
            // every present tc ending at Y extends to Z.
            let scan = tc.scan_index(0, &[Value::UInt(x)]);
            for prior in scan.present() {
                work.append(tuple([prior[0].clone(), Value::UInt(y)]));
            }
        }
        self.run_induction(&mut work);
    }

    /// The induction region: drain the worklist, proving each tuple and
    /// appending its consequences, until a fixed point.
    fn run_induction(&self, work: &mut Vector) {
        let edge = self.edge();
        let tc = self.tc();
        let mut swap = Vector::new(0);
        while !work.is_empty() {
            work.unique();
            work.swap(&mut swap);
            for row in swap.take() {
                if tc.insert_or_transition(&row) == InsertResult::Unchanged {
                    continue;
                }
                // Extend to the right through edges leaving row.1.
                let scan = edge.scan_index(0, &[row[1].clone()]);
                for next in scan.present() {
                    work.append(tuple([row[0].clone(), next[1].clone()]));
                }
                // Extend to the left through tc tuples ending at row.0.
                let scan = tc.scan_index(0, &[row[0].clone()]);
                for prior in scan.present() {
                    work.append(tuple([prior[0].clone(), row[1].clone()]));
                }
            }
        }
    }

    /// Differential removal: retract the edges, mark dependents Unknown
    /// through downward propagation, then re-verify each Unknown tuple
    /// bottom-up, confirming Present or concluding Absent.
    fn remove_edges(&self, edges: &[(u64, u64)]) {
        let edge = self.edge();
        let tc = self.tc();

        for &(x, y) in edges {
            let row = t2(x, y);
            if edge.try_change_state(TupleState::Present, TupleState::Unknown, &row) {
                edge.try_change_state(TupleState::Unknown, TupleState::Absent, &row);
            }
        }

        // Remover: every tc tuple the deleted edges may have supported
        // becomes Unknown. Propagation walks the closure itself: when
        // tc(A, B) loses a proof, every span extended through it may too.
        let mut work = Vector::new(0);
        for &(x, y) in edges {
            work.append(t2(x, y));
        }
        let mut touched = Set::new();
        while !work.is_empty() {
            for row in work.take() {
                if !touched.insert(row.clone()) {
                    continue;
                }
                if tc.try_change_state(TupleState::Present, TupleState::Unknown, &row) {
                    // tc(row.0, C) extended to the right through row.1.
                    let scan = tc.scan_index(1, &[row[1].clone()]);
                    for (next, state) in scan.iter() {
                        if *state != TupleState::Absent {
                            work.append(tuple([row[0].clone(), next[1].clone()]));
                        }
                    }
                    // tc(C, row.1) extended to the left through row.0.
                    let scan = tc.scan_index(0, &[row[0].clone()]);
                    for (prior, state) in scan.iter() {
                        if *state != TupleState::Absent {
                            work.append(tuple([prior[0].clone(), row[1].clone()]));
                        }
                    }
                }
            }
        }

        // Finder pass: re-prove Unknown tuples from the remaining edges,
        // iterating until no tuple changes, then confirm the rest Absent.
        loop {
            let mut changed = false;
            let snapshot = tc.scan();
            for (row, state) in snapshot.iter() {
                if *state != TupleState::Unknown {
                    continue;
                }
                if self.reprove(row) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let snapshot = tc.scan();
        for (row, state) in snapshot.iter() {
            if *state == TupleState::Unknown {
                tc.try_change_state(TupleState::Unknown, TupleState::Absent, row);
            }
        }
    }

    /// Top-down re-proof of one tc tuple from its two defining clauses.
    fn reprove(&self, row: &Tuple) -> bool {
        let edge = self.edge();
        let tc = self.tc();
        if edge.get_state(row) == TupleState::Present {
            return tc.try_change_state(TupleState::Unknown, TupleState::Present, row);
        }
        // tc(X, Z) : tc(X, Y), edge(Y, Z) with (X, Z) bound: probe edges
        // into Z and check tc(X, Y) is Present.
        let scan = edge.scan_index(1, &[row[1].clone()]);
        for hop in scan.present() {
            let mid = tuple([row[0].clone(), hop[0].clone()]);
            if mid != *row && tc.get_state(&mid) == TupleState::Present {
                return tc.try_change_state(TupleState::Unknown, TupleState::Present, row);
            }
        }
        false
    }

    fn tc_contents(&self) -> Vec<(u64, u64)> {
        pairs(&self.tc().present_tuples())
    }
}

#[test]
fn transitive_closure_inserts() {
    let db = TcDatabase::new();
    db.insert_edges(&[(1, 2), (2, 3), (3, 4)]);
    assert_eq!(
        db.tc_contents(),
        vec![(1, 2), (1, 3), (1, 4), (2, 3), (2, 4), (3, 4)]
    );
}

#[test]
fn transitive_closure_delete_retracts_consequences() {
    let db = TcDatabase::new();
    db.insert_edges(&[(1, 2), (2, 3), (3, 4)]);
    db.remove_edges(&[(2, 3)]);
    assert_eq!(db.tc_contents(), vec![(1, 2), (3, 4)]);
}

#[test]
fn insert_then_delete_is_identity() {
    let db = TcDatabase::new();
    let batch = [(1, 2), (2, 3), (3, 4), (1, 4), (4, 5)];
    db.insert_edges(&batch);
    db.remove_edges(&batch);
    assert_eq!(db.tc_contents(), vec![]);
    assert_eq!(db.edge().present_count(), 0);
}

#[test]
fn delete_keeps_alternative_proofs() {
    let db = TcDatabase::new();
    // Two routes from 1 to 3.
    db.insert_edges(&[(1, 2), (2, 3), (1, 3)]);
    db.remove_edges(&[(2, 3)]);
    // (1, 3) survives through the direct edge.
    assert_eq!(db.tc_contents(), vec![(1, 2), (1, 3)]);
}

#[test]
fn reinsert_after_delete_restores() {
    let db = TcDatabase::new();
    db.insert_edges(&[(1, 2), (2, 3)]);
    db.remove_edges(&[(2, 3)]);
    db.insert_edges(&[(2, 3)]);
    assert_eq!(db.tc_contents(), vec![(1, 2), (1, 3), (2, 3)]);
}

// ---------------------------------------------------------------------
// Stratified negation: unreach(X) : node(X), !reach(X).
// ---------------------------------------------------------------------

#[test]
fn stratified_negation_reachability() {
    let storage = Storage::new();
    let node = storage.create_table(0, 1, &[]);
    let edge = storage.create_table(1, 2, &[vec![0]]);
    let reach = storage.create_table(2, 1, &[]);
    let unreach = storage.create_table(3, 1, &[]);

    for n in [1u64, 2, 3] {
        node.insert_or_transition(&t1(n));
    }
    edge.insert_or_transition(&t2(1, 2));

    // Stratum 0: reach to fixpoint from start = {1}.
    let mut work = Vector::new(0);
    work.append(t1(1));
    while !work.is_empty() {
        work.unique();
        for row in work.take() {
            if reach.insert_or_transition(&row) == InsertResult::Unchanged {
                continue;
            }
            let scan = edge.scan_index(0, &[row[0].clone()]);
            for next in scan.present() {
                work.append(tuple([next[1].clone()]));
            }
        }
    }

    // Stratum 1: negation runs only after reach is complete.
    let nodes = node.scan();
    for row in nodes.present() {
        if reach.get_state(row) == TupleState::Absent {
            unreach.insert_or_transition(row);
        }
    }

    let reached: Vec<u64> = reach
        .present_tuples()
        .iter()
        .map(|t| match &t[0] {
            Value::UInt(v) => *v,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(reached, vec![1, 2]);
    assert_eq!(unreach.present_tuples(), vec![t1(3)]);
}

// ---------------------------------------------------------------------
// Aggregation: count of edges per source, differentially maintained.
// ---------------------------------------------------------------------

/// The generated aggregate keeps reducer state per group and swaps the
/// summary tuple on every change: retract the old count, prove the new one.
struct CountPerSource {
    storage: Storage,
    counts: HashMap<u64, u64>,
}

impl CountPerSource {
    const EDGE: u32 = 0;
    const COUNT: u32 = 1;

    fn new() -> Self {
        let storage = Storage::new();
        storage.create_table(Self::EDGE, 2, &[]);
        storage.create_table(Self::COUNT, 2, &[]);
        CountPerSource { storage, counts: HashMap::new() }
    }

    fn update_summary(&mut self, group: u64, delta: i64) {
        let table = self.storage.table(Self::COUNT).expect("count table");
        let old = self.counts.get(&group).copied();
        let new = match delta {
            1 => old.unwrap_or(0) + 1,
            _ => old.unwrap_or(1) - 1,
        };

        if let Some(old) = old {
            let old_row = t2(group, old);
            table.try_change_state(TupleState::Present, TupleState::Unknown, &old_row);
            table.try_change_state(TupleState::Unknown, TupleState::Absent, &old_row);
        }
        if new > 0 {
            table.insert_or_transition(&t2(group, new));
            self.counts.insert(group, new);
        } else {
            self.counts.remove(&group);
        }
    }

    fn insert(&mut self, x: u64, y: u64) {
        let edges = self.storage.table(Self::EDGE).expect("edge table");
        if edges.insert_or_transition(&t2(x, y)) != InsertResult::Unchanged {
            self.update_summary(x, 1);
        }
    }

    fn remove(&mut self, x: u64, y: u64) {
        let edges = self.storage.table(Self::EDGE).expect("edge table");
        let row = t2(x, y);
        if edges.try_change_state(TupleState::Present, TupleState::Unknown, &row) {
            edges.try_change_state(TupleState::Unknown, TupleState::Absent, &row);
            self.update_summary(x, -1);
        }
    }

    fn contents(&self) -> Vec<(u64, u64)> {
        let table = self.storage.table(Self::COUNT).expect("count table");
        pairs(&table.present_tuples())
    }
}

#[test]
fn counting_tracks_inserts_and_deletes() {
    let mut counts = CountPerSource::new();
    counts.insert(1, 10);
    counts.insert(1, 11);
    counts.insert(1, 12);
    assert_eq!(counts.contents(), vec![(1, 3)]);

    counts.remove(1, 11);
    assert_eq!(counts.contents(), vec![(1, 2)]);

    // A duplicate insert leaves the count alone.
    counts.insert(1, 10);
    assert_eq!(counts.contents(), vec![(1, 2)]);

    counts.remove(1, 10);
    counts.remove(1, 12);
    assert_eq!(counts.contents(), vec![]);
}

// ---------------------------------------------------------------------
// Functor purity.
// ---------------------------------------------------------------------

#[test]
fn pure_functor_memoizes_to_one_tuple() {
    let storage = Storage::new();
    let succ = storage.create_table(0, 2, &[]);
    let add1 = |x: u64| x + 1;

    // Two derivations with X = 5 produce one tuple: the second
    // insert_or_transition is Unchanged.
    let first = succ.insert_or_transition(&t2(5, add1(5)));
    let second = succ.insert_or_transition(&t2(5, add1(5)));
    assert_eq!(first, InsertResult::Inserted);
    assert_eq!(second, InsertResult::Unchanged);
    assert_eq!(succ.present_count(), 1);
}

#[test]
fn impure_functor_outputs_retract_with_inputs() {
    let storage = Storage::new();
    let out = storage.create_table(0, 2, &[vec![0]]);

    // An impure functor produced two outputs for input 7; both were
    // memoized so a retraction can find them.
    out.insert_or_transition(&t2(7, 100));
    out.insert_or_transition(&t2(7, 101));

    // Input 7 retracts: a negated generate replays the memoized outputs
    // and withdraws each.
    let memoized = out.scan_index(0, &[Value::UInt(7)]);
    let rows: Vec<Tuple> = memoized.present().cloned().collect();
    drop(memoized);
    for row in rows {
        assert!(out.try_change_state(TupleState::Present, TupleState::Unknown, &row));
        assert!(out.try_change_state(TupleState::Unknown, TupleState::Absent, &row));
    }
    assert_eq!(out.present_count(), 0);
}

// ---------------------------------------------------------------------
// Bound-parameter query over live data.
// ---------------------------------------------------------------------

#[test]
fn bound_query_sees_updates_between_requests() {
    let storage = Storage::new();
    let knows = storage.create_table(0, 2, &[vec![0]]);
    let alice = Value::str("alice");

    knows.insert_or_transition(&tuple([alice.clone(), Value::str("bob")]));
    knows.insert_or_transition(&tuple([alice.clone(), Value::str("carol")]));
    knows.insert_or_transition(&tuple([Value::str("dave"), Value::str("erin")]));

    // The query finder probes the bound column and streams Present rows.
    let respond = |key: &Value| -> Vec<String> {
        let scan = knows.scan_index(0, &[key.clone()]);
        let mut out: Vec<String> = scan
            .present()
            .map(|t| match &t[1] {
                Value::String(s) => s.to_string(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        out.sort();
        out
    };

    assert_eq!(respond(&alice), vec!["bob", "carol"]);

    // A relevant message lands; reissuing the request sees it.
    knows.insert_or_transition(&tuple([alice.clone(), Value::str("frank")]));
    assert_eq!(respond(&alice), vec!["bob", "carol", "frank"]);
}

// ---------------------------------------------------------------------
// Batch atomicity.
// ---------------------------------------------------------------------

#[test]
fn failed_batch_rolls_back_all_transitions() {
    let storage = Storage::new();
    let table = storage.create_table(0, 2, &[]);
    let cond = ConditionRefCount::new();

    table.insert_or_transition(&t2(0, 0));

    // A batch stages several transitions, then an impure functor raises;
    // everything staged reverts.
    let mut log = TransitionLog::new();
    log.insert_or_transition(&table, &t2(1, 1));
    log.insert_or_transition(&table, &t2(2, 2));
    log.try_change_state(&table, TupleState::Present, TupleState::Unknown, &t2(0, 0));
    cond.increment();

    let functor_failed = true;
    if functor_failed {
        log.rollback();
        cond.decrement();
    }

    assert_eq!(table.get_state(&t2(1, 1)), TupleState::Absent);
    assert_eq!(table.get_state(&t2(2, 2)), TupleState::Absent);
    assert_eq!(table.get_state(&t2(0, 0)), TupleState::Present);
    assert!(!cond.is_true());
}
