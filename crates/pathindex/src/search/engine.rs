//! Lazy ranked evaluation of a compiled query over a store snapshot.
//!
//! Results come in two tiers:
//! 1. exact and starts-with name matches, found through the names index,
//!    ordered by (rank, depth, path)
//! 2. every other match, streamed from the (depth, path) ordered scan
//!
//! Only the first tier is materialized, so a broad pattern such as `*`
//! yields its first match without ranking the whole store.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::exclusion::ExclusionRules;
use crate::path::is_same_or_descendant;
use crate::query::{CompiledQuery, NameNeedle};
use crate::storage::{StoreSnapshot, StoredRecord, StoredScan};
use crate::types::PathRecord;

/// How well a record's name matches the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchRank {
    /// Name equals a query term (case-insensitive).
    Exact = 0,
    /// Name starts with a query term.
    Prefix = 1,
    /// Substring or wildcard match elsewhere.
    Contains = 2,
}

/// One evaluated match.
#[derive(Debug, Clone)]
pub struct SearchHit {
    stored: Arc<StoredRecord>,
    rank: MatchRank,
}

impl SearchHit {
    pub fn record(&self) -> &Arc<PathRecord> {
        self.stored.record()
    }

    pub fn rank(&self) -> MatchRank {
        self.rank
    }

    pub fn depth(&self) -> u32 {
        self.stored.depth()
    }

    fn order_key(&self) -> (MatchRank, u32, &str) {
        (self.rank, self.stored.depth(), self.stored.path())
    }
}

fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    a.order_key().cmp(&b.order_key())
}

/// Which records an evaluation considers.
#[derive(Debug, Clone, Default)]
pub enum SearchScope {
    #[default]
    All,
    /// Direct children of a directory.
    Children(String),
    /// A directory and everything below it.
    Subtree(String),
    /// Results of an earlier query that the current one refines.
    Seeded(Arc<[SearchHit]>),
}

impl SearchScope {
    fn admits(&self, stored: &StoredRecord) -> bool {
        match self {
            Self::All | Self::Seeded(_) => true,
            Self::Children(parent) => stored.record().parent_path == *parent,
            Self::Subtree(root) => is_same_or_descendant(stored.path(), root),
        }
    }
}

/// A prepared evaluation. Each [`iter`](Self::iter) call restarts it.
#[derive(Debug, Clone)]
pub struct Evaluation {
    snapshot: Arc<StoreSnapshot>,
    query: Arc<CompiledQuery>,
    exclusions: Arc<ExclusionRules>,
    scope: SearchScope,
    cancel: CancellationToken,
}

/// Prepares `query` for evaluation against `snapshot`.
///
/// Nothing is read until the returned evaluation is iterated. Exclusion
/// rules are applied at evaluation time, so records indexed before a rule
/// was added are still filtered.
pub fn evaluate(
    snapshot: Arc<StoreSnapshot>,
    query: Arc<CompiledQuery>,
    exclusions: Arc<ExclusionRules>,
    scope: SearchScope,
    cancel: CancellationToken,
) -> Evaluation {
    Evaluation {
        snapshot,
        query,
        exclusions,
        scope,
        cancel,
    }
}

impl Evaluation {
    pub fn query(&self) -> &Arc<CompiledQuery> {
        &self.query
    }

    pub fn scope(&self) -> &SearchScope {
        &self.scope
    }

    /// A fresh, lazy, ranked iterator over the matches.
    pub fn iter(&self) -> MatchIter {
        MatchIter {
            evaluation: self.clone(),
            phase: Phase::Start,
            examined: 0,
            cancelled: false,
        }
    }

    fn admit(&self, stored: &Arc<StoredRecord>) -> Option<SearchHit> {
        if !self.scope.admits(stored)
            || self.exclusions.is_excluded(stored.path())
            || !self.query.matches_stored(stored)
        {
            return None;
        }
        Some(SearchHit {
            stored: stored.clone(),
            rank: rank_name(self.query.name_needles(), stored.name_lower()),
        })
    }
}

impl<'a> IntoIterator for &'a Evaluation {
    type Item = SearchHit;
    type IntoIter = MatchIter;

    fn into_iter(self) -> MatchIter {
        self.iter()
    }
}

fn rank_name(needles: &[NameNeedle], name_lower: &str) -> MatchRank {
    let mut best = MatchRank::Contains;
    for needle in needles {
        if needle.allow_exact && name_lower == needle.text {
            return MatchRank::Exact;
        }
        if name_lower.starts_with(needle.text.as_str()) {
            best = MatchRank::Prefix;
        }
    }
    best
}

enum Phase {
    Start,
    Ranked {
        hits: std::vec::IntoIter<SearchHit>,
        then_scan: bool,
    },
    Scan(StoredScan),
    Done,
}

/// Lazy ranked match sequence.
///
/// Checks the cancellation token between records; once cancelled it stops
/// producing and [`was_cancelled`](Self::was_cancelled) turns true.
pub struct MatchIter {
    evaluation: Evaluation,
    phase: Phase,
    examined: usize,
    cancelled: bool,
}

impl MatchIter {
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn tick(&mut self) -> Option<()> {
        self.examined += 1;
        if self
            .evaluation
            .cancel
            .is_cancelled_sparse(self.examined)
            .is_none()
        {
            self.cancelled = true;
            self.phase = Phase::Done;
            return None;
        }
        Some(())
    }

    /// Builds the materialized tier for the scope.
    fn start(&mut self) -> Option<Phase> {
        let evaluation = self.evaluation.clone();
        let (candidates, then_scan): (Vec<Arc<StoredRecord>>, bool) = match &evaluation.scope {
            SearchScope::Seeded(seed) => (seed.iter().map(|hit| hit.stored.clone()).collect(), false),
            SearchScope::Children(parent) => (evaluation.snapshot.children(parent), false),
            SearchScope::All | SearchScope::Subtree(_) => {
                let paths = evaluation
                    .query
                    .name_needles()
                    .iter()
                    .flat_map(|needle| evaluation.snapshot.paths_with_name_prefix(&needle.text))
                    .collect::<BTreeSet<_>>();
                let candidates = paths
                    .iter()
                    .filter_map(|path| evaluation.snapshot.get_stored(path))
                    .collect();
                (candidates, true)
            }
        };

        let mut hits = Vec::new();
        for stored in &candidates {
            self.tick()?;
            if let Some(hit) = evaluation.admit(stored) {
                if !then_scan || hit.rank < MatchRank::Contains {
                    hits.push(hit);
                }
            }
        }
        hits.sort_by(compare_hits);
        Some(Phase::Ranked {
            hits: hits.into_iter(),
            then_scan,
        })
    }
}

impl Iterator for MatchIter {
    type Item = SearchHit;

    fn next(&mut self) -> Option<SearchHit> {
        loop {
            match &mut self.phase {
                Phase::Done => return None,
                Phase::Start => {
                    self.phase = self.start()?;
                }
                Phase::Ranked { hits, then_scan } => {
                    if let Some(hit) = hits.next() {
                        return Some(hit);
                    }
                    self.phase = if *then_scan {
                        Phase::Scan(StoredScan::new(self.evaluation.snapshot.clone()))
                    } else {
                        Phase::Done
                    };
                }
                Phase::Scan(scan) => {
                    let Some(stored) = scan.next() else {
                        self.phase = Phase::Done;
                        return None;
                    };
                    self.tick()?;
                    if let Some(hit) = self.evaluation.admit(&stored) {
                        if hit.rank == MatchRank::Contains {
                            return Some(hit);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::SearchVersionTracker;
    use crate::storage::JournalOp;
    use crate::volume::VolumeId;
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};

    fn snapshot_of(paths: &[&str]) -> Arc<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::default();
        for path in paths {
            snapshot.apply(&JournalOp::Upsert(PathRecord::from_key(
                path.to_string(),
                VolumeId::new("v"),
                false,
                0,
                None,
                0,
            )));
        }
        Arc::new(snapshot)
    }

    fn run(snapshot: &Arc<StoreSnapshot>, query: &str, rules: ExclusionRules) -> Vec<String> {
        run_scoped(snapshot, query, rules, SearchScope::All)
    }

    fn run_scoped(
        snapshot: &Arc<StoreSnapshot>,
        query: &str,
        rules: ExclusionRules,
        scope: SearchScope,
    ) -> Vec<String> {
        let query = Arc::new(CompiledQuery::compile(query, false).expect("compile"));
        evaluate(
            snapshot.clone(),
            query,
            Arc::new(rules),
            scope,
            CancellationToken::noop(),
        )
        .iter()
        .map(|hit| hit.record().full_path.clone())
        .collect()
    }

    #[test]
    fn ranks_exact_then_prefix_then_contains() {
        let snapshot = snapshot_of(&[
            "/z/deep/dir/myreport.txt",
            "/a/report_final.txt",
            "/report",
            "/b/Report",
            "/a/b/report.csv",
            "/old_report.csv",
        ]);
        assert_eq!(
            run(&snapshot, "report", ExclusionRules::new()),
            vec![
                "/report",
                "/b/Report",
                "/a/report_final.txt",
                "/a/b/report.csv",
                "/old_report.csv",
                "/z/deep/dir/myreport.txt",
            ]
        );
    }

    #[test]
    fn identical_queries_give_identical_order() {
        let snapshot = snapshot_of(&["/b/x1", "/a/x2", "/x", "/c/d/x3"]);
        let first = run(&snapshot, "x", ExclusionRules::new());
        let second = run(&snapshot, "x", ExclusionRules::new());
        assert_eq!(first, second);
        assert_eq!(first, vec!["/x", "/a/x2", "/b/x1", "/c/d/x3"]);
    }

    #[test]
    fn wildcard_and_or_queries_use_the_grammar() {
        let snapshot = snapshot_of(&["/d/report.csv", "/d/a.csv", "/d/report.csv.bak", "/d/a.txt", "/d/b.txt", "/d/ab.txt"]);
        let mut csv = run(&snapshot, "*.csv", ExclusionRules::new());
        csv.sort();
        assert_eq!(csv, vec!["/d/a.csv", "/d/report.csv"]);
        assert_eq!(
            run(&snapshot, "a.txt|b.txt", ExclusionRules::new()),
            vec!["/d/a.txt", "/d/b.txt"]
        );
    }

    #[test]
    fn exclusions_apply_to_indexed_records() {
        let snapshot = snapshot_of(&["/keep/report.txt", "/cache/report.txt", "/cache/sub/report.md"]);
        let rules = ExclusionRules::from_prefixes(["/cache"]);
        assert_eq!(run(&snapshot, "report", rules), vec!["/keep/report.txt"]);
    }

    #[test]
    fn scopes_restrict_candidates() {
        let snapshot = snapshot_of(&["/p/a.txt", "/p/sub/a.txt", "/q/a.txt"]);
        assert_eq!(
            run_scoped(&snapshot, "a", ExclusionRules::new(), SearchScope::Children("/p".into())),
            vec!["/p/a.txt"]
        );
        assert_eq!(
            run_scoped(&snapshot, "a", ExclusionRules::new(), SearchScope::Subtree("/p".into())),
            vec!["/p/a.txt", "/p/sub/a.txt"]
        );
    }

    #[test]
    fn seeded_scope_filters_and_reranks_previous_hits() {
        let snapshot = snapshot_of(&["/d/rep", "/d/report", "/d/reports.txt", "/d/x"]);
        let query = Arc::new(CompiledQuery::compile("rep", false).expect("compile"));
        let seed = evaluate(
            snapshot.clone(),
            query,
            Arc::new(ExclusionRules::new()),
            SearchScope::All,
            CancellationToken::noop(),
        )
        .iter()
        .collect::<Vec<_>>();
        assert_eq!(seed.len(), 3);

        let refined = run_scoped(
            &snapshot,
            "report",
            ExclusionRules::new(),
            SearchScope::Seeded(seed.into()),
        );
        assert_eq!(refined, vec!["/d/report", "/d/reports.txt"]);
    }

    #[test]
    fn broad_wildcard_is_lazy() {
        let paths = (0..5_000).map(|i| format!("/data/file{i:05}.bin")).collect::<Vec<_>>();
        let refs = paths.iter().map(String::as_str).collect::<Vec<_>>();
        let snapshot = snapshot_of(&refs);
        let query = Arc::new(CompiledQuery::compile("*", false).expect("compile"));
        let evaluation = evaluate(
            snapshot,
            query,
            Arc::new(ExclusionRules::new()),
            SearchScope::All,
            CancellationToken::noop(),
        );
        let mut iter = evaluation.iter();
        let first = iter.next().expect("first match");
        assert_eq!(first.record().full_path, "/data/file00000.bin");
        assert_eq!(iter.examined, 1);
        assert_eq!(evaluation.iter().count(), 5_000);
    }

    #[test]
    fn cancellation_stops_production() {
        let paths = (0..5_000).map(|i| format!("/f{i}")).collect::<Vec<_>>();
        let refs = paths.iter().map(String::as_str).collect::<Vec<_>>();
        let snapshot = snapshot_of(&refs);
        let tracker = SearchVersionTracker::new();
        let token = tracker.token_for_version(tracker.next_version());
        let query = Arc::new(CompiledQuery::compile("*", false).expect("compile"));
        let evaluation = evaluate(
            snapshot,
            query,
            Arc::new(ExclusionRules::new()),
            SearchScope::All,
            token,
        );

        let mut iter = evaluation.iter();
        assert!(iter.next().is_some());
        tracker.next_version();
        let remaining = iter.by_ref().count();
        assert!(remaining < 5_000);
        assert!(iter.was_cancelled());
    }

    #[test]
    fn evaluation_matches_predicate_exactly() {
        let names = ["report.csv", "a.csv", "report.csv.bak", "report_draft.csv", "report_final.txt", "myreport.txt", "a.txt", "b.txt", "ab.txt", "data 1.txt"];
        let paths = names.iter().map(|n| format!("/d/{n}")).collect::<Vec<_>>();
        let refs = paths.iter().map(String::as_str).collect::<Vec<_>>();
        let snapshot = snapshot_of(&refs);

        for raw in ["report", "*.csv", "report*", "r?port*", "report -draft", "a.txt|b.txt", "\"data 1\"", "-csv"] {
            let query = CompiledQuery::compile(raw, false).expect("compile");
            let mut expected = snapshot
                .scan()
                .filter(|record| query.matches_record(record))
                .map(|record| record.full_path.clone())
                .collect::<Vec<_>>();
            expected.sort();
            let mut actual = run(&snapshot, raw, ExclusionRules::new());
            actual.sort();
            assert_eq!(actual, expected, "query {raw:?}");
        }
    }

    #[test]
    fn refinement_results_are_subsets() {
        let mut runner = TestRunner::new(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        });
        let strategy = (
            proptest::collection::vec("[a-c]{1,4}(\\.[a-c]{1,2})?", 1..40),
            "[a-c .*|!-]{0,6}",
            "[a-c .*|!-]{1,4}",
        );
        runner
            .run(&strategy, |(names, prefix, appended)| {
                let paths = names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| format!("/r/{i}/{n}"))
                    .collect::<Vec<_>>();
                let refs = paths.iter().map(String::as_str).collect::<Vec<_>>();
                let snapshot = snapshot_of(&refs);

                let prev = CompiledQuery::compile(&prefix, false).expect("no quotes in alphabet");
                let next_raw = format!("{prefix}{appended}");
                let next = CompiledQuery::compile(&next_raw, false).expect("no quotes in alphabet");
                if !crate::query::is_refinement(&prev, &next) {
                    return Ok(());
                }

                let before = run(&snapshot, &prefix, ExclusionRules::new())
                    .into_iter()
                    .collect::<BTreeSet<_>>();
                let after = run(&snapshot, &next_raw, ExclusionRules::new());
                for path in &after {
                    prop_assert!(before.contains(path), "{path} matched {next_raw:?} but not {prefix:?}");
                }
                Ok(())
            })
            .expect("refinement subset property");
    }

    #[test]
    fn appended_literal_characters_always_narrow() {
        let mut runner = TestRunner::new(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        });
        let strategy = (
            proptest::collection::vec("[a-c]{1,5}", 1..40),
            "[a-c]{1,3}",
            "[a-c]{1,3}",
        );
        runner
            .run(&strategy, |(names, prefix, appended)| {
                let paths = names.iter().enumerate().map(|(i, n)| format!("/r/{i}/{n}")).collect::<Vec<_>>();
                let refs = paths.iter().map(String::as_str).collect::<Vec<_>>();
                let snapshot = snapshot_of(&refs);
                let next_raw = format!("{prefix}{appended}");

                let prev = CompiledQuery::compile(&prefix, false).expect("compile");
                let next = CompiledQuery::compile(&next_raw, false).expect("compile");
                prop_assert!(crate::query::is_refinement(&prev, &next));

                let before = run(&snapshot, &prefix, ExclusionRules::new())
                    .into_iter()
                    .collect::<BTreeSet<_>>();
                for path in run(&snapshot, &next_raw, ExclusionRules::new()) {
                    prop_assert!(before.contains(&path));
                }
                Ok(())
            })
            .expect("literal refinement property");
    }
}
