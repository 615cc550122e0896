//! 🔁 Retry with narrowing - each try resends only the keys that didn't stick.
//!
//! ```text
//! try 1: {a, b, c, d}  → store refuses {c, d}
//! try 2: {c, d}        → store refuses {d}
//! try 3: {d}           → store refuses {}      ✅ done early
//! ```
//!
//! Sets are never mutated in place: every try produces a fresh "remaining"
//! set from the previous one and the store's answer. Keys the store claims
//! to have refused but that were not part of the try are ignored.
//!
//! 💥 An `Err` from a try means the connection is in trouble. No further
//! tries for this batch; whatever was still pending is a failure. Keys that
//! were acknowledged earlier stay acknowledged.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::backends::Store;
use crate::common::Batch;

/// 🎯 One try: send `keys`, get back the ones that failed.
#[async_trait]
pub(crate) trait Attempt: Send {
    async fn attempt(&mut self, keys: &BTreeSet<String>) -> Result<BTreeSet<String>>;
}

/// 📦 The usual attempt: write the selected slice of a batch to a store.
pub(crate) struct BatchWrite<'a, S: Store> {
    pub store: &'a mut S,
    pub batch: &'a Batch,
}

#[async_trait]
impl<'a, S: Store> Attempt for BatchWrite<'a, S> {
    async fn attempt(&mut self, keys: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        self.store.set_many(&self.batch.select(keys)).await
    }
}

/// 🧾 How a retried write ended.
#[derive(Debug)]
pub(crate) struct RetryOutcome {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub tries: usize,
    /// 💥 set when a try errored and the remaining tries were abandoned
    pub aborted_by: Option<anyhow::Error>,
}

/// 🔁 Up to `max_tries` tries over a shrinking key set, sleeping
/// `pause(n)` before try `n + 1`.
pub(crate) async fn retry<A, F>(
    keys: BTreeSet<String>,
    attempt: &mut A,
    max_tries: usize,
    pause: F,
) -> RetryOutcome
where
    A: Attempt + ?Sized,
    F: Fn(u32) -> Duration,
{
    let mut remaining = keys.clone();
    let mut tries = 0;
    let mut aborted_by = None;

    while tries < max_tries && !remaining.is_empty() {
        if tries > 0 {
            let delay = pause(tries as u32);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        tries += 1;

        match attempt.attempt(&remaining).await {
            Ok(refused) => {
                remaining = remaining.intersection(&refused).cloned().collect();
            }
            Err(err) => {
                aborted_by = Some(err);
                break;
            }
        }
    }

    let succeeded = keys.difference(&remaining).cloned().collect();
    RetryOutcome {
        succeeded,
        failed: remaining,
        tries,
        aborted_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;

    /// 🎭 Scripted store answers, one per try. Runs out → everything succeeds.
    struct Scripted {
        answers: VecDeque<Result<BTreeSet<String>>>,
        seen: Vec<BTreeSet<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<BTreeSet<String>>>) -> Self {
            Self {
                answers: answers.into(),
                seen: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Attempt for Scripted {
        async fn attempt(&mut self, keys: &BTreeSet<String>) -> Result<BTreeSet<String>> {
            self.seen.push(keys.clone());
            self.answers.pop_front().unwrap_or_else(|| Ok(BTreeSet::new()))
        }
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn no_pause(_: u32) -> Duration {
        Duration::ZERO
    }

    #[tokio::test]
    async fn the_one_where_only_the_stragglers_are_resent() {
        let mut scripted = Scripted::new(vec![Ok(keys(&["c", "d"])), Ok(keys(&["d"]))]);
        let outcome = retry(keys(&["a", "b", "c", "d"]), &mut scripted, 5, no_pause).await;

        assert_eq!(scripted.seen, vec![keys(&["a", "b", "c", "d"]), keys(&["c", "d"]), keys(&["d"])]);
        assert_eq!(outcome.tries, 3);
        assert_eq!(outcome.succeeded, keys(&["a", "b", "c", "d"]));
        assert!(outcome.failed.is_empty());
        assert!(outcome.aborted_by.is_none());
    }

    #[tokio::test]
    async fn the_one_where_stubborn_keys_exhaust_the_budget() {
        let always = || Ok(keys(&["b"]));
        let mut scripted = Scripted::new((0..10).map(|_| always()).collect());
        let outcome = retry(keys(&["a", "b", "c"]), &mut scripted, 5, no_pause).await;

        assert_eq!(outcome.tries, 5);
        assert_eq!(outcome.failed, keys(&["b"]));
        assert_eq!(outcome.succeeded, keys(&["a", "c"]));
    }

    #[tokio::test]
    async fn the_one_where_an_error_stops_the_show_but_keeps_the_wins() {
        let mut scripted = Scripted::new(vec![
            Ok(keys(&["b", "c"])),
            Err(anyhow!("connection reset by peer")),
        ]);
        let outcome = retry(keys(&["a", "b", "c"]), &mut scripted, 5, no_pause).await;

        assert_eq!(outcome.tries, 2);
        assert_eq!(outcome.succeeded, keys(&["a"]));
        assert_eq!(outcome.failed, keys(&["b", "c"]));
        assert!(outcome.aborted_by.is_some());
    }

    #[tokio::test]
    async fn the_one_where_phantom_refusals_are_ignored() {
        let mut scripted = Scripted::new(vec![Ok(keys(&["zzz"]))]);
        let outcome = retry(keys(&["a"]), &mut scripted, 5, no_pause).await;

        assert_eq!(outcome.tries, 1);
        assert_eq!(outcome.succeeded, keys(&["a"]));
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn the_one_where_nothing_to_send_means_no_tries() {
        let mut scripted = Scripted::new(vec![]);
        let outcome = retry(BTreeSet::new(), &mut scripted, 5, no_pause).await;
        assert_eq!(outcome.tries, 0);
        assert!(scripted.seen.is_empty());
    }
}
