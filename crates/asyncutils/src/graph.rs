//! Dependency-gated startup runner.
//!
//! Units are registered up-front with the names of the units they depend on.
//! [`TaskGraph::run`] spawns every unit immediately, each parked behind its
//! own [`Latch`], then spawns a releaser per unit that waits for the unit's
//! prerequisites to finish successfully before opening the latch. A unit
//! whose prerequisite failed (or was itself skipped) never runs.
//!
//! Prerequisite names that were never registered are treated as already
//! satisfied, so a subsystem can declare a dependency on something that a
//! particular binary doesn't wire up.

use crate::gate::{Latch, gate};
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

type Completion = Shared<oneshot::Receiver<bool>>;

struct Unit<E> {
    name: String,
    requires: Vec<String>,
    body: BoxFuture<'static, Result<(), E>>,
}

/// Why a graph did not complete cleanly.
#[derive(Debug)]
pub enum Failure<E> {
    /// Two units were registered under the same name.
    DuplicateUnit(String),
    /// Prerequisites form a cycle passing through the named unit.
    Cycle(String),
    /// The unit's body returned an error.
    Failed { unit: String, error: E },
    /// The unit's body panicked.
    Panicked(String),
    /// The unit never ran because one of its prerequisites didn't succeed.
    Skipped(String),
}

impl<E> Failure<E> {
    /// Name of the unit the failure is about.
    pub fn unit(&self) -> &str {
        match self {
            Self::DuplicateUnit(unit) | Self::Cycle(unit) | Self::Panicked(unit) | Self::Skipped(unit) => unit,
            Self::Failed { unit, .. } => unit,
        }
    }
}

impl<E> Display for Failure<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::DuplicateUnit(unit) => write!(f, "unit `{unit}` registered more than once"),
            Self::Cycle(unit) => write!(f, "prerequisites form a cycle through `{unit}`"),
            Self::Failed { unit, .. } => write!(f, "unit `{unit}` failed"),
            Self::Panicked(unit) => write!(f, "unit `{unit}` panicked"),
            Self::Skipped(unit) => write!(f, "unit `{unit}` skipped after a prerequisite failed"),
        }
    }
}

impl<E: Debug> std::error::Error for Failure<E> {}

/// Named units of work with declared prerequisites.
///
/// # Examples
///
/// ```
/// use shelf_asyncutils::TaskGraph;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut graph = TaskGraph::<std::io::Error>::new();
/// graph.add("store", [] as [&str; 0], async { Ok(()) });
/// graph.add("registry", ["store"], async { Ok(()) });
/// graph.run().unwrap().wait_all().await.unwrap();
/// # }
/// ```
pub struct TaskGraph<E> {
    units: Vec<Unit<E>>,
}

impl<E> Default for TaskGraph<E> {
    fn default() -> Self {
        Self { units: Vec::new() }
    }
}

impl<E: Send + 'static> TaskGraph<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. Nothing runs until [`run`](Self::run).
    pub fn add<I, S, F>(&mut self, name: impl Into<String>, requires: I, body: F) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.units.push(Unit {
            name: name.into(),
            requires: requires.into_iter().map(Into::into).collect(),
            body: body.boxed(),
        });
        self
    }

    /// Unregister every unit with the given name.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.units.retain(|unit| unit.name != name);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Spawn every unit onto the current Tokio runtime.
    ///
    /// Fails without spawning anything if a name is registered twice or the
    /// declared prerequisites contain a cycle (which would otherwise park the
    /// units involved forever).
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self), fields(units = self.units.len()))]
    pub fn run(self) -> Result<Running<E>, Failure<E>> {
        self.validate()?;

        // First pass: every unit is spawned straight away, parked on its latch.
        let mut completions: HashMap<String, Completion> = HashMap::with_capacity(self.units.len());
        let mut latches: Vec<(Latch, String, Vec<String>)> = Vec::with_capacity(self.units.len());
        let mut handles = Vec::with_capacity(self.units.len());
        for unit in self.units {
            let (done_tx, done_rx) = oneshot::channel::<bool>();
            let (latch, gated) = gate(unit.body);
            let name = unit.name.clone();
            let handle = tokio::spawn(async move {
                let outcome = gated.await;
                debug!(unit = %name, ran = outcome.is_some(), "startup unit finished");
                _ = done_tx.send(matches!(outcome, Some(Ok(()))));
                outcome
            });
            completions.insert(unit.name.clone(), done_rx.shared());
            latches.push((latch, unit.name.clone(), unit.requires));
            handles.push((unit.name, handle));
        }

        // Second pass: release each latch once its prerequisites have completed.
        for (latch, name, requires) in latches {
            let prerequisites: Vec<Completion> =
                requires.iter().filter_map(|required| completions.get(required).cloned()).collect();
            tokio::spawn(async move {
                let satisfied = join_all(prerequisites).await.into_iter().all(|done| matches!(done, Ok(true)));
                if satisfied {
                    latch.release();
                } else {
                    debug!(unit = %name, "prerequisite did not succeed; unit will not run");
                }
            });
        }

        Ok(Running { handles })
    }

    fn validate(&self) -> Result<(), Failure<E>> {
        let mut edges: HashMap<&str, &[String]> = HashMap::with_capacity(self.units.len());
        for unit in &self.units {
            if edges.insert(&unit.name, &unit.requires).is_some() {
                return Err(Failure::DuplicateUnit(unit.name.clone()));
            }
        }
        // Iterative depth-first search; `visiting` holds the current path.
        let mut finished: HashSet<&str> = HashSet::new();
        for unit in &self.units {
            let mut visiting: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, usize)> = vec![(unit.name.as_str(), 0)];
            while let Some((name, next)) = stack.pop() {
                if next == 0 {
                    if finished.contains(name) {
                        continue;
                    }
                    if visiting.contains(&name) {
                        return Err(Failure::Cycle(name.to_string()));
                    }
                    visiting.push(name);
                }
                let requires = edges.get(name).copied().unwrap_or_default();
                match requires.get(next) {
                    Some(required) => {
                        stack.push((name, next + 1));
                        if edges.contains_key(required.as_str()) {
                            stack.push((required.as_str(), 0));
                        }
                    },
                    None => {
                        visiting.pop();
                        finished.insert(name);
                    },
                }
            }
        }
        Ok(())
    }
}

/// A graph whose units have all been spawned.
pub struct Running<E> {
    handles: Vec<(String, JoinHandle<Option<Result<(), E>>>)>,
}

impl<E> Running<E> {
    /// Wait for every unit to finish (or be skipped).
    ///
    /// Always waits for the whole graph before returning. The reported
    /// failure is the first unit (in registration order) whose body failed,
    /// then the first that panicked, then the first that was skipped.
    pub async fn wait_all(self) -> Result<(), Failure<E>> {
        let mut failed = None;
        let mut panicked = None;
        let mut skipped = None;
        for (unit, handle) in self.handles {
            match handle.await {
                Ok(Some(Ok(()))) => {},
                Ok(Some(Err(error))) => {
                    failed.get_or_insert(Failure::Failed { unit, error });
                },
                Ok(None) => {
                    skipped.get_or_insert(Failure::Skipped(unit));
                },
                Err(_) => {
                    panicked.get_or_insert(Failure::Panicked(unit));
                },
            }
        }
        match failed.or(panicked).or(skipped) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct Boom;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Future<Output = Result<(), Boom>> + use<> {
        let log = log.clone();
        async move {
            log.lock().await.push(name);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn units_run_after_their_prerequisites() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        // Registered in reverse so that registration order can't explain the result.
        graph.add("caches", ["recovery"], record(&log, "caches"));
        graph.add("recovery", ["store", "registry"], record(&log, "recovery"));
        graph.add("registry", ["store"], record(&log, "registry"));
        let slow_log = log.clone();
        graph.add("store", [] as [&str; 0], async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            slow_log.lock().await.push("store");
            Ok(())
        });
        graph.run().unwrap().wait_all().await.unwrap();
        assert_eq!(*log.lock().await, vec!["store", "registry", "recovery", "caches"]);
    }

    #[tokio::test]
    async fn unknown_prerequisites_are_satisfied() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add("recovery", ["not-wired-up"], record(&log, "recovery"));
        graph.run().unwrap().wait_all().await.unwrap();
        assert_eq!(*log.lock().await, vec!["recovery"]);
    }

    #[tokio::test]
    async fn failure_skips_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add("store", [] as [&str; 0], async { Err(Boom) });
        graph.add("registry", ["store"], record(&log, "registry"));
        graph.add("unrelated", [] as [&str; 0], record(&log, "unrelated"));
        let failure = graph.run().unwrap().wait_all().await.unwrap_err();
        assert!(matches!(failure, Failure::Failed { ref unit, error: Boom } if unit == "store"));
        assert_eq!(*log.lock().await, vec!["unrelated"]);
    }

    #[tokio::test]
    async fn panic_is_reported() {
        let mut graph = TaskGraph::<Boom>::new();
        graph.add("store", [] as [&str; 0], async {
            if true {
                panic!("disk on fire");
            }
            Ok(())
        });
        graph.add("registry", ["store"], async { Ok(()) });
        let failure = graph.run().unwrap().wait_all().await.unwrap_err();
        assert!(matches!(failure, Failure::Panicked(ref unit) if unit == "store"));
    }

    #[tokio::test]
    async fn removed_units_do_not_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        graph.add("store", [] as [&str; 0], record(&log, "store"));
        graph.add("caches", ["store"], record(&log, "caches"));
        graph.remove("caches");
        assert_eq!(graph.len(), 1);
        graph.run().unwrap().wait_all().await.unwrap();
        assert_eq!(*log.lock().await, vec!["store"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut graph = TaskGraph::<Boom>::new();
        graph.add("store", [] as [&str; 0], async { Ok(()) });
        graph.add("store", [] as [&str; 0], async { Ok(()) });
        assert!(matches!(graph.run(), Err(Failure::DuplicateUnit(_))));
    }

    type Shape = &'static [(&'static str, &'static [&'static str])];

    #[rstest]
    #[case::chain(&[("store", &[] as &[&str]), ("registry", &["store"] as &[&str])], false)]
    #[case::diamond(&[("store", &[] as &[&str]), ("registry", &["store"] as &[&str]), ("aliases", &["store"] as &[&str]), ("caches", &["registry", "aliases"] as &[&str])], false)]
    #[case::self_loop(&[("store", &["store"] as &[&str])], true)]
    #[case::ring(&[("a", &["c"] as &[&str]), ("b", &["a"] as &[&str]), ("c", &["b"] as &[&str]), ("d", &[] as &[&str])], true)]
    #[case::ring_behind_a_root(&[("root", &[] as &[&str]), ("a", &["root", "b"] as &[&str]), ("b", &["a"] as &[&str])], true)]
    #[tokio::test]
    async fn cycles_are_rejected_up_front(#[case] shape: Shape, #[case] cyclic: bool) {
        let mut graph = TaskGraph::<Boom>::new();
        for (name, requires) in shape {
            graph.add(*name, requires.iter().copied(), async { Ok(()) });
        }
        match graph.run() {
            Ok(running) => {
                assert!(!cyclic);
                running.wait_all().await.unwrap();
            },
            Err(failure) => assert!(cyclic && matches!(failure, Failure::Cycle(_))),
        }
    }
}
