//! End-to-end engine behaviour through the dispatcher: push/pop, in-strand
//! calls, naps, semaphores, deadlines, fault policy, fan-out and lease
//! exclusion under concurrent workers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use strand_kernel::{
    new_strand_id, Clock, Frame, InMemoryStrandStore, KernelError, LeaseToken, ManualClock, Prog,
    ProgLabel, ProgRegistry, SqliteStrandStore, StepContext, StepError, StepOutcome, StepResult,
    Strand, StrandCommit, StrandId, StrandState, StrandStore, SystemClock,
};
use strand_runtime::{ControlPlane, Dispatcher, DispatcherConfig, PollReport, StrandScheduler};

macro_rules! labels {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        enum $name {
            $($variant),+
        }

        impl ProgLabel for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];
            const START: Self = Self::ALL[0];

            fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }
    };
}

labels!(ParentLabel { Start => "start", Wait => "wait" });
labels!(ChildLabel { Start => "start" });
labels!(SleeperLabel { Start => "start" });
labels!(CounterLabel { Wait => "wait" });
labels!(DeadlinedLabel { Start => "start", Work => "work", Done => "done" });
labels!(BuggyLabel { Start => "start" });
labels!(FanoutLabel { Start => "start", Await => "await" });
labels!(CallerLabel { Start => "start", Done => "done" });
labels!(ExclusiveLabel { Start => "start" });

struct Parent;

impl Prog for Parent {
    type Label = ParentLabel;
    const NAME: &'static str = "Test::Parent";

    fn run(&self, label: ParentLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            ParentLabel::Start => Ok(StepResult::push::<Child, _>(
                ChildLabel::Start,
                Frame::new(),
                ParentLabel::Wait,
            )),
            ParentLabel::Wait => Ok(StepResult::exit(
                ctx.retval().cloned().unwrap_or_else(|| json!({})),
            )),
        }
    }
}

struct Child;

impl Prog for Child {
    type Label = ChildLabel;
    const NAME: &'static str = "Test::Child";

    fn run(&self, _label: ChildLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        // The child sees the caller's subject.
        let subject = ctx.subject_id()?;
        Ok(StepResult::pop(json!({ "answer": 42, "subject": subject.to_string() })))
    }
}

struct Sleeper;

impl Prog for Sleeper {
    type Label = SleeperLabel;
    const NAME: &'static str = "Test::Sleeper";

    fn run(&self, _label: SleeperLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        if ctx.frame().contains_key("napped") {
            return Ok(StepResult::exit_msg("woke up"));
        }
        ctx.frame_mut().insert("napped", json!(true));
        Ok(StepResult::nap_secs(60))
    }
}

struct Counter;

impl Prog for Counter {
    type Label = CounterLabel;
    const NAME: &'static str = "Test::Counter";
    const SEMAPHORES: &'static [&'static str] = &["ping"];

    fn run(&self, _label: CounterLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        if ctx.when_set("ping")? {
            let seen = ctx.frame().get("seen").and_then(Value::as_u64).unwrap_or(0);
            ctx.frame_mut().insert("seen", json!(seen + 1));
        }
        Ok(StepResult::hibernate())
    }
}

struct Deadlined;

impl Prog for Deadlined {
    type Label = DeadlinedLabel;
    const NAME: &'static str = "Test::Deadlined";

    fn run(&self, label: DeadlinedLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            DeadlinedLabel::Start => {
                ctx.register_deadline(Some(DeadlinedLabel::Done), Duration::seconds(10), false)?;
                Ok(StepResult::hop(DeadlinedLabel::Work))
            }
            DeadlinedLabel::Work => Err(StepError::transient("dependency not ready")),
            DeadlinedLabel::Done => Ok(StepResult::exit_msg("done")),
        }
    }
}

struct Buggy;

impl Prog for Buggy {
    type Label = BuggyLabel;
    const NAME: &'static str = "Test::Buggy";

    fn run(&self, _label: BuggyLabel, _ctx: &mut StepContext<'_>) -> StepOutcome {
        Err(StepError::logic("broken invariant"))
    }
}

struct Fanout;

impl Prog for Fanout {
    type Label = FanoutLabel;
    const NAME: &'static str = "Test::Fanout";

    fn run(&self, label: FanoutLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            FanoutLabel::Start => {
                for _ in 0..3 {
                    ctx.bud::<Child>(ChildLabel::Start, Frame::new())?;
                }
                Ok(StepResult::hop(FanoutLabel::Await))
            }
            FanoutLabel::Await => {
                if ctx.leaf()? {
                    Ok(StepResult::exit_msg("all children returned"))
                } else {
                    Ok(StepResult::nap_secs(1))
                }
            }
        }
    }
}

struct Caller;

impl Prog for Caller {
    type Label = CallerLabel;
    const NAME: &'static str = "Test::Caller";

    fn run(&self, label: CallerLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            CallerLabel::Start => Ok(StepResult::call::<Child, _>(
                ChildLabel::Start,
                Frame::new(),
                CallerLabel::Done,
            )),
            CallerLabel::Done => Ok(StepResult::exit(
                ctx.retval().cloned().unwrap_or_else(|| json!({})),
            )),
        }
    }
}

fn registry() -> Arc<ProgRegistry> {
    let registry = ProgRegistry::builder()
        .register(Parent)
        .and_then(|b| b.register(Child))
        .and_then(|b| b.register(Sleeper))
        .and_then(|b| b.register(Counter))
        .and_then(|b| b.register(Deadlined))
        .and_then(|b| b.register(Buggy))
        .and_then(|b| b.register(Fanout))
        .and_then(|b| b.register(Caller))
        .expect("register test progs")
        .build();
    Arc::new(registry)
}

struct Harness {
    store: Arc<InMemoryStrandStore>,
    clock: Arc<ManualClock>,
    control: ControlPlane,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStrandStore::new());
        let clock = Arc::new(ManualClock::default());
        let registry = registry();
        let control = ControlPlane::new(store.clone(), registry.clone(), clock.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            clock.clone(),
            DispatcherConfig::new("worker-test"),
        );
        Self {
            store,
            clock,
            control,
            dispatcher,
        }
    }

    fn drain(&self) -> PollReport {
        let mut total = PollReport::default();
        for _ in 0..50 {
            let report = self.dispatcher.poll_once().expect("poll");
            let idle = report.is_idle();
            total.merge(&report);
            if idle {
                break;
            }
        }
        total
    }

    fn state(&self, id: StrandId) -> StrandState {
        self.control.status(id).expect("status").expect("strand").state
    }
}

#[test]
fn push_pop_delivers_child_value_and_deletes_child() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Parent>(id, ParentLabel::Start, Frame::new())
        .expect("assemble");

    let first = h.dispatcher.poll_once().expect("poll");
    assert_eq!(first.claimed, 1);
    let children = h.control.children(id).expect("children");
    assert_eq!(children.len(), 1);
    let child_id = children[0];

    h.drain();

    let status = h.control.status(id).expect("status").expect("parent");
    assert_eq!(status.state, StrandState::Exited);
    assert_eq!(
        status.exitval,
        Some(json!({ "answer": 42, "subject": id.to_string() }))
    );
    assert!(h.store.load(child_id).expect("load").is_none());
    assert!(h.control.children(id).expect("children").is_empty());
}

#[test]
fn in_strand_call_returns_through_back_link_in_one_poll() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Caller>(id, CallerLabel::Start, Frame::new())
        .expect("assemble");
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.steps, 3);
    let status = h.control.status(id).expect("status").expect("strand");
    assert_eq!(
        status.exitval,
        Some(json!({ "answer": 42, "subject": id.to_string() }))
    );
}

#[test]
fn nap_defers_until_schedule() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Sleeper>(id, SleeperLabel::Start, Frame::new())
        .expect("assemble");

    h.drain();
    assert_eq!(h.state(id), StrandState::Waiting);
    assert!(h.dispatcher.poll_once().expect("poll").is_idle());

    h.clock.advance(Duration::seconds(61));
    h.drain();
    assert_eq!(h.state(id), StrandState::Exited);
}

#[test]
fn repeated_signals_coalesce_into_one() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Counter>(id, CounterLabel::Wait, Frame::new())
        .expect("assemble");
    for _ in 0..3 {
        h.control.signal(id, "ping").expect("signal");
    }
    h.drain();
    let seen = |h: &Harness| {
        h.control.status(id).expect("status").expect("strand").stack[0]
            .get("seen")
            .and_then(Value::as_u64)
    };
    assert_eq!(seen(&h), Some(1));

    // Hibernating strand wakes on the next signal.
    h.control.signal(id, "ping").expect("signal");
    h.drain();
    assert_eq!(seen(&h), Some(2));
    assert!(h.control.semaphores().list(id).expect("list").is_empty());
}

#[test]
fn transient_faults_retry_until_deadline_makes_them_fatal() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Deadlined>(id, DeadlinedLabel::Start, Frame::new())
        .expect("assemble");

    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.retried, 1);
    assert_eq!(h.state(id), StrandState::Waiting);

    h.clock.advance(Duration::seconds(5));
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.retried, 1);
    let status = h.control.status(id).expect("status").expect("strand");
    assert_eq!(status.label, "work");
    assert_eq!(status.try_count, 2);

    h.clock.advance(Duration::seconds(6));
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.failed, 1);
    let status = h.control.status(id).expect("status").expect("strand");
    assert_eq!(status.state, StrandState::Failed);
    assert!(status
        .fault
        .as_deref()
        .unwrap_or_default()
        .contains("deadline exceeded at work"));

    h.clock.advance(Duration::minutes(5));
    assert!(h.dispatcher.poll_once().expect("poll").is_idle());
}

#[test]
fn logic_faults_are_fatal_immediately() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Buggy>(id, BuggyLabel::Start, Frame::new())
        .expect("assemble");
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.failed, 1);
    let status = h.control.status(id).expect("status").expect("strand");
    assert_eq!(status.state, StrandState::Failed);
    assert_eq!(status.fault.as_deref(), Some("BUG: broken invariant"));
}

#[test]
fn bud_fan_out_is_awaited_with_leaf() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Fanout>(id, FanoutLabel::Start, Frame::new())
        .expect("assemble");
    h.dispatcher.poll_once().expect("poll");
    assert_eq!(h.control.children(id).expect("children").len(), 3);
    assert_eq!(h.state(id), StrandState::Waiting);

    for _ in 0..5 {
        h.drain();
        h.clock.advance(Duration::seconds(2));
    }
    let status = h.control.status(id).expect("status").expect("strand");
    assert_eq!(status.state, StrandState::Exited);
    assert_eq!(
        status.exitval,
        Some(json!({"msg": "all children returned"}))
    );
}

#[test]
fn expired_lease_of_crashed_worker_is_reclaimed() {
    let h = Harness::new();
    let id = new_strand_id();
    h.control
        .assemble::<Caller>(id, CallerLabel::Start, Frame::new())
        .expect("assemble");

    let scheduler = StrandScheduler::new(
        h.store.clone(),
        h.dispatcher.config().lease.clone(),
        16,
    );
    let candidate = h.store.get(id).expect("strand");
    scheduler
        .claim(&candidate, "crashed-worker", h.clock.now())
        .expect("claim")
        .expect("lease");
    assert!(h.dispatcher.poll_once().expect("poll").is_idle());
    assert_eq!(h.state(id), StrandState::Running);

    h.clock.advance(Duration::seconds(121));
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.reclaimed, 1);
    assert_eq!(h.state(id), StrandState::Exited);
}

labels!(NeverLabel { Start => "start" });

struct Exclusive {
    active: Arc<Mutex<HashSet<StrandId>>>,
    violations: Arc<AtomicUsize>,
}

impl Prog for Exclusive {
    type Label = ExclusiveLabel;
    const NAME: &'static str = "Test::Exclusive";

    fn run(&self, _label: ExclusiveLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        let id = ctx.id();
        if !self.active.lock().unwrap().insert(id) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
        self.active.lock().unwrap().remove(&id);

        let runs = ctx.frame().get("runs").and_then(Value::as_u64).unwrap_or(0) + 1;
        ctx.frame_mut().insert("runs", json!(runs));
        if runs >= 5 {
            Ok(StepResult::exit_msg("done"))
        } else {
            Ok(StepResult::nap(Duration::zero()))
        }
    }
}

fn assert_lease_exclusion(store: Arc<dyn StrandStore>) {
    let violations = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(
        ProgRegistry::builder()
            .register(Exclusive {
                active: Arc::new(Mutex::new(HashSet::new())),
                violations: violations.clone(),
            })
            .expect("register")
            .build(),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let control = ControlPlane::new(store.clone(), registry.clone(), clock.clone());
    let ids: Vec<StrandId> = (0..6)
        .map(|_| {
            let id = new_strand_id();
            control
                .assemble::<Exclusive>(id, ExclusiveLabel::Start, Frame::new())
                .expect("assemble");
            id
        })
        .collect();

    let all_exited = || {
        ids.iter().all(|id| {
            store
                .load(*id)
                .expect("load")
                .is_some_and(|s| s.exitval.is_some())
        })
    };
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let dispatcher = Dispatcher::new(
                store.clone(),
                registry.clone(),
                clock.clone(),
                DispatcherConfig::new(format!("worker-{worker}")),
            );
            let all_exited = &all_exited;
            scope.spawn(move || {
                for _ in 0..2000 {
                    dispatcher.poll_once().expect("poll");
                    if all_exited() {
                        break;
                    }
                }
            });
        }
    });

    assert!(all_exited());
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_workers_never_run_a_strand_twice_in_memory() {
    assert_lease_exclusion(Arc::new(InMemoryStrandStore::new()));
}

#[test]
fn concurrent_workers_never_run_a_strand_twice_sqlite() {
    let path = std::env::temp_dir().join(format!("strand-engine-{}.db", uuid::Uuid::new_v4()));
    let store = SqliteStrandStore::open(path.to_str().expect("utf8 path")).expect("open");
    assert_lease_exclusion(Arc::new(store));
}

#[test]
fn unknown_prog_in_store_fails_the_strand() {
    let h = Harness::new();
    let id = new_strand_id();
    let now = h.clock.now();
    h.store
        .create(
            strand_kernel::NewStrand::root(id, "Test::Vanished", NeverLabel::START.as_str(), Frame::new(), now),
            now,
        )
        .expect("create");
    let report = h.dispatcher.poll_once().expect("poll");
    assert_eq!(report.failed, 1);
    assert_eq!(h.state(id), StrandState::Failed);
}

/// Delegates to an in-memory store but rejects the next `fail_commits`
/// commits with a store error.
struct FlakyCommitStore {
    inner: InMemoryStrandStore,
    fail_commits: AtomicUsize,
}

impl StrandStore for FlakyCommitStore {
    fn create(
        &self,
        strand: strand_kernel::NewStrand,
        now: DateTime<Utc>,
    ) -> Result<Strand, KernelError> {
        self.inner.create(strand, now)
    }

    fn load(&self, id: StrandId) -> Result<Option<Strand>, KernelError> {
        self.inner.load(id)
    }

    fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &HashSet<StrandId>,
    ) -> Result<Vec<Strand>, KernelError> {
        self.inner.list_runnable(now, limit, skip)
    }

    fn try_lease(
        &self,
        id: StrandId,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseToken>, KernelError> {
        self.inner.try_lease(id, owner, now, expires_at)
    }

    fn commit(
        &self,
        lease: &LeaseToken,
        commit: &StrandCommit,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let armed = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(KernelError::Store("disk I/O error".into()));
        }
        self.inner.commit(lease, commit, now)
    }

    fn release(
        &self,
        lease: &LeaseToken,
        try_count: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        self.inner.release(lease, try_count, retry_at)
    }

    fn mark_failed(&self, lease: &LeaseToken, fault: &str) -> Result<(), KernelError> {
        self.inner.mark_failed(lease, fault)
    }

    fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError> {
        self.inner.children(id)
    }

    fn set_semaphore(&self, id: StrandId, name: &str, now: DateTime<Utc>) -> Result<(), KernelError> {
        self.inner.set_semaphore(id, name, now)
    }

    fn semaphores(&self, id: StrandId) -> Result<Vec<String>, KernelError> {
        self.inner.semaphores(id)
    }

    fn consume_semaphore(&self, id: StrandId, name: &str) -> Result<bool, KernelError> {
        self.inner.consume_semaphore(id, name)
    }
}

#[test]
fn store_error_mid_run_releases_the_lease() {
    let store = Arc::new(FlakyCommitStore {
        inner: InMemoryStrandStore::new(),
        fail_commits: AtomicUsize::new(1),
    });
    let clock = Arc::new(ManualClock::default());
    let registry = registry();
    let control = ControlPlane::new(store.clone(), registry.clone(), clock.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        clock.clone(),
        DispatcherConfig::new("worker-flaky"),
    );
    let id = new_strand_id();
    control
        .assemble::<Sleeper>(id, SleeperLabel::Start, Frame::new())
        .expect("assemble");

    let report = dispatcher.poll_once().expect("poll");
    assert_eq!(report.claimed, 1);
    assert_eq!(report.errors, 1);

    let strand = store.get(id).expect("strand");
    assert!(strand.lease_owner.is_none());
    assert_eq!(strand.try_count, 0);

    // Claimable again at the same instant, well before the lease would expire.
    let now = clock.now();
    let token = store
        .try_lease(id, "worker-other", now, now + Duration::seconds(120))
        .expect("try_lease");
    assert!(token.is_some());
}

#[test]
fn strand_resumes_after_a_failed_commit() {
    let store = Arc::new(FlakyCommitStore {
        inner: InMemoryStrandStore::new(),
        fail_commits: AtomicUsize::new(1),
    });
    let clock = Arc::new(ManualClock::default());
    let registry = registry();
    let control = ControlPlane::new(store.clone(), registry.clone(), clock.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        clock.clone(),
        DispatcherConfig::new("worker-flaky"),
    );
    let id = new_strand_id();
    control
        .assemble::<Sleeper>(id, SleeperLabel::Start, Frame::new())
        .expect("assemble");

    assert_eq!(dispatcher.poll_once().expect("poll").errors, 1);
    assert_eq!(dispatcher.poll_once().expect("poll").claimed, 1);
    clock.advance(Duration::seconds(61));
    assert_eq!(dispatcher.poll_once().expect("poll").exited, 1);
    assert_eq!(
        control.status(id).expect("status").expect("strand").state,
        StrandState::Exited
    );
}
