//! Turns a step result into a store commit.
//!
//! Pure: no store access. The caller supplies whether the strand still has
//! children and whether it keeps the lease for another step.

use chrono::{DateTime, Duration, Utc};

use crate::kernel::context::StepEffects;
use crate::kernel::deadline::Deadline;
use crate::kernel::error::StepError;
use crate::kernel::frame::{Frame, Link, PendingCall};
use crate::kernel::prog::ProgRegistry;
use crate::kernel::step::{normalize_return_value, StepResult, HIBERNATE_DAYS};
use crate::kernel::store::{ParentUpdate, StrandCommit, StrandUpdate};
use crate::kernel::strand::{NewStrand, Strand};

/// How long a strand that tried to return with live children waits.
pub const CHILDREN_PENDING_NAP_SECS: i64 = 1;

/// Inputs beyond the step result itself.
pub struct TransitionInput<'a> {
    pub strand: &'a Strand,
    pub frame: Frame,
    pub effects: StepEffects,
    pub registry: &'a ProgRegistry,
    pub now: DateTime<Utc>,
    pub has_children: bool,
    /// Continue running on this lease if the result allows it.
    pub keep_lease: bool,
}

/// Planned commit; `continues` when the dispatcher may run the next step
/// right away under the same lease.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub commit: StrandCommit,
    pub continues: bool,
}

pub fn plan(input: TransitionInput<'_>, result: StepResult) -> Result<Transition, StepError> {
    let TransitionInput {
        strand,
        mut frame,
        effects,
        registry,
        now,
        has_children,
        keep_lease,
    } = input;
    let mut stack = strand.stack.clone();
    let mut created = effects.buds;

    let (update, continues, parent_update) = match result {
        StepResult::Hop {
            label,
            frame_updates,
        } => {
            registry.validate_label(&strand.prog, &label)?;
            if let Some(updates) = frame_updates {
                frame.merge(updates);
            }
            frame.clear_retval();
            Deadline::clear_if_met(&mut frame, &label)?;
            replace_top(&mut stack, frame);
            let update = StrandUpdate::Continue {
                prog: strand.prog.clone(),
                label,
                stack,
                schedule: now,
            };
            (update, keep_lease, None)
        }
        StepResult::Nap(duration) => {
            replace_top(&mut stack, frame);
            (nap(strand, stack, now, duration), false, None)
        }
        StepResult::Push {
            prog,
            label,
            frame: mut child_frame,
            return_label,
        } => {
            registry.validate_label(&prog, &label)?;
            registry.validate_label(&strand.prog, &return_label)?;
            if frame.pending_call()?.is_some() {
                return Err(StepError::logic(format!(
                    "strand {} pushed while a call is pending",
                    strand.id
                )));
            }
            inherit_subject(&frame, &mut child_frame);
            let child = NewStrand::child(strand.id, prog, label, child_frame, now);
            frame.set_pending_call(&PendingCall {
                child_id: child.id,
                return_label,
            })?;
            created.push(child);
            replace_top(&mut stack, frame);
            let parked = nap(strand, stack, now, Duration::days(HIBERNATE_DAYS));
            (parked, false, None)
        }
        StepResult::Call {
            prog,
            label,
            frame: mut callee_frame,
            return_label,
        } => {
            registry.validate_label(&prog, &label)?;
            registry.validate_label(&strand.prog, &return_label)?;
            inherit_subject(&frame, &mut callee_frame);
            callee_frame.set_link(&Link {
                prog: strand.prog.clone(),
                label: return_label,
            })?;
            replace_top(&mut stack, frame);
            stack.push(callee_frame);
            let update = StrandUpdate::Continue {
                prog,
                label,
                stack,
                schedule: now,
            };
            (update, keep_lease, None)
        }
        StepResult::Pop(value) => {
            let value = normalize_return_value(value)?;
            if has_children || !created.is_empty() {
                replace_top(&mut stack, frame);
                let wait = Duration::seconds(CHILDREN_PENDING_NAP_SECS);
                (nap(strand, stack, now, wait), false, None)
            } else if stack.len() > 1 {
                stack.pop();
                let link = frame.link()?.ok_or_else(|| {
                    StepError::logic("expect no stacks exceeding depth 1 with no back-link")
                })?;
                registry.validate_label(&link.prog, &link.label)?;
                if let Some(top) = stack.last_mut() {
                    top.set_retval(value);
                    Deadline::clear_if_met(top, &link.label)?;
                }
                let update = StrandUpdate::Continue {
                    prog: link.prog,
                    label: link.label,
                    stack,
                    schedule: now,
                };
                (update, keep_lease, None)
            } else if let Some(parent_id) = strand.parent_id {
                let parent_update = ParentUpdate {
                    parent_id,
                    child_id: strand.id,
                    retval: value,
                };
                (StrandUpdate::Delete, false, Some(parent_update))
            } else {
                replace_top(&mut stack, frame);
                (StrandUpdate::Exit { exitval: value, stack }, false, None)
            }
        }
        StepResult::Exit(value) => {
            let value = normalize_return_value(value)?;
            if strand.parent_id.is_some() {
                return Err(StepError::logic(format!(
                    "child strand {} cannot exit, it must pop",
                    strand.id
                )));
            }
            replace_top(&mut stack, frame);
            if has_children || !created.is_empty() {
                let wait = Duration::seconds(CHILDREN_PENDING_NAP_SECS);
                (nap(strand, stack, now, wait), false, None)
            } else {
                (StrandUpdate::Exit { exitval: value, stack }, false, None)
            }
        }
    };

    let commit = StrandCommit {
        update,
        release_lease: !continues,
        created,
        semaphores_set: effects.signals,
        semaphores_consumed: effects.consumed,
        parent_update,
    };
    Ok(Transition { commit, continues })
}

fn nap(strand: &Strand, stack: Vec<Frame>, now: DateTime<Utc>, duration: Duration) -> StrandUpdate {
    StrandUpdate::Continue {
        prog: strand.prog.clone(),
        label: strand.label.clone(),
        stack,
        schedule: now + duration,
    }
}

fn replace_top(stack: &mut Vec<Frame>, frame: Frame) {
    match stack.last_mut() {
        Some(top) => *top = frame,
        None => stack.push(frame),
    }
}

fn inherit_subject(caller: &Frame, callee: &mut Frame) {
    if callee.subject_id().is_none() {
        if let Some(subject) = caller.subject_id() {
            callee.set_subject_id(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kernel::context::StepContext;
    use crate::kernel::identity::new_strand_id;
    use crate::kernel::prog::{Prog, ProgLabel};
    use crate::kernel::step::StepOutcome;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum L {
        Start,
        Wait,
    }

    impl ProgLabel for L {
        const ALL: &'static [Self] = &[Self::Start, Self::Wait];
        const START: Self = Self::Start;

        fn as_str(&self) -> &'static str {
            match self {
                Self::Start => "start",
                Self::Wait => "wait",
            }
        }
    }

    struct Caller;

    impl Prog for Caller {
        type Label = L;
        const NAME: &'static str = "Test::Caller";

        fn run(&self, _label: L, _ctx: &mut StepContext<'_>) -> StepOutcome {
            Ok(StepResult::hop(L::Wait))
        }
    }

    struct Callee;

    impl Prog for Callee {
        type Label = L;
        const NAME: &'static str = "Test::Callee";

        fn run(&self, _label: L, _ctx: &mut StepContext<'_>) -> StepOutcome {
            Ok(StepResult::pop_msg("done"))
        }
    }

    fn registry() -> ProgRegistry {
        ProgRegistry::builder()
            .register(Caller)
            .and_then(|b| b.register(Callee))
            .expect("register")
            .build()
    }

    fn strand(now: DateTime<Utc>) -> Strand {
        let id = new_strand_id();
        Strand::from_new(
            NewStrand::root(id, Caller::NAME, "start", Frame::for_subject(id), now),
            now,
        )
    }

    fn input<'a>(strand: &'a Strand, registry: &'a ProgRegistry, now: DateTime<Utc>) -> TransitionInput<'a> {
        TransitionInput {
            strand,
            frame: strand.top_frame().cloned().unwrap_or_default(),
            effects: StepEffects::default(),
            registry,
            now,
            has_children: false,
            keep_lease: true,
        }
    }

    #[test]
    fn hop_to_unknown_label_is_a_logic_fault() {
        let now = Utc::now();
        let registry = registry();
        let s = strand(now);
        let err = plan(
            input(&s, &registry, now),
            StepResult::Hop {
                label: "nowhere".into(),
                frame_updates: None,
            },
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn hop_clears_retval_and_met_deadline() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        s.stack[0].set_retval(json!({"msg": "x"}));
        Deadline::register(&mut s.stack[0], Some("wait"), Duration::minutes(1), false, now).unwrap();

        let t = plan(input(&s, &registry, now), StepResult::hop(L::Wait)).unwrap();
        assert!(t.continues);
        match t.commit.update {
            StrandUpdate::Continue { label, stack, .. } => {
                assert_eq!(label, "wait");
                assert!(stack[0].retval().is_none());
                assert!(Deadline::read(&stack[0]).unwrap().is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn push_creates_child_and_parks_caller() {
        let now = Utc::now();
        let registry = registry();
        let s = strand(now);
        let t = plan(
            input(&s, &registry, now),
            StepResult::push::<Callee, _>(L::Start, Frame::new(), L::Wait),
        )
        .unwrap();
        assert!(!t.continues);
        assert_eq!(t.commit.created.len(), 1);
        let child = &t.commit.created[0];
        assert_eq!(child.parent_id, Some(s.id));
        assert_eq!(child.stack[0].subject_id(), Some(s.id));
        match t.commit.update {
            StrandUpdate::Continue {
                label,
                stack,
                schedule,
                ..
            } => {
                assert_eq!(label, "start");
                let call = stack[0].pending_call().unwrap().expect("pending call");
                assert_eq!(call.child_id, child.id);
                assert_eq!(call.return_label, "wait");
                assert!(schedule > now + Duration::days(300));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn call_then_pop_returns_through_back_link() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        let called = plan(
            input(&s, &registry, now),
            StepResult::call::<Callee, _>(L::Start, Frame::new(), L::Wait),
        )
        .unwrap();
        let StrandUpdate::Continue {
            prog, label, stack, ..
        } = called.commit.update
        else {
            panic!("call must continue");
        };
        assert_eq!((prog.as_str(), label.as_str()), (Callee::NAME, "start"));
        s.prog = prog;
        s.label = label;
        s.stack = stack;

        let popped = plan(input(&s, &registry, now), StepResult::pop_msg("done")).unwrap();
        match popped.commit.update {
            StrandUpdate::Continue {
                prog, label, stack, ..
            } => {
                assert_eq!(prog, Caller::NAME);
                assert_eq!(label, "wait");
                assert_eq!(stack.len(), 1);
                assert_eq!(stack[0].retval(), Some(&json!({"msg": "done"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn return_through_back_link_clears_met_deadline() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        Deadline::register(&mut s.stack[0], Some("wait"), Duration::minutes(1), false, now).unwrap();
        let called = plan(
            input(&s, &registry, now),
            StepResult::call::<Callee, _>(L::Start, Frame::new(), L::Wait),
        )
        .unwrap();
        let StrandUpdate::Continue {
            prog, label, stack, ..
        } = called.commit.update
        else {
            panic!("call must continue");
        };
        assert!(Deadline::read(&stack[0]).unwrap().is_some());
        s.prog = prog;
        s.label = label;
        s.stack = stack;

        let popped = plan(input(&s, &registry, now), StepResult::pop_msg("done")).unwrap();
        match popped.commit.update {
            StrandUpdate::Continue { label, stack, .. } => {
                assert_eq!(label, "wait");
                assert!(Deadline::read(&stack[0]).unwrap().is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn return_through_back_link_keeps_unmet_deadline() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        Deadline::register(&mut s.stack[0], Some("start"), Duration::minutes(1), false, now).unwrap();
        let called = plan(
            input(&s, &registry, now),
            StepResult::call::<Callee, _>(L::Start, Frame::new(), L::Wait),
        )
        .unwrap();
        let StrandUpdate::Continue {
            prog, label, stack, ..
        } = called.commit.update
        else {
            panic!("call must continue");
        };
        s.prog = prog;
        s.label = label;
        s.stack = stack;

        let popped = plan(input(&s, &registry, now), StepResult::pop_msg("done")).unwrap();
        let StrandUpdate::Continue { stack, .. } = popped.commit.update else {
            panic!("pop through link must continue");
        };
        let deadline = Deadline::read(&stack[0]).unwrap().expect("deadline kept");
        assert_eq!(deadline.target.as_deref(), Some("start"));
    }

    #[test]
    fn deep_frame_without_link_is_a_bug() {
        let now = Utc::now();
        let registry = registry();
        let mut s = strand(now);
        s.stack.push(Frame::new());
        let err = plan(input(&s, &registry, now), StepResult::pop_msg("x")).unwrap_err();
        assert!(err.to_string().contains("back-link"));
    }

    #[test]
    fn pop_of_child_deletes_and_returns_to_parent() {
        let now = Utc::now();
        let registry = registry();
        let parent_id = new_strand_id();
        let child = Strand::from_new(
            NewStrand::child(parent_id, Callee::NAME, "start", Frame::new(), now),
            now,
        );
        let t = plan(input(&child, &registry, now), StepResult::pop_msg("ok")).unwrap();
        assert_eq!(t.commit.update, StrandUpdate::Delete);
        let parent_update = t.commit.parent_update.expect("parent update");
        assert_eq!(parent_update.parent_id, parent_id);
        assert_eq!(parent_update.retval, json!({"msg": "ok"}));
    }

    #[test]
    fn returning_with_live_children_naps() {
        let now = Utc::now();
        let registry = registry();
        let s = strand(now);
        let mut inp = input(&s, &registry, now);
        inp.has_children = true;
        let t = plan(inp, StepResult::exit_msg("bye")).unwrap();
        match t.commit.update {
            StrandUpdate::Continue { schedule, .. } => {
                assert_eq!(schedule, now + Duration::seconds(CHILDREN_PENDING_NAP_SECS))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_from_child_and_bad_values_are_bugs() {
        let now = Utc::now();
        let registry = registry();
        let child = Strand::from_new(
            NewStrand::child(new_strand_id(), Callee::NAME, "start", Frame::new(), now),
            now,
        );
        assert!(plan(input(&child, &registry, now), StepResult::exit_msg("x"))
            .unwrap_err()
            .is_fatal());
        let root = strand(now);
        assert!(plan(input(&root, &registry, now), StepResult::Pop(json!(42)))
            .unwrap_err()
            .is_fatal());
    }
}
