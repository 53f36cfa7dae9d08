use proptest::prelude::*;

use litani::exec::{classify, ExitResult, Outcome};

mod common;
use common::job;

fn spec_with_policy(
    ignore_returns: Vec<i32>,
    ok_returns: Vec<i32>,
    timeout_ok: bool,
    timeout_ignore: bool,
) -> litani::jobs::JobSpec {
    let mut spec = job("j", "true", &[], &[]);
    spec.ignore_returns = ignore_returns;
    spec.ok_returns = ok_returns;
    spec.timeout_ok = timeout_ok;
    spec.timeout_ignore = timeout_ignore;
    spec
}

proptest! {
    #[test]
    fn ignored_return_codes_always_succeed(
        rc in 1..=255i32,
        extra in proptest::collection::vec(0..=255i32, 0..4),
    ) {
        let mut ignore = extra;
        ignore.push(rc);
        let spec = spec_with_policy(ignore, vec![], false, false);

        let c = classify(ExitResult::Exited(rc), &spec, None);
        prop_assert_eq!(c.outcome, Outcome::Success);
        prop_assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn zero_exit_with_no_policy_succeeds(
        ok_returns in proptest::collection::vec(1..=255i32, 0..4),
    ) {
        let spec = spec_with_policy(vec![], ok_returns, false, false);
        let c = classify(ExitResult::Exited(0), &spec, None);
        prop_assert_eq!(c.outcome, Outcome::Success);
        prop_assert_eq!(c.wrapper_return_code, 0);
    }

    #[test]
    fn timeout_ok_always_succeeds(
        ignore in proptest::collection::vec(0..=255i32, 0..4),
        ok in proptest::collection::vec(0..=255i32, 0..4),
    ) {
        let spec = spec_with_policy(ignore, ok, true, false);
        let c = classify(ExitResult::TimedOut, &spec, None);
        prop_assert_eq!(c.outcome, Outcome::Success);
    }

    #[test]
    fn wrapper_code_is_zero_iff_outcome_is_not_fail(
        rc in 0..=255i32,
        ignore in proptest::collection::vec(0..=255i32, 0..3),
        ok in proptest::collection::vec(0..=255i32, 0..3),
    ) {
        let spec = spec_with_policy(ignore, ok, false, false);
        let c = classify(ExitResult::Exited(rc), &spec, None);
        match c.outcome {
            Outcome::Fail => prop_assert_ne!(c.wrapper_return_code, 0),
            _ => prop_assert_eq!(c.wrapper_return_code, 0),
        }
    }
}
