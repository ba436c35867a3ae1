use super::{counted_loop_with, if_then, if_then_else, lane_values, run_traced, wavefront};
use crate::mask::LaneMask;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After the push exec is M & C, after the pop it is M again.
    #[test]
    fn if_then_conserves_mask(mask in any::<u64>(), cond in any::<u64>(), lanes in 1usize..=64) {
        let compiled = if_then(&[]).unwrap();
        let program = &compiled.program;
        let mut wf = wavefront(lanes, mask);
        let m = wf.sregs.exec;
        wf.sregs.write_pair(2, cond).unwrap();
        let trace = run_traced(&mut wf, program).unwrap();

        let taken = m & LaneMask::from(cond);
        prop_assert_eq!(trace.at_block(program, "then"), vec![taken]);
        prop_assert_eq!(trace.at_block(program, "exit"), vec![m]);
        prop_assert_eq!(wf.sregs.exec, m);
        for (lane, value) in lane_values(&wf, 3).into_iter().enumerate() {
            prop_assert_eq!(value == 1, taken[lane]);
        }
    }

    /// Then sees M & C, Else sees M & !C, the two are disjoint and cover M.
    #[test]
    fn if_then_else_partitions_mask(mask in any::<u64>(), cond in any::<u64>(), lanes in 1usize..=64) {
        let compiled = if_then_else().unwrap();
        let program = &compiled.program;
        let mut wf = wavefront(lanes, mask);
        let m = wf.sregs.exec;
        wf.sregs.write_pair(2, cond).unwrap();
        let trace = run_traced(&mut wf, program).unwrap();

        let then = trace.at_block(program, "then");
        let otherwise = trace.at_block(program, "else");
        prop_assert_eq!(then.len(), 1);
        prop_assert_eq!(otherwise.len(), 1);
        prop_assert_eq!(then[0], m & LaneMask::from(cond));
        prop_assert!(then[0].is_disjoint(&otherwise[0]));
        prop_assert_eq!(then[0] | otherwise[0], m);
        prop_assert_eq!(trace.at_block(program, "exit"), vec![m]);
    }

    /// The mask only shrinks across iterations and the loop exits as soon
    /// as it is empty, whichever way the head branches to the exit.
    #[test]
    fn loop_mask_is_monotonic(
        trips in prop::collection::vec(0u32..6, 1..=16),
        mask in any::<u16>(),
        exit_if_true in any::<bool>(),
    ) {
        // both variants keep iterating while v2 < v5
        let compiled = if exit_if_true {
            counted_loop_with(true, "v_cmp_ge_i32 vcc, v2, v5")
        } else {
            counted_loop_with(false, "v_cmp_lt_i32 vcc, v2, v5")
        }
        .unwrap();
        let exit_op = if exit_if_true { "s_andn2_b64" } else { "s_and_b64" };
        let expected_exit = format!("{exit_op} exec, exec, s[2:3]");
        prop_assert!(compiled
            .program
            .instructions()
            .iter()
            .any(|inst| inst.to_string() == expected_exit));
        let program = &compiled.program;
        let mut wf = wavefront(trips.len(), u64::from(mask));
        for (lane, count) in trips.iter().enumerate() {
            wf.lanes[lane].vregs.write(5, *count).unwrap();
        }
        let m = wf.sregs.exec;
        let trace = run_traced(&mut wf, program).unwrap();

        let heads = trace.at_block(program, "head");
        prop_assert_eq!(heads[0], m);
        for pair in heads.windows(2) {
            prop_assert!(pair[1].is_subset_of(&pair[0]));
        }
        // no iteration runs with an empty mask
        prop_assert!(heads.iter().skip(1).all(|exec| !exec.is_empty()));
        let max_trips = m.active_lanes().map(|lane| trips[lane]).max().unwrap_or(0);
        prop_assert_eq!(heads.len(), max_trips as usize + 1);

        prop_assert_eq!(wf.sregs.exec, m);
        for (lane, value) in lane_values(&wf, 2).into_iter().enumerate() {
            let expected = if m[lane] { trips[lane] } else { 0 };
            prop_assert_eq!(value, expected);
        }
    }
}
