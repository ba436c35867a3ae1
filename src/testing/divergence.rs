use super::{branch, counted_loop, function, if_then, if_then_else, jump, lane_values};
use crate::cfg::Terminator;
use crate::mask::LaneMask;
use crate::testing::{init_logging, run_traced, wavefront};
use color_eyre::eyre;
use pretty_assertions_sorted as diff;

#[test]
fn if_then_two_lanes() -> eyre::Result<()> {
    init_logging();
    // lane 0 takes the branch, lane 1 does not
    let compiled = if_then(&["v_cmp_eq_i32 vcc, v0, 0", "s_mov_b64 s[2:3], vcc"])?;
    let program = &compiled.program;
    diff::assert_eq!(
        program.instructions()[..4]
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![
            "v_cmp_eq_i32 vcc, v0, 0",
            "s_mov_b64 s[2:3], vcc",
            "s_and_saveexec_b64 s[4:5], s[2:3]",
            "v_mov_b32 v3, 1",
        ]
    );

    let mut wf = wavefront(2, 0b11);
    let trace = run_traced(&mut wf, program)?;
    // after the push
    diff::assert_eq!(trace.at_block(program, "then"), vec![LaneMask::from(0b01)]);
    // after the pop
    diff::assert_eq!(trace.at_block(program, "exit"), vec![LaneMask::from(0b11)]);
    diff::assert_eq!(lane_values(&wf, 3), vec![1, 0]);
    diff::assert_eq!(lane_values(&wf, 4), vec![1, 1]);
    diff::assert_eq!(wf.sregs.exec, LaneMask::from(0b11));
    Ok(())
}

#[test]
fn saved_mask_slot_skips_registers_used_by_kernel() -> eyre::Result<()> {
    init_logging();
    // s4 is live across the branch without being bound to a symbol
    let func = function(
        &[
            (
                "entry",
                &[
                    "s_movk_i32 s4, 42",
                    "v_cmp_eq_i32 vcc, v0, 0",
                    "s_mov_b64 s[2:3], vcc",
                ],
                branch("c", "then", "exit"),
            ),
            ("then", &["v_mov_b32 v3, 1"], jump("exit")),
            ("exit", &["v_mov_b32 v8, s4"], Terminator::Return),
        ],
        &[("c", 2)],
    )?;
    let compiled = crate::compile(func, None)?;
    assert_eq!(compiled.mask_stack.slots(), &[6]);
    assert!(compiled
        .program
        .instructions()
        .iter()
        .any(|inst| inst.to_string() == "s_and_saveexec_b64 s[6:7], s[2:3]"));

    let mut wf = wavefront(2, 0b11);
    run_traced(&mut wf, &compiled.program)?;
    diff::assert_eq!(lane_values(&wf, 3), vec![1, 0]);
    diff::assert_eq!(lane_values(&wf, 8), vec![42, 42]);
    Ok(())
}

#[test]
fn loop_exits_on_true_condition() -> eyre::Result<()> {
    init_logging();
    // the condition sequence is [true, true, false]
    let compiled = counted_loop(true)?;
    let program = &compiled.program;
    let mut wf = wavefront(1, 0b1);
    wf.lanes[0].vregs.write(5, 2)?;
    let trace = run_traced(&mut wf, program)?;

    // 1 & !true = 0 leaves the loop on the first head visit
    assert_eq!(trace.visits(program, "head"), 1);
    assert_eq!(trace.visits(program, "tail"), 0);
    assert_eq!(trace.at_block(program, "exit"), vec![LaneMask::ZERO]);
    assert_eq!(lane_values(&wf, 2), vec![0]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b1));
    Ok(())
}

#[test]
fn loop_exits_on_false_condition() -> eyre::Result<()> {
    let compiled = counted_loop(false)?;
    let program = &compiled.program;
    let mut wf = wavefront(1, 0b1);
    wf.lanes[0].vregs.write(5, 2)?;
    let trace = run_traced(&mut wf, program)?;

    assert_eq!(trace.visits(program, "head"), 3);
    assert_eq!(trace.visits(program, "tail"), 2);
    assert_eq!(lane_values(&wf, 2), vec![2]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b1));
    Ok(())
}

#[test]
fn loop_retires_lanes_one_by_one() -> eyre::Result<()> {
    let compiled = counted_loop(false)?;
    let program = &compiled.program;
    let mut wf = wavefront(4, 0b1111);
    for (lane, trips) in [3, 0, 1, 2].into_iter().enumerate() {
        wf.lanes[lane].vregs.write(5, trips)?;
    }
    let trace = run_traced(&mut wf, program)?;
    diff::assert_eq!(
        trace.at_block(program, "tail"),
        [0b1101, 0b1001, 0b0001]
            .into_iter()
            .map(LaneMask::from)
            .collect::<Vec<_>>()
    );
    diff::assert_eq!(lane_values(&wf, 2), vec![3, 0, 1, 2]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b1111));
    Ok(())
}

#[test]
fn if_then_else_partitions_lanes() -> eyre::Result<()> {
    let compiled = if_then_else()?;
    let program = &compiled.program;
    assert_eq!(
        program.ordering(),
        &[("then".to_string(), "else".to_string())]
    );
    let mut wf = wavefront(4, 0b1111);
    wf.sregs.write_pair(2, 0b0110)?;
    let trace = run_traced(&mut wf, program)?;
    assert_eq!(trace.at_block(program, "then"), vec![LaneMask::from(0b0110)]);
    assert_eq!(trace.at_block(program, "else"), vec![LaneMask::from(0b1001)]);
    assert_eq!(trace.at_block(program, "exit"), vec![LaneMask::from(0b1111)]);
    diff::assert_eq!(lane_values(&wf, 3), vec![2, 1, 1, 2]);
    Ok(())
}

#[test]
fn inactive_lanes_are_never_written() -> eyre::Result<()> {
    let compiled = if_then_else()?;
    let program = &compiled.program;
    let mut wf = wavefront(4, 0b0101);
    wf.sregs.write_pair(2, 0b0011)?;
    run_traced(&mut wf, program)?;
    diff::assert_eq!(lane_values(&wf, 3), vec![1, 0, 2, 0]);
    diff::assert_eq!(lane_values(&wf, 4), vec![1, 0, 1, 0]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b0101));
    Ok(())
}

#[test]
fn negated_branch() -> eyre::Result<()> {
    // if (!c) { v3 = 1 }
    let func = function(
        &[
            ("entry", &[], branch("c", "exit", "then")),
            ("then", &["v_mov_b32 v3, 1"], jump("exit")),
            ("exit", &[], Terminator::Return),
        ],
        &[("c", 2)],
    )?;
    let compiled = crate::compile(func, None)?;
    let program = &compiled.program;
    let mut wf = wavefront(4, 0b1111);
    wf.sregs.write_pair(2, 0b0011)?;
    let trace = run_traced(&mut wf, program)?;
    assert_eq!(trace.at_block(program, "then"), vec![LaneMask::from(0b1100)]);
    diff::assert_eq!(lane_values(&wf, 3), vec![0, 0, 1, 1]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b1111));
    Ok(())
}

#[test]
fn if_then_nested_in_loop() -> eyre::Result<()> {
    init_logging();
    // for (v2 = 0; v2 < v5; v2++) { if (v2 % 2 == 0) v7++ }
    let func = function(
        &[
            ("entry", &["v_mov_b32 v2, 0", "v_mov_b32 v7, 0"], jump("head")),
            (
                "head",
                &["v_cmp_lt_i32 vcc, v2, v5", "s_mov_b64 s[2:3], vcc"],
                branch("c", "body", "exit"),
            ),
            (
                "body",
                &[
                    "v_and_b32 v6, v2, 1",
                    "v_cmp_eq_i32 vcc, v6, 0",
                    "s_mov_b64 s[6:7], vcc",
                ],
                branch("even", "inc", "latch"),
            ),
            ("inc", &["v_add_i32 v7, v7, 1"], jump("latch")),
            ("latch", &["v_add_i32 v2, v2, 1"], jump("head")),
            ("exit", &[], Terminator::Return),
        ],
        &[("c", 2), ("even", 6)],
    )?;
    let compiled = crate::compile(func, None)?;
    // the loop and the nested if-then save their masks in different slots
    assert_eq!(compiled.mask_stack.slots().len(), 2);

    let program = &compiled.program;
    let mut wf = wavefront(4, 0b1111);
    for lane in 0..4 {
        wf.lanes[lane].vregs.write(5, lane as u32)?;
    }
    let trace = run_traced(&mut wf, program)?;
    diff::assert_eq!(lane_values(&wf, 2), vec![0, 1, 2, 3]);
    diff::assert_eq!(lane_values(&wf, 7), vec![0, 1, 1, 2]);
    assert_eq!(wf.sregs.exec, LaneMask::from(0b1111));
    for exec in trace.at_block(program, "inc") {
        assert!(exec.is_subset_of(&LaneMask::from(0b1110)));
    }
    Ok(())
}
