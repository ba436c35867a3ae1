use crate::config::Config;
use crate::dispatch::{self, Launch};
use crate::exec::Effect;
use crate::memory::Memory;
use crate::testing::{assemble, init_logging};
use crate::wavefront::State;
use crate::workgroup::{self, WorkGroup};
use crate::{barrier, Error};
use color_eyre::eyre;

fn config(wavefront_size: usize) -> Config {
    Config {
        wavefront_size,
        local_memory_size: 256,
        global_memory_size: 1024,
        ..Config::default()
    }
}

#[test]
fn four_wavefront_rendezvous() -> eyre::Result<()> {
    init_logging();
    let program = assemble(&[(
        "entry",
        &["v_mov_b32 v2, 1", "s_barrier", "v_mov_b32 v3, 2"],
    )])?;
    let mut wg = WorkGroup::new(0, 8, &config(2))?;
    let mut global = Memory::new(64);
    assert_eq!(wg.wavefronts.len(), 4);

    for wf in 0..3 {
        assert_eq!(wg.step(wf, &program, &mut global)?, Effect::Continue);
        assert_eq!(wg.step(wf, &program, &mut global)?, Effect::Barrier);
    }
    assert_eq!(wg.barrier().count(), 3);
    for wf in 0..3 {
        assert_eq!(wg.wavefronts[wf].state, State::WaitingAtBarrier);
    }
    assert_eq!(wg.runnable().collect::<Vec<_>>(), vec![3]);

    wg.step(3, &program, &mut global)?;
    assert_eq!(wg.step(3, &program, &mut global)?, Effect::Barrier);
    // all four released in the same step
    assert_eq!(wg.barrier().count(), 0);
    assert_eq!(wg.barrier().num_releases(), 1);
    assert!(wg.wavefronts.iter().all(|wf| wf.state == State::Running));

    for wf in 0..4 {
        while wg.step(wf, &program, &mut global)? != Effect::EndProgram {}
    }
    assert_eq!(wg.state, workgroup::State::Finished);
    Ok(())
}

#[test]
fn local_memory_exchange() -> eyre::Result<()> {
    init_logging();
    // out[gid] = 15 - lid, read from the slot another wavefront wrote
    let program = assemble(&[(
        "entry",
        &[
            "v_lshlrev_b32 v2, 2, v0",
            "ds_write_b32 v2, v0",
            "s_barrier",
            "v_sub_i32 v3, 15, v0",
            "v_lshlrev_b32 v3, 2, v3",
            "ds_read_b32 v4, v3",
            "v_lshlrev_b32 v6, 2, v1",
            "global_store_dword v6, v4",
        ],
    )])?;
    let config = config(4);
    let launch = Launch {
        grid: 32,
        work_group_size: 16,
    };
    let outcome = dispatch::run(&program, &config, launch, Memory::new(1024))?;
    let expected: Vec<u32> = (0..32).map(|gid| 15 - gid % 16).collect();
    assert_eq!(&outcome.global_memory.words()[..32], expected.as_slice());
    assert_eq!(outcome.stats.num_barrier_releases, 2);
    assert_eq!(outcome.stats.num_wavefronts, 8);
    Ok(())
}

#[test]
fn barrier_divergence_is_fatal() -> eyre::Result<()> {
    // wavefront 0 skips the barrier
    let program = assemble(&[
        ("entry", &["s_cmp_eq_i32 s1, 0", "s_cbranch_scc1 done"]),
        ("sync", &["s_barrier"]),
        ("done", &["s_waitcnt"]),
    ])?;
    let launch = Launch {
        grid: 8,
        work_group_size: 8,
    };
    let err = dispatch::run(&program, &config(4), launch, Memory::new(64)).unwrap_err();
    assert_eq!(
        err,
        dispatch::Error::WorkGroup(workgroup::Error::Barrier(
            barrier::Error::RetiredWhileWaiting {
                work_group: 0,
                wavefront: 0,
                waiting: vec![1],
            }
        ))
    );
    // the diagnostic names the wavefront at fault
    let message = Error::from(err).to_string();
    assert!(message.contains("wavefront 0 retired"), "{message}");
    Ok(())
}
