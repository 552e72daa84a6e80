//! Integration tests for the amirun bridge
//!
//! End-to-end scenarios: guest code on the mock core calling host
//! libraries through jump tables, trampolines, nested runs and tasks.

use amirun::machine::{Code, Machine, Reg, QUICK_TRAP_BASE};
use amirun::memory::structure::layouts;
use amirun::memory::{RegionKind, TraceCategory};
use amirun::schedule::exec_mirror::{TS_READY, TS_WAIT};
use amirun::schedule::{EventRecorder, ExecListMirror, Fanout, SchedulerEventKind, TaskId};
use amirun::trap::opcodes;
use amirun::{BridgeError, LibrarySpec, MachineConfig, Trampoline};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Assemble guest code into a fresh region; returns its address
fn load(m: &mut Machine, name: &str, words: &[u16]) -> u32 {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let region = m
        .alloc_region(name, bytes.len() as u32, RegionKind::Flat)
        .unwrap();
    let addr = m.region_start(region).unwrap();
    m.mem().write_block(addr, &bytes).unwrap();
    addr
}

fn hi(v: u32) -> u16 {
    (v >> 16) as u16
}

fn lo(v: u32) -> u16 {
    v as u16
}

fn machine() -> Machine {
    amirun::logging::init_for_tests();
    Machine::with_mock_cpu(MachineConfig::default()).unwrap()
}

// ============================================================================
// Libraries
// ============================================================================

#[test]
fn test_guest_calls_library_through_jump_table() {
    let mut m = machine();
    let lib = m
        .create_library(
            LibrarySpec::new("math.library", 10)
                .version(39, 1)
                .function(-30, "Mul", |m, _| {
                    let product = m.reg(Reg::D0).wrapping_mul(m.reg(Reg::D1));
                    m.set_reg(Reg::D0, product);
                    Ok(())
                }),
        )
        .unwrap();
    let mul = lib.lvo_addr(-30);

    let prog = load(
        &mut m,
        "prog",
        &[
            opcodes::move_l_imm_dn(0), 0, 6,
            opcodes::move_l_imm_dn(1), 0, 7,
            opcodes::JSR_ABS_L, hi(mul), lo(mul),
            opcodes::RTS,
        ],
    );
    let state = m.run(Code::at(prog).get(Reg::D0).get(Reg::D1), "main");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(42));
    assert_eq!(state.reg(Reg::D1), Some(7));
    assert_eq!(m.traps().info().iter().find(|t| t.name == "math.library.Mul").map(|t| t.hits), Some(1));
}

#[test]
fn test_library_version_read_is_traced_as_field() {
    amirun::logging::init_for_tests();
    let mut config = MachineConfig::default();
    config.trace.enabled = true;
    config.trace.buffer_size = 10_000;
    let mut m = Machine::with_mock_cpu(config).unwrap();
    let lib = m
        .create_library(LibrarySpec::new("exec.library", 4).version(39, 47))
        .unwrap();
    let version = lib.base + 20;

    let prog = load(
        &mut m,
        "peek",
        &[opcodes::move_l_abs_dn(2), hi(version), lo(version), opcodes::RTS],
    );
    let state = m.run(Code::at(prog).get(Reg::D2), "peek");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D2), Some((39 << 16) | 47));

    let tracer = m.tracer().unwrap();
    let tracer = tracer.borrow();
    let reads: Vec<_> = tracer
        .events_for_field("lib_Version")
        .into_iter()
        .filter(|e| e.name.starts_with("R"))
        .collect();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].value, Some((39 << 16) | 47));
    assert_eq!(tracer.counters.traps, 1);
}

#[test]
fn test_unimplemented_function_returns_zero() {
    let mut m = machine();
    let lib = m
        .create_library(LibrarySpec::new("stub.library", 8))
        .unwrap();
    let call = lib.lvo_addr(-42);
    let prog = load(
        &mut m,
        "stub",
        &[opcodes::JSR_ABS_L, hi(call), lo(call), opcodes::RTS],
    );
    let state = m.run(Code::at(prog).set(Reg::D0, 0x55).get(Reg::D0), "stub");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(0));
}

// ============================================================================
// Trampolines and nested runs
// ============================================================================

#[test]
fn test_trampoline_cleanup_runs_exactly_once() {
    let mut m = machine();
    let free_before = m.alloc().free_bytes();
    let traps_before = m.traps().len();
    let cleanups = Rc::new(Cell::new(0));

    // guest callback the trampoline calls into
    let callback = load(&mut m, "callback", &[opcodes::moveq(0, 9), opcodes::RTS]);
    let free_after_callback = m.alloc().free_bytes();

    let mut tr = Trampoline::new("hook");
    tr.save_all_but_d0();
    tr.jsr(callback);
    tr.trap("check", |m, _| {
        assert_eq!(m.reg(Reg::D0), 9);
        m.set_reg(Reg::D0, 10);
        Ok(())
    });
    tr.restore_all_but_d0();
    let c = cleanups.clone();
    tr.final_return(move |_| {
        c.set(c.get() + 1);
        Ok(())
    });
    let fin = tr.finalize(&mut m).unwrap();
    assert!(m.traps().len() > traps_before);

    let state = m.run(Code::at(fin.code_addr).set(Reg::D3, 3).get(Reg::D0).get(Reg::D3), "hook");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(10));
    assert_eq!(state.reg(Reg::D3), Some(3));
    assert_eq!(cleanups.get(), 1);
    assert_eq!(m.traps().len(), traps_before);
    assert_eq!(m.alloc().free_bytes(), free_after_callback);
    assert!(free_after_callback < free_before);

    assert_eq!(
        m.release_trampoline(fin.id),
        Err(BridgeError::TrampolineReleased(fin.id.0))
    );
    assert_eq!(cleanups.get(), 1);
}

#[test]
fn test_library_function_runs_guest_hook() {
    let mut m = machine();
    let lib = m
        .create_library(LibrarySpec::new("utility.library", 6).function(
            -30,
            "CallHook",
            |m, _| {
                let hook = m.reg(Reg::A0);
                let arg = m.reg(Reg::D1);
                assert_eq!(m.nesting(), 1);
                let state = m.run(Code::at(hook).set(Reg::D0, arg).get(Reg::D0), "hook");
                if let Some(e) = state.error {
                    return Err(e);
                }
                let result = state.reg(Reg::D0).unwrap_or(0);
                m.set_reg(Reg::D0, result + 1);
                Ok(())
            },
        ))
        .unwrap();
    let call_hook = lib.lvo_addr(-30);

    let hook = load(&mut m, "hook", &[opcodes::addq_l_dn(0, 5), opcodes::RTS]);
    let prog = load(
        &mut m,
        "main",
        &[
            opcodes::movea_l_imm_an(0), hi(hook), lo(hook),
            opcodes::moveq(1, 30),
            opcodes::moveq(2, 2),
            opcodes::JSR_ABS_L, hi(call_hook), lo(call_hook),
            opcodes::RTS,
        ],
    );
    let state = m.run(Code::at(prog).get(Reg::D0).get(Reg::D2).get(Reg::A0), "main");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(36));
    assert_eq!(state.reg(Reg::D2), Some(2));
    assert_eq!(state.reg(Reg::A0), Some(hook));
    assert_eq!(m.nesting(), 0);
}

#[test]
fn test_quick_trap_callable_from_guest() {
    let mut m = machine();
    let hits = Rc::new(Cell::new(0));
    let h = hits.clone();
    let addr = m
        .setup_quick_trap("tick", move |m, _| {
            h.set(h.get() + 1);
            m.set_reg(Reg::D0, h.get());
            Ok(())
        })
        .unwrap();
    assert_eq!(addr, QUICK_TRAP_BASE);

    let prog = load(
        &mut m,
        "ticker",
        &[
            opcodes::JSR_ABS_L, hi(addr), lo(addr),
            opcodes::JSR_ABS_L, hi(addr), lo(addr),
            opcodes::RTS,
        ],
    );
    let state = m.run(Code::at(prog).get(Reg::D0), "ticker");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(2));
    assert_eq!(hits.get(), 2);
}

#[test]
fn test_invalid_guest_access_is_recorded() {
    let mut m = machine();
    let bad = 0x00F0_0000;
    let prog = load(
        &mut m,
        "wild",
        &[
            opcodes::moveq(0, 1),
            opcodes::move_l_abs_dn(0), hi(bad), lo(bad),
            opcodes::RTS,
        ],
    );
    let state = m.run(Code::at(prog).get(Reg::D0), "wild");
    assert!(state.done, "{:?}", state.error);
    assert_eq!(state.reg(Reg::D0), Some(0));
    assert_eq!(m.mem().invalid_count(), 1);
    let invalid = m.mem().invalid_accesses();
    assert_eq!(invalid[0].addr, bad);
}

// ============================================================================
// Tasks
// ============================================================================

const SIG_F: u32 = 0x100;

#[test]
fn test_two_tasks_signal_each_other() {
    let mut m = machine();

    let lists = m
        .alloc_struct("exec_lists", Arc::new(layouts::exec_lists().unwrap()))
        .unwrap();
    let lists_addr = m.region_start(lists).unwrap();
    let mirror = Rc::new(RefCell::new(
        ExecListMirror::new(m.mem().clone(), lists_addr).unwrap(),
    ));
    let recorder = Rc::new(RefCell::new(EventRecorder::default()));
    m.scheduler_mut()
        .set_observer(Box::new(Fanout::new().with(mirror.clone()).with(recorder.clone())));

    let mirror_in_signal = mirror.clone();
    let lib = m
        .create_library(
            LibrarySpec::new("exec.library", 60)
                .function(-318, "Wait", |m, _| {
                    let mask = m.reg(Reg::D0);
                    m.wait_signals(mask)?;
                    Ok(())
                })
                .function(-324, "Signal", move |m, _| {
                    let target = TaskId(m.reg(Reg::D1) as u64);
                    let guest = m.scheduler().task(target).and_then(|t| t.guest_task);
                    let guest = guest.unwrap_or(0);
                    {
                        let mirror = mirror_in_signal.borrow();
                        assert_eq!(mirror.wait_list(), vec![guest]);
                        assert_eq!(mirror.task_state(guest), TS_WAIT);
                    }
                    let woke = m.signal_task(target, m.reg(Reg::D0))?;
                    assert!(woke);
                    let mirror = mirror_in_signal.borrow();
                    assert_eq!(mirror.ready_list(), vec![guest]);
                    assert_eq!(mirror.task_state(guest), TS_READY);
                    Ok(())
                }),
        )
        .unwrap();
    let wait = lib.lvo_addr(-318);
    let signal = lib.lvo_addr(-324);

    let waiter = load(
        &mut m,
        "waiter",
        &[
            opcodes::move_l_imm_dn(0), hi(SIG_F), lo(SIG_F),
            opcodes::JSR_ABS_L, hi(wait), lo(wait),
            opcodes::RTS,
        ],
    );
    let signaller = load(
        &mut m,
        "signaller",
        &[
            opcodes::move_l_imm_dn(0), hi(SIG_F), lo(SIG_F),
            opcodes::JSR_ABS_L, hi(signal), lo(signal),
            opcodes::moveq(0, 0),
            opcodes::RTS,
        ],
    );

    let a = m.spawn_task("a", Code::at(waiter), None).unwrap();
    let b = m
        .spawn_task("b", Code::at(signaller).set(Reg::D1, a.0 as u32), None)
        .unwrap();
    let free_with_tasks = m.alloc().free_bytes();

    let exits = m.schedule().unwrap();
    assert_eq!(exits.len(), 2);
    assert_eq!((exits[0].id, exits[0].result), (b, 0));
    assert_eq!((exits[1].id, exits[1].result), (a, SIG_F));
    assert!(exits.iter().all(|e| e.error.is_none()));

    use SchedulerEventKind::*;
    assert_eq!(
        recorder.borrow().sequence(),
        vec![
            (NewTask, a),
            (NewTask, b),
            (ActiveTask, a),
            (WaitingTask, a),
            (ActiveTask, b),
            (WakeUp, a),
            (ReadyTask, a),
            (RemoveTask, b),
            (ActiveTask, a),
            (RemoveTask, a),
        ]
    );

    let mirror = mirror.borrow();
    assert!(mirror.ready_list().is_empty());
    assert!(mirror.wait_list().is_empty());
    assert_eq!(mirror.this_task(), 0);
    assert!(m.alloc().free_bytes() > free_with_tasks);
    assert_eq!(m.scheduler().num_tasks(), 0);
}

#[test]
fn test_waiting_forever_is_a_deadlock() {
    let mut m = machine();
    let wait = m
        .setup_quick_trap("wait", |m, _| {
            m.wait_signals(SIG_F)?;
            Ok(())
        })
        .unwrap();
    let prog = load(&mut m, "stuck", &[opcodes::JSR_ABS_L, hi(wait), lo(wait), opcodes::RTS]);
    m.spawn_task("stuck", Code::at(prog), None).unwrap();
    assert_eq!(m.schedule(), Err(BridgeError::Deadlock { waiting: 1 }));
    assert_eq!(m.shutdown(), 1);
}

#[test]
fn test_trace_records_scheduler_events() {
    let mut config = MachineConfig::default();
    config.trace.enabled = true;
    let mut m = Machine::with_mock_cpu(config).unwrap();
    let prog = load(&mut m, "noop", &[opcodes::RTS]);
    m.spawn_task("noop", Code::at(prog), None).unwrap();
    m.schedule().unwrap();

    let tracer = m.tracer().unwrap();
    let tracer = tracer.borrow();
    let names: Vec<_> = tracer
        .events_by_category(TraceCategory::Scheduler)
        .into_iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["new", "active", "remove"]);
    assert_eq!(tracer.counters.switches, 1);
}
