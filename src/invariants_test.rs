//! Invariant Tests
//!
//! Properties that must hold for any sequence of operations, checked with
//! randomized inputs. Each module covers one subsystem.

#[cfg(test)]
mod region_invariants {
    use crate::memory::{AddressSpace, Region};
    use proptest::prelude::*;

    proptest! {
        /// Accepted regions are pairwise disjoint
        #[test]
        fn registered_regions_never_overlap(
            specs in prop::collection::vec((0u32..0x4000, 1u32..0x800), 1..24)
        ) {
            let mem = AddressSpace::default();
            for (i, (start, size)) in specs.iter().enumerate() {
                if let Ok(region) = Region::flat(format!("r{i}"), *start, *size) {
                    let _ = mem.register(region);
                }
            }
            let regions = mem.regions();
            for (i, a) in regions.iter().enumerate() {
                for b in &regions[i + 1..] {
                    let a_end = a.start as u64 + a.size as u64;
                    let b_end = b.start as u64 + b.size as u64;
                    prop_assert!(a_end <= b.start as u64 || b_end <= a.start as u64,
                        "{} and {} overlap", a.name, b.name);
                }
            }
        }

        /// resolve finds exactly the region covering an address, or none
        #[test]
        fn resolve_agrees_with_region_bounds(
            specs in prop::collection::vec((0u32..0x2000, 1u32..0x400), 1..12),
            addrs in prop::collection::vec(0u32..0x2400, 1..64)
        ) {
            let mem = AddressSpace::default();
            for (i, (start, size)) in specs.iter().enumerate() {
                if let Ok(region) = Region::flat(format!("r{i}"), *start, *size) {
                    let _ = mem.register(region);
                }
            }
            let regions = mem.regions();
            for addr in addrs {
                let covering = regions
                    .iter()
                    .find(|r| addr >= r.start && (addr as u64) < r.start as u64 + r.size as u64)
                    .map(|r| r.id);
                prop_assert_eq!(mem.resolve(addr), covering);
            }
        }
    }
}

#[cfg(test)]
mod trap_invariants {
    use crate::trap::{TrapCall, TrapFlags, TrapRegistry};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn noop(_: &mut (), _: &TrapCall) -> crate::error::BridgeResult<()> {
        Ok(())
    }

    proptest! {
        /// Bound ids are unique, in range, and freed ids come back
        #[test]
        fn trap_ids_are_unique_and_reused(
            ops in prop::collection::vec(any::<(bool, u8)>(), 1..200)
        ) {
            let capacity = 16;
            let mut traps: TrapRegistry<()> = TrapRegistry::new(capacity);
            let mut bound = Vec::new();
            let mut ever = HashSet::new();
            for (setup, pick) in ops {
                if setup || bound.is_empty() {
                    match traps.setup("t", TrapFlags::PERSISTENT, noop) {
                        Ok(id) => {
                            prop_assert!((id.0 as usize) < capacity);
                            prop_assert!(!bound.contains(&id));
                            bound.push(id);
                            ever.insert(id);
                        }
                        Err(e) => prop_assert!(e.is_exhaustion()),
                    }
                } else {
                    let id = bound.swap_remove(pick as usize % bound.len());
                    prop_assert!(traps.free(id).is_ok());
                    prop_assert!(traps.free(id).is_err());
                }
                prop_assert_eq!(traps.len(), bound.len());
            }
            prop_assert!(ever.len() <= capacity);
        }
    }
}

#[cfg(test)]
mod alloc_invariants {
    use crate::memory::{Allocator, FirstFitAllocator};
    use proptest::prelude::*;

    const BEGIN: u32 = 0x1000;
    const END: u32 = 0x9000;

    proptest! {
        /// Free bytes plus live bytes is constant, and live blocks are disjoint
        #[test]
        fn allocator_conserves_bytes(
            ops in prop::collection::vec((any::<bool>(), 1u32..0x1800, any::<u8>()), 1..120)
        ) {
            let mut alloc = FirstFitAllocator::new(BEGIN, END);
            let total = alloc.free_bytes();
            let mut live: Vec<(u32, u32)> = Vec::new();
            for (is_alloc, size, pick) in ops {
                if is_alloc || live.is_empty() {
                    if let Ok(addr) = alloc.alloc(size, "prop") {
                        let rounded = (size + 3) & !3;
                        prop_assert!(addr >= BEGIN && addr + rounded <= END);
                        prop_assert_eq!(addr % 4, 0);
                        live.push((addr, rounded));
                    }
                } else {
                    let (addr, size) = live.swap_remove(pick as usize % live.len());
                    prop_assert_eq!(alloc.free(addr).ok(), Some(size));
                }
                let used: u32 = live.iter().map(|(_, s)| s).sum();
                prop_assert_eq!(alloc.free_bytes() + used, total);
            }
            live.sort();
            for pair in live.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
        }
    }
}

#[cfg(test)]
mod task_invariants {
    use crate::machine::CpuContext;
    use crate::schedule::{Scheduler, TaskId, TaskState};
    use proptest::prelude::*;

    fn target(n: u8) -> TaskState {
        match n % 4 {
            0 => TaskState::Ready,
            1 => TaskState::Active,
            2 => TaskState::Waiting,
            _ => TaskState::Terminated,
        }
    }

    proptest! {
        /// Only legal edges are taken and at most one task is active
        #[test]
        fn task_transitions_follow_state_machine(
            requests in prop::collection::vec((0usize..4, any::<u8>()), 1..80)
        ) {
            let mut sched = Scheduler::new();
            let ids: Vec<TaskId> = (0..4)
                .map(|i| sched.add_task(format!("t{i}"), CpuContext::default(), None, None))
                .collect();
            for (which, to) in requests {
                let id = ids[which];
                let to = target(to);
                let Some(from) = sched.state(id) else {
                    continue;
                };
                match sched.request(id, to) {
                    Ok(()) => {
                        prop_assert!(from.can_transition_to(to), "{from:?} -> {to:?} accepted");
                        if to != TaskState::Terminated {
                            prop_assert_eq!(sched.state(id), Some(to));
                        } else {
                            prop_assert_eq!(sched.state(id), None);
                        }
                    }
                    Err(_) => prop_assert_eq!(sched.state(id), Some(from)),
                }

                let active: Vec<_> = ids
                    .iter()
                    .filter(|t| sched.state(**t) == Some(TaskState::Active))
                    .collect();
                prop_assert!(active.len() <= 1);
                prop_assert_eq!(active.first().copied().copied(), sched.active());
                for t in sched.ready_tasks() {
                    prop_assert_eq!(sched.state(t), Some(TaskState::Ready));
                }
                for t in sched.waiting_tasks() {
                    prop_assert_eq!(sched.state(t), Some(TaskState::Waiting));
                }
            }
        }
    }
}
