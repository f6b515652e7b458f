// C4: runtime debug bridge. Owns the control region and the snapshot region and implements the
// pause/resume protocol between the executor (runs the instrumented module) and the inspector
// (runs the UI), per spec.md §4.4. Deliberately engine-agnostic: both regions are modeled as
// slices of atomics rather than any particular WASM engine's memory type, so this module has no
// `wasmtime` dependency -- `host.rs` is where a concrete engine's shared memory gets bridged in.
use crate::instrument::StepMapEntry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

pub const CONTROL_MIN_SLOTS: usize = 256;
pub const SLOT_STATE: usize = 0;
pub const SLOT_STEP_ID: usize = 1;
pub const SLOT_FRAME_DEPTH: usize = 3;
pub const SLOT_FRAME_BASE: usize = 4;
pub const SLOT_TRACKER_ALLOCS_PTR: usize = 128;
pub const SLOT_TRACKER_COUNT_PTR: usize = 129;
pub const MAX_FRAMES: usize = (SLOT_TRACKER_ALLOCS_PTR - SLOT_FRAME_BASE) / 3;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlState {
    Paused = 1,
    Stop = 2,
    Running = 3,
}
impl ControlState {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => ControlState::Paused,
            2 => ControlState::Stop,
            _ => ControlState::Running,
        }
    }
}

// A view over the shared control region: slot 0 is the state machine, slot 1 the last step id,
// slot 3 the frame depth, slots [4, 128) the frame table, slots 128/129 the allocation tracker's
// exported addresses (spec.md §3 "Debug control region").
pub struct ControlRegion<'a> {
    slots: &'a [AtomicI32],
}

impl<'a> ControlRegion<'a> {
    pub fn new(slots: &'a [AtomicI32]) -> Self {
        assert!(slots.len() >= CONTROL_MIN_SLOTS, "control region must have at least {} slots", CONTROL_MIN_SLOTS);
        ControlRegion {slots}
    }

    pub fn state(&self) -> ControlState { ControlState::from_i32(self.slots[SLOT_STATE].load(Ordering::Acquire)) }
    pub fn set_state(&self, s: ControlState) { self.slots[SLOT_STATE].store(s as i32, Ordering::Release); }

    pub fn step_id(&self) -> u32 { self.slots[SLOT_STEP_ID].load(Ordering::Acquire) as u32 }
    pub fn set_step_id(&self, id: u32) { self.slots[SLOT_STEP_ID].store(id as i32, Ordering::Release); }

    pub fn frame_depth(&self) -> usize { self.slots[SLOT_FRAME_DEPTH].load(Ordering::Acquire).max(0) as usize }
    pub fn set_frame_depth(&self, depth: usize) { self.slots[SLOT_FRAME_DEPTH].store(depth as i32, Ordering::Release); }

    pub fn set_frame(&self, k: usize, id: i32, sp: i32, size: i32) {
        let base = SLOT_FRAME_BASE + 3 * k;
        self.slots[base].store(id, Ordering::Release);
        self.slots[base + 1].store(sp, Ordering::Release);
        self.slots[base + 2].store(size, Ordering::Release);
    }
    pub fn frame(&self, k: usize) -> (i32, i32, i32) {
        let base = SLOT_FRAME_BASE + 3 * k;
        (
            self.slots[base].load(Ordering::Acquire),
            self.slots[base + 1].load(Ordering::Acquire),
            self.slots[base + 2].load(Ordering::Acquire),
        )
    }

    pub fn set_tracker_addresses(&self, allocs_ptr: i32, count_ptr: i32) {
        self.slots[SLOT_TRACKER_ALLOCS_PTR].store(allocs_ptr, Ordering::Release);
        self.slots[SLOT_TRACKER_COUNT_PTR].store(count_ptr, Ordering::Release);
    }
    pub fn tracker_addresses(&self) -> (i32, i32) {
        (
            self.slots[SLOT_TRACKER_ALLOCS_PTR].load(Ordering::Acquire),
            self.slots[SLOT_TRACKER_COUNT_PTR].load(Ordering::Acquire),
        )
    }
}

// A byte-for-byte mirror of linear memory at pause time (spec.md §3 "Memory snapshot region").
pub struct SnapshotRegion<'a> {
    bytes: &'a [AtomicU8],
}
impl<'a> SnapshotRegion<'a> {
    pub fn new(bytes: &'a [AtomicU8]) -> Self { SnapshotRegion {bytes} }
    pub fn capacity(&self) -> usize { self.bytes.len() }

    pub fn write_mirror(&self, src: &[u8]) {
        let n = src.len().min(self.bytes.len());
        for (slot, byte) in self.bytes[..n].iter().zip(&src[..n]) {
            slot.store(*byte, Ordering::Relaxed);
        }
    }

    // Copies out of the shared region into a non-shared owned buffer -- the inspector never
    // aliases the shared region into typed views that escape to long-lived UI state (spec.md
    // §4.4 inspector side).
    pub fn read_snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

#[derive(Debug, Clone)]
struct Frame {
    id: u64,
    function: String,
    line: usize,
    sp: i32,
    size: i32,
}

// Distinguished stop sentinel (spec.md §7 "Executor sentinel", §9 "replace [exceptions] with a
// sentinel result propagated up the call chain").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Stop;
pub type HookResult = std::result::Result<(), Stop>;

// Runs on the executor's single thread alongside the instrumented module.
pub struct ExecutorBridge<'a> {
    control: ControlRegion<'a>,
    snapshot: SnapshotRegion<'a>,
    step_map: &'a [StepMapEntry],
    frames: Vec<Frame>,
    next_frame_id: u64,
}

impl<'a> ExecutorBridge<'a> {
    pub fn new(control: ControlRegion<'a>, snapshot: SnapshotRegion<'a>, step_map: &'a [StepMapEntry]) -> Self {
        control.set_state(ControlState::Running);
        ExecutorBridge {control, snapshot, step_map, frames: Vec::new(), next_frame_id: 0}
    }

    pub fn depth(&self) -> usize { self.frames.len() }

    // enter-hook(frameSize, spDelta): push a new frame with a fresh opaque id (spec.md §4.4).
    pub fn on_enter(&mut self, frame_size: i32, _sp_delta: i32, stack_pointer: i32) {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(Frame {id, function: String::new(), line: 0, sp: stack_pointer, size: frame_size});
    }

    // exit-hook: pop a frame (spec.md §4.4).
    pub fn on_exit(&mut self) {
        self.frames.pop();
    }

    // step-hook(stepId): mirror memory, update the top frame, publish the control region, pause,
    // and spin until resumed or stopped (spec.md §4.4 "On each step-hook invocation").
    pub fn on_step(&mut self, step_id: u32, linear_memory: &[u8], stack_pointer: i32, tracker_allocs_ptr: i32, tracker_count_ptr: i32) -> HookResult {
        self.snapshot.write_mirror(linear_memory);

        if let Some(entry) = self.step_map.get(step_id as usize) {
            if let Some(top) = self.frames.last_mut() {
                top.function = entry.function.clone();
                top.line = entry.line;
                top.sp = stack_pointer;
            }
        }

        self.control.set_step_id(step_id);
        let depth = self.frames.len().min(MAX_FRAMES);
        self.control.set_frame_depth(depth);
        for (k, frame) in self.frames.iter().enumerate().take(MAX_FRAMES) {
            self.control.set_frame(k, frame.id as i32, frame.sp, frame.size);
        }
        self.control.set_tracker_addresses(tracker_allocs_ptr, tracker_count_ptr);

        self.control.set_state(ControlState::Paused);
        loop {
            match self.control.state() {
                ControlState::Paused => std::hint::spin_loop(),
                ControlState::Stop => return Err(Stop),
                ControlState::Running => return Ok(()),
            }
        }
    }
}

// A named call frame as reconstructed by the inspector (spec.md §3 "Call frame": id, function
// name, source line, stack pointer, frame size). The control region's frame slots only carry the
// numeric (id, sp, size) triple; function/line are recovered from the step map, since only the
// top frame's line changes on a given pause and lower frames keep whatever was last recorded for
// them (they were each the top frame at some earlier pause).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameView {
    pub id: u64,
    pub function: String,
    pub line: usize,
    pub sp: i32,
    pub size: i32,
}

// Bounds how far step-back can travel (spec.md §6 "step-back: navigate within the recorded step
// history"). Same bounded ring-buffer shape as `log::Log`.
pub const HISTORY_CAPACITY: usize = 1024;

// One recorded pause: the inputs `memview::read_snapshot` needs to reproduce that pause's typed
// view exactly (spec.md §8 scenario 6: "restores the prior line, frame vector, and memory
// snapshot exactly equal to those recorded at step 4").
#[derive(Debug, Clone)]
pub struct PausedState {
    pub step_id: u32,
    pub bytes: Vec<u8>,
    pub frames: Vec<FrameView>,
    pub tracker: (i32, i32),
}

// Runs on the inspector's polling task.
pub struct InspectorBridge<'a> {
    control: ControlRegion<'a>,
    snapshot: SnapshotRegion<'a>,
    step_map: &'a [StepMapEntry],
    local_frames: Vec<FrameView>,
    last_step_id: Option<u32>,
    history: VecDeque<PausedState>,
    cursor: usize,
}

impl<'a> InspectorBridge<'a> {
    pub fn new(control: ControlRegion<'a>, snapshot: SnapshotRegion<'a>, step_map: &'a [StepMapEntry]) -> Self {
        InspectorBridge {control, snapshot, step_map, local_frames: Vec::new(), last_step_id: None, history: VecDeque::new(), cursor: 0}
    }

    // Returns a fresh snapshot + named frame table + allocation-tracker addresses only on a newly
    // observed pause; `None` on a stale or not-yet-paused read (spec.md §7 "shared-region
    // contention anomaly": tolerate by waiting for the next tick rather than erroring).
    pub fn poll(&mut self) -> Option<(Vec<u8>, Vec<FrameView>, u32, (i32, i32))> {
        if self.control.state() != ControlState::Paused {
            return None;
        }
        let step_id = self.control.step_id();
        if self.last_step_id == Some(step_id) {
            return None;
        }
        self.last_step_id = Some(step_id);

        let depth = self.control.frame_depth();
        self.local_frames.truncate(depth);
        while self.local_frames.len() < depth {
            let k = self.local_frames.len();
            let (id, sp, size) = self.control.frame(k);
            self.local_frames.push(FrameView {id: id as u64, function: String::new(), line: 0, sp, size});
        }
        for k in 0..depth {
            let (id, sp, size) = self.control.frame(k);
            let f = &mut self.local_frames[k];
            f.id = id as u64;
            f.sp = sp;
            f.size = size;
        }
        if let (Some(entry), Some(top)) = (self.step_map.get(step_id as usize), self.local_frames.last_mut()) {
            top.function = entry.function.clone();
            top.line = entry.line;
        }

        let bytes = self.snapshot.read_snapshot();
        let frames = self.local_frames.clone();
        let tracker = self.control.tracker_addresses();

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(PausedState {step_id, bytes: bytes.clone(), frames: frames.clone(), tracker});
        self.cursor = self.history.len() - 1;

        Some((bytes, frames, step_id, tracker))
    }

    pub fn resume(&self) { self.control.set_state(ControlState::Running); }
    pub fn stop(&self) { self.control.set_state(ControlState::Stop); }

    // True once the view cursor sits on the most recently observed pause -- a "step" command here
    // must resume the executor; anywhere else it replays from `history` instead (spec.md §8
    // scenario 6: "stepping forward again replays step 5 without re-executing the program").
    pub fn at_live_tip(&self) -> bool {
        self.history.is_empty() || self.cursor + 1 == self.history.len()
    }

    // Moves the view one recorded pause back without touching the executor. `None` if already at
    // the oldest state still retained in `history`.
    pub fn step_back(&mut self) -> Option<&PausedState> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.history.get(self.cursor)
    }

    // Moves the view one recorded pause forward by replaying `history`, without resuming the
    // executor. `None` once the cursor reaches the live tip -- the caller should `resume()`.
    pub fn step_forward_in_history(&mut self) -> Option<&PausedState> {
        if self.at_live_tip() {
            return None;
        }
        self.cursor += 1;
        self.history.get(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_control() -> Vec<AtomicI32> {
        (0..CONTROL_MIN_SLOTS).map(|_| AtomicI32::new(0)).collect()
    }

    #[test]
    fn control_region_round_trips_frame_slots() {
        let slots = fresh_control();
        let region = ControlRegion::new(&slots);
        region.set_frame_depth(2);
        region.set_frame(0, 1, 100, 16);
        region.set_frame(1, 2, 84, 32);
        region.set_tracker_addresses(9000, 9004);
        assert_eq!(region.frame_depth(), 2);
        assert_eq!(region.frame(0), (1, 100, 16));
        assert_eq!(region.frame(1), (2, 84, 32));
        assert_eq!(region.tracker_addresses(), (9000, 9004));
    }

    #[test]
    #[should_panic]
    fn control_region_rejects_undersized_slice() {
        let slots: Vec<AtomicI32> = (0..10).map(|_| AtomicI32::new(0)).collect();
        ControlRegion::new(&slots);
    }

    #[test]
    fn enter_exit_balances_frame_stack() {
        let control = fresh_control();
        let snapshot: Vec<AtomicU8> = (0..4).map(|_| AtomicU8::new(0)).collect();
        let step_map: Vec<StepMapEntry> = Vec::new();
        let mut exec = ExecutorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);
        exec.on_enter(32, -32, 500);
        exec.on_enter(16, -16, 468);
        assert_eq!(exec.depth(), 2);
        exec.on_exit();
        assert_eq!(exec.depth(), 1);
        exec.on_exit();
        assert_eq!(exec.depth(), 0);
    }

    #[test]
    fn pause_resume_round_trip_across_threads() {
        let control = fresh_control();
        let snapshot: Vec<AtomicU8> = (0..16).map(|_| AtomicU8::new(0)).collect();
        let step_map = vec![StepMapEntry {line: 5, function: "main".to_string()}];

        std::thread::scope(|scope| {
            let exec_handle = scope.spawn(|| {
                let mut exec = ExecutorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);
                exec.on_enter(16, -16, 1000);
                let result = exec.on_step(0, &[1, 2, 3, 4], 1000, 2000, 2004);
                exec.on_exit();
                result
            });

            let mut inspector = InspectorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);
            let mut observed = None;
            while observed.is_none() {
                observed = inspector.poll();
                std::hint::spin_loop();
            }
            let (bytes, frames, step_id, tracker) = observed.unwrap();
            assert_eq!(step_id, 0);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].function, "main");
            assert_eq!(frames[0].line, 5);
            assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
            assert_eq!(tracker, (2000, 2004));
            inspector.resume();

            assert_eq!(exec_handle.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn stop_sentinel_propagates() {
        let control = fresh_control();
        let snapshot: Vec<AtomicU8> = (0..4).map(|_| AtomicU8::new(0)).collect();
        let step_map = vec![StepMapEntry {line: 1, function: "main".to_string()}];

        std::thread::scope(|scope| {
            let exec_handle = scope.spawn(|| {
                let mut exec = ExecutorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);
                exec.on_step(0, &[0, 0, 0, 0], 0, 0, 0)
            });

            let inspector = InspectorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);
            while ControlRegion::new(&control).state() != ControlState::Paused {
                std::hint::spin_loop();
            }
            inspector.stop();

            assert_eq!(exec_handle.join().unwrap(), Err(Stop));
        });
    }

    #[test]
    fn step_back_then_forward_replays_without_touching_executor() {
        let control = fresh_control();
        let snapshot: Vec<AtomicU8> = (0..4).map(|_| AtomicU8::new(0)).collect();
        let step_map: Vec<StepMapEntry> = (0..5).map(|i| StepMapEntry {line: i + 1, function: "main".to_string()}).collect();

        let region = ControlRegion::new(&control);
        let snap_region = SnapshotRegion::new(&snapshot);
        let mut inspector = InspectorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);

        region.set_frame_depth(1);
        // Five forward steps, as in spec.md §8 scenario 6.
        for step in 0..5u32 {
            region.set_frame(0, 1, 100, 16);
            snap_region.write_mirror(&[step as u8, 0, 0, 0]);
            region.set_step_id(step);
            region.set_state(ControlState::Paused);
            let observed = inspector.poll().expect("new step observed");
            assert_eq!(observed.2, step);
        }
        assert!(inspector.at_live_tip());

        // One step-back restores the state recorded at the step before the live tip.
        let prior = inspector.step_back().expect("history has a prior entry");
        assert_eq!(prior.step_id, 3);
        assert_eq!(prior.bytes[0], 3);
        assert!(!inspector.at_live_tip());

        // Stepping forward again replays the live tip from history, without re-executing.
        let replayed = inspector.step_forward_in_history().expect("history has the live tip ahead");
        assert_eq!(replayed.step_id, 4);
        assert_eq!(replayed.bytes[0], 4);
        assert!(inspector.at_live_tip());
        assert!(inspector.step_forward_in_history().is_none());
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let control = fresh_control();
        let snapshot: Vec<AtomicU8> = (0..4).map(|_| AtomicU8::new(0)).collect();
        let step_map: Vec<StepMapEntry> = (0..(HISTORY_CAPACITY as u32 + 10)).map(|i| StepMapEntry {line: i as usize + 1, function: "main".to_string()}).collect();

        let region = ControlRegion::new(&control);
        let snap_region = SnapshotRegion::new(&snapshot);
        let mut inspector = InspectorBridge::new(ControlRegion::new(&control), SnapshotRegion::new(&snapshot), &step_map);

        region.set_frame_depth(1);
        for step in 0..(HISTORY_CAPACITY as u32 + 10) {
            region.set_frame(0, 1, 100, 16);
            snap_region.write_mirror(&[0, 0, 0, 0]);
            region.set_step_id(step);
            region.set_state(ControlState::Paused);
            inspector.poll().expect("new step observed");
        }

        // Walk all the way back; the oldest retained state is no earlier than capacity allows.
        let mut oldest = None;
        while let Some(state) = inspector.step_back() {
            oldest = Some(state.step_id);
        }
        assert_eq!(oldest, Some(10));
    }
}
