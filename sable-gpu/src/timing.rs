//! GPU pass timing with a triple-buffered query ring.
//!
//! Each frame records pairs of timestamps (begin + end per timed pass)
//! into that frame's readback buffer; results are collected with a
//! two-frame delay so the CPU never waits on the GPU for them.

use std::time::Duration;

use crate::device::{CommandList, GpuBuffer};
use crate::memory::{GpuMemory, ReadbackHeapBuffer};

const TIMING_RING_SIZE: usize = 3;

struct TimingFrame {
    readback: ReadbackHeapBuffer,
    pass_names: Vec<String>,
}

impl TimingFrame {
    fn reset(&mut self) {
        self.pass_names.clear();
    }

    fn pass_count(&self) -> u32 {
        self.pass_names.len() as u32
    }
}

pub struct GpuTimer {
    frames: Vec<TimingFrame>,
    current: usize,
    max_passes: u32,
    /// Seconds per timestamp tick.
    tick_period: f64,
    results: Vec<(String, Duration)>,
}

impl GpuTimer {
    pub fn new(memory: &GpuMemory, max_passes: u32) -> Self {
        let frames = (0..TIMING_RING_SIZE)
            .map(|_| TimingFrame {
                // two timestamps of 8 bytes per pass
                readback: memory.get_readback_heap_buffer(max_passes as u64 * 16),
                pass_names: Vec::with_capacity(max_passes as usize),
            })
            .collect();
        let frequency = memory.device().timestamp_frequency();
        Self {
            frames,
            current: 0,
            max_passes,
            tick_period: 1.0 / frequency as f64,
            results: Vec::new(),
        }
    }

    fn target(&self) -> GpuBuffer {
        self.frames[self.current].readback.resource()
    }

    /// Opens a timed span and returns its slot, or `None` when the frame's
    /// budget is spent.
    pub fn begin_pass(&mut self, cmd: &mut dyn CommandList, name: &str) -> Option<u32> {
        let frame = &mut self.frames[self.current];
        if frame.pass_count() >= self.max_passes {
            log::warn!("exceeded {} timed passes per frame", self.max_passes);
            return None;
        }
        let slot = frame.pass_count();
        frame.pass_names.push(name.to_owned());
        cmd.write_timestamp(self.frames[self.current].readback.resource(), slot * 2);
        Some(slot)
    }

    pub fn end_pass(&mut self, cmd: &mut dyn CommandList, slot: u32) {
        debug_assert!(slot < self.frames[self.current].pass_count());
        cmd.write_timestamp(self.target(), slot * 2 + 1);
    }

    /// Rotates the ring and collects the results of the frame recorded two
    /// frames ago (guaranteed complete by the frame fence discipline).
    pub fn advance_frame(&mut self, memory: &GpuMemory) {
        self.current = (self.current + 1) % TIMING_RING_SIZE;

        let readback_index = (self.current + 1) % TIMING_RING_SIZE;
        let frame = &mut self.frames[readback_index];
        if frame.pass_count() == 0 {
            return;
        }

        memory.map_readback(&mut frame.readback);
        self.results.clear();
        for (i, name) in frame.pass_names.iter().enumerate() {
            let raw = frame.readback.read(i * 16, 16);
            let begin = u64::from_le_bytes(raw[0..8].try_into().unwrap());
            let end = u64::from_le_bytes(raw[8..16].try_into().unwrap());
            if end > begin {
                let seconds = (end - begin) as f64 * self.tick_period;
                self.results.push((name.clone(), Duration::from_secs_f64(seconds)));
            }
        }
        memory.unmap_readback(&mut frame.readback);
        frame.reset();
    }

    /// Timings of the most recently completed frame (two-frame latency).
    pub fn results(&self) -> &[(String, Duration)] {
        &self.results
    }

    pub fn shutdown(&mut self, memory: &GpuMemory) {
        for frame in self.frames.drain(..) {
            memory.release_readback_heap_buffer(frame.readback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, QueueKind};
    use crate::headless::HeadlessDevice;
    use sable_task::ThreadIndexTable;
    use std::sync::Arc;

    fn memory() -> (Arc<HeadlessDevice>, GpuMemory) {
        let device = Arc::new(HeadlessDevice::new());
        let table = Arc::new(ThreadIndexTable::new());
        table.register_current();
        let memory = GpuMemory::new(device.clone() as Arc<dyn GpuDevice>, table);
        (device, memory)
    }

    #[test]
    fn results_arrive_two_frames_later() {
        let (device, memory) = memory();
        let mut timer = GpuTimer::new(&memory, 8);

        // frame 0 records one span
        let mut cmd = device.begin_command_list(QueueKind::Direct);
        let slot = timer.begin_pass(&mut *cmd, "shadow").unwrap();
        timer.end_pass(&mut *cmd, slot);
        device.submit(cmd);

        timer.advance_frame(&memory);
        assert!(timer.results().is_empty(), "nothing complete after one frame");

        timer.advance_frame(&memory);
        let results = timer.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "shadow");
        assert!(results[0].1 > Duration::ZERO);

        timer.shutdown(&memory);
    }

    #[test]
    fn pass_budget_is_enforced() {
        let (device, memory) = memory();
        let mut timer = GpuTimer::new(&memory, 2);
        let mut cmd = device.begin_command_list(QueueKind::Direct);
        assert!(timer.begin_pass(&mut *cmd, "a").is_some());
        assert!(timer.begin_pass(&mut *cmd, "b").is_some());
        assert!(timer.begin_pass(&mut *cmd, "c").is_none());
        timer.shutdown(&memory);
    }
}
