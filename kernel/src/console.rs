//! Console device backing file descriptors 0 and 1.

use std::{collections::VecDeque, sync::Mutex};

pub struct Console {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(Vec::new()),
        }
    }

    /// Queues bytes for `read(0, ..)` to consume.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes);
    }

    /// Reads up to `dst.len()` queued input bytes.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        let n = usize::min(dst.len(), input.len());
        for byte in dst.iter_mut().take(n) {
            *byte = input.pop_front().unwrap();
        }
        n
    }

    /// Appends to the console output.
    pub fn write(&self, src: &[u8]) -> usize {
        self.output.lock().unwrap().extend_from_slice(src);
        src.len()
    }

    /// Drains everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock().unwrap())
    }
}
