// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Pooled render buffers.
//!
//! Rendering draws `String` buffers from a shared pool for template output,
//! captured `set` bodies, macro results and `apply` bodies. Returned buffers
//! are cleared but keep their capacity, so steady-state rendering allocates
//! nothing for output.

use std::sync::Mutex;

/// Maximum number of idle buffers retained.
const MAX_POOLED: usize = 32;

/// Buffers larger than this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// A lock-guarded pool of reusable string buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<String>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared buffer from the pool, or allocates one.
    pub fn take(&self) -> String {
        self.buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop())
            .unwrap_or_default()
    }

    /// Returns a buffer to the pool, clearing it but retaining capacity.
    pub fn put(&self, mut buffer: String) {
        if buffer.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buffer.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < MAX_POOLED {
                buffers.push(buffer);
            }
        }
    }
}
