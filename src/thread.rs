//! # Thread Context
//!
//! One per worker thread, preallocated by the engine and handed out by
//! index. The context owns everything a thread needs to run
//! transactions: its `Xct`, its log buffer handle, and a handle to the
//! engine-wide MCS block arenas. Transactions refer to their thread
//! and engine by id and `Arc`, never by owning reference.

use std::sync::Arc;

use crate::config::options::EngineOptions;
use crate::log::buffer::ThreadLogBuffer;
use crate::storage::node_of_thread;
use crate::xct::mcs_lock::McsBlockArena;
use crate::xct::Xct;

pub struct ThreadContext {
    pub(crate) thread_id: u16,
    pub(crate) node: u16,
    pub(crate) xct: Xct,
    pub(crate) log_buffer: Arc<ThreadLogBuffer>,
    pub(crate) arenas: Arc<Vec<McsBlockArena>>,
}

impl ThreadContext {
    pub(crate) fn new(
        thread_id: u16,
        options: &EngineOptions,
        log_buffer: Arc<ThreadLogBuffer>,
        arenas: Arc<Vec<McsBlockArena>>,
    ) -> ThreadContext {
        ThreadContext {
            thread_id,
            node: node_of_thread(thread_id, options.numa_node_count),
            xct: Xct::new(
                thread_id,
                &options.xct,
                options.memory.local_work_memory_kb as usize * 1024,
            ),
            log_buffer,
            arenas,
        }
    }

    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }

    pub fn node(&self) -> u16 {
        self.node
    }

    pub fn xct(&self) -> &Xct {
        &self.xct
    }

    pub fn xct_mut(&mut self) -> &mut Xct {
        &mut self.xct
    }
}
