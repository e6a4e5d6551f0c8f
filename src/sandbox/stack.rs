//! The explicit call stack of execution frames.
//!
//! A top-level `exec` pushes the first frame. A tool callback that execs
//! again pushes a nested frame on top of the suspended one. The depth of this
//! stack, not the host's native stack, bounds reentrancy.

use std::time::{Duration, Instant};

/// What a frame is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameState {
    /// Interpreter code is executing in this frame.
    Running,
    /// The frame is paused inside a call to `tool`.
    Suspended {
        /// Tool being dispatched.
        tool: String,
    },
}

/// One execution on the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    context_id: String,
    depth: usize,
    state: FrameState,
    started_at: Instant,
}

impl Frame {
    /// The context this frame executes in.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// 1 for a top-level exec.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the frame runs or waits on a tool.
    pub fn state(&self) -> &FrameState {
        &self.state
    }

    /// Time since the frame was pushed.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Stack of active frames, innermost last.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a running frame for `context_id` and return its depth.
    pub fn push(&mut self, context_id: &str) -> usize {
        let depth = self.frames.len() + 1;
        self.frames.push(Frame {
            context_id: context_id.to_string(),
            depth,
            state: FrameState::Running,
            started_at: Instant::now(),
        });
        depth
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Frames from outermost to innermost.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Mark the innermost frame as waiting on `tool`.
    pub fn suspend(&mut self, tool: &str) {
        if let Some(frame) = self.frames.last_mut() {
            frame.state = FrameState::Suspended {
                tool: tool.to_string(),
            };
        }
    }

    /// Mark the innermost frame as running again.
    pub fn resume(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.state = FrameState::Running;
        }
    }

    /// Whether any frame executes in `context_id`.
    pub fn contains(&self, context_id: &str) -> bool {
        self.frames.iter().any(|f| f.context_id == context_id)
    }
}
