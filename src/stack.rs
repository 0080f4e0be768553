use crate::grammar::ContextHandle;
use std::rc::Rc;
use tracing::debug;

/// One frame of the context stack: the active context plus the captured
/// data of the rule that pushed it (only present for dynamic contexts).
#[derive(Debug)]
struct Frame {
    handle: ContextHandle,
    captures: Option<Rc<[String]>>,
    below: Option<Rc<Frame>>,
    depth: usize,
}

/// Immutable stack of (context, captured data) frames. Push and pop return
/// new stacks that share their suffix with the old one, so every line's
/// persisted state is cheap to keep around. The bottom frame is the
/// grammar's default context and can never be popped.
#[derive(Debug, Clone)]
pub struct ContextStack {
    top: Rc<Frame>,
}

impl ContextStack {
    pub fn new(bottom: ContextHandle) -> Self {
        ContextStack {
            top: Rc::new(Frame {
                handle: bottom,
                captures: None,
                below: None,
                depth: 1,
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.top.depth
    }

    pub fn top_handle(&self) -> &ContextHandle {
        &self.top.handle
    }

    pub fn top_captures(&self) -> Option<&Rc<[String]>> {
        self.top.captures.as_ref()
    }

    /// The default-context frame this stack grew from. Walks the chain;
    /// stacks stay shallow in practice.
    pub fn bottom_handle(&self) -> &ContextHandle {
        let mut frame = &self.top;
        while let Some(below) = &frame.below {
            frame = below;
        }
        &frame.handle
    }

    pub fn push(&self, handle: ContextHandle, captures: Option<Rc<[String]>>) -> Self {
        ContextStack {
            top: Rc::new(Frame {
                handle,
                captures,
                below: Some(Rc::clone(&self.top)),
                depth: self.top.depth + 1,
            }),
        }
    }

    /// Discard the top `n` frames. A request that would remove the bottom
    /// frame is rejected outright: the stack is returned unchanged.
    pub fn pop(&self, n: usize) -> Self {
        if n == 0 {
            return self.clone();
        }
        if n > self.top.depth - 1 {
            debug!(
                requested = n,
                depth = self.top.depth,
                "pop past bottom of context stack ignored"
            );
            return self.clone();
        }
        let mut frame = &self.top;
        for _ in 0..n {
            frame = frame.below.as_ref().unwrap();
        }
        ContextStack {
            top: Rc::clone(frame),
        }
    }
}

impl PartialEq for ContextStack {
    /// Structural equality: same sequence of (context identity, captured
    /// data) pairs. This is what lets the scheduler detect that re-parsing
    /// has converged.
    fn eq(&self, other: &Self) -> bool {
        if self.top.depth != other.top.depth {
            return false;
        }
        let mut a = Some(&self.top);
        let mut b = Some(&other.top);
        while let (Some(fa), Some(fb)) = (a, b) {
            if Rc::ptr_eq(fa, fb) {
                return true; // shared suffix
            }
            if fa.handle != fb.handle {
                return false;
            }
            let captures_equal = match (&fa.captures, &fb.captures) {
                (None, None) => true,
                (Some(ca), Some(cb)) => Rc::ptr_eq(ca, cb) || ca == cb,
                _ => false,
            };
            if !captures_equal {
                return false;
            }
            a = fa.below.as_ref();
            b = fb.below.as_ref();
        }
        true
    }
}

impl Eq for ContextStack {}
