use crate::{
    error::{Error, Result},
    MAX_DEPTH,
};

/// One open parent level. Offsets are absolute positions in the document buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scope {
    /// Position of the first child.
    pub start: usize,
    /// Position just past the last child. Only known when loading; writers always append at the
    /// end of the buffer instead.
    pub end: Option<usize>,
    /// Next child not yet fully read when loading, append position when saving.
    pub current: usize,
    /// Header of the node owning this scope, `None` for the implicit root.
    pub header: Option<usize>,
}

impl Scope {
    pub fn root(end: Option<usize>) -> Self {
        Self {
            start: 0,
            end,
            current: 0,
            header: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end == Some(self.start)
    }

    /// Check that `pos` lies in `[start, end]`, or `[start, end)` if `allow_at_end` isn't set.
    pub fn check(&self, step: &'static str, pos: usize, allow_at_end: bool) -> Result<()> {
        let inside = pos >= self.start
            && match self.end {
                None => true,
                Some(end) => pos < end || (allow_at_end && pos == end),
            };
        if inside {
            Ok(())
        } else {
            Err(Error::OutOfScope {
                step,
                pos,
                start: self.start,
                end: self.end.unwrap_or(usize::MAX),
            })
        }
    }
}

/// Stack of open scopes, indexed by depth. Depth 1 is the implicit root.
#[derive(Clone, Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    pub fn push(&mut self, scope: Scope) -> Result<()> {
        if self.scopes.len() >= MAX_DEPTH {
            return Err(Error::DepthLimit);
        }
        self.scopes.push(scope);
        Ok(())
    }

    /// Pop the top scope. The implicit root can't be popped this way.
    pub fn pop(&mut self) -> Result<Scope> {
        if self.scopes.len() <= 1 {
            return Err(Error::ScopeImbalance {
                depth: self.scopes.len(),
            });
        }
        self.scopes.pop().ok_or(Error::ScopeImbalance { depth: 0 })
    }

    pub fn top(&self) -> Result<&Scope> {
        self.scopes.last().ok_or(Error::ScopeImbalance { depth: 0 })
    }

    pub fn top_mut(&mut self) -> Result<&mut Scope> {
        self.scopes.last_mut().ok_or(Error::ScopeImbalance { depth: 0 })
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounds() {
        let scope = Scope {
            start: 10,
            end: Some(20),
            current: 10,
            header: Some(2),
        };
        assert!(scope.check("t", 10, false).is_ok());
        assert!(scope.check("t", 19, false).is_ok());
        assert!(scope.check("t", 20, false).is_err());
        assert!(scope.check("t", 20, true).is_ok());
        assert!(scope.check("t", 9, true).is_err());
        assert!(!scope.is_empty());

        let saving = Scope {
            end: None,
            ..scope
        };
        assert!(saving.check("t", 5000, false).is_ok());
    }

    #[test]
    fn root_is_sticky() {
        let mut stack = ScopeStack::new();
        stack.push(Scope::root(Some(0))).unwrap();
        assert!(stack.top().unwrap().is_empty());
        assert_eq!(stack.pop(), Err(Error::ScopeImbalance { depth: 1 }));
        stack.push(Scope::root(None)).unwrap();
        assert!(stack.pop().is_ok());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn depth_limit() {
        let mut stack = ScopeStack::new();
        for _ in 0..MAX_DEPTH {
            stack.push(Scope::root(None)).unwrap();
        }
        assert_eq!(stack.push(Scope::root(None)), Err(Error::DepthLimit));
    }
}
