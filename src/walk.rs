//! Sequential walk over every node of a document, in stored order.

use crate::{
    error::{Error, Result},
    node::{NodeHeader, NodeKind, HEADER_SIZE},
    MAX_DEPTH,
};

/// One node encountered by a [`NodeWalker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkedNode<'a> {
    /// Position of the node header.
    pub offset: usize,
    /// Number of enclosing parent nodes.
    pub depth: usize,
    pub header: NodeHeader,
    /// Payload bytes. Always empty for parents.
    pub payload: &'a [u8],
}

/// Iterator over the nodes in a document buffer, depth first.
///
/// Parent nodes are yielded before their children. Every parent must end exactly on a child
/// boundary and every child must end inside its parent; the first violation is returned as an
/// error, after which the walker stops.
pub struct NodeWalker<'a> {
    data: &'a [u8],
    pos: usize,
    ends: Vec<usize>,
    errored: bool,
}

impl<'a> NodeWalker<'a> {
    pub fn new(data: &'a [u8]) -> NodeWalker<'a> {
        Self {
            data,
            pos: 0,
            ends: Vec::new(),
            errored: false,
        }
    }

    /// Pop every parent that ends at the current position.
    fn close_finished(&mut self) -> Result<()> {
        while let Some(&end) = self.ends.last() {
            if end > self.pos {
                break;
            }
            if end < self.pos {
                return Err(Error::OutOfScope {
                    step: "close parent node",
                    pos: self.pos,
                    start: end,
                    end,
                });
            }
            self.ends.pop();
        }
        Ok(())
    }

    fn walk_node(&mut self) -> Result<Option<WalkedNode<'a>>> {
        self.close_finished()?;
        if self.pos == self.data.len() {
            return Ok(None);
        }

        let data = self.data;
        let header = NodeHeader::decode(data, self.pos)?;
        let offset = self.pos;
        let end = offset + header.size as usize;
        let limit = self.ends.last().copied().unwrap_or(data.len());
        if end > limit {
            return Err(Error::OutOfScope {
                step: "walk node body",
                pos: end,
                start: offset,
                end: limit,
            });
        }

        let depth = self.ends.len();
        let payload = match header.kind {
            NodeKind::Parent => {
                if depth >= MAX_DEPTH {
                    return Err(Error::DepthLimit);
                }
                self.ends.push(end);
                self.pos = offset + HEADER_SIZE;
                &data[offset..offset]
            }
            NodeKind::Leaf => {
                self.pos = end;
                &data[offset + HEADER_SIZE..end]
            }
        };
        Ok(Some(WalkedNode {
            offset,
            depth,
            header,
            payload,
        }))
    }
}

impl<'a> std::iter::Iterator for NodeWalker<'a> {
    type Item = Result<WalkedNode<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        let result = self.walk_node();
        if result.is_err() {
            self.errored = true;
        }
        result.transpose()
    }
}
