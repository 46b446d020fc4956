// src/pool.rs
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Free blocks a pool keeps before letting returned blocks drop.
const MAX_CACHED_BLOCKS: usize = 64;

struct PoolInner {
    block_size: usize,
    free: RefCell<Vec<Box<[u8]>>>,
    parent: Option<Pool>,
}

/// Single-threaded allocator of fixed-size memory blocks.
///
/// Pools nest: a worker owns a thread pool, every generation and every client
/// own a child of it, and every request gets its own child as well. Blocks
/// released into a child are handed back to its parent when the child is
/// dropped, so a connection's memory is recycled by the worker rather than
/// returned to the global allocator.
///
/// `Pool` is `!Send`; a client pool is never touched by another thread.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<PoolInner>,
}

impl Pool {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                block_size: block_size.max(1),
                free: RefCell::new(Vec::new()),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Pool {
        Pool {
            inner: Rc::new(PoolInner {
                block_size: self.inner.block_size,
                free: RefCell::new(Vec::new()),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Take a block, reusing a cached one when available. Reused blocks keep
    /// stale bytes; callers track their own fill level.
    pub fn acquire(&self) -> Box<[u8]> {
        if let Some(block) = self.inner.free.borrow_mut().pop() {
            return block;
        }
        if let Some(parent) = &self.inner.parent {
            return parent.acquire();
        }
        vec![0u8; self.inner.block_size].into_boxed_slice()
    }

    pub fn release(&self, block: Box<[u8]>) {
        if block.len() != self.inner.block_size {
            return;
        }
        let mut free = self.inner.free.borrow_mut();
        if free.len() < MAX_CACHED_BLOCKS {
            free.push(block);
        }
    }

    pub fn cached_blocks(&self) -> usize {
        self.inner.free.borrow().len()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            for block in self.free.get_mut().drain(..) {
                parent.release(block);
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.inner.block_size)
            .field("cached", &self.cached_blocks())
            .field("nested", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_returns_blocks_to_parent() {
        let root = Pool::new(16);
        {
            let client = root.child();
            let a = client.acquire();
            let b = client.acquire();
            assert_eq!(a.len(), 16);
            client.release(a);
            client.release(b);
            assert_eq!(client.cached_blocks(), 2);
            assert_eq!(root.cached_blocks(), 0);
        }
        assert_eq!(root.cached_blocks(), 2);

        let again = root.child();
        let _block = again.acquire();
        assert_eq!(root.cached_blocks(), 1);
    }

    #[test]
    fn test_foreign_block_size_is_dropped() {
        let pool = Pool::new(8);
        pool.release(vec![0u8; 4].into_boxed_slice());
        assert_eq!(pool.cached_blocks(), 0);
    }
}
