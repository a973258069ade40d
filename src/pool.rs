use std::sync::Mutex;
use tracing::{debug, trace};
use crate::config::PoolConfig;
use crate::error::{CdiError, CdiResult};

/// Items that can be recycled through a [Pool]. `reset` is called when an item is returned, so
///  a checked out item is always in its initial state.
pub trait PoolItem: Default {
    fn reset(&mut self);
}

/// A bounded object pool that may be shared between several endpoints. Checkout and return are the
///  only synchronized operations.
///
/// The pool starts with `item_count` items. When all of them are checked out, it grows by
///  `grow_count` items at most `max_grow_count` times, after which checkout fails. Failure is a
///  backpressure signal for the caller, the pool never allocates beyond its hard limit.
pub struct Pool<T: PoolItem> {
    name: &'static str,
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
}

struct PoolInner<T> {
    free: Vec<T>,
    /// number of items the pool may currently hand out, including growth so far
    capacity: usize,
    num_grown: usize,
    checked_out: usize,
}

impl<T: PoolItem> Pool<T> {
    pub fn new(name: &'static str, config: PoolConfig) -> Pool<T> {
        Pool {
            name,
            config,
            inner: Mutex::new(PoolInner {
                free: Vec::with_capacity(config.hard_limit()),
                capacity: config.item_count,
                num_grown: 0,
                checked_out: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn checkout(&self) -> CdiResult<T> {
        let mut inner = self.inner.lock().unwrap();

        if inner.checked_out == inner.capacity {
            if inner.num_grown == self.config.max_grow_count {
                debug!("pool {} is exhausted: {} items checked out", self.name, inner.checked_out);
                return Err(CdiError::PoolExhausted);
            }
            inner.num_grown += 1;
            inner.capacity += self.config.grow_count;
            debug!("pool {} grows to {} items", self.name, inner.capacity);
        }

        inner.checked_out += 1;
        if let Some(item) = inner.free.pop() {
            trace!("returning item from pool {}", self.name);
            return Ok(item);
        }
        trace!("no free item in pool {}: creating new item", self.name);
        Ok(T::default())
    }

    pub fn put(&self, mut item: T) {
        item.reset();

        let mut inner = self.inner.lock().unwrap();
        assert!(inner.checked_out > 0, "item returned to pool {} that has nothing checked out", self.name);
        inner.checked_out -= 1;
        inner.free.push(item);
    }

    /// Returns several items under a single lock acquisition
    pub fn put_all(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.lock().unwrap();
        for mut item in items {
            item.reset();
            assert!(inner.checked_out > 0, "item returned to pool {} that has nothing checked out", self.name);
            inner.checked_out -= 1;
            inner.free.push(item);
        }
    }

    pub fn checked_out(&self) -> usize {
        self.inner.lock().unwrap().checked_out
    }

    /// The number of items that can be checked out before the pool is exhausted, taking the
    ///  remaining growth into account.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        self.config.hard_limit() - inner.checked_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug)]
    struct Item {
        value: u32,
    }

    impl PoolItem for Item {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[test]
    fn test_fixed_pool_exhausts() {
        let pool: Pool<Item> = Pool::new("test", PoolConfig::fixed(2));

        let a = pool.checkout().unwrap();
        let _b = pool.checkout().unwrap();
        assert_eq!(pool.checkout().unwrap_err(), CdiError::PoolExhausted);
        assert_eq!(pool.checked_out(), 2);
        assert_eq!(pool.available(), 0);

        pool.put(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn test_growth_is_bounded() {
        let pool: Pool<Item> = Pool::new("test", PoolConfig { item_count: 2, grow_count: 3, max_grow_count: 2 });

        let items = (0..8)
            .map(|_| pool.checkout().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.checkout().unwrap_err(), CdiError::PoolExhausted);

        pool.put_all(items);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_returned_items_are_reset() {
        let pool: Pool<Item> = Pool::new("test", PoolConfig::fixed(1));

        let mut item = pool.checkout().unwrap();
        item.value = 17;
        pool.put(item);

        assert_eq!(pool.checkout().unwrap().value, 0);
    }

    #[test]
    #[should_panic]
    fn test_put_without_checkout() {
        let pool: Pool<Item> = Pool::new("test", PoolConfig::fixed(1));
        pool.put(Item::default());
    }
}
