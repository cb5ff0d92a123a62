use std::num::NonZeroUsize;
use std::time::Duration;

use crate::buffer::BufferPool;

fn pool(count: usize) -> BufferPool {
    BufferPool::new(NonZeroUsize::new(512).unwrap(), NonZeroUsize::new(count).unwrap())
}

const WINDOW: Duration = Duration::from_secs(5);

#[test]
fn acquire_and_drop_round_trip() {
    let pool = pool(2);
    assert_eq!(pool.available(), 2);

    let first = pool.acquire(WINDOW).expect("first buffer");
    let second = pool.acquire(WINDOW).expect("second buffer");
    assert_eq!(pool.available(), 0);
    assert!(pool.acquire(WINDOW).is_none());

    drop(first);
    assert_eq!(pool.available(), 1);
    drop(second);
    assert_eq!(pool.available(), 2);
}

#[test]
fn fill_and_payload() {
    let pool = pool(1);
    let mut buffer = pool.acquire(WINDOW).expect("buffer");
    buffer.fill(b"locking andx");
    assert_eq!(buffer.payload(), b"locking andx");
}

#[test]
fn fill_truncates_to_pool_size() {
    let pool = BufferPool::new(NonZeroUsize::new(4).unwrap(), NonZeroUsize::new(1).unwrap());
    let mut buffer = pool.acquire(WINDOW).expect("buffer");
    buffer.fill(b"abcdef");
    assert_eq!(buffer.payload(), b"abcd");
}

#[test]
fn lease_refresh_extends_deadline() {
    let pool = pool(1);
    let buffer = pool.acquire(Duration::ZERO).expect("buffer");
    assert!(buffer.lease_deadline() > 0);

    let before = buffer.lease_deadline();
    buffer.refresh_lease(Duration::from_secs(60));
    assert!(buffer.lease_deadline() > before);
    assert!(!buffer.lease_expired());
}
