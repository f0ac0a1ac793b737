//! Integration tests for concurrent lookups of missing pages.
//! A slow page source widens the window in which callers overlap.

use async_pagecache::{CacheBuilder, PageGeometry};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const PAGE_SIZE: usize = 128;

fn slow_source(
    reads: Arc<AtomicUsize>,
    delay: Duration,
) -> impl Fn(u64, &mut [u8]) -> io::Result<()> + Send + Sync {
    move |offset, buf| {
        reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(delay);
        buf.fill((offset / PAGE_SIZE as u64) as u8);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_load() {
    let reads = Arc::new(AtomicUsize::new(0));
    let cache = CacheBuilder::new()
        .capacity_bytes(16 * PAGE_SIZE)
        .geometry(PageGeometry::with_page_size(PAGE_SIZE).unwrap())
        .page_source(slow_source(reads.clone(), Duration::from_millis(50)))
        .build()
        .unwrap();

    cache.preload_if_needed(42);
    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(42).await }
    });
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(42).await }
    });

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().loads.value(), 1);
    assert!(cache.metrics().load_waits.value() >= 1);
    assert_eq!(cache.read_page_bytes(first, 0, 4).unwrap(), vec![42; 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_waiters_do_not_cancel_the_load() {
    let reads = Arc::new(AtomicUsize::new(0));
    let cache = CacheBuilder::new()
        .capacity_bytes(16 * PAGE_SIZE)
        .geometry(PageGeometry::with_page_size(PAGE_SIZE).unwrap())
        .page_source(slow_source(reads.clone(), Duration::from_millis(50)))
        .build()
        .unwrap();

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(7).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    waiter.abort();

    // The load finishes on its own and publishes the page
    for _ in 0..100 {
        if cache.contains(7) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cache.contains(7));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    cache.get(7).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_under_eviction_pressure() {
    let reads = Arc::new(AtomicUsize::new(0));
    let cache = CacheBuilder::new()
        .capacity_bytes(8 * PAGE_SIZE)
        .geometry(PageGeometry::with_page_size(PAGE_SIZE).unwrap())
        .page_source(slow_source(reads.clone(), Duration::from_micros(100)))
        .build()
        .unwrap();

    let tasks: Vec<_> = (0..16u64)
        .map(|task| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..200u64 {
                    let page_id = ((i * 13 + task * 5) % 40) as i64;
                    let bytes = cache.read_page(page_id, 0, PAGE_SIZE).await.unwrap();
                    assert!(bytes.iter().all(|&b| b == page_id as u8));
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.cleanup();

    let stats = cache.policy_stats();
    println!("{stats:?}");
    assert!(stats.size <= stats.maximum);
    assert!(cache.len() <= 8);
    let metrics = cache.metrics();
    assert_eq!(
        metrics.pages_free.value() + metrics.entries_live.value(),
        cache.capacity() as i64
    );
    assert!(reads.load(Ordering::SeqCst) as u64 >= metrics.loads.value());
}
