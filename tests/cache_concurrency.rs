use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use cacheproxy::proxy::cache::{CacheStoreOutcome, ResponseCache, ResponseMeta};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const HOST: &str = "origin.test:80";
const CAPACITY: u64 = 16 * 1024;
const WORKERS: u64 = 8;
const MAX_BODY: usize = 2048;

fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn concurrent_writers_and_readers_keep_directory_consistent() {
    let cache = ResponseCache::new(CAPACITY);
    let stored = Arc::new(AtomicUsize::new(0));
    let evicted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let cache = cache.clone();
            let stored = stored.clone();
            let evicted = evicted.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for _ in 0..400 {
                    let path = format!("/item/{}", rng.gen_range(0..32));
                    match rng.gen_range(0..6) {
                        0 | 1 => {
                            if let Some(hit) = cache.lookup(HOST, &path) {
                                assert_eq!(hit.to_vec().len() as u64, hit.total_size);
                            }
                        }
                        2 => {
                            if cache.evict_one() > 0 {
                                evicted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        3 => {
                            if let Ok(freed) = cache.make_space(rng.gen_range(1..CAPACITY / 2))
                                && freed > 0
                            {
                                evicted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            let len = rng.gen_range(1..MAX_BODY);
                            let body = payload(worker as u8, len);
                            let declared = rng.gen_bool(0.5);
                            let meta = if declared {
                                ResponseMeta::new(200, "OK").with_total_size(len as u64)
                            } else {
                                ResponseMeta::new(200, "OK")
                            };
                            let mut writer = cache.open_writer(HOST, &path, meta);
                            for piece in body.chunks(rng.gen_range(1..512)) {
                                writer.push(piece);
                            }
                            if writer.finish() == CacheStoreOutcome::Stored {
                                stored.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    // Entries still filling may overshoot by at most one body each.
                    assert!(cache.current_size() <= CAPACITY + WORKERS * MAX_BODY as u64);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let audit = cache.audit();
    assert!(audit.is_consistent(), "inconsistent directory: {audit:?}");
    assert!(audit.total_bytes <= CAPACITY + WORKERS * MAX_BODY as u64);
    assert!(stored.load(Ordering::Relaxed) > 0);
    assert!(evicted.load(Ordering::Relaxed) > 0, "no explicit eviction ran");
}

#[test]
fn hits_returned_during_eviction_stay_intact() {
    let cache = ResponseCache::new(4 * 1024);
    let body = payload(7, 1000);
    let handle = cache
        .admit_and_insert(
            HOST,
            "/pinned",
            &body,
            ResponseMeta::new(200, "OK").with_total_size(1000),
        )
        .unwrap();
    cache.complete(handle).unwrap();
    let hit = cache.lookup(HOST, "/pinned").unwrap();

    let filler = {
        let cache = cache.clone();
        thread::spawn(move || {
            for i in 0..64 {
                let path = format!("/filler/{i}");
                let handle = cache
                    .admit_and_insert(HOST, &path, &[0u8; 900], ResponseMeta::new(200, "OK"))
                    .unwrap();
                cache.complete(handle).unwrap();
            }
        })
    };
    filler.join().unwrap();

    assert!(cache.lookup(HOST, "/pinned").is_none());
    assert_eq!(hit.to_vec(), body);
    assert!(cache.audit().is_consistent());
}

#[test]
fn unbounded_cache_keeps_everything() {
    let cache = ResponseCache::with_capacity_megabytes(0);
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let path = format!("/w{worker}/{i}");
                    let mut writer = cache.open_writer(HOST, &path, ResponseMeta::new(200, "OK"));
                    writer.push(&payload(i as u8, 128));
                    assert_eq!(writer.finish(), CacheStoreOutcome::Stored);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(cache.entry_count(), 200);
    assert_eq!(cache.current_size(), 200 * 128);
    assert!(cache.audit().is_consistent());
}
