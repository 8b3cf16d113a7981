//! Cross-connection races against one on-disk database, the way separate
//! worker processes share a job store.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::JobBuilder;
use docflow::channel::{MemoryQueue, MemoryQueueConfig, MessageSender};
use docflow::db::Database;
use docflow::jobs::{EnqueueGate, JobStatus, JobStore, LeaseManager};
use tempfile::TempDir;

const LEASE: Duration = Duration::from_secs(300);
const CONTENDERS: usize = 8;

fn open_store(path: &Path) -> JobStore {
    JobStore::new(Database::open(path).expect("Failed to open database"))
}

fn seeded_db(jobs: &[&str]) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("jobs.db");
    let store = open_store(&path);
    for id in jobs {
        store.create(JobBuilder::new(id).build()).unwrap();
    }
    (dir, path)
}

#[test]
fn test_at_most_one_lease_under_contention() {
    let (_dir, path) = seeded_db(&["doc-1"]);
    let barrier = Arc::new(Barrier::new(CONTENDERS));

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let leases = LeaseManager::new(open_store(&path));
                barrier.wait();
                leases.acquire("doc-1", LEASE).unwrap().map(|g| g.token)
            })
        })
        .collect();

    let granted: Vec<String> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(granted.len(), 1);

    let job = open_store(&path).get("doc-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.lease.unwrap().owner_token, granted[0]);
}

#[test]
fn test_every_job_claimed_exactly_once_across_workers() {
    let ids: Vec<String> = (0..20).map(|i| format!("doc-{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let (_dir, path) = seeded_db(&id_refs);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let ids = ids.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let leases = LeaseManager::new(open_store(&path));
                barrier.wait();
                ids.iter()
                    .filter(|id| leases.acquire(id, LEASE).unwrap().is_some())
                    .cloned()
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut claims: HashMap<String, usize> = HashMap::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            *claims.entry(id).or_default() += 1;
        }
    }
    assert_eq!(claims.len(), ids.len());
    assert!(claims.values().all(|&n| n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_dispatches_once() {
    let (_dir, path) = seeded_db(&["doc-1"]);
    let queue = MemoryQueue::new(MemoryQueueConfig::default());

    let tasks: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let sender: Arc<dyn MessageSender> = Arc::new(queue.clone());
            let gate = EnqueueGate::new(open_store(&path), Some(sender));
            tokio::spawn(async move { gate.try_enqueue("doc-1").await.unwrap() })
        })
        .collect();

    let mut dispatched = 0;
    for task in tasks {
        if task.await.unwrap().dispatched() {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 1);
    assert_eq!(queue.len(), 1);
    assert!(open_store(&path)
        .get("doc-1")
        .unwrap()
        .unwrap()
        .message_enqueued_at
        .is_some());
}

#[test]
fn test_renew_and_reclaim_race_has_one_winner() {
    let (_dir, path) = seeded_db(&["doc-1"]);
    let store = open_store(&path);
    let leases = LeaseManager::new(store.clone());
    let grant = leases.acquire("doc-1", Duration::from_millis(1)).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let barrier = Arc::new(Barrier::new(2));
    let renewer = {
        let path = path.clone();
        let barrier = Arc::clone(&barrier);
        let token = grant.token.clone();
        std::thread::spawn(move || {
            let leases = LeaseManager::new(open_store(&path));
            barrier.wait();
            leases.renew("doc-1", &token, LEASE).unwrap()
        })
    };
    let thief = {
        let path = path.clone();
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            let leases = LeaseManager::new(open_store(&path));
            barrier.wait();
            leases.acquire("doc-1", LEASE).unwrap().map(|g| g.token)
        })
    };

    let renewed = renewer.join().unwrap();
    let stolen = thief.join().unwrap();

    let job = store.get("doc-1").unwrap().unwrap();
    let owner = job.lease.unwrap().owner_token;
    match stolen {
        // The thief claimed first; the old owner's renew must then fail.
        Some(token) => {
            assert!(!renewed);
            assert_eq!(owner, token);
            assert_eq!(job.attempt_count, 2);
        }
        None => {
            assert!(renewed);
            assert_eq!(owner, grant.token);
            assert_eq!(job.attempt_count, 1);
        }
    }
}
