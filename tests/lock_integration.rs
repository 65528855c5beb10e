use std::time::{Duration, Instant};

use bucketbrigade::BrigadeError;
use bucketbrigade::lock::InstanceLock;

// Single-instance exclusion: a second acquisition of the same component's
// lock in the same working directory must fail quickly, while a different
// component coexists freely.

#[test]
fn second_instance_of_same_component_is_rejected_quickly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _held = InstanceLock::acquire(dir.path(), "zipper", Duration::from_millis(100))
        .expect("first instance");

    let start = Instant::now();
    let second = InstanceLock::acquire(dir.path(), "zipper", Duration::from_secs(1));
    let elapsed = start.elapsed();

    match second {
        Err(BrigadeError::LockContended(path)) => {
            assert!(path.ends_with("zipper.lock"));
        }
        other => panic!("expected LockContended, got {:?}", other.map(|l| l.path().to_path_buf())),
    }
    // 第二实例需在约 2 秒内退出 — must give up within ~2s
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}

#[test]
fn different_components_do_not_contend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _zipper = InstanceLock::acquire(dir.path(), "zipper", Duration::from_millis(100))
        .expect("zipper lock");
    let _unzipper = InstanceLock::acquire(dir.path(), "unzipper", Duration::from_millis(100))
        .expect("unzipper lock");
}

#[test]
fn lock_is_reacquirable_after_release() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let _first = InstanceLock::acquire(dir.path(), "mapper", Duration::from_millis(100))
            .expect("first");
    }
    let _second = InstanceLock::acquire(dir.path(), "mapper", Duration::from_millis(100))
        .expect("second after release");
}
