use bucketbrigade::scratch::{clean_orphans, create_scratch_dir, dir_size, disk_usage_percent};

// Scratch-directory hygiene: orphan cleanup after a simulated crash, sizing
// used by the split monitor, and the disk usage probe.

#[test]
fn crash_leftovers_are_cleaned_on_next_start() {
    let work = tempfile::tempdir().expect("work");
    // 模拟崩溃残留（PID 1 不会是本进程） — simulate a crashed run's leftovers
    for name in ["temp_1_0", "unzip_1_1", "merge_1_2"] {
        let d = work.path().join(name);
        std::fs::create_dir_all(d.join("deep")).expect("mkdir");
        std::fs::write(d.join("deep/file.bin"), vec![1u8; 64]).expect("write");
    }
    std::fs::create_dir_all(work.path().join("logs")).expect("logs dir");

    let removed = clean_orphans(work.path());
    assert_eq!(removed, 3);
    assert!(work.path().join("logs").is_dir(), "unrelated dirs must survive");
}

#[test]
fn own_scratch_dirs_survive_cleanup_while_foreign_ones_go() {
    let work = tempfile::tempdir().expect("work");
    let mine = create_scratch_dir(work.path(), "temp_").expect("scratch");
    // 模拟其它进程崩溃遗留 — a foreign (crashed) process's leftover
    std::fs::create_dir_all(work.path().join("temp_1_7")).expect("mkdir");
    assert_eq!(clean_orphans(work.path()), 1);
    assert!(mine.is_dir());
    assert!(!work.path().join("temp_1_7").exists());
}

#[test]
fn dir_size_reflects_growing_download() {
    let work = tempfile::tempdir().expect("work");
    let scratch = create_scratch_dir(work.path(), "temp_").expect("scratch");
    assert_eq!(dir_size(&scratch), 0);
    std::fs::write(scratch.join("part1.bin"), vec![0u8; 10_000]).expect("write");
    std::fs::create_dir_all(scratch.join("sub")).expect("mkdir");
    std::fs::write(scratch.join("sub/part2.bin"), vec![0u8; 2_500]).expect("write");
    assert_eq!(dir_size(&scratch), 12_500);
}

#[test]
fn disk_usage_is_a_sane_percentage() {
    let work = tempfile::tempdir().expect("work");
    let pct = disk_usage_percent(work.path()).expect("statfs");
    assert!((0.0..=100.0).contains(&pct), "got {}", pct);
}
