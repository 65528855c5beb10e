use std::path::PathBuf;

use bucketbrigade::config::{Config, GIB};
use bucketbrigade::sanitize::sanitize_name;
use bucketbrigade::util::natural_cmp;
use bucketbrigade::zipper::plan_batches;

// Cross-component contract: the sanitized folder name must produce the same
// staging-store keys in every component, and the key series the zipper emits
// must come back to the unzipper in natural order.

fn test_config() -> Config {
    Config {
        access_key: "ak".into(),
        secret_key: "sk".into(),
        endpoint: None,
        region: "us-east-1".into(),
        bucket: "bucket".into(),
        prefix: "migration/".into(),
        source: "src:".into(),
        destination: "dst:".into(),
        rclone_path: PathBuf::from("rclone"),
        rclone_config: None,
        large_file_threshold: 5 * GIB,
        max_zip_size: 20 * GIB,
        split_threshold: 1000,
        max_parallel_workers: 2,
        download_threads: 8,
        disk_limit_percent: 80.0,
        disk_backpressure_percent: 70.0,
        max_completed_keys: 5000,
        zip_bomb_ratio: 100.0,
        s3_max_retries: 3,
        max_retry_duration_secs: 300,
        instance_lock_timeout_secs: 2,
        work_dir: PathBuf::from("bb_work"),
        skip_upload: false,
    }
}

#[test]
fn sanitized_keys_line_up_across_components() {
    let cfg = test_config();
    let san = sanitize_name("Work Files/2021");
    assert_eq!(san, "Work_Files_2021");
    assert_eq!(cfg.list_key(&san), "migration/Work_Files_2021_List.txt");
    assert_eq!(cfg.archive_key(&san, "Part1"), "migration/Work_Files_2021_Part1.zip");
    assert_eq!(
        cfg.zip_progress_key(&san),
        "migration/_progress/Work_Files_2021_progress.json"
    );
    assert_eq!(
        cfg.unzip_progress_key(&san),
        "migration/_progress/Work_Files_2021_unzip_progress.json"
    );
}

#[test]
fn fifteen_hundred_files_make_two_parts() {
    // 1500 个文件、阈值 1000：应得 Part1/Part2 两批
    let files: Vec<String> = (0..1500).map(|i| format!("f{:04}.dat", i)).collect();
    let cfg = test_config();
    let san = sanitize_name("A");
    let batches = plan_batches(&files, cfg.split_threshold);
    let keys: Vec<String> =
        batches.iter().map(|(label, _)| cfg.archive_key(&san, label)).collect();
    assert_eq!(keys, vec!["migration/A_Part1.zip", "migration/A_Part2.zip"]);
    let total: usize = batches.iter().map(|(_, fs)| fs.len()).sum();
    assert_eq!(total, 1500);
}

#[test]
fn emitted_key_series_sorts_back_into_emission_order() {
    let cfg = test_config();
    let san = sanitize_name("A");
    let labels = ["Part1", "Part1_Split1", "Part1_Split2", "Part2", "Part10"];
    let mut keys: Vec<String> = labels.iter().map(|l| cfg.archive_key(&san, l)).collect();
    let expected = keys.clone();
    // 打乱后按自然序恢复 — shuffle deterministically, then natural-sort
    keys.reverse();
    keys.sort_by(|a, b| natural_cmp(a, b));
    assert_eq!(keys, expected);
}

#[test]
fn unicode_folder_names_stay_resumable() {
    let cfg = test_config();
    let precomposed = sanitize_name("r\u{e9}sum\u{e9}s");
    let decomposed = sanitize_name("re\u{301}sume\u{301}s");
    assert_eq!(precomposed, decomposed);
    assert_eq!(cfg.list_key(&precomposed), cfg.list_key(&decomposed));
}
