use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::BrigadeError;
use crate::util::normalize_rel_path;

fn store_options() -> SimpleFileOptions {
    // 仅存储不压缩；zip64 以支持超过 4GiB 的条目 — store-only entries,
    // zip64 for entries and archives past the classic limits
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true)
}

/// Build a store-only zip of everything under `src_dir`. Entry paths are
/// relative to `src_dir` with `/` separators. `exclude_name` skips the
/// download manifest that lives inside the scratch directory. Returns the
/// finished archive size in bytes.
pub fn build_store_zip(
    src_dir: &Path,
    zip_path: &Path,
    exclude_name: Option<&str>,
) -> Result<u64, BrigadeError> {
    let out = File::create(zip_path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法创建压缩包 {}: {}", zip_path.display(), e))
    })?;
    let mut zw = ZipWriter::new(out);
    let opts = store_options();

    for entry in WalkDir::new(src_dir).min_depth(1) {
        let entry = entry.map_err(|e| {
            BrigadeError::OperationFailed(format!("遍历临时目录失败: {}", e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| BrigadeError::OperationFailed(format!("相对路径计算失败: {}", e)))?;
        let rel_str = normalize_rel_path(&rel.to_string_lossy());
        if let Some(skip) = exclude_name
            && rel_str == skip
        {
            continue;
        }
        if entry.file_type().is_dir() {
            zw.add_directory(rel_str.as_str(), opts).map_err(|e| {
                BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string())
            })?;
        } else if entry.file_type().is_file() {
            zw.start_file(rel_str.as_str(), opts).map_err(|e| {
                BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string())
            })?;
            let mut input = File::open(entry.path()).map_err(|e| {
                BrigadeError::OperationFailed(format!(
                    "无法读取文件 {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            io::copy(&mut input, &mut zw).map_err(|e| {
                BrigadeError::OperationFailed(format!(
                    "写入压缩包条目失败 {}: {}",
                    rel_str, e
                ))
            })?;
        }
    }

    zw.finish()
        .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
    std::fs::metadata(zip_path)
        .map(|m| m.len())
        .map_err(|e| BrigadeError::OperationFailed(format!("无法读取压缩包大小: {}", e)))
}

/// Full integrity pass: read every entry to EOF so the zip reader checks
/// every CRC. Returns the total uncompressed size.
pub fn verify_zip(zip_path: &Path) -> Result<u64, BrigadeError> {
    let file = File::open(zip_path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法打开压缩包 {}: {}", zip_path.display(), e))
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
    let mut total = 0u64;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
        total += entry.size();
        let copied = io::copy(&mut entry, &mut io::sink());
        if let Err(e) = copied {
            return Err(BrigadeError::ArchiveCorrupt(
                zip_path.to_path_buf(),
                format!("条目 {} CRC 校验失败: {}", entry.name(), e),
            ));
        }
    }
    Ok(total)
}

/// Uncompressed total from the central directory only (no data read).
pub fn total_uncompressed(zip_path: &Path) -> Result<u64, BrigadeError> {
    let file = File::open(zip_path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法打开压缩包 {}: {}", zip_path.display(), e))
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
    let mut total = 0u64;
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
        total += entry.size();
    }
    Ok(total)
}

/// Refuse extraction when `uncompressed / on-disk` exceeds `bomb_ratio`.
/// A zero-byte archive with nonempty entries is treated the same way.
pub fn check_bomb_ratio(zip_path: &Path, bomb_ratio: f64) -> Result<u64, BrigadeError> {
    let packed = std::fs::metadata(zip_path)
        .map(|m| m.len())
        .map_err(|e| BrigadeError::OperationFailed(format!("无法读取压缩包大小: {}", e)))?;
    let unpacked = total_uncompressed(zip_path)?;
    let exceeded = if packed == 0 {
        unpacked > 0
    } else {
        unpacked as f64 / packed as f64 > bomb_ratio
    };
    if exceeded {
        return Err(BrigadeError::ArchiveBomb(zip_path.to_path_buf(), unpacked, packed));
    }
    Ok(unpacked)
}

/// Extract into `dest`. Individual bad entries are logged and skipped
/// ("extracted with warnings" counts as success); traversal-unsafe names are
/// refused. Fails only when nothing could be extracted from a non-empty
/// archive.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), BrigadeError> {
    let file = File::open(zip_path).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法打开压缩包 {}: {}", zip_path.display(), e))
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BrigadeError::ArchiveCorrupt(zip_path.to_path_buf(), e.to_string()))?;
    let entry_count = archive.len();
    let mut extracted = 0usize;
    let mut warnings = 0usize;
    for i in 0..entry_count {
        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("跳过损坏条目 #{} ({}): {}", i, zip_path.display(), e);
                warnings += 1;
                continue;
            }
        };
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!("跳过越界条目名: {}", entry.name());
            warnings += 1;
            continue;
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            if let Err(e) = std::fs::create_dir_all(&target) {
                tracing::warn!("创建目录失败 {}: {}", target.display(), e);
                warnings += 1;
            } else {
                extracted += 1;
            }
            continue;
        }
        if let Some(parent) = target.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("创建父目录失败 {}: {}", parent.display(), e);
            warnings += 1;
            continue;
        }
        let write = File::create(&target).and_then(|mut out| io::copy(&mut entry, &mut out));
        match write {
            Ok(_) => extracted += 1,
            Err(e) => {
                tracing::warn!("解压条目失败 {}: {}", entry.name(), e);
                warnings += 1;
            }
        }
    }
    if extracted == 0 && entry_count > 0 {
        return Err(BrigadeError::ArchiveCorrupt(
            zip_path.to_path_buf(),
            format!("{} 个条目全部解压失败", entry_count),
        ));
    }
    if warnings > 0 {
        tracing::warn!(
            "解压带警告完成 {}: {} 条成功, {} 条跳过",
            zip_path.display(),
            extracted,
            warnings
        );
    }
    Ok(())
}

/// First-wins recursive merge of `src` into `dst` (local-destination mode):
/// a file is moved only when nothing exists at its target path; directories
/// recurse. Existing differing files stay untouched and are logged.
pub fn merge_no_clobber(src: &Path, dst: &Path) -> Result<(), BrigadeError> {
    std::fs::create_dir_all(dst).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法创建目标目录 {}: {}", dst.display(), e))
    })?;
    let entries = std::fs::read_dir(src).map_err(|e| {
        BrigadeError::OperationFailed(format!("无法读取目录 {}: {}", src.display(), e))
    })?;
    for entry in entries {
        let entry = entry
            .map_err(|e| BrigadeError::OperationFailed(format!("读取目录项失败: {}", e)))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ft = entry
            .file_type()
            .map_err(|e| BrigadeError::OperationFailed(format!("读取文件类型失败: {}", e)))?;
        if ft.is_dir() {
            merge_no_clobber(&from, &to)?;
        } else if to.exists() {
            // 先到先得，保留已有内容 — first archive in natural order wins
            tracing::warn!("目标已存在，保留现有文件: {}", to.display());
        } else {
            move_file(&from, &to)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy+remove for cross-device moves.
fn move_file(from: &Path, to: &Path) -> Result<(), BrigadeError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to).map_err(|e| {
                BrigadeError::OperationFailed(format!(
                    "复制文件失败 {} -> {}: {}",
                    from.display(),
                    to.display(),
                    e
                ))
            })?;
            if let Err(e) = std::fs::remove_file(from) {
                tracing::warn!("移除源文件失败 {}: {}", from.display(), e);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, contents) in files {
            let p = root.join(rel);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(p, contents).expect("write");
        }
    }

    #[test]
    fn build_verify_extract_roundtrip() {
        let src = tempfile::tempdir().expect("src");
        let out = tempfile::tempdir().expect("out");
        write_tree(
            src.path(),
            &[("a.txt", b"alpha"), ("sub/b.bin", b"beta-bytes"), ("sub/deep/c", b"")],
        );
        let zip_path = out.path().join("t.zip");
        let size = build_store_zip(src.path(), &zip_path, None).expect("build");
        assert!(size > 0);
        let total = verify_zip(&zip_path).expect("verify");
        assert_eq!(total, 5 + 10);

        let dest = tempfile::tempdir().expect("dest");
        extract_zip(&zip_path, dest.path()).expect("extract");
        assert_eq!(std::fs::read(dest.path().join("a.txt")).expect("read"), b"alpha");
        assert_eq!(
            std::fs::read(dest.path().join("sub/b.bin")).expect("read"),
            b"beta-bytes"
        );
        assert!(dest.path().join("sub/deep/c").is_file());
    }

    #[test]
    fn exclude_name_leaves_manifest_out() {
        let src = tempfile::tempdir().expect("src");
        write_tree(src.path(), &[("a.txt", b"x"), (".files_from.txt", b"a.txt\n")]);
        let out = tempfile::tempdir().expect("out");
        let zip_path = out.path().join("t.zip");
        build_store_zip(src.path(), &zip_path, Some(".files_from.txt")).expect("build");
        let file = File::open(&zip_path).expect("open");
        let archive = ZipArchive::new(file).expect("archive");
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn store_only_keeps_ratio_near_one() {
        // 高度可压数据在 store-only 下不触发炸弹阈值 — compressible data must
        // not trip the bomb gate when entries are stored, not deflated
        let src = tempfile::tempdir().expect("src");
        write_tree(src.path(), &[("zeros.bin", &[0u8; 200_000][..])]);
        let out = tempfile::tempdir().expect("out");
        let zip_path = out.path().join("t.zip");
        build_store_zip(src.path(), &zip_path, None).expect("build");
        let unpacked = check_bomb_ratio(&zip_path, 100.0).expect("ratio fine");
        assert_eq!(unpacked, 200_000);
    }

    #[test]
    fn corrupt_archive_fails_verification() {
        let src = tempfile::tempdir().expect("src");
        write_tree(src.path(), &[("a.bin", &[7u8; 4096][..])]);
        let out = tempfile::tempdir().expect("out");
        let zip_path = out.path().join("t.zip");
        build_store_zip(src.path(), &zip_path, None).expect("build");
        // 翻转数据区中间一个字节 — flip a byte in the stored data region
        let mut raw = std::fs::read(&zip_path).expect("read");
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&zip_path, &raw).expect("rewrite");
        assert!(verify_zip(&zip_path).is_err());
    }

    #[test]
    fn merge_no_clobber_first_wins() {
        let a = tempfile::tempdir().expect("a");
        let dst = tempfile::tempdir().expect("dst");
        write_tree(a.path(), &[("f.txt", b"first"), ("d/x.txt", b"one")]);
        merge_no_clobber(a.path(), dst.path()).expect("merge a");
        let b = tempfile::tempdir().expect("b");
        write_tree(b.path(), &[("f.txt", b"second"), ("d/y.txt", b"two")]);
        merge_no_clobber(b.path(), dst.path()).expect("merge b");
        assert_eq!(std::fs::read(dst.path().join("f.txt")).expect("read"), b"first");
        assert_eq!(std::fs::read(dst.path().join("d/x.txt")).expect("read"), b"one");
        assert_eq!(std::fs::read(dst.path().join("d/y.txt")).expect("read"), b"two");
    }
}
