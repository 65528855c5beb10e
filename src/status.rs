use anyhow::Result;
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};

use crate::app::App;
use crate::progress::{ProgressStore, UnzipProgress, ZipProgress};
use crate::sanitize::sanitize_name;

/// Read-only pipeline overview: one row per folder in the index with its
/// mapping, archiving and merge state. Takes no instance lock and writes
/// nothing, so it can run alongside any component.
pub fn run(app: &App) -> Result<()> {
    let folders = crate::zipper::read_folder_index(app)?;
    let progress = ProgressStore::new(&app.store);

    let mut rows: Vec<Vec<CellStruct>> = Vec::new();
    let mut zipped = 0usize;
    let mut merged = 0usize;
    for folder in &folders {
        if app.shutdown.is_requested() {
            break;
        }
        let san = sanitize_name(folder);
        let mapped = app.store.exists(&app.config.list_key(&san))?;
        let zip_doc: ZipProgress = progress.load(&app.config.zip_progress_key(&san))?;
        let unzip_doc: UnzipProgress = progress.load(&app.config.unzip_progress_key(&san))?;
        if zip_doc.folder_complete {
            zipped += 1;
        }
        if unzip_doc.folder_complete {
            merged += 1;
        }
        rows.push(vec![
            folder.as_str().cell(),
            mark(mapped).cell().justify(Justify::Center),
            zip_doc.completed_keys.len().cell().justify(Justify::Right),
            zip_doc.large_files_done.len().cell().justify(Justify::Right),
            mark(zip_doc.folder_complete).cell().justify(Justify::Center),
            unzip_doc.processed_keys.len().cell().justify(Justify::Right),
            mark(unzip_doc.folder_complete).cell().justify(Justify::Center),
        ]);
    }

    let title = vec![
        "Folder".cell().bold(true),
        "Mapped".cell().bold(true),
        "Archives".cell().bold(true),
        "Large".cell().bold(true),
        "Zipped".cell().bold(true),
        "Merged pkgs".cell().bold(true),
        "Merged".cell().bold(true),
    ];
    if let Err(e) = print_stdout(rows.table().title(title)) {
        eprintln!("⚠️ 无法渲染表格: {}", e);
    }
    println!(
        "共 {} 个目录，打包完成 {}，合并完成 {}",
        folders.len(),
        zipped,
        merged
    );
    Ok(())
}

fn mark(done: bool) -> &'static str {
    if done { "✔" } else { "-" }
}
