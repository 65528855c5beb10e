use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// 将调试日志写入 <WORK_DIR>/logs/debug.log
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(
        about = "Discover source folders and publish file lists to the staging bucket",
        name = "map",
        display_order = 1
    )]
    Map {},
    #[clap(
        about = "Build capped archives in the staging bucket and direct-copy large files",
        name = "zip",
        display_order = 2
    )]
    Zip {},
    #[clap(
        about = "Download archives, extract and merge them into the destination remote",
        name = "unzip",
        display_order = 3
    )]
    Unzip {},
    #[clap(
        about = "Flatten redundant nested folders at the destination",
        name = "fix",
        display_order = 4
    )]
    Fix {},
    #[clap(
        about = "Show per-folder pipeline progress from the staging bucket",
        name = "st",
        display_order = 5
    )]
    Status {},
}
