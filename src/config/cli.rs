use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "db-migrate")]
#[command(about = "Migrate records between heterogeneous databases")]
pub struct Cli {
    /// 遷移配置檔（.toml 或 .json）
    #[arg(short, long, global = true, default_value = "migration.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 檢查配置並列出所有違規項目
    Validate,
    /// 測試連線（未指定時兩端都測）
    Test {
        #[arg(long, value_enum)]
        side: Option<Side>,
    },
    /// 列出資料表／集合
    Discover {
        #[arg(long, value_enum, default_value = "source")]
        side: Side,
    },
    /// 檢視單一資料表／集合的 schema
    Schema {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value = "source")]
        side: Side,
    },
    /// 從來源讀取少量記錄
    Preview {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// 執行遷移
    Migrate {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, default_value = "500")]
        poll_interval_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}
