//! tap-mysql 명령줄 진입점
//!
//! ```bash
//! # 카탈로그 생성
//! tap-mysql --config config.json --discover > catalog.json
//!
//! # 동기화 (stdout으로 SCHEMA/RECORD/STATE 메시지)
//! tap-mysql --config config.json --catalog catalog.json --state state.json
//! ```
//!
//! 로그는 stderr로만 씁니다 (`RUST_LOG`, 기본 info).

use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tap_mysql::catalog::Catalog;
use tap_mysql::cdc_engine::{self, CdcEngine};
use tap_mysql::config::TapConfig;
use tap_mysql::offset::StateDocument;
use tap_mysql::{CdcError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tap-mysql", version, about = "MySQL source tap with binlog change capture")]
struct Cli {
    /// 접속 설정 파일 (JSON)
    #[arg(long, env = "TAP_MYSQL_CONFIG")]
    config: PathBuf,

    /// 카탈로그를 만들어 stdout으로 출력
    #[arg(long, conflicts_with_all = ["catalog", "state"])]
    discover: bool,

    /// 선택 정보가 들어 있는 카탈로그
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// 이전 실행의 마지막 STATE
    #[arg(long)]
    state: Option<PathBuf>,
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = TapConfig::load(&cli.config)?;

    if cli.discover {
        let document = cdc_engine::discover(&config).await?;
        let mut stdout = io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &document)?;
        writeln!(stdout)?;
        return Ok(());
    }

    let catalog_path = cli.catalog.ok_or_else(|| {
        CdcError::ConfigError("--catalog is required unless --discover is given".to_string())
    })?;
    let catalog = Catalog::load(&catalog_path)?;
    let state = match &cli.state {
        Some(path) => StateDocument::load(path)?,
        None => StateDocument::default(),
    };

    let out: Box<dyn Write + Send> = Box::new(BufWriter::new(io::stdout()));
    let engine = CdcEngine::connect(config, out, state, cancel).await?;
    let result = engine.sync(&catalog).await;
    match &result {
        Ok(summary) => {
            info!(
                "Sync finished: {} streams, {} records, {} failed streams, {} failed custom queries",
                summary.streams_synced,
                summary.records,
                summary.streams_failed.len(),
                summary.custom.failed.len()
            );
        }
        Err(e) => error!("Sync stopped: {}", e),
    }
    // 기록된 STATE까지는 항상 출력에 남김
    engine.shutdown().await?;
    result.map(|_| ())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch");
            on_signal.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CdcError::Cancelled) => ExitCode::from(130),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_discover_conflicts_with_catalog() {
        let parsed = Cli::try_parse_from([
            "tap-mysql",
            "--config",
            "config.json",
            "--discover",
            "--catalog",
            "catalog.json",
        ]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from([
            "tap-mysql",
            "--config",
            "config.json",
            "--catalog",
            "catalog.json",
            "--state",
            "state.json",
        ])
        .unwrap();
        assert!(!cli.discover);
        assert_eq!(cli.state, Some(PathBuf::from("state.json")));
    }
}
