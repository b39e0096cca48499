//! RFTP 클라이언트
//!
//! 매니페스트(한 줄에 파일 이름 하나)의 파일을 순서대로 다운로드
//!
//! 사용법:
//!   cargo run --release --bin rftp-client -- <HOST> <PORT> <MANIFEST> [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin rftp-client -- 127.0.0.1 9000 files.txt
//!
//!   # 손실이 많은 네트워크: 작은 블록, 긴 타임아웃
//!   cargo run --release --bin rftp-client -- host 9000 files.txt --block-size 512 --timeout-ms 2000 --retries 8

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rftp::{download_all, read_manifest, Config};

/// RFTP Client - UDP stop-and-wait 파일 전송 클라이언트
#[derive(Parser, Debug)]
#[command(name = "rftp-client", version, about)]
struct Args {
    /// 서버 호스트 이름 또는 IP
    host: String,

    /// 서버 제어 포트
    port: u16,

    /// 파일 목록
    manifest: PathBuf,

    /// 저장 디렉터리
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// GET 블록 크기 (바이트)
    #[arg(long)]
    block_size: Option<usize>,

    /// 요청당 최대 시도 횟수
    #[arg(long)]
    retries: Option<u32>,

    /// 첫 시도 타임아웃 (밀리초)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// 동시 다운로드 수
    #[arg(long)]
    parallel: Option<usize>,

    /// SEQ 트레일러 비활성화
    #[arg(long)]
    no_seq: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        let mut config = Config::default();
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.initial_timeout_ms = timeout_ms;
        }
        if let Some(parallel) = self.parallel {
            config.parallel_downloads = parallel;
        }
        config.sequence_numbers = !self.no_seq;
        config
    }
}

async fn run(args: Args) -> rftp::Result<bool> {
    let config = args.to_config();
    config.validate()?;

    let server_addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| {
            rftp::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not resolve {}", args.host),
            ))
        })?;

    let filenames = read_manifest(&args.manifest).await?;

    info!("RFTP Client starting...");
    info!("Server address: {}", server_addr);
    info!("Manifest: {:?} ({} files)", args.manifest, filenames.len());
    info!(
        "Block size: {} bytes, timeout: {:?}, retries: {}",
        config.block_size,
        config.initial_timeout(),
        config.max_retries
    );

    let summary = download_all(server_addr, &args.output, &filenames, &config).await?;
    summary.log();
    Ok(summary.all_succeeded())
}

#[tokio::main]
async fn main() -> ExitCode {
    // 로깅 설정 (RUST_LOG, 기본 info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
