//! RFTP 서버
//!
//! 제어 포트에서 DOWNLOAD를 받아 파일마다 데이터 포트를 열고 범위 요청에 응답
//!
//! 사용법:
//!   cargo run --release --bin rftp-server -- <PORT> [OPTIONS]
//!
//! 예시:
//!   # ./server 디렉터리의 파일을 9000 포트로 제공
//!   cargo run --release --bin rftp-server -- 9000
//!
//!   # 다른 디렉터리, 좁은 데이터 포트 범위
//!   cargo run --release --bin rftp-server -- 9000 --root /srv/files --data-ports 40000-40100

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rftp::{Config, ControlListener, DEFAULT_ROOT};

/// RFTP Server - UDP stop-and-wait 파일 전송 서버
#[derive(Parser, Debug)]
#[command(name = "rftp-server", version, about)]
struct Args {
    /// 제어 포트
    port: u16,

    /// 제공할 파일 디렉터리
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// 바인드 IP
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// 데이터 포트 범위 (MIN-MAX)
    #[arg(long, value_parser = parse_port_range)]
    data_ports: Option<(u16, u16)>,

    /// 세션 유휴 타임아웃 (초)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// 동시 세션 최대 수
    #[arg(long)]
    max_sessions: Option<usize>,

    /// SEQ 트레일러 비활성화
    #[arg(long)]
    no_seq: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        let mut config = Config::default();
        if let Some((min, max)) = self.data_ports {
            config.data_port_min = min;
            config.data_port_max = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.session_idle_timeout_ms = secs * 1000;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        config.sequence_numbers = !self.no_seq;
        config
    }
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| format!("expected MIN-MAX, got {:?}", s))?;
    let min: u16 = min.trim().parse().map_err(|e| format!("bad MIN: {}", e))?;
    let max: u16 = max.trim().parse().map_err(|e| format!("bad MAX: {}", e))?;
    Ok((min, max))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.to_config();

    info!("RFTP Server starting...");
    info!("Root directory: {:?}", args.root);
    info!(
        "Data ports: {}-{}",
        config.data_port_min, config.data_port_max
    );
    info!(
        "Session idle timeout: {:?}, max sessions: {}",
        config.session_idle_timeout(),
        config.max_sessions
    );
    if !args.root.is_dir() {
        warn!("Root directory {:?} does not exist, every request will be NOT_FOUND", args.root);
    }

    let listener = Arc::new(
        ControlListener::bind(SocketAddr::new(args.bind, args.port), args.root, config).await?,
    );
    info!("Server listening on {}", listener.local_addr()?);

    let shutdown = listener.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.stop();
        }
    });

    listener.run().await?;

    let stats = listener.stats();
    info!("Server stopped: {:?}", stats);
    Ok(())
}
