//! # RFTP (Range File Transfer Protocol)
//!
//! UDP 기반 stop-and-wait 바이트 범위 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **텍스트 메시지**: `DOWNLOAD` / `OK` / `ERR` / `GET` / `DATA` / `CLOSE` / `CLOSE_OK`
//! - **신뢰성 채널**: 요청 하나, 응답 하나, 타임아웃마다 두 배 백오프 재전송
//! - **전송별 데이터 포트**: 제어 포트는 허가만, 파일 데이터는 전용 포트에서
//! - **멱등 GET**: 같은 범위는 언제나 같은 바이트
//! - **세션 레지스트리**: `(클라이언트 주소, 파일 이름)` 기준, 유휴 세션 자동 정리
//!
//! ## 서버
//! ```no_run
//! # async fn run() -> rftp::Result<()> {
//! let listener = rftp::ControlListener::bind(
//!     "0.0.0.0:9000".parse().unwrap(),
//!     rftp::DEFAULT_ROOT,
//!     rftp::Config::default(),
//! )
//! .await?;
//! listener.run().await
//! # }
//! ```
//!
//! ## 클라이언트
//! ```no_run
//! # async fn run() -> rftp::Result<()> {
//! let files = vec!["a.txt".to_string(), "missing.txt".to_string()];
//! let summary = rftp::download_all(
//!     "127.0.0.1:9000".parse().unwrap(),
//!     std::path::Path::new("."),
//!     &files,
//!     &rftp::Config::default(),
//! )
//! .await?;
//! summary.log();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod listener;
pub mod manifest;
pub mod message;
pub mod paths;
pub mod report;
pub mod session;
pub mod stats;

pub use channel::ReliableChannel;
pub use config::Config;
pub use downloader::{download_all, Downloader};
pub use error::{Error, Result};
pub use listener::ControlListener;
pub use manifest::read_manifest;
pub use message::{ChunkRequest, Frame, Message, MessageKind, TransferGrant};
pub use report::{DownloadOutcome, DownloadReport, ManifestSummary};
pub use stats::{ServerStats, TransferStats};

/// 기본 블록 크기 (GET 한 번의 raw 바이트)
pub const DEFAULT_BLOCK_SIZE: usize = 1000;

/// 최대 블록 크기
/// base64 인코딩 후에도 UDP 데이터그램 한 개에 들어가는 크기
pub const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// 서버 기본 파일 디렉터리
pub const DEFAULT_ROOT: &str = "server";
