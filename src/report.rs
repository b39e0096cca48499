//! 파일별 결과 보고

use std::fmt;

use tracing::{info, warn};

use crate::stats::TransferStats;

/// 파일 하나의 다운로드 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// 전체 바이트 수신 완료
    Completed { bytes: u64, crc32: u32 },

    /// 서버에 파일 없음 (로컬 파일 생성 안 함)
    NotFound,

    /// 응답 없음, 프로토콜 불일치, 로컬 IO 에러 등
    /// 이미 쓴 부분 파일은 남는다
    Failed { reason: String },
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Completed { .. })
    }
}

/// 파일 하나의 보고서
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub filename: String,
    pub outcome: DownloadOutcome,
    pub stats: TransferStats,
}

impl DownloadReport {
    /// 결과를 로그로 출력
    pub fn log(&self) {
        match &self.outcome {
            DownloadOutcome::Completed { .. } => {
                info!("{}", self);
                info!("  {}", self.stats.summary());
            }
            _ => warn!("{}", self),
        }
    }
}

impl fmt::Display for DownloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            DownloadOutcome::Completed { bytes, crc32 } => write!(
                f,
                "{}: downloaded {} bytes (crc32 {:08x})",
                self.filename, bytes, crc32
            ),
            DownloadOutcome::NotFound => write!(f, "{}: not found on server", self.filename),
            DownloadOutcome::Failed { reason } => {
                write!(f, "{}: failed ({})", self.filename, reason)
            }
        }
    }
}

/// 매니페스트 전체 결과 (매니페스트 순서 유지)
#[derive(Debug, Clone, Default)]
pub struct ManifestSummary {
    pub reports: Vec<DownloadReport>,
}

impl ManifestSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn get(&self, filename: &str) -> Option<&DownloadReport> {
        self.reports.iter().find(|r| r.filename == filename)
    }

    /// 전체 집계만 로그 (파일별 보고서는 완료 시점에 이미 로그됨)
    pub fn log(&self) {
        info!(
            "Manifest complete: {}/{} files downloaded",
            self.succeeded(),
            self.reports.len()
        );
    }
}

impl fmt::Display for ManifestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            writeln!(f, "{}", report)?;
        }
        write!(
            f,
            "{}/{} files downloaded",
            self.succeeded(),
            self.reports.len()
        )
    }
}
