//! 다운로드 오케스트레이터 (클라이언트)
//!
//! 매니페스트의 파일마다:
//! 1. 제어 포트로 DOWNLOAD → OK (크기, 데이터 포트) 또는 ERR NOT_FOUND
//! 2. 데이터 포트로 GET을 블록 단위로 반복, DATA 페이로드를 오프셋에 기록
//! 3. CLOSE → CLOSE_OK
//!
//! 파일 하나의 실패는 그 파일만 중단하고 매니페스트는 계속 진행한다.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::ReliableChannel;
use crate::message::{validate_filename, ChunkRequest, Message};
use crate::paths::resolve_within;
use crate::report::{DownloadOutcome, DownloadReport, ManifestSummary};
use crate::stats::{ExchangeCounters, TransferStats};
use crate::{Config, Error, Result};

/// 다음 요청 범위 `[offset, min(offset + block - 1, size - 1)]`
///
/// `offset >= file_size`이면 None (전송 완료).
pub fn chunk_range(offset: u64, file_size: u64, block_size: usize) -> Option<(u64, u64)> {
    if offset >= file_size {
        return None;
    }
    let end = offset
        .saturating_add(block_size as u64 - 1)
        .min(file_size - 1);
    Some((offset, end))
}

/// 로컬 출력 파일과 수신 위치
pub struct DownloadCursor {
    pub filename: String,
    pub bytes_received: u64,
    pub file_size: u64,
    output: File,
}

impl DownloadCursor {
    /// 출력 파일 생성 (기존 파일은 비움)
    pub async fn create(filename: &str, path: &Path, file_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = File::create(path).await?;
        Ok(Self {
            filename: filename.to_string(),
            bytes_received: 0,
            file_size,
            output,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.file_size
    }

    pub fn next_request(&self, block_size: usize) -> Option<ChunkRequest> {
        chunk_range(self.bytes_received, self.file_size, block_size).map(|(start, end)| {
            ChunkRequest {
                filename: self.filename.clone(),
                start,
                end,
            }
        })
    }

    /// 페이로드를 `request.start` 오프셋에 기록하고 위치 전진
    pub async fn write_chunk(&mut self, request: &ChunkRequest, payload: &[u8]) -> Result<()> {
        self.output.seek(SeekFrom::Start(request.start)).await?;
        self.output.write_all(payload).await?;
        // 파일 중단 시 받은 부분까지는 디스크에 남도록
        self.output.flush().await?;
        self.bytes_received = request.end + 1;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<()> {
        self.output.flush().await?;
        self.output.sync_all().await?;
        Ok(())
    }
}

/// 다운로더 (채널 하나, 파일은 순차 처리)
pub struct Downloader {
    config: Config,
    server_addr: SocketAddr,
    output_dir: PathBuf,
    channel: ReliableChannel,
}

impl Downloader {
    /// 서버 주소 패밀리에 맞는 임시 포트로 채널 생성
    pub async fn connect(
        server_addr: SocketAddr,
        output_dir: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let local: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let channel = ReliableChannel::bind(local, config.clone()).await?;

        Ok(Self {
            config,
            server_addr,
            output_dir: output_dir.into(),
            channel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.channel.local_addr()
    }

    /// 채널 누적 카운터
    pub fn counters(&self) -> ExchangeCounters {
        self.channel.counters()
    }

    /// 파일 하나 다운로드, 에러는 보고서로 변환
    pub async fn fetch(&mut self, filename: &str) -> DownloadReport {
        let before = self.channel.counters();
        let mut stats = TransferStats::default();

        let outcome = match self.download(filename, &mut stats).await {
            Ok(crc32) => DownloadOutcome::Completed {
                bytes: stats.bytes_received,
                crc32,
            },
            Err(Error::NotFound { .. }) => DownloadOutcome::NotFound,
            Err(e) => DownloadOutcome::Failed {
                reason: e.to_string(),
            },
        };

        stats.exchanges = self.channel.counters().since(&before);
        stats.finish();

        DownloadReport {
            filename: filename.to_string(),
            outcome,
            stats,
        }
    }

    /// 매니페스트 순서대로 순차 다운로드
    pub async fn run_manifest(&mut self, filenames: &[String]) -> ManifestSummary {
        let mut reports = Vec::with_capacity(filenames.len());
        for filename in filenames {
            let report = self.fetch(filename).await;
            report.log();
            reports.push(report);
        }
        ManifestSummary { reports }
    }

    async fn download(&mut self, filename: &str, stats: &mut TransferStats) -> Result<u32> {
        validate_filename(filename)?;
        let path = resolve_within(&self.output_dir, filename)?;

        let request = Message::Download {
            filename: filename.to_string(),
        };
        let (file_size, data_port) = match self.channel.send(request, self.server_addr).await? {
            Message::Granted {
                filename: granted,
                size,
                port,
            } if granted == filename => (size, port),
            Message::NotFound { filename: missing } if missing == filename => {
                info!("{}: 서버에 파일 없음", filename);
                return Err(Error::NotFound {
                    filename: filename.to_string(),
                });
            }
            other => {
                return Err(Error::mismatch(
                    format!("OK {} or ERR {} NOT_FOUND", filename, filename),
                    other.describe(),
                ))
            }
        };

        let data_addr = SocketAddr::new(self.server_addr.ip(), data_port);
        info!(
            "{}: 다운로드 시작 ({} bytes, data port {})",
            filename, file_size, data_port
        );
        *stats = TransferStats::new(file_size);

        let mut cursor = DownloadCursor::create(filename, &path, file_size).await?;
        let mut hasher = crc32fast::Hasher::new();
        let mut next_mark = 0.25;

        while let Some(request) = cursor.next_request(self.config.block_size) {
            debug!("GET {} [{}, {}]", filename, request.start, request.end);
            let response = self.channel.send(request.to_message(), data_addr).await?;
            let payload = request.accept(response)?;

            cursor.write_chunk(&request, &payload).await?;
            hasher.update(&payload);
            stats.record_chunk(payload.len());

            if stats.progress() >= next_mark && !cursor.is_complete() {
                info!(
                    "{}: {:.0}% ({}/{} bytes)",
                    filename,
                    stats.progress() * 100.0,
                    stats.bytes_received,
                    file_size
                );
                while next_mark <= stats.progress() {
                    next_mark += 0.25;
                }
            }
        }
        cursor.finish().await?;

        let close = Message::Close {
            filename: filename.to_string(),
        };
        match self.channel.send(close, data_addr).await {
            Ok(Message::CloseOk { filename: closed }) if closed == filename => {
                debug!("{}: CLOSE_OK", filename);
            }
            Ok(other) => warn!("{}: CLOSE 응답 불일치: {}", filename, other.describe()),
            Err(e) => warn!("{}: CLOSE 실패 (다운로드는 완료): {}", filename, e),
        }

        Ok(hasher.finalize())
    }
}

/// 매니페스트 전체 다운로드
///
/// `parallel_downloads`가 1이면 순차, 그보다 크면 워커마다 자체 채널을
/// 가지고 공유 큐에서 파일을 가져간다. 보고서는 매니페스트 순서를 유지한다.
pub async fn download_all(
    server_addr: SocketAddr,
    output_dir: &Path,
    filenames: &[String],
    config: &Config,
) -> Result<ManifestSummary> {
    let workers = config.parallel_downloads.min(filenames.len()).max(1);

    if workers == 1 {
        let mut downloader = Downloader::connect(server_addr, output_dir, config.clone()).await?;
        return Ok(downloader.run_manifest(filenames).await);
    }

    info!("{} workers for {} files", workers, filenames.len());

    let queue: Arc<Mutex<VecDeque<(usize, String)>>> = Arc::new(Mutex::new(
        filenames.iter().cloned().enumerate().collect(),
    ));

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let mut downloader = Downloader::connect(server_addr, output_dir, config.clone()).await?;
        let queue = queue.clone();
        tasks.spawn(async move {
            let mut done = Vec::new();
            loop {
                let next = queue.lock().pop_front();
                let Some((index, filename)) = next else {
                    break;
                };
                let report = downloader.fetch(&filename).await;
                report.log();
                done.push((index, report));
            }
            done
        });
    }

    let mut indexed = Vec::with_capacity(filenames.len());
    while let Some(joined) = tasks.join_next().await {
        let done =
            joined.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        indexed.extend(done);
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(ManifestSummary {
        reports: indexed.into_iter().map(|(_, report)| report).collect(),
    })
}
