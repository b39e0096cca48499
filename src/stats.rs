//! 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 요청/응답 교환 카운터 (채널 단위 누적)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeCounters {
    /// 응답을 받은 교환 수
    pub exchanges: u64,

    /// 송신한 데이터그램 수 (재전송 포함)
    pub attempts: u64,

    /// 재전송 수
    pub retransmits: u64,

    /// 재시도 소진으로 실패한 교환 수
    pub failures: u64,

    /// 이전 교환 번호를 가진 늦은 응답
    pub stale_replies: u64,

    /// 파싱 실패한 응답
    pub malformed_replies: u64,

    /// 다른 주소에서 온 데이터그램
    pub foreign_datagrams: u64,
}

impl ExchangeCounters {
    /// `earlier` 스냅샷 이후 증가분
    pub fn since(&self, earlier: &ExchangeCounters) -> ExchangeCounters {
        ExchangeCounters {
            exchanges: self.exchanges.saturating_sub(earlier.exchanges),
            attempts: self.attempts.saturating_sub(earlier.attempts),
            retransmits: self.retransmits.saturating_sub(earlier.retransmits),
            failures: self.failures.saturating_sub(earlier.failures),
            stale_replies: self.stale_replies.saturating_sub(earlier.stale_replies),
            malformed_replies: self.malformed_replies.saturating_sub(earlier.malformed_replies),
            foreign_datagrams: self.foreign_datagrams.saturating_sub(earlier.foreign_datagrams),
        }
    }
}

/// 파일 하나의 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 허가된 파일 크기
    pub file_size: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// 수신 청크 수
    pub chunks: u64,

    /// 이 파일 동안의 교환 카운터
    pub exchanges: ExchangeCounters,

    /// 종료 시간 (완료/중단 시 기록)
    pub finished_at: Option<Instant>,
}

impl TransferStats {
    pub fn new(file_size: u64) -> Self {
        Self {
            start_time: Instant::now(),
            file_size,
            bytes_received: 0,
            chunks: 0,
            exchanges: ExchangeCounters::default(),
            finished_at: None,
        }
    }

    /// 청크 수신 기록
    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes_received += len as u64;
    }

    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Instant::now);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / elapsed
    }

    /// 진행률 (0.0 ~ 1.0), 빈 파일은 1.0
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.bytes_received as f64 / self.file_size as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {}/{} | Chunks: {} | Throughput: {:.2} KB/s | Retransmits: {} | Stale: {}",
            self.elapsed().as_secs_f64(),
            self.bytes_received,
            self.file_size,
            self.chunks,
            self.throughput() / 1000.0,
            self.exchanges.retransmits,
            self.exchanges.stale_replies,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}

/// 서버 이벤트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// 새 세션 허가
    Granted,
    /// 기존 세션으로 OK 재전송 (중복 DOWNLOAD)
    Regranted,
    /// NOT_FOUND 응답
    Rejected,
    /// 응답 없이 버린 요청 (파싱 실패, 세션 한도 등)
    Dropped,
    /// CLOSE로 정상 종료
    Closed,
    /// 유휴 타임아웃으로 정리
    Evicted,
    /// 에러로 중단 (ShortRead 등)
    Aborted,
}

/// 서버 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub granted: u64,
    pub regranted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub closed: u64,
    pub evicted: u64,
    pub aborted: u64,
}

/// 태스크 간 공유되는 서버 카운터
#[derive(Debug, Default)]
pub struct ServerCounters {
    granted: AtomicU64,
    regranted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicU64,
    evicted: AtomicU64,
    aborted: AtomicU64,
}

impl ServerCounters {
    pub fn record(&self, event: ServerEvent) {
        let counter = match event {
            ServerEvent::Granted => &self.granted,
            ServerEvent::Regranted => &self.regranted,
            ServerEvent::Rejected => &self.rejected,
            ServerEvent::Dropped => &self.dropped,
            ServerEvent::Closed => &self.closed,
            ServerEvent::Evicted => &self.evicted,
            ServerEvent::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            granted: self.granted.load(Ordering::Relaxed),
            regranted: self.regranted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}
