//! 프로토콜 설정

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::{Error, Result, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// RFTP 프로토콜 설정
///
/// 클라이언트와 서버가 같은 구조체를 사용하며, 각 측은 자신에게 해당하는
/// 필드만 읽는다.
#[derive(Debug, Clone)]
pub struct Config {
    /// GET 한 번에 요청하는 블록 크기 (raw 바이트)
    pub block_size: usize,

    /// 첫 시도 응답 대기 타임아웃 (밀리초)
    /// 재시도마다 두 배로 늘어남
    pub initial_timeout_ms: u64,

    /// 요청당 최대 시도 횟수
    pub max_retries: u32,

    /// 데이터 포트 범위 하한
    pub data_port_min: u16,

    /// 데이터 포트 범위 상한 (포함)
    pub data_port_max: u16,

    /// 포트 충돌 시 다른 포트로 바인딩 재시도 횟수
    pub port_bind_attempts: u32,

    /// 세션 유휴 타임아웃 (밀리초)
    /// 이 시간 동안 요청이 없으면 sweep이 세션을 정리
    pub session_idle_timeout_ms: u64,

    /// 유휴 세션 sweep 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// CLOSE_OK 이후 중복 CLOSE에 재응답하는 대기 시간 (밀리초)
    pub close_linger_ms: u64,

    /// 동시 세션 최대 수
    pub max_sessions: usize,

    /// 메시지에 SEQ 트레일러 사용 여부
    pub sequence_numbers: bool,

    /// 클라이언트 동시 다운로드 워커 수
    pub parallel_downloads: usize,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_timeout_ms: 1000,         // 1초
            max_retries: 5,                   // 1 + 2 + 4 + 8 + 16 = 31초
            data_port_min: 50000,
            data_port_max: 51000,
            port_bind_attempts: 32,
            session_idle_timeout_ms: 60_000,  // 1분
            sweep_interval_ms: 1000,
            close_linger_ms: 3000,
            max_sessions: 256,
            sequence_numbers: true,
            parallel_downloads: 1,            // 순차 처리
            recv_buffer_size: 65535,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터 포트 범위
    pub fn data_ports(&self) -> RangeInclusive<u16> {
        self.data_port_min..=self.data_port_max
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    /// 시도별 타임아웃 목록 (지수 백오프)
    ///
    /// 길이는 항상 `max_retries`와 같다.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut timeout = self.initial_timeout();
        (0..self.max_retries)
            .map(|_| {
                let current = timeout;
                timeout = timeout.saturating_mul(2);
                current
            })
            .collect()
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block_size must be in 1..={}, got {}",
                MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.initial_timeout_ms == 0 {
            return Err(Error::InvalidConfig("initial_timeout_ms must be positive".into()));
        }
        if self.data_port_min < 1024 || self.data_port_min > self.data_port_max {
            return Err(Error::InvalidConfig(format!(
                "invalid data port range {}-{}",
                self.data_port_min, self.data_port_max
            )));
        }
        if self.port_bind_attempts == 0 || self.max_sessions == 0 || self.parallel_downloads == 0 {
            return Err(Error::InvalidConfig(
                "port_bind_attempts, max_sessions and parallel_downloads must be positive".into(),
            ));
        }
        Ok(())
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            block_size: 512,                  // 작은 블록
            initial_timeout_ms: 2000,
            max_retries: 8,
            session_idle_timeout_ms: 300_000, // 5분
            close_linger_ms: 10_000,
            ..Self::default()
        }
    }

    /// 루프백/테스트용 설정 (짧은 타임아웃)
    pub fn loopback() -> Self {
        Self {
            initial_timeout_ms: 100,
            max_retries: 5,
            session_idle_timeout_ms: 5000,
            sweep_interval_ms: 100,
            close_linger_ms: 500,
            ..Self::default()
        }
    }
}
