//! 컨트롤 리스너 (서버측)
//!
//! - well-known 포트에서 DOWNLOAD 요청 수신
//! - 파일 확인 후 데이터 포트를 무작위로 할당해 OK/ERR 응답
//! - 허가된 전송마다 세션 태스크 생성
//! - 유휴 세션 주기적 정리

use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::fs::File;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::message::{Frame, Message, TransferGrant};
use crate::paths::resolve_within;
use crate::session::{SessionEnd, SessionKey, SessionRegistry, TransferSession};
use crate::stats::{ServerCounters, ServerEvent, ServerStats};
use crate::{Config, Error, Result};

/// 데이터 포트 할당기
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    control_port: u16,
    attempts: u32,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, control_port: u16, attempts: u32) -> Self {
        Self {
            range,
            control_port,
            attempts,
        }
    }

    /// 범위 안의 무작위 포트 (컨트롤 포트 제외)
    fn pick(&self) -> Option<u16> {
        let mut rng = rand::thread_rng();
        let port = rng.gen_range(self.range.clone());
        (port != self.control_port).then_some(port)
    }

    /// 무작위 포트에 바인딩, 사용 중이면 다른 포트로 재시도
    pub async fn bind(&self, ip: IpAddr) -> Result<UdpSocket> {
        for _ in 0..self.attempts {
            let Some(port) = self.pick() else {
                continue;
            };
            match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("데이터 포트 {} 사용 중, 재시도", port);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::PortsExhausted {
            attempts: self.attempts,
        })
    }
}

/// 컨트롤 리스너
pub struct ControlListener {
    config: Config,
    root: PathBuf,
    socket: Arc<UdpSocket>,
    registry: Arc<SessionRegistry>,
    permits: Arc<Semaphore>,
    ports: PortAllocator,
    counters: Arc<ServerCounters>,
    running: AtomicBool,
}

impl ControlListener {
    /// 컨트롤 포트 바인딩
    pub async fn bind(
        bind_addr: SocketAddr,
        root: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let ports = PortAllocator::new(
            config.data_ports(),
            local_addr.port(),
            config.port_bind_attempts,
        );

        Ok(Self {
            root: root.into(),
            socket: Arc::new(socket),
            registry: Arc::new(SessionRegistry::new()),
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            ports,
            counters: Arc::new(ServerCounters::default()),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 서버 통계
    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// 요청 수신 루프
    ///
    /// `stop()`이 호출되면 다음 sweep 주기에 종료한다. 진행 중인 세션은 계속 실행된다.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "RFTP listener started on {} (root {:?}, data ports {}-{})",
            self.local_addr()?,
            self.root,
            self.config.data_port_min,
            self.config.data_port_max
        );

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        let mut sweep = tokio::time::interval(self.config.sweep_interval());

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            if let Err(e) = self.handle_datagram(&buf[..len], addr).await {
                                warn!("요청 처리 에러 ({}): {}", addr, e);
                            }
                        }
                        Err(e) => {
                            warn!("수신 에러: {}", e);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_idle_sessions();
                }
            }
        }

        info!("RFTP listener stopped");
        Ok(())
    }

    /// 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn sweep_idle_sessions(&self) {
        for key in self.registry.sweep_idle(self.config.session_idle_timeout()) {
            info!("유휴 세션 정리 신호: {} -> {}", key.filename, key.client);
        }
    }

    /// 데이터그램 하나 처리
    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        let frame = match Frame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                // 응답하지 않음: 클라이언트 재시도에 맡김
                debug!("잘못된 컨트롤 메시지 무시 ({}): {}", addr, e);
                self.counters.record(ServerEvent::Dropped);
                return Ok(());
            }
        };

        let filename = match &frame.message {
            Message::Download { filename } => filename.clone(),
            other => {
                debug!("컨트롤 포트에서 처리하지 않는 메시지 무시: {}", other.describe());
                self.counters.record(ServerEvent::Dropped);
                return Ok(());
            }
        };
        info!("DOWNLOAD {} from {}", filename, addr);

        // 이전 OK가 유실된 중복 요청
        if let Some(handle) = self.registry.lookup(addr, &filename) {
            handle.touch();
            let grant = TransferGrant {
                filename,
                file_size: handle.file_size,
                data_port: handle.data_port,
            };
            debug!("기존 세션으로 OK 재전송: port {}", grant.data_port);
            self.counters.record(ServerEvent::Regranted);
            return self.reply(&frame, grant.to_message(), addr).await;
        }

        let Some((file, file_size)) = self.open_file(&filename).await else {
            self.counters.record(ServerEvent::Rejected);
            return self
                .reply(&frame, Message::NotFound { filename }, addr)
                .await;
        };

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(
                "세션 한도 {} 도달, {} 요청 무시",
                self.config.max_sessions, addr
            );
            self.counters.record(ServerEvent::Dropped);
            return Ok(());
        };

        let socket = self.ports.bind(self.local_addr()?.ip()).await?;
        let key = SessionKey::new(addr, filename.clone());
        let session = TransferSession::register(
            key.clone(),
            file,
            file_size,
            socket,
            self.registry.clone(),
            &self.config,
        )?;

        let grant = TransferGrant {
            filename,
            file_size,
            data_port: session.data_port(),
        };
        if let Err(e) = self.reply(&frame, grant.to_message(), addr).await {
            // 세션은 여기서 drop 되므로 레지스트리에 남기지 않는다
            self.registry.remove_if_port(&key, grant.data_port);
            return Err(e);
        }
        self.counters.record(ServerEvent::Granted);
        info!(
            "OK {} SIZE {} PORT {} -> {}",
            grant.filename, grant.file_size, grant.data_port, addr
        );

        let counters = self.counters.clone();
        tokio::spawn(async move {
            let event = match session.run().await {
                Ok(SessionEnd::Closed) => ServerEvent::Closed,
                Ok(SessionEnd::Evicted) => ServerEvent::Evicted,
                Err(_) => ServerEvent::Aborted,
            };
            counters.record(event);
            drop(permit);
        });

        Ok(())
    }

    /// 루트 아래의 읽기 가능한 일반 파일 열기
    async fn open_file(&self, filename: &str) -> Option<(File, u64)> {
        let path = match resolve_within(&self.root, filename) {
            Ok(path) => path,
            Err(e) => {
                warn!("거부된 파일 이름 {:?}: {}", filename, e);
                return None;
            }
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                debug!("파일 열기 실패 {:?}: {}", path, e);
                return None;
            }
        };

        match file.metadata().await {
            Ok(metadata) if metadata.is_file() => Some((file, metadata.len())),
            Ok(_) => {
                debug!("일반 파일이 아님: {:?}", path);
                None
            }
            Err(e) => {
                debug!("메타데이터 조회 실패 {:?}: {}", path, e);
                None
            }
        }
    }

    async fn reply(&self, request: &Frame, message: Message, addr: SocketAddr) -> Result<()> {
        let frame = request.reply_with(message, self.config.sequence_numbers);
        self.socket.send_to(&frame.to_bytes(), addr).await?;
        debug!("[SENT] {} -> {}", frame.message.describe(), addr);
        Ok(())
    }
}
