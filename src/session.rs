//! 전송 세션 (서버측)
//!
//! - 허가된 전송 하나당 세션 하나
//! - 파일 읽기 핸들 하나와 데이터 포트 소켓 하나를 독점
//! - GET에 바이트 범위로 응답, CLOSE로 종료
//! - 레지스트리: (클라이언트 주소, 파일 이름) → 세션 핸들

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::message::{Frame, Message};
use crate::{Config, Error, Result, MAX_BLOCK_SIZE};

/// 세션 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub client: SocketAddr,
    pub filename: String,
}

impl SessionKey {
    pub fn new(client: SocketAddr, filename: impl Into<String>) -> Self {
        Self {
            client,
            filename: filename.into(),
        }
    }
}

/// 세션 핸들 (레지스트리에 저장)
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// 바인딩된 데이터 포트
    pub data_port: u16,

    /// 허가 시점의 파일 크기
    pub file_size: u64,

    /// 마지막 활동 시간
    last_activity: Arc<Mutex<Instant>>,

    /// sweep → 세션 종료 신호
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(data_port: u16, file_size: u64) -> Self {
        Self {
            data_port,
            file_size,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// 활동 시간 갱신
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// 세션에 종료 신호
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// 활성 세션 레지스트리
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SessionKey, handle: SessionHandle) {
        self.sessions.insert(key, handle);
    }

    /// 같은 클라이언트의 같은 파일에 대한 활성 세션
    pub fn lookup(&self, client: SocketAddr, filename: &str) -> Option<SessionHandle> {
        self.sessions
            .get(&SessionKey::new(client, filename))
            .map(|entry| entry.value().clone())
    }

    /// 포트가 일치할 때만 제거
    ///
    /// 유휴 정리 후 같은 키로 새 세션이 등록됐을 수 있으므로 포트로 확인한다.
    pub fn remove_if_port(&self, key: &SessionKey, data_port: u16) -> bool {
        self.sessions
            .remove_if(key, |_, handle| handle.data_port == data_port)
            .is_some()
    }

    /// `threshold` 이상 유휴 상태인 세션에 종료 신호를 보내고 제거
    pub fn sweep_idle(&self, threshold: Duration) -> Vec<SessionKey> {
        let mut evicted = Vec::new();
        self.sessions.retain(|key, handle| {
            if handle.idle_for() >= threshold {
                handle.shutdown();
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 클라이언트 CLOSE
    Closed,
    /// 유휴 sweep
    Evicted,
}

/// 전송 세션
pub struct TransferSession {
    key: SessionKey,
    file: File,
    socket: UdpSocket,
    handle: SessionHandle,
    registry: Arc<SessionRegistry>,
    close_linger: Duration,
    echo_seq: bool,
    buf: Vec<u8>,
}

impl TransferSession {
    /// 세션 생성 및 레지스트리 등록
    pub fn register(
        key: SessionKey,
        file: File,
        file_size: u64,
        socket: UdpSocket,
        registry: Arc<SessionRegistry>,
        config: &Config,
    ) -> Result<Self> {
        let data_port = socket.local_addr()?.port();
        let handle = SessionHandle::new(data_port, file_size);
        registry.insert(key.clone(), handle.clone());

        Ok(Self {
            key,
            file,
            socket,
            handle,
            registry,
            close_linger: config.close_linger(),
            echo_seq: config.sequence_numbers,
            buf: vec![0u8; 65535],
        })
    }

    pub fn data_port(&self) -> u16 {
        self.handle.data_port
    }

    /// 세션 실행 (종료까지)
    pub async fn run(mut self) -> Result<SessionEnd> {
        info!(
            "세션 시작: {} -> {} (port {}, {} bytes)",
            self.key.filename, self.key.client, self.handle.data_port, self.handle.file_size
        );

        let outcome = self.serve().await;
        self.registry.remove_if_port(&self.key, self.handle.data_port);

        let TransferSession {
            key,
            file,
            socket,
            close_linger,
            echo_seq,
            mut buf,
            ..
        } = self;
        // 파일 핸들 해제
        drop(file);

        match &outcome {
            Ok(SessionEnd::Closed) => {
                info!("세션 종료: {} -> {}", key.filename, key.client);
                linger(&socket, &key, close_linger, echo_seq, &mut buf).await;
            }
            Ok(SessionEnd::Evicted) => {
                info!("유휴 세션 정리: {} -> {}", key.filename, key.client);
            }
            Err(e) => {
                warn!("세션 중단: {} -> {}: {}", key.filename, key.client, e);
            }
        }

        outcome
    }

    async fn serve(&mut self) -> Result<SessionEnd> {
        loop {
            let (len, from) = tokio::select! {
                received = self.socket.recv_from(&mut self.buf) => match received {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("수신 에러: {}", e);
                        continue;
                    }
                },
                _ = self.handle.shutdown.notified() => return Ok(SessionEnd::Evicted),
            };

            if from != self.key.client {
                debug!("다른 클라이언트의 데이터그램 무시: {}", from);
                continue;
            }

            let frame = match Frame::parse(&self.buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("잘못된 메시지 무시: {}", e);
                    continue;
                }
            };

            if frame.message.filename() != self.key.filename {
                debug!("다른 파일 이름 무시: {}", frame.message.describe());
                continue;
            }

            match frame.message {
                Message::Get { start, end, .. } => {
                    if end >= self.handle.file_size || end - start >= MAX_BLOCK_SIZE as u64 {
                        warn!(
                            "범위 밖/너무 큰 GET 무시: {} [{}, {}] (size {})",
                            self.key.filename, start, end, self.handle.file_size
                        );
                        continue;
                    }
                    self.handle.touch();

                    let payload = self.read_range(start, end).await?;
                    let reply = frame.reply_with(
                        Message::Data {
                            filename: self.key.filename.clone(),
                            start,
                            end,
                            payload,
                        },
                        self.echo_seq,
                    );
                    send_reply(&self.socket, &reply, from).await;
                }
                Message::Close { .. } => {
                    // CLOSE_OK 이후의 DOWNLOAD는 새 세션을 받아야 한다
                    self.registry.remove_if_port(&self.key, self.handle.data_port);
                    let reply = frame.reply_with(
                        Message::CloseOk {
                            filename: self.key.filename.clone(),
                        },
                        self.echo_seq,
                    );
                    send_reply(&self.socket, &reply, from).await;
                    return Ok(SessionEnd::Closed);
                }
                ref other => {
                    debug!("세션에서 처리하지 않는 메시지 무시: {}", other.describe());
                }
            }
        }
    }

    /// `[start, end]` 범위를 정확히 읽음
    async fn read_range(&mut self, start: u64, end: u64) -> Result<Bytes> {
        let expected = end - start + 1;
        let mut payload = BytesMut::zeroed(expected as usize);

        self.file.seek(SeekFrom::Start(start)).await?;
        let mut filled = 0;
        while filled < payload.len() {
            let n = self.file.read(&mut payload[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < payload.len() {
            return Err(Error::ShortRead {
                filename: self.key.filename.clone(),
                expected,
                got: filled as u64,
            });
        }

        Ok(payload.freeze())
    }
}

async fn send_reply(socket: &UdpSocket, frame: &Frame, to: SocketAddr) {
    if let Err(e) = socket.send_to(&frame.to_bytes(), to).await {
        warn!("응답 전송 실패 ({}): {}", to, e);
    }
}

/// CLOSE_OK 유실에 대비해 잠시 포트를 유지하며 중복 CLOSE에 재응답
async fn linger(
    socket: &UdpSocket,
    key: &SessionKey,
    duration: Duration,
    echo_seq: bool,
    buf: &mut [u8],
) {
    let deadline = tokio::time::Instant::now() + duration;

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => continue,
            Err(_) => return,
        };
        if from != key.client {
            continue;
        }

        if let Ok(frame) = Frame::parse(&buf[..len]) {
            if let Message::Close { filename } = &frame.message {
                if *filename == key.filename {
                    debug!("중복 CLOSE 재응답: {}", filename);
                    let reply = frame.reply_with(
                        Message::CloseOk {
                            filename: filename.clone(),
                        },
                        echo_seq,
                    );
                    send_reply(socket, &reply, from).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        client: UdpSocket,
        session_addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        session: Option<TransferSession>,
    }

    async fn fixture(contents: &[u8]) -> Fixture {
        let config = Config {
            close_linger_ms: 50,
            ..Config::loopback()
        };
        fixture_with(contents, &config).await
    }

    async fn fixture_with(contents: &[u8], config: &Config) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session_addr = socket.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let file = File::open(&path).await.unwrap();

        let session = TransferSession::register(
            SessionKey::new(client.local_addr().unwrap(), "a.txt"),
            file,
            contents.len() as u64,
            socket,
            registry.clone(),
            config,
        )
        .unwrap();

        Fixture {
            _dir: dir,
            path,
            client,
            session_addr,
            registry,
            session: Some(session),
        }
    }

    async fn exchange(client: &UdpSocket, to: SocketAddr, message: Message) -> Option<Message> {
        client
            .send_to(&Frame::new(message).to_bytes(), to)
            .await
            .unwrap();
        let mut buf = vec![0u8; 65535];
        match tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Frame::parse(&buf[..len]).unwrap().message),
            _ => None,
        }
    }

    fn get(filename: &str, start: u64, end: u64) -> Message {
        Message::Get {
            filename: filename.into(),
            start,
            end,
        }
    }

    #[test]
    fn test_registry_lookup_and_remove() {
        let registry = SessionRegistry::new();
        let client: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let key = SessionKey::new(client, "a.txt");

        registry.insert(key.clone(), SessionHandle::new(50001, 12));
        assert_eq!(registry.lookup(client, "a.txt").unwrap().data_port, 50001);
        assert!(registry.lookup(client, "b.txt").is_none());

        // 다른 포트의 세션은 제거하지 않음
        assert!(!registry.remove_if_port(&key, 50002));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_port(&key, 50001));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_sweep_idle() {
        let registry = SessionRegistry::new();
        let client: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        registry.insert(SessionKey::new(client, "a.txt"), SessionHandle::new(50001, 1));
        registry.insert(SessionKey::new(client, "b.txt"), SessionHandle::new(50002, 1));

        assert!(registry.sweep_idle(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.len(), 2);

        let evicted = registry.sweep_idle(Duration::ZERO);
        assert_eq!(evicted.len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_serves_ranges_and_closes() {
        let mut fx = fixture(b"hello world!").await;
        let task = tokio::spawn(fx.session.take().unwrap().run());

        let first = exchange(&fx.client, fx.session_addr, get("a.txt", 0, 4)).await;
        let again = exchange(&fx.client, fx.session_addr, get("a.txt", 0, 4)).await;
        match (&first, &again) {
            (Some(Message::Data { payload: a, .. }), Some(Message::Data { payload: b, .. })) => {
                assert_eq!(&a[..], b"hello");
                assert_eq!(a, b);
            }
            other => panic!("expected two DATA replies, got {:?}", other),
        }

        let last = exchange(&fx.client, fx.session_addr, get("a.txt", 10, 11)).await;
        assert!(matches!(last, Some(Message::Data { ref payload, .. }) if &payload[..] == b"!"));

        // 다른 파일 이름과 범위 밖 요청은 응답 없음
        assert!(exchange(&fx.client, fx.session_addr, get("b.txt", 0, 4)).await.is_none());
        assert!(exchange(&fx.client, fx.session_addr, get("a.txt", 8, 12)).await.is_none());

        let closed = exchange(
            &fx.client,
            fx.session_addr,
            Message::Close {
                filename: "a.txt".into(),
            },
        )
        .await;
        assert_eq!(
            closed,
            Some(Message::CloseOk {
                filename: "a.txt".into()
            })
        );

        // linger 동안 중복 CLOSE에도 응답
        let duplicate = exchange(
            &fx.client,
            fx.session_addr,
            Message::Close {
                filename: "a.txt".into(),
            },
        )
        .await;
        assert!(matches!(duplicate, Some(Message::CloseOk { .. })));

        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Closed);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_replies_without_seq_when_disabled() {
        let config = Config {
            sequence_numbers: false,
            close_linger_ms: 50,
            ..Config::loopback()
        };
        let mut fx = fixture_with(b"hello world!", &config).await;
        let task = tokio::spawn(fx.session.take().unwrap().run());

        let mut buf = vec![0u8; 65535];
        let requests = [
            get("a.txt", 0, 4),
            Message::Close {
                filename: "a.txt".into(),
            },
        ];
        for request in requests {
            fx.client
                .send_to(&Frame::with_seq(request, 9).to_bytes(), fx.session_addr)
                .await
                .unwrap();
            let (len, _) = tokio::time::timeout(
                Duration::from_millis(200),
                fx.client.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            let reply = Frame::parse(&buf[..len]).unwrap();
            assert_eq!(reply.seq, None);
        }

        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_ignores_other_clients() {
        let mut fx = fixture(b"hello world!").await;
        let task = tokio::spawn(fx.session.take().unwrap().run());

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(exchange(&stranger, fx.session_addr, get("a.txt", 0, 4)).await.is_none());

        fx.registry.sweep_idle(Duration::ZERO);
        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Evicted);
    }

    #[tokio::test]
    async fn test_short_read_aborts_session() {
        let mut fx = fixture(b"hello world!").await;
        let task = tokio::spawn(fx.session.take().unwrap().run());

        // 허가 이후 파일이 줄어듦
        std::fs::OpenOptions::new()
            .write(true)
            .open(&fx.path)
            .unwrap()
            .set_len(6)
            .unwrap();

        assert!(exchange(&fx.client, fx.session_addr, get("a.txt", 5, 9)).await.is_none());
        match task.await.unwrap() {
            Err(Error::ShortRead {
                expected, got, ..
            }) => {
                assert_eq!(expected, 5);
                assert_eq!(got, 1);
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
        assert!(fx.registry.is_empty());
    }
}
