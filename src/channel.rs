//! 신뢰성 요청/응답 채널
//!
//! - 요청 하나를 보내고 응답 하나를 기다림 (stop-and-wait)
//! - 타임아웃 시 재전송, 타임아웃은 시도마다 두 배
//! - `max_retries`회 시도 후 `NoResponse`
//!
//! 응답 상관관계: 교환마다 새 `SEQ` 번호를 붙이고, 재전송은 같은 번호를
//! 재사용한다. 이전 교환 번호를 가진 늦은 응답은 버린다. `sequence_numbers`
//! 를 끄면 "채널당 동시에 하나의 요청" 가정에만 의존하며, 이때 이전 교환의
//! 늦은 중복 응답이 현재 교환의 응답으로 오인될 수 있다.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::{Frame, Message, Seq};
use crate::stats::ExchangeCounters;
use crate::{Config, Error, Result};

/// 신뢰성 채널
///
/// `send`가 `&mut self`를 받으므로 채널당 진행 중인 교환은 항상 하나다.
pub struct ReliableChannel {
    socket: UdpSocket,
    config: Config,
    next_seq: Seq,
    counters: ExchangeCounters,
    buf: Vec<u8>,
}

impl ReliableChannel {
    /// 소켓 바인딩 후 채널 생성
    pub async fn bind(local_addr: SocketAddr, config: Config) -> Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    pub fn from_socket(socket: UdpSocket, config: Config) -> Self {
        let buf = vec![0u8; config.recv_buffer_size];
        Self {
            socket,
            config,
            next_seq: 0,
            counters: ExchangeCounters::default(),
            buf,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 누적 교환 카운터
    pub fn counters(&self) -> ExchangeCounters {
        self.counters
    }

    /// 요청을 보내고 응답을 기다림
    pub async fn send(&mut self, message: Message, peer: SocketAddr) -> Result<Message> {
        let seq = if self.config.sequence_numbers {
            self.next_seq += 1;
            Some(self.next_seq)
        } else {
            None
        };
        let frame = Frame { message, seq };
        let bytes = frame.to_bytes();

        for (attempt, timeout) in self.config.backoff_schedule().into_iter().enumerate() {
            if attempt > 0 {
                self.counters.retransmits += 1;
                debug!(
                    "재전송 #{} -> {}: {} (timeout {:?})",
                    attempt,
                    peer,
                    frame.message.describe(),
                    timeout
                );
            }

            self.counters.attempts += 1;
            self.socket.send_to(&bytes, peer).await?;

            if let Some(reply) = self.await_reply(peer, seq, timeout).await {
                self.counters.exchanges += 1;
                return Ok(reply);
            }
        }

        self.counters.failures += 1;
        Err(Error::NoResponse {
            attempts: self.config.max_retries,
            last_message: frame.message.describe(),
        })
    }

    /// 데드라인까지 `peer`의 응답을 기다림
    ///
    /// 다른 주소, 파싱 실패, 이전 교환 번호의 데이터그램은 버리고 계속 기다린다.
    async fn await_reply(
        &mut self,
        peer: SocketAddr,
        seq: Option<Seq>,
        timeout: Duration,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;

            let (len, from) = match received {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("수신 에러: {}", e);
                    continue;
                }
                Err(_) => return None,
            };

            if from != peer {
                self.counters.foreign_datagrams += 1;
                debug!("다른 주소의 데이터그램 무시: {} (expected {})", from, peer);
                continue;
            }

            let reply = match Frame::parse(&self.buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    self.counters.malformed_replies += 1;
                    debug!("잘못된 응답 무시: {}", e);
                    continue;
                }
            };

            if let (Some(expected), Some(got)) = (seq, reply.seq) {
                if got != expected {
                    self.counters.stale_replies += 1;
                    debug!("늦은 응답 무시: seq={} (current {})", got, expected);
                    continue;
                }
            }

            return Some(reply.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_retries: u32, initial_timeout_ms: u64) -> Config {
        Config {
            max_retries,
            initial_timeout_ms,
            ..Config::default()
        }
    }

    async fn bind_local() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_frame(socket: &UdpSocket) -> (Frame, SocketAddr) {
        let mut buf = vec![0u8; 65535];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        (Frame::parse(&buf[..len]).unwrap(), from)
    }

    fn close_ok() -> Message {
        Message::CloseOk {
            filename: "a.txt".into(),
        }
    }

    fn close() -> Message {
        Message::Close {
            filename: "a.txt".into(),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_exactly_max_retries() {
        let (peer, peer_addr) = bind_local().await;
        let mut channel = ReliableChannel::bind("127.0.0.1:0".parse().unwrap(), test_config(3, 20))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = channel.send(close(), peer_addr).await;
        let elapsed = started.elapsed();

        match result {
            Err(Error::NoResponse {
                attempts,
                last_message,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_message, "FILE a.txt CLOSE");
            }
            other => panic!("expected NoResponse, got {:?}", other),
        }
        // 20 + 40 + 80 ms
        assert!(elapsed >= Duration::from_millis(140));

        let mut received = 0;
        let mut buf = vec![0u8; 1024];
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await
        {
            received += 1;
        }
        assert_eq!(received, 3);

        let counters = channel.counters();
        assert_eq!(counters.attempts, 3);
        assert_eq!(counters.retransmits, 2);
        assert_eq!(counters.failures, 1);
    }

    #[tokio::test]
    async fn test_retransmits_after_lost_request() {
        let (peer, peer_addr) = bind_local().await;
        let mut channel = ReliableChannel::bind("127.0.0.1:0".parse().unwrap(), test_config(5, 30))
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            // 첫 요청은 유실된 것으로 처리
            let (first, _) = recv_frame(&peer).await;
            let (second, from) = recv_frame(&peer).await;
            assert_eq!(first.seq, second.seq);
            let reply = second.reply_to(close_ok());
            peer.send_to(&reply.to_bytes(), from).await.unwrap();
        });

        let reply = channel.send(close(), peer_addr).await.unwrap();
        assert_eq!(reply, close_ok());
        server.await.unwrap();

        let counters = channel.counters();
        assert_eq!(counters.exchanges, 1);
        assert_eq!(counters.retransmits, 1);
    }

    #[tokio::test]
    async fn test_stale_and_malformed_replies_are_ignored() {
        let (peer, peer_addr) = bind_local().await;
        let mut channel = ReliableChannel::bind("127.0.0.1:0".parse().unwrap(), test_config(3, 500))
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let (request, from) = recv_frame(&peer).await;
            let current = request.seq.unwrap();

            let stale = Frame::with_seq(close_ok(), current - 1);
            peer.send_to(&stale.to_bytes(), from).await.unwrap();
            peer.send_to(b"FILE a.txt GARBAGE", from).await.unwrap();

            let reply = request.reply_to(close_ok());
            peer.send_to(&reply.to_bytes(), from).await.unwrap();
        });

        let reply = channel.send(close(), peer_addr).await.unwrap();
        assert_eq!(reply, close_ok());
        server.await.unwrap();

        let counters = channel.counters();
        assert_eq!(counters.stale_replies, 1);
        assert_eq!(counters.malformed_replies, 1);
        assert_eq!(counters.retransmits, 0);
    }

    #[tokio::test]
    async fn test_foreign_datagrams_are_ignored() {
        let (peer, peer_addr) = bind_local().await;
        let (intruder, _) = bind_local().await;
        let mut channel = ReliableChannel::bind("127.0.0.1:0".parse().unwrap(), test_config(3, 500))
            .await
            .unwrap();
        let channel_addr = channel.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (request, from) = recv_frame(&peer).await;
            let fake = request.reply_to(Message::NotFound {
                filename: "a.txt".into(),
            });
            intruder.send_to(&fake.to_bytes(), channel_addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.send_to(&request.reply_to(close_ok()).to_bytes(), from)
                .await
                .unwrap();
        });

        let reply = channel.send(close(), peer_addr).await.unwrap();
        assert_eq!(reply, close_ok());
        server.await.unwrap();
        assert_eq!(channel.counters().foreign_datagrams, 1);
    }

    #[tokio::test]
    async fn test_without_sequence_numbers() {
        let (peer, peer_addr) = bind_local().await;
        let config = Config {
            sequence_numbers: false,
            ..test_config(3, 500)
        };
        let mut channel = ReliableChannel::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let (request, from) = recv_frame(&peer).await;
            assert_eq!(request.seq, None);
            peer.send_to(&request.reply_to(close_ok()).to_bytes(), from)
                .await
                .unwrap();
        });

        assert_eq!(channel.send(close(), peer_addr).await.unwrap(), close_ok());
        server.await.unwrap();
    }
}
