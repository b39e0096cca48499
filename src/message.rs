//! 프로토콜 메시지 정의
//!
//! 공백으로 구분된 한 줄짜리 텍스트 메시지. 데이터그램 하나에 메시지 하나.
//!
//! ```text
//! DOWNLOAD <filename>
//! OK <filename> SIZE <size> PORT <port>
//! ERR <filename> NOT_FOUND
//! FILE <filename> GET START <start> END <end>
//! FILE <filename> OK START <start> END <end> DATA <base64>
//! FILE <filename> CLOSE
//! FILE <filename> CLOSE_OK
//! ```
//!
//! 모든 메시지 끝에 선택적으로 `SEQ <n>` 트레일러가 붙을 수 있다.
//! 요청은 교환 번호를 싣고, 응답은 요청의 번호를 그대로 돌려준다.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

use crate::{Error, Result};

/// 교환 번호
pub type Seq = u64;

/// 데이터 포트 최소값 (well-known 포트 제외)
pub const MIN_DATA_PORT: u16 = 1024;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Download,
    Granted,
    NotFound,
    Get,
    Data,
    Close,
    CloseOk,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Download => "DOWNLOAD",
            MessageKind::Granted => "OK",
            MessageKind::NotFound => "ERR NOT_FOUND",
            MessageKind::Get => "GET",
            MessageKind::Data => "DATA",
            MessageKind::Close => "CLOSE",
            MessageKind::CloseOk => "CLOSE_OK",
        };
        f.write_str(name)
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// 다운로드 요청 (클라이언트 → 컨트롤 포트)
    Download { filename: String },

    /// 다운로드 허가: 파일 크기와 데이터 포트
    Granted {
        filename: String,
        size: u64,
        port: u16,
    },

    /// 다운로드 거절
    NotFound { filename: String },

    /// 바이트 범위 요청 (end 포함)
    Get {
        filename: String,
        start: u64,
        end: u64,
    },

    /// 바이트 범위 응답
    Data {
        filename: String,
        start: u64,
        end: u64,
        payload: Bytes,
    },

    /// 전송 종료 요청
    Close { filename: String },

    /// 전송 종료 확인
    CloseOk { filename: String },
}

impl Message {
    /// 메시지 타입 반환
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Download { .. } => MessageKind::Download,
            Message::Granted { .. } => MessageKind::Granted,
            Message::NotFound { .. } => MessageKind::NotFound,
            Message::Get { .. } => MessageKind::Get,
            Message::Data { .. } => MessageKind::Data,
            Message::Close { .. } => MessageKind::Close,
            Message::CloseOk { .. } => MessageKind::CloseOk,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Message::Download { filename }
            | Message::Granted { filename, .. }
            | Message::NotFound { filename }
            | Message::Get { filename, .. }
            | Message::Data { filename, .. }
            | Message::Close { filename }
            | Message::CloseOk { filename } => filename,
        }
    }

    /// 로그용 요약 (DATA 페이로드는 길이만 표시)
    pub fn describe(&self) -> String {
        match self {
            Message::Data {
                filename,
                start,
                end,
                payload,
            } => format!(
                "FILE {} OK START {} END {} DATA <{} bytes>",
                filename,
                start,
                end,
                payload.len()
            ),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Download { filename } => write!(f, "DOWNLOAD {}", filename),
            Message::Granted {
                filename,
                size,
                port,
            } => write!(f, "OK {} SIZE {} PORT {}", filename, size, port),
            Message::NotFound { filename } => write!(f, "ERR {} NOT_FOUND", filename),
            Message::Get {
                filename,
                start,
                end,
            } => write!(f, "FILE {} GET START {} END {}", filename, start, end),
            Message::Data {
                filename,
                start,
                end,
                payload,
            } => write!(
                f,
                "FILE {} OK START {} END {} DATA {}",
                filename,
                start,
                end,
                STANDARD.encode(payload)
            ),
            Message::Close { filename } => write!(f, "FILE {} CLOSE", filename),
            Message::CloseOk { filename } => write!(f, "FILE {} CLOSE_OK", filename),
        }
    }
}

/// 데이터그램 하나: 메시지 + 선택적 교환 번호
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message: Message,
    pub seq: Option<Seq>,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self { message, seq: None }
    }

    pub fn with_seq(message: Message, seq: Seq) -> Self {
        Self {
            message,
            seq: Some(seq),
        }
    }

    /// 요청에 대한 응답 프레임 (요청의 교환 번호를 그대로 사용)
    pub fn reply_to(&self, message: Message) -> Self {
        Self {
            message,
            seq: self.seq,
        }
    }

    /// 응답 프레임, `echo_seq`가 false면 교환 번호 없이 (bare 문법)
    pub fn reply_with(&self, message: Message, echo_seq: bool) -> Self {
        Self {
            message,
            seq: self.seq.filter(|_| echo_seq),
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// 바이트에서 역직렬화
    ///
    /// 끝의 `SEQ <n>`은 숫자이고 나머지가 문법에 맞을 때만 트레일러로 본다.
    /// 그 외에는 전체 토큰을 그대로 파싱한다 (`FILE SEQ CLOSE` 같은 파일 이름).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| Error::malformed("not UTF-8"))?;
        let tokens: Vec<&str> = text.split_whitespace().collect();

        if let [rest @ .., "SEQ", n] = tokens.as_slice() {
            if let Ok(seq) = n.parse::<Seq>() {
                if let Ok(message) = parse_message(rest) {
                    return Ok(Self {
                        message,
                        seq: Some(seq),
                    });
                }
            }
        }

        Ok(Self {
            message: parse_message(&tokens)?,
            seq: None,
        })
    }
}

fn parse_message(tokens: &[&str]) -> Result<Message> {
    let message = match tokens {
        ["DOWNLOAD", name] => Message::Download {
            filename: parse_filename(name)?,
        },
        ["OK", name, "SIZE", size, "PORT", port] => {
            let port = parse_number::<u16>(port, "PORT")?;
            if port < MIN_DATA_PORT {
                return Err(Error::malformed(format!(
                    "data port {} below {}",
                    port, MIN_DATA_PORT
                )));
            }
            Message::Granted {
                filename: parse_filename(name)?,
                size: parse_number(size, "SIZE")?,
                port,
            }
        }
        ["ERR", name, "NOT_FOUND"] => Message::NotFound {
            filename: parse_filename(name)?,
        },
        ["FILE", name, "GET", "START", start, "END", end] => {
            let (start, end) = parse_range(start, end)?;
            Message::Get {
                filename: parse_filename(name)?,
                start,
                end,
            }
        }
        ["FILE", name, "OK", "START", start, "END", end, "DATA", encoded] => {
            let (start, end) = parse_range(start, end)?;
            let payload = STANDARD
                .decode(encoded)
                .map_err(|e| Error::malformed(format!("bad base64 payload: {}", e)))?;
            // END = u64::MAX 에서도 overflow 없이 길이 비교
            if payload.is_empty() || payload.len() as u64 - 1 != end - start {
                return Err(Error::malformed(format!(
                    "payload length {} does not match range [{}, {}]",
                    payload.len(),
                    start,
                    end
                )));
            }
            Message::Data {
                filename: parse_filename(name)?,
                start,
                end,
                payload: Bytes::from(payload),
            }
        }
        ["FILE", name, "CLOSE"] => Message::Close {
            filename: parse_filename(name)?,
        },
        ["FILE", name, "CLOSE_OK"] => Message::CloseOk {
            filename: parse_filename(name)?,
        },
        [] => return Err(Error::malformed("empty message")),
        [verb, ..] => {
            return Err(Error::malformed(format!(
                "unrecognized {} message with {} tokens",
                verb,
                tokens.len()
            )))
        }
    };
    Ok(message)
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(seq) = self.seq {
            write!(f, " SEQ {}", seq)?;
        }
        Ok(())
    }
}

/// 파일 이름 검증
///
/// 와이어 포맷은 공백으로 토큰을 나누므로 이름은 공백 없는 단일 토큰이어야 한다.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidFilename(name.to_string()));
    }
    Ok(())
}

fn parse_filename(token: &str) -> Result<String> {
    validate_filename(token).map_err(|_| Error::malformed(format!("bad filename {:?}", token)))?;
    Ok(token.to_string())
}

fn parse_number<T: FromStr>(token: &str, field: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| Error::malformed(format!("{} is not a valid number: {:?}", field, token)))
}

fn parse_range(start: &str, end: &str) -> Result<(u64, u64)> {
    let start: u64 = parse_number(start, "START")?;
    let end: u64 = parse_number(end, "END")?;
    if start > end {
        return Err(Error::malformed(format!("START {} after END {}", start, end)));
    }
    Ok((start, end))
}

/// 다운로드 허가 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferGrant {
    pub filename: String,
    pub file_size: u64,
    pub data_port: u16,
}

impl TransferGrant {
    pub fn to_message(&self) -> Message {
        Message::Granted {
            filename: self.filename.clone(),
            size: self.file_size,
            port: self.data_port,
        }
    }
}

/// 바이트 범위 요청 `[start, end]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub filename: String,
    pub start: u64,
    pub end: u64,
}

impl ChunkRequest {
    /// 요청 바이트 수
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn to_message(&self) -> Message {
        Message::Get {
            filename: self.filename.clone(),
            start: self.start,
            end: self.end,
        }
    }

    /// 응답이 이 요청의 파일 이름/범위를 그대로 돌려주는지 검증하고 페이로드 반환
    pub fn accept(&self, response: Message) -> Result<Bytes> {
        match response {
            Message::Data {
                filename,
                start,
                end,
                payload,
            } if filename == self.filename
                && start == self.start
                && end == self.end
                && payload.len() as u64 == self.length() =>
            {
                Ok(payload)
            }
            other => Err(Error::mismatch(
                format!("FILE {} OK START {} END {}", self.filename, self.start, self.end),
                other.describe(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Frame> {
        Frame::parse(text.as_bytes())
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            parse("DOWNLOAD a.txt").unwrap().message,
            Message::Download {
                filename: "a.txt".into()
            }
        );
        assert_eq!(
            parse("OK a.txt SIZE 12 PORT 50123").unwrap().message,
            Message::Granted {
                filename: "a.txt".into(),
                size: 12,
                port: 50123
            }
        );
        assert_eq!(
            parse("ERR missing.txt NOT_FOUND").unwrap().message,
            Message::NotFound {
                filename: "missing.txt".into()
            }
        );
    }

    #[test]
    fn test_parse_file_messages() {
        assert_eq!(
            parse("FILE a.txt GET START 5 END 9").unwrap().message,
            Message::Get {
                filename: "a.txt".into(),
                start: 5,
                end: 9
            }
        );
        assert_eq!(
            parse("FILE a.txt CLOSE").unwrap().message.kind(),
            MessageKind::Close
        );
        assert_eq!(
            parse("FILE a.txt CLOSE_OK").unwrap().message.kind(),
            MessageKind::CloseOk
        );
    }

    #[test]
    fn test_data_payload_is_base64() {
        let frame = Frame::new(Message::Data {
            filename: "a.txt".into(),
            start: 0,
            end: 4,
            payload: Bytes::from_static(b"hello"),
        });
        assert_eq!(frame.to_string(), "FILE a.txt OK START 0 END 4 DATA aGVsbG8=");

        let parsed = Frame::parse(&frame.to_bytes()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_seq_trailer() {
        let frame = parse("FILE a.txt GET START 0 END 4 SEQ 42").unwrap();
        assert_eq!(frame.seq, Some(42));
        assert_eq!(frame.message.kind(), MessageKind::Get);

        let reply = frame.reply_to(Message::CloseOk {
            filename: "a.txt".into(),
        });
        assert_eq!(reply.to_string(), "FILE a.txt CLOSE_OK SEQ 42");

        assert_eq!(parse("DOWNLOAD a.txt").unwrap().seq, None);

        let close_ok = Message::CloseOk {
            filename: "a.txt".into(),
        };
        assert_eq!(frame.reply_with(close_ok.clone(), true).seq, Some(42));
        assert_eq!(
            frame.reply_with(close_ok, false).to_string(),
            "FILE a.txt CLOSE_OK"
        );
    }

    #[test]
    fn test_filename_seq_is_not_a_trailer() {
        let bare = [
            Message::Download {
                filename: "SEQ".into(),
            },
            Message::NotFound {
                filename: "SEQ".into(),
            },
            Message::Close {
                filename: "SEQ".into(),
            },
            Message::CloseOk {
                filename: "SEQ".into(),
            },
        ];
        for message in bare {
            let plain = Frame::new(message.clone());
            assert_eq!(Frame::parse(&plain.to_bytes()).unwrap(), plain);

            let numbered = Frame::with_seq(message, 7);
            assert_eq!(Frame::parse(&numbered.to_bytes()).unwrap(), numbered);
        }

        assert_eq!(
            parse("ERR SEQ NOT_FOUND").unwrap().message,
            Message::NotFound {
                filename: "SEQ".into()
            }
        );
        // 숫자가 아닌 SEQ 값에 나머지도 문법에 안 맞으면 그대로 에러
        assert!(parse("FILE SEQ GET SEQ x").is_err());
    }

    #[test]
    fn test_trailing_newline_tolerated() {
        let frame = parse("DOWNLOAD a.txt\n").unwrap();
        assert_eq!(frame.message.filename(), "a.txt");
    }

    #[test]
    fn test_malformed_messages() {
        let cases = [
            "",
            "DOWNLOAD",
            "DOWNLOAD a b",
            "HELLO server",
            "OK a.txt SIZE twelve PORT 50000",
            "OK a.txt SIZE 12 PORT 99999",
            "OK a.txt SIZE 12 PORT 80",
            "FILE a.txt GET START 9 END 5",
            "FILE a.txt GET START -1 END 5",
            "FILE a.txt OK START 0 END 4 DATA !!!",
            "FILE a.txt OK START 0 END 9 DATA aGVsbG8=",
            "FILE a.txt CLOSE SEQ x",
        ];
        for case in cases {
            assert!(
                matches!(parse(case), Err(Error::MalformedMessage(_))),
                "expected malformed: {:?}",
                case
            );
        }

        assert!(matches!(
            Frame::parse(&[0xff, 0xfe, 0x00]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report-2024.csv").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("two words.txt").is_err());
        assert!(validate_filename("tab\tname").is_err());
    }

    #[test]
    fn test_chunk_request_accept() {
        let request = ChunkRequest {
            filename: "a.txt".into(),
            start: 5,
            end: 9,
        };
        assert_eq!(request.length(), 5);
        assert_eq!(request.to_message().to_string(), "FILE a.txt GET START 5 END 9");

        let payload = request
            .accept(Message::Data {
                filename: "a.txt".into(),
                start: 5,
                end: 9,
                payload: Bytes::from_static(b" worl"),
            })
            .unwrap();
        assert_eq!(&payload[..], b" worl");

        let wrong_range = request.accept(Message::Data {
            filename: "a.txt".into(),
            start: 0,
            end: 4,
            payload: Bytes::from_static(b"hello"),
        });
        assert!(matches!(wrong_range, Err(Error::ProtocolMismatch { .. })));

        let wrong_kind = request.accept(Message::CloseOk {
            filename: "a.txt".into(),
        });
        assert!(matches!(wrong_kind, Err(Error::ProtocolMismatch { .. })));
    }
}
