//! Memcached text protocol, single-key subset.
//!
//! Requests and replies are `\r\n` terminated lines; values travel as a
//! length-prefixed data block after a `VALUE` or storage line.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CacheError;

const CRLF: &[u8] = b"\r\n";
const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

impl StoreMode {
    fn verb(self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: String,
    },
    Store {
        mode: StoreMode,
        key: String,
        value: Vec<u8>,
        ttl: u32,
    },
    Delete {
        key: String,
    },
    Touch {
        key: String,
        ttl: u32,
    },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Store { key, .. }
            | Command::Delete { key }
            | Command::Touch { key, .. } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::Store { mode, .. } => mode.verb(),
            Command::Delete { .. } => "delete",
            Command::Touch { .. } => "touch",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = match self {
            Command::Get { key } => format!("get {key}").into_bytes(),
            Command::Store {
                mode,
                key,
                value,
                ttl,
            } => {
                let mut line = format!("{} {key} 0 {ttl} {}\r\n", mode.verb(), value.len())
                    .into_bytes();
                line.extend_from_slice(value);
                line
            }
            Command::Delete { key } => format!("delete {key}").into_bytes(),
            Command::Touch { key, ttl } => format!("touch {key} {ttl}").into_bytes(),
        };
        out.extend_from_slice(CRLF);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value(Option<Vec<u8>>),
    Stored,
    NotStored,
    Deleted,
    Touched,
    NotFound,
}

/// Keys must be non-empty, bounded, and free of whitespace or control bytes.
pub fn validate_key(key: &str, max_len: usize) -> Result<(), CacheError> {
    let invalid = |message: String| Err(CacheError::InvalidKey { message });
    if key.is_empty() {
        return invalid("key is empty".to_string());
    }
    if key.len() > max_len {
        return invalid(format!("key is {} bytes, limit is {max_len}", key.len()));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return invalid(format!("key {key:?} contains whitespace or control characters"));
    }
    Ok(())
}

pub async fn write_command<W>(writer: &mut W, command: &Command) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&command.encode()).await?;
    writer.flush().await
}

/// Failure while reading a reply, before it is attributed to a server.
#[derive(Debug)]
pub enum ReadError {
    Io(io::Error),
    /// The server closed the socket.
    Eof,
    Malformed(String),
    /// `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR` reply; the socket stays usable.
    Server(String),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(err)
    }
}

/// Reads the reply to `command`. Values longer than `max_value` bytes are
/// rejected before anything is allocated for them.
pub async fn read_response<R>(
    reader: &mut R,
    command: &Command,
    max_value: usize,
) -> Result<Response, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    if let Some(message) = server_error(&line) {
        return Err(ReadError::Server(message));
    }

    match command {
        Command::Get { key } => read_value(reader, key, line, max_value).await,
        Command::Store { .. } => match line.as_str() {
            "STORED" => Ok(Response::Stored),
            "NOT_STORED" => Ok(Response::NotStored),
            _ => Err(unexpected(command, &line)),
        },
        Command::Delete { .. } => match line.as_str() {
            "DELETED" => Ok(Response::Deleted),
            "NOT_FOUND" => Ok(Response::NotFound),
            _ => Err(unexpected(command, &line)),
        },
        Command::Touch { .. } => match line.as_str() {
            "TOUCHED" => Ok(Response::Touched),
            "NOT_FOUND" => Ok(Response::NotFound),
            _ => Err(unexpected(command, &line)),
        },
    }
}

async fn read_value<R>(
    reader: &mut R,
    key: &str,
    line: String,
    max_value: usize,
) -> Result<Response, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    if line == "END" {
        return Ok(Response::Value(None));
    }

    let mut parts = line.split(' ');
    let (Some("VALUE"), Some(found), Some(_flags), Some(len), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(ReadError::Malformed(format!("unexpected get reply {line:?}")));
    };
    if found != key {
        return Err(ReadError::Malformed(format!(
            "asked for {key:?}, server answered {found:?}"
        )));
    }
    let len: usize = len
        .parse()
        .map_err(|_| ReadError::Malformed(format!("bad value length in {line:?}")))?;
    if len > max_value {
        return Err(ReadError::Malformed(format!(
            "value of {len} bytes exceeds the {max_value} byte limit"
        )));
    }
    let Some(block) = len.checked_add(CRLF.len()) else {
        return Err(ReadError::Malformed(format!("bad value length in {line:?}")));
    };

    let mut data = vec![0u8; block];
    reader.read_exact(&mut data).await?;
    if !data.ends_with(CRLF) {
        return Err(ReadError::Malformed("value block not terminated".to_string()));
    }
    data.truncate(len);

    match read_line(reader).await?.as_str() {
        "END" => Ok(Response::Value(Some(data))),
        other => Err(ReadError::Malformed(format!("expected END, got {other:?}"))),
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Err(ReadError::Eof);
    }
    Ok(line.trim_end_matches(LINE_ENDINGS).to_string())
}

fn server_error(line: &str) -> Option<String> {
    let is_error =
        line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR");
    is_error.then(|| line.to_string())
}

fn unexpected(command: &Command, line: &str) -> ReadError {
    ReadError::Malformed(format!("unexpected {} reply {line:?}", command.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_VALUE: usize = 1_048_576;

    async fn reply(bytes: &'static [u8], command: &Command) -> Result<Response, ReadError> {
        let mut reader = tokio::io::BufReader::new(bytes);
        read_response(&mut reader, command, MAX_VALUE).await
    }

    fn get(key: &str) -> Command {
        Command::Get {
            key: key.to_string(),
        }
    }

    #[test]
    fn store_commands_carry_length_and_data() {
        let command = Command::Store {
            mode: StoreMode::Add,
            key: "k".into(),
            value: b"hello".to_vec(),
            ttl: 60,
        };
        assert_eq!(command.encode(), b"add k 0 60 5\r\nhello\r\n".to_vec());
        assert_eq!(get("k").encode(), b"get k\r\n".to_vec());
    }

    #[tokio::test]
    async fn reads_hit_and_miss() {
        let hit = reply(b"VALUE k 0 5\r\nhello\r\nEND\r\n", &get("k")).await;
        assert_eq!(hit.unwrap(), Response::Value(Some(b"hello".to_vec())));

        let miss = reply(b"END\r\n", &get("k")).await;
        assert_eq!(miss.unwrap(), Response::Value(None));
    }

    #[tokio::test]
    async fn binary_values_may_contain_line_breaks() {
        let hit = reply(b"VALUE k 0 4\r\na\r\nb\r\nEND\r\n", &get("k")).await;
        assert_eq!(hit.unwrap(), Response::Value(Some(b"a\r\nb".to_vec())));
    }

    #[tokio::test]
    async fn server_errors_are_not_malformed() {
        let err = reply(b"SERVER_ERROR out of memory\r\n", &get("k")).await;
        assert!(matches!(err, Err(ReadError::Server(message)) if message.contains("out of memory")));
    }

    #[tokio::test]
    async fn wrong_reply_kind_is_malformed() {
        let err = reply(b"STORED\r\n", &get("k")).await;
        assert!(matches!(err, Err(ReadError::Malformed(_))));

        let err = reply(b"VALUE other 0 1\r\nx\r\nEND\r\n", &get("k")).await;
        assert!(matches!(err, Err(ReadError::Malformed(_))));
    }

    #[tokio::test]
    async fn oversized_value_length_is_malformed() {
        let huge = reply(b"VALUE k 0 18446744073709551615\r\n", &get("k")).await;
        assert!(matches!(huge, Err(ReadError::Malformed(message)) if message.contains("limit")));

        let large = reply(b"VALUE k 0 1099511627776\r\n", &get("k")).await;
        assert!(matches!(large, Err(ReadError::Malformed(_))));

        let mut reader = tokio::io::BufReader::new(&b"VALUE k 0 5\r\nhello\r\nEND\r\n"[..]);
        let capped = read_response(&mut reader, &get("k"), 4).await;
        assert!(matches!(capped, Err(ReadError::Malformed(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_eof() {
        assert!(matches!(reply(b"", &get("k")).await, Err(ReadError::Eof)));
    }

    #[test]
    fn keys_are_validated() {
        assert!(validate_key("user:42", 250).is_ok());
        assert!(validate_key("", 250).is_err());
        assert!(validate_key("has space", 250).is_err());
        assert!(validate_key("tab\there", 250).is_err());
        assert!(validate_key(&"x".repeat(251), 250).is_err());
    }
}
