//! Typed wire primitives for the dispatcher protocol.
//!
//! A single byte stream carries length-prefixed, big-endian fields. Encoding
//! is synchronous into a byte buffer so that a packet's wire image can be
//! produced deterministically and in one piece; decoding is asynchronous from
//! any [`AsyncRead`] and consumes exactly the bytes the encoder produced.
//!
//! Supported shapes: `bool` (one byte), `i32`/`u32` (four bytes), `i64`/`u64`
//! (eight bytes), `bytes` (`u64` length + raw), `string` (UTF-8 as bytes),
//! `optional T` (presence `bool` + `T`), `list T` (`u64` count + elements).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for a single length-prefixed field.
///
/// Uploads travel as one `bytes` field, so the cap is generous; anything
/// beyond it is treated as stream corruption rather than data.
pub const MAX_FIELD_LEN: u64 = 1 << 30;

/// Errors raised while decoding wire fields.
///
/// An unexpected EOF surfaces as [`WireError::Io`] and is fatal for the
/// stream: there is no resynchronization point in the protocol.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying read failed or the stream ended mid-field.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A string field did not contain valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A length prefix exceeded [`MAX_FIELD_LEN`].
    #[error("field length {0} exceeds limit")]
    LengthOverflow(u64),
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) { buf.push(u8::from(v)); }

pub fn put_i32(buf: &mut Vec<u8>, v: i32) { buf.extend_from_slice(&v.to_be_bytes()); }

pub fn put_u32(buf: &mut Vec<u8>, v: u32) { buf.extend_from_slice(&v.to_be_bytes()); }

pub fn put_i64(buf: &mut Vec<u8>, v: i64) { buf.extend_from_slice(&v.to_be_bytes()); }

pub fn put_u64(buf: &mut Vec<u8>, v: u64) { buf.extend_from_slice(&v.to_be_bytes()); }

pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u64(buf, v.len() as u64);
    buf.extend_from_slice(v);
}

pub fn put_str(buf: &mut Vec<u8>, v: &str) { put_bytes(buf, v.as_bytes()); }

pub fn put_opt_bytes(buf: &mut Vec<u8>, v: Option<&[u8]>) {
    put_bool(buf, v.is_some());
    if let Some(v) = v {
        put_bytes(buf, v);
    }
}

pub fn put_opt_str(buf: &mut Vec<u8>, v: Option<&str>) {
    put_bool(buf, v.is_some());
    if let Some(v) = v {
        put_str(buf, v);
    }
}

pub fn put_list_str(buf: &mut Vec<u8>, v: &[String]) {
    put_u64(buf, v.len() as u64);
    for item in v {
        put_str(buf, item);
    }
}

/// Read a single presence/boolean byte; any nonzero byte reads as true.
///
/// # Errors
/// Returns an error when the stream ends.
pub async fn read_bool<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool, WireError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).await?;
    Ok(b[0] != 0)
}

pub async fn read_i32<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, WireError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).await?;
    Ok(i32::from_be_bytes(b))
}

pub async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, WireError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).await?;
    Ok(u32::from_be_bytes(b))
}

pub async fn read_i64<R: AsyncRead + Unpin>(r: &mut R) -> Result<i64, WireError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).await?;
    Ok(i64::from_be_bytes(b))
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, WireError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).await?;
    Ok(u64::from_be_bytes(b))
}

/// Read a length-prefixed byte field.
///
/// # Errors
/// Returns an error on EOF or when the prefix exceeds [`MAX_FIELD_LEN`].
pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, WireError> {
    let len = read_u64(r).await?;
    if len > MAX_FIELD_LEN {
        return Err(WireError::LengthOverflow(len));
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).await?;
    Ok(data)
}

/// Read a length-prefixed UTF-8 string field.
///
/// # Errors
/// Returns an error on EOF, oversized prefix, or invalid UTF-8.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, WireError> {
    Ok(String::from_utf8(read_bytes(r).await?)?)
}

pub async fn read_opt_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, WireError> {
    if read_bool(r).await? {
        Ok(Some(read_bytes(r).await?))
    } else {
        Ok(None)
    }
}

pub async fn read_opt_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<String>, WireError> {
    if read_bool(r).await? {
        Ok(Some(read_string(r).await?))
    } else {
        Ok(None)
    }
}

pub async fn read_list_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>, WireError> {
    let count = read_u64(r).await?;
    if count > MAX_FIELD_LEN {
        return Err(WireError::LengthOverflow(count));
    }
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(read_string(r).await?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[tokio::test]
    async fn scalar_round_trips_are_byte_exact() {
        let mut buf = Vec::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);
        put_i32(&mut buf, -7);
        put_u32(&mut buf, 0xDEAD_BEEF);
        put_i64(&mut buf, i64::MIN);
        put_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 1 + 1 + 4 + 4 + 8 + 8);

        let mut r = &buf[..];
        assert!(read_bool(&mut r).await.unwrap());
        assert!(!read_bool(&mut r).await.unwrap());
        assert_eq!(read_i32(&mut r).await.unwrap(), -7);
        assert_eq!(read_u32(&mut r).await.unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_i64(&mut r).await.unwrap(), i64::MIN);
        assert_eq!(read_u64(&mut r).await.unwrap(), u64::MAX);
        assert!(r.is_empty(), "decoder must consume exactly what was encoded");
    }

    #[tokio::test]
    async fn u32_uses_big_endian() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 2);
        assert_eq!(buf, [0x00, 0x00, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn optional_and_list_round_trip() {
        let mut buf = Vec::new();
        put_opt_str(&mut buf, None);
        put_opt_str(&mut buf, Some("héllo"));
        put_opt_bytes(&mut buf, Some(b"\x00\xff"));
        put_list_str(&mut buf, &["a".to_owned(), String::new(), "c".to_owned()]);

        let mut r = &buf[..];
        assert_eq!(read_opt_string(&mut r).await.unwrap(), None);
        assert_eq!(read_opt_string(&mut r).await.unwrap().as_deref(), Some("héllo"));
        assert_eq!(read_opt_bytes(&mut r).await.unwrap().as_deref(), Some(&b"\x00\xff"[..]));
        assert_eq!(
            read_list_string(&mut r).await.unwrap(),
            vec!["a".to_owned(), String::new(), "c".to_owned()]
        );
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let mut buf = Vec::new();
        put_str(&mut buf, "truncate me");
        buf.truncate(buf.len() - 1);
        let mut r = &buf[..];
        let err = read_string(&mut r).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[tokio::test]
    async fn absurd_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        put_u64(&mut buf, u64::MAX);
        let mut r = &buf[..];
        let err = read_bytes(&mut r).await.unwrap_err();
        assert!(matches!(err, WireError::LengthOverflow(_)));
    }

    proptest! {
        #[test]
        fn bytes_round_trip(v in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = Vec::new();
            put_bytes(&mut buf, &v);
            let got = block_on(async { read_bytes(&mut &buf[..]).await.unwrap() });
            prop_assert_eq!(got, v);
        }

        #[test]
        fn string_round_trip(v in "\\PC{0,64}") {
            let mut buf = Vec::new();
            put_str(&mut buf, &v);
            let got = block_on(async { read_string(&mut &buf[..]).await.unwrap() });
            prop_assert_eq!(got, v);
        }

        #[test]
        fn list_round_trip(v in proptest::collection::vec("[a-z/ -]{0,16}", 0..8)) {
            let mut buf = Vec::new();
            put_list_str(&mut buf, &v);
            let got = block_on(async { read_list_string(&mut &buf[..]).await.unwrap() });
            prop_assert_eq!(got, v);
        }
    }
}
