//! ClamAV `.cvd` container header.
//!
//! A CVD file starts with a 512-byte ASCII header padded with spaces:
//!
//! ```text
//! ClamAV-VDB:<build time>:<version>:<signatures>:<flevel>:<md5>:<dsig>:<builder>:<stime>
//! ```
//!
//! The MD5 covers everything after the header.  The digital signature is
//! carried along but not checked.

use std::path::Path;

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::AsyncReadExt;

pub const CVD_HEADER_LEN: usize = 512;
const MAGIC: &str = "ClamAV-VDB";

#[derive(Debug, Error)]
pub enum CvdError {
    #[error("file is shorter than the {CVD_HEADER_LEN}-byte header")]
    TooShort,
    #[error("header does not start with {MAGIC}")]
    BadMagic,
    #[error("header is missing the {0} field")]
    MissingField(&'static str),
    #[error("header field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("body checksum mismatch: header says {expected}, body hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("header does not fit in {CVD_HEADER_LEN} bytes")]
    HeaderOverflow,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvdHeader {
    pub build_time: String,
    pub version: u64,
    pub signatures: u64,
    pub functionality_level: u32,
    pub md5: String,
    pub digital_signature: String,
    pub builder: String,
    pub build_timestamp: Option<u64>,
}

impl CvdHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, CvdError> {
        if raw.len() < CVD_HEADER_LEN {
            return Err(CvdError::TooShort);
        }
        let text = String::from_utf8_lossy(&raw[..CVD_HEADER_LEN]);
        let text = text.trim_end_matches([' ', '\0', '\n', '\r']);
        let mut fields = text.split(':');
        if fields.next() != Some(MAGIC) {
            return Err(CvdError::BadMagic);
        }

        let mut next = |field: &'static str| fields.next().ok_or(CvdError::MissingField(field));
        let build_time = next("build time")?.to_string();
        let version = number("version", next("version")?)?;
        let signatures = number("signatures", next("signatures")?)?;
        let functionality_level = number("functionality level", next("functionality level")?)?;
        let md5 = next("md5")?.to_ascii_lowercase();
        let digital_signature = next("digital signature")?.to_string();
        let builder = next("builder")?.to_string();
        let build_timestamp = match fields.next() {
            Some(raw) if !raw.trim().is_empty() => Some(number("build timestamp", raw)?),
            _ => None,
        };

        Ok(Self {
            build_time,
            version,
            signatures,
            functionality_level,
            md5,
            digital_signature,
            builder,
            build_timestamp,
        })
    }

    /// Renders the header padded to [`CVD_HEADER_LEN`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CvdError> {
        let mut text = format!(
            "{MAGIC}:{}:{}:{}:{}:{}:{}:{}",
            self.build_time,
            self.version,
            self.signatures,
            self.functionality_level,
            self.md5,
            self.digital_signature,
            self.builder
        );
        if let Some(stime) = self.build_timestamp {
            text.push_str(&format!(":{stime}"));
        }
        if text.len() > CVD_HEADER_LEN {
            return Err(CvdError::HeaderOverflow);
        }
        let mut bytes = text.into_bytes();
        bytes.resize(CVD_HEADER_LEN, b' ');
        Ok(bytes)
    }
}

fn number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, CvdError> {
    value.trim().parse().map_err(|_| CvdError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Incremental verifier fed with the file as it streams in.
pub struct CvdDigest {
    header: Vec<u8>,
    body: Md5,
}

impl Default for CvdDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl CvdDigest {
    pub fn new() -> Self {
        Self {
            header: Vec::with_capacity(CVD_HEADER_LEN),
            body: Md5::new(),
        }
    }

    pub fn update(&mut self, mut chunk: &[u8]) {
        if self.header.len() < CVD_HEADER_LEN {
            let take = (CVD_HEADER_LEN - self.header.len()).min(chunk.len());
            self.header.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }
        self.body.update(chunk);
    }

    /// Parses the header and checks the body digest against it.
    pub fn finish(self) -> Result<CvdHeader, CvdError> {
        let header = CvdHeader::parse(&self.header)?;
        let actual = hex::encode(self.body.finalize());
        if actual != header.md5 {
            return Err(CvdError::ChecksumMismatch {
                expected: header.md5,
                actual,
            });
        }
        Ok(header)
    }
}

/// Reads and verifies a complete `.cvd` file from disk.
pub async fn verify_file(path: &Path) -> Result<CvdHeader, CvdError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = CvdDigest::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    digest.finish()
}

/// Builds a well-formed `.cvd` image around `body`.  Used by tooling and
/// tests that need to stand in for the upstream feed.
pub fn build_cvd(version: u64, body: &[u8]) -> Result<Vec<u8>, CvdError> {
    let header = CvdHeader {
        build_time: "19 Oct 2026 08-00 +0000".into(),
        version,
        signatures: body.len() as u64,
        functionality_level: 90,
        md5: hex::encode(Md5::digest(body)),
        digital_signature: "unsigned".into(),
        builder: "sigmirror".into(),
        build_timestamp: Some(1_792_396_800),
    };
    let mut bytes = header.encode()?;
    bytes.extend_from_slice(body);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_header() {
        let mut raw = b"ClamAV-VDB:16 Mar 2016 23-17 +0000:57:4218790:60:06386F34A16EBEEA2733AB037F0536BE:dsig:sven:1458170220".to_vec();
        raw.resize(CVD_HEADER_LEN, b' ');
        let header = CvdHeader::parse(&raw).unwrap();
        assert_eq!(header.version, 57);
        assert_eq!(header.signatures, 4_218_790);
        assert_eq!(header.functionality_level, 60);
        assert_eq!(header.md5, "06386f34a16ebeea2733ab037f0536be");
        assert_eq!(header.builder, "sven");
        assert_eq!(header.build_timestamp, Some(1_458_170_220));
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(CvdHeader::parse(b"short"), Err(CvdError::TooShort)));

        let mut raw = b"NotClamAV:x".to_vec();
        raw.resize(CVD_HEADER_LEN, b' ');
        assert!(matches!(CvdHeader::parse(&raw), Err(CvdError::BadMagic)));

        let mut raw = b"ClamAV-VDB:time:abc:1:1:md5:d:b".to_vec();
        raw.resize(CVD_HEADER_LEN, b' ');
        assert!(matches!(
            CvdHeader::parse(&raw),
            Err(CvdError::InvalidNumber { field: "version", .. })
        ));

        let mut raw = b"ClamAV-VDB:time:5".to_vec();
        raw.resize(CVD_HEADER_LEN, b' ');
        assert!(matches!(CvdHeader::parse(&raw), Err(CvdError::MissingField(_))));
    }

    #[test]
    fn digest_accepts_split_chunks() {
        let image = build_cvd(42, b"signature body bytes").unwrap();
        let mut digest = CvdDigest::new();
        for chunk in image.chunks(7) {
            digest.update(chunk);
        }
        assert_eq!(digest.finish().unwrap().version, 42);
    }

    #[test]
    fn digest_detects_tampering() {
        let mut image = build_cvd(42, b"signature body bytes").unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xff;
        let mut digest = CvdDigest::new();
        digest.update(&image);
        assert!(matches!(digest.finish(), Err(CvdError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn verifies_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.cvd");
        tokio::fs::write(&path, build_cvd(58, &[7u8; 100_000]).unwrap()).await.unwrap();
        assert_eq!(verify_file(&path).await.unwrap().version, 58);
    }

    #[test]
    fn oversized_builder_does_not_fit_header() {
        let header = CvdHeader {
            build_time: "now".into(),
            version: 1,
            signatures: 0,
            functionality_level: 90,
            md5: String::new(),
            digital_signature: String::new(),
            builder: "x".repeat(CVD_HEADER_LEN),
            build_timestamp: None,
        };
        assert!(matches!(header.encode(), Err(CvdError::HeaderOverflow)));
    }
}
