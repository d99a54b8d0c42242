//! Realizing a layer: fetch, decompress, verify, and materialize one file.
//!
//! The destination is opened with exclusive create before the network is
//! touched and is owned by a [`PendingFile`] guard that removes it on every
//! path except the one that commits it.
//!
//! The response body is hashed as it is read, so the checksum covers the
//! blob exactly as served, while the file receives the decompressed tar
//! stream.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::bufread::MultiGzDecoder;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Response, StatusCode, Url, Version};
use sha2::digest::DynDigest;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

use crate::arena::{Arena, Realized};
use crate::compression::{detect_compression, Compression, MediaType, SNIFF_LEN};
use crate::digest::Digest;
use crate::error::FetchError;
use crate::layer::Layer;

/// Bytes of an error response kept for diagnostics.
const BODY_EXCERPT_LEN: usize = 256;

const COPY_BUF_LEN: usize = 64 * 1024;

/// Owned copy of what a realization needs from a layer.
///
/// The realization can outlive the caller that started it, so it cannot
/// borrow the caller's descriptor.
#[derive(Debug, Clone)]
pub(crate) struct LayerRequest {
    pub(crate) key: String,
    digest: Digest,
    uri: String,
    headers: HeaderMap,
}

impl LayerRequest {
    pub(crate) fn from_layer<L: Layer + ?Sized>(layer: &L) -> Self {
        Self {
            key: layer.digest().to_string(),
            digest: layer.digest().clone(),
            uri: layer.uri().to_string(),
            headers: layer.headers().clone(),
        }
    }

    fn validate(&self) -> Result<Url, FetchError> {
        if self.uri.is_empty() {
            return Err(FetchError::EmptyUri {
                digest: self.key.clone(),
            });
        }
        let url = Url::parse(&self.uri).map_err(|err| FetchError::InvalidUri {
            uri: self.uri.clone(),
            reason: err.to_string(),
        })?;
        if self.digest.checksum().is_empty() {
            return Err(FetchError::EmptyDigest);
        }
        Ok(url)
    }
}

impl Arena {
    /// The work run inside the dedup group for one digest.
    pub(crate) async fn realize(
        self: Arc<Self>,
        request: LayerRequest,
    ) -> Result<Realized, FetchError> {
        debug!(
            arena = %self.root().display(),
            digest = %request.key,
            uri = %request.uri,
            "layer fetch start"
        );

        let url = request.validate()?;
        let (path, generation) = self.register(&request.key);

        match self.fetch_into(&request, url, &path).await {
            Ok(()) => {
                debug!(digest = %request.key, path = %path.display(), "layer fetch ok");
                Ok(Realized { path, generation })
            }
            Err(err) => {
                self.abandon(&request.key, generation);
                debug!(digest = %request.key, error = %err, "layer fetch failed");
                Err(err)
            }
        }
    }

    async fn fetch_into(
        &self,
        request: &LayerRequest,
        url: Url,
        path: &Path,
    ) -> Result<(), FetchError> {
        // Open the target before hitting the network. It can't be
        // preallocated because of decompression.
        let file = PendingFile::create(path)?;

        let response = self
            .client
            .get(url)
            .version(Version::HTTP_11)
            .headers(request.headers.clone())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(unexpected_status(response).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        debug!(digest = %request.key, content_type = %content_type, "reported content-type");

        let declared = match MediaType::classify(&content_type) {
            MediaType::Known(compression) => Some(compression),
            MediaType::Sniff => None,
            MediaType::Unknown => return Err(FetchError::UnknownContentType(content_type)),
        };

        let body = SyncIoBridge::new(StreamReader::new(Box::pin(
            response.bytes_stream().map_err(io::Error::other),
        )));
        let digest = request.digest.clone();
        let file =
            tokio::task::spawn_blocking(move || unpack(body, declared, file, &digest)).await??;
        file.commit();
        Ok(())
    }
}

/// Build the error for a non-200 response, keeping the start of the body.
///
/// Especially for 4xx responses the body often says what went wrong; it is
/// capped so it can't flood the log.
async fn unexpected_status(mut response: Response) -> FetchError {
    let status = response.status();
    let mut excerpt = Vec::with_capacity(BODY_EXCERPT_LEN);
    let body_start = loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (BODY_EXCERPT_LEN - excerpt.len()).min(chunk.len());
                excerpt.extend_from_slice(&chunk[..take]);
                if excerpt.len() == BODY_EXCERPT_LEN {
                    break Some(String::from_utf8_lossy(&excerpt).into_owned());
                }
            }
            Ok(None) => break Some(String::from_utf8_lossy(&excerpt).into_owned()),
            Err(_) => break None,
        }
    };
    FetchError::UnexpectedStatus { status, body_start }
}

/// Decompress `body` into `file` and verify it against `digest`.
///
/// `declared` is the compression named by the content-type; `None` means
/// sniff it from the first bytes.
fn unpack<R: Read>(
    body: R,
    declared: Option<Compression>,
    mut file: PendingFile,
    digest: &Digest,
) -> Result<PendingFile, FetchError> {
    let mut body = HashingReader::new(body, digest.algorithm().hasher());
    let prefix = read_prefix(&mut body).map_err(FetchError::Body)?;

    let compression = match declared {
        Some(compression) => compression,
        None => {
            let guessed = detect_compression(&prefix);
            debug!(digest = %digest, format = %guessed, "guessed compression");
            guessed
        }
    };

    let written = {
        let stream = BufReader::new(io::Cursor::new(prefix).chain(&mut body));
        let mut decoder = Decoder::new(compression, stream)?;
        let mut writer = BufWriter::new(file.as_file_mut());
        let written = copy_layer(&mut decoder, &mut writer, compression)?;
        writer.flush()?;
        written
    };
    // Anything the decoder left unread still counts toward the checksum.
    io::copy(&mut body, &mut io::sink()).map_err(FetchError::Body)?;
    file.as_file_mut().sync_all()?;
    debug!(digest = %digest, size = written, "wrote file");

    let actual = body.finish();
    if &actual[..] != digest.checksum() {
        return Err(FetchError::VerificationFailed {
            expected: digest.hex(),
            actual: hex::encode(actual),
        });
    }
    Ok(file)
}

fn read_prefix(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    reader.take(SNIFF_LEN as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}

fn copy_layer(
    reader: &mut impl Read,
    writer: &mut impl Write,
    compression: Compression,
) -> Result<u64, FetchError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_error(compression, err)),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn read_error(compression: Compression, source: io::Error) -> FetchError {
    match compression {
        Compression::None => FetchError::Body(source),
        compression => FetchError::Decompress {
            compression,
            source,
        },
    }
}

/// Tees everything read through it into a hasher.
struct HashingReader<R> {
    inner: R,
    hasher: Box<dyn DynDigest + Send>,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R, hasher: Box<dyn DynDigest + Send>) -> Self {
        Self { inner, hasher }
    }

    fn finish(self) -> Box<[u8]> {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

enum Decoder<R: BufRead> {
    Plain(R),
    Gzip(MultiGzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, R>),
}

impl<R: BufRead> Decoder<R> {
    fn new(compression: Compression, reader: R) -> Result<Self, FetchError> {
        Ok(match compression {
            Compression::None => Decoder::Plain(reader),
            Compression::Gzip => Decoder::Gzip(MultiGzDecoder::new(reader)),
            Compression::Zstd => Decoder::Zstd(
                zstd::stream::read::Decoder::with_buffer(reader)
                    .map_err(|source| read_error(compression, source))?,
            ),
        })
    }
}

impl<R: BufRead> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Plain(reader) => reader.read(buf),
            Decoder::Gzip(reader) => reader.read(buf),
            Decoder::Zstd(reader) => reader.read(buf),
        }
    }
}

/// A cache file being written.
///
/// Removed on drop unless [`PendingFile::commit`] was called.
#[derive(Debug)]
struct PendingFile {
    path: PathBuf,
    file: File,
    committed: bool,
}

impl PendingFile {
    /// Exclusively create `path`; an existing file means someone else is
    /// realizing the same digest outside the dedup group.
    fn create(path: &Path) -> Result<Self, FetchError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path).map_err(|source| FetchError::CreateFile {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            committed: false,
        })
    }

    fn as_file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.path.clone()
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "unable to remove unsuccessful layer fetch"
            );
        }
    }
}
