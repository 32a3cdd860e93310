//! Censoring of secret byte sequences in log output.
//!
//! The [`Censorer`] holds the set of currently loaded secret values and
//! rewrites any byte sequence passing through it, replacing each occurrence
//! of a secret with a `*` run of equal length so positional information in
//! the surrounding text is preserved without revealing the secret.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing_subscriber::fmt::MakeWriter;

/// Shared set of active secret byte sequences.
///
/// The set is rebuilt wholesale on every secret update; refreshing with the
/// same contents is idempotent. Longer secrets are masked first so a secret
/// embedded in another is never partially revealed.
#[derive(Debug, Clone, Default)]
pub struct Censorer {
    secrets: Arc<RwLock<Vec<Vec<u8>>>>,
}

impl Censorer {
    /// Create an empty censorer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active secret set with the given values.
    ///
    /// Empty entries are dropped; duplicates collapse to one occurrence.
    pub fn refresh<'a>(&self, values: impl IntoIterator<Item = &'a [u8]>) {
        let mut next: Vec<Vec<u8>> = values
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(<[u8]>::to_vec)
            .collect();
        next.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        next.dedup();
        *self.secrets.write() = next;
    }

    /// Rewrite `content` with every registered secret masked.
    pub fn censor(&self, content: &[u8]) -> Vec<u8> {
        let mut out = content.to_vec();
        let secrets = self.secrets.read();
        for secret in secrets.iter() {
            mask_in_place(&mut out, secret);
        }
        out
    }

    /// As [`Censorer::censor`] for text, replacing any byte sequence the mask
    /// broke mid-character with the Unicode replacement character.
    pub fn censor_str(&self, content: &str) -> String {
        String::from_utf8_lossy(&self.censor(content.as_bytes())).into_owned()
    }

    /// Number of registered secrets. Used by tests and health reporting.
    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    /// Whether no secrets are registered.
    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

/// Overwrite each occurrence of `needle` in `buf` with `*` bytes.
fn mask_in_place(buf: &mut [u8], needle: &[u8]) {
    if needle.is_empty() || needle.len() > buf.len() {
        return;
    }
    let mut i = 0;
    while i + needle.len() <= buf.len() {
        if &buf[i..i + needle.len()] == needle {
            buf[i..i + needle.len()].fill(b'*');
            i += needle.len();
        } else {
            i += 1;
        }
    }
}

//─────────────────────────────
//  Tracing integration
//─────────────────────────────

/// Writer that censors secrets on the fly before delegating to `inner`.
pub struct CensoringWriter<W> {
    censorer: Censorer,
    inner: W,
}

impl<W> CensoringWriter<W> {
    /// Wrap `inner` so everything written through it is censored.
    pub fn new(censorer: Censorer, inner: W) -> Self {
        Self { censorer, inner }
    }
}

impl<W: Write> Write for CensoringWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let censored = self.censorer.censor(buf);
        self.inner.write_all(&censored)?;
        // Report the uncensored length; the mask preserves it anyway.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] adapter so a `tracing-subscriber` fmt layer censors every
/// log line it emits.
///
/// ```no_run
/// use bosun_secrets::{Censorer, CensoringMakeWriter};
/// use tracing_subscriber::fmt;
///
/// let censorer = Censorer::new();
/// fmt()
///     .with_writer(CensoringMakeWriter::new(censorer, std::io::stderr))
///     .init();
/// ```
pub struct CensoringMakeWriter<M> {
    censorer: Censorer,
    inner: M,
}

impl<M> CensoringMakeWriter<M> {
    /// Wrap a [`MakeWriter`] with censoring.
    pub fn new(censorer: Censorer, inner: M) -> Self {
        Self { censorer, inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for CensoringMakeWriter<M> {
    type Writer = CensoringWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        CensoringWriter::new(self.censorer.clone(), self.inner.make_writer())
    }
}
