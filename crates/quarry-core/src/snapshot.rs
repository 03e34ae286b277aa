//! Backup and restore framing.
//!
//! Components that hold durable state implement [`Snapshotable`] and
//! [`Restorable`]. A [`SnapshotComposite`] stitches several of them into a
//! single MIME-multipart stream: each part carries one `snapshot-id` header
//! naming the component, and its body is the component's opaque snapshot.
//!
//! ```text
//! --quarry-backup\r\n
//! snapshot-id: documents\r\n
//! \r\n
//! <documents snapshot>\r\n
//! --quarry-backup\r\n
//! snapshot-id: index\r\n
//! \r\n
//! <nested multipart stream with its own boundary>\r\n
//! --quarry-backup--\r\n
//! ```
//!
//! Restore routes parts by id, never by position. Parts with an unknown id
//! are logged and skipped so older binaries can read newer backups.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
};
use tracing::{debug, warn};

/// Header naming the component a part belongs to.
pub const SNAPSHOT_ID_HEADER: &str = "snapshot-id";

/// Writes a component's durable state to a byte stream.
#[async_trait]
pub trait Snapshotable: Send + Sync {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()>;
}

/// Replaces a component's durable state from a byte stream.
#[async_trait]
pub trait Restorable: Send + Sync {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()>;
}

/// Anything that can both produce and consume snapshots.
pub trait SnapshotParticipant: Snapshotable + Restorable {}

impl<T: Snapshotable + Restorable + ?Sized> SnapshotParticipant for T {}

/// Writes one multipart stream with a part per `(id, participant)`.
pub async fn write_multipart(
    w: &mut (dyn AsyncWrite + Unpin + Send),
    boundary: &str,
    parts: &[(&str, &dyn SnapshotParticipant)],
) -> Result<()> {
    for (id, part) in parts {
        debug!(boundary, snapshot_id = %id, "writing snapshot part");
        let header = format!("--{}\r\n{}: {}\r\n\r\n", boundary, SNAPSHOT_ID_HEADER, id);
        w.write_all(header.as_bytes()).await?;
        part.generate_snapshot(w)
            .await
            .with_context(|| format!("generating snapshot part '{}'", id))?;
        w.write_all(b"\r\n").await?;
    }
    w.write_all(format!("--{}--\r\n", boundary).as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Bytes in flight between the multipart reader and a part's restorer.
const PART_BUFFER: usize = 64 * 1024;

/// Reads a multipart stream and hands each part body to the participant
/// returned by `route` for its `snapshot-id`.
///
/// Part bodies are streamed: the restorer reads from a bounded pipe fed
/// line by line from `r`, so no part is ever held in memory whole.
pub async fn read_multipart<'a, F>(
    r: &mut (dyn AsyncRead + Unpin + Send),
    boundary: &str,
    route: F,
) -> Result<()>
where
    F: Fn(&str) -> Option<&'a dyn SnapshotParticipant> + Send + Sync,
{
    let delimiter = format!("--{}", boundary);
    let close = format!("--{}--", boundary);
    let mut reader = BufReader::new(r);
    let mut line: Vec<u8> = Vec::new();

    loop {
        next_line(&mut reader, &mut line, &close).await?;
        match boundary_marker(&line, &delimiter, &close) {
            Some(Marker::Next) => break,
            Some(Marker::Close) => return Ok(()),
            None => {}
        }
    }

    loop {
        let mut part_id: Option<String> = None;
        loop {
            next_line(&mut reader, &mut line, &close).await?;
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }
            if let Some((name, value)) = text.split_once(':') {
                if name.trim().eq_ignore_ascii_case(SNAPSHOT_ID_HEADER) {
                    part_id = Some(value.trim().to_string());
                }
            }
        }

        let marker = restore_part(&mut reader, part_id, &delimiter, &close, &route).await?;
        if let Marker::Close = marker {
            return Ok(());
        }
    }
}

async fn next_line<R>(reader: &mut R, line: &mut Vec<u8>, close: &str) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    line.clear();
    if reader.read_until(b'\n', line).await? == 0 {
        bail!("snapshot stream ended before closing boundary '{}'", close);
    }
    Ok(())
}

enum Marker {
    Next,
    Close,
}

fn boundary_marker(line: &[u8], delimiter: &str, close: &str) -> Option<Marker> {
    let text = std::str::from_utf8(line).ok()?;
    let text = text.trim_end_matches(['\r', '\n']).trim_end_matches([' ', '\t']);
    if text == close {
        Some(Marker::Close)
    } else if text == delimiter {
        Some(Marker::Next)
    } else {
        None
    }
}

/// Streams one part body to its participant, or discards it when the part
/// is unnamed or unknown. Returns the boundary that ended the part.
async fn restore_part<'a, R, F>(
    reader: &mut R,
    id: Option<String>,
    delimiter: &str,
    close: &str,
    route: &F,
) -> Result<Marker>
where
    R: AsyncBufRead + Unpin + Send + ?Sized,
    F: Fn(&str) -> Option<&'a dyn SnapshotParticipant>,
{
    let target = match id {
        Some(id) => match route(&id) {
            Some(part) => Some((id, part)),
            None => {
                warn!(snapshot_id = %id, "unknown snapshot part, skipping");
                None
            }
        },
        None => {
            warn!("snapshot part without {} header, skipping", SNAPSHOT_ID_HEADER);
            None
        }
    };
    let Some((id, part)) = target else {
        return pump_part(reader, delimiter, close, None).await;
    };

    debug!(snapshot_id = %id, "restoring snapshot part");
    let (tx, rx) = tokio::io::duplex(PART_BUFFER);
    let id = &id;
    let restore = async move {
        // Owning the read half here closes the pipe as soon as the
        // restorer returns, whether or not it read everything.
        let mut rx = rx;
        part.restore_snapshot(&mut rx)
            .await
            .with_context(|| format!("restoring snapshot part '{}'", id))
    };
    let (marker, ()) = tokio::try_join!(pump_part(reader, delimiter, close, Some(tx)), restore)?;
    Ok(marker)
}

/// Copies body lines into `sink` up to the next boundary. The CRLF before
/// a boundary belongs to the framing, so a trailing CRLF is held back until
/// the following line shows whether a boundary comes next.
async fn pump_part<R>(
    reader: &mut R,
    delimiter: &str,
    close: &str,
    mut sink: Option<DuplexStream>,
) -> Result<Marker>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line: Vec<u8> = Vec::new();
    let mut held_crlf = false;
    loop {
        next_line(reader, &mut line, close).await?;
        if held_crlf {
            if let Some(marker) = boundary_marker(&line, delimiter, close) {
                if let Some(mut w) = sink.take() {
                    // The restorer may already be gone.
                    let _ = w.shutdown().await;
                }
                return Ok(marker);
            }
            feed(&mut sink, b"\r\n").await;
        }
        held_crlf = line.ends_with(b"\r\n");
        let end = if held_crlf { line.len() - 2 } else { line.len() };
        feed(&mut sink, &line[..end]).await;
    }
}

/// Writes to the restorer; once it stops reading, the rest is discarded.
async fn feed(sink: &mut Option<DuplexStream>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let failed = match sink.as_mut() {
        Some(w) => w.write_all(bytes).await.is_err(),
        None => false,
    };
    if failed {
        *sink = None;
    }
}

/// Named participants written as one multipart stream.
///
/// A composite is itself a participant, so composites nest as long as each
/// level uses a distinct boundary.
pub struct SnapshotComposite {
    boundary: String,
    parts: Vec<(String, Arc<dyn SnapshotParticipant>)>,
}

impl SnapshotComposite {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    /// Appends a part; parts are written in the order they are added.
    pub fn with_part(mut self, id: impl Into<String>, part: Arc<dyn SnapshotParticipant>) -> Self {
        self.parts.push((id.into(), part));
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn part_ids(&self) -> Vec<&str> {
        self.parts.iter().map(|(id, _)| id.as_str()).collect()
    }
}

#[async_trait]
impl Snapshotable for SnapshotComposite {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let parts: Vec<(&str, &dyn SnapshotParticipant)> = self
            .parts
            .iter()
            .map(|(id, p)| (id.as_str(), p.as_ref()))
            .collect();
        write_multipart(w, &self.boundary, &parts).await
    }
}

#[async_trait]
impl Restorable for SnapshotComposite {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        read_multipart(r, &self.boundary, |id| {
            self.parts
                .iter()
                .find(|(pid, _)| pid == id)
                .map(|(_, p)| p.as_ref())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Emits fixed bytes and records every restore it receives.
    pub(crate) struct Recorder {
        pub data: Vec<u8>,
        pub restored: Mutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        pub(crate) fn new(data: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                restored: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn restores(&self) -> Vec<Vec<u8>> {
            self.restored.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Snapshotable for Recorder {
        async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
            w.write_all(&self.data).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl Restorable for Recorder {
        async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf).await?;
            self.restored.lock().unwrap().push(buf);
            Ok(())
        }
    }

    #[tokio::test]
    async fn nested_composite_round_trip() {
        let d1 = Recorder::new(b"first part\r\nwith CRLF\r\n");
        let d2 = Recorder::new(&[0u8, 159, 146, 150, b'\n', b'-', b'-']);
        let d31 = Recorder::new(b"line one\n--outer-ish\r\n--inner--x");
        let d32 = Recorder::new(b"");
        let d3 = SnapshotComposite::new("inner")
            .with_part("d3.1", d31.clone())
            .with_part("d3.2", d32.clone());
        let outer = SnapshotComposite::new("outer")
            .with_part("d1", d1.clone())
            .with_part("d2", d2.clone())
            .with_part("d3", Arc::new(d3));

        let mut buf: Vec<u8> = Vec::new();
        outer.generate_snapshot(&mut buf).await.unwrap();
        assert!(buf.ends_with(b"--outer--\r\n"));

        let mut reader = buf.as_slice();
        outer.restore_snapshot(&mut reader).await.unwrap();

        for r in [&d1, &d2, &d31, &d32] {
            assert_eq!(r.restores(), vec![r.data.clone()]);
        }
    }

    #[tokio::test]
    async fn unknown_parts_are_skipped() {
        let known = Recorder::new(b"kept");
        let stray = Recorder::new(b"ignored");
        let writer = SnapshotComposite::new("b")
            .with_part("stray", stray)
            .with_part("known", known.clone());
        let mut buf: Vec<u8> = Vec::new();
        writer.generate_snapshot(&mut buf).await.unwrap();

        let target = Recorder::new(b"");
        let reader = SnapshotComposite::new("b").with_part("known", target.clone());
        reader.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(target.restores(), vec![b"kept".to_vec()]);
    }

    #[tokio::test]
    async fn parts_route_by_id_not_order() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"preamble is ignored\r\n");
        raw.extend_from_slice(b"--x\r\nsnapshot-id: two\r\n\r\nsecond\r\n");
        raw.extend_from_slice(b"--x\r\nSnapshot-ID: one\r\n\r\nfirst\r\n--x--\r\n");

        let one = Recorder::new(b"");
        let two = Recorder::new(b"");
        let composite = SnapshotComposite::new("x")
            .with_part("one", one.clone())
            .with_part("two", two.clone());
        composite.restore_snapshot(&mut raw.as_slice()).await.unwrap();
        assert_eq!(one.restores(), vec![b"first".to_vec()]);
        assert_eq!(two.restores(), vec![b"second".to_vec()]);
    }

    #[tokio::test]
    async fn parts_larger_than_the_pipe_round_trip() {
        let big: Vec<u8> = (0..300_000u32)
            .flat_map(|i| if i % 97 == 0 { b"\r\n".to_vec() } else { vec![b'a' + (i % 26) as u8] })
            .collect();
        let first = Recorder::new(&big);
        let second = Recorder::new(b"tail");
        let composite = SnapshotComposite::new("big")
            .with_part("first", first.clone())
            .with_part("second", second.clone());
        let mut buf: Vec<u8> = Vec::new();
        composite.generate_snapshot(&mut buf).await.unwrap();

        composite.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(first.restores(), vec![big]);
        assert_eq!(second.restores(), vec![b"tail".to_vec()]);
    }

    /// Reports its first line as soon as it arrives, then drains the rest.
    struct FirstLine {
        seen: Mutex<Option<tokio::sync::oneshot::Sender<String>>>,
    }

    #[async_trait]
    impl Snapshotable for FirstLine {
        async fn generate_snapshot(&self, _w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Restorable for FirstLine {
        async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
            let mut reader = BufReader::new(r);
            let mut first = String::new();
            reader.read_line(&mut first).await?;
            if let Some(tx) = self.seen.lock().unwrap().take() {
                let _ = tx.send(first);
            }
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn part_bodies_stream_before_the_part_ends() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let part = Arc::new(FirstLine {
            seen: Mutex::new(Some(seen_tx)),
        });
        let composite = Arc::new(SnapshotComposite::new("s").with_part("p", part));

        let (mut input, mut output) = tokio::io::duplex(1024);
        let restore = tokio::spawn({
            let composite = composite.clone();
            async move { composite.restore_snapshot(&mut output).await }
        });

        input
            .write_all(b"--s\r\nsnapshot-id: p\r\n\r\nfirst line\nsecond")
            .await
            .unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), seen_rx)
            .await
            .expect("first line was not streamed")
            .unwrap();
        assert_eq!(first, "first line\n");

        input.write_all(b" line\r\n--s--\r\n").await.unwrap();
        restore.await.unwrap().unwrap();
    }

    /// Reads a few bytes and ignores the rest.
    struct Peek;

    #[async_trait]
    impl Snapshotable for Peek {
        async fn generate_snapshot(&self, _w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Restorable for Peek {
        async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
            let mut head = [0u8; 4];
            r.read_exact(&mut head).await?;
            assert_eq!(&head, b"xyz\n");
            Ok(())
        }
    }

    #[tokio::test]
    async fn restorer_may_stop_reading_early() {
        let part = Arc::new(Peek);
        let after = Recorder::new(b"");
        let mut raw = b"--e\r\nsnapshot-id: early\r\n\r\n".to_vec();
        raw.extend((0..200_000).flat_map(|_| *b"xyz\n"));
        raw.extend_from_slice(b"\r\n--e\r\nsnapshot-id: after\r\n\r\nlast\r\n--e--\r\n");
        let composite = SnapshotComposite::new("e")
            .with_part("early", part)
            .with_part("after", after.clone());
        composite.restore_snapshot(&mut raw.as_slice()).await.unwrap();
        assert_eq!(after.restores(), vec![b"last".to_vec()]);
    }

    #[tokio::test]
    async fn truncated_stream_fails() {
        let raw = b"--x\r\nsnapshot-id: one\r\n\r\npartial".to_vec();
        let one = Recorder::new(b"");
        let composite = SnapshotComposite::new("x").with_part("one", one.clone());
        assert!(composite.restore_snapshot(&mut raw.as_slice()).await.is_err());
        assert!(one.restores().is_empty());
    }
}
