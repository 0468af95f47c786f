use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

use crate::{ByteRange, RangeBody};

const CRLF: &str = "\r\n";

/// Headers opening one part of a `multipart/byteranges` body.
pub(crate) fn part_head(
    boundary: &str,
    content_type: &str,
    range: &ByteRange,
    complete_length: u64,
) -> String {
    format!(
        "--{boundary}{CRLF}\
         Content-Type: {content_type}{CRLF}\
         Content-Range: {}{CRLF}\
         {CRLF}",
        range.content_range(complete_length),
    )
}

/// Closing delimiter of a `multipart/byteranges` body. Nothing follows it.
pub(crate) fn closing_delimiter(boundary: &str) -> String {
    format!("--{boundary}--")
}

/// Exact byte count of the multipart body [`MultipartStream`] produces for
/// the same arguments.
pub fn multipart_len(
    ranges: &[ByteRange],
    boundary: &str,
    content_type: &str,
    complete_length: u64,
) -> u64 {
    let parts: u64 = ranges
        .iter()
        .map(|range| {
            let head = part_head(boundary, content_type, range, complete_length).len() as u64;
            head + range.len() + CRLF.len() as u64
        })
        .sum();

    parts + closing_delimiter(boundary).len() as u64
}

/// Response body stream over one contiguous span of a [`RangeBody`].
/// Implements [`Stream`] and [`Body`].
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    length: u64,
    buffer_size: usize,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, start: u64, length: u64, buffer_size: usize) -> Self {
        RangedStream {
            state: StreamState::Seek { start },
            length,
            buffer_size,
            body,
        }
    }
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Done,
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Seek { start } = *this.state {
            match this.body.as_mut().start_seek(start) {
                Err(e) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Ok(()) => {
                    let remaining = *this.length;
                    *this.state = StreamState::Seeking { remaining };
                }
            }
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.body.as_mut().poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer(*this.buffer_size);
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            if *remaining == 0 {
                *this.state = StreamState::Done;
                return Poll::Ready(None);
            }

            match poll_read_chunk(this.body.as_mut(), cx, buffer, remaining, *this.buffer_size) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }

        Poll::Ready(None)
    }
}

/// `multipart/byteranges` response body stream for several byte ranges.
/// Implements [`Stream`] and [`Body`].
#[pin_project]
pub struct MultipartStream<B> {
    state: MultipartState,
    ranges: Vec<ByteRange>,
    current_range_index: usize,
    complete_length: u64,
    content_length: u64,
    boundary: String,
    content_type: String,
    buffer_size: usize,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> MultipartStream<B> {
    pub(crate) fn new(
        body: B,
        ranges: Vec<ByteRange>,
        boundary: String,
        content_type: String,
        buffer_size: usize,
    ) -> Self {
        let complete_length = body.byte_size();
        let content_length = multipart_len(&ranges, &boundary, &content_type, complete_length);
        MultipartStream {
            state: MultipartState::PartHead,
            ranges,
            current_range_index: 0,
            complete_length,
            content_length,
            boundary,
            content_type,
            buffer_size,
            body,
        }
    }
}

#[derive(Debug)]
enum MultipartState {
    PartHead,
    Seek { start: u64, remaining: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    PartTail,
    Closing,
    Finished,
}

impl<B: RangeBody> Body for MultipartStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.content_length)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
                  -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for MultipartStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match this.state {
                MultipartState::PartHead => {
                    let Some(range) = this.ranges.get(*this.current_range_index) else {
                        *this.state = MultipartState::Closing;
                        continue;
                    };

                    let head =
                        part_head(this.boundary, this.content_type, range, *this.complete_length);
                    *this.state =
                        MultipartState::Seek { start: range.from(), remaining: range.len() };
                    return Poll::Ready(Some(Ok(Bytes::from(head))));
                }

                MultipartState::Seek { start, remaining } => {
                    let remaining = *remaining;
                    match this.body.as_mut().start_seek(*start) {
                        Err(e) => {
                            *this.state = MultipartState::Finished;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Ok(()) => {
                            *this.state = MultipartState::Seeking { remaining };
                        }
                    }
                }

                MultipartState::Seeking { remaining } => {
                    match this.body.as_mut().poll_complete(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            *this.state = MultipartState::Finished;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Poll::Ready(Ok(())) => {
                            let buffer = allocate_buffer(*this.buffer_size);
                            *this.state = MultipartState::Reading { buffer, remaining: *remaining };
                        }
                    }
                }

                MultipartState::Reading { buffer, remaining } => {
                    if *remaining == 0 {
                        *this.state = MultipartState::PartTail;
                        continue;
                    }

                    let buffer_size = *this.buffer_size;
                    match poll_read_chunk(this.body.as_mut(), cx, buffer, remaining, buffer_size) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                        Poll::Ready(Err(e)) => {
                            *this.state = MultipartState::Finished;
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }

                MultipartState::PartTail => {
                    *this.current_range_index += 1;
                    *this.state = MultipartState::PartHead;
                    return Poll::Ready(Some(Ok(Bytes::from_static(CRLF.as_bytes()))));
                }

                MultipartState::Closing => {
                    let closing = closing_delimiter(this.boundary);
                    *this.state = MultipartState::Finished;
                    return Poll::Ready(Some(Ok(Bytes::from(closing))));
                }

                MultipartState::Finished => {
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Reads the next chunk of at most `remaining` bytes into `buffer`.
///
/// Running out of source bytes before `remaining` reaches zero is an error:
/// the declared `Content-Length` could no longer be honored.
fn poll_read_chunk<B: RangeBody>(
    body: Pin<&mut B>,
    cx: &mut Context<'_>,
    buffer: &mut BytesMut,
    remaining: &mut u64,
    buffer_size: usize,
) -> Poll<io::Result<Bytes>> {
    let uninit = buffer.spare_capacity_mut();

    // calculate max number of bytes to read in this iteration, the
    // smaller of the buffer size and the number of bytes remaining
    let nbytes = std::cmp::min(
        uninit.len(),
        usize::try_from(*remaining).unwrap_or(usize::MAX),
    );

    let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

    match body.poll_read(cx, &mut read_buf) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Ready(Ok(())) => {
            let n = read_buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("byte source ended with {remaining} bytes left to send"),
                )));
            }

            // SAFETY: poll_read has filled the buffer with `n`
            // additional bytes. `buffer.len` should always be
            // 0 here, but include it for rigorous correctness
            unsafe { buffer.set_len(buffer.len() + n); }

            // replace state buffer and take this one to return
            let chunk = mem::replace(buffer, allocate_buffer(buffer_size));

            // n <= remaining because of the cmp::min above
            *remaining -= n as u64;

            Poll::Ready(Ok(chunk.freeze()))
        }
    }
}

fn allocate_buffer(buffer_size: usize) -> BytesMut {
    BytesMut::with_capacity(buffer_size)
}

/// Body of a resumable response: nothing (304, 412, HEAD), a single span
/// (full or partial content), or a `multipart/byteranges` document.
///
/// The body owns the byte source; dropping the body at any point closes it.
#[pin_project(project = ResumingBodyProj)]
pub enum ResumingBody<B> {
    Empty,
    Ranged(#[pin] RangedStream<B>),
    Multipart(#[pin] MultipartStream<B>),
}

impl<B> std::fmt::Debug for ResumingBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumingBody::Empty => f.write_str("Empty"),
            ResumingBody::Ranged(stream) => f.debug_tuple("Ranged").field(&stream.length).finish(),
            ResumingBody::Multipart(stream) => f
                .debug_struct("Multipart")
                .field("ranges", &stream.ranges)
                .field("boundary", &stream.boundary)
                .finish(),
        }
    }
}

impl<B: RangeBody> Stream for ResumingBody<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        match self.project() {
            ResumingBodyProj::Empty => Poll::Ready(None),
            ResumingBodyProj::Ranged(stream) => stream.poll_next(cx),
            ResumingBodyProj::Multipart(stream) => stream.poll_next(cx),
        }
    }
}

impl<B: RangeBody> Body for ResumingBody<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        match self {
            ResumingBody::Empty => SizeHint::with_exact(0),
            ResumingBody::Ranged(stream) => Body::size_hint(stream),
            ResumingBody::Multipart(stream) => Body::size_hint(stream),
        }
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> ResumingBody<B> {
    /// Number of bytes this body will produce.
    pub fn content_length(&self) -> u64 {
        match self {
            ResumingBody::Empty => 0,
            ResumingBody::Ranged(stream) => stream.length,
            ResumingBody::Multipart(stream) => stream.content_length,
        }
    }

    /// Streams the body into `sink`, chunk by chunk.
    ///
    /// `cancel` is polled between chunks; once it completes no further
    /// writes are attempted and `Ok(())` is returned. The byte source is
    /// released before this returns, whatever the outcome.
    pub async fn write_to<W, C>(self, sink: &mut W, cancel: C) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        C: Future<Output = ()>,
    {
        let stream = self.take_until(cancel);
        pin_mut!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.inspect_err(|e| warn!(error = %e, "reading byte source failed"))?;
            sink.write_all(&chunk).await?;
        }

        if stream.is_stopped() {
            debug!("response write cancelled");
            return Ok(());
        }

        sink.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use futures::future;

    use super::*;
    use crate::{AsyncSeekStart, KnownSize};

    const CONTENT: &[u8] = b"0123456789abcdefghijklmnopgrstuvwxyzABCDEFGHIJKLMNOPGRSTUVWXYZ";

    fn source() -> KnownSize<Cursor<&'static [u8]>> {
        KnownSize::sized(Cursor::new(CONTENT), CONTENT.len() as u64)
    }

    async fn collect_stream(stream: impl Stream<Item = io::Result<Bytes>>) -> Vec<u8> {
        let mut out = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_ranged_stream() {
        let stream = RangedStream::new(source(), 10, 5, 64);
        assert_eq!(Some(5), Body::size_hint(&stream).exact());
        assert_eq!(b"abcde".to_vec(), collect_stream(stream).await);
    }

    #[tokio::test]
    async fn test_ranged_stream_small_buffer() {
        let stream = RangedStream::new(source(), 0, 62, 7);
        let chunks: Vec<_> = stream.map(|chunk| chunk.unwrap().len()).collect().await;
        assert_eq!(9, chunks.len());
        assert!(chunks.iter().all(|&len| len <= 7));
        assert_eq!(62, chunks.iter().sum::<usize>());
    }

    #[tokio::test]
    async fn test_ranged_stream_empty() {
        let body = KnownSize::sized(Cursor::new(&b""[..]), 0);
        assert!(collect_stream(RangedStream::new(body, 0, 0, 64)).await.is_empty());
    }

    #[tokio::test]
    async fn test_ranged_stream_truncated_source() {
        // declares more bytes than the source holds
        let body = KnownSize::sized(Cursor::new(&b"short"[..]), 100);
        let results: Vec<_> = RangedStream::new(body, 0, 100, 64).collect().await;
        assert_eq!(2, results.len());
        assert_eq!(b"short", &results[0].as_ref().unwrap()[..]);
        assert_eq!(io::ErrorKind::UnexpectedEof, results[1].as_ref().unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_multipart_stream() {
        let ranges = vec![ByteRange::new(0, 0), ByteRange::new(2, 4), ByteRange::new(59, 61)];
        let stream = MultipartStream::new(
            source(),
            ranges,
            "XYZZY".to_string(),
            "text/plain".to_string(),
            64,
        );

        let expected = "--XYZZY\r\n\
                        Content-Type: text/plain\r\n\
                        Content-Range: bytes 0-0/62\r\n\
                        \r\n\
                        0\r\n\
                        --XYZZY\r\n\
                        Content-Type: text/plain\r\n\
                        Content-Range: bytes 2-4/62\r\n\
                        \r\n\
                        234\r\n\
                        --XYZZY\r\n\
                        Content-Type: text/plain\r\n\
                        Content-Range: bytes 59-61/62\r\n\
                        \r\n\
                        XYZ\r\n\
                        --XYZZY--";

        assert_eq!(Some(expected.len() as u64), Body::size_hint(&stream).exact());
        assert_eq!(expected.as_bytes(), &collect_stream(stream).await[..]);
    }

    #[tokio::test]
    async fn test_multipart_len_matches_written_bytes() {
        let cases = [
            vec![ByteRange::new(0, 0), ByteRange::new(61, 61)],
            vec![ByteRange::new(0, 9), ByteRange::new(20, 29), ByteRange::new(40, 61)],
            vec![
                ByteRange::new(1, 1),
                ByteRange::new(3, 3),
                ByteRange::new(5, 5),
                ByteRange::new(7, 60),
            ],
        ];

        for (i, ranges) in cases.into_iter().enumerate() {
            for buffer_size in [1, 3, 64] {
                let boundary = format!("NextPart_{i}");
                let content_type = "application/vnd.example+json; charset=utf-8";
                let declared = multipart_len(&ranges, &boundary, content_type, 62);

                let stream = MultipartStream::new(
                    source(),
                    ranges.clone(),
                    boundary,
                    content_type.to_string(),
                    buffer_size,
                );
                assert_eq!(declared, collect_stream(stream).await.len() as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_multipart_parsed_by_multer() {
        let ranges = vec![ByteRange::new(0, 4), ByteRange::new(59, 61)];
        let boundary = "NextPart_abc".to_string();
        let stream = MultipartStream::new(source(), ranges, boundary, "text/plain".to_string(), 4);

        let mut multipart = multer::Multipart::new(stream, "NextPart_abc");
        let mut parts = Vec::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let content_range = field.headers()["content-range"].to_str().unwrap().to_string();
            let content_type = field.content_type().map(|mime| mime.to_string());
            let bytes = field.bytes().await.unwrap();
            parts.push((content_range, content_type, bytes));
        }

        assert_eq!(2, parts.len());
        assert_eq!("bytes 0-4/62", parts[0].0);
        assert_eq!(Some("text/plain".to_string()), parts[0].1);
        assert_eq!(&b"01234"[..], &parts[0].2[..]);
        assert_eq!("bytes 59-61/62", parts[1].0);
        assert_eq!(&b"XYZ"[..], &parts[1].2[..]);
    }

    #[tokio::test]
    async fn test_write_to() {
        let body = ResumingBody::Ranged(RangedStream::new(source(), 59, 3, 64));
        assert_eq!(3, body.content_length());

        let mut sink = Vec::new();
        body.write_to(&mut sink, future::pending()).await.unwrap();
        assert_eq!(b"XYZ".to_vec(), sink);
    }

    #[tokio::test]
    async fn test_write_to_empty() {
        let body: ResumingBody<KnownSize<Cursor<&'static [u8]>>> = ResumingBody::Empty;
        let mut sink = Vec::new();
        body.write_to(&mut sink, future::pending()).await.unwrap();
        assert!(sink.is_empty());
    }

    /// Records when it is dropped.
    struct DropFlag<B> {
        inner: B,
        dropped: Arc<AtomicBool>,
    }

    impl<B> Drop for DropFlag<B> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl<B: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for DropFlag<B> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<B: tokio::io::AsyncSeek + Unpin> tokio::io::AsyncSeek for DropFlag<B> {
        fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    fn flagged(declared: u64) -> (KnownSize<DropFlag<Cursor<&'static [u8]>>>, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = DropFlag { inner: Cursor::new(CONTENT), dropped: dropped.clone() };
        (KnownSize::sized(body, declared), dropped)
    }

    #[tokio::test]
    async fn test_write_to_releases_source() {
        let (source, dropped) = flagged(62);
        let body = ResumingBody::Ranged(RangedStream::new(source, 0, 62, 8));

        let mut sink = Vec::new();
        body.write_to(&mut sink, future::pending()).await.unwrap();
        assert_eq!(CONTENT, &sink[..]);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_to_releases_source_on_error() {
        let (source, dropped) = flagged(100);
        let body = ResumingBody::Ranged(RangedStream::new(source, 0, 100, 8));

        let mut sink = Vec::new();
        let err = body.write_to(&mut sink, future::pending()).await.unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        assert_eq!(CONTENT, &sink[..]);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_to_releases_source_on_sink_error() {
        struct FailingSink;

        impl AsyncWrite for FailingSink {
            fn poll_write(
                self: Pin<&mut Self>,
                _: &mut Context<'_>,
                _: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")))
            }

            fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let (source, dropped) = flagged(62);
        let body = ResumingBody::Ranged(RangedStream::new(source, 0, 62, 8));

        let err = body.write_to(&mut FailingSink, future::pending()).await.unwrap_err();
        assert_eq!(io::ErrorKind::BrokenPipe, err.kind());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_to_cancelled() {
        let (source, dropped) = flagged(62);
        let body = ResumingBody::Ranged(RangedStream::new(source, 0, 62, 8));

        let mut sink = Vec::new();
        body.write_to(&mut sink, future::ready(())).await.unwrap();
        assert!(sink.is_empty());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_seek_start_is_used() {
        fn assert_seek_start<T: AsyncSeekStart>() {}
        assert_seek_start::<DropFlag<Cursor<&'static [u8]>>>();
    }
}
