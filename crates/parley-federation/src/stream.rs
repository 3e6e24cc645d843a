//! XML stream connection over a plain or TLS-upgraded byte transport.
//!
//! An [`XmlStream`] is owned by exactly one session (or by the short-lived
//! verification exchange that opened it). Reads and writes are independently
//! locked: a session's read loop may be parked on the next element while
//! another task writes an outbound stanza.
//!
//! Read timeouts are final. A timed-out read may leave the tokenizer in the
//! middle of an element, so callers close the stream rather than retry.

use std::time::Duration;

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{watch, Mutex},
};
use tracing::debug;

use crate::{
    error::{FederationError, StreamErrorCondition},
    stanza::{parse_stream_error, stream_error_xml, Element, StreamHeader, STREAM_CLOSE},
};

/// Any bidirectional byte stream a federation connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

type XmlReader = Reader<BufReader<ReadHalf<BoxedTransport>>>;

// ─── Stream ──────────────────────────────────────────────────────────────────

pub struct XmlStream {
    reader: Mutex<XmlReader>,
    writer: Mutex<WriteHalf<BoxedTransport>>,
    secure: bool,
    closed: watch::Sender<bool>,
    peer: String,
}

impl XmlStream {
    /// Wrap `transport`. `secure` records whether TLS is already in place;
    /// `peer` is only used in logs.
    pub fn new(transport: BoxedTransport, secure: bool, peer: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = Reader::from_reader(BufReader::new(read_half));
        reader.config_mut().trim_text(true);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(write_half),
            secure,
            closed,
            peer: peer.into(),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Resolves once [`close`](Self::close) (or a variant) has run.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Emit raw protocol text.
    pub async fn send_raw(&self, xml: &str) -> Result<(), FederationError> {
        if self.is_closed() {
            return Err(FederationError::StreamClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(xml.as_bytes()).await?;
        writer.flush().await?;
        debug!(peer = %self.peer, "SENT {}", xml);
        Ok(())
    }

    pub async fn send(&self, el: &Element) -> Result<(), FederationError> {
        self.send_raw(&el.to_xml()).await
    }

    pub async fn send_header(&self, header: &StreamHeader) -> Result<(), FederationError> {
        self.send_raw(&header.to_xml()).await
    }

    /// Close the stream gracefully (`</stream:stream>`) and shut the transport.
    pub async fn close(&self) {
        self.shutdown_with(STREAM_CLOSE).await;
    }

    /// Send a stream error, then close.
    pub async fn close_with_error(&self, condition: StreamErrorCondition) {
        debug!(peer = %self.peer, %condition, "closing stream with error");
        self.shutdown_with(&stream_error_xml(condition)).await;
    }

    async fn shutdown_with(&self, trailer: &str) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.write_all(trailer.as_bytes()).await;
        let _ = writer.shutdown().await;
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Read the peer's `<stream:stream>` opening tag.
    pub async fn read_header(&self) -> Result<StreamHeader, FederationError> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into_async(&mut buf).await? {
                Event::Start(start) => {
                    let el = element_from_start(&start)?;
                    if el.name != "stream:stream" {
                        return Err(FederationError::protocol(
                            StreamErrorCondition::InvalidNamespace,
                            format!("expected stream header, got <{}>", el.name),
                        ));
                    }
                    let header = StreamHeader::from_attrs(&el.attrs);
                    debug!(peer = %self.peer, ?header, "RECV stream header");
                    return Ok(header);
                }
                Event::Eof => return Err(FederationError::StreamClosed),
                Event::Empty(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    return Err(FederationError::protocol(
                        StreamErrorCondition::InvalidXml,
                        format!("unexpected <{name}/> before stream header"),
                    ));
                }
                // XML declaration, comments, processing instructions.
                _ => {}
            }
        }
    }

    /// Read one complete stream-level element. `Ok(None)` means the peer
    /// closed the stream.
    pub async fn read_element(&self) -> Result<Option<Element>, FederationError> {
        let mut reader = self.reader.lock().await;
        let el = next_element(&mut reader).await?;
        if let Some(el) = &el {
            debug!(peer = %self.peer, "RECV {}", el.to_xml());
        }
        Ok(el)
    }

    /// [`read_element`](Self::read_element) bounded by `limit`.
    pub async fn read_element_timeout(
        &self,
        limit: Duration,
    ) -> Result<Option<Element>, FederationError> {
        tokio::time::timeout(limit, self.read_element())
            .await
            .map_err(|_| FederationError::Timeout("stream element"))?
    }

    /// [`read_header`](Self::read_header) bounded by `limit`.
    pub async fn read_header_timeout(&self, limit: Duration) -> Result<StreamHeader, FederationError> {
        tokio::time::timeout(limit, self.read_header())
            .await
            .map_err(|_| FederationError::Timeout("stream header"))?
    }

    /// Read the next element, turning a closed stream or a peer stream error
    /// into an `Err`.
    pub async fn expect_element(&self, limit: Duration) -> Result<Element, FederationError> {
        match self.read_element_timeout(limit).await? {
            None => Err(FederationError::StreamClosed),
            Some(el) if el.name == "stream:error" => {
                Err(FederationError::PeerStreamError(parse_stream_error(&el)))
            }
            Some(el) => Ok(el),
        }
    }

    /// Take the transport back, e.g. to wrap it in TLS after `<proceed/>`.
    ///
    /// Fails if the peer already sent bytes past the last parsed element;
    /// those would belong to the TLS handshake.
    pub fn into_transport(self) -> Result<BoxedTransport, FederationError> {
        let buffered = self.reader.into_inner().into_inner();
        if !buffered.buffer().is_empty() {
            return Err(FederationError::protocol(
                StreamErrorCondition::InvalidXml,
                "data received after <proceed/> before TLS handshake",
            ));
        }
        let read_half = buffered.into_inner();
        Ok(read_half.unsplit(self.writer.into_inner()))
    }
}

// ─── Tokenizer glue ──────────────────────────────────────────────────────────

async fn next_element(reader: &mut XmlReader) -> Result<Option<Element>, FederationError> {
    let mut stack: Vec<Element> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into_async(&mut buf).await? {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let el = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => return Ok(Some(el)),
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => match stack.pop() {
                Some(el) => match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => return Ok(Some(el)),
                },
                // `</stream:stream>`
                None => return Ok(None),
            },
            Event::Eof if stack.is_empty() => return Ok(None),
            Event::Eof => {
                return Err(FederationError::protocol(
                    StreamErrorCondition::InvalidXml,
                    "stream ended inside an element",
                ));
            }
            _ => {}
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, FederationError> {
    let mut el = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        el.attrs.push((key, value));
    }
    Ok(el)
}
