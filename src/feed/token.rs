// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pull-based document tokens and the quick-xml backed source producing them.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

use crate::http::ByteStream;
use crate::transport::{RawOutcome, TransportError, classify, fault_from_io_kind};

/// A low-level document token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// The document begins (XML declaration, or implied by the first element)
    StartDocument,
    Open {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Close {
        name: String,
    },
    Text(String),
    Comment,
    EndOfInput,
}

impl Token {
    /// Comments and whitespace-only text may appear anywhere
    pub fn is_ignorable(&self) -> bool {
        match self {
            Token::Comment => true,
            Token::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Short human-readable rendering for error details
    pub fn describe(&self) -> String {
        match self {
            Token::StartDocument => "document start".to_string(),
            Token::Open { name, .. } => format!("<{name}>"),
            Token::Close { name } => format!("</{name}>"),
            Token::Text(text) => {
                let shown: String = text.trim().chars().take(32).collect();
                format!("text '{shown}'")
            }
            Token::Comment => "comment".to_string(),
            Token::EndOfInput => "end of input".to_string(),
        }
    }

    /// Value of the named attribute on an opening tag
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            Token::Open { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Why the next token could not be produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    /// The bytes received so far are not well-formed
    Malformed(String),
    /// Pulling more bytes failed
    Transport(TransportError),
}

/// A lazy source of document tokens. Pulling is the only suspension point.
#[async_trait]
pub trait TokenSource: Send {
    async fn next_token(&mut self) -> Result<Token, LexError>;
}

type IoByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Buffered reader over a network body
pub type BodyReader = StreamReader<IoByteStream, Bytes>;

/// Token source reading XML incrementally from an async buffered reader
pub struct XmlTokenSource<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    pending: VecDeque<Token>,
    started: bool,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin + Send> XmlTokenSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: Reader::from_reader(inner),
            buf: Vec::new(),
            pending: VecDeque::new(),
            started: false,
            finished: false,
        }
    }
}

impl XmlTokenSource<BodyReader> {
    /// Tokenize a transport body, carrying transport failures through as [`LexError::Transport`]
    pub fn from_stream(body: ByteStream) -> Self {
        let body: IoByteStream = Box::pin(body.map(|chunk| chunk.map_err(io::Error::other)));
        Self::new(StreamReader::new(body))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TokenSource for XmlTokenSource<R> {
    async fn next_token(&mut self) -> Result<Token, LexError> {
        if let Some(token) = self.pending.pop_front() {
            return Ok(token);
        }
        if self.finished {
            return Ok(Token::EndOfInput);
        }

        loop {
            self.buf.clear();
            let decoder = self.reader.decoder();
            let token = match self.reader.read_event_into_async(&mut self.buf).await {
                Ok(Event::Decl(_)) => {
                    if self.started {
                        return Err(LexError::Malformed(
                            "XML declaration after document start".to_string(),
                        ));
                    }
                    self.started = true;
                    return Ok(Token::StartDocument);
                }
                Ok(Event::Start(e)) => open_token(&e, decoder)?,
                Ok(Event::Empty(e)) => {
                    let open = open_token(&e, decoder)?;
                    self.pending.push_back(Token::Close {
                        name: decode_name(e.name().as_ref()),
                    });
                    open
                }
                Ok(Event::End(e)) => Token::Close {
                    name: decode_name(e.name().as_ref()),
                },
                Ok(Event::Text(e)) => Token::Text(
                    e.unescape()
                        .map_err(|err| LexError::Malformed(err.to_string()))?
                        .into_owned(),
                ),
                Ok(Event::CData(e)) => {
                    Token::Text(String::from_utf8_lossy(&e.into_inner()).into_owned())
                }
                Ok(Event::Comment(_)) => Token::Comment,
                Ok(Event::PI(_)) | Ok(Event::DocType(_)) => continue,
                Ok(Event::Eof) => {
                    self.finished = true;
                    Token::EndOfInput
                }
                Err(err) => return Err(lex_error(err)),
            };

            if !self.started && matches!(token, Token::Open { .. }) {
                // A document without declaration starts with its root element
                self.started = true;
                self.pending.push_front(token);
                return Ok(Token::StartDocument);
            }

            return Ok(token);
        }
    }
}

fn decode_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn open_token(e: &BytesStart<'_>, decoder: quick_xml::encoding::Decoder) -> Result<Token, LexError> {
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| LexError::Malformed(err.to_string()))?;
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|err| LexError::Malformed(err.to_string()))?;
        attributes.push((decode_name(attr.key.as_ref()), value.into_owned()));
    }

    Ok(Token::Open {
        name: decode_name(e.name().as_ref()),
        attributes,
    })
}

fn lex_error(err: quick_xml::Error) -> LexError {
    match &err {
        quick_xml::Error::Io(io_err) => {
            if let Some(transport) = io_err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<TransportError>())
            {
                return LexError::Transport(*transport);
            }
            let fault = fault_from_io_kind(io_err.kind());
            LexError::Transport(classify(&RawOutcome::Connection(fault)))
        }
        _ => LexError::Malformed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(xml: &str) -> Vec<Result<Token, LexError>> {
        let mut source = XmlTokenSource::new(xml.as_bytes());
        let mut tokens = Vec::new();
        loop {
            let token = source.next_token().await;
            let done = matches!(token, Ok(Token::EndOfInput) | Err(_));
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn open(name: &str) -> Token {
        Token::Open {
            name: name.to_string(),
            attributes: vec![],
        }
    }

    fn close(name: &str) -> Token {
        Token::Close {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn declaration_becomes_start_document() {
        let tokens = collect(r#"<?xml version="1.0"?><rss></rss>"#).await;
        assert_eq!(
            tokens,
            vec![
                Ok(Token::StartDocument),
                Ok(open("rss")),
                Ok(close("rss")),
                Ok(Token::EndOfInput),
            ]
        );
    }

    #[tokio::test]
    async fn missing_declaration_implies_start_document() {
        let tokens = collect("<rss><channel/></rss>").await;
        assert_eq!(
            tokens,
            vec![
                Ok(Token::StartDocument),
                Ok(open("rss")),
                Ok(open("channel")),
                Ok(close("channel")),
                Ok(close("rss")),
                Ok(Token::EndOfInput),
            ]
        );
    }

    #[tokio::test]
    async fn attributes_and_entities_are_decoded() {
        let tokens =
            collect(r#"<e url="http://x/a?b=1&amp;c=2" type="audio/mpeg">A &amp; B</e>"#).await;

        let Ok(first_open) = &tokens[1] else {
            panic!("expected open tag, got {:?}", tokens[1]);
        };
        assert_eq!(first_open.attribute("url"), Some("http://x/a?b=1&c=2"));
        assert_eq!(first_open.attribute("type"), Some("audio/mpeg"));
        assert_eq!(tokens[2], Ok(Token::Text("A & B".to_string())));
    }

    #[tokio::test]
    async fn cdata_is_text() {
        let tokens = collect("<d><![CDATA[<b>bold</b>]]></d>").await;
        assert_eq!(tokens[2], Ok(Token::Text("<b>bold</b>".to_string())));
    }

    #[tokio::test]
    async fn comments_are_reported() {
        let tokens = collect("<!-- hi --><rss/>").await;
        assert_eq!(tokens[0], Ok(Token::Comment));
        assert_eq!(tokens[1], Ok(Token::StartDocument));
    }

    #[tokio::test]
    async fn end_of_input_repeats() {
        let mut source = XmlTokenSource::new("".as_bytes());
        assert_eq!(source.next_token().await, Ok(Token::EndOfInput));
        assert_eq!(source.next_token().await, Ok(Token::EndOfInput));
    }

    #[tokio::test]
    async fn transport_errors_surface_with_category() {
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"<rss><chan")),
            Err(TransportError::Disconnected { retryable: true }),
        ]));
        let mut source = XmlTokenSource::from_stream(body);

        assert_eq!(source.next_token().await, Ok(Token::StartDocument));
        assert_eq!(source.next_token().await, Ok(open("rss")));
        assert_eq!(
            source.next_token().await,
            Err(LexError::Transport(TransportError::Disconnected {
                retryable: true
            }))
        );
    }

    #[test]
    fn ignorable_tokens() {
        assert!(Token::Comment.is_ignorable());
        assert!(Token::Text("  \n".to_string()).is_ignorable());
        assert!(!Token::Text("x".to_string()).is_ignorable());
        assert!(!open("item").is_ignorable());
    }
}
