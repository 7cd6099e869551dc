//! Incremental dump decoder.
//!
//! [`open_dump`] reads the `<siteinfo>` header on the calling thread, then hands
//! the reader to a decoder thread that emits one [`Article`] per `<page>` into
//! a small bounded channel. The document is never held in memory as a whole;
//! when the channel is full the decoder blocks until the consumer catches up.

use crate::config::STREAM_QUEUE_CAPACITY;
use crate::models::{Article, DumpInfo};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use std::io::BufRead;
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The leading `<siteinfo>` element could not be decoded.
    #[error("cannot decode dump header: {0}")]
    OpenFailure(String),
    #[error("cannot start decoder thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How the article sequence of a dump terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamEnd {
    Complete { articles: u64 },
    /// Decoding failed mid-stream; everything before the failure was delivered.
    EndedEarly { articles: u64, reason: String },
    /// The consumer dropped the stream before the end of the dump.
    Abandoned { articles: u64 },
}

impl StreamEnd {
    pub fn articles(&self) -> u64 {
        match self {
            StreamEnd::Complete { articles }
            | StreamEnd::EndedEarly { articles, .. }
            | StreamEnd::Abandoned { articles } => *articles,
        }
    }
}

/// Lazy, finite, single-pass sequence of the articles of one dump.
pub struct ArticleStream {
    rx: mpsc::Receiver<Article>,
    end: oneshot::Receiver<StreamEnd>,
}

impl ArticleStream {
    /// Next article, or `None` once the dump is exhausted or decoding failed.
    pub async fn next(&mut self) -> Option<Article> {
        self.rx.recv().await
    }

    /// Blocking variant of [`ArticleStream::next`] for use outside a runtime.
    pub fn blocking_next(&mut self) -> Option<Article> {
        self.rx.blocking_recv()
    }

    /// Stops the decoder (if still running) and reports how the sequence ended.
    pub async fn finish(self) -> StreamEnd {
        let ArticleStream { rx, end } = self;
        drop(rx);
        end.await.unwrap_or_else(|_| StreamEnd::EndedEarly {
            articles: 0,
            reason: "decoder thread exited without reporting".to_string(),
        })
    }
}

/// Decodes the dump header and starts streaming its pages.
pub fn open_dump<R>(reader: R) -> Result<(DumpInfo, ArticleStream), StreamError>
where
    R: BufRead + Send + 'static,
{
    let mut decoder = DumpDecoder::new(reader);
    let info = decoder.read_site_info().map_err(StreamError::OpenFailure)?;
    debug!(site = %info.site_name, db = %info.db_name, "Decoded dump header");

    let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (end_tx, end_rx) = oneshot::channel();

    thread::Builder::new()
        .name("wikiref-decoder".to_string())
        .spawn(move || {
            let end = decoder.pump(&tx);
            let _ = end_tx.send(end);
        })?;

    Ok((info, ArticleStream { rx, end: end_rx }))
}

/// Text-bearing elements we collect.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    SiteName,
    DbName,
    Title,
    Id,
    Text,
}

#[derive(Default)]
struct PartialPage {
    title: Option<String>,
    id: Option<String>,
    text: Option<String>,
}

impl PartialPage {
    fn into_article(self) -> Result<Article, String> {
        let title = self.title.ok_or("page without <title>")?;
        let raw_id = self
            .id
            .ok_or_else(|| format!("page {title:?} without <id>"))?;
        let id = raw_id
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("page {title:?} has invalid id {raw_id:?}: {e}"))?;
        Ok(Article {
            id,
            title,
            text: self.text.unwrap_or_default(),
        })
    }
}

struct DumpDecoder<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> DumpDecoder<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: Reader::from_reader(reader),
            buf: Vec::with_capacity(8192),
        }
    }

    fn read_site_info(&mut self) -> Result<DumpInfo, String> {
        let mut info = DumpInfo::default();
        let mut in_site_info = false;
        let mut field: Option<Field> = None;
        let mut text = String::new();

        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|e| format!("at byte {}: {e}", self.reader.buffer_position()))?;

            match event {
                Event::Start(e) => match e.name().as_ref() {
                    b"siteinfo" => in_site_info = true,
                    b"sitename" if in_site_info => {
                        field = Some(Field::SiteName);
                        text.clear();
                    }
                    b"dbname" if in_site_info => {
                        field = Some(Field::DbName);
                        text.clear();
                    }
                    b"page" => return Err("<page> before <siteinfo>".to_string()),
                    _ => {}
                },
                Event::Text(e) if field.is_some() => {
                    let value = e.unescape().map_err(|e| e.to_string())?;
                    text.push_str(&value);
                }
                Event::End(e) => match e.name().as_ref() {
                    b"sitename" if field == Some(Field::SiteName) => {
                        info.site_name = text.trim().to_string();
                        field = None;
                    }
                    b"dbname" if field == Some(Field::DbName) => {
                        info.db_name = text.trim().to_string();
                        field = None;
                    }
                    b"siteinfo" => return Ok(info),
                    _ => {}
                },
                Event::Eof => return Err("end of stream before </siteinfo>".to_string()),
                _ => {}
            }
        }
    }

    /// Next complete page. `Ok(None)` at a clean end of document.
    fn next_article(&mut self) -> Result<Option<Article>, String> {
        let mut page: Option<PartialPage> = None;
        let mut field: Option<Field> = None;
        let mut depth_in_page = 0usize;
        let mut text = String::new();

        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|e| format!("at byte {}: {e}", self.reader.buffer_position()))?;

            match event {
                Event::Start(e) => {
                    let name = e.name();
                    if name.as_ref() == b"page" {
                        page = Some(PartialPage::default());
                        depth_in_page = 0;
                        continue;
                    }
                    let Some(current) = page.as_ref() else {
                        continue;
                    };
                    depth_in_page += 1;
                    field = match name.as_ref() {
                        b"title" if depth_in_page == 1 => Some(Field::Title),
                        // The page id sits directly under <page>; revision and
                        // contributor ids are nested deeper.
                        b"id" if depth_in_page == 1 && current.id.is_none() => Some(Field::Id),
                        b"text" if depth_in_page == 2 => Some(Field::Text),
                        _ => None,
                    };
                    text.clear();
                }
                Event::Text(e) if field.is_some() => {
                    let value = e.unescape().map_err(|e| e.to_string())?;
                    text.push_str(&value);
                }
                Event::CData(e) if field.is_some() => {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"page" {
                        if let Some(done) = page.take() {
                            return done.into_article().map(Some);
                        }
                        continue;
                    }
                    let Some(current) = page.as_mut() else {
                        continue;
                    };
                    match field.take() {
                        Some(Field::Title) => current.title = Some(std::mem::take(&mut text)),
                        Some(Field::Id) => current.id = Some(std::mem::take(&mut text)),
                        Some(Field::Text) => current.text = Some(std::mem::take(&mut text)),
                        _ => {}
                    }
                    depth_in_page = depth_in_page.saturating_sub(1);
                }
                Event::Eof => {
                    return match page {
                        Some(_) => Err("end of stream inside <page>".to_string()),
                        None => Ok(None),
                    };
                }
                _ => {}
            }
        }
    }

    /// Decodes pages into `tx` until the document ends, decoding fails or the
    /// receiver goes away.
    fn pump(&mut self, tx: &mpsc::Sender<Article>) -> StreamEnd {
        let mut articles = 0u64;
        loop {
            match self.next_article() {
                Ok(Some(article)) => {
                    if tx.blocking_send(article).is_err() {
                        return StreamEnd::Abandoned { articles };
                    }
                    articles += 1;
                }
                Ok(None) => return StreamEnd::Complete { articles },
                Err(reason) => return StreamEnd::EndedEarly { articles, reason },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.10/">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <dbname>enwiki</dbname>
    <base>https://en.wikipedia.org/wiki/Main_Page</base>
    <namespaces><namespace key="14">Category</namespace></namespaces>
  </siteinfo>
"#;

    fn page(id: i64, title: &str, text: &str) -> String {
        format!(
            "  <page>\n    <title>{title}</title>\n    <ns>0</ns>\n    <id>{id}</id>\n    <revision>\n      <id>{}</id>\n      <contributor><username>Bot</username><id>77</id></contributor>\n      <text xml:space=\"preserve\">{text}</text>\n    </revision>\n  </page>\n",
            id * 100
        )
    }

    fn open(xml: String) -> Result<(DumpInfo, ArticleStream), StreamError> {
        open_dump(Cursor::new(xml.into_bytes()))
    }

    fn drain(mut stream: ArticleStream) -> (Vec<Article>, StreamEnd) {
        let mut articles = Vec::new();
        while let Some(article) = stream.blocking_next() {
            articles.push(article);
        }
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let end = rt.block_on(stream.finish());
        (articles, end)
    }

    #[test]
    fn reads_header_and_pages() {
        let xml = format!(
            "{HEADER}{}{}</mediawiki>\n",
            page(1, "Rust", "[[Python]] is &lt;b&gt;related&lt;/b&gt;"),
            page(2, "Python", "")
        );
        let (info, stream) = open(xml).unwrap();
        assert_eq!(
            info,
            DumpInfo {
                site_name: "Wikipedia".into(),
                db_name: "enwiki".into()
            }
        );

        let (articles, end) = drain(stream);
        assert_eq!(end, StreamEnd::Complete { articles: 2 });
        assert_eq!(articles[0], Article::new(1, "Rust", "[[Python]] is <b>related</b>"));
        assert_eq!(articles[1].id, 2);
        assert_eq!(articles[1].text, "");
    }

    #[test]
    fn page_id_is_not_revision_or_contributor_id() {
        let xml = format!("{HEADER}{}</mediawiki>", page(42, "Answer", "text"));
        let (_, stream) = open(xml).unwrap();
        let (articles, _) = drain(stream);
        assert_eq!(articles[0].id, 42);
    }

    #[test]
    fn text_keeps_newlines() {
        let xml = format!(
            "{HEADER}{}</mediawiki>",
            page(1, "Rust", "Line one\n== History ==\nLine two")
        );
        let (_, stream) = open(xml).unwrap();
        let (articles, _) = drain(stream);
        assert_eq!(articles[0].text, "Line one\n== History ==\nLine two");
    }

    #[test]
    fn missing_site_info_is_open_failure() {
        let xml = format!("<mediawiki>{}</mediawiki>", page(1, "Rust", ""));
        let err = open(xml).err().unwrap();
        assert!(matches!(err, StreamError::OpenFailure(_)));
    }

    #[test]
    fn empty_input_is_open_failure() {
        let err = open(String::new()).err().unwrap();
        assert!(matches!(err, StreamError::OpenFailure(_)));
    }

    #[test]
    fn truncated_stream_ends_early() {
        let mut xml = format!("{HEADER}{}", page(1, "Rust", "ok"));
        xml.push_str("  <page>\n    <title>Cut</title>\n    <id>2</id>\n    <revision><text>half");
        let (_, stream) = open(xml).unwrap();
        let (articles, end) = drain(stream);
        assert_eq!(articles.len(), 1);
        assert!(matches!(end, StreamEnd::EndedEarly { articles: 1, .. }));
    }

    #[test]
    fn malformed_token_ends_early() {
        let xml = format!(
            "{HEADER}{}<page><title>Bad</title></wrong></page>{}",
            page(1, "Rust", "ok"),
            page(3, "Never", "")
        );
        let (_, stream) = open(xml).unwrap();
        let (articles, end) = drain(stream);
        assert_eq!(articles.len(), 1);
        assert!(matches!(end, StreamEnd::EndedEarly { .. }));
    }

    #[test]
    fn invalid_page_id_ends_early() {
        let xml = format!(
            "{HEADER}{}{}</mediawiki>",
            page(1, "Rust", ""),
            "<page><title>Odd</title><id>abc</id></page>"
        );
        let (_, stream) = open(xml).unwrap();
        let (articles, end) = drain(stream);
        assert_eq!(articles.len(), 1);
        match end {
            StreamEnd::EndedEarly { reason, .. } => assert!(reason.contains("invalid id")),
            other => panic!("unexpected end: {other:?}"),
        }
    }

    #[test]
    fn missing_closing_root_keeps_pages() {
        let xml = format!("{HEADER}{}", page(1, "Rust", ""));
        let (_, stream) = open(xml).unwrap();
        let (articles, end) = drain(stream);
        assert_eq!(articles.len(), 1);
        assert_eq!(end.articles(), 1);
    }

    #[tokio::test]
    async fn dropping_consumer_stops_decoder() {
        let mut xml = HEADER.to_string();
        for id in 1..=100 {
            xml.push_str(&page(id, &format!("Page {id}"), "body"));
        }
        xml.push_str("</mediawiki>");

        let (_, mut stream) = open(xml).unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.id, 1);

        let end = stream.finish().await;
        assert!(matches!(end, StreamEnd::Abandoned { .. }));
        assert!(end.articles() < 100);
    }
}
