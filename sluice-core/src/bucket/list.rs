//! Bucket listing
//!
//! ListObjectsV2 with continuation-token paging, parsed with a
//! quick-xml event loop.

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;

use super::{service_error, Bucket};
use crate::error::{Result, SluiceError};

/// Hard cap on result pages fetched for a single listing call
const MAX_LIST_PAGES: usize = 100;

/// One key record from a bucket listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyContent {
    pub key: String,
    pub size: u64,
    pub last_modified: String,
    pub storage_class: String,
}

/// Aggregated listing across all fetched pages
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub keys: Vec<KeyContent>,
    pub common_prefixes: Vec<String>,
}

impl Listing {
    /// Just the key names
    pub fn key_names(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.key.as_str()).collect()
    }
}

#[derive(Default)]
struct ListPage {
    keys: Vec<KeyContent>,
    common_prefixes: Vec<String>,
    next_token: Option<String>,
}

impl Bucket {
    /// List every key under `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Listing> {
        self.list_with_delimiter(prefix, None).await
    }

    /// List keys and common prefixes under `prefix`, one hierarchy level deep
    pub async fn list_dir(&self, prefix: &str) -> Result<Listing> {
        self.list_with_delimiter(prefix, Some("/")).await
    }

    async fn list_with_delimiter(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let mut out = Listing::default();
        let mut token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut url = self.object_url("")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("list-type", "2");
                query.append_pair("prefix", prefix);
                if let Some(d) = delimiter {
                    query.append_pair("delimiter", d);
                }
                if let Some(t) = &token {
                    query.append_pair("continuation-token", t);
                }
            }
            let resp = self.retry_request(Method::GET, url, None, None).await?;
            if resp.status().as_u16() != 200 {
                return Err(service_error(resp).await);
            }
            let body = resp.bytes().await.map_err(SluiceError::from)?;
            let page = parse_list_page(&body)?;
            out.keys.extend(page.keys);
            out.common_prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(t) => token = Some(t),
                None => return Ok(out),
            }
        }
        Err(SluiceError::Internal {
            message: format!("list results exceeded maximum number of pages: {MAX_LIST_PAGES}"),
        })
    }
}

fn parse_list_page(body: &[u8]) -> Result<ListPage> {
    let text = std::str::from_utf8(body).map_err(|e| SluiceError::Internal {
        message: format!("non-utf8 list response: {e}"),
    })?;
    let mut reader = Reader::from_str(text);
    let mut page = ListPage::default();
    let mut in_contents = false;
    let mut in_common_prefixes = false;
    let mut current: Option<KeyContent> = None;
    let mut field = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"Contents" => {
                    in_contents = true;
                    current = Some(KeyContent::default());
                }
                b"CommonPrefixes" => in_common_prefixes = true,
                name => field = String::from_utf8_lossy(name).into_owned(),
            },
            Ok(Event::End(end)) => match end.name().as_ref() {
                b"Contents" => {
                    in_contents = false;
                    if let Some(entry) = current.take() {
                        page.keys.push(entry);
                    }
                }
                b"CommonPrefixes" => in_common_prefixes = false,
                _ => field.clear(),
            },
            Ok(Event::Text(t)) => {
                let value = match t.unescape() {
                    Ok(v) => v.trim().to_string(),
                    Err(e) => {
                        return Err(SluiceError::Internal {
                            message: format!("malformed list response: {e}"),
                        })
                    }
                };
                if value.is_empty() {
                    continue;
                }
                if in_contents {
                    if let Some(entry) = current.as_mut() {
                        match field.as_str() {
                            "Key" => entry.key = value,
                            "Size" => entry.size = value.parse().unwrap_or(0),
                            "LastModified" => entry.last_modified = value,
                            "StorageClass" => entry.storage_class = value,
                            _ => {}
                        }
                    }
                } else if in_common_prefixes {
                    if field == "Prefix" {
                        page.common_prefixes.push(value);
                    }
                } else if field == "NextContinuationToken" {
                    page.next_token = Some(value);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SluiceError::Internal {
                    message: format!("malformed list response: {e}"),
                })
            }
            _ => {}
        }
    }
    Ok(page)
}
